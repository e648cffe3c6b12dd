//! Health and liquidation.
//!
//! Health is the margin by which a position's collateral, valued as if the price
//! slid through its bands and haircut by the liquidation discount, exceeds its
//! debt. It is a signed WAD ratio: negative means the position can be taken over.
//!
//! A full liquidation closes the position. The liquidator covers whatever debt the
//! borrowed asset already sitting in the bands does not, and takes the collateral.
//! A partial liquidation repays a fraction of the debt and removes a slightly
//! smaller fraction of the position from every band, which pushes health back up
//! to a target while leaving the rest of the position in place.

use alloy_primitives::U256;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::debt::{Borrowers, DebtError};
use crate::market::{MarketError, MarketState};
use crate::math::{mul_div, mul_div_down, mul_div_up, quantize, to_i128_saturating, Rounding, WAD, WAD_I128};
use crate::types::{Timestamp, UserId};

/// Overshoot on the repaid fraction so rounding cannot land health below target.
const FRACTION_MARGIN: U256 = U256::from_limbs([100_000_000_000_000, 0, 0, 0]);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LiquidationError {
    #[error("Position of {owner} is not liquidatable: health {health}")]
    NotLiquidatable { owner: UserId, health: i128 },

    #[error("Slippage exceeded: {amount} against limit {limit}")]
    SlippageExceeded { amount: U256, limit: U256 },

    #[error("Target health {0} must be positive")]
    InvalidTarget(i128),
}

impl LiquidationError {
    pub fn is_recoverable(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LiquidationOutcome {
    /// The position is gone.
    Closed,
    /// Part of the debt was repaid; the rest of the position is intact.
    Repaired,
}

/// Native units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiquidationReceipt {
    pub owner: UserId,
    pub liquidator: UserId,
    pub outcome: LiquidationOutcome,
    pub debt_repaid: U256,
    /// Collateral handed to the liquidator.
    pub collateral_out: U256,
    /// Borrowed asset the liquidator paid in.
    pub liquidator_paid: U256,
    /// Borrowed asset left over for the borrower.
    pub borrower_refund: U256,
    pub health_after: Option<i128>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiquidationCandidate {
    pub owner: UserId,
    pub health: i128,
    pub debt: U256,
    /// What a full liquidation would cost the liquidator.
    pub repayable: U256,
}

/// Collateral share removed for a repaid debt fraction `frac`:
/// `((1 + d/2) / (1 + d) * (1 - frac) + frac) * frac`.
pub fn removal_fraction(frac: U256, liquidation_discount: U256) -> Result<U256, MarketError> {
    if frac >= WAD {
        return Ok(WAD);
    }
    let c = mul_div_down(WAD + liquidation_discount / U256::from(2u64), WAD - frac, WAD + liquidation_discount)?;
    Ok(mul_div_down(c + frac, frac, WAD)?)
}

// 9.1: debt fraction that lifts health from `health` to `target`. removing
// f(frac) of the collateral and frac of the debt scales (1 + health) by
// 1 + frac * (1 - c), c = (1 + d/2) / (1 + d). None when only a full close will do.
pub fn repair_fraction(health: i128, target: i128, liquidation_discount: U256) -> Result<Option<U256>, MarketError> {
    let one_plus_h = WAD_I128.saturating_add(health);
    if one_plus_h <= 0 {
        return Ok(None);
    }
    let one_plus_h = U256::from(one_plus_h as u128);
    let one_plus_t = U256::from(WAD_I128.saturating_add(target.max(0)) as u128);
    let growth = mul_div_up(one_plus_t, WAD, one_plus_h)?;
    if growth <= WAD {
        return Ok(Some(U256::ZERO));
    }
    let c = mul_div_up(WAD + liquidation_discount / U256::from(2u64), WAD, WAD + liquidation_discount)?;
    let one_minus_c = WAD.saturating_sub(c);
    if one_minus_c.is_zero() {
        return Ok(None);
    }
    let frac = mul_div_up(growth - WAD, WAD, one_minus_c)? + FRACTION_MARGIN;
    if frac >= WAD {
        return Ok(None);
    }
    Ok(Some(frac))
}

impl MarketState {
    // 9.2: x_down * (1 - d) / debt - 1. with `full`, a position still above the
    // active band also gets credit for the gap between oracle and its top band.
    pub fn health(&self, owner: UserId, full: bool) -> Result<i128, MarketError> {
        let debt = self.ledger.debt(owner, self.rates.rate_mul)?;
        if debt.is_zero() {
            return Err(DebtError::LoanNotFound(owner).into());
        }
        let ctx = self.price_context()?;
        let amm = self.amm(ctx);
        let x_down = amm.user_x_down(owner)?;
        let value = mul_div_down(x_down, self.params.liquidation_factor(), WAD)?;
        let mut health = to_i128_saturating(mul_div_down(value, WAD, debt)?) - WAD_I128;

        if full {
            if let Some(ticks) = self.bands.user_ticks(owner) {
                let p_top = amm.p_oracle_up(ticks.n1)?;
                if ticks.n1 > self.bands.active_band() && ctx.price_oracle > p_top {
                    let (collateral, _) = amm.user_reserves(owner)?;
                    let bonus = mul_div_down(ctx.price_oracle - p_top, collateral, debt)?;
                    health = health.saturating_add(to_i128_saturating(bonus));
                }
            }
        }
        Ok(health)
    }

    fn check_liquidatable(&self, owner: UserId, liquidator: UserId) -> Result<i128, MarketError> {
        let health = self.health(owner, true)?;
        // owners may always unwind themselves
        if health >= 0 && liquidator != owner {
            return Err(LiquidationError::NotLiquidatable { owner, health }.into());
        }
        Ok(health)
    }

    // 9.3: full liquidation. fails with SlippageExceeded when the bands return less
    // borrowed asset than `min_x`.
    pub fn liquidate(
        &mut self,
        now: Timestamp,
        liquidator: UserId,
        owner: UserId,
        min_x: U256,
    ) -> Result<LiquidationReceipt, MarketError> {
        self.transact(now, "liquidate", |m| {
            m.check_liquidatable(owner, liquidator)?;
            let min_x = m.config.borrowed.to_wad(min_x)?;
            let receipt = m.close_position(owner, liquidator, min_x)?;
            info!(market = m.id.0, %owner, %liquidator, debt = %receipt.debt_repaid, "position liquidated");
            Ok(receipt)
        })
    }

    fn close_position(&mut self, owner: UserId, liquidator: UserId, min_x: U256) -> Result<LiquidationReceipt, MarketError> {
        let rate_mul = self.rates.rate_mul;
        let debt = self.ledger.debt(owner, rate_mul)?;
        let (x, y) = self.bands.withdraw_fraction(owner, WAD)?;
        if x < min_x {
            return Err(LiquidationError::SlippageExceeded { amount: x, limit: min_x }.into());
        }
        self.ledger.close(self.authority, owner, rate_mul)?;

        let liquidator_paid = self.charge_borrowed(debt.saturating_sub(x))?;
        let surplus = x.saturating_sub(debt);
        let borrower_refund = self.config.borrowed.from_wad(surplus);
        self.keep_borrowed_remainder(surplus, borrower_refund)?;
        let collateral_out = self.config.collateral.from_wad(y);
        self.keep_collateral_remainder(y, collateral_out)?;

        Ok(LiquidationReceipt {
            owner,
            liquidator,
            outcome: LiquidationOutcome::Closed,
            debt_repaid: self.config.borrowed.from_wad_up(debt),
            collateral_out,
            liquidator_paid,
            borrower_refund,
            health_after: None,
        })
    }

    // 9.4: partial liquidation toward `target_health`. falls back to a full close
    // when the fraction needed reaches the whole position. `max_debt_in` bounds
    // what the liquidator pays either way.
    pub fn liquidate_partial(
        &mut self,
        now: Timestamp,
        liquidator: UserId,
        owner: UserId,
        target_health: i128,
        max_debt_in: U256,
    ) -> Result<LiquidationReceipt, MarketError> {
        self.transact(now, "liquidate_partial", |m| {
            if target_health <= 0 {
                return Err(LiquidationError::InvalidTarget(target_health).into());
            }
            let health = m.check_liquidatable(owner, liquidator)?;
            let debt = m.ledger.debt(owner, m.rates.rate_mul)?;

            let receipt = match repair_fraction(health, target_health, m.params.liquidation_discount)? {
                // already at target, only reachable by the owner
                Some(frac) if frac.is_zero() => {
                    return Err(LiquidationError::NotLiquidatable { owner, health }.into());
                }
                Some(frac) => {
                    let exact = mul_div(debt, frac, WAD, Rounding::Up)?;
                    let repay = quantize(exact, m.ledger.quantum(), Rounding::Up)?;
                    if repay >= debt {
                        m.close_position(owner, liquidator, U256::ZERO)?
                    } else {
                        m.repair_position(owner, liquidator, repay, frac)?
                    }
                }
                None => m.close_position(owner, liquidator, U256::ZERO)?,
            };
            if receipt.liquidator_paid > max_debt_in {
                return Err(LiquidationError::SlippageExceeded {
                    amount: receipt.liquidator_paid,
                    limit: max_debt_in,
                }
                .into());
            }
            info!(
                market = m.id.0,
                %owner,
                %liquidator,
                outcome = ?receipt.outcome,
                repaid = %receipt.debt_repaid,
                "partial liquidation"
            );
            Ok(receipt)
        })
    }

    fn repair_position(
        &mut self,
        owner: UserId,
        liquidator: UserId,
        repay: U256,
        frac: U256,
    ) -> Result<LiquidationReceipt, MarketError> {
        let rate_mul = self.rates.rate_mul;
        let f_remove = removal_fraction(frac, self.params.liquidation_discount)?;
        let (x, y) = self.bands.withdraw_fraction(owner, f_remove)?;
        self.ledger.repay(self.authority, owner, repay, rate_mul)?;

        let liquidator_paid = self.charge_borrowed(repay.saturating_sub(x))?;
        let surplus = x.saturating_sub(repay);
        let borrower_refund = self.config.borrowed.from_wad(surplus);
        self.keep_borrowed_remainder(surplus, borrower_refund)?;
        let collateral_out = self.config.collateral.from_wad(y);
        self.keep_collateral_remainder(y, collateral_out)?;

        Ok(LiquidationReceipt {
            owner,
            liquidator,
            outcome: LiquidationOutcome::Repaired,
            debt_repaid: self.config.borrowed.from_wad_up(repay),
            collateral_out,
            liquidator_paid,
            borrower_refund,
            health_after: Some(self.health(owner, true)?),
        })
    }

    /// Underwater positions, evaluated one at a time as the scan advances.
    pub fn users_to_liquidate(&self) -> LiquidationScan<'_> {
        LiquidationScan {
            market: self,
            borrowers: self.ledger.borrowers(),
        }
    }
}

/// Lazy pass over all borrowers. Each call to `users_to_liquidate` starts a new one.
pub struct LiquidationScan<'a> {
    market: &'a MarketState,
    borrowers: Borrowers<'a>,
}

impl LiquidationScan<'_> {
    fn evaluate(&self, owner: UserId) -> Result<Option<LiquidationCandidate>, MarketError> {
        let health = self.market.health(owner, true)?;
        if health >= 0 {
            return Ok(None);
        }
        let debt = self.market.ledger.debt(owner, self.market.rates.rate_mul)?;
        let x = match self.market.bands.user_ticks(owner) {
            Some(_) => self.market.bands.user_amounts(owner)?.0,
            None => U256::ZERO,
        };
        let borrowed = &self.market.config.borrowed;
        Ok(Some(LiquidationCandidate {
            owner,
            health,
            debt: borrowed.from_wad_up(debt),
            repayable: borrowed.from_wad_up(debt.saturating_sub(x)),
        }))
    }
}

impl Iterator for LiquidationScan<'_> {
    type Item = Result<LiquidationCandidate, MarketError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let owner = self.borrowers.next()?;
            match self.evaluate(owner) {
                Ok(None) => continue,
                Ok(Some(candidate)) => return Some(Ok(candidate)),
                Err(e) => return Some(Err(e)),
            }
        }
    }
}
