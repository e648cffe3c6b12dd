// 13.0 loans.rs: borrower lifecycle. create -> (add/remove collateral, borrow more,
// repay)* -> close or liquidation. every call is one atomic market transition.
// positions fully on the collateral side can be moved; once any of their bands
// has converted, only repay and liquidation touch them.

use alloy_primitives::U256;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::debt::{calculate_debt_n1, check_band_count, DebtError};
use crate::market::{MarketError, MarketState};
use crate::math::{add, sub, WAD};
use crate::types::{BandIndex, Timestamp, UserId};

/// Native units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoanReceipt {
    pub owner: UserId,
    pub collateral: U256,
    pub debt: U256,
    pub n1: BandIndex,
    pub n2: BandIndex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepayReceipt {
    pub owner: UserId,
    pub repaid: U256,
    pub remaining_debt: U256,
    /// Only a full repay releases the position's reserves.
    pub collateral_returned: U256,
    pub borrowed_returned: U256,
    pub closed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CollateralChange {
    Keep,
    Add(U256),
    Remove(U256),
}

impl MarketState {
    // 13.1: cap first, then pool cash, then placement.
    pub fn create_loan(
        &mut self,
        now: Timestamp,
        owner: UserId,
        collateral: U256,
        debt: U256,
        n_bands: usize,
    ) -> Result<LoanReceipt, MarketError> {
        self.transact(now, "create_loan", |m| {
            check_band_count(n_bands)?;
            if m.ledger.has_loan(owner) {
                return Err(DebtError::LoanExists(owner).into());
            }
            let raw = m.config.collateral.to_wad(collateral)?;
            let debt_wad = m.config.borrowed.to_wad(debt)?;
            if debt_wad.is_zero() {
                return Err(DebtError::ZeroDebt.into());
            }
            let rate_mul = m.rates.rate_mul;
            m.ledger.on_debt_increased(m.authority, debt_wad, rate_mul)?;
            m.check_liquidity(debt_wad)?;

            let (n1, n2) = m.place(owner, raw, debt_wad, n_bands)?;
            m.ledger.create(m.authority, owner, debt_wad, rate_mul)?;
            debug!(market = m.id.0, %owner, n1, n2, "loan created");
            Ok(LoanReceipt {
                owner,
                collateral,
                debt,
                n1,
                n2,
            })
        })
    }

    /// Finds the start band for `debt` and deposits `raw` collateral there.
    fn place(&mut self, owner: UserId, raw: U256, debt: U256, n_bands: usize) -> Result<(BandIndex, BandIndex), MarketError> {
        let ctx = self.price_context()?;
        let n1 = {
            let amm = self.amm(ctx);
            let underlying = amm.to_underlying(raw)?;
            calculate_debt_n1(&amm, underlying, debt, n_bands, self.params.loan_discount)?
        };
        let n2 = n1 + n_bands as i64 - 1;
        self.bands.deposit_range(owner, raw, n1, n2)?;
        Ok((n1, n2))
    }

    // 13.2: partial repay moves the bands down when the position is untouched.
    // repaying exactly the debt closes it and hands back what the bands hold.
    pub fn repay(&mut self, now: Timestamp, owner: UserId, amount: U256) -> Result<RepayReceipt, MarketError> {
        self.transact(now, "repay", |m| {
            if !m.ledger.has_loan(owner) {
                return Err(DebtError::LoanNotFound(owner).into());
            }
            if amount.is_zero() {
                return Err(MarketError::ZeroAmount);
            }
            let rate_mul = m.rates.rate_mul;
            let amount_wad = m.config.borrowed.to_wad(amount)?;
            let current = m.ledger.debt(owner, rate_mul)?;
            if amount_wad > current {
                return Err(DebtError::RepayExceedsDebt {
                    amount,
                    debt: m.config.borrowed.from_wad_up(current),
                }
                .into());
            }

            if amount_wad == current {
                let (x, y) = m.bands.withdraw_fraction(owner, WAD)?;
                m.ledger.close(m.authority, owner, rate_mul)?;
                let collateral_returned = m.config.collateral.from_wad(y);
                let borrowed_returned = m.config.borrowed.from_wad(x);
                m.keep_collateral_remainder(y, collateral_returned)?;
                m.keep_borrowed_remainder(x, borrowed_returned)?;
                debug!(market = m.id.0, %owner, "loan closed");
                return Ok(RepayReceipt {
                    owner,
                    repaid: amount,
                    remaining_debt: U256::ZERO,
                    collateral_returned,
                    borrowed_returned,
                    closed: true,
                });
            }

            let remaining = m.ledger.repay(m.authority, owner, amount_wad, rate_mul)?;
            let (n1, n2, n_bands) = match m.bands.user_ticks(owner) {
                Some(t) => (t.n1, t.n2, t.n_bands()),
                None => return Err(DebtError::LoanNotFound(owner).into()),
            };
            if n1 > m.bands.active_band() {
                let (y, x) = m.bands.withdraw(owner, n1, n2)?;
                if !x.is_zero() {
                    return Err(DebtError::PositionActive(owner).into());
                }
                m.place(owner, y, remaining, n_bands)?;
            }
            Ok(RepayReceipt {
                owner,
                repaid: amount,
                remaining_debt: m.config.borrowed.from_wad_up(remaining),
                collateral_returned: U256::ZERO,
                borrowed_returned: U256::ZERO,
                closed: false,
            })
        })
    }

    pub fn add_collateral(&mut self, now: Timestamp, owner: UserId, amount: U256) -> Result<LoanReceipt, MarketError> {
        self.transact(now, "add_collateral", |m| {
            if amount.is_zero() {
                return Err(MarketError::ZeroAmount);
            }
            m.adjust(owner, CollateralChange::Add(amount), U256::ZERO)
        })
    }

    pub fn remove_collateral(&mut self, now: Timestamp, owner: UserId, amount: U256) -> Result<LoanReceipt, MarketError> {
        self.transact(now, "remove_collateral", |m| {
            if amount.is_zero() {
                return Err(MarketError::ZeroAmount);
            }
            m.adjust(owner, CollateralChange::Remove(amount), U256::ZERO)
        })
    }

    /// Draws `debt` more, optionally adding `collateral` in the same step.
    pub fn borrow_more(
        &mut self,
        now: Timestamp,
        owner: UserId,
        collateral: U256,
        debt: U256,
    ) -> Result<LoanReceipt, MarketError> {
        self.transact(now, "borrow_more", |m| {
            if debt.is_zero() {
                return Err(DebtError::ZeroDebt.into());
            }
            let change = if collateral.is_zero() {
                CollateralChange::Keep
            } else {
                CollateralChange::Add(collateral)
            };
            m.adjust(owner, change, debt)
        })
    }

    // 13.3: pull the whole position out, change it, put it back at a fresh n1.
    fn adjust(&mut self, owner: UserId, change: CollateralChange, debt_add: U256) -> Result<LoanReceipt, MarketError> {
        if !self.ledger.has_loan(owner) {
            return Err(DebtError::LoanNotFound(owner).into());
        }
        if self.bands.converting_band(owner).is_some() {
            return Err(DebtError::PositionActive(owner).into());
        }
        let (n1, n2, n_bands) = match self.bands.user_ticks(owner) {
            Some(t) => (t.n1, t.n2, t.n_bands()),
            None => return Err(DebtError::LoanNotFound(owner).into()),
        };
        let (y, x) = self.bands.withdraw(owner, n1, n2)?;
        if !x.is_zero() {
            return Err(DebtError::PositionActive(owner).into());
        }

        let precision = self.config.collateral.precision();
        let raw = match change {
            CollateralChange::Keep => y,
            CollateralChange::Add(amount) => add(y, self.config.collateral.to_wad(amount)?)?,
            CollateralChange::Remove(amount) => {
                let wad = self.config.collateral.to_wad(amount)?;
                if wad > y {
                    return Err(MarketError::InsufficientCollateral {
                        requested: amount,
                        available: y / precision,
                    });
                }
                sub(y, wad)?
            }
        };

        let rate_mul = self.rates.rate_mul;
        let debt_add_wad = self.config.borrowed.to_wad(debt_add)?;
        if !debt_add_wad.is_zero() {
            self.ledger.on_debt_increased(self.authority, debt_add_wad, rate_mul)?;
            self.check_liquidity(debt_add_wad)?;
        }
        let debt = add(self.ledger.debt(owner, rate_mul)?, debt_add_wad)?;
        let (n1, n2) = self.place(owner, raw, debt, n_bands)?;
        if !debt_add_wad.is_zero() {
            self.ledger.increase(self.authority, owner, debt_add_wad, rate_mul)?;
        }
        Ok(LoanReceipt {
            owner,
            collateral: raw / precision,
            debt: self.config.borrowed.from_wad_up(self.ledger.debt(owner, rate_mul)?),
            n1,
            n2,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MarketConfig;
    use crate::math::mul_div_down;
    use crate::oracle::ManualOracle;
    use crate::policy::ConstantRatePolicy;
    use crate::types::{Direction, MarketId};
    use std::sync::Arc;

    fn wad(x: u64) -> U256 {
        U256::from(x) * WAD
    }

    const ALICE: UserId = UserId(1);
    const BOB: UserId = UserId(2);
    const T0: Timestamp = Timestamp::ZERO;

    fn funded_market() -> MarketState {
        let oracle = Arc::new(ManualOracle::new(wad(3000)));
        let policy = Arc::new(ConstantRatePolicy::new(U256::ZERO));
        let mut m = MarketState::new(MarketId(1), MarketConfig::weth_long(), oracle, policy, T0).unwrap();
        m.supply(T0, wad(1_000_000)).unwrap();
        m
    }

    #[test]
    fn create_places_below_oracle() {
        let mut m = funded_market();
        let r = m.create_loan(T0, ALICE, wad(10), wad(10_000), 10).unwrap();
        assert!(r.n1 > m.active_band());
        assert_eq!(r.n2 - r.n1 + 1, 10);
        assert_eq!(m.debt(ALICE).unwrap(), wad(10_000));
        assert_eq!(m.total_debt().unwrap(), wad(10_000));
        assert_eq!(m.available_balance(), wad(990_000));
        assert!(matches!(
            m.create_loan(T0, ALICE, wad(10), wad(1), 10),
            Err(MarketError::Debt(DebtError::LoanExists(_)))
        ));
    }

    #[test]
    fn max_borrowable_is_exact_boundary() {
        let mut m = funded_market();
        let max = m.max_borrowable(wad(10), 10).unwrap();
        let mut over = m.clone();
        assert!(matches!(
            over.create_loan(T0, ALICE, wad(10), max + U256::from(1u64), 10),
            Err(MarketError::Debt(DebtError::DebtTooHigh { .. }))
        ));
        m.create_loan(T0, ALICE, wad(10), max, 10).unwrap();
    }

    #[test]
    fn create_respects_liquidity_and_band_count() {
        let oracle = Arc::new(ManualOracle::new(wad(3000)));
        let policy = Arc::new(ConstantRatePolicy::new(U256::ZERO));
        let mut m = MarketState::new(MarketId(1), MarketConfig::weth_long(), oracle, policy, T0).unwrap();
        m.supply(T0, wad(100)).unwrap();
        assert!(matches!(
            m.create_loan(T0, ALICE, wad(10), wad(1000), 10),
            Err(MarketError::Debt(DebtError::InsufficientLiquidity { .. }))
        ));
        assert!(matches!(
            m.create_loan(T0, ALICE, wad(10), wad(10), 3),
            Err(MarketError::Debt(DebtError::InvalidBandCount(3)))
        ));
        assert_eq!(m.n_loans(), 0);
    }

    #[test]
    fn repay_partial_then_full() {
        let mut m = funded_market();
        let created = m.create_loan(T0, ALICE, wad(10), wad(15_000), 10).unwrap();
        let r = m.repay(T0, ALICE, wad(5_000)).unwrap();
        assert!(!r.closed);
        assert_eq!(r.remaining_debt, wad(10_000));
        // less debt sits lower in the ladder
        let (n1, _) = m.user_tick_range(ALICE).unwrap();
        assert!(n1 > created.n1);

        assert!(matches!(
            m.repay(T0, ALICE, wad(10_001)),
            Err(MarketError::Debt(DebtError::RepayExceedsDebt { .. }))
        ));
        let r = m.repay(T0, ALICE, wad(10_000)).unwrap();
        assert!(r.closed);
        assert!(wad(10) - r.collateral_returned < U256::from(100u64));
        assert!(!m.has_loan(ALICE));
        assert_eq!(m.total_debt().unwrap(), U256::ZERO);
    }

    #[test]
    fn collateral_moves_the_range() {
        let mut m = funded_market();
        let base = m.create_loan(T0, ALICE, wad(10), wad(15_000), 10).unwrap();
        let more = m.add_collateral(T0, ALICE, wad(5)).unwrap();
        assert!(more.n1 > base.n1);
        let less = m.remove_collateral(T0, ALICE, wad(5)).unwrap();
        assert!(less.n1 <= base.n1 + 1);
        assert!(matches!(
            m.remove_collateral(T0, ALICE, wad(100)),
            Err(MarketError::InsufficientCollateral { .. })
        ));
        assert!(matches!(
            m.remove_collateral(T0, ALICE, wad(9)),
            Err(MarketError::Debt(DebtError::DebtTooHigh { .. }))
        ));
    }

    #[test]
    fn borrow_more_raises_range() {
        let mut m = funded_market();
        let base = m.create_loan(T0, ALICE, wad(10), wad(10_000), 10).unwrap();
        let more = m.borrow_more(T0, ALICE, U256::ZERO, wad(5_000)).unwrap();
        assert_eq!(more.debt, wad(15_000));
        assert!(more.n1 < base.n1);
        assert_eq!(m.total_debt().unwrap(), wad(15_000));
    }

    // buys collateral until the price sits inside the owner's first band
    fn convert_first_band(m: &mut MarketState, owner: UserId) {
        let (n1, _) = m.user_tick_range(owner).unwrap();
        let p_up = m.p_oracle_up(n1).unwrap();
        let p_o = m.price_oracle();
        let band_low = mul_div_down(mul_div_down(p_o, p_o, p_up).unwrap(), p_o, p_up).unwrap();
        let (amount, dir) = m.get_amount_for_price(band_low + band_low / U256::from(200u64)).unwrap();
        assert_eq!(dir, Direction::BuyCollateral);
        m.exchange(T0, dir, amount, U256::ZERO).unwrap();
    }

    #[test]
    fn converted_position_is_frozen() {
        let mut m = funded_market();
        m.create_loan(T0, ALICE, wad(10), wad(20_000), 10).unwrap();
        convert_first_band(&mut m, ALICE);
        assert!(m.bands().converting_band(ALICE).is_some());

        assert!(matches!(
            m.add_collateral(T0, ALICE, wad(1)),
            Err(MarketError::Debt(DebtError::PositionActive(_)))
        ));
        assert!(matches!(
            m.borrow_more(T0, ALICE, U256::ZERO, wad(1)),
            Err(MarketError::Debt(DebtError::PositionActive(_)))
        ));
        // partial repay keeps the bands where they are
        let before = m.user_tick_range(ALICE);
        m.repay(T0, ALICE, wad(1_000)).unwrap();
        assert_eq!(m.user_tick_range(ALICE), before);
    }

    #[test]
    fn second_borrower_lands_below_converted_bands() {
        let mut m = funded_market();
        m.create_loan(T0, ALICE, wad(10), wad(20_000), 10).unwrap();
        convert_first_band(&mut m, ALICE);
        let converting = m.bands().converting_band(ALICE).unwrap();
        let loan = m.create_loan(T0, BOB, wad(10), wad(1_000), 4).unwrap();
        assert!(loan.n1 > converting);
        assert_eq!(m.n_loans(), 2);
    }
}
