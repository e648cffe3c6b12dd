//! Market state and trading.
//!
//! A market owns one band ladder, one debt ledger and the accrual state, plus
//! handles to its oracle and monetary policy. Nothing is global: every call takes
//! the state by `&mut` and goes through [`MarketState::transact`], which syncs the
//! multipliers, runs the transition on a draft, saves the new rate and only then
//! commits. A failing transition leaves the market untouched.
//!
//! Public amounts are in each asset's native units. The ledgers run at 18
//! decimals and any sub-unit remainder from rescaling stays in the market as
//! boundary dust.

use alloy_primitives::U256;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::accrual::RateState;
use crate::amm::{Amm, AmmError, PriceContext, SwapPlan};
use crate::band::{Band, BandError, BandLedger, DustAccount};
use crate::config::{ConfigError, MarketConfig, MarketParams};
use crate::debt::{self, DebtAuthority, DebtError, DebtLedger};
use crate::liquidation::LiquidationError;
use crate::math::{add, mul_div_down, MathError, SECONDS_PER_YEAR, WAD};
use crate::oracle::{validate_oracle, OracleError, PriceOracle};
use crate::policy::MonetaryPolicy;
use crate::types::{AssetSpec, BandIndex, Direction, MarketId, Timestamp, UserId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MarketError {
    #[error("Zero amount")]
    ZeroAmount,

    #[error("Not enough collateral: requested {requested}, position holds {available}")]
    InsufficientCollateral { requested: U256, available: U256 },

    #[error(transparent)]
    Band(#[from] BandError),

    #[error(transparent)]
    Amm(#[from] AmmError),

    #[error(transparent)]
    Debt(#[from] DebtError),

    #[error(transparent)]
    Liquidation(#[from] LiquidationError),

    #[error(transparent)]
    Oracle(#[from] OracleError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Math(#[from] MathError),
}

impl MarketError {
    pub fn is_recoverable(&self) -> bool {
        match self {
            MarketError::Math(_) => false,
            MarketError::Band(e) => e.is_recoverable(),
            MarketError::Amm(e) => e.is_recoverable(),
            MarketError::Debt(e) => e.is_recoverable(),
            MarketError::Liquidation(e) => e.is_recoverable(),
            MarketError::Config(ConfigError::Amm(e)) => e.is_recoverable(),
            _ => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapQuote {
    pub direction: Direction,
    pub in_amount: U256,
    pub out_amount: U256,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapReceipt {
    pub direction: Direction,
    pub in_amount: U256,
    pub out_amount: U256,
    pub active_band: BandIndex,
}

/// Snapshot of one borrower, native units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserState {
    pub collateral: U256,
    pub borrowed: U256,
    pub debt: U256,
    pub n_bands: usize,
}

/** 12.0: one isolated market */
#[derive(Debug, Clone)]
pub struct MarketState {
    pub id: MarketId,
    pub config: MarketConfig,
    pub(crate) params: MarketParams,
    pub(crate) bands: BandLedger,
    pub(crate) ledger: DebtLedger,
    pub(crate) rates: RateState,
    oracle: Arc<dyn PriceOracle>,
    policy: Arc<dyn MonetaryPolicy>,
    supplied: U256,
    withdrawn: U256,
    pub(crate) boundary_dust: DustAccount,
    pub(crate) authority: DebtAuthority,
}

impl MarketState {
    // 12.1: creation reads both oracle paths and pins the ladder's base price.
    pub fn new(
        id: MarketId,
        config: MarketConfig,
        oracle: Arc<dyn PriceOracle>,
        policy: Arc<dyn MonetaryPolicy>,
        now: Timestamp,
    ) -> Result<Self, MarketError> {
        let base_price = validate_oracle(oracle.as_ref())?;
        let params = config.to_params(base_price)?;
        let ledger = DebtLedger::new(id, config.borrowed.precision(), params.borrow_cap);
        let rates = RateState::new(now, params.collateral_rate);
        let mut market = Self {
            id,
            config,
            params,
            bands: BandLedger::new(0),
            ledger,
            rates,
            oracle,
            policy,
            supplied: U256::ZERO,
            withdrawn: U256::ZERO,
            boundary_dust: DustAccount::default(),
            authority: DebtAuthority::new(id),
        };
        market.save_rate()?;
        Ok(market)
    }

    pub fn params(&self) -> &MarketParams {
        &self.params
    }

    pub fn bands(&self) -> &BandLedger {
        &self.bands
    }

    pub fn ledger(&self) -> &DebtLedger {
        &self.ledger
    }

    pub fn rates(&self) -> &RateState {
        &self.rates
    }

    pub fn boundary_dust(&self) -> &DustAccount {
        &self.boundary_dust
    }

    pub fn collateral_asset(&self) -> &AssetSpec {
        &self.config.collateral
    }

    pub fn borrowed_asset(&self) -> &AssetSpec {
        &self.config.borrowed
    }

    /// Brings the multipliers up to `now`. Idempotent.
    pub fn sync(&mut self, now: Timestamp) -> Result<(), MarketError> {
        self.rates.sync(now)?;
        Ok(())
    }

    // 12.2: all-or-nothing. the closure works on a draft; errors drop it.
    pub(crate) fn transact<T>(
        &mut self,
        now: Timestamp,
        op: &'static str,
        f: impl FnOnce(&mut MarketState) -> Result<T, MarketError>,
    ) -> Result<T, MarketError> {
        let mut draft = self.clone();
        match Self::run_draft(&mut draft, now, f) {
            Ok(out) => {
                *self = draft;
                Ok(out)
            }
            Err(e) => {
                debug!(market = self.id.0, op, error = %e, "transition rejected");
                Err(e)
            }
        }
    }

    fn run_draft<T>(
        draft: &mut MarketState,
        now: Timestamp,
        f: impl FnOnce(&mut MarketState) -> Result<T, MarketError>,
    ) -> Result<T, MarketError> {
        draft.sync(now)?;
        let out = f(draft)?;
        draft.save_rate()?;
        Ok(out)
    }

    /// Pulls the oracle. Called on every entry point that prices anything.
    pub(crate) fn price_context(&self) -> Result<PriceContext, MarketError> {
        let price = self.oracle.price();
        if price.is_zero() {
            return Err(OracleError::ZeroPrice.into());
        }
        Ok(PriceContext {
            price_oracle: price,
            rate_mul: self.rates.rate_mul,
            collateral_rate_mul: self.rates.collateral_rate_mul,
        })
    }

    pub(crate) fn amm(&self, ctx: PriceContext) -> Amm<'_> {
        Amm::new(&self.params.amm, &self.bands, ctx)
    }

    fn save_rate(&mut self) -> Result<(), MarketError> {
        let utilization = self.utilization()?;
        let rate = self.params.clamp_rate(self.policy.rate(utilization)?);
        self.rates.set_rate(rate);
        Ok(())
    }

    // 12.3: views. amounts are native units of the relevant asset.

    pub fn price_oracle(&self) -> U256 {
        self.oracle.price()
    }

    pub fn get_p(&self) -> Result<U256, MarketError> {
        let ctx = self.price_context()?;
        Ok(self.amm(ctx).get_p()?)
    }

    pub fn p_oracle_up(&self, n: BandIndex) -> Result<U256, MarketError> {
        Ok(self.params.amm.p_oracle_up(self.rates.rate_mul, n)?)
    }

    pub fn p_oracle_down(&self, n: BandIndex) -> Result<U256, MarketError> {
        Ok(self.params.amm.p_oracle_down(self.rates.rate_mul, n)?)
    }

    pub fn active_band(&self) -> BandIndex {
        self.bands.active_band()
    }

    pub fn band(&self, n: BandIndex) -> Band {
        self.bands.band(n)
    }

    pub fn min_band(&self) -> Option<BandIndex> {
        self.bands.min_band()
    }

    pub fn max_band(&self) -> Option<BandIndex> {
        self.bands.max_band()
    }

    pub fn can_skip_bands(&self, n_end: BandIndex) -> bool {
        self.bands.can_skip_bands(n_end)
    }

    pub fn has_loan(&self, owner: UserId) -> bool {
        self.ledger.has_loan(owner)
    }

    pub fn n_loans(&self) -> usize {
        self.ledger.n_loans()
    }

    pub fn debt(&self, owner: UserId) -> Result<U256, MarketError> {
        let wad = self.ledger.debt(owner, self.rates.rate_mul)?;
        Ok(self.config.borrowed.from_wad_up(wad))
    }

    pub fn total_debt(&self) -> Result<U256, MarketError> {
        Ok(self.config.borrowed.from_wad(self.total_debt_wad()?))
    }

    pub(crate) fn total_debt_wad(&self) -> Result<U256, MarketError> {
        Ok(self.ledger.total_debt(self.rates.rate_mul)?)
    }

    pub fn total_issued(&self) -> U256 {
        self.config.borrowed.from_wad(self.ledger.total_issued())
    }

    pub fn available_balance(&self) -> U256 {
        self.config.borrowed.from_wad(self.available_wad())
    }

    pub(crate) fn available_wad(&self) -> U256 {
        self.ledger.available_balance(self.supplied, self.withdrawn)
    }

    /// Debt over lender assets (cash plus debt), WAD.
    pub fn utilization(&self) -> Result<U256, MarketError> {
        let debt = self.total_debt_wad()?;
        let assets = add(self.available_wad(), debt)?;
        if assets.is_zero() {
            return Ok(U256::ZERO);
        }
        Ok(mul_div_down(debt, WAD, assets)?)
    }

    pub fn borrow_apr(&self) -> U256 {
        self.rates.rate.saturating_mul(U256::from(SECONDS_PER_YEAR))
    }

    pub fn lend_apr(&self) -> Result<U256, MarketError> {
        Ok(mul_div_down(self.borrow_apr(), self.utilization()?, WAD)?)
    }

    pub fn max_borrowable(&self, collateral: U256, n_bands: usize) -> Result<U256, MarketError> {
        let raw = self.config.collateral.to_wad(collateral)?;
        let ctx = self.price_context()?;
        let amm = self.amm(ctx);
        let cover = debt::max_debt(&amm, amm.to_underlying(raw)?, n_bands, self.params.loan_discount)?;
        let total = self.total_debt_wad()?;
        let cap_room = self.ledger.borrow_cap().saturating_sub(total);
        let max = cover.min(self.available_wad()).min(cap_room);
        Ok(self.config.borrowed.from_wad(max))
    }

    pub fn min_collateral(&self, debt: U256, n_bands: usize) -> Result<U256, MarketError> {
        let debt_wad = self.config.borrowed.to_wad(debt)?;
        let ctx = self.price_context()?;
        let amm = self.amm(ctx);
        let underlying = debt::min_collateral(&amm, debt_wad, n_bands, self.params.loan_discount)?;
        let raw = amm.to_raw_up(underlying)?;
        Ok(self.config.collateral.from_wad_up(raw))
    }

    pub fn user_tick_range(&self, owner: UserId) -> Option<(BandIndex, BandIndex)> {
        self.bands.user_ticks(owner).map(|t| (t.n1, t.n2))
    }

    pub fn user_state(&self, owner: UserId) -> Result<UserState, MarketError> {
        let debt = self.debt(owner)?;
        let Some(ticks) = self.bands.user_ticks(owner) else {
            return Ok(UserState {
                collateral: U256::ZERO,
                borrowed: U256::ZERO,
                debt,
                n_bands: 0,
            });
        };
        let (x, y) = self.bands.user_amounts(owner)?;
        Ok(UserState {
            collateral: self.config.collateral.from_wad(y),
            borrowed: self.config.borrowed.from_wad(x),
            debt,
            n_bands: ticks.n_bands(),
        })
    }

    /// Raw collateral held by the market, 18 decimals.
    pub fn collateral_holdings(&self) -> U256 {
        self.bands.total_collateral() + self.bands.dust().collateral + self.boundary_dust.collateral
    }

    /// Borrowed asset held by the market (pool cash plus AMM reserves), 18 decimals.
    pub fn borrowed_holdings(&self) -> U256 {
        self.available_wad() + self.bands.total_borrowed() + self.bands.dust().borrowed + self.boundary_dust.borrowed
    }

    // 12.4: trading

    fn plan_swap(&self, direction: Direction, amount_in: U256) -> Result<(SwapPlan, SwapQuote), MarketError> {
        let (in_asset, out_asset) = match direction {
            Direction::BuyCollateral => (&self.config.borrowed, &self.config.collateral),
            Direction::SellCollateral => (&self.config.collateral, &self.config.borrowed),
        };
        let in_wad = in_asset.to_wad(amount_in)?;
        let ctx = self.price_context()?;
        let plan = self.amm(ctx).calc_swap(direction, in_wad)?;
        let quote = SwapQuote {
            direction,
            in_amount: in_asset.from_wad_up(plan.in_amount),
            out_amount: out_asset.from_wad(plan.out_amount),
        };
        Ok((plan, quote))
    }

    pub fn quote(&self, direction: Direction, amount_in: U256) -> Result<SwapQuote, MarketError> {
        Ok(self.plan_swap(direction, amount_in)?.1)
    }

    pub fn exchange(
        &mut self,
        now: Timestamp,
        direction: Direction,
        amount_in: U256,
        min_amount_out: U256,
    ) -> Result<SwapReceipt, MarketError> {
        self.transact(now, "exchange", |m| {
            if amount_in.is_zero() {
                return Err(MarketError::ZeroAmount);
            }
            let (plan, quote) = m.plan_swap(direction, amount_in)?;
            if quote.out_amount < min_amount_out {
                return Err(AmmError::SlippageExceeded {
                    amount_out: quote.out_amount,
                    min_amount_out,
                }
                .into());
            }
            plan.apply(&mut m.bands);

            let (in_precision, out_precision) = match direction {
                Direction::BuyCollateral => (m.config.borrowed.precision(), m.config.collateral.precision()),
                Direction::SellCollateral => (m.config.collateral.precision(), m.config.borrowed.precision()),
            };
            let in_excess = quote.in_amount * in_precision - plan.in_amount;
            let out_excess = plan.out_amount - quote.out_amount * out_precision;
            match direction {
                Direction::BuyCollateral => {
                    m.boundary_dust.borrowed = add(m.boundary_dust.borrowed, in_excess)?;
                    m.boundary_dust.collateral = add(m.boundary_dust.collateral, out_excess)?;
                }
                Direction::SellCollateral => {
                    m.boundary_dust.collateral = add(m.boundary_dust.collateral, in_excess)?;
                    m.boundary_dust.borrowed = add(m.boundary_dust.borrowed, out_excess)?;
                }
            }
            Ok(SwapReceipt {
                direction,
                in_amount: quote.in_amount,
                out_amount: quote.out_amount,
                active_band: plan.active_band,
            })
        })
    }

    /// Input (native units) that moves the AMM price to `target` (WAD), and its direction.
    pub fn get_amount_for_price(&self, target: U256) -> Result<(U256, Direction), MarketError> {
        let ctx = self.price_context()?;
        let (amount, direction) = self.amm(ctx).amount_for_price(target)?;
        let asset = match direction {
            Direction::BuyCollateral => &self.config.borrowed,
            Direction::SellCollateral => &self.config.collateral,
        };
        Ok((asset.from_wad_up(amount), direction))
    }

    // 12.5: lender side. no share accounting, just cash in and out.

    pub fn supply(&mut self, now: Timestamp, amount: U256) -> Result<(), MarketError> {
        self.transact(now, "supply", |m| {
            if amount.is_zero() {
                return Err(MarketError::ZeroAmount);
            }
            let wad = m.config.borrowed.to_wad(amount)?;
            m.supplied = add(m.supplied, wad)?;
            Ok(())
        })
    }

    pub fn withdraw_supply(&mut self, now: Timestamp, amount: U256) -> Result<(), MarketError> {
        self.transact(now, "withdraw_supply", |m| {
            let wad = m.config.borrowed.to_wad(amount)?;
            m.check_liquidity(wad)?;
            m.withdrawn = add(m.withdrawn, wad)?;
            Ok(())
        })
    }

    pub(crate) fn check_liquidity(&self, wad: U256) -> Result<(), MarketError> {
        let available = self.available_wad();
        if wad > available {
            return Err(DebtError::InsufficientLiquidity {
                requested: self.config.borrowed.from_wad_up(wad),
                available: self.config.borrowed.from_wad(available),
            }
            .into());
        }
        Ok(())
    }

    /// Reconciles issuance with total debt. Returns the interest recognized, native.
    pub fn collect_fees(&mut self, now: Timestamp) -> Result<U256, MarketError> {
        self.transact(now, "collect_fees", |m| {
            let fees = m.ledger.collect_fees(m.authority, m.rates.rate_mul)?;
            Ok(m.config.borrowed.from_wad(fees))
        })
    }

    /// Replaces the borrow cap, native units. Existing loans are unaffected.
    pub fn set_borrow_cap(&mut self, now: Timestamp, cap: U256) -> Result<(), MarketError> {
        self.transact(now, "set_borrow_cap", |m| {
            let cap = m.config.borrowed.to_wad(cap)?;
            m.ledger.set_borrow_cap(m.authority, cap)?;
            Ok(())
        })
    }

    /// Moves a native remainder into boundary dust: `wad - native * precision`.
    pub(crate) fn keep_collateral_remainder(&mut self, wad: U256, native: U256) -> Result<(), MarketError> {
        let excess = wad.saturating_sub(native * self.config.collateral.precision());
        self.boundary_dust.collateral = add(self.boundary_dust.collateral, excess)?;
        Ok(())
    }

    pub(crate) fn keep_borrowed_remainder(&mut self, wad: U256, native: U256) -> Result<(), MarketError> {
        let excess = wad.saturating_sub(native * self.config.borrowed.precision());
        self.boundary_dust.borrowed = add(self.boundary_dust.borrowed, excess)?;
        Ok(())
    }

    /// Native amount charged for `wad`, rounded up; the overshoot stays as dust.
    pub(crate) fn charge_borrowed(&mut self, wad: U256) -> Result<U256, MarketError> {
        let native = self.config.borrowed.from_wad_up(wad);
        let excess = native * self.config.borrowed.precision() - wad;
        self.boundary_dust.borrowed = add(self.boundary_dust.borrowed, excess)?;
        Ok(native)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::ManualOracle;
    use crate::policy::ConstantRatePolicy;

    fn wad(x: u64) -> U256 {
        U256::from(x) * WAD
    }

    fn market() -> (MarketState, Arc<ManualOracle>) {
        let oracle = Arc::new(ManualOracle::new(wad(3000)));
        let policy = Arc::new(ConstantRatePolicy::new(U256::ZERO));
        let m = MarketState::new(MarketId(1), MarketConfig::weth_long(), oracle.clone(), policy, Timestamp::ZERO)
            .unwrap();
        (m, oracle)
    }

    #[test]
    fn creation_checks_oracle() {
        let policy = Arc::new(ConstantRatePolicy::new(U256::ZERO));
        let bad = Arc::new(ManualOracle::mismatched(wad(3000), wad(3001)));
        let err = MarketState::new(MarketId(1), MarketConfig::weth_long(), bad, policy.clone(), Timestamp::ZERO);
        assert!(matches!(err, Err(MarketError::Oracle(OracleError::Mismatch { .. }))));

        let zero = Arc::new(ManualOracle::new(U256::ZERO));
        let err = MarketState::new(MarketId(1), MarketConfig::weth_long(), zero, policy, Timestamp::ZERO);
        assert!(matches!(err, Err(MarketError::Oracle(OracleError::ZeroPrice))));
    }

    #[test]
    fn rate_clamped_to_min_on_empty_market() {
        let (m, _) = market();
        assert_eq!(m.rates().rate, m.params().min_rate);
        assert_eq!(m.utilization().unwrap(), U256::ZERO);
    }

    #[test]
    fn supply_and_withdraw() {
        let (mut m, _) = market();
        m.supply(Timestamp::ZERO, wad(1000)).unwrap();
        assert_eq!(m.available_balance(), wad(1000));
        assert!(matches!(
            m.withdraw_supply(Timestamp::ZERO, wad(1001)),
            Err(MarketError::Debt(DebtError::InsufficientLiquidity { .. }))
        ));
        m.withdraw_supply(Timestamp::ZERO, wad(400)).unwrap();
        assert_eq!(m.available_balance(), wad(600));
        assert!(matches!(m.supply(Timestamp::ZERO, U256::ZERO), Err(MarketError::ZeroAmount)));
    }

    #[test]
    fn borrow_cap_limits_new_debt() {
        let (mut m, _) = market();
        m.supply(Timestamp::ZERO, wad(1_000_000)).unwrap();
        m.set_borrow_cap(Timestamp::ZERO, wad(1000)).unwrap();
        assert_eq!(m.max_borrowable(wad(10), 10).unwrap(), wad(1000));
        assert!(m.create_loan(Timestamp::ZERO, UserId(1), wad(10), wad(1001), 10).is_err());
        m.create_loan(Timestamp::ZERO, UserId(1), wad(10), wad(1000), 10).unwrap();
    }

    #[test]
    fn failed_transition_leaves_state() {
        let (mut m, _) = market();
        m.supply(Timestamp::ZERO, wad(1000)).unwrap();
        let before = m.rates().clone();
        let err = m.withdraw_supply(Timestamp::from_secs(3600), wad(5000));
        assert!(err.is_err());
        // the failed call did not even sync
        assert_eq!(m.rates(), &before);
        assert_eq!(m.available_balance(), wad(1000));
    }

    #[test]
    fn empty_market_swaps_nothing() {
        let (mut m, _) = market();
        let receipt = m.exchange(Timestamp::ZERO, Direction::BuyCollateral, wad(100), U256::ZERO).unwrap();
        assert_eq!(receipt.out_amount, U256::ZERO);
        assert_eq!(receipt.in_amount, U256::ZERO);
        let err = m.exchange(Timestamp::ZERO, Direction::BuyCollateral, wad(100), U256::from(1u64));
        assert!(matches!(err, Err(MarketError::Amm(AmmError::SlippageExceeded { .. }))));
    }

    #[test]
    fn oracle_read_on_every_pricing_call() {
        let (m, oracle) = market();
        let p1 = m.get_p().unwrap();
        oracle.set_price(wad(2000));
        let p2 = m.get_p().unwrap();
        assert!(p2 < p1);
        oracle.set_price(U256::ZERO);
        assert!(matches!(m.get_p(), Err(MarketError::Oracle(OracleError::ZeroPrice))));
    }

    #[test]
    fn recoverable_classification() {
        assert!(!MarketError::Math(MathError::ArithmeticOverflow).is_recoverable());
        assert!(!MarketError::Debt(DebtError::Math(MathError::ArithmeticOverflow)).is_recoverable());
        assert!(MarketError::Debt(DebtError::ZeroDebt).is_recoverable());
        assert!(MarketError::ZeroAmount.is_recoverable());
    }
}
