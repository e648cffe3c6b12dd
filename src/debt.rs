//! Debt ledger and loan placement.
//!
//! Each loan stores its principal and the debt multiplier at its last change; live
//! debt scales with the global multiplier since then. Total debt is the sum of the
//! live per-loan debts, each rounded the same way `debt` rounds it, so the two can
//! never disagree.
//!
//! Placement picks the band range for a new loan: the lowest-priced start band
//! whose collateral, converted on the way down with the loan discount applied,
//! still covers the debt.

use alloy_primitives::U256;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::amm::{Amm, AmmError, AmmParams};
use crate::band::{BandError, DEAD_SHARES, MAX_SKIP_TICKS, MAX_TICKS, MIN_TICKS};
use crate::math::{add, mul_div, mul_div_down, quantize, MathError, Rounding, WAD};
use crate::types::{BandIndex, MarketId, UserId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DebtError {
    #[error("Debt too high: {debt} exceeds max {max}")]
    DebtTooHigh { debt: U256, max: U256 },

    #[error("Repay exceeds debt: {amount} > {debt}")]
    RepayExceedsDebt { amount: U256, debt: U256 },

    #[error("Borrow cap exceeded: total {total} + {requested} > cap {cap}")]
    BorrowCapExceeded { requested: U256, total: U256, cap: U256 },

    #[error("Insufficient liquidity: requested {requested}, available {available}")]
    InsufficientLiquidity { requested: U256, available: U256 },

    #[error("Position of {0} is in soft liquidation")]
    PositionActive(UserId),

    #[error("Loan already exists for {0}")]
    LoanExists(UserId),

    #[error("No loan for {0}")]
    LoanNotFound(UserId),

    #[error("Zero debt")]
    ZeroDebt,

    #[error("Band count {0} out of range")]
    InvalidBandCount(usize),

    #[error("Caller for {got:?} is not authorized on {expected:?}")]
    Unauthorized { expected: MarketId, got: MarketId },

    #[error("Oracle price is too far from the band ladder")]
    PriceOutOfRange,

    #[error(transparent)]
    Band(#[from] BandError),

    #[error(transparent)]
    Amm(#[from] AmmError),

    #[error(transparent)]
    Math(#[from] MathError),
}

impl DebtError {
    /// Overflow is fatal. Everything else can be retried with other inputs.
    pub fn is_recoverable(&self) -> bool {
        match self {
            DebtError::Math(_) => false,
            DebtError::Band(e) => e.is_recoverable(),
            DebtError::Amm(e) => e.is_recoverable(),
            _ => true,
        }
    }
}

/// Capability required by every ledger mutation. Only the owning market mints it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebtAuthority {
    market: MarketId,
}

impl DebtAuthority {
    pub(crate) fn new(market: MarketId) -> Self {
        Self { market }
    }

    pub fn market(&self) -> MarketId {
        self.market
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Loan {
    pub initial_debt: U256,
    pub rate_mul: U256,
}

pub type Borrowers<'a> = std::iter::Copied<std::collections::btree_map::Keys<'a, UserId, Loan>>;

/** 6.0: per-market debt state */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebtLedger {
    owner: MarketId,
    loans: BTreeMap<UserId, Loan>,
    /// Principals as last recorded, before any compounding since.
    initial_debt_sum: U256,
    /// Borrowed asset precision. Debt is always a multiple of it.
    quantum: U256,
    borrow_cap: U256,
    minted: U256,
    redeemed: U256,
    collected: U256,
    written_off: U256,
    lent: U256,
    repaid: U256,
}

impl DebtLedger {
    pub fn new(owner: MarketId, quantum: U256, borrow_cap: U256) -> Self {
        Self {
            owner,
            loans: BTreeMap::new(),
            initial_debt_sum: U256::ZERO,
            quantum,
            borrow_cap,
            minted: U256::ZERO,
            redeemed: U256::ZERO,
            collected: U256::ZERO,
            written_off: U256::ZERO,
            lent: U256::ZERO,
            repaid: U256::ZERO,
        }
    }

    pub fn n_loans(&self) -> usize {
        self.loans.len()
    }

    pub fn has_loan(&self, user: UserId) -> bool {
        self.loans.contains_key(&user)
    }

    pub fn loan(&self, user: UserId) -> Option<&Loan> {
        self.loans.get(&user)
    }

    pub fn borrowers(&self) -> Borrowers<'_> {
        self.loans.keys().copied()
    }

    pub fn borrow_cap(&self) -> U256 {
        self.borrow_cap
    }

    pub fn quantum(&self) -> U256 {
        self.quantum
    }

    pub fn initial_debt_sum(&self) -> U256 {
        self.initial_debt_sum
    }

    /// Minted minus redeemed borrowed asset.
    pub fn total_issued(&self) -> U256 {
        self.minted.saturating_sub(self.redeemed)
    }

    pub fn fees_collected(&self) -> U256 {
        self.collected
    }

    pub fn written_off(&self) -> U256 {
        self.written_off
    }

    pub fn lent(&self) -> U256 {
        self.lent
    }

    pub fn repaid(&self) -> U256 {
        self.repaid
    }

    // a lone loan rounds down so it cannot outgrow the aggregate. with company
    // every loan rounds up.
    fn rounding(&self) -> Rounding {
        if self.loans.len() > 1 {
            Rounding::Up
        } else {
            Rounding::Down
        }
    }

    fn live_debt(&self, loan: &Loan, rate_mul: U256, rounding: Rounding) -> Result<U256, MathError> {
        let exact = mul_div(loan.initial_debt, rate_mul, loan.rate_mul, rounding)?;
        quantize(exact, self.quantum, rounding)
    }

    /// Live debt of `user`, zero without a loan.
    pub fn debt(&self, user: UserId, rate_mul: U256) -> Result<U256, MathError> {
        match self.loans.get(&user) {
            Some(loan) => self.live_debt(loan, rate_mul, self.rounding()),
            None => Ok(U256::ZERO),
        }
    }

    /// Sum of every live debt at `rate_mul`.
    pub fn total_debt(&self, rate_mul: U256) -> Result<U256, MathError> {
        let rounding = self.rounding();
        self.loans.values().try_fold(U256::ZERO, |total, loan| {
            add(total, self.live_debt(loan, rate_mul, rounding)?)
        })
    }

    fn authorize(&self, auth: DebtAuthority) -> Result<(), DebtError> {
        if auth.market != self.owner {
            return Err(DebtError::Unauthorized {
                expected: self.owner,
                got: auth.market,
            });
        }
        Ok(())
    }

    // 6.1: replaces a loan's principal and snapshot.
    fn set_loan(&mut self, user: UserId, debt: U256, rate_mul: U256) -> Result<(), DebtError> {
        if let Some(old) = self.loans.remove(&user) {
            self.initial_debt_sum = self.initial_debt_sum.saturating_sub(old.initial_debt);
        }
        if debt.is_zero() {
            return Ok(());
        }
        self.initial_debt_sum = add(self.initial_debt_sum, debt)?;
        self.loans.insert(
            user,
            Loan {
                initial_debt: debt,
                rate_mul,
            },
        );
        Ok(())
    }

    /// Borrow-cap check ahead of any debt increase.
    pub fn on_debt_increased(&self, auth: DebtAuthority, amount: U256, rate_mul: U256) -> Result<(), DebtError> {
        self.authorize(auth)?;
        let total = self.total_debt(rate_mul)?;
        if add(total, amount)? > self.borrow_cap {
            return Err(DebtError::BorrowCapExceeded {
                requested: amount,
                total,
                cap: self.borrow_cap,
            });
        }
        Ok(())
    }

    pub fn create(&mut self, auth: DebtAuthority, user: UserId, debt: U256, rate_mul: U256) -> Result<(), DebtError> {
        self.authorize(auth)?;
        if self.loans.contains_key(&user) {
            return Err(DebtError::LoanExists(user));
        }
        if debt.is_zero() {
            return Err(DebtError::ZeroDebt);
        }
        self.on_debt_increased(auth, debt, rate_mul)?;
        self.set_loan(user, debt, rate_mul)?;
        self.minted = add(self.minted, debt)?;
        self.lent = add(self.lent, debt)?;
        Ok(())
    }

    /// Adds `amount` on top of the live debt. Returns the new debt.
    pub fn increase(&mut self, auth: DebtAuthority, user: UserId, amount: U256, rate_mul: U256) -> Result<U256, DebtError> {
        self.authorize(auth)?;
        if !self.loans.contains_key(&user) {
            return Err(DebtError::LoanNotFound(user));
        }
        self.on_debt_increased(auth, amount, rate_mul)?;
        let current = self.debt(user, rate_mul)?;
        let new_debt = add(current, amount)?;
        self.set_loan(user, new_debt, rate_mul)?;
        self.minted = add(self.minted, amount)?;
        self.lent = add(self.lent, amount)?;
        Ok(new_debt)
    }

    /// Returns the remaining debt. Overpaying is an error, never a negative balance.
    pub fn repay(&mut self, auth: DebtAuthority, user: UserId, amount: U256, rate_mul: U256) -> Result<U256, DebtError> {
        self.authorize(auth)?;
        if !self.loans.contains_key(&user) {
            return Err(DebtError::LoanNotFound(user));
        }
        let current = self.debt(user, rate_mul)?;
        if amount > current {
            return Err(DebtError::RepayExceedsDebt { amount, debt: current });
        }
        let remaining = current - amount;
        self.set_loan(user, remaining, rate_mul)?;
        self.redeemed = add(self.redeemed, amount)?;
        self.repaid = add(self.repaid, amount)?;
        Ok(remaining)
    }

    /// Removes the loan, returning the debt it carried.
    pub fn close(&mut self, auth: DebtAuthority, user: UserId, rate_mul: U256) -> Result<U256, DebtError> {
        self.authorize(auth)?;
        if !self.loans.contains_key(&user) {
            return Err(DebtError::LoanNotFound(user));
        }
        let current = self.debt(user, rate_mul)?;
        self.set_loan(user, U256::ZERO, rate_mul)?;
        self.redeemed = add(self.redeemed, current)?;
        self.repaid = add(self.repaid, current)?;
        Ok(current)
    }

    // 6.2: mint accrued interest (or write off a rounding gap) so issuance equals
    // total debt exactly.
    pub fn collect_fees(&mut self, auth: DebtAuthority, rate_mul: U256) -> Result<U256, DebtError> {
        self.authorize(auth)?;
        let target_minted = add(self.total_debt(rate_mul)?, self.redeemed)?;
        if target_minted >= self.minted {
            let fees = target_minted - self.minted;
            self.minted = target_minted;
            self.collected = add(self.collected, fees)?;
            Ok(fees)
        } else {
            let gap = self.minted - target_minted;
            self.redeemed = add(self.redeemed, gap)?;
            self.written_off = add(self.written_off, gap)?;
            Ok(U256::ZERO)
        }
    }

    pub fn set_borrow_cap(&mut self, auth: DebtAuthority, cap: U256) -> Result<(), DebtError> {
        self.authorize(auth)?;
        self.borrow_cap = cap;
        Ok(())
    }

    /// Lender cash left after what has been lent out and paid back.
    pub fn available_balance(&self, supplied: U256, withdrawn: U256) -> U256 {
        supplied
            .saturating_add(self.repaid)
            .saturating_sub(self.lent.saturating_add(withdrawn))
    }
}

pub fn check_band_count(n_bands: usize) -> Result<(), DebtError> {
    if !(MIN_TICKS..=MAX_TICKS).contains(&n_bands) {
        return Err(DebtError::InvalidBandCount(n_bands));
    }
    Ok(())
}

// 6.3: collateral value per unit of top-band price. each band's share is worth its
// geometric mid price, one A-ratio lower per band.
pub fn y_effective(params: &AmmParams, collateral: U256, n_bands: usize, discount: U256) -> Result<U256, MathError> {
    let n = U256::from(n_bands as u64);
    let per_band = collateral / n;
    let dead_term = mul_div_down(DEAD_SHARES, WAD, per_band.max(DEAD_SHARES))?;
    let discount = add(discount, dead_term)?.min(WAD);
    let a = params.a();
    let a1 = a - U256::from(1u64);
    let mut d_y = mul_div_down(collateral, WAD - discount, params.sqrt_band_ratio * n)?;
    let mut total = d_y;
    for _ in 1..n_bands {
        d_y = mul_div_down(d_y, a1, a)?;
        total = add(total, d_y)?;
    }
    Ok(total)
}

/// Debt a range starting at band `n` can carry.
pub fn cover(amm: &Amm<'_>, y_eff: U256, n: BandIndex) -> Result<U256, MathError> {
    mul_div_down(y_eff, amm.p_oracle_up(n)?, WAD)
}

/// Highest-priced band a new range may start at: strictly below the oracle price,
/// and above every band that already holds borrowed asset.
pub fn top_band(amm: &Amm<'_>) -> Result<BandIndex, DebtError> {
    let bands = amm.bands();
    let active = bands.active_band();
    let p_o = amm.context().price_oracle;

    let mut n = active;
    let mut steps = 0;
    if amm.p_oracle_up(n)? >= p_o {
        while amm.p_oracle_up(n)? >= p_o {
            n += 1;
            steps += 1;
            if steps > MAX_SKIP_TICKS {
                return Err(DebtError::PriceOutOfRange);
            }
        }
    } else {
        while amm.p_oracle_up(n - 1)? < p_o {
            n -= 1;
            steps += 1;
            if steps > MAX_SKIP_TICKS {
                return Err(DebtError::PriceOutOfRange);
            }
        }
    }

    let mut n_top = n;
    if n_top <= active {
        let occupied = bands
            .bands_through(active)
            .rev()
            .take_while(|(k, _)| **k >= n_top)
            .find(|(_, b)| !b.borrowed.is_zero())
            .map(|(k, _)| *k);
        if let Some(k) = occupied {
            n_top = k + 1;
        }
        n_top = n_top.max(active - MAX_SKIP_TICKS + 1);
    }
    Ok(n_top)
}

/// Largest debt for `collateral` (underlying) spread over `n_bands`.
pub fn max_debt(amm: &Amm<'_>, collateral: U256, n_bands: usize, discount: U256) -> Result<U256, DebtError> {
    check_band_count(n_bands)?;
    let y_eff = y_effective(amm.params(), collateral, n_bands, discount)?;
    Ok(cover(amm, y_eff, top_band(amm)?)?)
}

// 6.4: start band for a loan. cover(n) falls as n grows, so binary search for the
// last n that still carries the debt.
pub fn calculate_debt_n1(
    amm: &Amm<'_>,
    collateral: U256,
    debt: U256,
    n_bands: usize,
    discount: U256,
) -> Result<BandIndex, DebtError> {
    check_band_count(n_bands)?;
    if debt.is_zero() {
        return Err(DebtError::ZeroDebt);
    }
    let y_eff = y_effective(amm.params(), collateral, n_bands, discount)?;
    let n_top = top_band(amm)?;
    let max = cover(amm, y_eff, n_top)?;
    if max < debt {
        return Err(DebtError::DebtTooHigh { debt, max });
    }

    let mut lo = n_top;
    let mut hi = n_top + (MAX_SKIP_TICKS - n_bands as i64).max(0);
    if cover(amm, y_eff, hi)? >= debt {
        return Ok(hi);
    }
    while hi - lo > 1 {
        let mid = lo + (hi - lo) / 2;
        if cover(amm, y_eff, mid)? >= debt {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    Ok(lo)
}

/// Smallest collateral able to carry `debt` over `n_bands` at the top band.
pub fn min_collateral(amm: &Amm<'_>, debt: U256, n_bands: usize, discount: U256) -> Result<U256, DebtError> {
    check_band_count(n_bands)?;
    if debt.is_zero() {
        return Ok(U256::ZERO);
    }
    let unit = WAD;
    let per_unit = max_debt(amm, unit, n_bands, discount)?;
    if per_unit.is_zero() {
        return Err(DebtError::DebtTooHigh { debt, max: U256::ZERO });
    }
    // first guess from linear scaling, then walk up until it carries the debt
    let mut guess = mul_div(debt, unit, per_unit, Rounding::Up)?;
    for _ in 0..64 {
        if max_debt(amm, guess, n_bands, discount)? >= debt {
            return Ok(guess);
        }
        guess = add(guess, guess / U256::from(1_000_000u64) + U256::from(1u64))?;
    }
    Err(DebtError::DebtTooHigh { debt, max: max_debt(amm, guess, n_bands, discount)? })
}
