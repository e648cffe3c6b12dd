//! Band ledger.
//!
//! Collateral lives in a sparse ladder of price bands keyed by signed tick. Each band
//! holds collateral and borrowed-asset reserves plus the shares of the users whose
//! liquidity sits in it. A fixed quantity of virtual "dead" shares is counted in every
//! band so a direct donation can never move the share price enough to matter.

use alloy_primitives::U256;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::math::{add, mul_div_down, sub, MathError, WAD};
use crate::types::{BandIndex, UserId};

/// Virtual shares counted in every band, never owned by anyone.
pub const DEAD_SHARES: U256 = U256::from_limbs([1000, 0, 0, 0]);

/// Minimum shares a deposit may mint into a single band.
pub const MIN_SHARES_ALLOWED: U256 = U256::from_limbs([1_000_000_000_000, 0, 0, 0]);

pub const MIN_TICKS: usize = 4;
pub const MAX_TICKS: usize = 50;

/// Furthest the active band may be moved over empty bands in one step.
pub const MAX_SKIP_TICKS: i64 = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BandError {
    #[error("Invalid band range [{n1}, {n2}]")]
    InvalidRange { n1: BandIndex, n2: BandIndex },

    #[error("Too many bands: {requested} (max {max})")]
    TooManyBands { requested: usize, max: usize },

    #[error("Amount too low: {shares} shares per band, minimum {minimum}")]
    AmountTooLow { shares: U256, minimum: U256 },

    #[error("Deposit at or below active band {active} (n1 = {n1})")]
    DepositBelowActiveBand { n1: BandIndex, active: BandIndex },

    #[error("User {0} already has liquidity")]
    LiquidityExists(UserId),

    #[error("User {0} has no liquidity")]
    NoLiquidity(UserId),

    #[error("Active band occupied: band {band} has partially converted")]
    ActiveBandOccupied { band: BandIndex },

    #[error("Invalid withdrawal fraction {0}")]
    InvalidFraction(U256),

    #[error(transparent)]
    Math(#[from] MathError),
}

impl BandError {
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, BandError::Math(_))
    }
}

/** 3.0: one price band. empty bands are not stored */
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Band {
    /// Collateral, raw (pre-yield) 18-decimal units.
    pub collateral: U256,
    /// Borrowed asset, 18-decimal units.
    pub borrowed: U256,
    /// User-owned shares. DEAD_SHARES are added on top when pricing.
    pub total_shares: U256,
}

impl Band {
    pub fn is_empty(&self) -> bool {
        self.collateral.is_zero() && self.borrowed.is_zero()
    }

    /// `(borrowed + 1) / (total_shares + DEAD_SHARES)`, WAD.
    pub fn borrowed_share_price(&self) -> Result<U256, MathError> {
        mul_div_down(self.borrowed + U256::from(1u64), WAD, self.total_shares + DEAD_SHARES)
    }

    pub fn collateral_share_price(&self) -> Result<U256, MathError> {
        mul_div_down(self.collateral + U256::from(1u64), WAD, self.total_shares + DEAD_SHARES)
    }

    /// Pro-rata claim of `shares` on this band: (borrowed, collateral).
    pub fn claim(&self, shares: U256) -> Result<(U256, U256), MathError> {
        let denom = self.total_shares + DEAD_SHARES;
        let x = mul_div_down(self.borrowed + U256::from(1u64), shares, denom)?.min(self.borrowed);
        let y = mul_div_down(self.collateral + U256::from(1u64), shares, denom)?.min(self.collateral);
        Ok((x, y))
    }
}

/// A user's position in the ladder: contiguous ticks with one share entry each.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserTicks {
    pub n1: BandIndex,
    pub n2: BandIndex,
    pub shares: Vec<U256>,
}

impl UserTicks {
    pub fn n_bands(&self) -> usize {
        self.shares.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (BandIndex, U256)> + '_ {
        self.shares.iter().enumerate().map(move |(i, s)| (self.n1 + i as i64, *s))
    }
}

/// Reserves left behind when a band's last user shares are burned.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DustAccount {
    pub collateral: U256,
    pub borrowed: U256,
}

/** 3.1: the ladder. sparse map, active pointer, user ranges */
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandLedger {
    bands: BTreeMap<BandIndex, Band>,
    users: BTreeMap<UserId, UserTicks>,
    active_band: BandIndex,
    dust: DustAccount,
}

impl BandLedger {
    pub fn new(active_band: BandIndex) -> Self {
        Self {
            active_band,
            ..Default::default()
        }
    }

    pub fn active_band(&self) -> BandIndex {
        self.active_band
    }

    pub(crate) fn set_active_band(&mut self, n: BandIndex) {
        self.active_band = n;
    }

    /// Empty default for unoccupied ticks.
    pub fn band(&self, n: BandIndex) -> Band {
        self.bands.get(&n).cloned().unwrap_or_default()
    }

    pub fn bands(&self) -> impl Iterator<Item = (&BandIndex, &Band)> {
        self.bands.iter()
    }

    /// Stored bands at or above tick `n`, ascending.
    pub fn bands_from(&self, n: BandIndex) -> std::collections::btree_map::Range<'_, BandIndex, Band> {
        self.bands.range(n..)
    }

    /// Stored bands at or below tick `n`, ascending.
    pub fn bands_through(&self, n: BandIndex) -> std::collections::btree_map::Range<'_, BandIndex, Band> {
        self.bands.range(..=n)
    }

    pub fn min_band(&self) -> Option<BandIndex> {
        self.bands.keys().next().copied()
    }

    pub fn max_band(&self) -> Option<BandIndex> {
        self.bands.keys().next_back().copied()
    }

    pub fn dust(&self) -> &DustAccount {
        &self.dust
    }

    pub fn user_ticks(&self, user: UserId) -> Option<&UserTicks> {
        self.users.get(&user)
    }

    pub fn has_liquidity(&self, user: UserId) -> bool {
        self.users.contains_key(&user)
    }

    pub fn users(&self) -> impl Iterator<Item = (&UserId, &UserTicks)> {
        self.users.iter()
    }

    pub fn total_collateral(&self) -> U256 {
        self.bands.values().fold(U256::ZERO, |acc, b| acc + b.collateral)
    }

    pub fn total_borrowed(&self) -> U256 {
        self.bands.values().fold(U256::ZERO, |acc, b| acc + b.borrowed)
    }

    /// True if every band from the active one to `n_end` (either side) is empty.
    pub fn can_skip_bands(&self, n_end: BandIndex) -> bool {
        let (lo, hi) = if n_end >= self.active_band {
            (self.active_band, n_end)
        } else {
            (n_end, self.active_band)
        };
        self.bands.range(lo..=hi).all(|(_, b)| b.is_empty())
    }

    /// Borrowed and raw collateral a user would receive for a full withdrawal.
    pub fn user_amounts(&self, user: UserId) -> Result<(U256, U256), BandError> {
        let ticks = self.users.get(&user).ok_or(BandError::NoLiquidity(user))?;
        let mut x = U256::ZERO;
        let mut y = U256::ZERO;
        for (n, shares) in ticks.iter() {
            let (dx, dy) = self.band(n).claim(shares)?;
            x = add(x, dx)?;
            y = add(y, dy)?;
        }
        Ok((x, y))
    }

    // 3.2: deposit. bands at or below the active one are only usable while they
    // hold no borrowed asset, in which case the active pointer skips down past them.
    pub fn deposit_range(
        &mut self,
        user: UserId,
        amount: U256,
        n1: BandIndex,
        n2: BandIndex,
    ) -> Result<(), BandError> {
        if n1 > n2 {
            return Err(BandError::InvalidRange { n1, n2 });
        }
        let n_bands = (n2 - n1 + 1) as usize;
        if n_bands > MAX_TICKS {
            return Err(BandError::TooManyBands {
                requested: n_bands,
                max: MAX_TICKS,
            });
        }
        if self.users.contains_key(&user) {
            return Err(BandError::LiquidityExists(user));
        }

        let active = self.active_band;
        if n1 <= active {
            if active - n1 >= MAX_SKIP_TICKS {
                return Err(BandError::DepositBelowActiveBand { n1, active });
            }
            let occupied = self.bands.range(n1..=active).any(|(_, b)| !b.borrowed.is_zero());
            if occupied {
                return Err(BandError::DepositBelowActiveBand { n1, active });
            }
        }

        // every check runs before the first write
        let per_band = amount / U256::from(n_bands as u64);
        let remainder = amount - per_band * U256::from(n_bands as u64);
        let mut deposits = Vec::with_capacity(n_bands);
        for i in 0..n_bands {
            let n = n1 + i as i64;
            let y = if i == 0 { per_band + remainder } else { per_band };
            let band = self.band(n);
            let ds = mul_div_down(y, band.total_shares + DEAD_SHARES, band.collateral + U256::from(1u64))?;
            if ds < MIN_SHARES_ALLOWED {
                return Err(BandError::AmountTooLow {
                    shares: ds,
                    minimum: MIN_SHARES_ALLOWED,
                });
            }
            let collateral = add(band.collateral, y)?;
            let total_shares = add(band.total_shares, ds)?;
            deposits.push((n, collateral, total_shares, ds));
        }

        if n1 <= active {
            self.active_band = n1 - 1;
        }
        let mut shares = Vec::with_capacity(n_bands);
        for (n, collateral, total_shares, ds) in deposits {
            let band = self.bands.entry(n).or_default();
            band.collateral = collateral;
            band.total_shares = total_shares;
            shares.push(ds);
        }
        self.users.insert(user, UserTicks { n1, n2, shares });
        Ok(())
    }

    /// Full withdrawal of the user's range. Refused once any of the user's bands at
    /// or below the active band holds borrowed asset.
    pub fn withdraw(&mut self, user: UserId, n1: BandIndex, n2: BandIndex) -> Result<(U256, U256), BandError> {
        let ticks = self.users.get(&user).ok_or(BandError::NoLiquidity(user))?;
        if ticks.n1 != n1 || ticks.n2 != n2 {
            return Err(BandError::InvalidRange { n1, n2 });
        }
        if let Some(band) = self.converting_band(user) {
            return Err(BandError::ActiveBandOccupied { band });
        }
        let (x, y) = self.withdraw_fraction(user, WAD)?;
        Ok((y, x))
    }

    /// First of the user's bands that sits at or below the active band and has
    /// already converted some collateral.
    pub fn converting_band(&self, user: UserId) -> Option<BandIndex> {
        let ticks = self.users.get(&user)?;
        ticks
            .iter()
            .map(|(n, _)| n)
            .find(|n| *n <= self.active_band && !self.band(*n).borrowed.is_zero())
    }

    // 3.3: pro-rata removal of `frac` (WAD) of the user's shares in every band.
    // returns (borrowed, raw collateral). liquidation and close paths only.
    pub(crate) fn withdraw_fraction(&mut self, user: UserId, frac: U256) -> Result<(U256, U256), BandError> {
        if frac.is_zero() || frac > WAD {
            return Err(BandError::InvalidFraction(frac));
        }
        let mut ticks = self.users.remove(&user).ok_or(BandError::NoLiquidity(user))?;
        let full = frac == WAD;
        let mut x_out = U256::ZERO;
        let mut y_out = U256::ZERO;

        for i in 0..ticks.shares.len() {
            let n = ticks.n1 + i as i64;
            let user_shares = ticks.shares[i];
            let ds = if full { user_shares } else { mul_div_down(user_shares, frac, WAD)? };
            if ds.is_zero() {
                continue;
            }
            let Some(band) = self.bands.get_mut(&n) else {
                continue;
            };
            let (dx, dy) = band.claim(ds)?;
            band.borrowed = sub(band.borrowed, dx)?;
            band.collateral = sub(band.collateral, dy)?;
            band.total_shares = sub(band.total_shares, ds)?;
            ticks.shares[i] = user_shares - ds;
            x_out = add(x_out, dx)?;
            y_out = add(y_out, dy)?;

            if band.total_shares.is_zero() {
                self.dust.borrowed = add(self.dust.borrowed, band.borrowed)?;
                self.dust.collateral = add(self.dust.collateral, band.collateral)?;
                self.bands.remove(&n);
            }
        }

        if !full && ticks.shares.iter().any(|s| !s.is_zero()) {
            self.users.insert(user, ticks);
        }
        Ok((x_out, y_out))
    }

    /// Overwrite reserves after a trade. Share counts are untouched.
    pub(crate) fn set_reserves(&mut self, n: BandIndex, borrowed: U256, collateral: U256) {
        if let Some(band) = self.bands.get_mut(&n) {
            band.borrowed = borrowed;
            band.collateral = collateral;
        }
    }
}
