// 1.0: all the primitives live here. nothing in the engine works without these types.
// IDs, band indices, trade direction, timestamps, asset precision. each is a newtype
// so the compiler catches type mixups.

use alloy_primitives::U256;
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::math::{MathError, WAD};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MarketId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub u64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "user#{}", self.0)
    }
}

/// Signed tick. Higher index means lower price.
pub type BandIndex = i64;

// BuyCollateral pays the borrowed asset and pushes the active band up (pump).
// SellCollateral pays collateral and pushes it down (dump).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    BuyCollateral,
    SellCollateral,
}

impl Direction {
    pub fn opposite(&self) -> Self {
        match self {
            Direction::BuyCollateral => Direction::SellCollateral,
            Direction::SellCollateral => Direction::BuyCollateral,
        }
    }
}

// 1.1: seconds since epoch. time only moves through explicit input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    pub fn from_secs(secs: u64) -> Self {
        Self(secs)
    }

    pub fn as_secs(&self) -> u64 {
        self.0
    }

    pub fn plus_secs(&self, secs: u64) -> Self {
        Self(self.0.saturating_add(secs))
    }

    pub fn seconds_since(&self, earlier: Timestamp) -> u64 {
        self.0.saturating_sub(earlier.0)
    }

    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt.timestamp().max(0) as u64)
    }

    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.0 as i64, 0).single()
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_datetime() {
            Some(dt) => write!(f, "{}", dt.format("%Y-%m-%d %H:%M:%S")),
            None => write!(f, "{}s", self.0),
        }
    }
}

// 1.2: external token description. the ledger works at 18 decimals and rescales
// native amounts only here, at the boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetSpec {
    pub symbol: String,
    pub decimals: u8,
}

impl AssetSpec {
    pub fn new(symbol: &str, decimals: u8) -> Self {
        Self {
            symbol: symbol.to_string(),
            decimals,
        }
    }

    /// Multiplier from native units to 18-decimal units.
    pub fn precision(&self) -> U256 {
        let exp = 18u32.saturating_sub(self.decimals as u32);
        U256::from(10u64.pow(exp))
    }

    pub fn to_wad(&self, native: U256) -> Result<U256, MathError> {
        native.checked_mul(self.precision()).ok_or(MathError::ArithmeticOverflow)
    }

    /// Floor. The remainder stays with the system.
    pub fn from_wad(&self, wad: U256) -> U256 {
        wad / self.precision()
    }

    pub fn from_wad_up(&self, wad: U256) -> U256 {
        let p = self.precision();
        let q = wad / p;
        if q * p == wad {
            q
        } else {
            q + U256::from(1u64)
        }
    }

    /// Whole tokens to native units, for fixtures and the simulation.
    pub fn units(&self, whole: u64) -> U256 {
        U256::from(whole) * U256::from(10u64).pow(U256::from(self.decimals))
    }
}

// 1.3: human decimals <-> WAD. config is written in Decimal, the ledger runs on WAD.
pub fn decimal_to_wad(value: Decimal) -> Option<U256> {
    if value.is_sign_negative() {
        return None;
    }
    let scaled = value.checked_mul(Decimal::from(1_000_000_000_000_000_000u64))?;
    scaled.trunc().to_u128().map(U256::from)
}

/// Lossy, for display. Values beyond Decimal range saturate.
pub fn wad_to_decimal(value: U256) -> Decimal {
    let mut v = value;
    let mut scale = 18u32;
    let limit = U256::from(1u128 << 95);
    while v >= limit && scale > 0 {
        v /= U256::from(10u64);
        scale -= 1;
    }
    if v >= limit {
        return Decimal::MAX;
    }
    Decimal::try_from_i128_with_scale(v.saturating_to::<u128>() as i128, scale).unwrap_or(Decimal::MAX)
}

/// Native token amount to a display Decimal.
pub fn native_to_decimal(asset: &AssetSpec, native: U256) -> Decimal {
    let wad = native.saturating_mul(asset.precision());
    wad_to_decimal(wad)
}
