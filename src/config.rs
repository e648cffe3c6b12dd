// 7.0 config.rs: human-facing market settings. everything here is Decimal and whole
// token units; to_params() turns it into the WAD values the ledger runs on.
// 7.1 presets mirror the markets the simulation and tests drive.

use alloy_primitives::U256;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::amm::{AmmError, AmmParams};
use crate::math::{per_second, WAD};
use crate::policy::SemiLogPolicy;
use crate::types::{decimal_to_wad, AssetSpec};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Amplification {0} out of range")]
    InvalidAmplification(u32),

    #[error("Fee {0} out of range")]
    InvalidFee(Decimal),

    #[error("Invalid discounts: loan {loan}, liquidation {liquidation}")]
    InvalidDiscounts { loan: Decimal, liquidation: Decimal },

    #[error("Invalid APR bounds: min {min}, max {max}")]
    InvalidRates { min: Decimal, max: Decimal },

    #[error("Invalid collateral yield {0}")]
    InvalidCollateralYield(Decimal),

    #[error("Invalid borrow cap {0}")]
    InvalidBorrowCap(Decimal),

    #[error("{symbol} has {decimals} decimals, at most 18 supported")]
    InvalidDecimals { symbol: String, decimals: u8 },

    #[error(transparent)]
    Amm(#[from] AmmError),
}

/** 7.2: one lending market. collateral priced in the borrowed asset */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketConfig {
    pub name: String,
    pub collateral: AssetSpec,
    pub borrowed: AssetSpec,
    // Band width factor: each band is 1/A of the price
    pub a: u32,
    // Swap fee, stays in the band
    pub fee: Decimal,
    // Haircut applied when sizing new loans
    pub loan_discount: Decimal,
    // Haircut applied when judging health, smaller than loan_discount
    pub liquidation_discount: Decimal,
    pub min_apr: Decimal,
    pub max_apr: Decimal,
    // Whole borrowed-asset units. None means uncapped
    pub borrow_cap: Option<Decimal>,
    // Yield of interest-bearing collateral, zero for plain tokens
    pub collateral_apr: Decimal,
}

impl MarketConfig {
    pub fn weth_long() -> Self {
        Self {
            name: "WETH/crvUSD".to_string(),
            collateral: AssetSpec::new("WETH", 18),
            borrowed: AssetSpec::new("crvUSD", 18),
            a: 100,
            fee: dec!(0.006),
            loan_discount: dec!(0.09),
            liquidation_discount: dec!(0.06),
            min_apr: dec!(0.01),
            max_apr: dec!(0.30),
            borrow_cap: None,
            collateral_apr: Decimal::ZERO,
        }
    }

    /// Yield-bearing collateral with a tight range.
    pub fn sfrax_long() -> Self {
        Self {
            name: "sFRAX/crvUSD".to_string(),
            collateral: AssetSpec::new("sFRAX", 18),
            borrowed: AssetSpec::new("crvUSD", 18),
            a: 285,
            fee: dec!(0.002),
            loan_discount: dec!(0.013),
            liquidation_discount: dec!(0.010),
            min_apr: dec!(0.005),
            max_apr: dec!(0.25),
            borrow_cap: None,
            collateral_apr: dec!(0.05),
        }
    }

    /// Borrowed asset with 2 decimals, where debt rounding is visible.
    pub fn low_decimals() -> Self {
        Self {
            name: "WBTC/CENT".to_string(),
            collateral: AssetSpec::new("WBTC", 8),
            borrowed: AssetSpec::new("CENT", 2),
            a: 100,
            fee: dec!(0.006),
            loan_discount: dec!(0.09),
            liquidation_discount: dec!(0.06),
            min_apr: dec!(0.01),
            max_apr: dec!(0.30),
            borrow_cap: None,
            collateral_apr: Decimal::ZERO,
        }
    }

    pub fn with_borrow_cap(mut self, cap: Decimal) -> Self {
        self.borrow_cap = Some(cap);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(2..=10_000).contains(&self.a) {
            return Err(ConfigError::InvalidAmplification(self.a));
        }
        if self.fee < dec!(0.000000000001) || self.fee > dec!(0.1) {
            return Err(ConfigError::InvalidFee(self.fee));
        }
        let discounts_ok = self.liquidation_discount > Decimal::ZERO
            && self.liquidation_discount < self.loan_discount
            && self.loan_discount < dec!(0.5);
        if !discounts_ok {
            return Err(ConfigError::InvalidDiscounts {
                loan: self.loan_discount,
                liquidation: self.liquidation_discount,
            });
        }
        if self.min_apr.is_sign_negative() || self.min_apr > self.max_apr || self.max_apr > dec!(10) {
            return Err(ConfigError::InvalidRates {
                min: self.min_apr,
                max: self.max_apr,
            });
        }
        if self.collateral_apr.is_sign_negative() || self.collateral_apr > dec!(10) {
            return Err(ConfigError::InvalidCollateralYield(self.collateral_apr));
        }
        if let Some(cap) = self.borrow_cap {
            if cap.is_sign_negative() {
                return Err(ConfigError::InvalidBorrowCap(cap));
            }
        }
        for asset in [&self.collateral, &self.borrowed] {
            if asset.decimals > 18 {
                return Err(ConfigError::InvalidDecimals {
                    symbol: asset.symbol.clone(),
                    decimals: asset.decimals,
                });
            }
        }
        Ok(())
    }

    // 7.3: WAD view of the config. base_price is the oracle price at creation.
    pub fn to_params(&self, base_price: U256) -> Result<MarketParams, ConfigError> {
        self.validate()?;
        let fee = to_wad(self.fee)?;
        Ok(MarketParams {
            amm: AmmParams::new(self.a, fee, base_price)?,
            loan_discount: to_wad(self.loan_discount)?,
            liquidation_discount: to_wad(self.liquidation_discount)?,
            min_rate: per_second(to_wad(self.min_apr)?),
            max_rate: per_second(to_wad(self.max_apr)?),
            collateral_rate: per_second(to_wad(self.collateral_apr)?),
            borrow_cap: match self.borrow_cap {
                Some(cap) => to_wad(cap)?,
                None => U256::MAX,
            },
        })
    }

    /// Utilization-driven policy spanning the configured APR range.
    pub fn semi_log_policy(&self) -> Result<SemiLogPolicy, ConfigError> {
        let min = per_second(to_wad(self.min_apr)?).max(U256::from(1u64));
        let max = per_second(to_wad(self.max_apr)?).max(min);
        SemiLogPolicy::new(min, max).map_err(|_| ConfigError::InvalidRates {
            min: self.min_apr,
            max: self.max_apr,
        })
    }
}

fn to_wad(value: Decimal) -> Result<U256, ConfigError> {
    decimal_to_wad(value).ok_or(ConfigError::InvalidRates {
        min: value,
        max: value,
    })
}

/// Ledger-side parameters, fixed for the life of a market.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketParams {
    pub amm: AmmParams,
    pub loan_discount: U256,
    pub liquidation_discount: U256,
    /// Per-second, WAD.
    pub min_rate: U256,
    pub max_rate: U256,
    pub collateral_rate: U256,
    /// 18-decimal borrowed units.
    pub borrow_cap: U256,
}

impl MarketParams {
    pub fn clamp_rate(&self, rate: U256) -> U256 {
        rate.max(self.min_rate).min(self.max_rate)
    }

    pub fn liquidation_factor(&self) -> U256 {
        WAD - self.liquidation_discount
    }
}
