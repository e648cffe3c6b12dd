//! Monetary policy.
//!
//! The borrow rate is pulled from a policy at every transition and applied by the
//! accrual layer until the next one. Policies see only utilization.

use alloy_primitives::U256;
use std::fmt;
use std::sync::RwLock;

use crate::math::{exp_wad, ln_wad, mul_div_down, MathError, WAD};

pub trait MonetaryPolicy: Send + Sync + fmt::Debug {
    /// Per-second borrow rate (WAD) at `utilization` (WAD, 0..=1).
    fn rate(&self, utilization: U256) -> Result<U256, MathError>;
}

/// Fixed rate, adjustable from tests and simulations.
#[derive(Debug)]
pub struct ConstantRatePolicy {
    rate: RwLock<U256>,
}

impl ConstantRatePolicy {
    pub fn new(rate: U256) -> Self {
        Self {
            rate: RwLock::new(rate),
        }
    }

    pub fn set_rate(&self, rate: U256) {
        match self.rate.write() {
            Ok(mut guard) => *guard = rate,
            Err(poisoned) => *poisoned.into_inner() = rate,
        }
    }
}

impl MonetaryPolicy for ConstantRatePolicy {
    fn rate(&self, _utilization: U256) -> Result<U256, MathError> {
        Ok(match self.rate.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        })
    }
}

// 5.2: rate = min_rate * (max_rate / min_rate) ^ utilization, log-linear between bounds.
#[derive(Debug, Clone)]
pub struct SemiLogPolicy {
    pub min_rate: U256,
    pub max_rate: U256,
    log_ratio: i128,
}

impl SemiLogPolicy {
    pub fn new(min_rate: U256, max_rate: U256) -> Result<Self, MathError> {
        if min_rate.is_zero() || max_rate < min_rate {
            return Err(MathError::LogOfZero);
        }
        let log_ratio = ln_wad(mul_div_down(max_rate, WAD, min_rate)?)?;
        Ok(Self {
            min_rate,
            max_rate,
            log_ratio,
        })
    }
}

impl MonetaryPolicy for SemiLogPolicy {
    fn rate(&self, utilization: U256) -> Result<U256, MathError> {
        let u = utilization.min(WAD).saturating_to::<u128>() as i128;
        let exponent = u * self.log_ratio / crate::math::WAD_I128;
        let rate = mul_div_down(self.min_rate, exp_wad(exponent)?, WAD)?;
        Ok(rate.min(self.max_rate))
    }
}
