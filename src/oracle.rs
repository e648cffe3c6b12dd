//! Price oracle collaborator.
//!
//! Prices are collateral in units of the borrowed asset, WAD. `price_w` is the
//! write-path read; a market is only created when both reads agree.

use alloy_primitives::U256;
use std::fmt;
use std::sync::RwLock;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OracleError {
    #[error("Oracle returned zero price")]
    ZeroPrice,

    #[error("Oracle reads disagree: price {price}, price_w {price_w}")]
    Mismatch { price: U256, price_w: U256 },
}

pub trait PriceOracle: Send + Sync + fmt::Debug {
    fn price(&self) -> U256;

    fn price_w(&self) -> U256;
}

/// Checks done once at market creation.
pub fn validate_oracle(oracle: &dyn PriceOracle) -> Result<U256, OracleError> {
    let price = oracle.price();
    let price_w = oracle.price_w();
    if price.is_zero() {
        return Err(OracleError::ZeroPrice);
    }
    if price != price_w {
        return Err(OracleError::Mismatch { price, price_w });
    }
    Ok(price)
}

/// Oracle whose price is set by hand.
#[derive(Debug)]
pub struct ManualOracle {
    price: RwLock<U256>,
    price_w: RwLock<U256>,
}

impl ManualOracle {
    pub fn new(price: U256) -> Self {
        Self {
            price: RwLock::new(price),
            price_w: RwLock::new(price),
        }
    }

    /// Oracle whose two reads diverge.
    pub fn mismatched(price: U256, price_w: U256) -> Self {
        Self {
            price: RwLock::new(price),
            price_w: RwLock::new(price_w),
        }
    }

    pub fn set_price(&self, price: U256) {
        for lock in [&self.price, &self.price_w] {
            match lock.write() {
                Ok(mut guard) => *guard = price,
                Err(poisoned) => *poisoned.into_inner() = price,
            }
        }
    }

    fn read(lock: &RwLock<U256>) -> U256 {
        match lock.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

impl PriceOracle for ManualOracle {
    fn price(&self) -> U256 {
        Self::read(&self.price)
    }

    fn price_w(&self) -> U256 {
        Self::read(&self.price_w)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::WAD;

    #[test]
    fn validation() {
        let ok = ManualOracle::new(WAD * U256::from(3000u64));
        assert_eq!(validate_oracle(&ok).unwrap(), WAD * U256::from(3000u64));

        let zero = ManualOracle::new(U256::ZERO);
        assert_eq!(validate_oracle(&zero), Err(OracleError::ZeroPrice));

        let skewed = ManualOracle::mismatched(WAD, WAD + U256::from(1u64));
        assert!(matches!(validate_oracle(&skewed), Err(OracleError::Mismatch { .. })));
    }

    #[test]
    fn set_price_moves_both_reads() {
        let oracle = ManualOracle::mismatched(WAD, WAD * U256::from(2u64));
        oracle.set_price(WAD * U256::from(5u64));
        assert_eq!(oracle.price(), oracle.price_w());
    }
}
