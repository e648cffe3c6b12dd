// 5.0 accrual.rs: continuously compounded multipliers. rate_mul scales every loan's
// debt, collateral_rate_mul scales raw collateral of yield-bearing markets.
// sync() is the only way they move, and it is a no-op when time has not advanced.

use alloy_primitives::U256;
use serde::{Deserialize, Serialize};

use crate::math::{exp_approx, mul_div_down, MathError, WAD};
use crate::types::Timestamp;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateState {
    /// Global debt multiplier, WAD. Never decreases.
    pub rate_mul: U256,
    /// Per-second borrow rate applied from `last_sync` on, WAD.
    pub rate: U256,
    pub collateral_rate_mul: U256,
    /// Per-second collateral yield, zero for plain collateral.
    pub collateral_rate: U256,
    pub last_sync: Timestamp,
}

impl RateState {
    pub fn new(now: Timestamp, collateral_rate: U256) -> Self {
        Self {
            rate_mul: WAD,
            rate: U256::ZERO,
            collateral_rate_mul: WAD,
            collateral_rate,
            last_sync: now,
        }
    }

    // 5.1: bring both multipliers up to `now`. earlier timestamps are ignored.
    pub fn sync(&mut self, now: Timestamp) -> Result<(), MathError> {
        if now <= self.last_sync {
            return Ok(());
        }
        let elapsed = now.seconds_since(self.last_sync);
        self.rate_mul = mul_div_down(self.rate_mul, exp_approx(self.rate, elapsed)?, WAD)?;
        if !self.collateral_rate.is_zero() {
            self.collateral_rate_mul =
                mul_div_down(self.collateral_rate_mul, exp_approx(self.collateral_rate, elapsed)?, WAD)?;
        }
        self.last_sync = now;
        Ok(())
    }

    /// Rate for the next interval. Takes effect from the last sync point.
    pub fn set_rate(&mut self, rate: U256) {
        self.rate = rate;
    }

    /// Multipliers as they would be after `sync(now)`, without touching state.
    pub fn projected(&self, now: Timestamp) -> Result<RateState, MathError> {
        let mut copy = self.clone();
        copy.sync(now)?;
        Ok(copy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::{per_second, SECONDS_PER_YEAR};

    fn ten_percent() -> U256 {
        per_second(WAD / U256::from(10u64))
    }

    #[test]
    fn sync_is_idempotent() {
        let mut once = RateState::new(Timestamp::ZERO, U256::ZERO);
        once.set_rate(ten_percent());
        let mut twice = once.clone();

        once.sync(Timestamp::from_secs(86_400)).unwrap();
        twice.sync(Timestamp::from_secs(86_400)).unwrap();
        twice.sync(Timestamp::from_secs(86_400)).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn sync_ignores_past() {
        let mut state = RateState::new(Timestamp::from_secs(1000), U256::ZERO);
        state.set_rate(ten_percent());
        state.sync(Timestamp::from_secs(10)).unwrap();
        assert_eq!(state.rate_mul, WAD);
        assert_eq!(state.last_sync, Timestamp::from_secs(1000));
    }

    #[test]
    fn one_year_at_ten_percent() {
        let mut state = RateState::new(Timestamp::ZERO, U256::ZERO);
        state.set_rate(ten_percent());
        state.sync(Timestamp::from_secs(SECONDS_PER_YEAR)).unwrap();
        let got = crate::math::wad_to_f64(state.rate_mul);
        assert!((got - 0.1f64.exp()).abs() < 1e-9);
        assert_eq!(state.collateral_rate_mul, WAD);
    }

    #[test]
    fn collateral_multiplier_compounds_when_configured() {
        let mut state = RateState::new(Timestamp::ZERO, per_second(WAD / U256::from(20u64)));
        state.sync(Timestamp::from_secs(SECONDS_PER_YEAR)).unwrap();
        assert!(state.collateral_rate_mul > WAD);
        // zero borrow rate leaves the debt multiplier alone
        assert_eq!(state.rate_mul, WAD);
    }

    #[test]
    fn projection_matches_sync() {
        let mut state = RateState::new(Timestamp::ZERO, U256::ZERO);
        state.set_rate(ten_percent());
        let projected = state.projected(Timestamp::from_secs(5000)).unwrap();
        state.sync(Timestamp::from_secs(5000)).unwrap();
        assert_eq!(projected, state);
    }
}
