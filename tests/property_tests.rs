//! Property-based tests for the market core.
//!
//! These tests verify invariants of loan sizing, trading and accrual hold under
//! random inputs.

use alloy_primitives::U256;
use llamma_core::math::{per_second, sqrt};
use llamma_core::*;
use proptest::prelude::*;
use std::sync::Arc;

const ALICE: UserId = UserId(1);
const T0: Timestamp = Timestamp::ZERO;

fn wad(x: u64) -> U256 {
    U256::from(x) * WAD
}

// Strategies for generating test data
fn collateral_strategy() -> impl Strategy<Value = U256> {
    (1u64..100_000u64).prop_map(|x| U256::from(x) * WAD / U256::from(1000u64)) // 0.001 to 100 WETH
}

fn bands_strategy() -> impl Strategy<Value = usize> {
    MIN_TICKS..=MAX_TICKS
}

fn market(apr: u64) -> (MarketState, Arc<ManualOracle>) {
    let oracle = Arc::new(ManualOracle::new(wad(3000)));
    let rate = per_second(U256::from(apr) * WAD / U256::from(100u64));
    let policy = Arc::new(ConstantRatePolicy::new(rate));
    let mut m = MarketState::new(MarketId(1), MarketConfig::weth_long(), oracle.clone(), policy, T0).unwrap();
    m.supply(T0, wad(10_000_000)).unwrap();
    (m, oracle)
}

proptest! {
    /// The largest quoted debt is accepted and one unit more is not.
    #[test]
    fn max_borrowable_is_tight(
        collateral in collateral_strategy(),
        n_bands in bands_strategy(),
    ) {
        let (m, _) = market(0);
        let max = m.max_borrowable(collateral, n_bands).unwrap();
        prop_assume!(!max.is_zero());

        let mut over = m.clone();
        prop_assert!(over.create_loan(T0, ALICE, collateral, max + U256::from(1u64), n_bands).is_err());

        let mut ok = m.clone();
        let receipt = ok.create_loan(T0, ALICE, collateral, max, n_bands).unwrap();
        prop_assert_eq!(receipt.n2 - receipt.n1 + 1, n_bands as i64);
    }

    /// New loans are placed strictly below the oracle price and start healthy.
    #[test]
    fn fresh_loan_is_healthy(
        collateral in collateral_strategy(),
        n_bands in bands_strategy(),
        pct in 1u64..=100u64,
    ) {
        let (mut m, _) = market(0);
        let max = m.max_borrowable(collateral, n_bands).unwrap();
        let debt = max * U256::from(pct) / U256::from(100u64);
        prop_assume!(!debt.is_zero());

        let receipt = m.create_loan(T0, ALICE, collateral, debt, n_bands).unwrap();
        prop_assert!(m.p_oracle_up(receipt.n1).unwrap() < m.price_oracle());
        prop_assert!(m.health(ALICE, false).unwrap() > 0);
        prop_assert!(m.health(ALICE, true).unwrap() > 0);
    }

    /// Collateral quoted by min_collateral carries the debt it was asked for.
    #[test]
    fn min_collateral_covers_debt(
        debt in 100u64..1_000_000u64,
        n_bands in bands_strategy(),
    ) {
        let (m, _) = market(0);
        let collateral = m.min_collateral(wad(debt), n_bands).unwrap();
        prop_assert!(m.max_borrowable(collateral, n_bands).unwrap() >= wad(debt));
    }

    /// Repaying a fresh loan returns the collateral, short by at most rounding.
    #[test]
    fn immediate_repay_returns_collateral(
        collateral in collateral_strategy(),
        n_bands in bands_strategy(),
        pct in 1u64..=100u64,
    ) {
        let (mut m, _) = market(5);
        let max = m.max_borrowable(collateral, n_bands).unwrap();
        let debt = max * U256::from(pct) / U256::from(100u64);
        prop_assume!(!debt.is_zero());
        m.create_loan(T0, ALICE, collateral, debt, n_bands).unwrap();

        let owed = m.debt(ALICE).unwrap();
        prop_assert_eq!(owed, debt);
        let r = m.repay(T0, ALICE, owed).unwrap();
        prop_assert!(r.closed);
        prop_assert!(r.collateral_returned <= collateral);
        prop_assert!(collateral - r.collateral_returned <= U256::from(100 * n_bands as u64));
        prop_assert!(r.borrowed_returned.is_zero());
        prop_assert_eq!(m.total_debt().unwrap(), U256::ZERO);
    }

    /// Buying collateral and selling it straight back never returns more than was paid.
    #[test]
    fn swap_round_trip_never_profits(
        collateral in 10u64..100u64,
        amount in 1u64..200_000u64,
    ) {
        let (mut m, _) = market(0);
        let max = m.max_borrowable(wad(collateral), 10).unwrap();
        m.create_loan(T0, ALICE, wad(collateral), max / U256::from(2u64), 10).unwrap();

        let bought = m.exchange(T0, Direction::BuyCollateral, wad(amount), U256::ZERO).unwrap();
        prop_assert!(bought.in_amount <= wad(amount));
        prop_assume!(!bought.out_amount.is_zero());
        let sold = m.exchange(T0, Direction::SellCollateral, bought.out_amount, U256::ZERO).unwrap();
        prop_assert!(sold.out_amount <= bought.in_amount);
    }

    /// A trade sized by get_amount_for_price moves the AMM toward the target.
    #[test]
    fn trade_to_price_moves_toward_target(
        collateral in 10u64..100u64,
        drop_bps in 50u64..1_500u64,
    ) {
        let (mut m, oracle) = market(0);
        let max = m.max_borrowable(wad(collateral), 10).unwrap();
        m.create_loan(T0, ALICE, wad(collateral), max, 10).unwrap();

        let target = wad(3000) * U256::from(10_000 - drop_bps) / U256::from(10_000u64);
        oracle.set_price(target);
        let before = m.get_p().unwrap();
        let (amount, direction) = m.get_amount_for_price(target).unwrap();
        prop_assume!(!amount.is_zero());
        m.exchange(T0, direction, amount, U256::ZERO).unwrap();
        let after = m.get_p().unwrap();

        let gap = |p: U256| p.max(target) - p.min(target);
        prop_assert!(gap(after) <= gap(before), "before {} after {} target {}", before, after, target);
    }

    /// Back-and-forth trades inside the active band move no band's borrowed share
    /// price by more than 5%.
    #[test]
    fn share_price_growth_is_bounded(
        offset in 2i64..8,
        trips in proptest::collection::vec((any::<bool>(), 1u64..=500u64), 1..12),
    ) {
        let (mut m, oracle) = market(0);
        let max = m.max_borrowable(wad(100), 10).unwrap();
        let loan = m.create_loan(T0, ALICE, wad(100), max / U256::from(2u64), 10).unwrap();

        // park the oracle mid-band so the loan is partly converted
        let n = loan.n1 + offset;
        let mid = sqrt(m.p_oracle_up(n).unwrap() * m.p_oracle_down(n).unwrap());
        oracle.set_price(mid);
        let (amount, direction) = m.get_amount_for_price(mid).unwrap();
        m.exchange(T0, direction, amount, U256::ZERO).unwrap();

        let before: Vec<(BandIndex, U256)> = (loan.n1..=loan.n2)
            .map(|n| (n, m.band(n)))
            .filter(|(_, band)| !band.borrowed.is_zero())
            .map(|(n, band)| (n, band.borrowed_share_price().unwrap()))
            .collect();
        prop_assert!(!before.is_empty());

        for (buy_first, bps) in trips {
            let band = m.band(m.active_band());
            let p = m.get_p().unwrap();
            let y_value = band.collateral * p / WAD;
            let size = band.borrowed.min(y_value) * U256::from(bps) / U256::from(10_000u64);
            if buy_first {
                if size.is_zero() {
                    continue;
                }
                let bought = m.exchange(T0, Direction::BuyCollateral, size, U256::ZERO).unwrap();
                if !bought.out_amount.is_zero() {
                    m.exchange(T0, Direction::SellCollateral, bought.out_amount, U256::ZERO).unwrap();
                }
            } else {
                let sell = size * WAD / p;
                if sell.is_zero() {
                    continue;
                }
                let sold = m.exchange(T0, Direction::SellCollateral, sell, U256::ZERO).unwrap();
                if !sold.out_amount.is_zero() {
                    m.exchange(T0, Direction::BuyCollateral, sold.out_amount, U256::ZERO).unwrap();
                }
            }
        }

        for (n, start) in before {
            let now = m.band(n).borrowed_share_price().unwrap();
            let diff = now.max(start) - now.min(start);
            prop_assert!(
                diff * U256::from(20u64) <= start,
                "band {} share price {} -> {}", n, start, now
            );
        }
    }

    /// Syncing twice to the same instant is the same as syncing once.
    #[test]
    fn sync_is_idempotent(
        apr in 0u64..100u64,
        secs in 1u64..(10 * SECONDS_PER_YEAR),
    ) {
        let (mut m, _) = market(apr);
        let max = m.max_borrowable(wad(10), 10).unwrap();
        m.create_loan(T0, ALICE, wad(10), max / U256::from(2u64), 10).unwrap();

        let later = T0.plus_secs(secs);
        m.sync(later).unwrap();
        let once = m.rates().clone();
        m.sync(later).unwrap();
        prop_assert_eq!(m.rates(), &once);

        // going back is ignored
        m.sync(T0).unwrap();
        prop_assert_eq!(m.rates(), &once);
        prop_assert!(once.rate_mul >= WAD);
    }

    /// Debt only grows with time.
    #[test]
    fn debt_monotonic_in_time(
        apr in 1u64..100u64,
        steps in proptest::collection::vec(1u64..(30 * 86_400), 1..10),
    ) {
        let (mut m, _) = market(apr);
        m.create_loan(T0, ALICE, wad(10), wad(10_000), 10).unwrap();
        let mut now = T0;
        let mut last = m.debt(ALICE).unwrap();
        for step in steps {
            now = now.plus_secs(step);
            m.sync(now).unwrap();
            let debt = m.debt(ALICE).unwrap();
            prop_assert!(debt >= last);
            last = debt;
        }
    }
}
