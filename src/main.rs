//! Band lending AMM simulation.
//!
//! Runs a loan through its whole life: borrowing, soft liquidation as the price
//! slides through the bands, interest accrual, and hard and partial liquidation.

use alloy_primitives::U256;
use llamma_core::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;

const LENDER: UserId = UserId(1);
const ALICE: UserId = UserId(2);
const BOB: UserId = UserId(3);
const ARB: UserId = UserId(10);
const KEEPER: UserId = UserId(11);

const DAY: u64 = 86_400;

fn main() -> Result<(), EngineError> {
    init_tracing();

    println!("Band Lending AMM Simulation");
    println!("Single Collateral, Soft Liquidation, Full Lifecycle\n");

    scenario_1_loan_lifecycle()?;
    scenario_2_soft_liquidation()?;
    scenario_3_interest_and_fees()?;
    scenario_4_hard_liquidation()?;
    scenario_5_partial_liquidation()?;
    scenario_6_low_decimals()?;

    println!("\nAll simulations completed successfully.");
    Ok(())
}

fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn wad(x: u64) -> U256 {
    U256::from(x) * WAD
}

fn market_of(engine: &Engine, id: MarketId) -> Result<&MarketState, EngineError> {
    engine.market(id).ok_or(EngineError::MarketNotFound(id))
}

fn health_pct(health: i128) -> Decimal {
    Decimal::try_from_i128_with_scale(health, 16)
        .unwrap_or_default()
        .round_dp(3)
}

/// Engine with one funded WETH market at $3,000.
fn weth_market(config: MarketConfig) -> Result<(Engine, MarketId, Arc<ManualOracle>), EngineError> {
    let mut engine = Engine::new(EngineConfig::default());
    let oracle = Arc::new(ManualOracle::new(wad(3000)));
    let id = engine.add_market_with_default_policy(config, oracle.clone())?;
    engine.mint(LENDER, "crvUSD", wad(10_000_000))?;
    engine.supply(LENDER, id, wad(10_000_000))?;
    Ok((engine, id, oracle))
}

fn print_position(engine: &Engine, id: MarketId, user: UserId, label: &str) -> Result<(), EngineError> {
    let market = market_of(engine, id)?;
    let state = market.user_state(user)?;
    let health = market.health(user, true)?;
    println!(
        "  {}: {} {} + {} {}, debt {} {}, health {}%",
        label,
        native_to_decimal(market.collateral_asset(), state.collateral).round_dp(4),
        market.collateral_asset().symbol,
        native_to_decimal(market.borrowed_asset(), state.borrowed).round_dp(2),
        market.borrowed_asset().symbol,
        native_to_decimal(market.borrowed_asset(), state.debt).round_dp(2),
        market.borrowed_asset().symbol,
        health_pct(health),
    );
    Ok(())
}

/// Borrow, let interest run, repay in full.
fn scenario_1_loan_lifecycle() -> Result<(), EngineError> {
    println!("Scenario 1: Loan Lifecycle\n");

    let (mut engine, id, _) = weth_market(MarketConfig::weth_long())?;
    engine.mint(ALICE, "WETH", wad(10))?;

    let max = market_of(&engine, id)?.max_borrowable(wad(10), 10)?;
    let debt = max * U256::from(8u64) / U256::from(10u64);
    let receipt = engine.create_loan(ALICE, id, wad(10), debt, 10)?;

    println!("  Alice locks 10 WETH across 10 bands");
    println!("  Max borrowable: {} crvUSD, borrowed 80%", wad_to_decimal(max).round_dp(2));
    println!("  Bands {}..{}", receipt.n1, receipt.n2);
    print_position(&engine, id, ALICE, "Alice")?;

    engine.advance_time(30 * DAY)?;
    print_position(&engine, id, ALICE, "After 30 days")?;

    // interest owed on top of what was borrowed
    engine.mint(ALICE, "crvUSD", wad(1_000))?;
    let closed = engine.repay_all(ALICE, id)?;
    println!(
        "  Repaid {} crvUSD, closed: {}",
        wad_to_decimal(closed.repaid).round_dp(2),
        closed.closed
    );
    println!(
        "  Alice wallet: {} WETH, {} crvUSD\n",
        wad_to_decimal(engine.balance(ALICE, "WETH")).round_dp(4),
        wad_to_decimal(engine.balance(ALICE, "crvUSD")).round_dp(2)
    );
    Ok(())
}

/// Oracle slides into the loan's bands and back; arbitrage converts the collateral.
fn scenario_2_soft_liquidation() -> Result<(), EngineError> {
    println!("Scenario 2: Soft Liquidation\n");

    let (mut engine, id, oracle) = weth_market(MarketConfig::weth_long())?;
    engine.mint(ALICE, "WETH", wad(10))?;
    engine.mint(ARB, "crvUSD", wad(1_000_000))?;
    engine.mint(ARB, "WETH", wad(1_000))?;
    engine.create_loan(ALICE, id, wad(10), wad(22_000), 10)?;
    print_position(&engine, id, ALICE, "$3000")?;

    for price in [2900u64, 2800, 2700, 2800, 2900, 3000] {
        oracle.set_price(wad(price));
        engine.advance_time(3600)?;
        let trade = engine.trade_to_price(ARB, id, wad(price))?;
        if let Some(t) = trade {
            println!(
                "  Arbitrage {:?}: in {}, out {}, active band {}",
                t.direction,
                wad_to_decimal(t.in_amount).round_dp(4),
                wad_to_decimal(t.out_amount).round_dp(4),
                t.active_band
            );
        }
        print_position(&engine, id, ALICE, &format!("${}", price))?;
    }
    println!();
    Ok(())
}

/// A year of interest across several borrowers, then fee collection.
fn scenario_3_interest_and_fees() -> Result<(), EngineError> {
    println!("Scenario 3: Interest Accrual\n");

    let (mut engine, id, _) = weth_market(MarketConfig::weth_long())?;
    for (i, user) in (20..30u64).map(UserId).enumerate() {
        engine.mint(user, "WETH", wad(10))?;
        engine.create_loan(user, id, wad(10), wad(5_000 + i as u64 * 1_000), 10 + i)?;
    }

    let market = market_of(&engine, id)?;
    println!(
        "  10 loans, utilization {}%, borrow APR {}%",
        (wad_to_decimal(market.utilization()?) * dec!(100)).round_dp(3),
        (wad_to_decimal(market.borrow_apr()) * dec!(100)).round_dp(3)
    );

    engine.advance_time(365 * DAY)?;
    let market = market_of(&engine, id)?;
    println!(
        "  After one year: total debt {}, issued {}",
        wad_to_decimal(market.total_debt()?).round_dp(2),
        wad_to_decimal(market.total_issued()).round_dp(2)
    );

    let fees = engine.collect_fees(id)?;
    let market = market_of(&engine, id)?;
    println!(
        "  Collected {} crvUSD, total debt == issued: {}\n",
        wad_to_decimal(fees).round_dp(2),
        market.total_debt()? == market.total_issued()
    );
    Ok(())
}

/// Crash past the bands and sweep the underwater positions.
fn scenario_4_hard_liquidation() -> Result<(), EngineError> {
    println!("Scenario 4: Hard Liquidation\n");

    let (mut engine, id, oracle) = weth_market(MarketConfig::weth_long())?;
    engine.mint(KEEPER, "crvUSD", wad(1_000_000))?;
    for (user, debt) in [(ALICE, 24_000u64), (BOB, 12_000)] {
        engine.mint(user, "WETH", wad(10))?;
        engine.create_loan(user, id, wad(10), wad(debt), 10)?;
    }
    println!("  Alice borrows 24,000 and Bob 12,000 against 10 WETH each");

    for price in [2800u64, 2500, 2200, 1800] {
        oracle.set_price(wad(price));
        let sweep = engine.liquidate_underwater(KEEPER, id)?;
        if sweep.liquidated.is_empty() {
            println!("  ${}: no liquidations", price);
        }
        for r in &sweep.liquidated {
            let name = if r.owner == ALICE { "Alice" } else { "Bob" };
            println!(
                "  ${}: {} liquidated, keeper paid {} crvUSD for {} WETH",
                price,
                name,
                wad_to_decimal(r.liquidator_paid).round_dp(2),
                wad_to_decimal(r.collateral_out).round_dp(4)
            );
        }
    }
    println!("  Events generated: {}\n", engine.events().len());
    Ok(())
}

/// Repair a slightly underwater position instead of closing it.
fn scenario_5_partial_liquidation() -> Result<(), EngineError> {
    println!("Scenario 5: Partial Liquidation\n");

    let mut config = MarketConfig::weth_long();
    config.loan_discount = dec!(0.061);
    config.liquidation_discount = dec!(0.06);
    let (mut engine, id, oracle) = weth_market(config)?;
    engine.mint(ALICE, "WETH", wad(10))?;
    engine.mint(KEEPER, "crvUSD", wad(1_000_000))?;

    let max = market_of(&engine, id)?.max_borrowable(wad(10), 10)?;
    engine.create_loan(ALICE, id, wad(10), max, 10)?;

    let mut price = wad(3000);
    loop {
        price = price * U256::from(999u64) / U256::from(1000u64);
        oracle.set_price(price);
        let health = market_of(&engine, id)?.health(ALICE, true)?;
        if health < 0 {
            break;
        }
    }
    println!("  Oracle at ${}", wad_to_decimal(price).round_dp(2));
    print_position(&engine, id, ALICE, "Before")?;

    let r = engine.liquidate_partial(KEEPER, id, ALICE, WAD_I128 / 200, wad(1_000_000))?;
    println!(
        "  {:?}: repaid {} crvUSD, keeper took {} WETH",
        r.outcome,
        wad_to_decimal(r.debt_repaid).round_dp(2),
        wad_to_decimal(r.collateral_out).round_dp(4)
    );
    print_position(&engine, id, ALICE, "After")?;
    println!();
    Ok(())
}

/// Two-decimal borrowed asset: debt is quantized to whole cents.
fn scenario_6_low_decimals() -> Result<(), EngineError> {
    println!("Scenario 6: Low Decimal Borrowed Asset\n");

    let config = MarketConfig::low_decimals();
    let btc = config.collateral.clone();
    let cents = config.borrowed.clone();
    let mut engine = Engine::new(EngineConfig::default());
    let oracle = Arc::new(ManualOracle::new(wad(60_000)));
    let id = engine.add_market_with_default_policy(config, oracle)?;
    engine.mint(LENDER, "CENT", cents.units(10_000_000))?;
    engine.supply(LENDER, id, cents.units(10_000_000))?;

    for user in [ALICE, BOB] {
        engine.mint(user, "WBTC", btc.units(1))?;
        engine.create_loan(user, id, btc.units(1), cents.units(30_000) + U256::from(37u64), 10)?;
    }
    engine.advance_time(7 * DAY)?;

    let market = market_of(&engine, id)?;
    let alice = market.debt(ALICE)?;
    let bob = market.debt(BOB)?;
    println!(
        "  Alice owes {} CENT, Bob {} CENT, total {}",
        native_to_decimal(&cents, alice),
        native_to_decimal(&cents, bob),
        native_to_decimal(&cents, market.total_debt()?)
    );
    println!(
        "  Sum of loans covers the total: {}",
        alice + bob >= market.total_debt()?
    );
    println!(
        "  Boundary dust held: {} (18-decimal units)\n",
        market.boundary_dust().borrowed
    );
    Ok(())
}
