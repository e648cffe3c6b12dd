//! Liquidation detection and execution.

use super::core::{credit, debit, Engine, WalletSet};
use super::results::{EngineError, SweepResult};
use crate::events::{EventPayload, LiquidatedEvent};
use crate::liquidation::{LiquidationCandidate, LiquidationReceipt};
use crate::types::{MarketId, UserId};
use alloy_primitives::U256;

impl Engine {
    /// Underwater positions in a market, worst first.
    pub fn underwater(&self, market_id: MarketId) -> Result<Vec<LiquidationCandidate>, EngineError> {
        let market = self.market_ref(market_id)?;
        let mut found = market.users_to_liquidate().collect::<Result<Vec<_>, _>>()?;
        found.sort_by_key(|c| c.health);
        Ok(found)
    }

    pub fn liquidate(
        &mut self,
        liquidator: UserId,
        market_id: MarketId,
        owner: UserId,
        min_x: U256,
    ) -> Result<LiquidationReceipt, EngineError> {
        let receipt = self.run(market_id, &[liquidator, owner], "liquidate", |m, wallets, now| {
            let receipt = m.liquidate(now, liquidator, owner, min_x)?;
            settle(m.config.collateral.symbol.as_str(), m.config.borrowed.symbol.as_str(), wallets, &receipt)?;
            Ok(receipt)
        })?;
        self.emit_liquidation(market_id, &receipt);
        Ok(receipt)
    }

    /// Repays just enough to bring `owner` back to `target_health` (WAD). Resolves to
    /// a full close when nothing less will do. `max_debt_in` caps the payment.
    pub fn liquidate_partial(
        &mut self,
        liquidator: UserId,
        market_id: MarketId,
        owner: UserId,
        target_health: i128,
        max_debt_in: U256,
    ) -> Result<LiquidationReceipt, EngineError> {
        let receipt = self.run(market_id, &[liquidator, owner], "liquidate_partial", |m, wallets, now| {
            let receipt = m.liquidate_partial(now, liquidator, owner, target_health, max_debt_in)?;
            settle(m.config.collateral.symbol.as_str(), m.config.borrowed.symbol.as_str(), wallets, &receipt)?;
            Ok(receipt)
        })?;
        self.emit_liquidation(market_id, &receipt);
        Ok(receipt)
    }

    /// Fully liquidates every underwater position the liquidator can pay for,
    /// up to `max_sweep` of them.
    pub fn liquidate_underwater(&mut self, liquidator: UserId, market_id: MarketId) -> Result<SweepResult, EngineError> {
        let candidates = self.underwater(market_id)?;
        let mut result = SweepResult::default();
        for candidate in candidates.into_iter().take(self.config.max_sweep) {
            match self.liquidate(liquidator, market_id, candidate.owner, U256::ZERO) {
                Ok(receipt) => result.liquidated.push(receipt),
                Err(e) if e.is_recoverable() => result.skipped.push((candidate.owner, e)),
                Err(e) => return Err(e),
            }
        }
        Ok(result)
    }

    fn emit_liquidation(&mut self, market_id: MarketId, receipt: &LiquidationReceipt) {
        self.emit_event(EventPayload::Liquidated(LiquidatedEvent {
            market_id,
            owner: receipt.owner,
            liquidator: receipt.liquidator,
            outcome: receipt.outcome,
            debt_repaid: receipt.debt_repaid,
            collateral_out: receipt.collateral_out,
            liquidator_paid: receipt.liquidator_paid,
            borrower_refund: receipt.borrower_refund,
        }));
    }
}

fn settle(
    collateral: &str,
    borrowed: &str,
    wallets: &mut WalletSet,
    receipt: &LiquidationReceipt,
) -> Result<(), EngineError> {
    debit(wallets, receipt.liquidator, borrowed, receipt.liquidator_paid)?;
    credit(wallets, receipt.liquidator, collateral, receipt.collateral_out)?;
    credit(wallets, receipt.owner, borrowed, receipt.borrower_refund)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::config::MarketConfig;
    use crate::engine::{Engine, EngineConfig, EngineError};
    use crate::liquidation::LiquidationOutcome;
    use crate::math::WAD;
    use crate::oracle::ManualOracle;
    use crate::policy::ConstantRatePolicy;
    use crate::types::{MarketId, UserId};
    use crate::wallet::WalletError;
    use alloy_primitives::U256;
    use std::sync::Arc;

    const LENDER: UserId = UserId(1);
    const ALICE: UserId = UserId(2);
    const BOB: UserId = UserId(3);
    const KEEPER: UserId = UserId(9);

    fn wad(x: u64) -> U256 {
        U256::from(x) * WAD
    }

    fn setup() -> (Engine, MarketId, Arc<ManualOracle>) {
        let mut engine = Engine::new(EngineConfig::default());
        let oracle = Arc::new(ManualOracle::new(wad(3000)));
        let policy = Arc::new(ConstantRatePolicy::new(U256::ZERO));
        let id = engine.add_market(MarketConfig::weth_long(), oracle.clone(), policy).unwrap();
        engine.mint(LENDER, "crvUSD", wad(1_000_000)).unwrap();
        engine.supply(LENDER, id, wad(1_000_000)).unwrap();
        for user in [ALICE, BOB] {
            engine.mint(user, "WETH", wad(10)).unwrap();
        }
        (engine, id, oracle)
    }

    #[test]
    fn sweep_takes_only_underwater_positions() {
        let (mut engine, id, oracle) = setup();
        let max = engine.market(id).unwrap().max_borrowable(wad(10), 10).unwrap();
        engine.create_loan(ALICE, id, wad(10), max, 10).unwrap();
        engine.create_loan(BOB, id, wad(10), wad(5_000), 10).unwrap();
        oracle.set_price(wad(2500));

        let underwater = engine.underwater(id).unwrap();
        assert_eq!(underwater.len(), 1);
        assert_eq!(underwater[0].owner, ALICE);

        // keeper has no funds yet
        let sweep = engine.liquidate_underwater(KEEPER, id).unwrap();
        assert!(sweep.liquidated.is_empty());
        assert!(matches!(
            sweep.skipped[0].1,
            EngineError::Wallet(WalletError::InsufficientBalance { .. })
        ));
        assert!(engine.market(id).unwrap().has_loan(ALICE));

        engine.mint(KEEPER, "crvUSD", wad(100_000)).unwrap();
        let sweep = engine.liquidate_underwater(KEEPER, id).unwrap();
        assert_eq!(sweep.liquidated.len(), 1);
        let r = &sweep.liquidated[0];
        assert_eq!(r.outcome, LiquidationOutcome::Closed);
        assert_eq!(engine.balance(KEEPER, "WETH"), r.collateral_out);
        assert_eq!(engine.balance(KEEPER, "crvUSD"), wad(100_000) - r.liquidator_paid);
        assert!(!engine.market(id).unwrap().has_loan(ALICE));
        assert!(engine.market(id).unwrap().has_loan(BOB));
    }

    #[test]
    fn sweep_stops_at_configured_limit() {
        let (mut engine, id, oracle) = setup();
        engine.config.max_sweep = 1;
        for user in [ALICE, BOB] {
            let max = engine.market(id).unwrap().max_borrowable(wad(10), 10).unwrap();
            engine.create_loan(user, id, wad(10), max, 10).unwrap();
        }
        oracle.set_price(wad(2500));
        engine.mint(KEEPER, "crvUSD", wad(100_000)).unwrap();

        assert_eq!(engine.underwater(id).unwrap().len(), 2);
        let sweep = engine.liquidate_underwater(KEEPER, id).unwrap();
        assert_eq!(sweep.liquidated.len(), 1);
        let sweep = engine.liquidate_underwater(KEEPER, id).unwrap();
        assert_eq!(sweep.liquidated.len(), 1);
        assert_eq!(engine.market(id).unwrap().n_loans(), 0);
    }

    #[test]
    fn healthy_position_is_refused() {
        let (mut engine, id, _) = setup();
        engine.create_loan(BOB, id, wad(10), wad(5_000), 10).unwrap();
        engine.mint(KEEPER, "crvUSD", wad(100_000)).unwrap();
        let err = engine.liquidate(KEEPER, id, BOB, U256::ZERO).unwrap_err();
        assert!(matches!(err, EngineError::Market(_)));
        assert_eq!(engine.balance(KEEPER, "crvUSD"), wad(100_000));
    }
}
