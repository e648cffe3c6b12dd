//! Swaps against the band AMM.

use super::core::{credit, debit, ensure, Engine};
use super::results::EngineError;
use crate::events::{EventPayload, ExchangeEvent};
use crate::market::SwapReceipt;
use crate::types::{Direction, MarketId, UserId};
use alloy_primitives::U256;

impl Engine {
    /// Pays `amount_in` of the input asset, receives at least `min_amount_out`.
    /// The AMM may take less than `amount_in` when it runs out of liquidity.
    pub fn exchange(
        &mut self,
        user: UserId,
        market_id: MarketId,
        direction: Direction,
        amount_in: U256,
        min_amount_out: U256,
    ) -> Result<SwapReceipt, EngineError> {
        let receipt = self.run(market_id, &[user], "exchange", |m, wallets, now| {
            let (in_sym, out_sym) = match direction {
                Direction::BuyCollateral => (m.config.borrowed.symbol.clone(), m.config.collateral.symbol.clone()),
                Direction::SellCollateral => (m.config.collateral.symbol.clone(), m.config.borrowed.symbol.clone()),
            };
            ensure(wallets, user, &in_sym, amount_in)?;
            let receipt = m.exchange(now, direction, amount_in, min_amount_out)?;
            debit(wallets, user, &in_sym, receipt.in_amount)?;
            credit(wallets, user, &out_sym, receipt.out_amount)?;
            Ok(receipt)
        })?;
        self.emit_event(EventPayload::Exchange(ExchangeEvent {
            market_id,
            trader: user,
            direction,
            amount_in: receipt.in_amount,
            amount_out: receipt.out_amount,
            active_band: receipt.active_band,
        }));
        Ok(receipt)
    }

    /// Arbitrage the AMM toward `target` (WAD). None when it is already there.
    pub fn trade_to_price(
        &mut self,
        user: UserId,
        market_id: MarketId,
        target: U256,
    ) -> Result<Option<SwapReceipt>, EngineError> {
        let (amount, direction) = self.market_ref(market_id)?.get_amount_for_price(target)?;
        if amount.is_zero() {
            return Ok(None);
        }
        self.exchange(user, market_id, direction, amount, U256::ZERO).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use crate::config::MarketConfig;
    use crate::engine::{Engine, EngineConfig};
    use crate::math::WAD;
    use crate::oracle::ManualOracle;
    use crate::policy::ConstantRatePolicy;
    use crate::types::{Direction, UserId};
    use alloy_primitives::U256;
    use std::sync::Arc;

    const LENDER: UserId = UserId(1);
    const ALICE: UserId = UserId(2);
    const TRADER: UserId = UserId(3);

    fn wad(x: u64) -> U256 {
        U256::from(x) * WAD
    }

    #[test]
    fn pump_converts_collateral_and_pays_trader() {
        let mut engine = Engine::new(EngineConfig::default());
        let oracle = Arc::new(ManualOracle::new(wad(3000)));
        let policy = Arc::new(ConstantRatePolicy::new(U256::ZERO));
        let id = engine.add_market(MarketConfig::weth_long(), oracle, policy).unwrap();
        engine.mint(LENDER, "crvUSD", wad(1_000_000)).unwrap();
        engine.supply(LENDER, id, wad(1_000_000)).unwrap();
        engine.mint(ALICE, "WETH", wad(10)).unwrap();
        let max = engine.market(id).unwrap().max_borrowable(wad(10), 10).unwrap();
        engine.create_loan(ALICE, id, wad(10), max, 10).unwrap();

        // buying collateral walks up into the loan bands and converts part of them
        engine.mint(TRADER, "crvUSD", wad(100_000)).unwrap();
        let r = engine
            .exchange(TRADER, id, Direction::BuyCollateral, wad(5_000), U256::ZERO)
            .unwrap();
        assert!(r.out_amount > U256::ZERO);
        assert_eq!(engine.balance(TRADER, "crvUSD"), wad(100_000) - r.in_amount);
        assert_eq!(engine.balance(TRADER, "WETH"), r.out_amount);

        // selling it back never returns more than was paid
        let back = engine
            .exchange(TRADER, id, Direction::SellCollateral, r.out_amount, U256::ZERO)
            .unwrap();
        assert!(back.out_amount <= r.in_amount);
    }

    #[test]
    fn trade_to_price_is_noop_at_target() {
        let mut engine = Engine::new(EngineConfig::default());
        let oracle = Arc::new(ManualOracle::new(wad(3000)));
        let policy = Arc::new(ConstantRatePolicy::new(U256::ZERO));
        let id = engine.add_market(MarketConfig::weth_long(), oracle, policy).unwrap();
        let p = engine.market(id).unwrap().get_p().unwrap();
        assert!(engine.trade_to_price(TRADER, id, p).unwrap().is_none());
    }
}
