//! Lender deposits and fee collection.

use super::core::{credit, debit, ensure, Engine};
use super::results::EngineError;
use crate::events::{EventPayload, FeesCollectedEvent, SupplyEvent};
use crate::types::{MarketId, UserId};
use alloy_primitives::U256;

impl Engine {
    pub fn supplied_by(&self, market_id: MarketId, user: UserId) -> U256 {
        self.deposits.get(&(market_id, user)).copied().unwrap_or_default()
    }

    /// Moves borrowed asset from the lender's wallet into the market's pool.
    pub fn supply(&mut self, user: UserId, market_id: MarketId, amount: U256) -> Result<(), EngineError> {
        let available = self.run(market_id, &[user], "supply", |m, wallets, now| {
            let symbol = m.config.borrowed.symbol.clone();
            ensure(wallets, user, &symbol, amount)?;
            m.supply(now, amount)?;
            debit(wallets, user, &symbol, amount)?;
            Ok(m.available_balance())
        })?;

        let deposit = self.deposits.entry((market_id, user)).or_default();
        *deposit = deposit.saturating_add(amount);
        self.emit_event(EventPayload::Supplied(SupplyEvent {
            market_id,
            user,
            amount,
            available,
        }));
        Ok(())
    }

    // limited by the lender's own principal and by the pool's idle cash
    pub fn withdraw_supply(&mut self, user: UserId, market_id: MarketId, amount: U256) -> Result<(), EngineError> {
        let supplied = self.supplied_by(market_id, user);
        let available = self.run(market_id, &[user], "withdraw_supply", |m, wallets, now| {
            if amount > supplied {
                return Err(EngineError::SupplyExceeded {
                    user,
                    requested: amount,
                    supplied,
                });
            }
            m.withdraw_supply(now, amount)?;
            credit(wallets, user, &m.config.borrowed.symbol, amount)?;
            Ok(m.available_balance())
        })?;

        self.deposits.insert((market_id, user), supplied - amount);
        self.emit_event(EventPayload::SupplyWithdrawn(SupplyEvent {
            market_id,
            user,
            amount,
            available,
        }));
        Ok(())
    }

    /// Books accrued interest as issued debt. No tokens move.
    pub fn collect_fees(&mut self, market_id: MarketId) -> Result<U256, EngineError> {
        let (amount, total_issued) = self.run(market_id, &[], "collect_fees", |m, _, now| {
            let amount = m.collect_fees(now)?;
            Ok((amount, m.total_issued()))
        })?;
        self.emit_event(EventPayload::FeesCollected(FeesCollectedEvent {
            market_id,
            amount,
            total_issued,
        }));
        Ok(amount)
    }
}

#[cfg(test)]
mod tests {
    use crate::config::MarketConfig;
    use crate::engine::{Engine, EngineConfig, EngineError};
    use crate::market::MarketError;
    use crate::math::WAD;
    use crate::oracle::ManualOracle;
    use crate::policy::ConstantRatePolicy;
    use crate::types::UserId;
    use crate::wallet::WalletError;
    use alloy_primitives::U256;
    use std::sync::Arc;

    const LENDER: UserId = UserId(1);

    fn wad(x: u64) -> U256 {
        U256::from(x) * WAD
    }

    #[test]
    fn supply_then_withdraw() {
        let mut engine = Engine::new(EngineConfig::default());
        let oracle = Arc::new(ManualOracle::new(wad(3000)));
        let policy = Arc::new(ConstantRatePolicy::new(U256::ZERO));
        let id = engine.add_market(MarketConfig::weth_long(), oracle, policy).unwrap();
        engine.mint(LENDER, "crvUSD", wad(1_000)).unwrap();

        engine.supply(LENDER, id, wad(600)).unwrap();
        assert_eq!(engine.balance(LENDER, "crvUSD"), wad(400));
        assert_eq!(engine.supplied_by(id, LENDER), wad(600));
        assert_eq!(engine.market(id).unwrap().available_balance(), wad(600));

        let err = engine.supply(LENDER, id, wad(500)).unwrap_err();
        assert!(matches!(err, EngineError::Wallet(WalletError::InsufficientBalance { .. })));
        assert_eq!(engine.market(id).unwrap().available_balance(), wad(600));

        let err = engine.withdraw_supply(LENDER, id, wad(700)).unwrap_err();
        assert!(matches!(err, EngineError::SupplyExceeded { .. }));

        engine.withdraw_supply(LENDER, id, wad(100)).unwrap();
        assert_eq!(engine.balance(LENDER, "crvUSD"), wad(500));
        assert_eq!(engine.supplied_by(id, LENDER), wad(500));

        let err = engine.supply(LENDER, id, U256::ZERO).unwrap_err();
        assert_eq!(err, EngineError::Market(MarketError::ZeroAmount));
    }
}
