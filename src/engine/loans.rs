//! Borrower calls: open, adjust, repay.

use super::core::{credit, debit, ensure, Engine};
use super::results::EngineError;
use crate::events::{EventPayload, LoanEvent, RepaidEvent};
use crate::loans::{LoanReceipt, RepayReceipt};
use crate::types::{MarketId, UserId};
use alloy_primitives::U256;

impl Engine {
    /// Locks `collateral` from the borrower's wallet and pays out `debt`.
    pub fn create_loan(
        &mut self,
        user: UserId,
        market_id: MarketId,
        collateral: U256,
        debt: U256,
        n_bands: usize,
    ) -> Result<LoanReceipt, EngineError> {
        let receipt = self.run(market_id, &[user], "create_loan", |m, wallets, now| {
            let (c_sym, b_sym) = (m.config.collateral.symbol.clone(), m.config.borrowed.symbol.clone());
            ensure(wallets, user, &c_sym, collateral)?;
            let receipt = m.create_loan(now, user, collateral, debt, n_bands)?;
            debit(wallets, user, &c_sym, collateral)?;
            credit(wallets, user, &b_sym, debt)?;
            Ok(receipt)
        })?;
        self.emit_event(EventPayload::LoanCreated(loan_event(market_id, &receipt, collateral, debt)));
        Ok(receipt)
    }

    pub fn repay(&mut self, user: UserId, market_id: MarketId, amount: U256) -> Result<RepayReceipt, EngineError> {
        let receipt = self.run(market_id, &[user], "repay", |m, wallets, now| {
            let (c_sym, b_sym) = (m.config.collateral.symbol.clone(), m.config.borrowed.symbol.clone());
            ensure(wallets, user, &b_sym, amount)?;
            let receipt = m.repay(now, user, amount)?;
            debit(wallets, user, &b_sym, amount)?;
            credit(wallets, user, &c_sym, receipt.collateral_returned)?;
            credit(wallets, user, &b_sym, receipt.borrowed_returned)?;
            Ok(receipt)
        })?;
        self.emit_event(EventPayload::Repaid(RepaidEvent {
            market_id,
            owner: user,
            amount,
            remaining_debt: receipt.remaining_debt,
            collateral_returned: receipt.collateral_returned,
            borrowed_returned: receipt.borrowed_returned,
            closed: receipt.closed,
        }));
        Ok(receipt)
    }

    /// Repays the whole debt as of the current clock and closes the position.
    pub fn repay_all(&mut self, user: UserId, market_id: MarketId) -> Result<RepayReceipt, EngineError> {
        let now = self.current_time;
        let mut market = self.market_ref(market_id)?.clone();
        market.sync(now)?;
        let debt = market.debt(user)?;
        self.repay(user, market_id, debt)
    }

    pub fn add_collateral(&mut self, user: UserId, market_id: MarketId, amount: U256) -> Result<LoanReceipt, EngineError> {
        let receipt = self.run(market_id, &[user], "add_collateral", |m, wallets, now| {
            let c_sym = m.config.collateral.symbol.clone();
            ensure(wallets, user, &c_sym, amount)?;
            let receipt = m.add_collateral(now, user, amount)?;
            debit(wallets, user, &c_sym, amount)?;
            Ok(receipt)
        })?;
        self.emit_event(EventPayload::CollateralAdded(loan_event(market_id, &receipt, amount, U256::ZERO)));
        Ok(receipt)
    }

    pub fn remove_collateral(&mut self, user: UserId, market_id: MarketId, amount: U256) -> Result<LoanReceipt, EngineError> {
        let receipt = self.run(market_id, &[user], "remove_collateral", |m, wallets, now| {
            let receipt = m.remove_collateral(now, user, amount)?;
            credit(wallets, user, &m.config.collateral.symbol, amount)?;
            Ok(receipt)
        })?;
        self.emit_event(EventPayload::CollateralRemoved(loan_event(market_id, &receipt, amount, U256::ZERO)));
        Ok(receipt)
    }

    pub fn borrow_more(
        &mut self,
        user: UserId,
        market_id: MarketId,
        collateral: U256,
        debt: U256,
    ) -> Result<LoanReceipt, EngineError> {
        let receipt = self.run(market_id, &[user], "borrow_more", |m, wallets, now| {
            let (c_sym, b_sym) = (m.config.collateral.symbol.clone(), m.config.borrowed.symbol.clone());
            ensure(wallets, user, &c_sym, collateral)?;
            let receipt = m.borrow_more(now, user, collateral, debt)?;
            debit(wallets, user, &c_sym, collateral)?;
            credit(wallets, user, &b_sym, debt)?;
            Ok(receipt)
        })?;
        self.emit_event(EventPayload::BorrowedMore(loan_event(market_id, &receipt, collateral, debt)));
        Ok(receipt)
    }
}

fn loan_event(market_id: MarketId, receipt: &LoanReceipt, collateral_delta: U256, debt_delta: U256) -> LoanEvent {
    LoanEvent {
        market_id,
        owner: receipt.owner,
        collateral_delta,
        debt_delta,
        debt: receipt.debt,
        n1: receipt.n1,
        n2: receipt.n2,
    }
}

#[cfg(test)]
mod tests {
    use crate::config::MarketConfig;
    use crate::engine::{Engine, EngineConfig, EngineError};
    use crate::events::EventPayload;
    use crate::math::WAD;
    use crate::oracle::ManualOracle;
    use crate::policy::ConstantRatePolicy;
    use crate::types::{MarketId, UserId};
    use crate::wallet::WalletError;
    use alloy_primitives::U256;
    use std::sync::Arc;

    const LENDER: UserId = UserId(1);
    const ALICE: UserId = UserId(2);

    fn wad(x: u64) -> U256 {
        U256::from(x) * WAD
    }

    fn setup() -> (Engine, MarketId) {
        let mut engine = Engine::new(EngineConfig::default());
        let oracle = Arc::new(ManualOracle::new(wad(3000)));
        let policy = Arc::new(ConstantRatePolicy::new(U256::ZERO));
        let id = engine.add_market(MarketConfig::weth_long(), oracle, policy).unwrap();
        engine.mint(LENDER, "crvUSD", wad(1_000_000)).unwrap();
        engine.supply(LENDER, id, wad(1_000_000)).unwrap();
        engine.mint(ALICE, "WETH", wad(10)).unwrap();
        (engine, id)
    }

    #[test]
    fn loan_round_trip_moves_tokens() {
        let (mut engine, id) = setup();
        engine.create_loan(ALICE, id, wad(10), wad(10_000), 10).unwrap();
        assert_eq!(engine.balance(ALICE, "WETH"), U256::ZERO);
        assert_eq!(engine.balance(ALICE, "crvUSD"), wad(10_000));
        assert!(matches!(
            engine.events().last().map(|e| &e.payload),
            Some(EventPayload::LoanCreated(_))
        ));

        let r = engine.repay_all(ALICE, id).unwrap();
        assert!(r.closed);
        assert_eq!(engine.balance(ALICE, "crvUSD"), U256::ZERO);
        assert!(wad(10) - engine.balance(ALICE, "WETH") < U256::from(100u64));
        assert!(!engine.market(id).unwrap().has_loan(ALICE));
    }

    #[test]
    fn missing_collateral_rejected_without_side_effects() {
        let (mut engine, id) = setup();
        let before = engine.market(id).unwrap().available_balance();
        let err = engine.create_loan(ALICE, id, wad(11), wad(10_000), 10).unwrap_err();
        assert!(matches!(err, EngineError::Wallet(WalletError::InsufficientBalance { .. })));
        assert_eq!(engine.market(id).unwrap().available_balance(), before);
        assert!(!engine.market(id).unwrap().has_loan(ALICE));
        assert!(matches!(
            engine.events().last().map(|e| &e.payload),
            Some(EventPayload::TransitionRejected(_))
        ));
    }

    #[test]
    fn adjust_collateral_and_debt() {
        let (mut engine, id) = setup();
        engine.create_loan(ALICE, id, wad(8), wad(5_000), 10).unwrap();
        engine.add_collateral(ALICE, id, wad(2)).unwrap();
        engine.remove_collateral(ALICE, id, wad(1)).unwrap();
        assert_eq!(engine.balance(ALICE, "WETH"), wad(1));

        let r = engine.borrow_more(ALICE, id, wad(1), wad(1_000)).unwrap();
        assert_eq!(r.debt, wad(6_000));
        assert_eq!(engine.balance(ALICE, "WETH"), U256::ZERO);
        assert_eq!(engine.balance(ALICE, "crvUSD"), wad(6_000));

        // repaying more than the wallet holds fails before touching the market
        let err = engine.repay(ALICE, id, wad(6_001)).unwrap_err();
        assert!(matches!(err, EngineError::Wallet(_)));
        assert_eq!(engine.market(id).unwrap().debt(ALICE).unwrap(), wad(6_000));
    }
}
