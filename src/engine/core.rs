// 8.0 engine/core.rs: main engine. holds all markets, wallets, lender deposits and the clock.

use super::config::EngineConfig;
use super::results::EngineError;
use crate::config::MarketConfig;
use crate::events::{Event, EventId, EventPayload, MarketCreatedEvent, MintedEvent, TransitionRejectedEvent};
use crate::market::MarketState;
use crate::oracle::PriceOracle;
use crate::policy::MonetaryPolicy;
use crate::types::{MarketId, Timestamp, UserId};
use crate::wallet::Wallet;
use alloy_primitives::U256;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Wallets touched by one engine call, cloned out and written back on success.
pub(super) type WalletSet = BTreeMap<UserId, Wallet>;

/** 8.1: main engine struct. all state lives here */
#[derive(Debug)]
pub struct Engine {
    pub(super) config: EngineConfig,
    pub(super) markets: HashMap<MarketId, MarketState>,
    pub(super) wallets: HashMap<UserId, Wallet>,
    // Principal each lender has in each market
    pub(super) deposits: HashMap<(MarketId, UserId), U256>,
    pub(super) events: Vec<Event>,
    pub(super) next_event_id: u64,
    pub(super) next_market_id: u32,
    pub(super) current_time: Timestamp,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            markets: HashMap::new(),
            wallets: HashMap::new(),
            deposits: HashMap::new(),
            events: Vec::new(),
            next_event_id: 1,
            next_market_id: 1,
            current_time: Timestamp::ZERO,
        }
    }

    pub fn time(&self) -> Timestamp {
        self.current_time
    }

    /// Moves the clock forward and accrues every market up to it.
    pub fn set_time(&mut self, timestamp: Timestamp) -> Result<(), EngineError> {
        if timestamp < self.current_time {
            return Err(EngineError::TimeWentBackwards {
                now: self.current_time,
                requested: timestamp,
            });
        }
        let mut synced = HashMap::with_capacity(self.markets.len());
        for (id, market) in &self.markets {
            let mut draft = market.clone();
            draft.sync(timestamp)?;
            synced.insert(*id, draft);
        }
        self.markets = synced;
        self.current_time = timestamp;
        Ok(())
    }

    pub fn advance_time(&mut self, secs: u64) -> Result<(), EngineError> {
        self.set_time(self.current_time.plus_secs(secs))
    }

    pub fn add_market(
        &mut self,
        config: MarketConfig,
        oracle: Arc<dyn PriceOracle>,
        policy: Arc<dyn MonetaryPolicy>,
    ) -> Result<MarketId, EngineError> {
        let market_id = MarketId(self.next_market_id);
        let state = MarketState::new(market_id, config, oracle, policy, self.current_time)?;
        self.next_market_id += 1;
        info!(market = market_id.0, name = %state.config.name, "market created");

        let payload = EventPayload::MarketCreated(MarketCreatedEvent {
            market_id,
            name: state.config.name.clone(),
            base_price: state.params().amm.base_price,
        });
        self.markets.insert(market_id, state);
        self.emit_event(payload);
        Ok(market_id)
    }

    /// Market with a semi-log policy spanning its configured APR range.
    pub fn add_market_with_default_policy(
        &mut self,
        config: MarketConfig,
        oracle: Arc<dyn PriceOracle>,
    ) -> Result<MarketId, EngineError> {
        let policy = Arc::new(config.semi_log_policy()?);
        self.add_market(config, oracle, policy)
    }

    pub fn market(&self, market_id: MarketId) -> Option<&MarketState> {
        self.markets.get(&market_id)
    }

    pub fn markets(&self) -> impl Iterator<Item = (&MarketId, &MarketState)> {
        self.markets.iter()
    }

    pub(super) fn market_ref(&self, market_id: MarketId) -> Result<&MarketState, EngineError> {
        self.markets.get(&market_id).ok_or(EngineError::MarketNotFound(market_id))
    }

    pub fn wallet(&self, user: UserId) -> Option<&Wallet> {
        self.wallets.get(&user)
    }

    pub fn balance(&self, user: UserId, symbol: &str) -> U256 {
        self.wallets.get(&user).map(|w| w.balance(symbol)).unwrap_or_default()
    }

    /// Sum of every wallet's balance of `symbol`.
    pub fn circulating(&self, symbol: &str) -> U256 {
        self.wallets.values().fold(U256::ZERO, |acc, w| acc.saturating_add(w.balance(symbol)))
    }

    /// Faucet. Tokens appear in `user`'s wallet from nowhere.
    pub fn mint(&mut self, user: UserId, symbol: &str, amount: U256) -> Result<U256, EngineError> {
        let now = self.current_time;
        let wallet = self.wallets.entry(user).or_insert_with(|| Wallet::new(user, now));
        let new_balance = wallet.credit(symbol, amount)?;
        self.emit_event(EventPayload::Minted(MintedEvent {
            user,
            symbol: symbol.to_string(),
            amount,
            new_balance,
        }));
        Ok(new_balance)
    }

    // 8.2: one engine call. the closure checks wallets, runs the market transition
    // and moves tokens, all against copies. nothing is written back unless it returns Ok.
    pub(super) fn run<T>(
        &mut self,
        market_id: MarketId,
        users: &[UserId],
        op: &'static str,
        f: impl FnOnce(&mut MarketState, &mut WalletSet, Timestamp) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        let now = self.current_time;
        let mut market = self.market_ref(market_id)?.clone();
        let mut wallets: WalletSet = users
            .iter()
            .map(|u| {
                let wallet = self.wallets.get(u).cloned().unwrap_or_else(|| Wallet::new(*u, now));
                (*u, wallet)
            })
            .collect();

        match f(&mut market, &mut wallets, now) {
            Ok(out) => {
                self.markets.insert(market_id, market);
                self.wallets.extend(wallets);
                Ok(out)
            }
            Err(e) => {
                warn!(market = market_id.0, op, error = %e, "engine call rejected");
                self.emit_event(EventPayload::TransitionRejected(TransitionRejectedEvent {
                    market_id: Some(market_id),
                    user: users.first().copied().unwrap_or(UserId(0)),
                    operation: op.to_string(),
                    reason: e.to_string(),
                }));
                Err(e)
            }
        }
    }

    pub fn recent_events(&self, count: usize) -> &[Event] {
        let start = self.events.len().saturating_sub(count);
        &self.events[start..]
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub(super) fn emit_event(&mut self, payload: EventPayload) {
        let event = Event::new(EventId(self.next_event_id), self.current_time, payload);
        self.next_event_id += 1;

        if self.config.verbose {
            info!(id = event.id.0, payload = ?event.payload, "event");
        } else {
            debug!(id = event.id.0, payload = ?event.payload, "event");
        }

        self.events.push(event);

        if self.events.len() > self.config.max_events {
            let drain_count = self.events.len() - self.config.max_events;
            self.events.drain(0..drain_count);
        }
    }
}

// 8.3: wallet moves inside a `run` closure. a user missing from the set is a bug
// in the caller, reported as an empty wallet.
pub(super) fn debit(wallets: &mut WalletSet, user: UserId, symbol: &str, amount: U256) -> Result<(), EngineError> {
    if amount.is_zero() {
        return Ok(());
    }
    let wallet = wallets.entry(user).or_insert_with(|| Wallet::new(user, Timestamp::ZERO));
    wallet.debit(symbol, amount)?;
    Ok(())
}

pub(super) fn credit(wallets: &mut WalletSet, user: UserId, symbol: &str, amount: U256) -> Result<(), EngineError> {
    if amount.is_zero() {
        return Ok(());
    }
    let wallet = wallets.entry(user).or_insert_with(|| Wallet::new(user, Timestamp::ZERO));
    wallet.credit(symbol, amount)?;
    Ok(())
}

pub(super) fn ensure(wallets: &WalletSet, user: UserId, symbol: &str, amount: U256) -> Result<(), EngineError> {
    match wallets.get(&user) {
        Some(wallet) => Ok(wallet.ensure(symbol, amount)?),
        None => Ok(Wallet::new(user, Timestamp::ZERO).ensure(symbol, amount)?),
    }
}
