//! Token balances outside the markets.
//!
//! Every asset crossing into or out of a market moves through a wallet. Balances
//! are native units keyed by asset symbol; the markets never see wallets.

use crate::types::{Timestamp, UserId};
use alloy_primitives::U256;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WalletError {
    #[error("Insufficient {symbol} balance: requested {requested}, available {available}")]
    InsufficientBalance {
        symbol: String,
        requested: U256,
        available: U256,
    },

    #[error("Balance overflow")]
    Overflow,
}

impl WalletError {
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, WalletError::Overflow)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wallet {
    pub owner: UserId,
    balances: BTreeMap<String, U256>,
    pub created_at: Timestamp,
}

impl Wallet {
    pub fn new(owner: UserId, timestamp: Timestamp) -> Self {
        Self {
            owner,
            balances: BTreeMap::new(),
            created_at: timestamp,
        }
    }

    pub fn balance(&self, symbol: &str) -> U256 {
        self.balances.get(symbol).copied().unwrap_or_default()
    }

    pub fn balances(&self) -> impl Iterator<Item = (&str, U256)> {
        self.balances.iter().map(|(s, b)| (s.as_str(), *b))
    }

    pub fn credit(&mut self, symbol: &str, amount: U256) -> Result<U256, WalletError> {
        let balance = self.balances.entry(symbol.to_string()).or_default();
        *balance = balance.checked_add(amount).ok_or(WalletError::Overflow)?;
        Ok(*balance)
    }

    pub fn debit(&mut self, symbol: &str, amount: U256) -> Result<U256, WalletError> {
        self.ensure(symbol, amount)?;
        let balance = self.balances.entry(symbol.to_string()).or_default();
        *balance -= amount;
        Ok(*balance)
    }

    /// Check only, nothing moves.
    pub fn ensure(&self, symbol: &str, amount: U256) -> Result<(), WalletError> {
        let available = self.balance(symbol);
        if amount > available {
            return Err(WalletError::InsufficientBalance {
                symbol: symbol.to_string(),
                requested: amount,
                available,
            });
        }
        Ok(())
    }
}
