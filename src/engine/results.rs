// 8.0.2: errors for engine operations. receipts come from the market layer unchanged.

use crate::config::ConfigError;
use crate::liquidation::LiquidationReceipt;
use crate::market::MarketError;
use crate::types::{MarketId, Timestamp, UserId};
use crate::wallet::WalletError;
use alloy_primitives::U256;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("Market {0:?} not found")]
    MarketNotFound(MarketId),

    #[error("Clock cannot go backwards: now {now}, requested {requested}")]
    TimeWentBackwards { now: Timestamp, requested: Timestamp },

    #[error("{user} has supplied {supplied}, cannot withdraw {requested}")]
    SupplyExceeded {
        user: UserId,
        requested: U256,
        supplied: U256,
    },

    #[error("Wallet error: {0}")]
    Wallet(#[from] WalletError),

    #[error("Market error: {0}")]
    Market(#[from] MarketError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl EngineError {
    pub fn is_recoverable(&self) -> bool {
        match self {
            EngineError::Wallet(e) => e.is_recoverable(),
            EngineError::Market(e) => e.is_recoverable(),
            _ => true,
        }
    }
}

/// Outcome of one sweep over a market's underwater positions.
#[derive(Debug, Clone, Default)]
pub struct SweepResult {
    pub liquidated: Vec<LiquidationReceipt>,
    /// Positions the liquidator could not afford or that failed to settle.
    pub skipped: Vec<(UserId, EngineError)>,
}
