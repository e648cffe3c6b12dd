//! Engine configuration options.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Events kept in memory; the oldest are dropped first.
    pub max_events: usize,
    /// Log every event at info instead of debug.
    pub verbose: bool,
    /// Positions a single `liquidate_underwater` call will attempt, worst health first.
    pub max_sweep: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_events: 100_000,
            verbose: false,
            max_sweep: 256,
        }
    }
}
