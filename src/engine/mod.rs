// 8.0: multi-market engine. owns wallets and the clock, routes every call through
// wallet checks, an atomic market transition, token transfers and an event.
// deterministic, no external I/O.

mod config;
mod core;
mod lending;
mod liquidations;
mod loans;
mod results;
mod trades;

pub use config::EngineConfig;
pub use core::Engine;
pub use results::{EngineError, SweepResult};
