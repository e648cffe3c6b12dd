// llamma-core: band-based lending AMM.
// solvency-first architecture: debt and band accounting take priority.
// all computation is deterministic with no external I/O; time and prices are inputs.
//
// file map (search X.0 for structs, X.1+ for logic):
//   1.x  types.rs: primitives: MarketId, UserId, Direction, Timestamp, AssetSpec
//   2.x  math.rs: 18-decimal fixed point, mul_div, exp/ln, quantization
//   3.x  band.rs: band ladder, shares, user ranges, dust
//   4.x  amm.rs: per-band curve, swaps, price views, x_down
//   5.x  accrual.rs: rate and collateral-yield multipliers
//   5.2  policy.rs: monetary policies
//        oracle.rs: price oracle collaborator
//   6.x  debt.rs: debt ledger, loan placement, max borrowable
//   7.x  config.rs: market settings, presets, validation
//   8.x  engine/: wallets, clock, events, per-call orchestration
//   9.x  liquidation.rs: health, full and partial liquidation
//   10.x wallet.rs: token balances outside the markets
//   11.x events.rs: state transition events for audit
//   12.x market.rs: market state, atomic transitions, trading, views
//   13.x loans.rs: loan lifecycle

// ledger modules
pub mod accrual;
pub mod amm;
pub mod band;
pub mod debt;
pub mod math;
pub mod types;

// market modules
pub mod liquidation;
pub mod loans;
pub mod market;

// collaborators
pub mod oracle;
pub mod policy;

// integration modules
pub mod config;
pub mod engine;
pub mod events;
pub mod wallet;

// re exports for convenience
pub use accrual::*;
pub use amm::*;
pub use band::*;
pub use config::*;
pub use debt::*;
pub use engine::*;
pub use events::*;
pub use liquidation::*;
pub use loans::*;
pub use market::*;
pub use oracle::*;
pub use policy::*;
pub use types::*;
pub use wallet::*;
pub use math::{MathError, Rounding, SECONDS_PER_YEAR, WAD, WAD_I128};
