//! Order matching: per-instrument books, market managers and the global
//! registry.
//!
//! ```text
//! Session handler
//!   -> GlobalMarket (IDs, live orders, replay)
//!        -> MarketManager (engine guard, quotes, ledgers)
//!             -> OrderBook (price-time matching, top-of-book)
//! ```

pub mod book;
pub mod manager;
pub mod registry;
pub mod types;

pub use manager::MarketManager;
pub use registry::{CancelError, GlobalMarket};
