//! Adapters Layer - External System Implementations
//!
//! This module contains implementations of the port traits:
//! - Simulated exchange: synthetic candles and always-filling orders
//! - Backtester: candle replay through the rule-based signals
//! - Store: in-memory and JSON-file session stores
//! - Notify: notification sink backed by tracing
//! - CLI: Command-line interface handlers

pub mod backtester;
pub mod cli;
pub mod notify;
pub mod simulated;
pub mod store;

pub use backtester::CandleReplayBacktester;
pub use cli::CliApp;
pub use notify::TracingNotificationSink;
pub use simulated::{SimulatedExchange, SimulatedExchangeConfig};
pub use store::{FileSessionStore, InMemorySessionStore};
