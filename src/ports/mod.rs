//! Ports Layer - Trait definitions for external dependencies
//!
//! This module defines the interfaces (ports) that adapters must implement.
//! Following hexagonal architecture, these traits abstract:
//! - The exchange (orders, market data, balances)
//! - Strategy signal functions and the backtest engine
//! - Session persistence and notification delivery

pub mod exchange;
pub mod mocks;
pub mod store;
pub mod strategy;

pub use exchange::{
    AssetBalance, ConditionalOrderRequest, ExchangeError, ExchangePort, OrderAck, OrderRequest, OrderType,
};
#[cfg(test)]
pub use exchange::MockExchangePort;
pub use store::{NotificationSink, SessionStore, StoreError};
pub use strategy::{
    BacktestError, BacktestOptions, BacktestPort, BacktestResult, BacktestTrade, SignalPort,
};
