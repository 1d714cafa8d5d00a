//! Exchange client port
//!
//! Order placement, market data and balances. Any `Err` is treated by the
//! live guard as a failed trade and is never retried within the same tick.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{Candle, Signal};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExchangeError {
    #[error("API request failed: {0}")]
    ApiError(String),

    #[error("Order rejected: {0}")]
    OrderRejected(String),

    #[error("Unknown trading pair: {0}")]
    UnknownPair(String),

    #[error("Order not found: {0}")]
    OrderNotFound(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Market,
    Limit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub pair: String,
    pub side: Signal,
    pub order_type: OrderType,
    pub quantity: f64,
    /// Limit price, or reference price for market orders
    pub price: Option<f64>,
}

/// Stop order that becomes a market order once `trigger_price` trades
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionalOrderRequest {
    pub pair: String,
    pub side: Signal,
    pub quantity: f64,
    pub trigger_price: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    pub success: bool,
    /// Average fill price, None when the order is resting
    pub fill_price: Option<f64>,
    /// Fee charged in quote currency
    pub fee: f64,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetBalance {
    pub asset: String,
    pub free: f64,
    pub locked: f64,
}

impl AssetBalance {
    pub fn total(&self) -> f64 {
        self.free + self.locked
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExchangePort: Send + Sync {
    async fn get_account_balance(&self) -> Result<Vec<AssetBalance>, ExchangeError>;

    /// Most recent `limit` candles for `pair`, oldest first
    async fn get_market_data(&self, pair: &str, limit: usize) -> Result<Vec<Candle>, ExchangeError>;

    async fn place_order(&self, request: OrderRequest) -> Result<OrderAck, ExchangeError>;

    async fn place_conditional_order(
        &self,
        request: ConditionalOrderRequest,
    ) -> Result<OrderAck, ExchangeError>;

    async fn cancel_order(&self, pair: &str, order_id: &str) -> Result<(), ExchangeError>;
}
