//! Strategy signal and backtest ports

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{BacktestSummary, Candle, Signal, StrategyDefinition, StrategySignal};

/// Signal function for a strategy definition.
///
/// Pure and synchronous: same definition and candles, same signal.
pub trait SignalPort: Send + Sync {
    fn execute(&self, strategy: &StrategyDefinition, candles: &[Candle]) -> StrategySignal;
}

/// Backtest failure; the runner absorbs these as zero-scored candidates
#[derive(Debug, Error, Clone, PartialEq)]
pub enum BacktestError {
    #[error("Insufficient data for backtest: requires {0} candles, got {1}")]
    InsufficientData(usize, usize),

    #[error("Market data unavailable: {0}")]
    DataUnavailable(String),

    #[error("Invalid strategy: {0}")]
    InvalidStrategy(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestOptions {
    pub initial_balance: f64,
    /// Number of historical candles to replay
    pub candles: usize,
    /// Fraction of balance per entry
    pub position_size: f64,
    pub fee_rate: f64,
}

impl Default for BacktestOptions {
    fn default() -> Self {
        Self {
            initial_balance: 10_000.0,
            candles: 500,
            position_size: 0.1,
            fee_rate: 0.001,
        }
    }
}

/// A round trip produced by a backtest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestTrade {
    pub side: Signal,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub entry_price: f64,
    pub exit_price: f64,
    pub quantity: f64,
    pub pnl: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BacktestResult {
    pub total_pnl: f64,
    pub total_return: f64,
    pub win_rate: f64,
    pub sharpe_ratio: f64,
    pub max_drawdown: f64,
    pub profit_factor: f64,
    pub trades: Vec<BacktestTrade>,
}

impl BacktestResult {
    pub fn summary(&self) -> BacktestSummary {
        BacktestSummary {
            total_pnl: self.total_pnl,
            total_return: self.total_return,
            win_rate: self.win_rate,
            sharpe_ratio: self.sharpe_ratio,
            max_drawdown: self.max_drawdown,
            profit_factor: self.profit_factor,
            trade_count: self.trades.len(),
            succeeded: true,
        }
    }
}

#[async_trait]
pub trait BacktestPort: Send + Sync {
    async fn run_backtest(
        &self,
        strategy: &StrategyDefinition,
        options: &BacktestOptions,
    ) -> Result<BacktestResult, BacktestError>;
}
