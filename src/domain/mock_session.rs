//! Paper-trading ledger
//!
//! One session per strategy under mock evaluation. The simulator appends
//! trades; the confidence scorer only reads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::market::MarketSnapshot;
use super::risk::max_drawdown;
use super::signal::Signal;

/// A single simulated execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MockTrade {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub side: Signal,
    pub quantity: f64,
    /// Price the signal was generated at
    pub requested_price: f64,
    /// Price after slippage
    pub execution_price: f64,
    /// Simulated latency in milliseconds (recorded, never awaited)
    pub latency_ms: u64,
    /// Slippage as a fraction of price
    pub slippage: f64,
    pub fee: f64,
    /// Realized PnL when this trade closed a position, None for entries
    pub realized_pnl: Option<f64>,
    /// Balance after this trade settled
    pub balance_after: f64,
    pub market: MarketSnapshot,
}

impl MockTrade {
    pub fn is_closing(&self) -> bool {
        self.realized_pnl.is_some()
    }
}

/// Position held by a mock session
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MockPosition {
    pub side: Signal,
    pub quantity: f64,
    pub entry_price: f64,
}

/// Running performance counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MockSessionPerformance {
    pub total_trades: u32,
    pub winning_trades: u32,
    pub losing_trades: u32,
    pub total_pnl: f64,
    pub total_fees: f64,
    /// Fractional return on the initial balance
    pub total_return: f64,
    /// Fraction of peak
    pub max_drawdown: f64,
    pub avg_latency_ms: f64,
    pub avg_slippage: f64,
}

impl MockSessionPerformance {
    /// Win rate over closed trades in [0, 1]
    pub fn win_rate(&self) -> f64 {
        let closed = self.winning_trades + self.losing_trades;
        if closed == 0 {
            return 0.0;
        }
        self.winning_trades as f64 / closed as f64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MockTradingSession {
    pub id: String,
    pub strategy_id: String,
    pub pair: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub initial_balance: f64,
    pub balance: f64,
    pub position: Option<MockPosition>,
    pub trades: Vec<MockTrade>,
    pub performance: MockSessionPerformance,
}

impl MockTradingSession {
    pub fn new(id: String, strategy_id: String, pair: String, initial_balance: f64) -> Self {
        Self::starting_at(id, strategy_id, pair, initial_balance, Utc::now())
    }

    pub fn starting_at(
        id: String,
        strategy_id: String,
        pair: String,
        initial_balance: f64,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            strategy_id,
            pair,
            started_at,
            ended_at: None,
            is_active: true,
            initial_balance,
            balance: initial_balance,
            position: None,
            trades: Vec::new(),
            performance: MockSessionPerformance::default(),
        }
    }

    /// Balance series starting at the initial balance
    pub fn balance_curve(&self) -> Vec<f64> {
        std::iter::once(self.initial_balance)
            .chain(self.trades.iter().map(|t| t.balance_after))
            .collect()
    }

    /// Time covered by the session: start to end, or to the last trade
    /// while still running. Never depends on the wall clock.
    pub fn elapsed(&self) -> chrono::Duration {
        let end = self
            .ended_at
            .or_else(|| self.trades.last().map(|t| t.timestamp))
            .unwrap_or(self.started_at);
        end - self.started_at
    }

    /// Append a trade and refresh the performance counters
    pub fn record_trade(&mut self, trade: MockTrade) {
        self.balance = trade.balance_after;
        self.trades.push(trade);
        self.recompute_performance();
    }

    pub fn recompute_performance(&mut self) {
        let mut perf = MockSessionPerformance {
            total_trades: self.trades.len() as u32,
            ..Default::default()
        };

        for trade in &self.trades {
            perf.total_fees += trade.fee;
            if let Some(pnl) = trade.realized_pnl {
                perf.total_pnl += pnl;
                if pnl > 0.0 {
                    perf.winning_trades += 1;
                } else if pnl < 0.0 {
                    perf.losing_trades += 1;
                }
            }
        }

        if !self.trades.is_empty() {
            let n = self.trades.len() as f64;
            perf.avg_latency_ms = self.trades.iter().map(|t| t.latency_ms as f64).sum::<f64>() / n;
            perf.avg_slippage = self.trades.iter().map(|t| t.slippage).sum::<f64>() / n;
        }

        if self.initial_balance > 0.0 {
            perf.total_return = (self.balance - self.initial_balance) / self.initial_balance;
        }
        perf.max_drawdown = max_drawdown(&self.balance_curve());
        self.performance = perf;
    }

    /// Mark the session finished
    pub fn end(&mut self, at: DateTime<Utc>) {
        if self.is_active {
            self.is_active = false;
            self.ended_at = Some(at);
        }
    }
}
