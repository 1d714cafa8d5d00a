//! Live trading ledger
//!
//! Balance here is realized equity: opening a position only costs the fee,
//! closing one realizes PnL. Drawdown and daily loss are computed from the
//! resulting balance history.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::risk::{current_drawdown, daily_loss, max_drawdown, RiskLimits};
use super::signal::Signal;

/// Most safety log entries kept per session
pub const MAX_SAFETY_LOG: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeStatus {
    Pending,
    Filled,
    Failed,
    Cancelled,
}

impl TradeStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TradeStatus::Pending)
    }
}

impl fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TradeStatus::Pending => "PENDING",
            TradeStatus::Filled => "FILLED",
            TradeStatus::Failed => "FAILED",
            TradeStatus::Cancelled => "CANCELLED",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveTrade {
    pub id: u64,
    pub live_session_id: String,
    pub pair: String,
    pub side: Signal,
    pub quantity: f64,
    /// Market price when the trade was submitted
    pub reference_price: f64,
    pub fill_price: Option<f64>,
    pub fee: f64,
    /// Notional value at the fill price
    pub total: f64,
    pub signal_confidence: f64,
    pub closes_position: bool,
    pub realized_pnl: Option<f64>,
    pub order_id: Option<String>,
    pub status: TradeStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LiveTrade {
    /// PENDING -> FILLED
    pub fn mark_filled(&mut self, order_id: String, fill_price: f64, fee: f64, at: DateTime<Utc>) -> bool {
        if self.status != TradeStatus::Pending {
            return false;
        }
        self.status = TradeStatus::Filled;
        self.order_id = Some(order_id);
        self.fill_price = Some(fill_price);
        self.fee = fee;
        self.total = fill_price * self.quantity;
        self.updated_at = at;
        true
    }

    /// PENDING -> FAILED
    pub fn mark_failed(&mut self, error: String, at: DateTime<Utc>) -> bool {
        if self.status != TradeStatus::Pending {
            return false;
        }
        self.status = TradeStatus::Failed;
        self.error = Some(error);
        self.updated_at = at;
        true
    }

    /// PENDING -> CANCELLED
    pub fn mark_cancelled(&mut self, reason: &str, at: DateTime<Utc>) -> bool {
        if self.status != TradeStatus::Pending {
            return false;
        }
        self.status = TradeStatus::Cancelled;
        self.error = Some(reason.to_string());
        self.updated_at = at;
        true
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LivePosition {
    pub side: Signal,
    pub quantity: f64,
    pub entry_price: f64,
    pub opened_at: DateTime<Utc>,
    /// Stop-loss order protecting this position, if one was accepted
    pub stop_order_id: Option<String>,
}

impl LivePosition {
    pub fn unrealized_pnl(&self, price: f64) -> f64 {
        let direction = if self.side == Signal::Sell { -1.0 } else { 1.0 };
        (price - self.entry_price) * self.quantity * direction
    }
}

/// Result of the six pre-trade checks plus the safety log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyStatus {
    pub emergency_stop_clear: bool,
    pub rate_limit_ok: bool,
    pub confidence_ok: bool,
    pub drawdown_ok: bool,
    pub daily_loss_ok: bool,
    pub position_count_ok: bool,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    pub last_check: Option<DateTime<Utc>>,
}

impl Default for SafetyStatus {
    fn default() -> Self {
        Self {
            emergency_stop_clear: true,
            rate_limit_ok: true,
            confidence_ok: true,
            drawdown_ok: true,
            daily_loss_ok: true,
            position_count_ok: true,
            warnings: Vec::new(),
            errors: Vec::new(),
            last_check: None,
        }
    }
}

impl SafetyStatus {
    pub fn all_clear(&self) -> bool {
        self.emergency_stop_clear
            && self.rate_limit_ok
            && self.confidence_ok
            && self.drawdown_ok
            && self.daily_loss_ok
            && self.position_count_ok
    }

    pub fn warn(&mut self, message: String) {
        push_bounded(&mut self.warnings, message);
    }

    pub fn error(&mut self, message: String) {
        push_bounded(&mut self.errors, message);
    }
}

fn push_bounded(log: &mut Vec<String>, message: String) {
    log.push(message);
    if log.len() > MAX_SAFETY_LOG {
        let excess = log.len() - MAX_SAFETY_LOG;
        log.drain(..excess);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveTradingSession {
    pub id: String,
    pub strategy_id: String,
    pub pair: String,
    pub limits: RiskLimits,
    pub safety: SafetyStatus,
    pub initial_balance: f64,
    pub balance: f64,
    pub balance_history: Vec<f64>,
    pub day: NaiveDate,
    pub day_start_balance: f64,
    pub trades: Vec<LiveTrade>,
    pub positions: Vec<LivePosition>,
    /// Fraction of balance committed per entry
    pub position_fraction: f64,
    /// Stop distance for protective orders, fraction of entry price
    pub stop_loss: f64,
    pub is_active: bool,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub stop_reason: Option<String>,
    next_trade_id: u64,
}

impl LiveTradingSession {
    pub fn new(
        id: String,
        strategy_id: String,
        pair: String,
        limits: RiskLimits,
        initial_balance: f64,
        position_fraction: f64,
        stop_loss: f64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            strategy_id,
            pair,
            limits,
            safety: SafetyStatus::default(),
            initial_balance,
            balance: initial_balance,
            balance_history: vec![initial_balance],
            day: now.date_naive(),
            day_start_balance: initial_balance,
            trades: Vec::new(),
            positions: Vec::new(),
            position_fraction,
            stop_loss,
            is_active: true,
            started_at: now,
            stopped_at: None,
            stop_reason: None,
            next_trade_id: 1,
        }
    }

    /// Peak-to-current decline of the balance history
    pub fn current_drawdown(&self) -> f64 {
        current_drawdown(&self.balance_history)
    }

    pub fn max_drawdown(&self) -> f64 {
        max_drawdown(&self.balance_history)
    }

    /// Reset the daily baseline when the UTC date changes
    pub fn roll_day(&mut self, now: DateTime<Utc>) {
        let today = now.date_naive();
        if today > self.day {
            tracing::info!("Live session {} day rollover, daily loss baseline reset", self.id);
            self.day = today;
            self.day_start_balance = self.balance;
        }
    }

    /// Loss today as a fraction of the day's opening balance
    pub fn daily_loss(&self) -> f64 {
        daily_loss(self.day_start_balance, self.balance)
    }

    pub fn total_return(&self) -> f64 {
        if self.initial_balance <= 0.0 {
            return 0.0;
        }
        (self.balance - self.initial_balance) / self.initial_balance
    }

    pub fn open_positions(&self) -> usize {
        self.positions.len()
    }

    /// Oldest position that a trade on `side` would close
    pub fn position_closed_by(&self, side: Signal) -> Option<&LivePosition> {
        self.positions.iter().find(|p| p.side == side.opposite())
    }

    /// Append a PENDING trade and return its id
    pub fn open_pending_trade(
        &mut self,
        side: Signal,
        quantity: f64,
        reference_price: f64,
        signal_confidence: f64,
        closes_position: bool,
        now: DateTime<Utc>,
    ) -> u64 {
        let id = self.next_trade_id;
        self.next_trade_id += 1;
        self.trades.push(LiveTrade {
            id,
            live_session_id: self.id.clone(),
            pair: self.pair.clone(),
            side,
            quantity,
            reference_price,
            fill_price: None,
            fee: 0.0,
            total: 0.0,
            signal_confidence,
            closes_position,
            realized_pnl: None,
            order_id: None,
            status: TradeStatus::Pending,
            error: None,
            created_at: now,
            updated_at: now,
        });
        id
    }

    pub fn trade_mut(&mut self, trade_id: u64) -> Option<&mut LiveTrade> {
        self.trades.iter_mut().find(|t| t.id == trade_id)
    }

    pub fn trade(&self, trade_id: u64) -> Option<&LiveTrade> {
        self.trades.iter().find(|t| t.id == trade_id)
    }

    /// Apply a filled trade to positions and balance. Returns realized PnL
    /// when the trade closed a position.
    pub fn settle_fill(&mut self, trade_id: u64, now: DateTime<Utc>) -> Option<f64> {
        let (side, quantity, fill_price, fee) = {
            let trade = self.trade(trade_id)?;
            if trade.status != TradeStatus::Filled {
                return None;
            }
            (trade.side, trade.quantity, trade.fill_price?, trade.fee)
        };

        let realized = match self.positions.iter().position(|p| p.side == side.opposite()) {
            Some(index) => {
                let position = self.positions.remove(index);
                let closed_qty = quantity.min(position.quantity);
                let direction = if position.side == Signal::Sell { -1.0 } else { 1.0 };
                let pnl = (fill_price - position.entry_price) * closed_qty * direction;
                Some(pnl)
            }
            None => {
                self.positions.push(LivePosition {
                    side,
                    quantity,
                    entry_price: fill_price,
                    opened_at: now,
                    stop_order_id: None,
                });
                None
            }
        };

        self.balance += realized.unwrap_or(0.0) - fee;
        self.balance_history.push(self.balance);
        if let Some(trade) = self.trade_mut(trade_id) {
            trade.realized_pnl = realized;
        }
        realized
    }

    /// Terminal stop with a reason; returns false if already stopped
    pub fn stop(&mut self, reason: &str, now: DateTime<Utc>) -> bool {
        if !self.is_active {
            return false;
        }
        self.is_active = false;
        self.stopped_at = Some(now);
        self.stop_reason = Some(reason.to_string());
        true
    }
}
