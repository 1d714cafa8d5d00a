//! Orchestration session: one per user, owned by the orchestrator

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

use super::confidence::DEFAULT_REQUIRED_SCORE;
use super::market::MarketCondition;
use super::notification::{Notification, NotificationLog};
use super::phase::Phase;
use super::strategy::EnhancedStrategy;

pub type SessionId = String;

static ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier with a readable prefix
pub fn next_id(prefix: &str) -> String {
    let n = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{}-{}-{}", prefix, Utc::now().timestamp_millis(), n)
}

/// Per-session risk and target configuration.
///
/// All percentages are fractions (0.10 = 10%).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub pair: String,
    pub initial_balance: f64,
    /// Overall confidence (0-100) required to leave paper trading
    pub confidence_threshold: f64,
    /// Return on the live session that triggers profit maximization
    pub profit_target: f64,
    /// Live drawdown that ends the live phase
    pub max_drawdown: f64,
    /// Fraction of balance committed per live entry
    pub position_size: f64,
    /// Protective stop distance from the entry price
    pub stop_loss: f64,
    pub auto_progress_to_live: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            pair: "BTC_USDT".to_string(),
            initial_balance: 10_000.0,
            confidence_threshold: DEFAULT_REQUIRED_SCORE,
            profit_target: 0.10,
            max_drawdown: 0.15,
            position_size: 0.10,
            stop_loss: 0.02,
            auto_progress_to_live: false,
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<(), String> {
        if self.pair.trim().is_empty() {
            return Err("pair must not be empty".to_string());
        }
        if self.initial_balance <= 0.0 {
            return Err(format!("initial_balance must be positive, got {}", self.initial_balance));
        }
        if !(0.0..=100.0).contains(&self.confidence_threshold) {
            return Err(format!(
                "confidence_threshold must be within 0-100, got {}",
                self.confidence_threshold
            ));
        }
        if self.profit_target <= 0.0 {
            return Err("profit_target must be positive".to_string());
        }
        for (name, v) in [
            ("max_drawdown", self.max_drawdown),
            ("position_size", self.position_size),
            ("stop_loss", self.stop_loss),
        ] {
            if v <= 0.0 || v > 1.0 {
                return Err(format!("{} must be within (0, 1], got {}", name, v));
            }
        }
        Ok(())
    }
}

/// Aggregate numbers shown for the session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSnapshot {
    pub balance: f64,
    pub total_return: f64,
    pub current_drawdown: f64,
    pub max_drawdown: f64,
    pub total_trades: usize,
    pub win_rate: f64,
    /// Overall confidence of the active strategy, 0-100
    pub confidence_score: f64,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub user_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub phase: Phase,
    pub strategies: Vec<EnhancedStrategy>,
    pub performance: PerformanceSnapshot,
    pub settings: Settings,
    pub notifications: NotificationLog,
    /// Strategy currently in mock or live trading
    pub active_strategy_id: Option<String>,
    /// Completed strategy-generation rounds
    pub generation: u32,
    /// CONFIDENCE_EVALUATION passes for the active strategy
    pub evaluation_cycles: u32,
    /// Mock trade count at the last CONFIDENCE_EVALUATION
    #[serde(default)]
    pub last_evaluated_trades: usize,
    pub market_condition: Option<MarketCondition>,
    pub approval_requested: bool,
    pub live_approved: bool,
    /// Set once by an emergency stop; never cleared
    pub emergency_reason: Option<String>,
}

impl Session {
    pub fn new(id: SessionId, user_id: String, settings: Settings) -> Self {
        let performance = PerformanceSnapshot {
            balance: settings.initial_balance,
            ..Default::default()
        };
        Self {
            id,
            user_id,
            started_at: Utc::now(),
            ended_at: None,
            is_active: true,
            phase: Phase::Initialization,
            strategies: Vec::new(),
            performance,
            settings,
            notifications: NotificationLog::default(),
            active_strategy_id: None,
            generation: 0,
            evaluation_cycles: 0,
            last_evaluated_trades: 0,
            market_condition: None,
            approval_requested: false,
            live_approved: false,
            emergency_reason: None,
        }
    }

    pub fn notify(&mut self, notification: Notification) {
        self.notifications.push(notification);
    }

    /// Move to `next` if the lifecycle allows it
    pub fn advance(&mut self, next: Phase) -> bool {
        if !self.phase.can_transition_to(next) {
            tracing::warn!("Session {}: refused transition {} -> {}", self.id, self.phase, next);
            return false;
        }
        tracing::info!("Session {}: {} -> {}", self.id, self.phase, next);
        self.phase = next;
        true
    }

    pub fn strategy(&self, strategy_id: &str) -> Option<&EnhancedStrategy> {
        self.strategies.iter().find(|s| s.id() == strategy_id)
    }

    pub fn strategy_mut(&mut self, strategy_id: &str) -> Option<&mut EnhancedStrategy> {
        self.strategies.iter_mut().find(|s| s.id() == strategy_id)
    }

    pub fn active_strategy(&self) -> Option<&EnhancedStrategy> {
        self.active_strategy_id.as_deref().and_then(|id| self.strategy(id))
    }

    pub fn active_strategy_mut(&mut self) -> Option<&mut EnhancedStrategy> {
        let id = self.active_strategy_id.clone()?;
        self.strategy_mut(&id)
    }

    /// Mark the session finished; returns false if it already was
    pub fn deactivate(&mut self, at: DateTime<Utc>) -> bool {
        if !self.is_active {
            return false;
        }
        self.is_active = false;
        self.ended_at = Some(at);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::notification::NotificationType;

    #[test]
    fn test_ids_are_unique() {
        let a = next_id("session");
        let b = next_id("session");
        assert_ne!(a, b);
        assert!(a.starts_with("session-"));
    }

    #[test]
    fn test_settings_validation() {
        assert!(Settings::default().validate().is_ok());

        let bad = Settings { max_drawdown: 1.5, ..Default::default() };
        assert!(bad.validate().unwrap_err().contains("max_drawdown"));

        let bad = Settings { confidence_threshold: 120.0, ..Default::default() };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_settings_partial_toml() {
        let s: Settings = toml::from_str("pair = \"ETH_USDT\"\nauto_progress_to_live = true").unwrap();
        assert_eq!(s.pair, "ETH_USDT");
        assert!(s.auto_progress_to_live);
        assert_eq!(s.confidence_threshold, 75.0);
    }

    #[test]
    fn test_advance_follows_lifecycle() {
        let mut s = Session::new("s1".into(), "u1".into(), Settings::default());
        assert!(s.advance(Phase::StrategyGeneration));
        assert!(!s.advance(Phase::LiveTrading));
        assert_eq!(s.phase, Phase::StrategyGeneration);
    }

    #[test]
    fn test_deactivate_once() {
        let mut s = Session::new("s1".into(), "u1".into(), Settings::default());
        s.notify(Notification::critical(Phase::Initialization, "stop", "x"));
        assert!(s.deactivate(Utc::now()));
        assert!(!s.deactivate(Utc::now()));
        assert_eq!(s.notifications.of_kind(NotificationType::Critical).count(), 1);
    }
}
