//! Domain Layer - Core lifecycle types and logic
//!
//! Pure types and math with no I/O. All external interactions happen
//! through the ports layer.
//!
//! - `phase`: lifecycle state machine
//! - `session`: orchestration session, settings, notifications
//! - `strategy`: strategy families, definitions and learning metrics
//! - `mock_session` / `live_session`: paper and live ledgers
//! - `confidence`: readiness scoring of paper-trading history
//! - `risk`, `rate_limiter`, `emergency`: live trading safety

pub mod confidence;
pub mod emergency;
pub mod live_session;
pub mod market;
pub mod mock_session;
pub mod notification;
pub mod phase;
pub mod rate_limiter;
pub mod risk;
pub mod session;
pub mod signal;
pub mod strategy;

pub use confidence::{
    CategoryScores, ComponentScore, ComponentScores, ConfidenceMetrics, ConfidenceScorer,
    ReadinessChecklist, Recommendation, Scorer, DEFAULT_REQUIRED_SCORE,
};
pub use emergency::{EmergencyRecord, EmergencyStop};
pub use live_session::{LivePosition, LiveTrade, LiveTradingSession, SafetyStatus, TradeStatus};
pub use market::{Candle, MarketCondition, MarketSnapshot};
pub use mock_session::{MockPosition, MockSessionPerformance, MockTrade, MockTradingSession};
pub use notification::{Notification, NotificationAction, NotificationLog, NotificationType};
pub use phase::Phase;
pub use rate_limiter::RateLimiter;
pub use risk::{current_drawdown, max_drawdown, RiskCheck, RiskLimits, RiskViolation};
pub use session::{next_id, PerformanceSnapshot, Session, SessionId, Settings};
pub use signal::{Signal, StrategySignal};
pub use strategy::{
    BacktestSummary, EnhancedStrategy, LearningMetrics, StrategyDefinition, StrategyFamily, StrategyId,
};
