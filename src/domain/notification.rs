//! Notification records produced by the lifecycle
//!
//! The core only produces these; rendering and delivery belong to a
//! `NotificationSink`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

use super::phase::Phase;

/// Notifications retained per session
pub const NOTIFICATION_LOG_CAPACITY: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationType {
    Info,
    Success,
    Warning,
    Error,
    Critical,
    ActionRequired,
}

impl fmt::Display for NotificationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NotificationType::Info => "INFO",
            NotificationType::Success => "SUCCESS",
            NotificationType::Warning => "WARNING",
            NotificationType::Error => "ERROR",
            NotificationType::Critical => "CRITICAL",
            NotificationType::ActionRequired => "ACTION_REQUIRED",
        };
        write!(f, "{}", s)
    }
}

/// Something the user can do in response to a notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NotificationAction {
    ApproveLiveTrading { session_id: String, strategy_id: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub kind: NotificationType,
    pub phase: Phase,
    pub title: String,
    pub message: String,
    pub action: Option<NotificationAction>,
    pub timestamp: DateTime<Utc>,
}

impl Notification {
    pub fn new(kind: NotificationType, phase: Phase, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            phase,
            title: title.into(),
            message: message.into(),
            action: None,
            timestamp: Utc::now(),
        }
    }

    pub fn info(phase: Phase, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(NotificationType::Info, phase, title, message)
    }

    pub fn success(phase: Phase, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(NotificationType::Success, phase, title, message)
    }

    pub fn warning(phase: Phase, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(NotificationType::Warning, phase, title, message)
    }

    pub fn error(phase: Phase, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(NotificationType::Error, phase, title, message)
    }

    pub fn critical(phase: Phase, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(NotificationType::Critical, phase, title, message)
    }

    pub fn with_action(mut self, action: NotificationAction) -> Self {
        self.action = Some(action);
        self
    }
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {} ({}): {}", self.kind, self.title, self.phase, self.message)
    }
}

/// Append-only log that keeps the most recent entries
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotificationLog {
    entries: VecDeque<Notification>,
}

impl NotificationLog {
    pub fn push(&mut self, notification: Notification) {
        if self.entries.len() == NOTIFICATION_LOG_CAPACITY {
            self.entries.pop_front();
        }
        self.entries.push_back(notification);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Notification> {
        self.entries.iter()
    }

    pub fn last(&self) -> Option<&Notification> {
        self.entries.back()
    }

    pub fn of_kind(&self, kind: NotificationType) -> impl Iterator<Item = &Notification> {
        self.entries.iter().filter(move |n| n.kind == kind)
    }

    /// Pending approval request, if one is still in the log
    pub fn pending_action(&self) -> Option<&NotificationAction> {
        self.entries.iter().rev().find_map(|n| n.action.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_is_bounded() {
        let mut log = NotificationLog::default();
        for i in 0..60 {
            log.push(Notification::info(Phase::MockTrading, format!("n{}", i), ""));
        }
        assert_eq!(log.len(), NOTIFICATION_LOG_CAPACITY);
        assert_eq!(log.iter().next().unwrap().title, "n10");
        assert_eq!(log.last().unwrap().title, "n59");
    }

    #[test]
    fn test_action_lookup() {
        let mut log = NotificationLog::default();
        log.push(Notification::info(Phase::ReadyForLive, "a", "b"));
        assert!(log.pending_action().is_none());

        let action = NotificationAction::ApproveLiveTrading {
            session_id: "s1".into(),
            strategy_id: "st1".into(),
        };
        log.push(
            Notification::new(NotificationType::ActionRequired, Phase::ReadyForLive, "Approve", "go live?")
                .with_action(action.clone()),
        );
        assert_eq!(log.pending_action(), Some(&action));
        assert_eq!(log.of_kind(NotificationType::ActionRequired).count(), 1);
    }

    #[test]
    fn test_display() {
        let n = Notification::critical(Phase::LiveTrading, "Emergency stop", "drawdown");
        assert_eq!(n.to_string(), "[CRITICAL] Emergency stop (LIVE_TRADING): drawdown");
    }
}
