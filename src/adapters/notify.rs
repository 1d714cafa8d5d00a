//! Notification sink that writes every record to the tracing log

use crate::domain::{Notification, NotificationType};
use crate::ports::NotificationSink;

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotificationSink;

impl TracingNotificationSink {
    pub fn new() -> Self {
        Self
    }
}

impl NotificationSink for TracingNotificationSink {
    fn publish(&self, session_id: &str, n: &Notification) {
        match n.kind {
            NotificationType::Info | NotificationType::Success => {
                tracing::info!(session = session_id, phase = %n.phase, "[{}] {}: {}", n.kind, n.title, n.message)
            }
            NotificationType::Warning | NotificationType::ActionRequired => {
                tracing::warn!(session = session_id, phase = %n.phase, "[{}] {}: {}", n.kind, n.title, n.message)
            }
            NotificationType::Error | NotificationType::Critical => {
                tracing::error!(session = session_id, phase = %n.phase, "[{}] {}: {}", n.kind, n.title, n.message)
            }
        }
    }
}
