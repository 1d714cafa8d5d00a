//! Process-wide emergency stop
//!
//! Constructed once and shared by `Arc` with every component that can
//! place live orders. Once tripped, no live trade is accepted anywhere
//! until `clear` is called explicitly.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq)]
pub struct EmergencyRecord {
    pub reason: String,
    pub activated_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct EmergencyStop {
    active: AtomicBool,
    record: Mutex<Option<EmergencyRecord>>,
}

impl EmergencyStop {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trip the flag. Returns false if it was already active; the first
    /// reason is kept.
    pub fn activate(&self, reason: &str) -> bool {
        // Flip the flag before anything else so trade checks see it at once
        let was_active = self.active.swap(true, Ordering::SeqCst);
        if was_active {
            return false;
        }
        if let Ok(mut record) = self.record.lock() {
            *record = Some(EmergencyRecord {
                reason: reason.to_string(),
                activated_at: Utc::now(),
            });
        }
        tracing::error!("EMERGENCY STOP ACTIVATED: {}", reason);
        true
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn record(&self) -> Option<EmergencyRecord> {
        self.record.lock().ok().and_then(|r| r.clone())
    }

    /// Explicit operator reset
    pub fn clear(&self) {
        if let Ok(mut record) = self.record.lock() {
            *record = None;
        }
        self.active.store(false, Ordering::SeqCst);
        tracing::warn!("Emergency stop cleared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activate_keeps_first_reason() {
        let stop = EmergencyStop::new();
        assert!(!stop.is_active());

        assert!(stop.activate("drawdown 30%"));
        assert!(!stop.activate("second"));
        assert!(stop.is_active());
        assert_eq!(stop.record().unwrap().reason, "drawdown 30%");
    }

    #[test]
    fn test_clear() {
        let stop = EmergencyStop::new();
        stop.activate("x");
        stop.clear();
        assert!(!stop.is_active());
        assert!(stop.record().is_none());
    }
}
