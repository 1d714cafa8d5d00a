//! Rolling-window trade rate limiter
//!
//! Keeps a queue of execution timestamps per live session. The check and
//! the append happen in one call so two concurrent signals cannot both
//! pass a full window.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Default trades per rolling window
pub const DEFAULT_MAX_TRADES_PER_MINUTE: usize = 10;

/// Default rolling window length in seconds
pub const DEFAULT_WINDOW_SECS: i64 = 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimiter {
    max_trades: usize,
    window_secs: i64,
    timestamps: VecDeque<DateTime<Utc>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_TRADES_PER_MINUTE)
    }
}

impl RateLimiter {
    pub fn new(max_trades: usize) -> Self {
        Self::with_window(max_trades, DEFAULT_WINDOW_SECS)
    }

    pub fn with_window(max_trades: usize, window_secs: i64) -> Self {
        Self {
            max_trades,
            window_secs,
            timestamps: VecDeque::with_capacity(max_trades),
        }
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now - Duration::seconds(self.window_secs);
        while self.timestamps.front().map_or(false, |t| *t <= cutoff) {
            self.timestamps.pop_front();
        }
    }

    /// Admit one trade at `now` if the window has room.
    ///
    /// Returns false (and records nothing) when the window is full.
    pub fn try_acquire(&mut self, now: DateTime<Utc>) -> bool {
        self.prune(now);
        if self.timestamps.len() >= self.max_trades {
            tracing::debug!(
                "Rate limit reached: {} trades in the last {}s",
                self.timestamps.len(),
                self.window_secs
            );
            return false;
        }
        self.timestamps.push_back(now);
        true
    }

    /// Trades counted in the window ending at `now`
    pub fn in_window(&mut self, now: DateTime<Utc>) -> usize {
        self.prune(now);
        self.timestamps.len()
    }

    /// Time until the oldest entry leaves the window, None if there is room
    pub fn retry_after(&mut self, now: DateTime<Utc>) -> Option<Duration> {
        self.prune(now);
        if self.timestamps.len() < self.max_trades {
            return None;
        }
        self.timestamps
            .front()
            .map(|oldest| (*oldest + Duration::seconds(self.window_secs)) - now)
    }

    pub fn max_trades(&self) -> usize {
        self.max_trades
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn test_eleventh_trade_rejected_within_window() {
        let mut limiter = RateLimiter::new(10);
        for i in 0..10 {
            assert!(limiter.try_acquire(t0() + Duration::seconds(i)));
        }
        assert!(!limiter.try_acquire(t0() + Duration::seconds(30)));
        assert_eq!(limiter.in_window(t0() + Duration::seconds(30)), 10);
    }

    #[test]
    fn test_eleventh_trade_allowed_after_window() {
        let mut limiter = RateLimiter::new(10);
        for _ in 0..10 {
            assert!(limiter.try_acquire(t0()));
        }
        assert!(limiter.try_acquire(t0() + Duration::seconds(61)));
    }

    #[test]
    fn test_rejection_does_not_consume_slot() {
        let mut limiter = RateLimiter::new(1);
        assert!(limiter.try_acquire(t0()));
        assert!(!limiter.try_acquire(t0() + Duration::seconds(1)));
        assert!(!limiter.try_acquire(t0() + Duration::seconds(2)));
        assert_eq!(limiter.in_window(t0() + Duration::seconds(2)), 1);
    }

    #[test]
    fn test_retry_after() {
        let mut limiter = RateLimiter::new(2);
        assert!(limiter.retry_after(t0()).is_none());
        limiter.try_acquire(t0());
        limiter.try_acquire(t0() + Duration::seconds(10));
        let wait = limiter.retry_after(t0() + Duration::seconds(20)).unwrap();
        assert_eq!(wait, Duration::seconds(40));
    }
}
