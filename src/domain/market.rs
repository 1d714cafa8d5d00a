//! Market data primitives shared by every layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// OHLCV candle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn new(timestamp: DateTime<Utc>, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self { timestamp, open, high, low, close, volume }
    }

    /// Flat candle at a single price, mostly useful in tests
    pub fn flat(timestamp: DateTime<Utc>, price: f64, volume: f64) -> Self {
        Self::new(timestamp, price, price, price, price, volume)
    }

    /// Quote-currency notional traded in this candle
    pub fn notional(&self) -> f64 {
        self.close * self.volume
    }
}

/// Coarse regime label used by the generator and the learning map
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MarketCondition {
    TrendingUp,
    TrendingDown,
    Ranging,
    Volatile,
}

impl fmt::Display for MarketCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MarketCondition::TrendingUp => "trending-up",
            MarketCondition::TrendingDown => "trending-down",
            MarketCondition::Ranging => "ranging",
            MarketCondition::Volatile => "volatile",
        };
        write!(f, "{}", s)
    }
}

/// Market state captured at the moment a trade executes
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    /// Last close
    pub price: f64,
    /// Standard deviation of recent close-to-close returns
    pub volatility: f64,
    /// Volume of the last candle
    pub volume: f64,
    /// Relative change over the observed window
    pub trend: f64,
}

impl MarketSnapshot {
    /// Build a snapshot from the tail of a candle window (last 20 returns).
    /// Returns None for an empty window.
    pub fn from_candles(candles: &[Candle]) -> Option<Self> {
        let last = candles.last()?;
        let returns = close_returns(candles, 20);
        let trend = match candles.first() {
            Some(first) if first.close > 0.0 => (last.close - first.close) / first.close,
            _ => 0.0,
        };
        Some(Self {
            price: last.close,
            volatility: std_dev(&returns),
            volume: last.volume,
            trend,
        })
    }
}

/// Close-to-close simple returns over the last `lookback` intervals
pub fn close_returns(candles: &[Candle], lookback: usize) -> Vec<f64> {
    let start = candles.len().saturating_sub(lookback + 1);
    candles[start..]
        .windows(2)
        .filter(|w| w[0].close > 0.0)
        .map(|w| (w[1].close - w[0].close) / w[0].close)
        .collect()
}

/// Arithmetic mean; 0 for an empty slice
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample standard deviation; 0 for fewer than two values
pub fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let variance = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    variance.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn candles(closes: &[f64]) -> Vec<Candle> {
        let start = Utc::now();
        closes
            .iter()
            .enumerate()
            .map(|(i, c)| Candle::flat(start + chrono::Duration::hours(i as i64), *c, 10.0))
            .collect()
    }

    #[test]
    fn test_stats_on_empty_input() {
        assert_eq!(mean(&[]), 0.0);
        assert_eq!(std_dev(&[]), 0.0);
        assert_eq!(std_dev(&[3.0]), 0.0);
    }

    #[test]
    fn test_std_dev() {
        assert_relative_eq!(std_dev(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]), 2.138, epsilon = 0.001);
    }

    #[test]
    fn test_close_returns_lookback() {
        let c = candles(&[100.0, 110.0, 99.0, 99.0]);
        let all = close_returns(&c, 10);
        assert_eq!(all.len(), 3);
        assert_relative_eq!(all[0], 0.1);

        let tail = close_returns(&c, 1);
        assert_eq!(tail, vec![0.0]);
    }

    #[test]
    fn test_snapshot() {
        let c = candles(&[100.0, 102.0, 104.0]);
        let snap = MarketSnapshot::from_candles(&c).unwrap();
        assert_eq!(snap.price, 104.0);
        assert_relative_eq!(snap.trend, 0.04);
        assert!(snap.volatility >= 0.0);

        assert!(MarketSnapshot::from_candles(&[]).is_none());
    }
}
