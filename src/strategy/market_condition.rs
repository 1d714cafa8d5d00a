//! Market Condition Classification
//!
//! Labels a candle window as trending up, trending down, ranging or
//! volatile. Trend strength comes from Wilder's ADX:
//!
//! - +DI / -DI: smoothed directional movement relative to true range
//! - DX = 100 * |+DI - -DI| / (+DI + -DI)
//! - ADX: Wilder-smoothed DX
//!
//! Volatility is checked first: a window whose return dispersion exceeds
//! the threshold is `Volatile` regardless of trend.

use crate::domain::market::{close_returns, std_dev};
use crate::domain::{Candle, MarketCondition};

/// Classifier thresholds
#[derive(Debug, Clone)]
pub struct ConditionConfig {
    /// ADX lookback (default: 14)
    pub adx_period: usize,
    /// ADX at or above which the market is trending (default: 25.0)
    pub trend_threshold: f64,
    /// Per-candle return std dev above which the market is volatile (default: 0.03)
    pub volatility_threshold: f64,
    /// Returns used for the volatility estimate (default: 20)
    pub volatility_lookback: usize,
}

impl Default for ConditionConfig {
    fn default() -> Self {
        Self {
            adx_period: 14,
            trend_threshold: 25.0,
            volatility_threshold: 0.03,
            volatility_lookback: 20,
        }
    }
}

impl ConditionConfig {
    /// Minimum candles before ADX is valid
    pub fn warmup_periods(&self) -> usize {
        2 * self.adx_period + 1
    }
}

/// Directional index values at the end of a window
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DirectionalIndex {
    pub plus_di: f64,
    pub minus_di: f64,
    pub adx: f64,
}

/// Batch Wilder ADX over a candle window. None until `2 * period + 1`
/// candles are available.
pub fn directional_index(candles: &[Candle], period: usize) -> Option<DirectionalIndex> {
    if period == 0 || candles.len() < 2 * period + 1 {
        return None;
    }

    let mut smoothed_tr = 0.0;
    let mut smoothed_plus = 0.0;
    let mut smoothed_minus = 0.0;
    let mut dx_values = Vec::with_capacity(candles.len());
    let mut adx: Option<f64> = None;
    let mut last = DirectionalIndex { plus_di: 0.0, minus_di: 0.0, adx: 0.0 };
    let p = period as f64;

    for (i, pair) in candles.windows(2).enumerate() {
        let (prev, cur) = (&pair[0], &pair[1]);

        let tr = (cur.high - cur.low)
            .max((cur.high - prev.close).abs())
            .max((cur.low - prev.close).abs());
        let up = cur.high - prev.high;
        let down = prev.low - cur.low;
        let plus_dm = if up > down && up > 0.0 { up } else { 0.0 };
        let minus_dm = if down > up && down > 0.0 { down } else { 0.0 };

        if i < period {
            // Initial sums
            smoothed_tr += tr;
            smoothed_plus += plus_dm;
            smoothed_minus += minus_dm;
            if i + 1 < period {
                continue;
            }
        } else {
            smoothed_tr = smoothed_tr - smoothed_tr / p + tr;
            smoothed_plus = smoothed_plus - smoothed_plus / p + plus_dm;
            smoothed_minus = smoothed_minus - smoothed_minus / p + minus_dm;
        }

        let (plus_di, minus_di) = if smoothed_tr > 1e-12 {
            (100.0 * smoothed_plus / smoothed_tr, 100.0 * smoothed_minus / smoothed_tr)
        } else {
            (0.0, 0.0)
        };
        let di_sum = plus_di + minus_di;
        let dx = if di_sum > 1e-12 {
            100.0 * (plus_di - minus_di).abs() / di_sum
        } else {
            0.0
        };

        adx = match adx {
            Some(prev_adx) => Some((prev_adx * (p - 1.0) + dx) / p),
            None => {
                dx_values.push(dx);
                if dx_values.len() == period {
                    Some(dx_values.iter().sum::<f64>() / p)
                } else {
                    None
                }
            }
        };

        last = DirectionalIndex { plus_di, minus_di, adx: adx.unwrap_or(0.0) };
    }

    adx.map(|_| last)
}

/// Classify the window. Windows too short for ADX are `Ranging` unless
/// already volatile.
pub fn classify(candles: &[Candle], config: &ConditionConfig) -> MarketCondition {
    let volatility = std_dev(&close_returns(candles, config.volatility_lookback));
    if volatility > config.volatility_threshold {
        return MarketCondition::Volatile;
    }

    match directional_index(candles, config.adx_period) {
        Some(di) if di.adx >= config.trend_threshold => {
            if di.plus_di >= di.minus_di {
                MarketCondition::TrendingUp
            } else {
                MarketCondition::TrendingDown
            }
        }
        _ => MarketCondition::Ranging,
    }
}
