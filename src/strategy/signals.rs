//! Rule-based signal functions, one per strategy family
//!
//! Each function looks only at the candle window it is given. Windows
//! shorter than the family's warmup produce no signal.
//!
//! Confidence:
//! - momentum, mean reversion, breakout: normal CDF of a z-score
//!   (0.5 at z = 0, ~0.98 at z = 2)
//! - RSI: distance past the band, scaled into [0.5, 1.0]

use crate::domain::market::{mean, std_dev};
use crate::domain::{Candle, Signal, StrategyDefinition, StrategyFamily, StrategySignal};
use crate::ports::SignalPort;

#[derive(Debug, Clone, Default)]
pub struct RuleBasedSignals;

impl RuleBasedSignals {
    pub fn new() -> Self {
        Self
    }
}

impl SignalPort for RuleBasedSignals {
    fn execute(&self, strategy: &StrategyDefinition, candles: &[Candle]) -> StrategySignal {
        if candles.len() < strategy.family.warmup() {
            return StrategySignal::none();
        }
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();

        let signal = match &strategy.family {
            StrategyFamily::Momentum { fast_period, slow_period } => {
                momentum(&closes, *fast_period, *slow_period)
            }
            StrategyFamily::MeanReversion { lookback, entry_z } => {
                mean_reversion(&closes, *lookback, *entry_z)
            }
            StrategyFamily::Breakout { lookback, buffer_pct } => breakout(candles, *lookback, *buffer_pct),
            StrategyFamily::RsiReversal { period, oversold, overbought } => {
                rsi_reversal(&closes, *period, *oversold, *overbought)
            }
        };

        if signal.validate().is_err() {
            return StrategySignal::none();
        }
        signal
    }
}

/// Simple moving average of the last `period` values
pub fn sma(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }
    Some(mean(&values[values.len() - period..]))
}

/// Rolling z-score of the last value against the preceding `lookback`
pub fn z_score(values: &[f64], lookback: usize) -> Option<f64> {
    if values.len() < lookback + 1 {
        return None;
    }
    let window = &values[values.len() - lookback - 1..values.len() - 1];
    let sd = std_dev(window);
    if sd < 1e-10 {
        return None;
    }
    values.last().map(|last| (last - mean(window)) / sd)
}

/// Wilder's RSI over `period`
pub fn rsi(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period + 1 {
        return None;
    }
    let changes: Vec<f64> = values.windows(2).map(|w| w[1] - w[0]).collect();
    let p = period as f64;

    let mut avg_gain = changes[..period].iter().filter(|c| **c > 0.0).sum::<f64>() / p;
    let mut avg_loss = changes[..period].iter().filter(|c| **c < 0.0).map(|c| -c).sum::<f64>() / p;
    for change in &changes[period..] {
        avg_gain = (avg_gain * (p - 1.0) + change.max(0.0)) / p;
        avg_loss = (avg_loss * (p - 1.0) + (-change).max(0.0)) / p;
    }

    if avg_loss < 1e-12 {
        return Some(if avg_gain < 1e-12 { 50.0 } else { 100.0 });
    }
    let rs = avg_gain / avg_loss;
    Some(100.0 - 100.0 / (1.0 + rs))
}

fn momentum(closes: &[f64], fast: usize, slow: usize) -> StrategySignal {
    let (Some(fast_ma), Some(slow_ma)) = (sma(closes, fast), sma(closes, slow)) else {
        return StrategySignal::none();
    };
    let dispersion = std_dev(&closes[closes.len() - slow..]);
    if dispersion < 1e-10 {
        return StrategySignal::hold(0.5);
    }
    let spread_z = (fast_ma - slow_ma) / dispersion;
    let confidence = StrategySignal::confidence_from_z(spread_z);
    if spread_z > 0.0 {
        StrategySignal::new(Signal::Buy, confidence)
    } else if spread_z < 0.0 {
        StrategySignal::new(Signal::Sell, confidence)
    } else {
        StrategySignal::hold(confidence)
    }
}

fn mean_reversion(closes: &[f64], lookback: usize, entry_z: f64) -> StrategySignal {
    let Some(z) = z_score(closes, lookback) else {
        return StrategySignal::none();
    };
    let confidence = StrategySignal::confidence_from_z(z);
    if z <= -entry_z {
        StrategySignal::new(Signal::Buy, confidence)
    } else if z >= entry_z {
        StrategySignal::new(Signal::Sell, confidence)
    } else {
        StrategySignal::hold(confidence)
    }
}

fn breakout(candles: &[Candle], lookback: usize, buffer_pct: f64) -> StrategySignal {
    let Some((last, history)) = candles.split_last() else {
        return StrategySignal::none();
    };
    let channel = &history[history.len().saturating_sub(lookback)..];
    let high = channel.iter().map(|c| c.high).fold(f64::MIN, f64::max);
    let low = channel.iter().map(|c| c.low).fold(f64::MAX, f64::min);

    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let confidence = z_score(&closes, lookback)
        .map(StrategySignal::confidence_from_z)
        .unwrap_or(0.5);

    if last.close > high * (1.0 + buffer_pct) {
        StrategySignal::new(Signal::Buy, confidence)
    } else if last.close < low * (1.0 - buffer_pct) {
        StrategySignal::new(Signal::Sell, confidence)
    } else {
        StrategySignal::hold(0.5)
    }
}

fn rsi_reversal(closes: &[f64], period: usize, oversold: f64, overbought: f64) -> StrategySignal {
    let Some(value) = rsi(closes, period) else {
        return StrategySignal::none();
    };
    if value < oversold {
        let depth = if oversold > 0.0 { (oversold - value) / oversold } else { 0.0 };
        StrategySignal::new(Signal::Buy, 0.5 + 0.5 * depth)
    } else if value > overbought {
        let height = if overbought < 100.0 { (value - overbought) / (100.0 - overbought) } else { 0.0 };
        StrategySignal::new(Signal::Sell, 0.5 + 0.5 * height)
    } else {
        StrategySignal::hold(0.5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::MarketCondition;
    use crate::ports::mocks::candle_series;
    use approx::assert_relative_eq;
    use chrono::Utc;

    fn def(family: StrategyFamily) -> StrategyDefinition {
        StrategyDefinition {
            id: "s".into(),
            name: "s".into(),
            pair: "BTC_USDT".into(),
            family,
            generation: 0,
            target_condition: MarketCondition::Ranging,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_indicator_helpers() {
        assert_eq!(sma(&[1.0, 2.0, 3.0, 4.0], 2), Some(3.5));
        assert_eq!(sma(&[1.0], 2), None);
        assert_eq!(rsi(&[1.0, 2.0, 3.0, 4.0], 3), Some(100.0));
        assert_eq!(rsi(&[1.0, 1.0, 1.0, 1.0], 3), Some(50.0));
        assert!(z_score(&[5.0; 10], 5).is_none());
    }

    #[test]
    fn test_warmup_gives_no_signal() {
        let s = RuleBasedSignals::new();
        let strategy = def(StrategyFamily::Momentum { fast_period: 5, slow_period: 20 });
        let out = s.execute(&strategy, &candle_series(&[100.0; 10]));
        assert_eq!(out.signal, None);
    }

    #[test]
    fn test_momentum_follows_trend() {
        let s = RuleBasedSignals::new();
        let strategy = def(StrategyFamily::Momentum { fast_period: 5, slow_period: 20 });
        let rising: Vec<f64> = (0..30).map(|i| 100.0 + i as f64).collect();
        let out = s.execute(&strategy, &candle_series(&rising));
        assert_eq!(out.signal, Some(Signal::Buy));
        assert!(out.confidence > 0.7);

        let falling: Vec<f64> = rising.iter().rev().cloned().collect();
        assert_eq!(s.execute(&strategy, &candle_series(&falling)).signal, Some(Signal::Sell));
    }

    #[test]
    fn test_mean_reversion_fades_spike() {
        let s = RuleBasedSignals::new();
        let strategy = def(StrategyFamily::MeanReversion { lookback: 20, entry_z: 2.0 });
        let mut closes: Vec<f64> = (0..25).map(|i| if i % 2 == 0 { 100.0 } else { 101.0 }).collect();
        closes.push(110.0);
        let out = s.execute(&strategy, &candle_series(&closes));
        assert_eq!(out.signal, Some(Signal::Sell));
        assert!(out.confidence > 0.95);

        closes.pop();
        closes.push(90.0);
        assert_eq!(s.execute(&strategy, &candle_series(&closes)).signal, Some(Signal::Buy));
    }

    #[test]
    fn test_breakout_above_channel() {
        let s = RuleBasedSignals::new();
        let strategy = def(StrategyFamily::Breakout { lookback: 10, buffer_pct: 0.001 });
        let mut closes: Vec<f64> = (0..15).map(|i| 100.0 + (i % 3) as f64).collect();
        closes.push(105.0);
        assert_eq!(s.execute(&strategy, &candle_series(&closes)).signal, Some(Signal::Buy));

        closes.pop();
        closes.push(101.0);
        assert_eq!(s.execute(&strategy, &candle_series(&closes)).signal, Some(Signal::Hold));
    }

    #[test]
    fn test_rsi_reversal_confidence_scales() {
        let s = RuleBasedSignals::new();
        let strategy = def(StrategyFamily::RsiReversal { period: 5, oversold: 30.0, overbought: 70.0 });
        let falling: Vec<f64> = (0..20).map(|i| 200.0 - i as f64 * 2.0).collect();
        let out = s.execute(&strategy, &candle_series(&falling));
        assert_eq!(out.signal, Some(Signal::Buy));
        assert_relative_eq!(out.confidence, 1.0);
    }
}
