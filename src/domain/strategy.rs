//! Strategy definitions and the derived fields the lifecycle accumulates
//! on top of them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use super::confidence::Recommendation;
use super::market::MarketCondition;

pub type StrategyId = String;

/// Strategy family with its fixed parameter schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum StrategyFamily {
    /// Fast/slow simple moving average crossover
    Momentum { fast_period: usize, slow_period: usize },
    /// Fade z-score extremes around a rolling mean
    MeanReversion { lookback: usize, entry_z: f64 },
    /// Trade closes outside the prior high/low channel
    Breakout { lookback: usize, buffer_pct: f64 },
    /// RSI crossing oversold/overbought bands
    RsiReversal { period: usize, oversold: f64, overbought: f64 },
}

impl StrategyFamily {
    /// Candles needed before the family can produce a signal
    pub fn warmup(&self) -> usize {
        match self {
            StrategyFamily::Momentum { slow_period, .. } => slow_period + 1,
            StrategyFamily::MeanReversion { lookback, .. } => lookback + 1,
            StrategyFamily::Breakout { lookback, .. } => lookback + 1,
            StrategyFamily::RsiReversal { period, .. } => period + 2,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            StrategyFamily::Momentum { .. } => "momentum",
            StrategyFamily::MeanReversion { .. } => "mean-reversion",
            StrategyFamily::Breakout { .. } => "breakout",
            StrategyFamily::RsiReversal { .. } => "rsi-reversal",
        }
    }

    /// Checks parameter sanity
    pub fn validate(&self) -> Result<(), String> {
        match self {
            StrategyFamily::Momentum { fast_period, slow_period } => {
                if *fast_period == 0 || fast_period >= slow_period {
                    return Err(format!(
                        "momentum needs 0 < fast ({}) < slow ({})",
                        fast_period, slow_period
                    ));
                }
            }
            StrategyFamily::MeanReversion { lookback, entry_z } => {
                if *lookback < 2 || *entry_z <= 0.0 {
                    return Err(format!(
                        "mean reversion needs lookback >= 2 and entry_z > 0, got {} / {}",
                        lookback, entry_z
                    ));
                }
            }
            StrategyFamily::Breakout { lookback, buffer_pct } => {
                if *lookback < 2 || *buffer_pct < 0.0 {
                    return Err(format!(
                        "breakout needs lookback >= 2 and buffer >= 0, got {} / {}",
                        lookback, buffer_pct
                    ));
                }
            }
            StrategyFamily::RsiReversal { period, oversold, overbought } => {
                if *period < 2 || oversold >= overbought || *oversold < 0.0 || *overbought > 100.0 {
                    return Err(format!(
                        "rsi needs period >= 2 and 0 <= oversold ({}) < overbought ({}) <= 100",
                        oversold, overbought
                    ));
                }
            }
        }
        Ok(())
    }
}

/// A generated candidate strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyDefinition {
    pub id: StrategyId,
    pub name: String,
    pub pair: String,
    pub family: StrategyFamily,
    /// Generation counter (0 for the first batch)
    pub generation: u32,
    /// Market condition the template was picked for
    pub target_condition: MarketCondition,
    pub created_at: DateTime<Utc>,
}

/// Aggregate backtest statistics kept on the strategy
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BacktestSummary {
    pub total_pnl: f64,
    /// Fractional return on the starting balance
    pub total_return: f64,
    /// Fraction of winning trades in [0, 1]
    pub win_rate: f64,
    pub sharpe_ratio: f64,
    /// Fraction of peak
    pub max_drawdown: f64,
    pub profit_factor: f64,
    pub trade_count: usize,
    /// False when the backtest itself failed and the summary is a zero stand-in
    pub succeeded: bool,
}

/// Learning state that compounds across generations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningMetrics {
    pub adaptation_rate: f64,
    pub consistency_score: f64,
    pub generations_survived: u32,
    pub market_condition_performance: HashMap<MarketCondition, f64>,
}

impl Default for LearningMetrics {
    fn default() -> Self {
        Self {
            adaptation_rate: 0.1,
            consistency_score: 0.0,
            generations_survived: 0,
            market_condition_performance: HashMap::new(),
        }
    }
}

impl LearningMetrics {
    /// Fold one generation's outcome into the metrics.
    ///
    /// `previous` and `current` are confidences in [0, 1]; `realized_return`
    /// is attributed to `condition` with exponential smoothing.
    pub fn record_generation(
        &mut self,
        previous: f64,
        current: f64,
        condition: MarketCondition,
        realized_return: f64,
    ) {
        let improvement = current - previous;
        self.adaptation_rate = (self.adaptation_rate * (1.0 + improvement)).clamp(0.01, 1.0);

        self.consistency_score = if self.generations_survived == 0 {
            current.clamp(0.0, 1.0)
        } else {
            (0.7 * self.consistency_score + 0.3 * current).clamp(0.0, 1.0)
        };

        let entry = self
            .market_condition_performance
            .entry(condition)
            .or_insert(realized_return);
        *entry = 0.7 * *entry + 0.3 * realized_return;

        self.generations_survived += 1;
    }
}

/// Strategy definition plus everything the lifecycle derives for it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnhancedStrategy {
    pub definition: StrategyDefinition,
    /// Backtest-derived confidence in [0, 1]
    pub confidence: f64,
    pub profit_potential: f64,
    /// 0 = benign, 1 = maximum risk
    pub risk_score: f64,
    pub backtest: Option<BacktestSummary>,
    pub mock_session_id: Option<String>,
    pub live_session_id: Option<String>,
    pub learning: LearningMetrics,
    /// Overall score (0-100) from the latest confidence evaluation
    pub last_confidence_score: Option<f64>,
    pub last_recommendation: Option<Recommendation>,
    /// Set when the strategy exhausted its evaluation budget
    pub retired: bool,
}

impl EnhancedStrategy {
    pub fn new(definition: StrategyDefinition) -> Self {
        Self {
            definition,
            confidence: 0.0,
            profit_potential: 0.0,
            risk_score: 1.0,
            backtest: None,
            mock_session_id: None,
            live_session_id: None,
            learning: LearningMetrics::default(),
            last_confidence_score: None,
            last_recommendation: None,
            retired: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.definition.id
    }

    /// Overwrite the derived fields after a backtest pass
    pub fn apply_backtest(&mut self, summary: BacktestSummary, confidence: f64) {
        self.confidence = confidence.clamp(0.0, 1.0);
        self.profit_potential = summary.total_return.max(0.0);
        self.risk_score = if summary.succeeded {
            (summary.max_drawdown / 0.25).clamp(0.0, 1.0)
        } else {
            1.0
        };
        self.backtest = Some(summary);
    }
}

impl fmt::Display for EnhancedStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{} gen {}] conf={:.2} risk={:.2}",
            self.definition.name,
            self.definition.family.name(),
            self.definition.generation,
            self.confidence,
            self.risk_score
        )
    }
}
