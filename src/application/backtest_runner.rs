//! Backtest Runner
//!
//! Runs every candidate through the backtest engine and turns the results
//! into confidence/risk fields on the strategy. A failed backtest degrades
//! that candidate to a zero score; it never aborts the batch.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::domain::{BacktestSummary, EnhancedStrategy};
use crate::ports::{BacktestOptions, BacktestPort};

/// Result of one candidate's backtest
#[derive(Debug, Clone, PartialEq)]
pub struct BacktestOutcome {
    pub strategy_id: String,
    pub summary: BacktestSummary,
    pub confidence: f64,
    pub error: Option<String>,
}

impl BacktestOutcome {
    pub fn failed(&self) -> bool {
        self.error.is_some()
    }
}

pub struct BacktestRunner {
    engine: Arc<dyn BacktestPort>,
    options: BacktestOptions,
}

impl BacktestRunner {
    pub fn new(engine: Arc<dyn BacktestPort>, options: BacktestOptions) -> Self {
        Self { engine, options }
    }

    pub fn options(&self) -> &BacktestOptions {
        &self.options
    }

    /// Backtest each strategy in turn and write the results back onto it
    pub async fn run_all(&self, strategies: &mut [&mut EnhancedStrategy]) -> Vec<BacktestOutcome> {
        let mut outcomes = Vec::with_capacity(strategies.len());

        for strategy in strategies.iter_mut() {
            let outcome = match self.engine.run_backtest(&strategy.definition, &self.options).await {
                Ok(result) => {
                    let summary = result.summary();
                    let confidence = backtest_confidence(&summary);
                    tracing::debug!(
                        "Backtest {}: return {:.2}% win {:.0}% trades {} -> confidence {:.2}",
                        strategy.definition.name,
                        summary.total_return * 100.0,
                        summary.win_rate * 100.0,
                        summary.trade_count,
                        confidence
                    );
                    BacktestOutcome {
                        strategy_id: strategy.id().to_string(),
                        summary,
                        confidence,
                        error: None,
                    }
                }
                Err(e) => {
                    tracing::warn!("Backtest failed for {}: {}", strategy.definition.name, e);
                    BacktestOutcome {
                        strategy_id: strategy.id().to_string(),
                        summary: BacktestSummary::default(),
                        confidence: 0.0,
                        error: Some(e.to_string()),
                    }
                }
            };

            strategy.apply_backtest(outcome.summary.clone(), outcome.confidence);
            outcomes.push(outcome);
        }

        outcomes
    }
}

/// Confidence in [0, 1] from aggregate backtest statistics.
///
/// Zero trades (or a failed run) scores 0. Weights: win rate 0.3, profit
/// factor 0.3 (full at 2.0), Sharpe 0.2 (full at 2.0), drawdown 0.2 (zero
/// at 25%).
pub fn backtest_confidence(summary: &BacktestSummary) -> f64 {
    if !summary.succeeded || summary.trade_count == 0 {
        return 0.0;
    }
    let finite = |v: f64| if v.is_finite() { v } else { 0.0 };

    let win = finite(summary.win_rate).clamp(0.0, 1.0);
    let pf = (finite(summary.profit_factor) / 2.0).clamp(0.0, 1.0);
    let sharpe = (finite(summary.sharpe_ratio) / 2.0).clamp(0.0, 1.0);
    let dd = 1.0 - (finite(summary.max_drawdown) / 0.25).clamp(0.0, 1.0);

    (0.3 * win + 0.3 * pf + 0.2 * sharpe + 0.2 * dd).clamp(0.0, 1.0)
}

/// Ranking key: confidence discounted by risk, ties broken by profit
fn rank_score(strategy: &EnhancedStrategy) -> f64 {
    strategy.confidence * (1.0 - 0.5 * strategy.risk_score)
}

/// Order strategies best first
pub fn rank(strategies: &mut [EnhancedStrategy]) {
    strategies.sort_by(|a, b| {
        rank_score(b)
            .total_cmp(&rank_score(a))
            .then_with(|| b.profit_potential.partial_cmp(&a.profit_potential).unwrap_or(Ordering::Equal))
    });
}

/// A candidate is worth paper trading once its backtest ran and traded
pub fn is_viable(strategy: &EnhancedStrategy) -> bool {
    !strategy.retired
        && strategy.confidence > 0.0
        && strategy
            .backtest
            .as_ref()
            .map(|b| b.succeeded && b.trade_count > 0)
            .unwrap_or(false)
}
