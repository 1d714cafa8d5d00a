//! Confidence Scorer
//!
//! Turns a paper-trading ledger into a 0-100 readiness score. Eight
//! weighted components are normalized against fixed targets, rolled up
//! into five categories, and combined with a six-item readiness checklist
//! into a `Recommendation`.
//!
//! The score is a pure function of the trade history: nothing here reads
//! the clock, so scoring the same session twice gives the same result.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::market::{mean, std_dev};
use super::mock_session::{MockTrade, MockTradingSession};

/// Trades needed before any recommendation other than INSUFFICIENT_DATA
pub const MIN_TRADES_FOR_RECOMMENDATION: usize = 10;

/// Closed trades needed for consistency, adaptability and stability
pub const MIN_TRADES_FOR_STABILITY: usize = 20;

/// Window length for the rolling win-rate consistency measure
pub const CONSISTENCY_WINDOW: usize = 10;

/// Minimum paper-trading time before going live
pub const MIN_MOCK_DAYS: i64 = 7;

const WIN_RATE_TARGET: f64 = 0.60;
const PROFIT_FACTOR_TARGET: f64 = 1.5;
const SHARPE_TARGET: f64 = 1.0;
const DRAWDOWN_TARGET: f64 = 0.20;
const RISK_ADJUSTED_TARGET: f64 = 2.0;
const LATENCY_TARGET_MS: f64 = 200.0;
const SLIPPAGE_TARGET: f64 = 0.005;
/// Profit factor reported when there are wins and no losses
const PROFIT_FACTOR_CAP: f64 = 10.0;

const W_WIN_RATE: f64 = 0.15;
const W_PROFIT_FACTOR: f64 = 0.20;
const W_SHARPE: f64 = 0.18;
const W_DRAWDOWN: f64 = 0.15;
const W_CONSISTENCY: f64 = 0.12;
const W_RISK_ADJUSTED: f64 = 0.10;
const W_LATENCY: f64 = 0.05;
const W_SLIPPAGE: f64 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Recommendation {
    ReadyForLive,
    NeedsImprovement,
    HighRisk,
    InsufficientData,
}

impl fmt::Display for Recommendation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Recommendation::ReadyForLive => "READY_FOR_LIVE",
            Recommendation::NeedsImprovement => "NEEDS_IMPROVEMENT",
            Recommendation::HighRisk => "HIGH_RISK",
            Recommendation::InsufficientData => "INSUFFICIENT_DATA",
        };
        write!(f, "{}", s)
    }
}

/// One weighted component: the measured value, its weight, and the
/// normalized 0-100 score
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ComponentScore {
    pub raw: f64,
    pub weight: f64,
    pub score: f64,
}

impl ComponentScore {
    fn new(raw: f64, weight: f64, score: f64) -> Self {
        Self {
            raw: finite_or_zero(raw),
            weight,
            score: clamp_score(score),
        }
    }

    pub fn weighted(&self) -> f64 {
        self.score * self.weight
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComponentScores {
    pub win_rate: ComponentScore,
    pub profit_factor: ComponentScore,
    pub sharpe_ratio: ComponentScore,
    pub max_drawdown: ComponentScore,
    pub consistency: ComponentScore,
    pub risk_adjusted_return: ComponentScore,
    pub execution_latency: ComponentScore,
    pub slippage_control: ComponentScore,
}

impl ComponentScores {
    pub fn all(&self) -> [&ComponentScore; 8] {
        [
            &self.win_rate,
            &self.profit_factor,
            &self.sharpe_ratio,
            &self.max_drawdown,
            &self.consistency,
            &self.risk_adjusted_return,
            &self.execution_latency,
            &self.slippage_control,
        ]
    }

    fn overall(&self) -> f64 {
        clamp_score(self.all().iter().map(|c| c.weighted()).sum())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CategoryScores {
    pub profitability: f64,
    pub risk_management: f64,
    pub execution_quality: f64,
    pub market_adaptability: f64,
    pub time_stability: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReadinessChecklist {
    pub profitability: bool,
    pub risk_management: bool,
    pub consistency: bool,
    pub execution_quality: bool,
    pub sufficient_duration: bool,
    pub drawdown_within_limit: bool,
}

impl ReadinessChecklist {
    pub fn all_passed(&self) -> bool {
        self.profitability
            && self.risk_management
            && self.consistency
            && self.execution_quality
            && self.sufficient_duration
            && self.drawdown_within_limit
    }

    /// Names of the failing items, for notifications
    pub fn failing(&self) -> Vec<&'static str> {
        let items = [
            (self.profitability, "profitability"),
            (self.risk_management, "risk management"),
            (self.consistency, "consistency"),
            (self.execution_quality, "execution quality"),
            (self.sufficient_duration, "mock duration"),
            (self.drawdown_within_limit, "max drawdown"),
        ];
        items.iter().filter(|(ok, _)| !ok).map(|(_, name)| *name).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceMetrics {
    /// Weighted composite in [0, 100]
    pub overall: f64,
    pub categories: CategoryScores,
    pub components: ComponentScores,
    pub recommendation: Recommendation,
    pub checklist: ReadinessChecklist,
    pub trade_count: usize,
}

impl ConfidenceMetrics {
    /// Metrics for a session with nothing to score
    pub fn empty() -> Self {
        Self {
            overall: 0.0,
            categories: CategoryScores::default(),
            components: ComponentScores::default(),
            recommendation: Recommendation::InsufficientData,
            checklist: ReadinessChecklist::default(),
            trade_count: 0,
        }
    }

    pub fn is_ready_for_live(&self, threshold: f64) -> bool {
        self.recommendation == Recommendation::ReadyForLive && self.overall >= threshold
    }
}

/// Score a session needs for READY_FOR_LIVE when none is configured
pub const DEFAULT_REQUIRED_SCORE: f64 = 75.0;

/// Scoring seam used by the orchestrator. `required_score` is the
/// session's confidence threshold and only affects the recommendation.
pub trait Scorer: Send + Sync {
    fn score(&self, session: &MockTradingSession, required_score: f64) -> ConfidenceMetrics;
}

#[derive(Debug, Clone, Default)]
pub struct ConfidenceScorer;

impl ConfidenceScorer {
    pub fn new() -> Self {
        Self
    }

    fn components(&self, session: &MockTradingSession, closed: &[&MockTrade]) -> ComponentScores {
        let perf = &session.performance;

        let win_rate = win_rate(closed);
        let profit_factor = profit_factor(closed);
        let sharpe = sharpe_ratio(&session.balance_curve());
        let drawdown = perf.max_drawdown;
        let consistency_std = rolling_win_rate_std(closed);
        let risk_adjusted = if perf.total_return > 0.0 {
            perf.total_return / drawdown.max(0.01)
        } else {
            0.0
        };

        let consistency_score = match consistency_std {
            Some(std) => (1.0 - std / 0.5) * 100.0,
            None => 0.0,
        };

        ComponentScores {
            win_rate: ComponentScore::new(win_rate, W_WIN_RATE, ratio_score(win_rate, WIN_RATE_TARGET)),
            profit_factor: ComponentScore::new(
                profit_factor,
                W_PROFIT_FACTOR,
                ratio_score(profit_factor, PROFIT_FACTOR_TARGET),
            ),
            sharpe_ratio: ComponentScore::new(sharpe, W_SHARPE, ratio_score(sharpe, SHARPE_TARGET)),
            max_drawdown: ComponentScore::new(
                drawdown,
                W_DRAWDOWN,
                (1.0 - drawdown / DRAWDOWN_TARGET) * 100.0,
            ),
            consistency: ComponentScore::new(
                consistency_std.unwrap_or(0.0),
                W_CONSISTENCY,
                consistency_score,
            ),
            risk_adjusted_return: ComponentScore::new(
                risk_adjusted,
                W_RISK_ADJUSTED,
                ratio_score(risk_adjusted, RISK_ADJUSTED_TARGET),
            ),
            execution_latency: ComponentScore::new(
                perf.avg_latency_ms,
                W_LATENCY,
                inverse_target_score(perf.avg_latency_ms, LATENCY_TARGET_MS),
            ),
            slippage_control: ComponentScore::new(
                perf.avg_slippage,
                W_SLIPPAGE,
                inverse_target_score(perf.avg_slippage, SLIPPAGE_TARGET),
            ),
        }
    }
}

impl Scorer for ConfidenceScorer {
    fn score(&self, session: &MockTradingSession, required_score: f64) -> ConfidenceMetrics {
        let trade_count = session.trades.len();
        if trade_count == 0 {
            return ConfidenceMetrics::empty();
        }

        let closed: Vec<&MockTrade> = session.trades.iter().filter(|t| t.is_closing()).collect();
        let components = self.components(session, &closed);

        let categories = CategoryScores {
            profitability: clamp_score(
                0.4 * components.win_rate.score + 0.6 * components.profit_factor.score,
            ),
            risk_management: clamp_score(
                0.6 * components.max_drawdown.score + 0.4 * components.risk_adjusted_return.score,
            ),
            execution_quality: clamp_score(
                0.5 * components.execution_latency.score + 0.5 * components.slippage_control.score,
            ),
            market_adaptability: market_adaptability(&closed),
            time_stability: time_stability(&closed),
        };

        let checklist = ReadinessChecklist {
            profitability: categories.profitability >= 70.0,
            risk_management: categories.risk_management >= 70.0,
            consistency: components.consistency.score >= 60.0,
            execution_quality: categories.execution_quality >= 75.0,
            sufficient_duration: session.elapsed() >= Duration::days(MIN_MOCK_DAYS),
            drawdown_within_limit: session.performance.max_drawdown <= 0.25,
        };

        let overall = components.overall();
        let recommendation = recommend(
            trade_count,
            overall,
            required_score,
            &checklist,
            categories.risk_management,
        );

        ConfidenceMetrics {
            overall,
            categories,
            components,
            recommendation,
            checklist,
            trade_count,
        }
    }
}

/// Decision table, first match wins
fn recommend(
    trade_count: usize,
    overall: f64,
    required: f64,
    checklist: &ReadinessChecklist,
    risk_management: f64,
) -> Recommendation {
    if trade_count < MIN_TRADES_FOR_RECOMMENDATION {
        Recommendation::InsufficientData
    } else if overall >= required && checklist.all_passed() {
        Recommendation::ReadyForLive
    } else if overall >= 50.0 && risk_management >= 60.0 {
        Recommendation::NeedsImprovement
    } else {
        Recommendation::HighRisk
    }
}

fn finite_or_zero(v: f64) -> f64 {
    if v.is_finite() {
        v
    } else {
        0.0
    }
}

fn clamp_score(v: f64) -> f64 {
    finite_or_zero(v).clamp(0.0, 100.0)
}

/// Higher is better, full marks at the target
fn ratio_score(raw: f64, target: f64) -> f64 {
    if raw <= 0.0 || target <= 0.0 {
        return 0.0;
    }
    (raw / target).min(1.0) * 100.0
}

/// Lower is better, full marks at or under the target
fn inverse_target_score(raw: f64, target: f64) -> f64 {
    if raw <= target {
        100.0
    } else {
        100.0 * target / raw
    }
}

fn win_rate(closed: &[&MockTrade]) -> f64 {
    if closed.is_empty() {
        return 0.0;
    }
    let wins = closed.iter().filter(|t| t.realized_pnl.unwrap_or(0.0) > 0.0).count();
    wins as f64 / closed.len() as f64
}

fn profit_factor(closed: &[&MockTrade]) -> f64 {
    let gross_profit: f64 = closed.iter().filter_map(|t| t.realized_pnl).filter(|p| *p > 0.0).sum();
    let gross_loss: f64 = closed
        .iter()
        .filter_map(|t| t.realized_pnl)
        .filter(|p| *p < 0.0)
        .map(f64::abs)
        .sum();

    if gross_profit <= 0.0 {
        0.0
    } else if gross_loss <= 0.0 {
        PROFIT_FACTOR_CAP
    } else {
        (gross_profit / gross_loss).min(PROFIT_FACTOR_CAP)
    }
}

/// Annualized Sharpe of per-trade balance returns
fn sharpe_ratio(balances: &[f64]) -> f64 {
    let returns: Vec<f64> = balances
        .windows(2)
        .filter(|w| w[0] > 0.0)
        .map(|w| (w[1] - w[0]) / w[0])
        .collect();
    let sd = std_dev(&returns);
    if sd <= f64::EPSILON {
        return 0.0;
    }
    mean(&returns) / sd * 252f64.sqrt()
}

/// Standard deviation of win rates over rolling windows of closed trades;
/// None below the stability floor
fn rolling_win_rate_std(closed: &[&MockTrade]) -> Option<f64> {
    if closed.len() < MIN_TRADES_FOR_STABILITY {
        return None;
    }
    let rates: Vec<f64> = closed.windows(CONSISTENCY_WINDOW).map(win_rate).collect();
    if rates.len() < 2 {
        return None;
    }
    Some(std_dev(&rates))
}

/// Win rate in high- vs low-volatility trades, split at the median
fn market_adaptability(closed: &[&MockTrade]) -> f64 {
    if closed.len() < MIN_TRADES_FOR_STABILITY {
        return 0.0;
    }
    let mut vols: Vec<f64> = closed.iter().map(|t| t.market.volatility).collect();
    vols.sort_by(|a, b| a.total_cmp(b));
    let median = vols[vols.len() / 2];

    let (high, low): (Vec<&MockTrade>, Vec<&MockTrade>) =
        closed.iter().partition(|t| t.market.volatility >= median);
    if high.is_empty() || low.is_empty() {
        // Single regime observed, nothing to compare
        return 100.0;
    }
    clamp_score(100.0 * (1.0 - (win_rate(&high) - win_rate(&low)).abs()))
}

/// Spread of win rates across chronological quartiles
fn time_stability(closed: &[&MockTrade]) -> f64 {
    if closed.len() < MIN_TRADES_FOR_STABILITY {
        return 0.0;
    }
    let quarter = closed.len() / 4;
    let rates: Vec<f64> = (0..4)
        .map(|q| {
            let start = q * quarter;
            let end = if q == 3 { closed.len() } else { start + quarter };
            win_rate(&closed[start..end])
        })
        .collect();
    let max = rates.iter().cloned().fold(f64::MIN, f64::max);
    let min = rates.iter().cloned().fold(f64::MAX, f64::min);
    clamp_score(100.0 * (1.0 - (max - min)))
}
