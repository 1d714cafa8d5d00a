//! Strategy lifecycle phases
//!
//! ```text
//! INITIALIZATION -> STRATEGY_GENERATION -> BACKTESTING -> STRATEGY_OPTIMIZATION
//!        -> MOCK_TRADING <-> CONFIDENCE_EVALUATION -> READY_FOR_LIVE -> LIVE_TRADING
//! LIVE_TRADING -> PROFIT_MAXIMIZATION -> LIVE_TRADING
//! LIVE_TRADING -> LEARNING_ADAPTATION -> STRATEGY_GENERATION
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    #[default]
    Initialization,
    StrategyGeneration,
    Backtesting,
    StrategyOptimization,
    MockTrading,
    ConfidenceEvaluation,
    ReadyForLive,
    LiveTrading,
    LearningAdaptation,
    ProfitMaximization,
}

impl Phase {
    /// Phases reachable from this one in a single step
    pub fn successors(&self) -> &'static [Phase] {
        use Phase::*;
        match self {
            Initialization => &[StrategyGeneration],
            StrategyGeneration => &[Backtesting],
            Backtesting => &[StrategyOptimization],
            // No viable candidate sends us back to generation
            StrategyOptimization => &[MockTrading, StrategyGeneration],
            MockTrading => &[ConfidenceEvaluation],
            // Exhausted evaluation budget goes to learning
            ConfidenceEvaluation => &[ReadyForLive, MockTrading, LearningAdaptation],
            ReadyForLive => &[LiveTrading],
            LiveTrading => &[ProfitMaximization, LearningAdaptation],
            LearningAdaptation => &[StrategyGeneration],
            ProfitMaximization => &[LiveTrading, LearningAdaptation],
        }
    }

    pub fn can_transition_to(&self, next: Phase) -> bool {
        self.successors().contains(&next)
    }

    /// Phases during which real orders may be placed
    pub fn is_live(&self) -> bool {
        matches!(self, Phase::LiveTrading | Phase::ProfitMaximization)
    }

    /// Phases during which the mock simulator consumes market data
    pub fn is_paper(&self) -> bool {
        matches!(self, Phase::MockTrading | Phase::ConfidenceEvaluation)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Initialization => "INITIALIZATION",
            Phase::StrategyGeneration => "STRATEGY_GENERATION",
            Phase::Backtesting => "BACKTESTING",
            Phase::StrategyOptimization => "STRATEGY_OPTIMIZATION",
            Phase::MockTrading => "MOCK_TRADING",
            Phase::ConfidenceEvaluation => "CONFIDENCE_EVALUATION",
            Phase::ReadyForLive => "READY_FOR_LIVE",
            Phase::LiveTrading => "LIVE_TRADING",
            Phase::LearningAdaptation => "LEARNING_ADAPTATION",
            Phase::ProfitMaximization => "PROFIT_MAXIMIZATION",
        };
        write!(f, "{}", s)
    }
}
