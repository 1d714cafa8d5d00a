//! Strategy Layer - Candidate generation and signal functions
//!
//! - `market_condition`: ADX and volatility based regime labels
//! - `generator`: template and mutation based candidate generation
//! - `signals`: rule-based signal function per strategy family
//!
//! Strategy families:
//! - Momentum: SMA crossover, confidence from normalized spread
//! - Mean reversion: z-score fade, confidence from the normal CDF
//! - Breakout: prior high/low channel
//! - RSI reversal: oversold/overbought bands

pub mod generator;
pub mod market_condition;
pub mod signals;

pub use generator::{templates_for, StrategyGenerator};
pub use market_condition::{classify, directional_index, ConditionConfig, DirectionalIndex};
pub use signals::RuleBasedSignals;
