use serde::{Deserialize, Serialize};
use std::fmt;

/// Direction emitted by a strategy signal function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Signal {
    Buy,
    Sell,
    Hold,
}

impl Signal {
    /// Returns true for signals that lead to an order
    pub fn is_actionable(&self) -> bool {
        !matches!(self, Signal::Hold)
    }

    /// The side that closes a position opened by this signal
    pub fn opposite(&self) -> Signal {
        match self {
            Signal::Buy => Signal::Sell,
            Signal::Sell => Signal::Buy,
            Signal::Hold => Signal::Hold,
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signal::Buy => write!(f, "BUY"),
            Signal::Sell => write!(f, "SELL"),
            Signal::Hold => write!(f, "HOLD"),
        }
    }
}

/// Output of a strategy signal function: an optional direction and a
/// confidence in [0, 1]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StrategySignal {
    pub signal: Option<Signal>,
    pub confidence: f64,
}

impl StrategySignal {
    pub fn new(signal: Signal, confidence: f64) -> Self {
        Self {
            signal: Some(signal),
            confidence: confidence.clamp(0.0, 1.0),
        }
    }

    /// No opinion (warming up, not enough candles)
    pub fn none() -> Self {
        Self { signal: None, confidence: 0.0 }
    }

    pub fn hold(confidence: f64) -> Self {
        Self::new(Signal::Hold, confidence)
    }

    /// The direction if it should produce an order
    pub fn actionable(&self) -> Option<Signal> {
        self.signal.filter(|s| s.is_actionable())
    }

    /// Calculates confidence from a z-score using the standard normal CDF
    /// of its magnitude. Ranges from 0.5 (z = 0) towards 1.0.
    pub fn confidence_from_z(z_score: f64) -> f64 {
        use statrs::function::erf::erf;
        if z_score.is_nan() {
            return 0.0;
        }
        0.5 * (1.0 + erf(z_score.abs() / f64::sqrt(2.0)))
    }

    /// Validates the signal meets basic criteria
    pub fn validate(&self) -> Result<(), String> {
        if self.confidence.is_nan() || self.confidence < 0.0 || self.confidence > 1.0 {
            return Err(format!("Invalid confidence value: {}", self.confidence));
        }
        Ok(())
    }
}
