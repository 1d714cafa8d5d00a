//! Risk limits and drawdown math
//!
//! Every drawdown and loss figure in the crate is a fraction (0.25 = 25%).
//! Drawdown is measured against the running peak balance; daily loss is
//! measured against the balance at the start of the UTC day.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::confidence::DEFAULT_REQUIRED_SCORE;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RiskViolation {
    #[error("Drawdown {0:.4} reached limit {1:.4}")]
    DrawdownExceeded(f64, f64),

    #[error("Daily loss {0:.4} reached limit {1:.4}")]
    DailyLossExceeded(f64, f64),

    #[error("Position size {0} exceeds maximum allowed {1}")]
    PositionSizeExceeded(f64, f64),

    #[error("{0} open positions, maximum is {1}")]
    TooManyPositions(usize, usize),

    #[error("Emergency stop flag set on risk limits")]
    EmergencyStopped,
}

impl RiskViolation {
    /// Breaches that terminate a live session when found by the sweep
    pub fn is_hard_breach(&self) -> bool {
        matches!(
            self,
            RiskViolation::DrawdownExceeded(..)
                | RiskViolation::DailyLossExceeded(..)
                | RiskViolation::EmergencyStopped
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskLimits {
    /// Fraction of peak balance
    pub max_drawdown: f64,
    /// Fraction of start-of-day balance
    pub max_daily_loss: f64,
    /// Maximum quantity per order in base units
    pub max_position_size: f64,
    pub max_open_positions: usize,
    /// Overall confidence (0-100) a strategy needs before going live.
    /// Filled from the session's confidence threshold when live trading starts.
    pub required_confidence_score: f64,
    pub emergency_stop: bool,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_drawdown: 0.15,
            max_daily_loss: 0.05,
            max_position_size: 1.0,
            max_open_positions: 3,
            required_confidence_score: DEFAULT_REQUIRED_SCORE,
            emergency_stop: false,
        }
    }
}

pub trait RiskCheck {
    fn validate_drawdown(&self, drawdown: f64) -> Result<(), RiskViolation>;
    fn validate_daily_loss(&self, daily_loss: f64) -> Result<(), RiskViolation>;
    fn validate_position_size(&self, size: f64) -> Result<(), RiskViolation>;
    fn validate_open_positions(&self, open: usize) -> Result<(), RiskViolation>;
}

impl RiskCheck for RiskLimits {
    fn validate_drawdown(&self, drawdown: f64) -> Result<(), RiskViolation> {
        if drawdown >= self.max_drawdown {
            Err(RiskViolation::DrawdownExceeded(drawdown, self.max_drawdown))
        } else {
            Ok(())
        }
    }

    fn validate_daily_loss(&self, daily_loss: f64) -> Result<(), RiskViolation> {
        if daily_loss >= self.max_daily_loss {
            Err(RiskViolation::DailyLossExceeded(daily_loss, self.max_daily_loss))
        } else {
            Ok(())
        }
    }

    fn validate_position_size(&self, size: f64) -> Result<(), RiskViolation> {
        if size.abs() > self.max_position_size {
            Err(RiskViolation::PositionSizeExceeded(size, self.max_position_size))
        } else {
            Ok(())
        }
    }

    fn validate_open_positions(&self, open: usize) -> Result<(), RiskViolation> {
        if open >= self.max_open_positions {
            Err(RiskViolation::TooManyPositions(open, self.max_open_positions))
        } else {
            Ok(())
        }
    }
}

impl RiskLimits {
    /// Hard-breach check used by the periodic sweep
    pub fn check_hard_limits(&self, drawdown: f64, daily_loss: f64) -> Result<(), RiskViolation> {
        if self.emergency_stop {
            return Err(RiskViolation::EmergencyStopped);
        }
        self.validate_drawdown(drawdown)?;
        self.validate_daily_loss(daily_loss)
    }
}

/// Largest peak-to-trough decline over a balance series, as a fraction of
/// the peak. 0 for empty or monotonically rising series.
pub fn max_drawdown(balances: &[f64]) -> f64 {
    let mut peak = f64::MIN;
    let mut worst = 0.0_f64;
    for &b in balances {
        if b > peak {
            peak = b;
        }
        if peak > 0.0 {
            worst = worst.max((peak - b) / peak);
        }
    }
    worst
}

/// Decline of the last balance from the running peak, as a fraction of
/// the peak
pub fn current_drawdown(balances: &[f64]) -> f64 {
    let peak = balances.iter().cloned().fold(f64::MIN, f64::max);
    match balances.last() {
        Some(&last) if peak > 0.0 => ((peak - last) / peak).max(0.0),
        _ => 0.0,
    }
}

/// Loss since the start of the day as a fraction of the day's opening
/// balance. Gains report 0.
pub fn daily_loss(day_start_balance: f64, current_balance: f64) -> f64 {
    if day_start_balance <= 0.0 {
        return 0.0;
    }
    ((day_start_balance - current_balance) / day_start_balance).max(0.0)
}
