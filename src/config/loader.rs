//! Configuration Loader
//!
//! Loads and validates configuration from TOML files matching config/autopilot.toml.
//! Every section is optional and falls back to the built-in defaults.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::application::{GuardConfig, MockSimulatorConfig, OrchestratorConfig};
use crate::domain::{RiskLimits, Settings};
use crate::ports::BacktestOptions;

/// Main configuration structure matching autopilot.toml
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
    /// Default settings for new sessions
    #[serde(default)]
    pub session: Settings,
    /// Default live risk limits
    #[serde(default)]
    pub risk: RiskSection,
    #[serde(default)]
    pub guard: GuardSection,
    #[serde(default)]
    pub mock: MockSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Phase loop timing and lifecycle bounds
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorSection {
    pub tick_interval_secs: u64,
    pub market_data_interval_secs: u64,
    /// Candles requested per market-data fetch
    pub candle_window: usize,
    pub candidates_per_generation: usize,
    /// Strategies promoted from one generation to the next
    pub retained_strategies: usize,
    pub min_mock_trades: usize,
    pub max_evaluation_cycles: u32,
    /// Ceiling for live position size when scaling up
    pub max_position_fraction: f64,
    /// Candles replayed per backtest
    pub backtest_candles: usize,
    /// Seconds a stop waits for a running step
    pub stop_timeout_secs: u64,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            tick_interval_secs: 5,
            market_data_interval_secs: 10,
            candle_window: 200,
            candidates_per_generation: 6,
            retained_strategies: 3,
            min_mock_trades: 10,
            max_evaluation_cycles: 20,
            max_position_fraction: 0.25,
            backtest_candles: 500,
            stop_timeout_secs: 5,
        }
    }
}

/// Live risk limits. The confidence a strategy needs before going live
/// comes from `session.confidence_threshold` only, so it is not a key here.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RiskSection {
    pub max_drawdown: f64,
    pub max_daily_loss: f64,
    /// Maximum quantity per order in base units
    pub max_position_size: f64,
    pub max_open_positions: usize,
}

impl Default for RiskSection {
    fn default() -> Self {
        let defaults = RiskLimits::default();
        Self {
            max_drawdown: defaults.max_drawdown,
            max_daily_loss: defaults.max_daily_loss,
            max_position_size: defaults.max_position_size,
            max_open_positions: defaults.max_open_positions,
        }
    }
}

impl RiskSection {
    pub fn limits(&self, required_confidence_score: f64) -> RiskLimits {
        RiskLimits {
            max_drawdown: self.max_drawdown,
            max_daily_loss: self.max_daily_loss,
            max_position_size: self.max_position_size,
            max_open_positions: self.max_open_positions,
            required_confidence_score,
            emergency_stop: false,
        }
    }
}

/// Live trading guard section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GuardSection {
    pub max_trades_per_minute: usize,
    /// Minimum signal confidence (0-1) for a live trade
    pub min_signal_confidence: f64,
    pub sweep_interval_secs: u64,
    pub fee_rate: f64,
}

impl Default for GuardSection {
    fn default() -> Self {
        Self {
            max_trades_per_minute: 10,
            min_signal_confidence: 0.7,
            sweep_interval_secs: 30,
            fee_rate: 0.001,
        }
    }
}

/// Mock trading simulator section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MockSection {
    pub min_latency_ms: u64,
    pub max_latency_ms: u64,
    pub base_slippage: f64,
    pub max_slippage: f64,
    pub fee_rate: f64,
    pub position_size: f64,
    /// Fixed RNG seed; omit for a random one
    pub seed: Option<u64>,
}

impl Default for MockSection {
    fn default() -> Self {
        let defaults = MockSimulatorConfig::default();
        Self {
            min_latency_ms: defaults.min_latency_ms,
            max_latency_ms: defaults.max_latency_ms,
            base_slippage: defaults.base_slippage,
            max_slippage: defaults.max_slippage,
            fee_rate: defaults.fee_rate,
            position_size: defaults.position_size,
            seed: None,
        }
    }
}

/// Logging configuration section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Log level: "trace", "debug", "info", "warn", "error"
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self { level: "info".to_string() }
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Validation failed: {0}")]
    ValidationError(String),
}

/// Load configuration from a TOML file, apply environment overrides and validate
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let raw = path.as_ref().to_string_lossy();
    let expanded = shellexpand::tilde(&raw).into_owned();
    let content = std::fs::read_to_string(expanded)?;
    let mut config: Config = toml::from_str(&content)?;
    config.apply_overrides(|key| std::env::var(key).ok())?;
    config.validate()?;
    Ok(config)
}

impl Config {
    /// Override session defaults from AUTOPILOT_PAIR and AUTOPILOT_INITIAL_BALANCE
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(pair) = lookup("AUTOPILOT_PAIR").filter(|p| !p.trim().is_empty()) {
            self.session.pair = pair;
        }
        if let Some(balance) = lookup("AUTOPILOT_INITIAL_BALANCE") {
            self.session.initial_balance = balance.trim().parse().map_err(|_| {
                ConfigError::ValidationError(format!(
                    "AUTOPILOT_INITIAL_BALANCE must be a number, got '{}'",
                    balance
                ))
            })?;
        }
        Ok(())
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.session
            .validate()
            .map_err(|e| ConfigError::ValidationError(format!("session: {}", e)))?;

        let orch = &self.orchestrator;
        if orch.tick_interval_secs == 0 || orch.market_data_interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "tick and market data intervals must be > 0".to_string(),
            ));
        }
        if orch.stop_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "stop_timeout_secs must be > 0".to_string(),
            ));
        }
        if orch.candidates_per_generation == 0 {
            return Err(ConfigError::ValidationError(
                "candidates_per_generation must be > 0".to_string(),
            ));
        }
        if orch.retained_strategies == 0 {
            return Err(ConfigError::ValidationError(
                "retained_strategies must be > 0".to_string(),
            ));
        }
        if orch.max_evaluation_cycles == 0 {
            return Err(ConfigError::ValidationError(
                "max_evaluation_cycles must be > 0".to_string(),
            ));
        }
        if orch.max_position_fraction <= 0.0 || orch.max_position_fraction > 1.0 {
            return Err(ConfigError::ValidationError(format!(
                "max_position_fraction must be within (0, 1], got {}",
                orch.max_position_fraction
            )));
        }

        if self.risk.max_drawdown <= 0.0 || self.risk.max_drawdown > 1.0 {
            return Err(ConfigError::ValidationError(format!(
                "risk.max_drawdown must be within (0, 1], got {}",
                self.risk.max_drawdown
            )));
        }
        if self.risk.max_daily_loss <= 0.0 || self.risk.max_daily_loss > 1.0 {
            return Err(ConfigError::ValidationError(format!(
                "risk.max_daily_loss must be within (0, 1], got {}",
                self.risk.max_daily_loss
            )));
        }
        if self.risk.max_open_positions == 0 {
            return Err(ConfigError::ValidationError(
                "risk.max_open_positions must be > 0".to_string(),
            ));
        }

        if self.guard.max_trades_per_minute == 0 {
            return Err(ConfigError::ValidationError(
                "guard.max_trades_per_minute must be > 0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.guard.min_signal_confidence) {
            return Err(ConfigError::ValidationError(format!(
                "guard.min_signal_confidence must be 0-1, got {}",
                self.guard.min_signal_confidence
            )));
        }

        if self.mock.min_latency_ms > self.mock.max_latency_ms {
            return Err(ConfigError::ValidationError(format!(
                "mock latency bounds inverted: {} > {}",
                self.mock.min_latency_ms, self.mock.max_latency_ms
            )));
        }
        if self.mock.base_slippage < 0.0 || self.mock.base_slippage > self.mock.max_slippage {
            return Err(ConfigError::ValidationError(format!(
                "mock.base_slippage must be within [0, max_slippage], got {}",
                self.mock.base_slippage
            )));
        }

        const LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
        if !LEVELS.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "unknown log level '{}'",
                self.logging.level
            )));
        }

        Ok(())
    }
}

impl From<&Config> for OrchestratorConfig {
    fn from(config: &Config) -> Self {
        let orch = &config.orchestrator;
        OrchestratorConfig {
            tick_interval: Duration::from_secs(orch.tick_interval_secs),
            market_data_interval: Duration::from_secs(orch.market_data_interval_secs),
            candle_window: orch.candle_window,
            candidates_per_generation: orch.candidates_per_generation,
            retained_strategies: orch.retained_strategies,
            min_mock_trades: orch.min_mock_trades,
            max_evaluation_cycles: orch.max_evaluation_cycles,
            max_position_fraction: orch.max_position_fraction,
            stop_timeout: Duration::from_secs(orch.stop_timeout_secs),
            backtest: BacktestOptions {
                initial_balance: config.session.initial_balance,
                candles: orch.backtest_candles,
                position_size: config.mock.position_size,
                fee_rate: config.mock.fee_rate,
            },
            risk_limits: config.risk.limits(config.session.confidence_threshold),
            ..Default::default()
        }
    }
}

impl From<&Config> for GuardConfig {
    fn from(config: &Config) -> Self {
        GuardConfig {
            max_trades_per_minute: config.guard.max_trades_per_minute,
            min_signal_confidence: config.guard.min_signal_confidence,
            sweep_interval: Duration::from_secs(config.guard.sweep_interval_secs.max(1)),
            fee_rate: config.guard.fee_rate,
        }
    }
}

impl From<&Config> for MockSimulatorConfig {
    fn from(config: &Config) -> Self {
        MockSimulatorConfig {
            min_latency_ms: config.mock.min_latency_ms,
            max_latency_ms: config.mock.max_latency_ms,
            base_slippage: config.mock.base_slippage,
            max_slippage: config.mock.max_slippage,
            fee_rate: config.mock.fee_rate,
            position_size: config.mock.position_size,
            seed: config.mock.seed,
            ..Default::default()
        }
    }
}
