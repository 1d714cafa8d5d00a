//! CLI Command Handlers
//!
//! Implementation of all CLI commands for the strategy autopilot.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::adapters::{
    CandleReplayBacktester, FileSessionStore, InMemorySessionStore, SimulatedExchange, SimulatedExchangeConfig,
    TracingNotificationSink,
};
use crate::application::{
    GuardConfig, LiveTradingGuard, MockSimulatorConfig, MockTradingSimulator, OrchestratorConfig, OrchestratorDeps,
    PhaseOrchestrator,
};
use crate::config::{load_config, Config, ConfigError};
use crate::domain::{
    ConfidenceScorer, EmergencyStop, MockTrade, MockTradingSession, Scorer, DEFAULT_REQUIRED_SCORE,
};
use crate::ports::SessionStore;
use crate::strategy::RuleBasedSignals;

/// Strategy Autopilot - autonomous strategy lifecycle for crypto trading
#[derive(Parser, Debug)]
#[command(
    name = "autopilot",
    version = env!("CARGO_PKG_VERSION"),
    about = "Generate, backtest, paper trade and promote trading strategies",
    long_about = "Autopilot drives a strategy through generation, backtesting, paper trading and \
                  confidence scoring before letting it trade live behind hard risk limits."
)]
pub struct CliApp {
    /// The command to execute
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run one session against the simulated exchange until Ctrl+C
    Run(RunCmd),

    /// Score a recorded paper-trading history
    Score(ScoreCmd),

    /// Validate a configuration file
    CheckConfig(CheckConfigCmd),
}

impl Command {
    pub fn config_path(&self) -> &Path {
        match self {
            Command::Run(cmd) => &cmd.config,
            Command::Score(cmd) => &cmd.config,
            Command::CheckConfig(cmd) => &cmd.config,
        }
    }
}

/// Run a session
#[derive(Parser, Debug)]
pub struct RunCmd {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", default_value = "config/autopilot.toml")]
    pub config: PathBuf,

    /// Trading pair override (e.g., ETH_USDT)
    #[arg(short, long, value_name = "PAIR")]
    pub pair: Option<String>,

    /// Move to live trading without waiting for approval
    #[arg(long)]
    pub auto_live: bool,

    /// Persist sessions as JSON under this directory
    #[arg(long, value_name = "DIR")]
    pub state_dir: Option<PathBuf>,

    /// Stop after this many seconds
    #[arg(long, value_name = "SECS")]
    pub duration: Option<u64>,

    /// User the session runs for
    #[arg(long, value_name = "USER", default_value = "local")]
    pub user: String,
}

/// Score a trade history
#[derive(Parser, Debug)]
pub struct ScoreCmd {
    /// JSON file with a mock session or an array of mock trades
    #[arg(value_name = "FILE")]
    pub history: PathBuf,

    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", default_value = "config/autopilot.toml")]
    pub config: PathBuf,

    /// Starting balance when the file holds bare trades
    #[arg(long, value_name = "AMOUNT", default_value = "10000")]
    pub initial_balance: f64,

    /// Print the full metrics as JSON
    #[arg(long)]
    pub json: bool,
}

/// Validate configuration
#[derive(Parser, Debug)]
pub struct CheckConfigCmd {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", default_value = "config/autopilot.toml")]
    pub config: PathBuf,
}

/// Execute the CLI command
pub async fn execute(app: CliApp) -> Result<()> {
    let loaded = load_config(app.command.config_path());
    let level = loaded
        .as_ref()
        .map(|c| c.logging.level.clone())
        .unwrap_or_else(|_| "info".to_string());
    init_logging(app.verbose, app.debug, &level)?;

    match app.command {
        Command::Run(cmd) => {
            let config = loaded.with_context(|| format!("Failed to load {}", cmd.config.display()))?;
            run_command(cmd, config).await
        }
        Command::Score(cmd) => score_command(cmd, loaded),
        Command::CheckConfig(cmd) => check_config_command(cmd, loaded),
    }
}

/// Initialize logging system. `RUST_LOG` wins over the flags, the flags
/// over the configured level.
fn init_logging(verbose: bool, debug: bool, config_level: &str) -> Result<()> {
    use tracing_subscriber::{fmt, EnvFilter};

    let fallback = if debug {
        "debug"
    } else if verbose {
        "info"
    } else {
        config_level
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    Ok(())
}

/// Build the full component graph against the simulated exchange
fn build_orchestrator(config: &Config, store: Arc<dyn SessionStore>) -> Result<Arc<PhaseOrchestrator>> {
    let exchange = Arc::new(
        SimulatedExchange::new(SimulatedExchangeConfig {
            initial_quote_balance: config.session.initial_balance,
            fee_rate: config.guard.fee_rate,
            seed: config.mock.seed,
            ..Default::default()
        })
        .context("Failed to create simulated exchange")?,
    );
    let signals = Arc::new(RuleBasedSignals::new());
    let backtest = Arc::new(CandleReplayBacktester::new(exchange.clone(), signals.clone()));
    let simulator = Arc::new(MockTradingSimulator::new(MockSimulatorConfig::from(config), signals.clone()));
    let guard = Arc::new(LiveTradingGuard::new(
        GuardConfig::from(config),
        exchange.clone(),
        Arc::new(EmergencyStop::new()),
    ));

    let orchestrator = PhaseOrchestrator::new(
        OrchestratorConfig::from(config),
        OrchestratorDeps {
            store,
            exchange,
            signals,
            backtest,
            scorer: Arc::new(ConfidenceScorer::new()),
            sink: Arc::new(TracingNotificationSink::new()),
            simulator,
            guard,
        },
    );
    Ok(Arc::new(orchestrator))
}

/// Handle run command
async fn run_command(cmd: RunCmd, config: Config) -> Result<()> {
    tracing::info!("Starting strategy autopilot...");
    tracing::info!("Config: {}", cmd.config.display());

    let store: Arc<dyn SessionStore> = match &cmd.state_dir {
        Some(dir) => {
            let dir = shellexpand::tilde(&dir.to_string_lossy()).into_owned();
            Arc::new(FileSessionStore::new(dir).context("Failed to open state directory")?)
        }
        None => Arc::new(InMemorySessionStore::new()),
    };

    let mut settings = config.session.clone();
    if let Some(pair) = &cmd.pair {
        settings.pair = pair.clone();
    }
    settings.auto_progress_to_live |= cmd.auto_live;

    let orchestrator = build_orchestrator(&config, store)?;
    let session_id = orchestrator
        .start(&cmd.user, settings.clone())
        .await
        .context("Failed to start session")?;

    println!("Session {} started", session_id);
    println!("  Pair: {}", settings.pair);
    println!("  Balance: {:.2}", settings.initial_balance);
    println!(
        "  Live: {}",
        if settings.auto_progress_to_live { "automatic" } else { "requires approval" }
    );

    // Setup Ctrl+C handler
    let orch = orchestrator.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Shutdown signal received");
        orch.shutdown().await;
    });

    let deadline = cmd.duration.map(|secs| tokio::time::Instant::now() + Duration::from_secs(secs));
    let mut ticker = tokio::time::interval(orchestrator.config().tick_interval);
    let mut last_phase = None;

    loop {
        ticker.tick().await;
        if deadline.map(|d| tokio::time::Instant::now() >= d).unwrap_or(false) {
            tracing::info!("Run duration elapsed");
            orchestrator.stop(&session_id).await.ok();
        }

        let session = orchestrator.session(&session_id).await?;
        if last_phase != Some(session.phase) {
            println!(
                "[{}] balance {:.2} return {:.2}% trades {} confidence {:.1}",
                session.phase,
                session.performance.balance,
                session.performance.total_return * 100.0,
                session.performance.total_trades,
                session.performance.confidence_score
            );
            last_phase = Some(session.phase);
        }
        if !session.is_active {
            break;
        }
    }

    let session = orchestrator.session(&session_id).await?;
    println!("Session {} ended in {}", session.id, session.phase);
    if let Some(reason) = &session.emergency_reason {
        println!("  Emergency stop: {}", reason);
    }
    tracing::info!("Autopilot stopped");
    Ok(())
}

/// Accepted layouts for `score`
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TradeHistory {
    Session(MockTradingSession),
    Trades(Vec<MockTrade>),
}

fn read_history(path: &Path, initial_balance: f64) -> Result<MockTradingSession> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let history: TradeHistory = serde_json::from_str(&content)
        .with_context(|| format!("{} is neither a mock session nor a trade list", path.display()))?;

    Ok(match history {
        TradeHistory::Session(session) => session,
        TradeHistory::Trades(trades) => {
            let started_at = trades.first().map(|t| t.timestamp).unwrap_or_else(chrono::Utc::now);
            let mut session = MockTradingSession::starting_at(
                "cli".to_string(),
                "cli".to_string(),
                String::new(),
                initial_balance,
                started_at,
            );
            for trade in trades {
                session.record_trade(trade);
            }
            session
        }
    })
}

/// Handle score command
fn score_command(cmd: ScoreCmd, config: Result<Config, ConfigError>) -> Result<()> {
    let threshold = match config {
        Ok(config) => config.session.confidence_threshold,
        Err(e) => {
            tracing::warn!("Using default threshold, config not loaded: {}", e);
            DEFAULT_REQUIRED_SCORE
        }
    };

    let session = read_history(&cmd.history, cmd.initial_balance)?;
    let metrics = ConfidenceScorer::new().score(&session, threshold);

    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&metrics)?);
        return Ok(());
    }

    println!("Confidence: {:.1} / 100 ({} trades)", metrics.overall, metrics.trade_count);
    println!("  Profitability:     {:.1}", metrics.categories.profitability);
    println!("  Risk management:   {:.1}", metrics.categories.risk_management);
    println!("  Execution quality: {:.1}", metrics.categories.execution_quality);
    println!("  Adaptability:      {:.1}", metrics.categories.market_adaptability);
    println!("  Time stability:    {:.1}", metrics.categories.time_stability);
    println!("Recommendation: {}", metrics.recommendation);

    let failing = metrics.checklist.failing();
    if failing.is_empty() {
        println!("Checklist: all passed");
    } else {
        println!("Checklist failing: {}", failing.join(", "));
    }
    if metrics.is_ready_for_live(threshold) {
        println!("Ready for live trading (threshold {:.1})", threshold);
    }
    Ok(())
}

/// Handle check-config command
fn check_config_command(cmd: CheckConfigCmd, config: Result<Config, ConfigError>) -> Result<()> {
    let config = match config {
        Ok(config) => config,
        Err(e) => bail!("{}: {}", cmd.config.display(), e),
    };

    println!("✓ {} is valid", cmd.config.display());
    println!("  Pair: {}", config.session.pair);
    println!("  Initial balance: {:.2}", config.session.initial_balance);
    println!("  Confidence threshold: {:.1}", config.session.confidence_threshold);
    println!(
        "  Tick: {}s, market data: {}s",
        config.orchestrator.tick_interval_secs, config.orchestrator.market_data_interval_secs
    );
    println!(
        "  Risk: drawdown {:.1}%, daily loss {:.1}%, {} positions",
        config.risk.max_drawdown * 100.0,
        config.risk.max_daily_loss * 100.0,
        config.risk.max_open_positions
    );
    println!("  Guard: {} trades/min", config.guard.max_trades_per_minute);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_cli_definition() {
        CliApp::command().debug_assert();
    }

    #[test]
    fn test_parse_run_flags() {
        let app = CliApp::parse_from(["autopilot", "--debug", "run", "--pair", "ETH_USDT", "--auto-live"]);
        assert!(app.debug);
        match app.command {
            Command::Run(cmd) => {
                assert_eq!(cmd.pair.as_deref(), Some("ETH_USDT"));
                assert!(cmd.auto_live);
                assert_eq!(cmd.config, PathBuf::from("config/autopilot.toml"));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_read_empty_trade_list() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"[]").unwrap();
        let session = read_history(file.path(), 5000.0).unwrap();
        assert!(session.trades.is_empty());
        assert_eq!(session.balance, 5000.0);
    }

    #[test]
    fn test_read_invalid_history() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"{\"not\": \"a session\"}").unwrap();
        assert!(read_history(file.path(), 5000.0).is_err());
    }
}
