pub mod backtest_runner;
pub mod live_guard;
pub mod mock_simulator;
pub mod orchestrator;

pub use backtest_runner::{backtest_confidence, is_viable, rank, BacktestOutcome, BacktestRunner};
pub use live_guard::{GuardConfig, GuardError, GuardEvent, LiveTradingGuard, TradeRejection};
pub use mock_simulator::{MockSimulatorConfig, MockTradingSimulator};
pub use orchestrator::{OrchestratorConfig, OrchestratorDeps, OrchestratorError, PhaseOrchestrator};
