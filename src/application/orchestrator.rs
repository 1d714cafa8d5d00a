//! Phase Orchestrator
//!
//! Drives each session through the strategy lifecycle:
//!
//! INITIALIZATION -> STRATEGY_GENERATION -> BACKTESTING -> STRATEGY_OPTIMIZATION
//! -> MOCK_TRADING <-> CONFIDENCE_EVALUATION -> READY_FOR_LIVE -> LIVE_TRADING
//! <-> PROFIT_MAXIMIZATION, with LEARNING_ADAPTATION looping back to
//! STRATEGY_GENERATION.
//!
//! Every session gets a phase loop and a market-data poll task; the guard
//! runs one safety monitor for all live sessions. A handler either advances
//! the phase or leaves it in place to retry on the next tick. Handler
//! failures become CRITICAL notifications and never end the loop.

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use super::backtest_runner::{is_viable, rank, BacktestRunner};
use super::live_guard::{GuardError, GuardEvent, LiveTradingGuard};
use super::mock_simulator::MockTradingSimulator;
use crate::domain::{
    next_id, EnhancedStrategy, LiveTradingSession, MarketCondition, MockTradingSession, Notification,
    NotificationAction, NotificationType, PerformanceSnapshot, Phase, Recommendation, RiskLimits, Scorer,
    Session, SessionId, Settings, TradeStatus,
};
use crate::ports::{
    BacktestOptions, BacktestPort, ExchangePort, NotificationSink, SessionStore, SignalPort, StoreError,
};
use crate::strategy::{classify, ConditionConfig, StrategyGenerator};

/// Errors returned to direct callers of the public API
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("User {0} already has an active session")]
    ActiveSessionExists(String),

    #[error("Session {0} is no longer active")]
    SessionInactive(String),

    #[error("Strategy not found: {0}")]
    StrategyNotFound(String),

    #[error("Session {0} is not awaiting live approval")]
    NotAwaitingApproval(String),

    #[error("Invalid settings: {0}")]
    InvalidSettings(String),

    #[error("Session store error: {0}")]
    Store(#[from] StoreError),
}

/// Failures inside a phase handler; caught by the step and reported
#[derive(Debug, Error)]
enum PhaseError {
    #[error("No active strategy selected")]
    NoActiveStrategy,

    #[error("Strategy {0} has no mock session")]
    MockSessionMissing(String),

    #[error("Strategy {0} has no live session")]
    LiveSessionMissing(String),

    #[error(transparent)]
    Guard(#[from] GuardError),
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub tick_interval: Duration,
    pub market_data_interval: Duration,
    /// Candles fetched per market-data request
    pub candle_window: usize,
    pub candidates_per_generation: usize,
    /// Strategies kept across a learning cycle
    pub retained_strategies: usize,
    /// Mock trades required before the first evaluation
    pub min_mock_trades: usize,
    /// CONFIDENCE_EVALUATION passes before a strategy is retired
    pub max_evaluation_cycles: u32,
    /// Upper bound for live position sizing during profit maximization
    pub max_position_fraction: f64,
    /// How long a stop waits for an in-flight step before going ahead
    pub stop_timeout: Duration,
    pub backtest: BacktestOptions,
    pub risk_limits: RiskLimits,
    pub condition: ConditionConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(5),
            market_data_interval: Duration::from_secs(10),
            candle_window: 200,
            candidates_per_generation: 6,
            retained_strategies: 3,
            min_mock_trades: 10,
            max_evaluation_cycles: 20,
            max_position_fraction: 0.25,
            stop_timeout: Duration::from_secs(5),
            backtest: BacktestOptions::default(),
            risk_limits: RiskLimits::default(),
            condition: ConditionConfig::default(),
        }
    }
}

/// Collaborators injected at construction
pub struct OrchestratorDeps {
    pub store: Arc<dyn SessionStore>,
    pub exchange: Arc<dyn ExchangePort>,
    pub signals: Arc<dyn SignalPort>,
    pub backtest: Arc<dyn BacktestPort>,
    pub scorer: Arc<dyn Scorer>,
    pub sink: Arc<dyn NotificationSink>,
    pub simulator: Arc<MockTradingSimulator>,
    pub guard: Arc<LiveTradingGuard>,
}

struct SessionTasks {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

pub struct PhaseOrchestrator {
    config: OrchestratorConfig,
    store: Arc<dyn SessionStore>,
    exchange: Arc<dyn ExchangePort>,
    signals: Arc<dyn SignalPort>,
    scorer: Arc<dyn Scorer>,
    sink: Arc<dyn NotificationSink>,
    simulator: Arc<MockTradingSimulator>,
    guard: Arc<LiveTradingGuard>,
    backtests: BacktestRunner,
    generator: StrategyGenerator,
    /// Held for the whole of a step so stop waits for in-flight work
    step_locks: Mutex<HashMap<SessionId, Arc<Mutex<()>>>>,
    tasks: Mutex<HashMap<SessionId, SessionTasks>>,
    /// Sessions a stop has claimed; later step writes for them are dropped
    terminated: Mutex<HashSet<SessionId>>,
    monitor: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl PhaseOrchestrator {
    pub fn new(config: OrchestratorConfig, deps: OrchestratorDeps) -> Self {
        let backtests = BacktestRunner::new(deps.backtest, config.backtest.clone());
        Self {
            config,
            store: deps.store,
            exchange: deps.exchange,
            signals: deps.signals,
            scorer: deps.scorer,
            sink: deps.sink,
            simulator: deps.simulator,
            guard: deps.guard,
            backtests,
            generator: StrategyGenerator::new(),
            step_locks: Mutex::new(HashMap::new()),
            tasks: Mutex::new(HashMap::new()),
            terminated: Mutex::new(HashSet::new()),
            monitor: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn guard(&self) -> &Arc<LiveTradingGuard> {
        &self.guard
    }

    pub fn simulator(&self) -> &Arc<MockTradingSimulator> {
        &self.simulator
    }

    /// Create a session and launch its phase loop and market-data poll
    pub async fn start(self: &Arc<Self>, user_id: &str, settings: Settings) -> Result<SessionId, OrchestratorError> {
        let id = self.create_session(user_id, settings).await?;
        self.spawn_tasks(&id).await;
        Ok(id)
    }

    /// Create a session without starting any tasks
    pub async fn create_session(&self, user_id: &str, settings: Settings) -> Result<SessionId, OrchestratorError> {
        settings.validate().map_err(OrchestratorError::InvalidSettings)?;
        if self.store.list_active().await?.iter().any(|s| s.user_id == user_id) {
            return Err(OrchestratorError::ActiveSessionExists(user_id.to_string()));
        }

        let mut session = Session::new(next_id("session"), user_id.to_string(), settings);
        let message = format!(
            "Autonomous trading on {} with {:.2} starting balance",
            session.settings.pair, session.settings.initial_balance
        );
        self.notify(&mut session, Notification::info(Phase::Initialization, "Session started", message));
        let id = session.id.clone();
        self.store.put(session).await?;

        tracing::info!("Session {} created for user {}", id, user_id);
        Ok(id)
    }

    pub async fn session(&self, session_id: &str) -> Result<Session, OrchestratorError> {
        self.store
            .get(session_id)
            .await?
            .ok_or_else(|| OrchestratorError::SessionNotFound(session_id.to_string()))
    }

    pub async fn active_sessions(&self) -> Result<Vec<Session>, OrchestratorError> {
        Ok(self.store.list_active().await?)
    }

    /// Run the handler for the session's current phase once.
    /// Returns the phase after the tick.
    pub async fn step(&self, session_id: &str) -> Result<Phase, OrchestratorError> {
        let lock = self.step_lock(session_id).await;
        let _held = lock.lock().await;

        let mut session = self.load_active(session_id).await?;
        let phase = session.phase;

        if let Err(e) = self.dispatch(&mut session).await {
            tracing::error!("Session {} {} handler failed: {}", session_id, phase, e);
            self.notify(
                &mut session,
                Notification::critical(phase, format!("{} failed", phase), e.to_string()),
            );
        }

        let next = session.phase;
        self.commit(session).await?;
        Ok(next)
    }

    /// Feed one round of market data to whichever ledger the session's
    /// active strategy is trading in
    pub async fn poll_market_data(&self, session_id: &str) -> Result<(), OrchestratorError> {
        let session = self.load_active(session_id).await?;
        if !(session.phase.is_paper() || session.phase.is_live()) {
            return Ok(());
        }
        let Some(strategy) = session.active_strategy() else {
            return Ok(());
        };

        let candles = match self
            .exchange
            .get_market_data(&session.settings.pair, self.config.candle_window)
            .await
        {
            Ok(candles) => candles,
            Err(e) => {
                tracing::warn!("Session {}: market data unavailable: {}", session_id, e);
                return Ok(());
            }
        };

        if session.phase.is_paper() {
            if let Some(mock_id) = &strategy.mock_session_id {
                self.simulator.on_market_data(mock_id, &candles).await;
            }
        } else if let Some(live_id) = &strategy.live_session_id {
            let signal = self.signals.execute(&strategy.definition, &candles);
            if signal.actionable().is_some() {
                self.guard.execute_live_trade(live_id, &signal, &candles).await;
            }
        }
        Ok(())
    }

    /// Grant the pending live-trading approval
    pub async fn approve_live(&self, session_id: &str) -> Result<(), OrchestratorError> {
        let lock = self.step_lock(session_id).await;
        let _held = lock.lock().await;

        let mut session = self.load_active(session_id).await?;
        if session.phase != Phase::ReadyForLive {
            return Err(OrchestratorError::NotAwaitingApproval(session_id.to_string()));
        }
        session.live_approved = true;
        self.notify(
            &mut session,
            Notification::info(Phase::ReadyForLive, "Live trading approved", "Live trading starts on the next tick"),
        );
        self.commit(session).await?;
        Ok(())
    }

    /// User stop: ends the session and any live trading under it
    pub async fn stop(&self, session_id: &str) -> Result<(), OrchestratorError> {
        self.terminate(session_id, None).await
    }

    /// Irreversible stop of one session with a recorded cause
    pub async fn emergency_stop(&self, session_id: &str, reason: &str) -> Result<(), OrchestratorError> {
        self.terminate(session_id, Some(reason)).await
    }

    /// Trip the process-wide flag and halt every live session at the guard,
    /// then stop every active session in turn. Individual failures are
    /// logged and skipped. Returns the stopped ids.
    pub async fn emergency_stop_all(&self, reason: &str) -> Result<Vec<SessionId>, OrchestratorError> {
        // Live exposure first; a session stop may wait on a busy step
        let halted = self.guard.emergency_stop_all(reason).await;
        tracing::error!("Emergency stop halted {} live session(s): {}", halted.len(), reason);

        let mut stopped = Vec::new();
        for session in self.store.list_active().await? {
            match self.emergency_stop(&session.id, reason).await {
                Ok(()) => stopped.push(session.id),
                Err(e) => tracing::error!("Emergency stop of session {} failed: {}", session.id, e),
            }
        }
        Ok(stopped)
    }

    /// Stop every active session and the safety monitor
    pub async fn shutdown(&self) {
        let sessions = match self.store.list_active().await {
            Ok(sessions) => sessions,
            Err(e) => {
                tracing::error!("Could not list sessions on shutdown: {}", e);
                Vec::new()
            }
        };
        for session in sessions {
            if let Err(e) = self.stop(&session.id).await {
                tracing::warn!("Stop of session {} failed: {}", session.id, e);
            }
        }
        let monitor = self.monitor.lock().await.take();
        if let Some((shutdown, handle)) = monitor {
            let _ = shutdown.send(true);
            if let Err(e) = handle.await {
                tracing::warn!("Safety monitor task ended abnormally: {}", e);
            }
        }
    }

    /// Apply a guard event to `session_id` if it concerns that session's
    /// live strategy. Returns true when the session moved.
    pub async fn handle_guard_event(&self, session_id: &str, event: &GuardEvent) -> Result<bool, OrchestratorError> {
        let GuardEvent::LiveSessionStopped { live_session_id, reason, .. } = event;

        let lock = self.step_lock(session_id).await;
        let _held = lock.lock().await;

        let mut session = self.load_active(session_id).await?;
        let owned = session
            .active_strategy()
            .and_then(|s| s.live_session_id.as_deref())
            .map(|id| id == live_session_id)
            .unwrap_or(false);
        if !owned || !session.phase.is_live() {
            return Ok(false);
        }

        let phase = session.phase;
        self.notify(
            &mut session,
            Notification::error(phase, "Live trading halted", format!("Safety monitor stopped live trading: {}", reason)),
        );
        let moved = session.advance(Phase::LearningAdaptation);
        self.commit(session).await?;
        Ok(moved)
    }

    async fn spawn_tasks(self: &Arc<Self>, session_id: &str) {
        let (shutdown, rx) = watch::channel(false);
        let phase_loop = tokio::spawn(Arc::clone(self).run_phase_loop(session_id.to_string(), rx.clone()));
        let poll_loop = tokio::spawn(Arc::clone(self).run_market_data_loop(session_id.to_string(), rx));
        {
            let mut monitor = self.monitor.lock().await;
            if monitor.is_none() {
                let (monitor_tx, monitor_rx) = watch::channel(false);
                if let Some(handle) = self.guard.spawn_safety_monitor(monitor_rx) {
                    *monitor = Some((monitor_tx, handle));
                }
            }
        }

        self.tasks.lock().await.insert(
            session_id.to_string(),
            SessionTasks { shutdown, handles: vec![phase_loop, poll_loop] },
        );
    }

    async fn run_phase_loop(self: Arc<Self>, session_id: SessionId, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        let mut events = self.guard.subscribe();
        tracing::info!("Phase loop for {} started, tick {:?}", session_id, self.config.tick_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.step(&session_id).await {
                        Ok(phase) => tracing::debug!("Session {} in {}", session_id, phase),
                        Err(OrchestratorError::SessionInactive(_)) | Err(OrchestratorError::SessionNotFound(_)) => break,
                        Err(e) => tracing::error!("Phase tick for {} failed: {}", session_id, e),
                    }
                }
                event = events.recv() => {
                    match event {
                        Ok(event) => {
                            if let Err(e) = self.handle_guard_event(&session_id, &event).await {
                                tracing::warn!("Guard event for {} not applied: {}", session_id, e);
                            }
                        }
                        Err(RecvError::Lagged(missed)) => {
                            tracing::warn!("Phase loop for {} missed {} guard events", session_id, missed);
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("Phase loop for {} stopped", session_id);
    }

    async fn run_market_data_loop(self: Arc<Self>, session_id: SessionId, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.market_data_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.poll_market_data(&session_id).await {
                        Ok(()) => {}
                        Err(OrchestratorError::SessionInactive(_)) | Err(OrchestratorError::SessionNotFound(_)) => break,
                        Err(e) => tracing::warn!("Market data poll for {} failed: {}", session_id, e),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("Market data poll for {} stopped", session_id);
    }

    async fn terminate(&self, session_id: &str, emergency: Option<&str>) -> Result<(), OrchestratorError> {
        // Timers go first so no new tick starts behind the lock
        if let Some(tasks) = self.tasks.lock().await.remove(session_id) {
            let _ = tasks.shutdown.send(true);
            drop(tasks.handles);
        }

        let lock = self.step_lock(session_id).await;
        let _held = match tokio::time::timeout(self.config.stop_timeout, lock.lock()).await {
            Ok(held) => Some(held),
            Err(_) => {
                tracing::warn!(
                    "Session {}: step still running after {:?}, stopping without it",
                    session_id,
                    self.config.stop_timeout
                );
                None
            }
        };
        self.terminated.lock().await.insert(session_id.to_string());

        let mut session = self.load_active(session_id).await?;
        let reason = emergency.unwrap_or("stopped by user");

        for strategy in &mut session.strategies {
            if let Some(live_id) = strategy.live_session_id.take() {
                if let Err(e) = self.guard.stop_live_trading(&live_id, reason).await {
                    tracing::error!("Session {}: stopping live session {} failed: {}", session_id, live_id, e);
                }
            }
            if let Some(mock_id) = strategy.mock_session_id.take() {
                self.simulator.stop_session(&mock_id).await;
            }
        }

        let phase = session.phase;
        session.deactivate(Utc::now());
        match emergency {
            Some(reason) => {
                session.emergency_reason = Some(reason.to_string());
                tracing::error!("Session {} emergency stopped: {}", session_id, reason);
                self.notify(&mut session, Notification::critical(phase, "Emergency stop", reason));
            }
            None => {
                tracing::info!("Session {} stopped in {}", session_id, phase);
                self.notify(&mut session, Notification::info(phase, "Session stopped", "Trading stopped by user"));
            }
        }
        self.store.put(session).await?;
        Ok(())
    }

    /// Persist a session unless a stop has claimed it. A discarded write
    /// still releases any ledger it opened.
    async fn commit(&self, session: Session) -> Result<(), OrchestratorError> {
        let terminated = self.terminated.lock().await;
        if !terminated.contains(&session.id) {
            self.store.put(session).await?;
            return Ok(());
        }
        drop(terminated);

        tracing::warn!("Session {} was stopped mid-step, step result discarded", session.id);
        for strategy in &session.strategies {
            if let Some(live_id) = &strategy.live_session_id {
                if let Err(e) = self.guard.stop_live_trading(live_id, "session stopped").await {
                    tracing::debug!("Live session {} already gone: {}", live_id, e);
                }
            }
            if let Some(mock_id) = &strategy.mock_session_id {
                self.simulator.stop_session(mock_id).await;
            }
        }
        Err(OrchestratorError::SessionInactive(session.id))
    }

    async fn step_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.step_locks.lock().await;
        locks.entry(session_id.to_string()).or_default().clone()
    }

    async fn load_active(&self, session_id: &str) -> Result<Session, OrchestratorError> {
        let session = self.session(session_id).await?;
        if !session.is_active {
            return Err(OrchestratorError::SessionInactive(session_id.to_string()));
        }
        Ok(session)
    }

    fn notify(&self, session: &mut Session, notification: Notification) {
        self.sink.publish(&session.id, &notification);
        session.notify(notification);
    }

    async fn dispatch(&self, session: &mut Session) -> Result<(), PhaseError> {
        match session.phase {
            Phase::Initialization => self.initialize(session).await,
            Phase::StrategyGeneration => self.generate_strategies(session).await,
            Phase::Backtesting => self.run_backtests(session).await,
            Phase::StrategyOptimization => self.optimize(session).await,
            Phase::MockTrading => self.mock_trade(session).await,
            Phase::ConfidenceEvaluation => self.evaluate_confidence(session).await,
            Phase::ReadyForLive => self.ready_for_live(session).await,
            Phase::LiveTrading => self.monitor_live(session).await,
            Phase::ProfitMaximization => self.maximize_profit(session).await,
            Phase::LearningAdaptation => self.learn(session).await,
        }
    }

    async fn initialize(&self, session: &mut Session) -> Result<(), PhaseError> {
        let pair = session.settings.pair.clone();
        let candles = match self.exchange.get_market_data(&pair, self.config.candle_window).await {
            Ok(candles) if !candles.is_empty() => candles,
            Ok(_) => {
                self.notify(session, Notification::warning(Phase::Initialization, "Waiting for market data", format!("No candles for {} yet", pair)));
                return Ok(());
            }
            Err(e) => {
                self.notify(session, Notification::warning(Phase::Initialization, "Market data unavailable", e.to_string()));
                return Ok(());
            }
        };

        match self.exchange.get_account_balance().await {
            Ok(balances) => {
                let quote = pair.split(['_', '/', '-']).nth(1).unwrap_or("USDT");
                let free = balances.iter().find(|b| b.asset == quote).map(|b| b.free).unwrap_or(0.0);
                if free < session.settings.initial_balance {
                    self.notify(
                        session,
                        Notification::warning(
                            Phase::Initialization,
                            "Low exchange balance",
                            format!("{:.2} {} free, session budget {:.2}", free, quote, session.settings.initial_balance),
                        ),
                    );
                }
            }
            Err(e) => {
                self.notify(session, Notification::warning(Phase::Initialization, "Balance unavailable", e.to_string()));
                return Ok(());
            }
        }

        let condition = classify(&candles, &self.config.condition);
        session.market_condition = Some(condition);
        self.notify(
            session,
            Notification::info(Phase::Initialization, "Market assessed", format!("{} is {}", pair, condition)),
        );
        session.advance(Phase::StrategyGeneration);
        Ok(())
    }

    async fn generate_strategies(&self, session: &mut Session) -> Result<(), PhaseError> {
        let pair = session.settings.pair.clone();
        let condition = match self.exchange.get_market_data(&pair, self.config.candle_window).await {
            Ok(candles) if !candles.is_empty() => classify(&candles, &self.config.condition),
            Ok(_) | Err(_) => session.market_condition.unwrap_or(MarketCondition::Ranging),
        };
        session.market_condition = Some(condition);

        let definitions = {
            let seeds: Vec<&EnhancedStrategy> = session.strategies.iter().filter(|s| !s.retired).collect();
            self.generator.generate(
                &pair,
                condition,
                session.generation,
                self.config.candidates_per_generation,
                &seeds,
            )
        };

        if definitions.is_empty() {
            self.notify(
                session,
                Notification::error(Phase::StrategyGeneration, "No strategies generated", format!("Generation {} produced no candidates", session.generation)),
            );
            return Ok(());
        }

        let count = definitions.len();
        session.strategies.extend(definitions.into_iter().map(EnhancedStrategy::new));
        self.notify(
            session,
            Notification::info(
                Phase::StrategyGeneration,
                "Strategies generated",
                format!("{} candidates for {} ({})", count, pair, condition),
            ),
        );
        session.advance(Phase::Backtesting);
        Ok(())
    }

    async fn run_backtests(&self, session: &mut Session) -> Result<(), PhaseError> {
        let outcomes = {
            let mut pending: Vec<&mut EnhancedStrategy> =
                session.strategies.iter_mut().filter(|s| s.backtest.is_none()).collect();
            self.backtests.run_all(&mut pending).await
        };

        let failed = outcomes.iter().filter(|o| o.failed()).count();
        let best = outcomes.iter().map(|o| o.confidence).fold(0.0, f64::max);
        let notification = if failed > 0 {
            Notification::warning(
                Phase::Backtesting,
                "Backtests complete",
                format!("{} run, {} failed, best confidence {:.2}", outcomes.len(), failed, best),
            )
        } else {
            Notification::info(
                Phase::Backtesting,
                "Backtests complete",
                format!("{} run, best confidence {:.2}", outcomes.len(), best),
            )
        };
        self.notify(session, notification);
        session.advance(Phase::StrategyOptimization);
        Ok(())
    }

    async fn optimize(&self, session: &mut Session) -> Result<(), PhaseError> {
        rank(&mut session.strategies);
        let best = session.strategies.iter().find(|s| is_viable(s)).cloned();

        let Some(best) = best else {
            self.notify(
                session,
                Notification::warning(Phase::StrategyOptimization, "No viable strategy", "Generating a new batch"),
            );
            session.generation += 1;
            session.advance(Phase::StrategyGeneration);
            return Ok(());
        };

        session.active_strategy_id = Some(best.id().to_string());
        session.evaluation_cycles = 0;
        session.last_evaluated_trades = 0;
        session.approval_requested = false;
        session.live_approved = false;
        self.notify(
            session,
            Notification::success(Phase::StrategyOptimization, "Strategy selected", best.to_string()),
        );
        session.advance(Phase::MockTrading);
        Ok(())
    }

    async fn mock_trade(&self, session: &mut Session) -> Result<(), PhaseError> {
        let strategy = session.active_strategy().cloned().ok_or(PhaseError::NoActiveStrategy)?;

        let running = match &strategy.mock_session_id {
            Some(id) => self.simulator.session(id).await.filter(|m| m.is_active),
            None => None,
        };
        let mock = match running {
            Some(mock) => mock,
            None => {
                let id = self
                    .simulator
                    .start_session(&strategy.definition, session.settings.initial_balance)
                    .await;
                if let Some(s) = session.active_strategy_mut() {
                    s.mock_session_id = Some(id.clone());
                }
                self.notify(
                    session,
                    Notification::info(Phase::MockTrading, "Paper trading started", strategy.definition.name.clone()),
                );
                self.simulator
                    .session(&id)
                    .await
                    .ok_or_else(|| PhaseError::MockSessionMissing(strategy.id().to_string()))?
            }
        };

        session.performance = mock_snapshot(&mock, session.performance.confidence_score);
        let trades = mock.trades.len();
        if trades >= self.config.min_mock_trades && trades > session.last_evaluated_trades {
            session.advance(Phase::ConfidenceEvaluation);
        } else {
            tracing::debug!(
                "Session {}: {} mock trades, waiting for {}",
                session.id,
                trades,
                self.config.min_mock_trades.max(session.last_evaluated_trades + 1)
            );
        }
        Ok(())
    }

    async fn evaluate_confidence(&self, session: &mut Session) -> Result<(), PhaseError> {
        let strategy = session.active_strategy().cloned().ok_or(PhaseError::NoActiveStrategy)?;
        let mock = self
            .active_mock(&strategy)
            .await
            .ok_or_else(|| PhaseError::MockSessionMissing(strategy.id().to_string()))?;

        let threshold = session.settings.confidence_threshold;
        let metrics = self.scorer.score(&mock, threshold);
        session.evaluation_cycles += 1;
        session.last_evaluated_trades = mock.trades.len();
        session.performance.confidence_score = metrics.overall;
        if let Some(s) = session.active_strategy_mut() {
            s.last_confidence_score = Some(metrics.overall);
            s.last_recommendation = Some(metrics.recommendation);
        }

        tracing::info!(
            "Session {}: confidence {:.1} ({}) after {} trades, cycle {}/{}",
            session.id,
            metrics.overall,
            metrics.recommendation,
            metrics.trade_count,
            session.evaluation_cycles,
            self.config.max_evaluation_cycles
        );

        if metrics.is_ready_for_live(threshold) && metrics.checklist.all_passed() {
            self.notify(
                session,
                Notification::success(
                    Phase::ConfidenceEvaluation,
                    "Ready for live trading",
                    format!("{} scored {:.1} (threshold {:.1})", strategy.definition.name, metrics.overall, threshold),
                ),
            );
            session.advance(Phase::ReadyForLive);
        } else if session.evaluation_cycles >= self.config.max_evaluation_cycles {
            if let Some(s) = session.active_strategy_mut() {
                s.retired = true;
                s.last_recommendation = Some(Recommendation::HighRisk);
            }
            if let Some(mock_id) = &strategy.mock_session_id {
                self.simulator.stop_session(mock_id).await;
            }
            self.notify(
                session,
                Notification::warning(
                    Phase::ConfidenceEvaluation,
                    "Strategy retired",
                    format!(
                        "{} did not reach {:.1} in {} evaluations (last {:.1}, {})",
                        strategy.definition.name,
                        threshold,
                        session.evaluation_cycles,
                        metrics.overall,
                        metrics.recommendation
                    ),
                ),
            );
            session.advance(Phase::LearningAdaptation);
        } else {
            let failing = metrics.checklist.failing();
            tracing::info!(
                "Session {}: more paper trading needed, failing: {}",
                session.id,
                if failing.is_empty() { "threshold".to_string() } else { failing.join(", ") }
            );
            session.advance(Phase::MockTrading);
        }
        Ok(())
    }

    async fn ready_for_live(&self, session: &mut Session) -> Result<(), PhaseError> {
        let strategy = session.active_strategy().cloned().ok_or(PhaseError::NoActiveStrategy)?;

        if !(session.settings.auto_progress_to_live || session.live_approved) {
            if !session.approval_requested {
                session.approval_requested = true;
                let action = NotificationAction::ApproveLiveTrading {
                    session_id: session.id.clone(),
                    strategy_id: strategy.id().to_string(),
                };
                self.notify(
                    session,
                    Notification::new(
                        NotificationType::ActionRequired,
                        Phase::ReadyForLive,
                        "Approve live trading",
                        format!("{} passed paper trading and is waiting for approval", strategy.definition.name),
                    )
                    .with_action(action),
                );
            }
            return Ok(());
        }

        let mock = self
            .active_mock(&strategy)
            .await
            .ok_or_else(|| PhaseError::MockSessionMissing(strategy.id().to_string()))?;
        // Mock ledger is frozen outside paper phases, so this matches the evaluation
        let settings = &session.settings;
        let metrics = self.scorer.score(&mock, settings.confidence_threshold);
        let limits = RiskLimits {
            max_drawdown: settings.max_drawdown,
            required_confidence_score: settings.confidence_threshold,
            ..self.config.risk_limits.clone()
        };
        let fraction = settings.position_size.min(self.config.max_position_fraction);

        let started = self
            .guard
            .start_live_trading(&strategy, &metrics, limits, settings.initial_balance, fraction, settings.stop_loss)
            .await;
        let live_id = match started {
            Ok(id) => id,
            Err(GuardError::EmergencyStopActive(reason)) => {
                self.notify(
                    session,
                    Notification::warning(Phase::ReadyForLive, "Live trading blocked", format!("Emergency stop active: {}", reason)),
                );
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        if let Some(mock_id) = &strategy.mock_session_id {
            self.simulator.stop_session(mock_id).await;
        }
        if let Some(s) = session.active_strategy_mut() {
            s.mock_session_id = None;
            s.live_session_id = Some(live_id.clone());
        }
        self.notify(
            session,
            Notification::success(
                Phase::ReadyForLive,
                "Live trading started",
                format!("{} live as {}", strategy.definition.name, live_id),
            ),
        );
        session.advance(Phase::LiveTrading);
        Ok(())
    }

    async fn monitor_live(&self, session: &mut Session) -> Result<(), PhaseError> {
        let (live_id, live) = self.active_live(session).await?;
        session.performance = live_snapshot(&live, session.performance.confidence_score);

        if !live.is_active {
            let reason = live.stop_reason.clone().unwrap_or_else(|| "stopped".to_string());
            self.notify(
                session,
                Notification::error(Phase::LiveTrading, "Live trading halted", reason),
            );
            session.advance(Phase::LearningAdaptation);
            return Ok(());
        }

        let drawdown = live.current_drawdown();
        let total_return = live.total_return();
        if drawdown >= session.settings.max_drawdown {
            let reason = format!(
                "Drawdown {:.2}% reached limit {:.2}%",
                drawdown * 100.0,
                session.settings.max_drawdown * 100.0
            );
            self.guard.stop_live_trading(&live_id, &reason).await?;
            self.notify(session, Notification::error(Phase::LiveTrading, "Drawdown limit reached", reason));
            session.advance(Phase::LearningAdaptation);
        } else if total_return >= session.settings.profit_target {
            self.notify(
                session,
                Notification::success(
                    Phase::LiveTrading,
                    "Profit target reached",
                    format!("Return {:.2}% against target {:.2}%", total_return * 100.0, session.settings.profit_target * 100.0),
                ),
            );
            session.advance(Phase::ProfitMaximization);
        }
        Ok(())
    }

    async fn maximize_profit(&self, session: &mut Session) -> Result<(), PhaseError> {
        let (live_id, live) = self.active_live(session).await?;
        if !live.is_active {
            session.advance(Phase::LearningAdaptation);
            return Ok(());
        }

        let fraction = (live.position_fraction * 1.25).min(self.config.max_position_fraction);
        self.guard.set_position_fraction(&live_id, fraction).await?;

        let previous_target = session.settings.profit_target;
        session.settings.profit_target = (previous_target * 1.5).max(live.total_return() * 1.25);
        self.notify(
            session,
            Notification::success(
                Phase::ProfitMaximization,
                "Scaling up",
                format!(
                    "Position size {:.1}%, next target {:.2}%",
                    fraction * 100.0,
                    session.settings.profit_target * 100.0
                ),
            ),
        );
        session.advance(Phase::LiveTrading);
        Ok(())
    }

    async fn learn(&self, session: &mut Session) -> Result<(), PhaseError> {
        let condition = session.market_condition.unwrap_or(MarketCondition::Ranging);

        if let Some(strategy) = session.active_strategy().cloned() {
            let mut realized_return = 0.0;
            if let Some(live_id) = &strategy.live_session_id {
                if let Some(live) = self.guard.live_session(live_id).await {
                    realized_return = live.total_return();
                }
                self.guard.stop_live_trading(live_id, "learning adaptation").await?;
            } else if let Some(mock_id) = &strategy.mock_session_id {
                if let Some(mock) = self.simulator.stop_session(mock_id).await {
                    realized_return = mock.performance.total_return;
                }
            }

            if let Some(s) = session.active_strategy_mut() {
                let current = s.last_confidence_score.map(|c| c / 100.0).unwrap_or(s.confidence);
                let previous = s.confidence;
                s.learning.record_generation(previous, current, condition, realized_return);
                s.mock_session_id = None;
                s.live_session_id = None;
            }
        }

        rank(&mut session.strategies);
        session.strategies.retain(|s| !s.retired);
        session.strategies.truncate(self.config.retained_strategies);

        session.active_strategy_id = None;
        session.evaluation_cycles = 0;
        session.last_evaluated_trades = 0;
        session.approval_requested = false;
        session.live_approved = false;
        session.generation += 1;

        let retained = session.strategies.len();
        let generation = session.generation;
        self.notify(
            session,
            Notification::info(
                Phase::LearningAdaptation,
                "Learning cycle complete",
                format!("Retained {} strategies, starting generation {}", retained, generation),
            ),
        );
        session.advance(Phase::StrategyGeneration);
        Ok(())
    }

    async fn active_mock(&self, strategy: &EnhancedStrategy) -> Option<MockTradingSession> {
        let id = strategy.mock_session_id.as_deref()?;
        self.simulator.session(id).await
    }

    async fn active_live(&self, session: &Session) -> Result<(String, LiveTradingSession), PhaseError> {
        let strategy = session.active_strategy().ok_or(PhaseError::NoActiveStrategy)?;
        let live_id = strategy
            .live_session_id
            .clone()
            .ok_or_else(|| PhaseError::LiveSessionMissing(strategy.id().to_string()))?;
        let live = self
            .guard
            .live_session(&live_id)
            .await
            .ok_or_else(|| GuardError::LiveSessionNotFound(live_id.clone()))?;
        Ok((live_id, live))
    }
}

fn mock_snapshot(mock: &MockTradingSession, confidence_score: f64) -> PerformanceSnapshot {
    let balances = mock.balance_curve();
    PerformanceSnapshot {
        balance: mock.balance,
        total_return: mock.performance.total_return,
        current_drawdown: crate::domain::current_drawdown(&balances),
        max_drawdown: mock.performance.max_drawdown,
        total_trades: mock.trades.len(),
        win_rate: mock.performance.win_rate(),
        confidence_score,
        updated_at: Some(Utc::now()),
    }
}

fn live_snapshot(live: &LiveTradingSession, confidence_score: f64) -> PerformanceSnapshot {
    let closed: Vec<f64> = live
        .trades
        .iter()
        .filter(|t| t.status == TradeStatus::Filled)
        .filter_map(|t| t.realized_pnl)
        .collect();
    let wins = closed.iter().filter(|p| **p > 0.0).count();
    PerformanceSnapshot {
        balance: live.balance,
        total_return: live.total_return(),
        current_drawdown: live.current_drawdown(),
        max_drawdown: live.max_drawdown(),
        total_trades: live.trades.iter().filter(|t| t.status == TradeStatus::Filled).count(),
        win_rate: if closed.is_empty() { 0.0 } else { wins as f64 / closed.len() as f64 },
        confidence_score,
        updated_at: Some(Utc::now()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::live_guard::GuardConfig;
    use crate::application::mock_simulator::MockSimulatorConfig;
    use crate::adapters::store::InMemorySessionStore;
    use crate::domain::{EmergencyStop, Signal, StrategyDefinition, StrategyFamily, StrategySignal};
    use crate::ports::mocks::{
        candle_series, metrics_with, FixedScorer, FixedSignal, MockExchange, RecordingSink, ScriptedBacktest,
    };
    use crate::ports::{BacktestError, BacktestResult, BacktestTrade};

    struct Harness {
        orchestrator: Arc<PhaseOrchestrator>,
        exchange: Arc<MockExchange>,
        signal: Arc<FixedSignal>,
        scorer: Arc<FixedScorer>,
        sink: Arc<RecordingSink>,
    }

    fn trending_closes() -> Vec<f64> {
        (0..120).map(|i| 100.0 + i as f64 * 0.5 + if i % 2 == 0 { 0.3 } else { -0.3 }).collect()
    }

    fn profitable_backtest() -> BacktestResult {
        let now = Utc::now();
        BacktestResult {
            total_pnl: 500.0,
            total_return: 0.05,
            win_rate: 0.6,
            sharpe_ratio: 1.2,
            max_drawdown: 0.04,
            profit_factor: 1.7,
            trades: vec![BacktestTrade {
                side: Signal::Buy,
                entry_time: now,
                exit_time: now,
                entry_price: 100.0,
                exit_price: 105.0,
                quantity: 1.0,
                pnl: 5.0,
            }],
        }
    }

    fn harness(backtest: ScriptedBacktest) -> Harness {
        harness_with(backtest, OrchestratorConfig { max_evaluation_cycles: 2, ..Default::default() })
    }

    fn harness_with(backtest: ScriptedBacktest, config: OrchestratorConfig) -> Harness {
        let exchange = Arc::new(MockExchange::new().with_candles(candle_series(&trending_closes())));
        let signal = Arc::new(FixedSignal::new(StrategySignal::hold(0.5)));
        let scorer = Arc::new(FixedScorer::new(metrics_with(40.0, Recommendation::NeedsImprovement, 12)));
        let sink = Arc::new(RecordingSink::new());
        let simulator = Arc::new(MockTradingSimulator::new(
            MockSimulatorConfig { seed: Some(1), ..Default::default() },
            signal.clone(),
        ));
        let guard = Arc::new(LiveTradingGuard::new(
            GuardConfig { fee_rate: 0.0, ..Default::default() },
            exchange.clone(),
            Arc::new(EmergencyStop::new()),
        ));
        let orchestrator = PhaseOrchestrator::new(
            config,
            OrchestratorDeps {
                store: Arc::new(InMemorySessionStore::new()),
                exchange: exchange.clone(),
                signals: signal.clone(),
                backtest: Arc::new(backtest),
                scorer: scorer.clone(),
                sink: sink.clone(),
                simulator,
                guard,
            },
        );
        Harness { orchestrator: Arc::new(orchestrator), exchange, signal, scorer, sink }
    }

    /// Alternate buy and sell ticks until the mock ledger has `n` trades
    async fn paper_trade(h: &Harness, id: &str, n: usize) {
        for i in 0..n {
            let side = if i % 2 == 0 { Signal::Buy } else { Signal::Sell };
            h.signal.set(StrategySignal::new(side, 0.9));
            h.orchestrator.poll_market_data(id).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_walks_to_mock_trading() {
        let h = harness(ScriptedBacktest::always(Ok(profitable_backtest())));
        let id = h.orchestrator.create_session("alice", Settings::default()).await.unwrap();

        assert_eq!(h.orchestrator.step(&id).await.unwrap(), Phase::StrategyGeneration);
        assert_eq!(h.orchestrator.step(&id).await.unwrap(), Phase::Backtesting);
        assert_eq!(h.orchestrator.step(&id).await.unwrap(), Phase::StrategyOptimization);
        assert_eq!(h.orchestrator.step(&id).await.unwrap(), Phase::MockTrading);

        let session = h.orchestrator.session(&id).await.unwrap();
        assert_eq!(session.strategies.len(), 6);
        assert!(session.active_strategy().is_some());
    }

    #[tokio::test]
    async fn test_market_data_failure_keeps_phase() {
        let h = harness(ScriptedBacktest::always(Ok(profitable_backtest())));
        h.exchange.set_market_data_failure(true);
        let id = h.orchestrator.create_session("alice", Settings::default()).await.unwrap();

        assert_eq!(h.orchestrator.step(&id).await.unwrap(), Phase::Initialization);
        assert_eq!(h.sink.of_kind(NotificationType::Warning).len(), 1);

        h.exchange.set_market_data_failure(false);
        assert_eq!(h.orchestrator.step(&id).await.unwrap(), Phase::StrategyGeneration);
    }

    #[tokio::test]
    async fn test_no_viable_strategy_regenerates() {
        let h = harness(ScriptedBacktest::always(Err(BacktestError::DataUnavailable("down".into()))));
        let id = h.orchestrator.create_session("alice", Settings::default()).await.unwrap();
        for _ in 0..3 {
            h.orchestrator.step(&id).await.unwrap();
        }
        assert_eq!(h.orchestrator.step(&id).await.unwrap(), Phase::StrategyGeneration);
        assert_eq!(h.orchestrator.session(&id).await.unwrap().generation, 1);
    }

    #[tokio::test]
    async fn test_evaluation_cap_retires_strategy() {
        let h = harness(ScriptedBacktest::always(Ok(profitable_backtest())));
        let id = h.orchestrator.create_session("alice", Settings::default()).await.unwrap();
        for _ in 0..5 {
            h.orchestrator.step(&id).await.unwrap();
        }
        paper_trade(&h, &id, 10).await;
        assert_eq!(h.orchestrator.step(&id).await.unwrap(), Phase::ConfidenceEvaluation);
        assert_eq!(h.orchestrator.step(&id).await.unwrap(), Phase::MockTrading);

        // No new trades, so no new evaluation
        assert_eq!(h.orchestrator.step(&id).await.unwrap(), Phase::MockTrading);

        paper_trade(&h, &id, 2).await;
        assert_eq!(h.orchestrator.step(&id).await.unwrap(), Phase::ConfidenceEvaluation);
        assert_eq!(h.orchestrator.step(&id).await.unwrap(), Phase::LearningAdaptation);
        assert_eq!(h.scorer.calls(), 2);

        assert_eq!(h.orchestrator.step(&id).await.unwrap(), Phase::StrategyGeneration);
        let session = h.orchestrator.session(&id).await.unwrap();
        assert!(session.strategies.iter().all(|s| !s.retired));
        assert!(session.strategies.len() <= 3);
        assert!(session.active_strategy_id.is_none());
    }

    #[tokio::test]
    async fn test_approval_requested_once() {
        let h = harness(ScriptedBacktest::always(Ok(profitable_backtest())));
        h.scorer.set(metrics_with(80.0, Recommendation::ReadyForLive, 12));
        let id = h.orchestrator.create_session("alice", Settings::default()).await.unwrap();
        for _ in 0..5 {
            h.orchestrator.step(&id).await.unwrap();
        }
        paper_trade(&h, &id, 10).await;
        h.orchestrator.step(&id).await.unwrap();
        assert_eq!(h.orchestrator.step(&id).await.unwrap(), Phase::ReadyForLive);

        assert_eq!(h.orchestrator.step(&id).await.unwrap(), Phase::ReadyForLive);
        assert_eq!(h.orchestrator.step(&id).await.unwrap(), Phase::ReadyForLive);
        let requests = h.sink.of_kind(NotificationType::ActionRequired);
        assert_eq!(requests.len(), 1);
        assert!(requests[0].1.action.is_some());

        h.orchestrator.approve_live(&id).await.unwrap();
        assert_eq!(h.orchestrator.step(&id).await.unwrap(), Phase::LiveTrading);
        let session = h.orchestrator.session(&id).await.unwrap();
        let strategy = session.active_strategy().unwrap();
        assert!(strategy.live_session_id.is_some());
        assert!(strategy.mock_session_id.is_none());
    }

    #[tokio::test]
    async fn test_approve_outside_ready_phase() {
        let h = harness(ScriptedBacktest::always(Ok(profitable_backtest())));
        let id = h.orchestrator.create_session("alice", Settings::default()).await.unwrap();
        assert!(matches!(
            h.orchestrator.approve_live(&id).await,
            Err(OrchestratorError::NotAwaitingApproval(_))
        ));
    }

    #[tokio::test]
    async fn test_one_active_session_per_user() {
        let h = harness(ScriptedBacktest::always(Ok(profitable_backtest())));
        h.orchestrator.create_session("alice", Settings::default()).await.unwrap();
        assert!(matches!(
            h.orchestrator.create_session("alice", Settings::default()).await,
            Err(OrchestratorError::ActiveSessionExists(_))
        ));
        let bad = Settings { max_drawdown: 2.0, ..Default::default() };
        assert!(matches!(
            h.orchestrator.create_session("bob", bad).await,
            Err(OrchestratorError::InvalidSettings(_))
        ));
    }

    #[tokio::test]
    async fn test_stop_then_step_is_inactive() {
        let h = harness(ScriptedBacktest::always(Ok(profitable_backtest())));
        let id = h.orchestrator.create_session("alice", Settings::default()).await.unwrap();
        h.orchestrator.stop(&id).await.unwrap();

        assert!(matches!(h.orchestrator.step(&id).await, Err(OrchestratorError::SessionInactive(_))));
        assert!(matches!(h.orchestrator.stop(&id).await, Err(OrchestratorError::SessionInactive(_))));
        assert!(matches!(
            h.orchestrator.step("missing").await,
            Err(OrchestratorError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_handler_failure_is_critical_and_retried() {
        let h = harness(ScriptedBacktest::always(Ok(profitable_backtest())));
        let id = h.orchestrator.create_session("alice", Settings::default()).await.unwrap();

        // Force MOCK_TRADING without a selected strategy
        let mut session = h.orchestrator.session(&id).await.unwrap();
        session.phase = Phase::MockTrading;
        h.orchestrator.store.put(session).await.unwrap();

        assert_eq!(h.orchestrator.step(&id).await.unwrap(), Phase::MockTrading);
        let critical = h.sink.of_kind(NotificationType::Critical);
        assert_eq!(critical.len(), 1);
        assert_eq!(critical[0].1.phase, Phase::MockTrading);
    }

    #[tokio::test]
    async fn test_emergency_stop_all_does_not_wait_on_hung_step() {
        let config = OrchestratorConfig { stop_timeout: Duration::from_millis(100), ..Default::default() };
        let h = harness_with(ScriptedBacktest::always(Ok(profitable_backtest())), config);
        let id = h.orchestrator.create_session("alice", Settings::default()).await.unwrap();

        // Live session owned by no orchestration session
        let standalone = EnhancedStrategy::new(StrategyDefinition {
            id: "standalone".into(),
            name: "standalone".into(),
            pair: "BTC_USDT".into(),
            family: StrategyFamily::Momentum { fast_period: 5, slow_period: 20 },
            generation: 0,
            target_condition: MarketCondition::TrendingUp,
            created_at: Utc::now(),
        });
        let live_id = h
            .orchestrator
            .guard()
            .start_live_trading(
                &standalone,
                &metrics_with(80.0, Recommendation::ReadyForLive, 40),
                RiskLimits::default(),
                10_000.0,
                0.1,
                0.0,
            )
            .await
            .unwrap();

        h.exchange.set_market_data_delay(Duration::from_secs(30));
        let stepping = {
            let orchestrator = h.orchestrator.clone();
            let id = id.clone();
            tokio::spawn(async move { orchestrator.step(&id).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let stopped = tokio::time::timeout(Duration::from_secs(2), h.orchestrator.emergency_stop_all("flash crash"))
            .await
            .expect("emergency stop waited on the hung step")
            .unwrap();
        assert_eq!(stopped, vec![id.clone()]);

        let live = h.orchestrator.guard().live_session(&live_id).await.unwrap();
        assert!(!live.is_active);
        assert_eq!(live.stop_reason.as_deref(), Some("flash crash"));

        let session = h.orchestrator.session(&id).await.unwrap();
        assert!(!session.is_active);
        assert_eq!(session.emergency_reason.as_deref(), Some("flash crash"));
        stepping.abort();
    }

    #[tokio::test]
    async fn test_step_finishing_after_stop_is_discarded() {
        let config = OrchestratorConfig { stop_timeout: Duration::from_millis(50), ..Default::default() };
        let h = harness_with(ScriptedBacktest::always(Ok(profitable_backtest())), config);
        let id = h.orchestrator.create_session("alice", Settings::default()).await.unwrap();

        h.exchange.set_market_data_delay(Duration::from_millis(300));
        let stepping = {
            let orchestrator = h.orchestrator.clone();
            let id = id.clone();
            tokio::spawn(async move { orchestrator.step(&id).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.orchestrator.stop(&id).await.unwrap();

        assert!(matches!(stepping.await.unwrap(), Err(OrchestratorError::SessionInactive(_))));
        let session = h.orchestrator.session(&id).await.unwrap();
        assert!(!session.is_active);
        assert_eq!(session.phase, Phase::Initialization);
    }

    #[tokio::test]
    async fn test_safety_monitor_restarts_after_shutdown() {
        let h = harness(ScriptedBacktest::always(Ok(profitable_backtest())));
        let guard = h.orchestrator.guard().clone();

        h.orchestrator.start("alice", Settings::default()).await.unwrap();
        assert!(guard.is_monitor_running());
        h.orchestrator.shutdown().await;
        assert!(!guard.is_monitor_running());

        h.orchestrator.start("alice", Settings::default()).await.unwrap();
        assert!(guard.is_monitor_running());
        h.orchestrator.shutdown().await;
        assert!(!guard.is_monitor_running());
    }
}
