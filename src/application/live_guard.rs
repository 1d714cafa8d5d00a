//! Live Trading Guard
//!
//! Gates and executes real orders for live sessions. Every trade attempt
//! passes these checks in order, stopping at the first failure:
//!
//! 1. process-wide emergency stop clear
//! 2. session rate limit (rolling 60s window)
//! 3. signal confidence at or above the minimum
//! 4. current drawdown below the session limit
//! 5. today's loss below the daily limit
//! 6. open positions below the maximum (entries only)
//!
//! A rejected attempt creates no trade record. An accepted attempt is
//! recorded PENDING before the exchange is called and always ends up
//! FILLED, FAILED or CANCELLED.
//!
//! A stop never cancels a trade whose order is still at the exchange.
//! The executing task resolves it, and a fill that lands after the stop
//! is recorded and then closed at market.
//!
//! A background sweep re-checks drawdown and daily loss for every active
//! session and stops any session in hard breach.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::domain::rate_limiter::DEFAULT_MAX_TRADES_PER_MINUTE;
use crate::domain::{
    next_id, Candle, ConfidenceMetrics, EmergencyStop, EnhancedStrategy, LivePosition, LiveTrade,
    LiveTradingSession, RateLimiter, Recommendation, RiskCheck, RiskLimits, RiskViolation,
    SafetyStatus, Signal, StrategyId, StrategySignal, TradeStatus,
};
use crate::ports::{ConditionalOrderRequest, ExchangePort, OrderRequest, OrderType};

#[derive(Debug, Clone)]
pub struct GuardConfig {
    pub max_trades_per_minute: usize,
    pub min_signal_confidence: f64,
    pub sweep_interval: Duration,
    /// Fee rate applied when the exchange reports no fee
    pub fee_rate: f64,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            max_trades_per_minute: DEFAULT_MAX_TRADES_PER_MINUTE,
            min_signal_confidence: 0.7,
            sweep_interval: Duration::from_secs(30),
            fee_rate: 0.001,
        }
    }
}

/// Why a trade attempt was refused. Expected control flow, not an error.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TradeRejection {
    #[error("Emergency stop active")]
    EmergencyStop,

    #[error("Rate limited: {0} trades in window (max {1})")]
    RateLimited(usize, usize),

    #[error("Signal confidence {0:.2} below minimum {1:.2}")]
    LowConfidence(f64, f64),

    #[error("Drawdown limit: {0}")]
    DrawdownLimit(RiskViolation),

    #[error("Daily loss limit: {0}")]
    DailyLossLimit(RiskViolation),

    #[error("Position limit: {0}")]
    MaxPositions(RiskViolation),

    #[error("Live session inactive")]
    SessionInactive,

    #[error("Invalid market data: {0}")]
    InvalidMarketData(String),

    #[error("Signal is not actionable")]
    NotActionable,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum GuardError {
    #[error("Live session not found: {0}")]
    LiveSessionNotFound(String),

    #[error("Strategy {0} already has an active live session")]
    LiveSessionExists(String),

    #[error("Strategy {0} is not ready for live trading ({1})")]
    NotReadyForLive(String, Recommendation),

    #[error("Confidence {0:.1} below required {1:.1}")]
    InsufficientConfidence(f64, f64),

    #[error("Emergency stop active: {0}")]
    EmergencyStopActive(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum GuardEvent {
    LiveSessionStopped {
        live_session_id: String,
        strategy_id: StrategyId,
        reason: String,
    },
}

struct LiveEntry {
    session: LiveTradingSession,
    limiter: RateLimiter,
    /// Trades whose order has been sent and not yet answered
    in_flight: HashSet<u64>,
}

pub struct LiveTradingGuard {
    config: GuardConfig,
    exchange: Arc<dyn ExchangePort>,
    emergency: Arc<EmergencyStop>,
    sessions: RwLock<HashMap<String, Arc<Mutex<LiveEntry>>>>,
    /// Active live session per strategy
    by_strategy: RwLock<HashMap<StrategyId, String>>,
    events: broadcast::Sender<GuardEvent>,
    monitor_running: AtomicBool,
}

impl LiveTradingGuard {
    pub fn new(config: GuardConfig, exchange: Arc<dyn ExchangePort>, emergency: Arc<EmergencyStop>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            config,
            exchange,
            emergency,
            sessions: RwLock::new(HashMap::new()),
            by_strategy: RwLock::new(HashMap::new()),
            events,
            monitor_running: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    pub fn emergency(&self) -> &Arc<EmergencyStop> {
        &self.emergency
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GuardEvent> {
        self.events.subscribe()
    }

    /// Open a live session for a strategy that passed the readiness gate
    pub async fn start_live_trading(
        &self,
        strategy: &EnhancedStrategy,
        metrics: &ConfidenceMetrics,
        limits: RiskLimits,
        initial_balance: f64,
        position_fraction: f64,
        stop_loss: f64,
    ) -> Result<String, GuardError> {
        if self.emergency.is_active() {
            let reason = self.emergency.record().map(|r| r.reason).unwrap_or_default();
            return Err(GuardError::EmergencyStopActive(reason));
        }
        if metrics.recommendation != Recommendation::ReadyForLive {
            return Err(GuardError::NotReadyForLive(strategy.id().to_string(), metrics.recommendation));
        }
        if metrics.overall < limits.required_confidence_score {
            return Err(GuardError::InsufficientConfidence(
                metrics.overall,
                limits.required_confidence_score,
            ));
        }

        let mut by_strategy = self.by_strategy.write().await;
        if by_strategy.contains_key(strategy.id()) {
            return Err(GuardError::LiveSessionExists(strategy.id().to_string()));
        }

        let id = next_id("live");
        let session = LiveTradingSession::new(
            id.clone(),
            strategy.id().to_string(),
            strategy.definition.pair.clone(),
            limits,
            initial_balance,
            position_fraction,
            stop_loss,
            Utc::now(),
        );
        let entry = LiveEntry {
            session,
            limiter: RateLimiter::new(self.config.max_trades_per_minute),
            in_flight: HashSet::new(),
        };
        self.sessions.write().await.insert(id.clone(), Arc::new(Mutex::new(entry)));
        by_strategy.insert(strategy.id().to_string(), id.clone());

        tracing::info!(
            "Live session {} started for {} (confidence {:.1}, balance {:.2})",
            id,
            strategy.definition.name,
            metrics.overall,
            initial_balance
        );
        Ok(id)
    }

    pub async fn live_session(&self, live_session_id: &str) -> Option<LiveTradingSession> {
        let entry = self.entry(live_session_id).await?;
        let guard = entry.lock().await;
        Some(guard.session.clone())
    }

    pub async fn active_session_for(&self, strategy_id: &str) -> Option<String> {
        self.by_strategy.read().await.get(strategy_id).cloned()
    }

    pub async fn active_sessions(&self) -> Vec<String> {
        self.by_strategy.read().await.values().cloned().collect()
    }

    pub async fn set_position_fraction(&self, live_session_id: &str, fraction: f64) -> Result<(), GuardError> {
        let entry = self
            .entry(live_session_id)
            .await
            .ok_or_else(|| GuardError::LiveSessionNotFound(live_session_id.to_string()))?;
        let mut guard = entry.lock().await;
        guard.session.position_fraction = fraction.clamp(0.0, 1.0);
        Ok(())
    }

    /// Run the pre-trade checks without trading
    pub async fn evaluate_trade(
        &self,
        live_session_id: &str,
        signal: &StrategySignal,
        candles: &[Candle],
    ) -> Result<(), TradeRejection> {
        let entry = self
            .entry(live_session_id)
            .await
            .ok_or(TradeRejection::SessionInactive)?;
        let mut guard = entry.lock().await;
        self.check(&mut guard, signal, candles, Utc::now()).map(|_| ())
    }

    /// Gate, record and submit one trade. None means the attempt was
    /// rejected before anything was recorded.
    pub async fn execute_live_trade(
        &self,
        live_session_id: &str,
        signal: &StrategySignal,
        candles: &[Candle],
    ) -> Option<LiveTrade> {
        self.execute_live_trade_at(live_session_id, signal, candles, Utc::now()).await
    }

    pub async fn execute_live_trade_at(
        &self,
        live_session_id: &str,
        signal: &StrategySignal,
        candles: &[Candle],
        now: DateTime<Utc>,
    ) -> Option<LiveTrade> {
        if self.emergency.is_active() {
            tracing::debug!("Live trade on {} refused: emergency stop active", live_session_id);
            return None;
        }
        let entry = self.entry(live_session_id).await?;

        let (trade_id, request, replaced_stop) = {
            let mut guard = entry.lock().await;
            let (side, price) = match self.check(&mut guard, signal, candles, now) {
                Ok(accepted) => accepted,
                Err(rejection) => {
                    tracing::warn!("Live trade on {} rejected: {}", live_session_id, rejection);
                    return None;
                }
            };
            // Check and append as one step under the session lock
            if !guard.limiter.try_acquire(now) {
                return None;
            }

            let LiveEntry { session, in_flight, .. } = &mut *guard;
            let closing = session.position_closed_by(side).cloned();
            let quantity = match &closing {
                Some(position) => position.quantity,
                None => (session.balance * session.position_fraction / price).min(session.limits.max_position_size),
            };
            if !(quantity.is_finite() && quantity > 0.0) {
                session.safety.warn(format!("Computed order quantity {} is not tradable", quantity));
                return None;
            }

            let trade_id =
                session.open_pending_trade(side, quantity, price, signal.confidence, closing.is_some(), now);
            in_flight.insert(trade_id);
            let request = OrderRequest {
                pair: session.pair.clone(),
                side,
                order_type: OrderType::Market,
                quantity,
                price: Some(price),
            };
            (trade_id, request, closing.and_then(|p| p.stop_order_id))
        };

        let result = self.exchange.place_order(request.clone()).await;

        let (trade, new_stop, orphan) = {
            let mut guard = entry.lock().await;
            guard.in_flight.remove(&trade_id);
            let session = &mut guard.session;
            let mut new_stop = None;
            // Position left open because the session stopped while this order was out
            let mut orphan = None;

            match result {
                Ok(ack) if ack.success => {
                    let fill_price = ack.fill_price.unwrap_or(request.price.unwrap_or_default());
                    let fee = if ack.fee > 0.0 {
                        ack.fee
                    } else {
                        request.quantity * fill_price * self.config.fee_rate
                    };
                    let filled = session
                        .trade_mut(trade_id)
                        .map(|t| t.mark_filled(ack.order_id.clone(), fill_price, fee, now))
                        .unwrap_or(false);

                    if filled && !session.is_active {
                        let realized = session.settle_fill(trade_id, now);
                        session.safety.error(format!(
                            "Order {} for trade {} filled after session stop",
                            ack.order_id, trade_id
                        ));
                        tracing::error!(
                            "Live session {} stopped with order {} in flight, filled {:.6} @ {:.4}",
                            session.id,
                            ack.order_id,
                            request.quantity,
                            fill_price
                        );
                        if realized.is_none() {
                            orphan = session.positions.last().cloned();
                        }
                    } else if filled {
                        let realized = session.settle_fill(trade_id, now);
                        tracing::info!(
                            "LIVE {} {} {:.6} @ {:.4} fee {:.4} (order {}){}",
                            session.pair,
                            request.side,
                            request.quantity,
                            fill_price,
                            fee,
                            ack.order_id,
                            realized.map(|p| format!(" pnl {:+.2}", p)).unwrap_or_default()
                        );
                        if realized.is_none() && session.stop_loss > 0.0 {
                            new_stop = Some(ConditionalOrderRequest {
                                pair: session.pair.clone(),
                                side: request.side.opposite(),
                                quantity: request.quantity,
                                trigger_price: stop_price(request.side, fill_price, session.stop_loss),
                            });
                        }
                    }
                }
                Ok(ack) => {
                    let message = ack.message.unwrap_or_else(|| "order not accepted".to_string());
                    tracing::warn!("Live order on {} not accepted: {}", session.id, message);
                    if let Some(t) = session.trade_mut(trade_id) {
                        t.mark_failed(message, now);
                    }
                }
                Err(e) => {
                    tracing::warn!("Live order on {} failed: {}", session.id, e);
                    session.safety.error(format!("Order for trade {} failed: {}", trade_id, e));
                    if let Some(t) = session.trade_mut(trade_id) {
                        t.mark_failed(e.to_string(), now);
                    }
                }
            }

            let trade = session.trade(trade_id).cloned();
            let failed_close = trade
                .as_ref()
                .map(|t| t.closes_position && t.status == TradeStatus::Failed)
                .unwrap_or(false);
            if failed_close && !session.is_active {
                // The stop skipped this position because a close was out
                orphan = session.position_closed_by(request.side).cloned();
            }
            (trade, new_stop, orphan)
        };

        let filled = trade.as_ref().map(|t| t.status == TradeStatus::Filled).unwrap_or(false);
        if filled {
            if let Some(stop_id) = replaced_stop {
                self.cancel_stop(&entry, &request.pair, &stop_id).await;
            }
            if let Some(stop) = new_stop {
                self.place_stop(&entry, stop, trade.as_ref().and_then(|t| t.fill_price)).await;
            }
        }
        if let Some(position) = orphan {
            if let Some(stop_id) = &position.stop_order_id {
                self.cancel_stop(&entry, &request.pair, stop_id).await;
            }
            self.close_position(&entry, &request.pair, &position, now).await;
        }

        trade
    }

    /// Stop a live session. Pending trades not yet sent are cancelled,
    /// protective orders removed and open positions closed at market on a
    /// best-effort basis. Trades with an order in flight are left to the
    /// executing task. Returns false if the session was already stopped.
    pub async fn stop_live_trading(&self, live_session_id: &str, reason: &str) -> Result<bool, GuardError> {
        self.stop_live_trading_at(live_session_id, reason, Utc::now()).await
    }

    pub async fn stop_live_trading_at(
        &self,
        live_session_id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, GuardError> {
        let entry = self
            .entry(live_session_id)
            .await
            .ok_or_else(|| GuardError::LiveSessionNotFound(live_session_id.to_string()))?;

        let (strategy_id, pair, positions) = {
            let mut guard = entry.lock().await;
            let LiveEntry { session, in_flight, .. } = &mut *guard;
            if !session.stop(reason, now) {
                return Ok(false);
            }
            let mut positions = session.positions.clone();
            for trade in session.trades.iter_mut().filter(|t| t.status == TradeStatus::Pending) {
                if !in_flight.contains(&trade.id) {
                    trade.mark_cancelled(reason, now);
                } else if trade.closes_position {
                    if let Some(index) = positions.iter().position(|p| p.side == trade.side.opposite()) {
                        positions.remove(index);
                    }
                }
            }
            session.safety.error(format!("Session stopped: {}", reason));
            (session.strategy_id.clone(), session.pair.clone(), positions)
        };
        tracing::error!("Live session {} stopped: {}", live_session_id, reason);

        for position in positions {
            if let Some(stop_id) = &position.stop_order_id {
                self.cancel_stop(&entry, &pair, stop_id).await;
            }
            self.close_position(&entry, &pair, &position, now).await;
        }

        {
            let mut by_strategy = self.by_strategy.write().await;
            if by_strategy.get(&strategy_id).map(|id| id == live_session_id).unwrap_or(false) {
                by_strategy.remove(&strategy_id);
            }
        }

        // No subscribers is fine
        let _ = self.events.send(GuardEvent::LiveSessionStopped {
            live_session_id: live_session_id.to_string(),
            strategy_id,
            reason: reason.to_string(),
        });
        Ok(true)
    }

    /// Flip the process-wide flag, then stop every active live session.
    /// Returns the ids that were stopped.
    pub async fn emergency_stop_all(&self, reason: &str) -> Vec<String> {
        self.emergency.activate(reason);

        let mut stopped = Vec::new();
        for id in self.active_sessions().await {
            match self.stop_live_trading(&id, reason).await {
                Ok(true) => stopped.push(id),
                Ok(false) => {}
                Err(e) => tracing::error!("Emergency stop of {} failed: {}", id, e),
            }
        }
        stopped
    }

    pub fn clear_emergency_stop(&self) {
        self.emergency.clear();
    }

    /// One safety pass over every active session. Returns the sessions it
    /// stopped along with the breach.
    pub async fn sweep_all(&self) -> Vec<(String, RiskViolation)> {
        self.sweep_all_at(Utc::now()).await
    }

    pub async fn sweep_all_at(&self, now: DateTime<Utc>) -> Vec<(String, RiskViolation)> {
        let entries: Vec<(String, Arc<Mutex<LiveEntry>>)> = self
            .sessions
            .read()
            .await
            .iter()
            .map(|(id, entry)| (id.clone(), entry.clone()))
            .collect();

        let mut stopped = Vec::new();
        for (id, entry) in entries {
            let breach = {
                let mut guard = entry.lock().await;
                let session = &mut guard.session;
                if !session.is_active {
                    continue;
                }
                session.roll_day(now);
                let drawdown = session.current_drawdown();
                let daily_loss = session.daily_loss();

                let safety = &mut session.safety;
                safety.last_check = Some(now);
                safety.emergency_stop_clear = !self.emergency.is_active();
                safety.drawdown_ok = session.limits.validate_drawdown(drawdown).is_ok();
                safety.daily_loss_ok = session.limits.validate_daily_loss(daily_loss).is_ok();

                match session.limits.check_hard_limits(drawdown, daily_loss) {
                    Err(violation) if violation.is_hard_breach() => Some(violation),
                    _ => None,
                }
            };

            if let Some(violation) = breach {
                tracing::error!("Safety sweep: live session {} in breach: {}", id, violation);
                match self.stop_live_trading_at(&id, &violation.to_string(), now).await {
                    Ok(_) => stopped.push((id, violation)),
                    Err(e) => {
                        let mut guard = entry.lock().await;
                        guard.session.safety.error(format!("Sweep could not stop session: {}", e));
                    }
                }
            }
        }
        stopped
    }

    /// Start the periodic sweep. Only one monitor runs per guard; later
    /// calls return None.
    pub fn spawn_safety_monitor(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Option<JoinHandle<()>> {
        if self.monitor_running.swap(true, Ordering::SeqCst) {
            return None;
        }
        let guard = Arc::clone(self);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(guard.config.sweep_interval);
            tracing::info!("Safety monitor started, sweep every {:?}", guard.config.sweep_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let stopped = guard.sweep_all().await;
                        if !stopped.is_empty() {
                            tracing::warn!("Safety sweep stopped {} live session(s)", stopped.len());
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            guard.monitor_running.store(false, Ordering::SeqCst);
            tracing::info!("Safety monitor stopped");
        }))
    }

    pub fn is_monitor_running(&self) -> bool {
        self.monitor_running.load(Ordering::SeqCst)
    }

    async fn entry(&self, live_session_id: &str) -> Option<Arc<Mutex<LiveEntry>>> {
        self.sessions.read().await.get(live_session_id).cloned()
    }

    /// Ordered pre-trade checks. Returns the side and reference price.
    fn check(
        &self,
        entry: &mut LiveEntry,
        signal: &StrategySignal,
        candles: &[Candle],
        now: DateTime<Utc>,
    ) -> Result<(Signal, f64), TradeRejection> {
        let result = self.run_checks(entry, signal, candles, now);
        record_check(&mut entry.session.safety, &result, now);
        result
    }

    fn run_checks(
        &self,
        entry: &mut LiveEntry,
        signal: &StrategySignal,
        candles: &[Candle],
        now: DateTime<Utc>,
    ) -> Result<(Signal, f64), TradeRejection> {
        if self.emergency.is_active() || entry.session.limits.emergency_stop {
            return Err(TradeRejection::EmergencyStop);
        }
        if !entry.session.is_active {
            return Err(TradeRejection::SessionInactive);
        }
        let side = signal.actionable().ok_or(TradeRejection::NotActionable)?;
        let price = candles.last().map(|c| c.close).unwrap_or(f64::NAN);
        if !(price.is_finite() && price > 0.0) {
            return Err(TradeRejection::InvalidMarketData(format!("last close {}", price)));
        }

        let in_window = entry.limiter.in_window(now);
        if in_window >= entry.limiter.max_trades() {
            return Err(TradeRejection::RateLimited(in_window, entry.limiter.max_trades()));
        }

        if signal.confidence < self.config.min_signal_confidence {
            return Err(TradeRejection::LowConfidence(signal.confidence, self.config.min_signal_confidence));
        }

        let session = &mut entry.session;
        session
            .limits
            .validate_drawdown(session.current_drawdown())
            .map_err(TradeRejection::DrawdownLimit)?;

        session.roll_day(now);
        session
            .limits
            .validate_daily_loss(session.daily_loss())
            .map_err(TradeRejection::DailyLossLimit)?;

        if session.position_closed_by(side).is_none() {
            session
                .limits
                .validate_open_positions(session.open_positions())
                .map_err(TradeRejection::MaxPositions)?;
        }

        Ok((side, price))
    }

    async fn place_stop(&self, entry: &Mutex<LiveEntry>, request: ConditionalOrderRequest, entry_price: Option<f64>) {
        let side = request.side.opposite();
        match self.exchange.place_conditional_order(request.clone()).await {
            Ok(ack) if ack.success => {
                let attached = {
                    let mut guard = entry.lock().await;
                    let position = guard.session.positions.iter_mut().find(|p| {
                        p.side == side && p.stop_order_id.is_none() && Some(p.entry_price) == entry_price
                    });
                    match position {
                        Some(p) => {
                            p.stop_order_id = Some(ack.order_id.clone());
                            true
                        }
                        None => false,
                    }
                };
                if attached {
                    tracing::debug!("Stop {} placed at {:.4}", ack.order_id, request.trigger_price);
                } else {
                    // Position closed before the stop was acknowledged
                    self.cancel_stop(entry, &request.pair, &ack.order_id).await;
                }
            }
            Ok(ack) => {
                let mut guard = entry.lock().await;
                guard.session.safety.warn(format!(
                    "Stop-loss order not accepted: {}",
                    ack.message.unwrap_or_default()
                ));
            }
            Err(e) => {
                tracing::warn!("Stop-loss placement failed: {}", e);
                let mut guard = entry.lock().await;
                guard.session.safety.warn(format!("Stop-loss placement failed: {}", e));
            }
        }
    }

    async fn cancel_stop(&self, entry: &Mutex<LiveEntry>, pair: &str, order_id: &str) {
        if let Err(e) = self.exchange.cancel_order(pair, order_id).await {
            tracing::warn!("Cancel of stop {} failed: {}", order_id, e);
            let mut guard = entry.lock().await;
            guard.session.safety.warn(format!("Cancel of stop {} failed: {}", order_id, e));
        }
    }

    /// Market order against an open position of a stopped session
    async fn close_position(&self, entry: &Mutex<LiveEntry>, pair: &str, position: &LivePosition, now: DateTime<Utc>) {
        let side = position.side.opposite();
        let trade_id = {
            let mut guard = entry.lock().await;
            guard
                .session
                .open_pending_trade(side, position.quantity, position.entry_price, 1.0, true, now)
        };

        let request = OrderRequest {
            pair: pair.to_string(),
            side,
            order_type: OrderType::Market,
            quantity: position.quantity,
            price: None,
        };
        let result = self.exchange.place_order(request).await;

        let mut guard = entry.lock().await;
        let session = &mut guard.session;
        match result {
            Ok(ack) if ack.success => {
                let fill_price = ack.fill_price.unwrap_or(position.entry_price);
                let fee = if ack.fee > 0.0 {
                    ack.fee
                } else {
                    position.quantity * fill_price * self.config.fee_rate
                };
                if let Some(t) = session.trade_mut(trade_id) {
                    t.mark_filled(ack.order_id, fill_price, fee, now);
                }
                if let Some(pnl) = session.settle_fill(trade_id, now) {
                    tracing::info!("Closed {} {:.6} on stop, pnl {:+.2}", pair, position.quantity, pnl);
                }
            }
            Ok(ack) => {
                let message = ack.message.unwrap_or_else(|| "close order not accepted".to_string());
                session.safety.error(format!("Position close failed: {}", message));
                if let Some(t) = session.trade_mut(trade_id) {
                    t.mark_failed(message, now);
                }
            }
            Err(e) => {
                tracing::error!("Position close on {} failed: {}", session.id, e);
                session.safety.error(format!("Position close failed: {}", e));
                if let Some(t) = session.trade_mut(trade_id) {
                    t.mark_failed(e.to_string(), now);
                }
            }
        }
    }
}

fn stop_price(entry_side: Signal, fill_price: f64, stop_loss: f64) -> f64 {
    match entry_side {
        Signal::Sell => fill_price * (1.0 + stop_loss),
        _ => fill_price * (1.0 - stop_loss),
    }
}

fn record_check(safety: &mut SafetyStatus, result: &Result<(Signal, f64), TradeRejection>, now: DateTime<Utc>) {
    safety.last_check = Some(now);
    safety.emergency_stop_clear = true;
    safety.rate_limit_ok = true;
    safety.confidence_ok = true;
    safety.drawdown_ok = true;
    safety.daily_loss_ok = true;
    safety.position_count_ok = true;

    let Err(rejection) = result else {
        return;
    };
    match rejection {
        TradeRejection::EmergencyStop => safety.emergency_stop_clear = false,
        TradeRejection::RateLimited(..) => safety.rate_limit_ok = false,
        TradeRejection::LowConfidence(..) => safety.confidence_ok = false,
        TradeRejection::DrawdownLimit(_) => safety.drawdown_ok = false,
        TradeRejection::DailyLossLimit(_) => safety.daily_loss_ok = false,
        TradeRejection::MaxPositions(_) => safety.position_count_ok = false,
        TradeRejection::NotActionable => return,
        TradeRejection::SessionInactive | TradeRejection::InvalidMarketData(_) => {}
    }
    safety.warn(rejection.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{MarketCondition, StrategyDefinition, StrategyFamily};
    use crate::ports::mocks::{candle_series, metrics_with, MockExchange};
    use crate::ports::{ExchangeError, MockExchangePort, OrderAck};
    use chrono::Duration as ChronoDuration;

    fn strategy(id: &str) -> EnhancedStrategy {
        EnhancedStrategy::new(StrategyDefinition {
            id: id.into(),
            name: id.into(),
            pair: "BTC_USDT".into(),
            family: StrategyFamily::Momentum { fast_period: 5, slow_period: 20 },
            generation: 0,
            target_condition: MarketCondition::TrendingUp,
            created_at: Utc::now(),
        })
    }

    fn limits() -> RiskLimits {
        RiskLimits { max_position_size: 1_000.0, ..Default::default() }
    }

    fn zero_fee() -> GuardConfig {
        GuardConfig { fee_rate: 0.0, ..Default::default() }
    }

    fn ready() -> ConfidenceMetrics {
        metrics_with(80.0, Recommendation::ReadyForLive, 40)
    }

    async fn guard_with(exchange: Arc<dyn ExchangePort>) -> (LiveTradingGuard, String) {
        let guard = LiveTradingGuard::new(zero_fee(), exchange, Arc::new(EmergencyStop::new()));
        let id = guard
            .start_live_trading(&strategy("s1"), &ready(), limits(), 10_000.0, 0.1, 0.02)
            .await
            .unwrap();
        (guard, id)
    }

    fn buy() -> StrategySignal {
        StrategySignal::new(Signal::Buy, 0.9)
    }

    fn sell() -> StrategySignal {
        StrategySignal::new(Signal::Sell, 0.9)
    }

    #[tokio::test]
    async fn test_start_requires_ready_recommendation() {
        let guard = LiveTradingGuard::new(
            GuardConfig::default(),
            Arc::new(MockExchange::new()),
            Arc::new(EmergencyStop::new()),
        );
        let needs_work = metrics_with(80.0, Recommendation::NeedsImprovement, 40);
        let err = guard
            .start_live_trading(&strategy("s1"), &needs_work, limits(), 10_000.0, 0.1, 0.02)
            .await
            .unwrap_err();
        assert!(matches!(err, GuardError::NotReadyForLive(..)));

        let low = metrics_with(70.0, Recommendation::ReadyForLive, 40);
        let err = guard
            .start_live_trading(&strategy("s1"), &low, limits(), 10_000.0, 0.1, 0.02)
            .await
            .unwrap_err();
        assert_eq!(err, GuardError::InsufficientConfidence(70.0, 75.0));
    }

    #[tokio::test]
    async fn test_one_live_session_per_strategy() {
        let (guard, _) = guard_with(Arc::new(MockExchange::new())).await;
        let err = guard
            .start_live_trading(&strategy("s1"), &ready(), limits(), 10_000.0, 0.1, 0.02)
            .await
            .unwrap_err();
        assert_eq!(err, GuardError::LiveSessionExists("s1".into()));
    }

    #[tokio::test]
    async fn test_entry_fill_places_stop_loss() {
        let exchange = Arc::new(MockExchange::new());
        let (guard, id) = guard_with(exchange.clone()).await;

        let trade = guard
            .execute_live_trade(&id, &buy(), &candle_series(&[100.0; 5]))
            .await
            .unwrap();
        assert_eq!(trade.status, TradeStatus::Filled);
        assert_eq!(trade.fill_price, Some(100.0));
        assert!((trade.quantity - 10.0).abs() < 1e-9);

        let stops = exchange.conditional_orders();
        assert_eq!(stops.len(), 1);
        assert_eq!(stops[0].side, Signal::Sell);
        assert!((stops[0].trigger_price - 98.0).abs() < 1e-9);

        let session = guard.live_session(&id).await.unwrap();
        assert_eq!(session.open_positions(), 1);
        assert!(session.positions[0].stop_order_id.is_some());
    }

    #[tokio::test]
    async fn test_closing_trade_cancels_stop() {
        let exchange = Arc::new(MockExchange::new());
        let (guard, id) = guard_with(exchange.clone()).await;

        guard.execute_live_trade(&id, &buy(), &candle_series(&[100.0; 5])).await.unwrap();
        let close = guard
            .execute_live_trade(&id, &sell(), &candle_series(&[110.0; 5]))
            .await
            .unwrap();
        assert_eq!(close.realized_pnl, Some(100.0));
        assert_eq!(exchange.cancelled_orders().len(), 1);

        let session = guard.live_session(&id).await.unwrap();
        assert_eq!(session.open_positions(), 0);
        assert!((session.balance - 10_100.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_exchange_failure_recorded_as_failed() {
        let mut exchange = MockExchangePort::new();
        exchange
            .expect_place_order()
            .times(1)
            .returning(|_| Err(ExchangeError::ApiError("timeout".into())));
        let (guard, id) = guard_with(Arc::new(exchange)).await;

        let trade = guard
            .execute_live_trade(&id, &buy(), &candle_series(&[100.0; 5]))
            .await
            .unwrap();
        assert_eq!(trade.status, TradeStatus::Failed);
        assert!(trade.error.unwrap().contains("timeout"));

        let session = guard.live_session(&id).await.unwrap();
        assert_eq!(session.trades.len(), 1);
        assert_eq!(session.open_positions(), 0);
        assert!(!session.safety.errors.is_empty());
    }

    #[tokio::test]
    async fn test_unaccepted_order_is_failed() {
        let mut exchange = MockExchangePort::new();
        exchange.expect_place_order().returning(|_| {
            Ok(OrderAck {
                order_id: "x".into(),
                success: false,
                fill_price: None,
                fee: 0.0,
                message: Some("insufficient funds".into()),
            })
        });
        let (guard, id) = guard_with(Arc::new(exchange)).await;

        let trade = guard
            .execute_live_trade(&id, &buy(), &candle_series(&[100.0; 5]))
            .await
            .unwrap();
        assert_eq!(trade.status, TradeStatus::Failed);
        assert_eq!(trade.error.as_deref(), Some("insufficient funds"));
    }

    #[tokio::test]
    async fn test_check_order_and_rejections() {
        let exchange = Arc::new(MockExchange::new());
        let (guard, id) = guard_with(exchange.clone()).await;
        let candles = candle_series(&[100.0; 5]);

        let weak = StrategySignal::new(Signal::Buy, 0.5);
        assert_eq!(
            guard.evaluate_trade(&id, &weak, &candles).await,
            Err(TradeRejection::LowConfidence(0.5, 0.7))
        );
        assert!(guard.execute_live_trade(&id, &weak, &candles).await.is_none());

        assert_eq!(
            guard.evaluate_trade(&id, &StrategySignal::hold(0.9), &candles).await,
            Err(TradeRejection::NotActionable)
        );
        assert!(matches!(
            guard.evaluate_trade(&id, &buy(), &[]).await,
            Err(TradeRejection::InvalidMarketData(_))
        ));

        let session = guard.live_session(&id).await.unwrap();
        assert!(session.trades.is_empty());
        assert!(exchange.orders().is_empty());
    }

    #[tokio::test]
    async fn test_position_limit_applies_to_entries_only() {
        let exchange = Arc::new(MockExchange::new());
        let guard = LiveTradingGuard::new(zero_fee(), exchange, Arc::new(EmergencyStop::new()));
        let one_position = RiskLimits { max_open_positions: 1, ..limits() };
        let id = guard
            .start_live_trading(&strategy("s1"), &ready(), one_position, 10_000.0, 0.1, 0.0)
            .await
            .unwrap();
        let candles = candle_series(&[100.0; 5]);

        guard.execute_live_trade(&id, &buy(), &candles).await.unwrap();
        assert!(matches!(
            guard.evaluate_trade(&id, &buy(), &candles).await,
            Err(TradeRejection::MaxPositions(_))
        ));
        // Closing is still allowed
        assert!(guard.evaluate_trade(&id, &sell(), &candles).await.is_ok());
    }

    #[tokio::test]
    async fn test_rate_limit_window() {
        let (guard, id) = guard_with(Arc::new(MockExchange::new())).await;
        let candles = candle_series(&[100.0; 5]);
        let t0 = Utc::now();

        for i in 0..10 {
            let signal = if i % 2 == 0 { buy() } else { sell() };
            let at = t0 + ChronoDuration::seconds(i);
            assert!(guard.execute_live_trade_at(&id, &signal, &candles, at).await.is_some());
        }
        let eleventh = t0 + ChronoDuration::seconds(30);
        assert!(guard.execute_live_trade_at(&id, &buy(), &candles, eleventh).await.is_none());

        let later = t0 + ChronoDuration::seconds(61);
        assert!(guard.execute_live_trade_at(&id, &buy(), &candles, later).await.is_some());
    }

    #[tokio::test]
    async fn test_emergency_flag_blocks_without_record() {
        let exchange = Arc::new(MockExchange::new());
        let (guard, id) = guard_with(exchange.clone()).await;
        guard.emergency().activate("manual");

        assert!(guard.execute_live_trade(&id, &buy(), &candle_series(&[100.0; 5])).await.is_none());
        let session = guard.live_session(&id).await.unwrap();
        assert!(session.trades.is_empty());
        assert!(exchange.orders().is_empty());

        let err = guard
            .start_live_trading(&strategy("s2"), &ready(), limits(), 10_000.0, 0.1, 0.02)
            .await
            .unwrap_err();
        assert_eq!(err, GuardError::EmergencyStopActive("manual".into()));
    }

    #[tokio::test]
    async fn test_sweep_stops_session_in_breach() {
        let exchange = Arc::new(MockExchange::new());
        let guard = LiveTradingGuard::new(zero_fee(), exchange.clone(), Arc::new(EmergencyStop::new()));
        let tight = RiskLimits { max_drawdown: 0.2, max_daily_loss: 0.5, ..limits() };
        let id = guard
            .start_live_trading(&strategy("s1"), &ready(), tight, 10_000.0, 1.0, 0.0)
            .await
            .unwrap();
        let mut events = guard.subscribe();

        guard.execute_live_trade(&id, &buy(), &candle_series(&[100.0; 5])).await.unwrap();
        guard.execute_live_trade(&id, &sell(), &candle_series(&[75.0; 5])).await.unwrap();
        let session = guard.live_session(&id).await.unwrap();
        assert!((session.current_drawdown() - 0.25).abs() < 1e-9);

        let stopped = guard.sweep_all().await;
        assert_eq!(stopped.len(), 1);
        assert!(matches!(stopped[0].1, RiskViolation::DrawdownExceeded(..)));

        let session = guard.live_session(&id).await.unwrap();
        assert!(!session.is_active);
        assert!(!session.safety.drawdown_ok);
        assert!(guard.active_session_for("s1").await.is_none());

        let event = events.try_recv().unwrap();
        assert!(matches!(event, GuardEvent::LiveSessionStopped { ref strategy_id, .. } if strategy_id == "s1"));
    }

    #[tokio::test]
    async fn test_stop_closes_positions_and_is_idempotent() {
        let exchange = Arc::new(MockExchange::new());
        let (guard, id) = guard_with(exchange.clone()).await;
        guard.execute_live_trade(&id, &buy(), &candle_series(&[100.0; 5])).await.unwrap();

        assert!(guard.stop_live_trading(&id, "user stop").await.unwrap());
        assert!(!guard.stop_live_trading(&id, "again").await.unwrap());

        let session = guard.live_session(&id).await.unwrap();
        assert_eq!(session.open_positions(), 0);
        assert_eq!(session.stop_reason.as_deref(), Some("user stop"));
        assert_eq!(session.trades.len(), 2);
        assert!(session.trades.iter().all(|t| t.status.is_terminal()));
        assert_eq!(exchange.cancelled_orders().len(), 1);

        assert_eq!(
            guard.stop_live_trading("missing", "x").await,
            Err(GuardError::LiveSessionNotFound("missing".into()))
        );
    }

    #[tokio::test]
    async fn test_emergency_stop_all() {
        let guard = LiveTradingGuard::new(zero_fee(), Arc::new(MockExchange::new()), Arc::new(EmergencyStop::new()));
        let a = guard
            .start_live_trading(&strategy("a"), &ready(), limits(), 10_000.0, 0.1, 0.02)
            .await
            .unwrap();
        let b = guard
            .start_live_trading(&strategy("b"), &ready(), limits(), 10_000.0, 0.1, 0.02)
            .await
            .unwrap();

        let mut stopped = guard.emergency_stop_all("flash crash").await;
        stopped.sort();
        let mut expected = vec![a.clone(), b.clone()];
        expected.sort();
        assert_eq!(stopped, expected);
        assert!(guard.emergency().is_active());

        for id in [a, b] {
            let session = guard.live_session(&id).await.unwrap();
            assert!(!session.is_active);
            assert_eq!(session.stop_reason.as_deref(), Some("flash crash"));
        }

        guard.clear_emergency_stop();
        assert!(!guard.emergency().is_active());
    }

    #[tokio::test]
    async fn test_single_safety_monitor() {
        let guard = Arc::new(LiveTradingGuard::new(
            GuardConfig::default(),
            Arc::new(MockExchange::new()),
            Arc::new(EmergencyStop::new()),
        ));
        let (tx, rx) = watch::channel(false);
        let handle = guard.spawn_safety_monitor(rx.clone()).unwrap();
        assert!(guard.spawn_safety_monitor(rx).is_none());

        tx.send(true).unwrap();
        handle.await.unwrap();
        assert!(!guard.is_monitor_running());

        // A fresh channel starts a new monitor once the old one exited
        let (tx, rx) = watch::channel(false);
        let handle = guard.spawn_safety_monitor(rx).unwrap();
        assert!(guard.is_monitor_running());
        tx.send(true).unwrap();
        handle.await.unwrap();
        assert!(!guard.is_monitor_running());
    }

    #[tokio::test]
    async fn test_stop_during_in_flight_entry_closes_late_fill() {
        let exchange = Arc::new(MockExchange::new());
        exchange.set_order_delay(Duration::from_millis(300));
        let (guard, id) = guard_with(exchange.clone()).await;
        let guard = Arc::new(guard);

        let executing = {
            let guard = guard.clone();
            let id = id.clone();
            tokio::spawn(async move {
                let candles = candle_series(&[100.0; 5]);
                guard.execute_live_trade(&id, &buy(), &candles).await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(guard.stop_live_trading(&id, "user stop").await.unwrap());

        let entry_trade = executing.await.unwrap().unwrap();
        assert_eq!(entry_trade.status, TradeStatus::Filled);
        assert!(entry_trade.order_id.is_some());

        let session = guard.live_session(&id).await.unwrap();
        assert!(!session.is_active);
        assert_eq!(session.open_positions(), 0);
        assert_eq!(session.trades.len(), 2);
        assert!(session.trades.iter().all(|t| t.status == TradeStatus::Filled));
        assert!(session.trades[1].closes_position);
        assert!(session.safety.errors.iter().any(|e| e.contains("filled after session stop")));

        let orders = exchange.orders();
        assert_eq!(orders.len(), 2);
        assert_eq!(orders[1].side, Signal::Sell);
        // No protective order for a position that was closed straight away
        assert!(exchange.conditional_orders().is_empty());
    }

    #[tokio::test]
    async fn test_stop_during_in_flight_close_does_not_close_twice() {
        let exchange = Arc::new(MockExchange::new());
        let (guard, id) = guard_with(exchange.clone()).await;
        let guard = Arc::new(guard);
        guard.execute_live_trade(&id, &buy(), &candle_series(&[100.0; 5])).await.unwrap();

        exchange.set_order_delay(Duration::from_millis(300));
        let executing = {
            let guard = guard.clone();
            let id = id.clone();
            tokio::spawn(async move {
                let candles = candle_series(&[110.0; 5]);
                guard.execute_live_trade(&id, &sell(), &candles).await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(guard.stop_live_trading(&id, "user stop").await.unwrap());

        let close = executing.await.unwrap().unwrap();
        assert_eq!(close.status, TradeStatus::Filled);
        assert_eq!(close.realized_pnl, Some(100.0));

        let session = guard.live_session(&id).await.unwrap();
        assert_eq!(session.open_positions(), 0);
        assert_eq!(session.trades.len(), 2);
        assert_eq!(exchange.orders().len(), 2);
        assert_eq!(exchange.cancelled_orders().len(), 1);
    }

    #[tokio::test]
    async fn test_sweep_isolates_failed_close_per_session() {
        let fail_eth = Arc::new(AtomicBool::new(false));
        let mut exchange = MockExchangePort::new();
        let flag = fail_eth.clone();
        exchange.expect_place_order().returning(move |request| {
            if flag.load(Ordering::SeqCst) && request.pair == "ETH_USDT" {
                return Err(ExchangeError::ApiError("venue down".into()));
            }
            Ok(OrderAck {
                order_id: format!("{}-{}", request.pair, request.side),
                success: true,
                fill_price: Some(request.price.unwrap_or(50.0)),
                fee: 0.0,
                message: None,
            })
        });
        let guard = LiveTradingGuard::new(zero_fee(), Arc::new(exchange), Arc::new(EmergencyStop::new()));
        let tight = RiskLimits { max_drawdown: 0.2, max_daily_loss: 0.5, ..limits() };

        let mut eth = strategy("eth");
        eth.definition.pair = "ETH_USDT".into();
        let a = guard.start_live_trading(&eth, &ready(), tight.clone(), 10_000.0, 0.5, 0.0).await.unwrap();
        let b = guard
            .start_live_trading(&strategy("btc"), &ready(), tight, 10_000.0, 0.5, 0.0)
            .await
            .unwrap();

        // Two entries at 100, then one closed at 50: 25% drawdown, one position left
        for id in [&a, &b] {
            guard.execute_live_trade(id, &buy(), &candle_series(&[100.0; 5])).await.unwrap();
            guard.execute_live_trade(id, &buy(), &candle_series(&[100.0; 5])).await.unwrap();
            guard.execute_live_trade(id, &sell(), &candle_series(&[50.0; 5])).await.unwrap();
            assert_eq!(guard.live_session(id).await.unwrap().open_positions(), 1);
        }

        fail_eth.store(true, Ordering::SeqCst);
        let stopped = guard.sweep_all().await;
        assert_eq!(stopped.len(), 2);

        let session_a = guard.live_session(&a).await.unwrap();
        assert!(!session_a.is_active);
        assert_eq!(session_a.open_positions(), 1);
        assert!(session_a.safety.errors.iter().any(|e| e.contains("Position close failed")));
        assert_eq!(session_a.trades.last().map(|t| t.status), Some(TradeStatus::Failed));

        let session_b = guard.live_session(&b).await.unwrap();
        assert!(!session_b.is_active);
        assert_eq!(session_b.open_positions(), 0);
        assert!(!session_b.safety.errors.iter().any(|e| e.contains("Position close failed")));
    }

    #[tokio::test]
    async fn test_concurrent_executes_share_last_rate_slot() {
        let exchange = Arc::new(MockExchange::new());
        let (guard, id) = guard_with(exchange.clone()).await;
        let candles = candle_series(&[100.0; 5]);
        let t0 = Utc::now();

        for i in 0..9 {
            let signal = if i % 2 == 0 { buy() } else { sell() };
            let at = t0 + ChronoDuration::seconds(i);
            assert!(guard.execute_live_trade_at(&id, &signal, &candles, at).await.is_some());
        }

        exchange.set_order_delay(Duration::from_millis(100));
        let at = t0 + ChronoDuration::seconds(10);
        let (sell_a, sell_b) = (sell(), sell());
        let (first, second) = tokio::join!(
            guard.execute_live_trade_at(&id, &sell_a, &candles, at),
            guard.execute_live_trade_at(&id, &sell_b, &candles, at),
        );
        assert_eq!(first.is_some() as usize + second.is_some() as usize, 1);

        let session = guard.live_session(&id).await.unwrap();
        assert_eq!(session.trades.len(), 10);
        assert_eq!(exchange.orders().len(), 10);
        assert!(!session.safety.rate_limit_ok);
    }
}
