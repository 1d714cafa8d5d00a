//! Mock Trading Simulator
//!
//! Paper-trades a strategy against live candles. Each actionable signal
//! becomes a `MockTrade` with synthetic latency and slippage:
//!
//! - latency: uniform between the configured bounds (50-200ms by default),
//!   recorded only and never slept on
//! - slippage: base + volume impact + volatility term, capped
//!
//! Position model: a signal opens a position when flat, closes it when it
//! points the other way, and is ignored when it repeats the open side.

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use crate::domain::{
    next_id, Candle, MarketSnapshot, MockPosition, MockTrade, MockTradingSession, Signal,
    StrategyDefinition, StrategyId,
};
use crate::ports::SignalPort;

/// Candles handed to the signal function per tick
pub const SIGNAL_WINDOW: usize = 200;

#[derive(Debug, Clone)]
pub struct MockSimulatorConfig {
    pub min_latency_ms: u64,
    pub max_latency_ms: u64,
    /// Fixed slippage floor (0.001 = 0.1%)
    pub base_slippage: f64,
    /// Slippage per unit of order notional / candle notional
    pub volume_impact: f64,
    /// Slippage per unit of return volatility
    pub volatility_factor: f64,
    pub max_slippage: f64,
    pub fee_rate: f64,
    /// Fraction of balance per entry
    pub position_size: f64,
    /// Fixed seed for reproducible runs
    pub seed: Option<u64>,
}

impl Default for MockSimulatorConfig {
    fn default() -> Self {
        Self {
            min_latency_ms: 50,
            max_latency_ms: 200,
            base_slippage: 0.001,
            volume_impact: 0.1,
            volatility_factor: 0.5,
            max_slippage: 0.05,
            fee_rate: 0.001,
            position_size: 0.1,
            seed: None,
        }
    }
}

#[derive(Debug, Default)]
struct SimulatorState {
    sessions: HashMap<String, MockTradingSession>,
    strategies: HashMap<String, StrategyDefinition>,
    /// Active mock session per strategy
    active: HashMap<StrategyId, String>,
}

pub struct MockTradingSimulator {
    config: MockSimulatorConfig,
    signals: Arc<dyn SignalPort>,
    state: RwLock<SimulatorState>,
    rng: Mutex<StdRng>,
}

impl MockTradingSimulator {
    pub fn new(config: MockSimulatorConfig, signals: Arc<dyn SignalPort>) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            config,
            signals,
            state: RwLock::new(SimulatorState::default()),
            rng: Mutex::new(rng),
        }
    }

    /// Start paper trading `strategy`. An existing active session for the
    /// same strategy is ended and superseded.
    pub async fn start_session(&self, strategy: &StrategyDefinition, initial_balance: f64) -> String {
        let id = next_id("mock");
        let now = Utc::now();
        let mut state = self.state.write().await;

        if let Some(previous) = state.active.remove(&strategy.id) {
            if let Some(session) = state.sessions.get_mut(&previous) {
                session.end(now);
                tracing::info!("Mock session {} superseded by {}", previous, id);
            }
        }

        let session = MockTradingSession::starting_at(
            id.clone(),
            strategy.id.clone(),
            strategy.pair.clone(),
            initial_balance,
            now,
        );
        state.sessions.insert(id.clone(), session);
        state.strategies.insert(id.clone(), strategy.clone());
        state.active.insert(strategy.id.clone(), id.clone());

        tracing::info!(
            "Mock session {} started for {} with {:.2} {}",
            id,
            strategy.name,
            initial_balance,
            quote_asset(&strategy.pair)
        );
        id
    }

    /// End a session; returns its final state
    pub async fn stop_session(&self, session_id: &str) -> Option<MockTradingSession> {
        let mut state = self.state.write().await;
        let session = state.sessions.get_mut(session_id)?;
        session.end(Utc::now());
        let snapshot = session.clone();
        if state.active.get(&snapshot.strategy_id).map(|s| s == session_id).unwrap_or(false) {
            state.active.remove(&snapshot.strategy_id);
        }
        tracing::info!(
            "Mock session {} stopped after {} trades ({:+.2}%)",
            session_id,
            snapshot.trades.len(),
            snapshot.performance.total_return * 100.0
        );
        Some(snapshot)
    }

    pub async fn session(&self, session_id: &str) -> Option<MockTradingSession> {
        self.state.read().await.sessions.get(session_id).cloned()
    }

    pub async fn active_session_for(&self, strategy_id: &str) -> Option<String> {
        self.state.read().await.active.get(strategy_id).cloned()
    }

    /// Feed one market-data tick to a session
    pub async fn on_market_data(&self, session_id: &str, candles: &[Candle]) -> Option<MockTrade> {
        self.on_market_data_at(session_id, candles, Utc::now()).await
    }

    /// Same as `on_market_data` with an explicit execution time
    pub async fn on_market_data_at(
        &self,
        session_id: &str,
        candles: &[Candle],
        now: DateTime<Utc>,
    ) -> Option<MockTrade> {
        let window = &candles[candles.len().saturating_sub(SIGNAL_WINDOW)..];
        let snapshot = MarketSnapshot::from_candles(window)?;
        if !(snapshot.price.is_finite() && snapshot.price > 0.0) {
            tracing::warn!("Mock session {}: invalid price {}", session_id, snapshot.price);
            return None;
        }

        let strategy = {
            let state = self.state.read().await;
            match state.sessions.get(session_id) {
                Some(session) if session.is_active => state.strategies.get(session_id).cloned()?,
                _ => return None,
            }
        };

        let signal = self.signals.execute(&strategy, window);
        let side = signal.actionable()?;

        let (latency_ms, jitter) = {
            let mut rng = self.rng.lock().await;
            let lo = self.config.min_latency_ms.min(self.config.max_latency_ms);
            let hi = self.config.max_latency_ms.max(lo);
            (rng.gen_range(lo..=hi), rng.gen_range(0.0..1.0))
        };

        let mut state = self.state.write().await;
        let session = state.sessions.get_mut(session_id)?;
        // Stopped while the signal was computed
        if !session.is_active {
            return None;
        }

        let trade = self.simulate_fill(session, side, &snapshot, latency_ms, jitter, now)?;
        session.record_trade(trade.clone());

        tracing::debug!(
            "Mock {} {} {:.6} @ {:.4} (slip {:.3}%, {}ms) balance {:.2}",
            session_id,
            side,
            trade.quantity,
            trade.execution_price,
            trade.slippage * 100.0,
            trade.latency_ms,
            trade.balance_after
        );
        Some(trade)
    }

    fn slippage(&self, notional: f64, snapshot: &MarketSnapshot, jitter: f64) -> f64 {
        let market_notional = snapshot.price * snapshot.volume;
        let impact = if market_notional > 0.0 {
            self.config.volume_impact * notional / market_notional
        } else {
            self.config.max_slippage
        };
        let volatility = self.config.volatility_factor * snapshot.volatility * jitter;
        (self.config.base_slippage + impact + volatility).clamp(0.0, self.config.max_slippage)
    }

    fn simulate_fill(
        &self,
        session: &mut MockTradingSession,
        side: Signal,
        snapshot: &MarketSnapshot,
        latency_ms: u64,
        jitter: f64,
        now: DateTime<Utc>,
    ) -> Option<MockTrade> {
        let price = snapshot.price;
        let id = session.trades.len() as u64 + 1;

        match session.position {
            Some(position) if position.side == side => None,
            Some(position) => {
                let notional = position.quantity * price;
                let slippage = self.slippage(notional, snapshot, jitter);
                let execution_price = adverse_price(price, side, slippage);
                let fee = position.quantity * execution_price * self.config.fee_rate;
                let direction = if position.side == Signal::Sell { -1.0 } else { 1.0 };
                let gross = (execution_price - position.entry_price) * position.quantity * direction;
                let realized = gross - fee;

                session.position = None;
                Some(MockTrade {
                    id,
                    timestamp: now,
                    side,
                    quantity: position.quantity,
                    requested_price: price,
                    execution_price,
                    latency_ms,
                    slippage,
                    fee,
                    realized_pnl: Some(realized),
                    balance_after: session.balance + realized,
                    market: *snapshot,
                })
            }
            None => {
                let notional = session.balance * self.config.position_size;
                if notional <= 0.0 {
                    return None;
                }
                let slippage = self.slippage(notional, snapshot, jitter);
                let execution_price = adverse_price(price, side, slippage);
                let quantity = notional / execution_price;
                let fee = notional * self.config.fee_rate;

                session.position = Some(MockPosition { side, quantity, entry_price: execution_price });
                Some(MockTrade {
                    id,
                    timestamp: now,
                    side,
                    quantity,
                    requested_price: price,
                    execution_price,
                    latency_ms,
                    slippage,
                    fee,
                    realized_pnl: None,
                    balance_after: session.balance - fee,
                    market: *snapshot,
                })
            }
        }
    }
}

/// Price moved against the taker by `slippage`
fn adverse_price(price: f64, side: Signal, slippage: f64) -> f64 {
    match side {
        Signal::Buy => price * (1.0 + slippage),
        _ => price * (1.0 - slippage),
    }
}

fn quote_asset(pair: &str) -> &str {
    pair.split(['_', '/', '-']).nth(1).unwrap_or("USDT")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{MarketCondition, StrategyFamily, StrategySignal};
    use crate::ports::mocks::{candle_series, FixedSignal};

    fn strategy() -> StrategyDefinition {
        StrategyDefinition {
            id: "strat-1".into(),
            name: "mr 20".into(),
            pair: "BTC_USDT".into(),
            family: StrategyFamily::MeanReversion { lookback: 20, entry_z: 2.0 },
            generation: 0,
            target_condition: MarketCondition::Ranging,
            created_at: Utc::now(),
        }
    }

    fn simulator(signal: Arc<FixedSignal>) -> MockTradingSimulator {
        let config = MockSimulatorConfig { seed: Some(7), ..Default::default() };
        MockTradingSimulator::new(config, signal)
    }

    #[tokio::test]
    async fn test_hold_produces_no_trade() {
        let signal = Arc::new(FixedSignal::new(StrategySignal::hold(0.9)));
        let sim = simulator(signal.clone());
        let id = sim.start_session(&strategy(), 10_000.0).await;

        let trade = sim.on_market_data(&id, &candle_series(&[100.0; 30])).await;
        assert!(trade.is_none());
        assert_eq!(signal.calls(), 1);
        assert!(sim.session(&id).await.unwrap().trades.is_empty());
    }

    #[tokio::test]
    async fn test_round_trip_records_latency_and_slippage() {
        let signal = Arc::new(FixedSignal::new(StrategySignal::new(Signal::Buy, 0.9)));
        let sim = simulator(signal.clone());
        let id = sim.start_session(&strategy(), 10_000.0).await;

        let entry = sim.on_market_data(&id, &candle_series(&[100.0; 30])).await.unwrap();
        assert!(entry.realized_pnl.is_none());
        assert!((50..=200).contains(&entry.latency_ms));
        assert!(entry.slippage >= 0.001);
        assert!(entry.execution_price > 100.0);

        // Repeating the open side does nothing
        assert!(sim.on_market_data(&id, &candle_series(&[100.0; 30])).await.is_none());

        signal.set(StrategySignal::new(Signal::Sell, 0.9));
        let exit = sim.on_market_data(&id, &candle_series(&[120.0; 30])).await.unwrap();
        assert!(exit.realized_pnl.unwrap() > 0.0);

        let session = sim.session(&id).await.unwrap();
        assert_eq!(session.trades.len(), 2);
        assert_eq!(session.performance.winning_trades, 1);
        assert!(session.position.is_none());
        assert!(session.balance > 10_000.0);
    }

    #[tokio::test]
    async fn test_new_session_supersedes_old() {
        let signal = Arc::new(FixedSignal::new(StrategySignal::hold(0.5)));
        let sim = simulator(signal);
        let first = sim.start_session(&strategy(), 10_000.0).await;
        let second = sim.start_session(&strategy(), 10_000.0).await;

        assert!(!sim.session(&first).await.unwrap().is_active);
        assert!(sim.session(&second).await.unwrap().is_active);
        assert_eq!(sim.active_session_for("strat-1").await, Some(second));
    }

    #[tokio::test]
    async fn test_stopped_session_ignores_ticks() {
        let signal = Arc::new(FixedSignal::new(StrategySignal::new(Signal::Buy, 0.9)));
        let sim = simulator(signal);
        let id = sim.start_session(&strategy(), 10_000.0).await;
        sim.stop_session(&id).await.unwrap();

        assert!(sim.on_market_data(&id, &candle_series(&[100.0; 30])).await.is_none());
        assert!(sim.active_session_for("strat-1").await.is_none());
    }

    #[test]
    fn test_quote_asset() {
        assert_eq!(quote_asset("BTC_USDT"), "USDT");
        assert_eq!(quote_asset("ETH/USDC"), "USDC");
    }
}
