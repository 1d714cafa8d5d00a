//! Test doubles for every port
//!
//! Each double records the calls it receives and answers from scripted
//! responses, so orchestrator and guard behavior can be driven without an
//! exchange.

use async_trait::async_trait;
use chrono::{DateTime, Duration};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration as StdDuration;

use super::exchange::{
    AssetBalance, ConditionalOrderRequest, ExchangeError, ExchangePort, OrderAck, OrderRequest,
};
use super::store::NotificationSink;
use super::strategy::{BacktestError, BacktestOptions, BacktestPort, BacktestResult, SignalPort};
use crate::domain::{
    Candle, CategoryScores, ConfidenceMetrics, MockTradingSession, Notification, NotificationType,
    ReadinessChecklist, Recommendation, Scorer, StrategyDefinition, StrategySignal,
};

/// Hourly candles at the given closes, starting at a fixed timestamp
pub fn candle_series(closes: &[f64]) -> Vec<Candle> {
    let start = DateTime::from_timestamp(1_700_000_000, 0).unwrap_or_default();
    closes
        .iter()
        .enumerate()
        .map(|(i, close)| Candle::flat(start + Duration::hours(i as i64), *close, 1_000.0))
        .collect()
}

/// Exchange double: fills at the request price (or the last candle close)
/// unless a scripted result is queued
#[derive(Debug, Default)]
pub struct MockExchange {
    candles: Mutex<Vec<Candle>>,
    order_results: Mutex<VecDeque<Result<OrderAck, ExchangeError>>>,
    orders: Mutex<Vec<OrderRequest>>,
    conditional_orders: Mutex<Vec<ConditionalOrderRequest>>,
    cancelled: Mutex<Vec<String>>,
    fail_market_data: AtomicBool,
    fail_conditional_orders: AtomicBool,
    next_order_id: AtomicU64,
    /// Latency added before an order is answered, in milliseconds
    order_delay_ms: AtomicU64,
    market_data_delay_ms: AtomicU64,
}

impl MockExchange {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method to set the candles returned by `get_market_data`
    pub fn with_candles(self, candles: Vec<Candle>) -> Self {
        self.set_candles(candles);
        self
    }

    /// Builder method to queue the result of the next `place_order`
    pub fn with_order_result(self, result: Result<OrderAck, ExchangeError>) -> Self {
        self.push_order_result(result);
        self
    }

    pub fn set_candles(&self, candles: Vec<Candle>) {
        if let Ok(mut guard) = self.candles.lock() {
            *guard = candles;
        }
    }

    pub fn push_order_result(&self, result: Result<OrderAck, ExchangeError>) {
        if let Ok(mut queue) = self.order_results.lock() {
            queue.push_back(result);
        }
    }

    pub fn set_market_data_failure(&self, fail: bool) {
        self.fail_market_data.store(fail, Ordering::SeqCst);
    }

    pub fn set_conditional_order_failure(&self, fail: bool) {
        self.fail_conditional_orders.store(fail, Ordering::SeqCst);
    }

    /// Hold every `place_order` call for `delay` before answering
    pub fn set_order_delay(&self, delay: StdDuration) {
        self.order_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Hold every `get_market_data` call for `delay` before answering
    pub fn set_market_data_delay(&self, delay: StdDuration) {
        self.market_data_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Get all recorded orders
    pub fn orders(&self) -> Vec<OrderRequest> {
        self.orders.lock().map(|o| o.clone()).unwrap_or_default()
    }

    pub fn conditional_orders(&self) -> Vec<ConditionalOrderRequest> {
        self.conditional_orders.lock().map(|o| o.clone()).unwrap_or_default()
    }

    pub fn cancelled_orders(&self) -> Vec<String> {
        self.cancelled.lock().map(|o| o.clone()).unwrap_or_default()
    }

    fn last_close(&self) -> Option<f64> {
        self.candles.lock().ok().and_then(|c| c.last().map(|c| c.close))
    }

    async fn pause(delay_ms: &AtomicU64) {
        let ms = delay_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(StdDuration::from_millis(ms)).await;
        }
    }

    fn order_id(&self) -> String {
        format!("mock-{}", self.next_order_id.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

#[async_trait]
impl ExchangePort for MockExchange {
    async fn get_account_balance(&self) -> Result<Vec<AssetBalance>, ExchangeError> {
        Ok(vec![AssetBalance { asset: "USDT".to_string(), free: 10_000.0, locked: 0.0 }])
    }

    async fn get_market_data(&self, _pair: &str, limit: usize) -> Result<Vec<Candle>, ExchangeError> {
        Self::pause(&self.market_data_delay_ms).await;
        if self.fail_market_data.load(Ordering::SeqCst) {
            return Err(ExchangeError::ApiError("market data unavailable".to_string()));
        }
        let candles = self.candles.lock().map(|c| c.clone()).unwrap_or_default();
        let start = candles.len().saturating_sub(limit);
        Ok(candles[start..].to_vec())
    }

    async fn place_order(&self, request: OrderRequest) -> Result<OrderAck, ExchangeError> {
        if let Ok(mut orders) = self.orders.lock() {
            orders.push(request.clone());
        }
        Self::pause(&self.order_delay_ms).await;
        let scripted = self.order_results.lock().ok().and_then(|mut q| q.pop_front());
        if let Some(result) = scripted {
            return result;
        }
        let price = request.price.or_else(|| self.last_close()).unwrap_or(100.0);
        Ok(OrderAck {
            order_id: self.order_id(),
            success: true,
            fill_price: Some(price),
            fee: 0.0,
            message: None,
        })
    }

    async fn place_conditional_order(
        &self,
        request: ConditionalOrderRequest,
    ) -> Result<OrderAck, ExchangeError> {
        if self.fail_conditional_orders.load(Ordering::SeqCst) {
            return Err(ExchangeError::OrderRejected("conditional orders disabled".to_string()));
        }
        if let Ok(mut orders) = self.conditional_orders.lock() {
            orders.push(request);
        }
        Ok(OrderAck {
            order_id: self.order_id(),
            success: true,
            fill_price: None,
            fee: 0.0,
            message: None,
        })
    }

    async fn cancel_order(&self, _pair: &str, order_id: &str) -> Result<(), ExchangeError> {
        if let Ok(mut cancelled) = self.cancelled.lock() {
            cancelled.push(order_id.to_string());
        }
        Ok(())
    }
}

/// Signal function that returns whatever it was last told to
#[derive(Debug)]
pub struct FixedSignal {
    signal: Mutex<StrategySignal>,
    calls: AtomicUsize,
}

impl FixedSignal {
    pub fn new(signal: StrategySignal) -> Self {
        Self { signal: Mutex::new(signal), calls: AtomicUsize::new(0) }
    }

    pub fn set(&self, signal: StrategySignal) {
        if let Ok(mut guard) = self.signal.lock() {
            *guard = signal;
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl SignalPort for FixedSignal {
    fn execute(&self, _strategy: &StrategyDefinition, _candles: &[Candle]) -> StrategySignal {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.signal.lock().map(|s| *s).unwrap_or_else(|_| StrategySignal::none())
    }
}

/// Backtest engine answering from a queue, then from a default
#[derive(Debug)]
pub struct ScriptedBacktest {
    queue: Mutex<VecDeque<Result<BacktestResult, BacktestError>>>,
    default: Result<BacktestResult, BacktestError>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedBacktest {
    pub fn always(default: Result<BacktestResult, BacktestError>) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            default,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn then(self, result: Result<BacktestResult, BacktestError>) -> Self {
        if let Ok(mut queue) = self.queue.lock() {
            queue.push_back(result);
        }
        self
    }

    /// Strategy ids backtested so far
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl BacktestPort for ScriptedBacktest {
    async fn run_backtest(
        &self,
        strategy: &StrategyDefinition,
        _options: &BacktestOptions,
    ) -> Result<BacktestResult, BacktestError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(strategy.id.clone());
        }
        let next = self.queue.lock().ok().and_then(|mut q| q.pop_front());
        next.unwrap_or_else(|| self.default.clone())
    }
}

/// Sink that keeps every published notification
#[derive(Debug, Default)]
pub struct RecordingSink {
    published: Mutex<Vec<(String, Notification)>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifications(&self) -> Vec<(String, Notification)> {
        self.published.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn of_kind(&self, kind: NotificationType) -> Vec<(String, Notification)> {
        self.notifications().into_iter().filter(|(_, n)| n.kind == kind).collect()
    }
}

impl NotificationSink for RecordingSink {
    fn publish(&self, session_id: &str, notification: &Notification) {
        if let Ok(mut published) = self.published.lock() {
            published.push((session_id.to_string(), notification.clone()));
        }
    }
}

/// Metrics with a given overall score and recommendation; the checklist
/// passes only for READY_FOR_LIVE
pub fn metrics_with(overall: f64, recommendation: Recommendation, trade_count: usize) -> ConfidenceMetrics {
    let ready = recommendation == Recommendation::ReadyForLive;
    ConfidenceMetrics {
        overall,
        categories: CategoryScores {
            profitability: overall,
            risk_management: overall,
            execution_quality: overall,
            market_adaptability: overall,
            time_stability: overall,
        },
        components: Default::default(),
        recommendation,
        checklist: ReadinessChecklist {
            profitability: ready,
            risk_management: ready,
            consistency: ready,
            execution_quality: ready,
            sufficient_duration: ready,
            drawdown_within_limit: ready,
        },
        trade_count,
    }
}

/// Scorer returning scripted metrics regardless of the session
#[derive(Debug)]
pub struct FixedScorer {
    metrics: Mutex<ConfidenceMetrics>,
    calls: AtomicUsize,
}

impl FixedScorer {
    pub fn new(metrics: ConfidenceMetrics) -> Self {
        Self { metrics: Mutex::new(metrics), calls: AtomicUsize::new(0) }
    }

    pub fn set(&self, metrics: ConfidenceMetrics) {
        if let Ok(mut guard) = self.metrics.lock() {
            *guard = metrics;
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Scorer for FixedScorer {
    fn score(&self, _session: &MockTradingSession, _required_score: f64) -> ConfidenceMetrics {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.metrics
            .lock()
            .map(|m| m.clone())
            .unwrap_or_else(|_| ConfidenceMetrics::empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Signal;
    use crate::ports::exchange::OrderType;
    use chrono::Utc;

    #[tokio::test]
    async fn test_mock_exchange_fills_at_last_close() {
        let exchange = MockExchange::new().with_candles(candle_series(&[100.0, 101.0, 102.0]));

        let candles = exchange.get_market_data("BTC_USDT", 2).await.unwrap();
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[1].close, 102.0);

        let ack = exchange
            .place_order(OrderRequest {
                pair: "BTC_USDT".into(),
                side: Signal::Buy,
                order_type: OrderType::Market,
                quantity: 1.0,
                price: None,
            })
            .await
            .unwrap();
        assert_eq!(ack.fill_price, Some(102.0));
        assert_eq!(exchange.orders().len(), 1);
    }

    #[tokio::test]
    async fn test_mock_exchange_scripted_failure() {
        let exchange = MockExchange::new()
            .with_order_result(Err(ExchangeError::ApiError("timeout".into())));
        let request = OrderRequest {
            pair: "BTC_USDT".into(),
            side: Signal::Sell,
            order_type: OrderType::Market,
            quantity: 1.0,
            price: Some(50.0),
        };
        assert!(exchange.place_order(request.clone()).await.is_err());
        assert!(exchange.place_order(request).await.is_ok());
    }

    #[tokio::test]
    async fn test_mock_exchange_order_delay() {
        let exchange = MockExchange::new();
        exchange.set_order_delay(StdDuration::from_millis(50));
        let request = OrderRequest {
            pair: "BTC_USDT".into(),
            side: Signal::Buy,
            order_type: OrderType::Market,
            quantity: 1.0,
            price: Some(100.0),
        };
        let started = std::time::Instant::now();
        assert!(exchange.place_order(request).await.is_ok());
        assert!(started.elapsed() >= StdDuration::from_millis(50));
        assert_eq!(exchange.orders().len(), 1);
    }

    #[tokio::test]
    async fn test_scripted_backtest_queue_then_default() {
        let backtest = ScriptedBacktest::always(Ok(BacktestResult::default()))
            .then(Err(BacktestError::DataUnavailable("down".into())));
        let def = StrategyDefinition {
            id: "s1".into(),
            name: "s1".into(),
            pair: "BTC_USDT".into(),
            family: crate::domain::StrategyFamily::Momentum { fast_period: 5, slow_period: 20 },
            generation: 0,
            target_condition: crate::domain::MarketCondition::Ranging,
            created_at: Utc::now(),
        };
        let options = BacktestOptions::default();
        assert!(backtest.run_backtest(&def, &options).await.is_err());
        assert!(backtest.run_backtest(&def, &options).await.is_ok());
        assert_eq!(backtest.calls(), vec!["s1".to_string(), "s1".to_string()]);
    }

    #[test]
    fn test_recording_sink() {
        let sink = RecordingSink::new();
        sink.publish("s1", &Notification::critical(crate::domain::Phase::LiveTrading, "t", "m"));
        assert_eq!(sink.of_kind(NotificationType::Critical).len(), 1);
        assert!(sink.of_kind(NotificationType::Info).is_empty());
    }
}
