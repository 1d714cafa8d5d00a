//! Simulated Exchange
//!
//! In-process exchange for the `run` command and integration tests.
//! Candles follow a Gaussian random walk around a per-asset base price
//! (BTC 50000, ETH 3000, anything else 100), one new hourly candle per
//! market-data request. Orders always fill at the latest close.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rand::distributions::Distribution;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use statrs::distribution::Normal;
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::domain::{Candle, Signal};
use crate::ports::{
    AssetBalance, ConditionalOrderRequest, ExchangeError, ExchangePort, OrderAck, OrderRequest, OrderType,
};

#[derive(Debug, Clone)]
pub struct SimulatedExchangeConfig {
    pub quote_asset: String,
    pub initial_quote_balance: f64,
    pub fee_rate: f64,
    /// Per-candle return standard deviation
    pub volatility: f64,
    /// Candles generated before the first request
    pub history: usize,
    pub seed: Option<u64>,
}

impl Default for SimulatedExchangeConfig {
    fn default() -> Self {
        Self {
            quote_asset: "USDT".to_string(),
            initial_quote_balance: 10_000.0,
            fee_rate: 0.001,
            volatility: 0.01,
            history: 500,
            seed: None,
        }
    }
}

/// Starting price for a base asset
pub fn base_price(asset: &str) -> f64 {
    match asset.to_uppercase().as_str() {
        "BTC" => 50_000.0,
        "ETH" => 3_000.0,
        _ => 100.0,
    }
}

/// Split "BTC_USDT" / "BTC/USDT" / "BTC-USDT" into base and quote
pub fn split_pair(pair: &str) -> Result<(String, String), ExchangeError> {
    let mut parts = pair.split(['_', '/', '-']);
    match (parts.next(), parts.next(), parts.next()) {
        (Some(base), Some(quote), None) if !base.is_empty() && !quote.is_empty() => {
            Ok((base.to_uppercase(), quote.to_uppercase()))
        }
        _ => Err(ExchangeError::UnknownPair(pair.to_string())),
    }
}

#[derive(Debug)]
struct SimState {
    rng: StdRng,
    series: HashMap<String, Vec<Candle>>,
    balances: HashMap<String, f64>,
    conditional: HashMap<String, ConditionalOrderRequest>,
    next_order: u64,
}

#[derive(Debug)]
pub struct SimulatedExchange {
    config: SimulatedExchangeConfig,
    returns: Normal,
    state: Mutex<SimState>,
}

impl SimulatedExchange {
    pub fn new(config: SimulatedExchangeConfig) -> Result<Self, ExchangeError> {
        let returns = Normal::new(0.0, config.volatility)
            .map_err(|e| ExchangeError::InvalidParameters(format!("volatility {}: {}", config.volatility, e)))?;
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let mut balances = HashMap::new();
        balances.insert(config.quote_asset.clone(), config.initial_quote_balance);

        Ok(Self {
            config,
            returns,
            state: Mutex::new(SimState {
                rng,
                series: HashMap::new(),
                balances,
                conditional: HashMap::new(),
                next_order: 0,
            }),
        })
    }

    pub fn config(&self) -> &SimulatedExchangeConfig {
        &self.config
    }

    /// Conditional orders that have not been cancelled
    pub async fn open_conditional_orders(&self) -> Vec<(String, ConditionalOrderRequest)> {
        let state = self.state.lock().await;
        state.conditional.iter().map(|(id, r)| (id.clone(), r.clone())).collect()
    }

    fn next_candle(&self, rng: &mut StdRng, prev_close: f64, timestamp: DateTime<Utc>) -> Candle {
        let open = prev_close;
        let close = (open * (1.0 + self.returns.sample(rng))).max(open * 0.5);
        let wick = open * self.config.volatility * rng.gen_range(0.0..0.5);
        let high = open.max(close) + wick;
        let low = (open.min(close) - wick).max(f64::EPSILON);
        let volume = rng.gen_range(1_000_000.0..3_000_000.0) / open;
        Candle::new(timestamp, open, high, low, close, volume)
    }

    fn seed_series(&self, rng: &mut StdRng, base: &str) -> Vec<Candle> {
        let count = self.config.history.max(1);
        let start = Utc::now() - Duration::hours(count as i64);
        let mut candles = Vec::with_capacity(count);
        let mut close = base_price(base);
        for i in 0..count {
            let candle = self.next_candle(rng, close, start + Duration::hours(i as i64));
            close = candle.close;
            candles.push(candle);
        }
        candles
    }
}

#[async_trait]
impl ExchangePort for SimulatedExchange {
    async fn get_account_balance(&self) -> Result<Vec<AssetBalance>, ExchangeError> {
        let state = self.state.lock().await;
        let mut balances: Vec<AssetBalance> = state
            .balances
            .iter()
            .map(|(asset, free)| AssetBalance { asset: asset.clone(), free: *free, locked: 0.0 })
            .collect();
        balances.sort_by(|a, b| a.asset.cmp(&b.asset));
        Ok(balances)
    }

    async fn get_market_data(&self, pair: &str, limit: usize) -> Result<Vec<Candle>, ExchangeError> {
        let (base, _) = split_pair(pair)?;
        let mut state = self.state.lock().await;
        let SimState { rng, series, .. } = &mut *state;

        match series.get_mut(pair) {
            Some(candles) => {
                if let Some(last) = candles.last().cloned() {
                    let next = self.next_candle(rng, last.close, last.timestamp + Duration::hours(1));
                    candles.push(next);
                }
            }
            None => {
                let seeded = self.seed_series(rng, &base);
                series.insert(pair.to_string(), seeded);
            }
        }

        let candles = series.get(pair).map(Vec::as_slice).unwrap_or(&[]);
        let start = candles.len().saturating_sub(limit);
        Ok(candles[start..].to_vec())
    }

    async fn place_order(&self, request: OrderRequest) -> Result<OrderAck, ExchangeError> {
        if !(request.quantity.is_finite() && request.quantity > 0.0) {
            return Err(ExchangeError::InvalidParameters(format!("quantity {}", request.quantity)));
        }
        let (base, quote) = split_pair(&request.pair)?;
        let mut state = self.state.lock().await;

        let last_close = state
            .series
            .get(&request.pair)
            .and_then(|c| c.last())
            .map(|c| c.close);
        let price = match (request.order_type, request.price, last_close) {
            (OrderType::Limit, Some(limit), _) => limit,
            (_, _, Some(close)) => close,
            (_, Some(reference), None) => reference,
            (_, None, None) => base_price(&base),
        };

        let notional = request.quantity * price;
        let fee = notional * self.config.fee_rate;
        let (base_delta, quote_delta) = match request.side {
            Signal::Buy => (request.quantity, -(notional + fee)),
            Signal::Sell => (-request.quantity, notional - fee),
            Signal::Hold => {
                return Err(ExchangeError::InvalidParameters(format!("side {}", request.side)))
            }
        };
        *state.balances.entry(base).or_insert(0.0) += base_delta;
        *state.balances.entry(quote).or_insert(0.0) += quote_delta;

        state.next_order += 1;
        let order_id = format!("sim-{}", state.next_order);
        tracing::debug!(
            "Simulated {} {} {:.6} @ {:.4} fee {:.4} ({})",
            request.side,
            request.pair,
            request.quantity,
            price,
            fee,
            order_id
        );

        Ok(OrderAck {
            order_id,
            success: true,
            fill_price: Some(price),
            fee,
            message: None,
        })
    }

    async fn place_conditional_order(
        &self,
        request: ConditionalOrderRequest,
    ) -> Result<OrderAck, ExchangeError> {
        split_pair(&request.pair)?;
        if !(request.trigger_price.is_finite() && request.trigger_price > 0.0) {
            return Err(ExchangeError::InvalidParameters(format!("trigger {}", request.trigger_price)));
        }
        let mut state = self.state.lock().await;
        state.next_order += 1;
        let order_id = format!("sim-stop-{}", state.next_order);
        state.conditional.insert(order_id.clone(), request);
        Ok(OrderAck {
            order_id,
            success: true,
            fill_price: None,
            fee: 0.0,
            message: Some("resting".to_string()),
        })
    }

    async fn cancel_order(&self, _pair: &str, order_id: &str) -> Result<(), ExchangeError> {
        let mut state = self.state.lock().await;
        state
            .conditional
            .remove(order_id)
            .map(|_| ())
            .ok_or_else(|| ExchangeError::OrderNotFound(order_id.to_string()))
    }
}
