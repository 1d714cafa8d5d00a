//! Candle Replay Backtester
//!
//! Replays exchange history through a strategy's signal function with the
//! same position rules as paper trading: flat opens, same side is ignored,
//! opposite side closes. An open position is closed at the final candle.

use async_trait::async_trait;
use statrs::statistics::Statistics;
use std::sync::Arc;

use crate::domain::{max_drawdown, Candle, Signal, StrategyDefinition};
use crate::ports::{
    BacktestError, BacktestOptions, BacktestPort, BacktestResult, BacktestTrade, ExchangePort, SignalPort,
};

/// Candles passed to the signal function per step
const SIGNAL_WINDOW: usize = 200;
/// Reported when there are winners and no losers
const MAX_PROFIT_FACTOR: f64 = 10.0;

pub struct CandleReplayBacktester {
    exchange: Arc<dyn ExchangePort>,
    signals: Arc<dyn SignalPort>,
}

struct OpenPosition {
    side: Signal,
    entry_index: usize,
    entry_price: f64,
    quantity: f64,
    entry_fee: f64,
}

impl CandleReplayBacktester {
    pub fn new(exchange: Arc<dyn ExchangePort>, signals: Arc<dyn SignalPort>) -> Self {
        Self { exchange, signals }
    }

    /// Replay `candles` without touching the exchange
    pub fn replay(
        &self,
        strategy: &StrategyDefinition,
        candles: &[Candle],
        options: &BacktestOptions,
    ) -> Result<BacktestResult, BacktestError> {
        strategy.family.validate().map_err(BacktestError::InvalidStrategy)?;
        let required = strategy.family.warmup() + 2;
        if candles.len() < required {
            return Err(BacktestError::InsufficientData(required, candles.len()));
        }

        let mut balance = options.initial_balance;
        let mut curve = vec![balance];
        let mut trades: Vec<BacktestTrade> = Vec::new();
        let mut position: Option<OpenPosition> = None;

        for i in strategy.family.warmup()..candles.len() {
            let start = (i + 1).saturating_sub(SIGNAL_WINDOW);
            let window = &candles[start..=i];
            let price = candles[i].close;
            if !(price.is_finite() && price > 0.0) {
                continue;
            }
            let Some(side) = self.signals.execute(strategy, window).actionable() else {
                continue;
            };

            match &position {
                Some(open) if open.side == side => {}
                Some(_) => {
                    if let Some(open) = position.take() {
                        let trade = close(&open, candles, i, options.fee_rate);
                        balance += trade.pnl;
                        curve.push(balance);
                        trades.push(trade);
                    }
                }
                None => {
                    let quantity = balance * options.position_size / price;
                    if quantity > 0.0 {
                        position = Some(OpenPosition {
                            side,
                            entry_index: i,
                            entry_price: price,
                            quantity,
                            entry_fee: quantity * price * options.fee_rate,
                        });
                    }
                }
            }
        }

        if let Some(open) = position.take() {
            let trade = close(&open, candles, candles.len() - 1, options.fee_rate);
            balance += trade.pnl;
            curve.push(balance);
            trades.push(trade);
        }

        Ok(summarize(trades, &curve, options.initial_balance))
    }
}

#[async_trait]
impl BacktestPort for CandleReplayBacktester {
    async fn run_backtest(
        &self,
        strategy: &StrategyDefinition,
        options: &BacktestOptions,
    ) -> Result<BacktestResult, BacktestError> {
        let candles = self
            .exchange
            .get_market_data(&strategy.pair, options.candles)
            .await
            .map_err(|e| BacktestError::DataUnavailable(e.to_string()))?;
        self.replay(strategy, &candles, options)
    }
}

fn close(open: &OpenPosition, candles: &[Candle], exit_index: usize, fee_rate: f64) -> BacktestTrade {
    let exit_price = candles[exit_index].close;
    let direction = if open.side == Signal::Sell { -1.0 } else { 1.0 };
    let exit_fee = open.quantity * exit_price * fee_rate;
    let pnl = (exit_price - open.entry_price) * open.quantity * direction - open.entry_fee - exit_fee;
    BacktestTrade {
        side: open.side,
        entry_time: candles[open.entry_index].timestamp,
        exit_time: candles[exit_index].timestamp,
        entry_price: open.entry_price,
        exit_price,
        quantity: open.quantity,
        pnl,
    }
}

fn summarize(trades: Vec<BacktestTrade>, curve: &[f64], initial_balance: f64) -> BacktestResult {
    if trades.is_empty() {
        return BacktestResult::default();
    }

    let total_pnl: f64 = trades.iter().map(|t| t.pnl).sum();
    let wins = trades.iter().filter(|t| t.pnl > 0.0).count();
    let gross_win: f64 = trades.iter().filter(|t| t.pnl > 0.0).map(|t| t.pnl).sum();
    let gross_loss: f64 = trades.iter().filter(|t| t.pnl < 0.0).map(|t| -t.pnl).sum();

    let profit_factor = if gross_loss > 0.0 {
        gross_win / gross_loss
    } else if gross_win > 0.0 {
        MAX_PROFIT_FACTOR
    } else {
        0.0
    };

    // Per-trade returns against the balance before each trade
    let returns: Vec<f64> = curve
        .windows(2)
        .filter(|w| w[0] > 0.0)
        .map(|w| (w[1] - w[0]) / w[0])
        .collect();
    let sharpe_ratio = if returns.len() >= 2 {
        let mean = returns.iter().mean();
        let std = returns.iter().std_dev();
        if std > 0.0 && std.is_finite() {
            mean / std * (returns.len() as f64).sqrt()
        } else {
            0.0
        }
    } else {
        0.0
    };

    BacktestResult {
        total_pnl,
        total_return: if initial_balance > 0.0 { total_pnl / initial_balance } else { 0.0 },
        win_rate: wins as f64 / trades.len() as f64,
        sharpe_ratio,
        max_drawdown: max_drawdown(curve),
        profit_factor,
        trades,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{MarketCondition, StrategyFamily, StrategySignal};
    use crate::ports::mocks::{candle_series, FixedSignal, MockExchange};
    use crate::strategy::RuleBasedSignals;
    use chrono::Utc;

    fn definition(family: StrategyFamily) -> StrategyDefinition {
        StrategyDefinition {
            id: "bt".into(),
            name: "bt".into(),
            pair: "BTC_USDT".into(),
            family,
            generation: 0,
            target_condition: MarketCondition::Ranging,
            created_at: Utc::now(),
        }
    }

    fn momentum() -> StrategyDefinition {
        definition(StrategyFamily::Momentum { fast_period: 3, slow_period: 8 })
    }

    #[tokio::test]
    async fn test_zero_trades_is_finite_and_empty() {
        let candles = candle_series(&vec![100.0; 60]);
        let exchange = Arc::new(MockExchange::new().with_candles(candles));
        let signals = Arc::new(FixedSignal::new(StrategySignal::hold(0.5)));
        let bt = CandleReplayBacktester::new(exchange, signals);

        let result = bt.run_backtest(&momentum(), &BacktestOptions::default()).await.unwrap();
        assert!(result.trades.is_empty());
        assert_eq!(result.win_rate, 0.0);
        assert_eq!(result.profit_factor, 0.0);
        assert!(result.sharpe_ratio.is_finite());
        assert!(result.max_drawdown.is_finite());
    }

    #[tokio::test]
    async fn test_insufficient_history() {
        let exchange = Arc::new(MockExchange::new().with_candles(candle_series(&[100.0, 101.0])));
        let bt = CandleReplayBacktester::new(exchange, Arc::new(RuleBasedSignals::new()));
        assert!(matches!(
            bt.run_backtest(&momentum(), &BacktestOptions::default()).await,
            Err(BacktestError::InsufficientData(_, 2))
        ));
    }

    #[tokio::test]
    async fn test_exchange_failure_is_data_unavailable() {
        let exchange = Arc::new(MockExchange::new());
        exchange.set_market_data_failure(true);
        let bt = CandleReplayBacktester::new(exchange, Arc::new(RuleBasedSignals::new()));
        assert!(matches!(
            bt.run_backtest(&momentum(), &BacktestOptions::default()).await,
            Err(BacktestError::DataUnavailable(_))
        ));
    }

    #[test]
    fn test_long_position_closed_at_end() {
        let closes: Vec<f64> = (0..40).map(|i| 100.0 + i as f64).collect();
        let candles = candle_series(&closes);
        let signals = Arc::new(FixedSignal::new(StrategySignal::new(Signal::Buy, 0.9)));
        let bt = CandleReplayBacktester::new(Arc::new(MockExchange::new()), signals);
        let options = BacktestOptions { fee_rate: 0.0, ..Default::default() };

        let result = bt.replay(&momentum(), &candles, &options).unwrap();
        assert_eq!(result.trades.len(), 1);
        let trade = &result.trades[0];
        assert_eq!(trade.exit_price, 139.0);
        assert!(trade.pnl > 0.0);
        assert_eq!(result.win_rate, 1.0);
        assert_eq!(result.profit_factor, MAX_PROFIT_FACTOR);
        assert_eq!(result.max_drawdown, 0.0);
    }
}
