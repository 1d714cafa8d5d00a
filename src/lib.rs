//! Strategy Autopilot Library
//!
//! Autonomous lifecycle for crypto trading strategies: generate candidates,
//! backtest them, paper trade the best one, score its readiness, and only
//! then trade live behind hard risk limits and an emergency stop.
//!
//! # Modules
//!
//! - `domain`: Core types and math (Phase, Session, ledgers, ConfidenceScorer, RiskLimits)
//! - `ports`: Trait abstractions (ExchangePort, SignalPort, BacktestPort, SessionStore)
//! - `strategy`: Market condition classification, candidate generation, signals
//! - `application`: Backtest runner, mock simulator, live guard, phase orchestrator
//! - `adapters`: Simulated exchange, replay backtester, session stores, CLI
//! - `config`: Configuration loading and validation

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;
pub mod ports;
pub mod strategy;
