//! Strategy Autopilot
//!
//! Drives trading strategies from generation through paper trading to
//! guarded live trading.

use anyhow::Result;

use strategy_autopilot::adapters::cli;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if it exists (overrides go here, not in autopilot.toml)
    dotenvy::dotenv().ok();

    let app = cli::init();
    cli::execute(app).await
}
