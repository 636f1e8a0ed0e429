//! Offline backtest runner: replays the active (or a specified) strategy
//! against the candles already in the store and prints the result. Zero
//! network, zero LLM cost.
//!
//! ```sh
//! cargo run --bin backtest -- --config-dir config --days 30
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use evotrade::application::backtest::{Backtester, CandleData};
use evotrade::application::data::DataStore;
use evotrade::application::strategy::StrategyLoader;
use evotrade::config::Config;
use evotrade::domain::market::Timeframe;
use evotrade::infrastructure::persistence::Store;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::prelude::*;

#[derive(Parser)]
#[command(name = "backtest", version, about = "Replay the strategy against stored candles")]
struct Cli {
    /// Directory containing settings.toml and risk_limits.toml
    #[arg(long, default_value = "config")]
    config_dir: PathBuf,

    /// Strategy file to test instead of the active one
    #[arg(long)]
    strategy_file: Option<PathBuf>,

    /// Starting cash for the simulation (defaults to paper balance)
    #[arg(long)]
    starting_cash: Option<f64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::WARN.into()))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = Config::load(&cli.config_dir)?;
    let store = Store::connect(&config.db_url).await?;
    let data_store = DataStore::new(store.clone(), config.data.clone());

    let mut candle_data = HashMap::new();
    for symbol in &config.symbols {
        let m5 = data_store.get_candles(symbol, Timeframe::M5, Some(8640)).await?;
        let h1 = data_store.get_candles(symbol, Timeframe::H1, Some(8760)).await?;
        let d1 = data_store.get_candles(symbol, Timeframe::D1, Some(2555)).await?;
        if !h1.is_empty() {
            candle_data.insert(symbol.clone(), (m5, h1, d1));
        }
    }
    if candle_data.is_empty() {
        anyhow::bail!("no stored 1h candles to replay; run the engine first to collect data");
    }

    let loader = StrategyLoader::new(config.worker.strategy_dir.clone(), config.worker.clone());
    let mut loaded = match &cli.strategy_file {
        Some(path) => {
            let code = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let check = evotrade::application::strategy::validate_strategy_static(&code);
            if !check.passed {
                anyhow::bail!("strategy failed validation: {:?}", check.errors);
            }
            Box::new(
                evotrade::application::strategy::WorkerStrategy::from_code(&code, &config.worker)
                    .await?,
            ) as Box<dyn evotrade::domain::contract::Strategy>
        }
        None => loader.load_with_fallback(&store).await.strategy,
    };

    let mut backtester = Backtester::new(
        loaded.as_mut(),
        config.risk_limits(),
        config.symbols.clone(),
        config.kraken.maker_fee_pct,
        config.kraken.taker_fee_pct,
        cli.starting_cash.unwrap_or(config.paper_balance_usd),
        HashMap::new(),
        config.default_slippage_factor,
    );
    let result = backtester.run(&CandleData::Multi(candle_data)).await?;

    println!("{}", result.detailed_summary());
    Ok(())
}
