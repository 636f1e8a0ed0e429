//! evotrade server: headless autonomous trading engine.
//!
//! Runs the full system: scan loop, position monitor, candidate slots,
//! nightly orchestration, and the notification sink. Metrics are pushed
//! via structured JSON logs to stdout. No HTTP server, no incoming
//! connections.
//!
//! # Usage
//! ```sh
//! cargo run -- --config-dir config
//! ```
//!
//! Exit codes: 0 on clean shutdown, nonzero on unrecoverable startup
//! failure (invalid config, store cannot open).

use clap::Parser;
use evotrade::application::engine::Engine;
use evotrade::config::Config;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::prelude::*;

#[derive(Parser)]
#[command(name = "evotrade", version, about = "Autonomous self-evolving crypto trading engine")]
struct Cli {
    /// Directory containing settings.toml and risk_limits.toml
    #[arg(long, default_value = "config")]
    config_dir: PathBuf,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let stdout_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with(stdout_layer)
        .init();

    info!("evotrade {} starting", env!("CARGO_PKG_VERSION"));

    let config = match Config::load(&cli.config_dir) {
        Ok(config) => config,
        Err(e) => {
            error!("{e:#}");
            std::process::exit(2);
        }
    };
    info!(
        mode = %config.mode,
        symbols = ?config.symbols,
        timezone = %config.timezone,
        "configuration loaded"
    );

    let engine = match Engine::build(config).await {
        Ok(engine) => Arc::new(engine),
        Err(e) => {
            error!("startup failed: {e:#}");
            std::process::exit(1);
        }
    };

    match engine.run().await {
        Ok(()) => info!("clean shutdown"),
        Err(e) => {
            error!("engine error: {e:#}");
            std::process::exit(1);
        }
    }
}
