//! Push-based metrics reporter: periodically serializes a portfolio
//! snapshot as structured JSON to stdout for log-based collection. This
//! system only sends data, it never accepts requests.

use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::info;

use crate::application::trading::PortfolioTracker;

use super::metrics::Metrics;

#[derive(Serialize)]
pub struct MetricsSnapshot {
    pub timestamp: String,
    pub uptime_seconds: u64,
    pub version: &'static str,
    pub portfolio: PortfolioSnapshot,
}

#[derive(Serialize)]
pub struct PortfolioSnapshot {
    pub cash_usd: f64,
    pub total_value_usd: f64,
    pub positions_count: usize,
    pub positions: Vec<PositionSnapshot>,
}

#[derive(Serialize)]
pub struct PositionSnapshot {
    pub symbol: String,
    pub tag: String,
    pub qty: f64,
    pub avg_entry: f64,
    pub current_value: f64,
}

pub struct MetricsReporter {
    portfolio: Arc<RwLock<PortfolioTracker>>,
    metrics: Metrics,
    start_time: Instant,
    interval: Duration,
}

impl MetricsReporter {
    pub fn new(
        portfolio: Arc<RwLock<PortfolioTracker>>,
        metrics: Metrics,
        interval_secs: u64,
    ) -> Self {
        Self {
            portfolio,
            metrics,
            start_time: Instant::now(),
            interval: Duration::from_secs(interval_secs),
        }
    }

    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            ticker.tick().await;
            self.report_once().await;
        }
    }

    async fn report_once(&self) {
        let snapshot = {
            let portfolio = self.portfolio.read().await;
            let positions: Vec<PositionSnapshot> = portfolio
                .positions()
                .values()
                .map(|p| PositionSnapshot {
                    symbol: p.symbol.clone(),
                    tag: p.tag.clone(),
                    qty: p.qty,
                    avg_entry: p.avg_entry,
                    current_value: p.market_value(),
                })
                .collect();
            let total = portfolio.total_value();

            self.metrics.portfolio_value_usd.set(total);
            self.metrics.portfolio_cash_usd.set(portfolio.cash());
            self.metrics.positions_count.set(positions.len() as f64);
            self.metrics
                .daily_pnl_usd
                .set(total - portfolio.daily_start_value());

            MetricsSnapshot {
                timestamp: chrono::Utc::now().to_rfc3339(),
                uptime_seconds: self.start_time.elapsed().as_secs(),
                version: env!("CARGO_PKG_VERSION"),
                portfolio: PortfolioSnapshot {
                    cash_usd: portfolio.cash(),
                    total_value_usd: total,
                    positions_count: positions.len(),
                    positions,
                },
            }
        };

        match serde_json::to_string(&snapshot) {
            Ok(json) => info!("METRICS_JSON:{json}"),
            Err(e) => tracing::warn!(error = %e, "metrics snapshot serialization failed"),
        }
    }
}
