//! Prometheus metric definitions. Push-based and write-only: the engine
//! never serves HTTP; the reporter serializes snapshots to the log.

use prometheus::{
    core::{AtomicF64, GenericGauge},
    CounterVec, Gauge, Opts, Registry,
};
use std::sync::Arc;

#[derive(Clone)]
pub struct Metrics {
    #[allow(dead_code)]
    registry: Arc<Registry>,
    /// Total portfolio value in USD
    pub portfolio_value_usd: GenericGauge<AtomicF64>,
    /// Available cash in USD
    pub portfolio_cash_usd: GenericGauge<AtomicF64>,
    /// Number of open positions
    pub positions_count: GenericGauge<AtomicF64>,
    /// Daily P&L in USD
    pub daily_pnl_usd: GenericGauge<AtomicF64>,
    /// Risk halt status (0=trading, 1=halted)
    pub risk_halted: GenericGauge<AtomicF64>,
    /// Scans completed, by outcome
    pub scans_total: CounterVec,
    /// Signals by action and outcome (executed/rejected)
    pub signals_total: CounterVec,
    /// Trades closed, by close reason
    pub trades_total: CounterVec,
    /// WebSocket reconnect attempts
    pub websocket_reconnects_total: CounterVec,
    /// AI tokens spent, by model
    pub ai_tokens_total: CounterVec,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let portfolio_value_usd = Gauge::with_opts(Opts::new(
            "evotrade_portfolio_value_usd",
            "Total portfolio value in USD",
        ))?;
        registry.register(Box::new(portfolio_value_usd.clone()))?;

        let portfolio_cash_usd = Gauge::with_opts(Opts::new(
            "evotrade_portfolio_cash_usd",
            "Available cash in USD",
        ))?;
        registry.register(Box::new(portfolio_cash_usd.clone()))?;

        let positions_count = Gauge::with_opts(Opts::new(
            "evotrade_positions_count",
            "Number of open positions",
        ))?;
        registry.register(Box::new(positions_count.clone()))?;

        let daily_pnl_usd =
            Gauge::with_opts(Opts::new("evotrade_daily_pnl_usd", "Daily P&L in USD"))?;
        registry.register(Box::new(daily_pnl_usd.clone()))?;

        let risk_halted = Gauge::with_opts(Opts::new(
            "evotrade_risk_halted",
            "Risk halt status (0=trading, 1=halted)",
        ))?;
        registry.register(Box::new(risk_halted.clone()))?;

        let scans_total = CounterVec::new(
            Opts::new("evotrade_scans_total", "Scans completed, by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(scans_total.clone()))?;

        let signals_total = CounterVec::new(
            Opts::new("evotrade_signals_total", "Signals by action and outcome"),
            &["action", "outcome"],
        )?;
        registry.register(Box::new(signals_total.clone()))?;

        let trades_total = CounterVec::new(
            Opts::new("evotrade_trades_total", "Closed trades by close reason"),
            &["close_reason"],
        )?;
        registry.register(Box::new(trades_total.clone()))?;

        let websocket_reconnects_total = CounterVec::new(
            Opts::new(
                "evotrade_websocket_reconnects_total",
                "WebSocket reconnect attempts",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(websocket_reconnects_total.clone()))?;

        let ai_tokens_total = CounterVec::new(
            Opts::new("evotrade_ai_tokens_total", "AI tokens spent, by model"),
            &["model", "direction"],
        )?;
        registry.register(Box::new(ai_tokens_total.clone()))?;

        Ok(Self {
            registry: Arc::new(registry),
            portfolio_value_usd,
            portfolio_cash_usd,
            positions_count,
            daily_pnl_usd,
            risk_halted,
            scans_total,
            signals_total,
            trades_total,
            websocket_reconnects_total,
            ai_tokens_total,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_register_cleanly() {
        let metrics = Metrics::new().unwrap();
        metrics.portfolio_value_usd.set(123.45);
        metrics.scans_total.with_label_values(&["ok"]).inc();
        assert_eq!(metrics.portfolio_value_usd.get(), 123.45);
    }
}
