//! IO contract between the shell and strategy modules.
//!
//! These types define exactly what a strategy receives and what it must
//! return. The shell enforces every constraint; strategy code (built-in or
//! running in an external worker) only ever sees these shapes.

use crate::domain::market::CandleSeries;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    Buy,
    Sell,
    Close,
    Modify,
}

impl Action {
    /// SELL/CLOSE/MODIFY bypass all entry-side risk blocks.
    pub fn is_exit(&self) -> bool {
        matches!(self, Action::Sell | Action::Close | Action::Modify)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Buy => write!(f, "BUY"),
            Action::Sell => write!(f, "SELL"),
            Action::Close => write!(f, "CLOSE"),
            Action::Modify => write!(f, "MODIFY"),
        }
    }
}

/// How long a position is meant to be held. Informational, not enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Intent {
    #[default]
    Day,
    Swing,
    Position,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Day => "DAY",
            Intent::Swing => "SWING",
            Intent::Position => "POSITION",
        }
    }

    /// Parse from a stored string, defaulting to DAY on anything invalid.
    pub fn parse_lossy(s: &str) -> Intent {
        match s {
            "SWING" => Intent::Swing,
            "POSITION" => Intent::Position,
            _ => Intent::Day,
        }
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    #[default]
    Market,
    Limit,
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderType::Market => write!(f, "MARKET"),
            OrderType::Limit => write!(f, "LIMIT"),
        }
    }
}

/// One trading instruction from a strategy. The risk manager validates and
/// clamps these before execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: String,
    pub action: Action,
    /// Fraction of portfolio value, 0.0-1.0.
    pub size_pct: f64,
    #[serde(default)]
    pub order_type: OrderType,
    #[serde(default)]
    pub limit_price: Option<f64>,
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub take_profit: Option<f64>,
    #[serde(default)]
    pub intent: Intent,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: String,
    /// Overrides the configured slippage factor for this fill only.
    #[serde(default)]
    pub slippage_tolerance: Option<f64>,
    /// Position tag for multi-position targeting and MODIFY.
    #[serde(default)]
    pub tag: Option<String>,
}

fn default_confidence() -> f64 {
    0.5
}

impl Signal {
    pub fn close(symbol: &str, reasoning: String) -> Self {
        Self {
            symbol: symbol.to_string(),
            action: Action::Close,
            size_pct: 1.0,
            order_type: OrderType::Market,
            limit_price: None,
            stop_loss: None,
            take_profit: None,
            intent: Intent::Day,
            confidence: 1.0,
            reasoning,
            slippage_tolerance: None,
            tag: None,
        }
    }
}

/// Market snapshot for one symbol, as handed to `Strategy::analyze`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolData {
    pub symbol: String,
    pub current_price: f64,
    pub candles_5m: CandleSeries,
    pub candles_1h: CandleSeries,
    pub candles_1d: CandleSeries,
    pub spread: f64,
    pub volume_24h: f64,
    /// Per-pair maker fee (%), from the exchange fee schedule.
    pub maker_fee_pct: f64,
    /// Per-pair taker fee (%).
    pub taker_fee_pct: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenPosition {
    pub symbol: String,
    pub side: String,
    pub qty: f64,
    pub avg_entry: f64,
    pub current_price: f64,
    pub unrealized_pnl: f64,
    pub unrealized_pnl_pct: f64,
    pub intent: Intent,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub opened_at: DateTime<Utc>,
    pub tag: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub symbol: String,
    pub side: String,
    pub qty: f64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub pnl: f64,
    pub pnl_pct: f64,
    pub fees: f64,
    pub intent: Intent,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
}

/// Portfolio snapshot handed to `Strategy::analyze`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioView {
    pub cash: f64,
    pub total_value: f64,
    pub positions: Vec<OpenPosition>,
    /// Last 100 closed trades.
    pub recent_trades: Vec<ClosedTrade>,
    pub daily_pnl: f64,
    pub total_pnl: f64,
    pub fees_today: f64,
}

/// Hard limits the shell enforces. Strategies receive a copy at
/// `initialize` so they can size within them, but cannot change them.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RiskLimits {
    pub max_trade_pct: f64,
    pub default_trade_pct: f64,
    pub max_positions: usize,
    pub max_daily_loss_pct: f64,
    pub max_drawdown_pct: f64,
    pub max_position_pct: f64,
    pub max_daily_trades: u32,
    pub rollback_consecutive_losses: u32,
}

/// The strategy interface. Implemented natively by the built-in baseline and
/// by `WorkerStrategy`, which proxies each call to an external worker
/// process over line-delimited JSON.
#[async_trait]
pub trait Strategy: Send + Sync {
    async fn initialize(&mut self, risk_limits: &RiskLimits, symbols: &[String]) -> Result<()>;

    async fn analyze(
        &mut self,
        markets: &HashMap<String, SymbolData>,
        portfolio: &PortfolioView,
        timestamp: DateTime<Utc>,
    ) -> Result<Vec<Signal>>;

    async fn on_fill(
        &mut self,
        _symbol: &str,
        _action: Action,
        _qty: f64,
        _price: f64,
        _intent: Intent,
        _tag: &str,
    ) -> Result<()> {
        Ok(())
    }

    async fn on_position_closed(
        &mut self,
        _symbol: &str,
        _pnl: f64,
        _pnl_pct: f64,
        _tag: &str,
    ) -> Result<()> {
        Ok(())
    }

    /// Opaque state blob persisted across restarts.
    async fn get_state(&mut self) -> Result<serde_json::Value> {
        Ok(serde_json::json!({}))
    }

    async fn load_state(&mut self, _state: serde_json::Value) -> Result<()> {
        Ok(())
    }

    fn scan_interval_minutes(&self) -> u64 {
        5
    }

    /// Advisory regime label ("trending", "ranging", ...) if the strategy
    /// exposes one. Logged, never trusted.
    fn regime(&self) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_exit_classification() {
        assert!(!Action::Buy.is_exit());
        assert!(Action::Sell.is_exit());
        assert!(Action::Close.is_exit());
        assert!(Action::Modify.is_exit());
    }

    #[test]
    fn signal_round_trips_through_json() {
        let json = r#"{"symbol":"BTC/USD","action":"BUY","size_pct":0.05,
            "stop_loss":48000.0,"intent":"SWING","confidence":0.8,
            "reasoning":"breakout","tag":"a"}"#;
        let sig: Signal = serde_json::from_str(json).unwrap();
        assert_eq!(sig.action, Action::Buy);
        assert_eq!(sig.intent, Intent::Swing);
        assert_eq!(sig.order_type, OrderType::Market);
        assert_eq!(sig.tag.as_deref(), Some("a"));
    }

    #[test]
    fn intent_parse_lossy_defaults_to_day() {
        assert_eq!(Intent::parse_lossy("SWING"), Intent::Swing);
        assert_eq!(Intent::parse_lossy("bogus"), Intent::Day);
    }
}
