//! Kraken WebSocket v2 client: live ticker + 5-minute OHLC stream.
//!
//! Reconnects with exponential backoff (2^n seconds, capped at 30) up to a
//! bounded retry count; exhaustion raises a permanent-failure event that
//! the engine routes to the notifier and uses to switch position
//! monitoring to REST polling. A bad message never cancels the listen
//! loop.

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::domain::market::Candle;
use crate::domain::time::parse_utc_lossy;
use crate::infrastructure::observability::Metrics;

use super::pairs::{from_kraken_pair, to_kraken_pair};

#[derive(Debug, Clone)]
pub enum WsEvent {
    Ticker { symbol: String, price: f64 },
    Ohlc { symbol: String, candle: Candle },
    PermanentFailure,
}

pub struct KrakenWebSocket {
    url: String,
    symbols: Vec<String>,
    prices: Arc<RwLock<HashMap<String, f64>>>,
    event_tx: mpsc::Sender<WsEvent>,
    max_retries: u32,
    metrics: Option<Metrics>,
}

impl KrakenWebSocket {
    pub fn new(
        url: String,
        symbols: Vec<String>,
        event_tx: mpsc::Sender<WsEvent>,
        metrics: Option<Metrics>,
    ) -> Self {
        Self {
            url,
            symbols,
            prices: Arc::new(RwLock::new(HashMap::new())),
            event_tx,
            max_retries: 5,
            metrics,
        }
    }

    /// Last seen ticker prices, shared with the position monitor.
    pub fn prices_handle(&self) -> Arc<RwLock<HashMap<String, f64>>> {
        self.prices.clone()
    }

    /// Connect-and-listen loop. Returns after the retry budget is
    /// exhausted, having emitted `PermanentFailure`.
    pub async fn run(self) {
        let mut retry_count: u32 = 0;
        loop {
            match self.connect_and_listen().await {
                Ok(()) => {
                    // Server closed gracefully; treat like any disconnect
                    retry_count = 0;
                    info!("websocket closed by server, reconnecting");
                    tokio::time::sleep(std::time::Duration::from_secs(2)).await;
                }
                Err(e) => {
                    retry_count += 1;
                    if let Some(metrics) = &self.metrics {
                        metrics
                            .websocket_reconnects_total
                            .with_label_values(&["retry"])
                            .inc();
                    }
                    if retry_count >= self.max_retries {
                        break;
                    }
                    let wait = 2u64.pow(retry_count).min(30);
                    warn!(error = %e, retry = retry_count, wait, "websocket reconnecting");
                    tokio::time::sleep(std::time::Duration::from_secs(wait)).await;
                }
            }
        }

        error!(retries = self.max_retries, "websocket permanently failed");
        if let Some(metrics) = &self.metrics {
            metrics
                .websocket_reconnects_total
                .with_label_values(&["permanent_failure"])
                .inc();
        }
        let _ = self.event_tx.send(WsEvent::PermanentFailure).await;
    }

    async fn connect_and_listen(&self) -> anyhow::Result<()> {
        let (ws_stream, _) = connect_async(&self.url).await?;
        info!(url = %self.url, "websocket connected");
        let (mut write, mut read) = ws_stream.split();

        let pairs: Vec<String> = self.symbols.iter().map(|s| to_kraken_pair(s)).collect();
        write
            .send(Message::Text(
                json!({
                    "method": "subscribe",
                    "params": {"channel": "ticker", "symbol": pairs},
                })
                .to_string()
                .into(),
            ))
            .await?;
        write
            .send(Message::Text(
                json!({
                    "method": "subscribe",
                    "params": {"channel": "ohlc", "symbol": pairs, "interval": 5},
                })
                .to_string()
                .into(),
            ))
            .await?;

        while let Some(message) = read.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    // Handler errors never cancel the listen loop
                    if let Err(e) = self.handle_message(&text).await {
                        debug!(error = %e, "websocket message ignored");
                    }
                }
                Ok(Message::Ping(payload)) => {
                    let _ = write.send(Message::Pong(payload)).await;
                }
                Ok(Message::Close(frame)) => {
                    info!(?frame, "websocket close frame");
                    return Ok(());
                }
                Ok(_) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn handle_message(&self, text: &str) -> anyhow::Result<()> {
        let message: Value = serde_json::from_str(text)?;
        match message.get("channel").and_then(Value::as_str) {
            Some("ticker") => {
                for item in message
                    .get("data")
                    .and_then(Value::as_array)
                    .into_iter()
                    .flatten()
                {
                    let Some(pair) = item.get("symbol").and_then(Value::as_str) else {
                        continue;
                    };
                    let Some(price) = item.get("last").and_then(Value::as_f64) else {
                        continue;
                    };
                    if price <= 0.0 {
                        continue;
                    }
                    let symbol = from_kraken_pair(pair);
                    self.prices.write().await.insert(symbol.clone(), price);
                    let _ = self.event_tx.send(WsEvent::Ticker { symbol, price }).await;
                }
            }
            Some("ohlc") => {
                for item in message
                    .get("data")
                    .and_then(Value::as_array)
                    .into_iter()
                    .flatten()
                {
                    let Some(pair) = item.get("symbol").and_then(Value::as_str) else {
                        continue;
                    };
                    let symbol = from_kraken_pair(pair);
                    let Some(candle) = parse_ohlc_item(item) else {
                        continue;
                    };
                    let _ = self.event_tx.send(WsEvent::Ohlc { symbol, candle }).await;
                }
            }
            _ => {}
        }
        Ok(())
    }
}

fn parse_ohlc_item(item: &Value) -> Option<Candle> {
    let ts = item
        .get("interval_begin")
        .and_then(Value::as_str)
        .and_then(parse_utc_lossy)?;
    Some(Candle {
        timestamp: ts,
        open: item.get("open").and_then(Value::as_f64)?,
        high: item.get("high").and_then(Value::as_f64)?,
        low: item.get("low").and_then(Value::as_f64)?,
        close: item.get("close").and_then(Value::as_f64)?,
        volume: item.get("volume").and_then(Value::as_f64).unwrap_or(0.0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ohlc_item_parses_ws_v2_shape() {
        let item = json!({
            "symbol": "XBT/USD",
            "interval_begin": "2025-06-01T12:00:00.000000Z",
            "open": 50000.0, "high": 50100.0, "low": 49900.0,
            "close": 50050.0, "volume": 12.5,
        });
        let candle = parse_ohlc_item(&item).unwrap();
        assert_eq!(candle.close, 50050.0);
        assert_eq!(candle.volume, 12.5);
    }

    #[test]
    fn malformed_items_are_skipped() {
        assert!(parse_ohlc_item(&json!({"symbol": "XBT/USD"})).is_none());
    }
}
