//! Kraken REST client.
//!
//! Public endpoints for OHLC and ticker; private endpoints for balance,
//! orders, and the fee schedule. Private calls are signed: SHA-256 over
//! `nonce || form_body`, HMAC-SHA-512 over `urlpath || digest` with the
//! base64-decoded secret, base64-encoded into the API-Sign header. The
//! nonce is milliseconds since epoch, monotonically increasing.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use reqwest_middleware::ClientWithMiddleware;
use serde_json::Value;
use sha2::{Digest, Sha256, Sha512};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::KrakenConfig;
use crate::domain::errors::ExchangeError;
use crate::domain::market::{Candle, CandleSeries};
use crate::domain::ports::{ExchangeExecution, OrderFill};
use crate::infrastructure::core::http_client_factory::{form_encode, HttpClientFactory};

use super::pairs::to_kraken_pair;

#[derive(Debug, Clone)]
pub struct Ticker {
    pub last: f64,
    pub ask: f64,
    pub bid: f64,
    pub volume_24h: f64,
}

pub struct KrakenRest {
    config: KrakenConfig,
    client: ClientWithMiddleware,
    last_nonce: AtomicU64,
}

impl KrakenRest {
    pub fn new(config: KrakenConfig) -> Self {
        Self {
            config,
            client: HttpClientFactory::create_client(),
            last_nonce: AtomicU64::new(0),
        }
    }

    /// Milliseconds since epoch, bumped past the previous value so nonces
    /// never repeat even within one millisecond.
    fn next_nonce(&self) -> u64 {
        let now = Utc::now().timestamp_millis() as u64;
        let mut prev = self.last_nonce.load(Ordering::SeqCst);
        loop {
            let next = now.max(prev + 1);
            match self
                .last_nonce
                .compare_exchange(prev, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }

    fn sign(&self, urlpath: &str, nonce: &str, postdata: &str) -> Result<String, ExchangeError> {
        let secret = BASE64
            .decode(&self.config.secret_key)
            .map_err(|e| ExchangeError::Permanent(format!("invalid API secret: {e}")))?;

        let mut sha = Sha256::new();
        sha.update(nonce.as_bytes());
        sha.update(postdata.as_bytes());
        let digest = sha.finalize();

        let mut mac = Hmac::<Sha512>::new_from_slice(&secret)
            .map_err(|e| ExchangeError::Permanent(format!("invalid API secret length: {e}")))?;
        mac.update(urlpath.as_bytes());
        mac.update(&digest);
        Ok(BASE64.encode(mac.finalize().into_bytes()))
    }

    async fn public(&self, endpoint: &str, params: &[(&str, String)]) -> Result<Value, ExchangeError> {
        let mut url = format!("{}/0/public/{}", self.config.rest_url, endpoint);
        if !params.is_empty() {
            url.push('?');
            url.push_str(&form_encode(
                &params.iter().map(|(k, v)| (*k, v.as_str())).collect::<Vec<_>>(),
            ));
        }
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ExchangeError::Transient(e.to_string()))?;
        Self::parse_response(response).await
    }

    async fn private(&self, endpoint: &str, params: &[(&str, String)]) -> Result<Value, ExchangeError> {
        let urlpath = format!("/0/private/{endpoint}");
        let url = format!("{}{}", self.config.rest_url, urlpath);
        let nonce = self.next_nonce().to_string();

        let mut form: Vec<(&str, &str)> = vec![("nonce", nonce.as_str())];
        for (k, v) in params {
            form.push((k, v.as_str()));
        }
        let postdata = form_encode(&form);
        let signature = self.sign(&urlpath, &nonce, &postdata)?;

        let response = self
            .client
            .post(&url)
            .header("API-Key", &self.config.api_key)
            .header("API-Sign", signature)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(postdata)
            .send()
            .await
            .map_err(|e| ExchangeError::Transient(e.to_string()))?;
        Self::parse_response(response).await
    }

    async fn parse_response(response: reqwest::Response) -> Result<Value, ExchangeError> {
        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|e| ExchangeError::Transient(format!("malformed response: {e}")))?;
        if status.is_server_error() {
            return Err(ExchangeError::Transient(format!("server error {status}")));
        }

        let errors = body
            .get("error")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        if !errors.is_empty() {
            let joined = errors
                .iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join("; ");
            // Kraken error classes: EGeneral:Temporary, EAPI:Rate limit, EService:*
            let transient = joined.contains("Rate limit")
                || joined.contains("Unavailable")
                || joined.contains("Busy")
                || joined.contains("Temporary");
            return if transient {
                Err(ExchangeError::Transient(joined))
            } else {
                Err(ExchangeError::Permanent(joined))
            };
        }
        body.get("result")
            .cloned()
            .ok_or_else(|| ExchangeError::Permanent("response missing result".to_string()))
    }

    /// OHLC candles for a symbol. `interval` is in minutes (5, 60, 1440).
    pub async fn get_ohlc(
        &self,
        symbol: &str,
        interval: u32,
        since: Option<i64>,
    ) -> Result<CandleSeries, ExchangeError> {
        let pair = to_kraken_pair(symbol);
        let mut params = vec![("pair", pair), ("interval", interval.to_string())];
        if let Some(since) = since {
            params.push(("since", since.to_string()));
        }
        let result = self.public("OHLC", &params).await?;

        let rows = result
            .as_object()
            .and_then(|map| {
                map.iter()
                    .find(|(key, _)| key.as_str() != "last")
                    .map(|(_, v)| v.clone())
            })
            .and_then(|v| v.as_array().cloned())
            .unwrap_or_default();

        let candles = rows
            .iter()
            .filter_map(|row| {
                let fields = row.as_array()?;
                Some(Candle {
                    timestamp: parse_unix(fields.first()?)?,
                    open: parse_num(fields.get(1)?)?,
                    high: parse_num(fields.get(2)?)?,
                    low: parse_num(fields.get(3)?)?,
                    close: parse_num(fields.get(4)?)?,
                    volume: parse_num(fields.get(6)?)?,
                })
            })
            .collect();
        Ok(CandleSeries::new(candles))
    }

    pub async fn get_ticker(&self, symbol: &str) -> Result<Ticker, ExchangeError> {
        let pair = to_kraken_pair(symbol);
        let result = self.public("Ticker", &[("pair", pair)]).await?;
        let entry = result
            .as_object()
            .and_then(|map| map.values().next())
            .ok_or_else(|| ExchangeError::Permanent(format!("empty ticker for {symbol}")))?;

        let field = |key: &str, idx: usize| -> f64 {
            entry
                .get(key)
                .and_then(|v| v.get(idx))
                .and_then(parse_num)
                .unwrap_or(0.0)
        };
        Ok(Ticker {
            last: field("c", 0),
            ask: field("a", 0),
            bid: field("b", 0),
            volume_24h: field("v", 1),
        })
    }

    /// Current bid-ask spread as a fraction of the bid.
    pub async fn get_spread(&self, symbol: &str) -> Result<f64, ExchangeError> {
        let ticker = self.get_ticker(symbol).await?;
        if ticker.bid <= 0.0 {
            return Ok(0.0);
        }
        Ok((ticker.ask - ticker.bid) / ticker.bid)
    }

    /// Maker/taker fee percentages for a pair from the account's volume
    /// tier.
    pub async fn get_fee_schedule(&self, symbol: &str) -> Result<(f64, f64), ExchangeError> {
        let pair = to_kraken_pair(symbol);
        let result = self.private("TradeVolume", &[("pair", pair)]).await?;

        let mut maker = self.config.maker_fee_pct;
        let mut taker = self.config.taker_fee_pct;
        if let Some(fees) = result.get("fees").and_then(Value::as_object) {
            if let Some(entry) = fees.values().next() {
                if let Some(fee) = entry.get("fee").and_then(parse_num) {
                    taker = fee;
                }
            }
        }
        if let Some(fees) = result.get("fees_maker").and_then(Value::as_object) {
            if let Some(entry) = fees.values().next() {
                if let Some(fee) = entry.get("fee").and_then(parse_num) {
                    maker = fee;
                }
            }
        }
        Ok((maker, taker))
    }

    pub async fn get_open_orders(&self) -> Result<Value, ExchangeError> {
        self.private("OpenOrders", &[]).await
    }
}

#[async_trait]
impl ExchangeExecution for KrakenRest {
    async fn place_order(
        &self,
        symbol: &str,
        side: &str,
        order_type: &str,
        volume: f64,
        price: Option<f64>,
    ) -> Result<String, ExchangeError> {
        let pair = to_kraken_pair(symbol);
        let mut params = vec![
            ("pair", pair),
            ("type", side.to_string()),
            ("ordertype", order_type.to_string()),
            ("volume", format!("{volume}")),
        ];
        if let Some(price) = price {
            params.push(("price", format!("{price}")));
        }
        let result = self.private("AddOrder", &params).await?;
        result
            .get("txid")
            .and_then(|v| v.get(0))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ExchangeError::Permanent("order response missing txid".to_string()))
    }

    async fn query_order(&self, txid: &str) -> Result<OrderFill, ExchangeError> {
        let result = self
            .private("QueryOrders", &[("txid", txid.to_string())])
            .await?;
        let order = result
            .get(txid)
            .ok_or_else(|| ExchangeError::Permanent(format!("unknown order {txid}")))?;

        let status = order
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or("pending");
        let status = match status {
            "closed" => "filled",
            "canceled" => "canceled",
            "expired" => "expired",
            _ => "pending",
        };
        Ok(OrderFill {
            txid: txid.to_string(),
            status: status.to_string(),
            filled_volume: order.get("vol_exec").and_then(parse_num).unwrap_or(0.0),
            avg_fill_price: order.get("price").and_then(parse_num).unwrap_or(0.0),
            fee: order.get("fee").and_then(parse_num).unwrap_or(0.0),
        })
    }

    async fn cancel_order(&self, txid: &str) -> Result<(), ExchangeError> {
        self.private("CancelOrder", &[("txid", txid.to_string())])
            .await
            .map(|_| ())
    }

    async fn cancel_all_orders(&self) -> Result<(), ExchangeError> {
        self.private("CancelAll", &[]).await.map(|_| ())
    }

    async fn get_balance(&self) -> Result<HashMap<String, f64>, ExchangeError> {
        let result = self.private("Balance", &[]).await?;
        Ok(result
            .as_object()
            .map(|map| {
                map.iter()
                    .filter_map(|(k, v)| Some((k.clone(), parse_num(v)?)))
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// Kraken mixes numeric strings and numbers freely.
fn parse_num(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn parse_unix(value: &Value) -> Option<DateTime<Utc>> {
    let seconds = parse_num(value)? as i64;
    Utc.timestamp_opt(seconds, 0).single()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_num_handles_strings_and_numbers() {
        assert_eq!(parse_num(&json!("50000.5")), Some(50000.5));
        assert_eq!(parse_num(&json!(42)), Some(42.0));
        assert_eq!(parse_num(&json!(null)), None);
        assert_eq!(parse_num(&json!("garbage")), None);
    }

    #[test]
    fn signature_matches_known_vector() {
        // Kraken's published example: path + nonce + payload + secret
        let config = KrakenConfig {
            secret_key: "kQH5HW/8p1uGOVjbgWA7FunAmGO8lsSUXNsu3eow76sz84Q18fWxnyRzBHCd3pd5nE9qa99HAZtuZuj6F1huXg==".to_string(),
            ..KrakenConfig::default()
        };
        let kraken = KrakenRest::new(config);
        let postdata = "nonce=1616492376594&ordertype=limit&pair=XBTUSD&price=37500&type=buy&volume=1.25";
        let signature = kraken
            .sign("/0/private/AddOrder", "1616492376594", postdata)
            .unwrap();
        assert_eq!(
            signature,
            "4/dpxb3iT4tp/ZCVEwSnEsLxx0bqyhLpdfOpc6fn7OR8+UClSV5n9E6aSS8MPtnRfp32bAb0nmbRn6H8ndwLUQ=="
        );
    }

    #[test]
    fn nonce_is_monotonic() {
        let kraken = KrakenRest::new(KrakenConfig::default());
        let a = kraken.next_nonce();
        let b = kraken.next_nonce();
        assert!(b > a);
    }
}
