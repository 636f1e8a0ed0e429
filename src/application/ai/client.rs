//! AI client: the LLM provider treated as an oracle returning text.
//!
//! Wraps the Anthropic Messages API with transient-error retry (1/2/4s,
//! three attempts), a daily token budget seeded from the store across
//! restarts, and per-call cost accounting into `token_usage`.

use anyhow::Result;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{info, warn};

use crate::config::AiConfig;
use crate::domain::errors::LlmError;
use crate::infrastructure::core::http_client_factory::HttpClientFactory;
use crate::infrastructure::observability::Metrics;
use crate::infrastructure::persistence::{RowExt, Store};

/// Cost per million tokens: (input, output).
fn model_costs(model: &str) -> (f64, f64) {
    if model.contains("opus") {
        (15.0, 75.0)
    } else if model.contains("haiku") {
        (0.8, 4.0)
    } else {
        (3.0, 15.0)
    }
}

pub struct AiClient {
    config: AiConfig,
    store: Store,
    client: reqwest::Client,
    daily_tokens_used: AtomicU64,
    metrics: Option<Metrics>,
}

impl AiClient {
    pub fn new(config: AiConfig, store: Store, metrics: Option<Metrics>) -> Self {
        Self {
            config,
            store,
            client: HttpClientFactory::create_llm_client(),
            daily_tokens_used: AtomicU64::new(0),
            metrics,
        }
    }

    /// Seed the daily token counter from the store so the budget survives
    /// restarts.
    pub async fn initialize(&self) -> Result<()> {
        let row = self
            .store
            .fetch_one(
                "SELECT COALESCE(SUM(input_tokens + output_tokens), 0) as total \
                 FROM token_usage WHERE created_at >= date('now')",
                &[],
            )
            .await?;
        if let Some(row) = row {
            let used = row.i64("total").max(0) as u64;
            self.daily_tokens_used.store(used, Ordering::SeqCst);
            if used > 0 {
                info!(used_today = used, "ai token counter seeded");
            }
        }
        Ok(())
    }

    pub fn is_configured(&self) -> bool {
        !self.config.api_key.is_empty()
    }

    pub fn tokens_remaining(&self) -> u64 {
        self.config
            .daily_token_limit
            .saturating_sub(self.daily_tokens_used.load(Ordering::SeqCst))
    }

    pub fn reset_daily_tokens(&self) {
        self.daily_tokens_used.store(0, Ordering::SeqCst);
    }

    pub fn opus_model(&self) -> &str {
        &self.config.opus_model
    }

    pub fn sonnet_model(&self) -> &str {
        &self.config.sonnet_model
    }

    pub async fn ask_opus(
        &self,
        prompt: &str,
        system: &str,
        max_tokens: u32,
        purpose: &str,
    ) -> Result<String, LlmError> {
        self.ask(prompt, &self.config.opus_model.clone(), system, max_tokens, 0.3, purpose)
            .await
    }

    pub async fn ask_sonnet(
        &self,
        prompt: &str,
        system: &str,
        max_tokens: u32,
        purpose: &str,
    ) -> Result<String, LlmError> {
        self.ask(prompt, &self.config.sonnet_model.clone(), system, max_tokens, 0.3, purpose)
            .await
    }

    pub async fn ask(
        &self,
        prompt: &str,
        model: &str,
        system: &str,
        max_tokens: u32,
        temperature: f64,
        purpose: &str,
    ) -> Result<String, LlmError> {
        if !self.is_configured() {
            return Err(LlmError::Permanent("AI client not configured".to_string()));
        }
        let used = self.daily_tokens_used.load(Ordering::SeqCst);
        if used >= self.config.daily_token_limit {
            return Err(LlmError::BudgetExhausted {
                used,
                limit: self.config.daily_token_limit,
            });
        }

        let mut body = Map::new();
        body.insert("model".to_string(), json!(model));
        body.insert("max_tokens".to_string(), json!(max_tokens));
        body.insert("temperature".to_string(), json!(temperature));
        body.insert(
            "messages".to_string(),
            json!([{"role": "user", "content": prompt}]),
        );
        if !system.is_empty() {
            body.insert("system".to_string(), json!(system));
        }
        let body = Value::Object(body);

        // Retry transient classes with exponential backoff: 1s, 2s, 4s
        let mut last_error = String::new();
        for attempt in 0..3u32 {
            match self.call_once(&body).await {
                Ok(response) => return self.account(model, purpose, response).await,
                Err(LlmError::Transient(e)) => {
                    last_error = e.clone();
                    if attempt < 2 {
                        let wait = 2u64.pow(attempt);
                        warn!(attempt = attempt + 1, error = %e, wait, "ai call retrying");
                        tokio::time::sleep(std::time::Duration::from_secs(wait)).await;
                    }
                }
                Err(other) => return Err(other),
            }
        }
        Err(LlmError::Transient(last_error))
    }

    async fn call_once(&self, body: &Value) -> Result<Value, LlmError> {
        let response = self
            .client
            .post(&self.config.api_url)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| classify(&e.to_string()))?;

        let status = response.status();
        let payload: Value = response
            .json()
            .await
            .map_err(|e| LlmError::Transient(format!("malformed response: {e}")))?;

        if !status.is_success() {
            let message = payload
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("request failed")
                .to_string();
            let described = format!("{status}: {message}");
            return Err(classify(&described));
        }
        Ok(payload)
    }

    async fn account(
        &self,
        model: &str,
        purpose: &str,
        response: Value,
    ) -> Result<String, LlmError> {
        let text: String = response
            .get("content")
            .and_then(Value::as_array)
            .map(|blocks| {
                blocks
                    .iter()
                    .filter_map(|b| b.get("text").and_then(Value::as_str))
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        let input_tokens = response
            .pointer("/usage/input_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let output_tokens = response
            .pointer("/usage/output_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        self.daily_tokens_used
            .fetch_add(input_tokens + output_tokens, Ordering::SeqCst);

        let (input_cost, output_cost) = model_costs(model);
        let cost =
            (input_tokens as f64 * input_cost + output_tokens as f64 * output_cost) / 1_000_000.0;

        if let Err(e) = self
            .store
            .exec(
                "INSERT INTO token_usage (model, input_tokens, output_tokens, cost_usd, purpose) \
                 VALUES (?, ?, ?, ?, ?)",
                &[
                    json!(model),
                    json!(input_tokens),
                    json!(output_tokens),
                    json!(cost),
                    json!(purpose),
                ],
            )
            .await
        {
            warn!(error = %e, "token usage row insert failed");
        }
        if let Some(metrics) = &self.metrics {
            metrics
                .ai_tokens_total
                .with_label_values(&[model, "input"])
                .inc_by(input_tokens as f64);
            metrics
                .ai_tokens_total
                .with_label_values(&[model, "output"])
                .inc_by(output_tokens as f64);
        }

        info!(
            model,
            input_tokens,
            output_tokens,
            cost = format!("${cost:.4}"),
            purpose,
            "ai response"
        );
        Ok(text)
    }

    /// Today's usage summary for the orchestrator context.
    pub async fn daily_usage(&self) -> Result<Value> {
        let rows = self
            .store
            .fetch_all(
                "SELECT model, SUM(input_tokens) as input_total, SUM(output_tokens) as output_total, \
                        SUM(cost_usd) as cost_total, COUNT(*) as calls \
                 FROM token_usage WHERE created_at >= date('now') GROUP BY model",
                &[],
            )
            .await?;
        let mut models = Map::new();
        let mut total_cost = 0.0;
        for row in &rows {
            total_cost += row.f64("cost_total");
            models.insert(
                row.str_or("model", "?"),
                json!({
                    "input": row.i64("input_total"),
                    "output": row.i64("output_total"),
                    "cost": row.f64("cost_total"),
                    "calls": row.i64("calls"),
                }),
            );
        }
        Ok(json!({
            "models": models,
            "total_cost": total_cost,
            "daily_limit": self.config.daily_token_limit,
            "used": self.daily_tokens_used.load(Ordering::SeqCst),
        }))
    }
}

fn classify(error: &str) -> LlmError {
    let lower = error.to_lowercase();
    let transient = ["timeout", "rate", "429", "500", "502", "503", "529", "overloaded", "connection"]
        .iter()
        .any(|k| lower.contains(k));
    if transient {
        LlmError::Transient(error.to_string())
    } else {
        LlmError::Permanent(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(matches!(classify("429 Too Many Requests"), LlmError::Transient(_)));
        assert!(matches!(classify("connection reset"), LlmError::Transient(_)));
        assert!(matches!(classify("overloaded_error"), LlmError::Transient(_)));
        assert!(matches!(classify("401: invalid x-api-key"), LlmError::Permanent(_)));
    }

    #[test]
    fn model_cost_tiers() {
        assert_eq!(model_costs("claude-opus-4-6"), (15.0, 75.0));
        assert_eq!(model_costs("claude-sonnet-4-5"), (3.0, 15.0));
        assert_eq!(model_costs("something-else"), (3.0, 15.0));
    }

    #[tokio::test]
    async fn budget_gate_blocks_before_any_call() {
        let store = Store::connect_memory().await.unwrap();
        let config = AiConfig {
            api_key: "test-key".to_string(),
            daily_token_limit: 100,
            ..AiConfig::default()
        };
        let client = AiClient::new(config, store, None);
        client.daily_tokens_used.store(100, Ordering::SeqCst);
        let err = client
            .ask("hi", "claude-sonnet-4-5", "", 100, 0.0, "test")
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::BudgetExhausted { .. }));
        assert_eq!(client.tokens_remaining(), 0);
    }

    #[tokio::test]
    async fn unconfigured_client_fails_fast() {
        let store = Store::connect_memory().await.unwrap();
        let client = AiClient::new(AiConfig::default(), store, None);
        assert!(!client.is_configured());
        assert!(client.ask("hi", "m", "", 10, 0.0, "t").await.is_err());
    }
}
