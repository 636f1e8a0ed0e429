use thiserror::Error;

/// Invalid or missing configuration. Fatal at startup; carries the full
/// list of violations so the operator sees everything at once.
#[derive(Debug, Error)]
#[error("config validation failed:\n  {}", violations.join("\n  "))]
pub struct ConfigError {
    pub violations: Vec<String>,
}

#[derive(Debug, Error)]
pub enum ExchangeError {
    /// Network hiccups, rate limits, 5xx. Retried inside the client.
    #[error("transient exchange error: {0}")]
    Transient(String),
    /// Auth failures, rejected orders. Surfaced to the caller.
    #[error("exchange error: {0}")]
    Permanent(String),
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("daily token limit reached ({used}/{limit})")]
    BudgetExhausted { used: u64, limit: u64 },
    #[error("llm request failed: {0}")]
    Transient(String),
    #[error("llm request failed: {0}")]
    Permanent(String),
}

#[derive(Debug, Error)]
#[error("strategy load failed: {0}")]
pub struct StrategyLoadError(pub String);

/// Raised by the read-only store facade when a statement would write.
/// The offending fragment is truncated to 80 chars.
#[derive(Debug, Error)]
#[error("invalid query (write blocked in read-only mode): {fragment}")]
pub struct InvalidQuery {
    pub fragment: String,
}

impl InvalidQuery {
    pub fn new(fragment: &str) -> Self {
        Self {
            fragment: fragment.chars().take(80).collect(),
        }
    }
}
