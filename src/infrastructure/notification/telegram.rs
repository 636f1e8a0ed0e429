//! Telegram notification sink: proactive out-of-band alerts.
//!
//! Every emitter is gated by a configuration flag (high-frequency ones
//! default off), messages are truncated to the Bot API maximum, and
//! delivery failures log but never raise: a down chat must not take the
//! engine down with it.

use reqwest_middleware::ClientWithMiddleware;
use serde_json::json;
use tracing::{debug, error};

use crate::application::trading::TradeResult;
use crate::config::TelegramConfig;
use crate::infrastructure::core::http_client_factory::HttpClientFactory;

/// Telegram's sendMessage limit.
const MAX_MESSAGE_LEN: usize = 4096;

#[derive(Clone)]
pub struct Notifier {
    config: TelegramConfig,
    client: ClientWithMiddleware,
}

impl Notifier {
    pub fn new(config: TelegramConfig) -> Self {
        Self {
            config,
            client: HttpClientFactory::create_client(),
        }
    }

    pub async fn send(&self, text: &str) {
        if !self.config.enabled
            || self.config.bot_token.is_empty()
            || self.config.chat_id.is_empty()
        {
            debug!("notifier skipped (disabled or unconfigured)");
            return;
        }
        let truncated: String = text.chars().take(MAX_MESSAGE_LEN).collect();
        let url = format!(
            "{}/bot{}/sendMessage",
            self.config.api_url.trim_end_matches('/'),
            self.config.bot_token
        );
        let result = self
            .client
            .post(&url)
            .json(&json!({"chat_id": self.config.chat_id, "text": truncated}))
            .send()
            .await;
        match result {
            Ok(response) if !response.status().is_success() => {
                error!(status = %response.status(), "notification send rejected");
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "notification send failed"),
        }
    }

    pub async fn trade_executed(&self, trade: &TradeResult) {
        if !self.config.notifications.trade_executed {
            return;
        }
        let mut lines = vec![
            format!("Trade: {} {}", trade.action, trade.symbol),
            format!("Qty: {:.6} @ ${:.2}", trade.qty, trade.price),
            format!("Fee: ${:.4}", trade.fee),
            format!("Intent: {}", trade.intent),
        ];
        if let Some(pnl) = trade.pnl {
            lines.push(format!(
                "P&L: ${:+.2} ({:+.1}%)",
                pnl,
                trade.pnl_pct.unwrap_or(0.0) * 100.0
            ));
        }
        self.send(&lines.join("\n")).await;
    }

    pub async fn stop_triggered(&self, symbol: &str, reason: &str, price: f64) {
        if !self.config.notifications.stop_triggered {
            return;
        }
        self.send(&format!(
            "Stop Triggered: {symbol}\nReason: {reason}\nPrice: ${price:.2}"
        ))
        .await;
    }

    pub async fn signal_rejected(&self, symbol: &str, action: &str, reason: &str) {
        if !self.config.notifications.signal_rejected {
            return;
        }
        self.send(&format!("Signal rejected: {action} {symbol}\nReason: {reason}"))
            .await;
    }

    pub async fn risk_halt(&self, reason: &str) {
        if !self.config.notifications.risk_halt {
            return;
        }
        self.send(&format!("TRADING HALTED\nReason: {reason}")).await;
    }

    pub async fn rollback_alert(&self, reason: &str, version: &str) {
        if !self.config.notifications.risk_halt {
            return;
        }
        self.send(&format!(
            "ROLLBACK TRIGGERED\nReason: {reason}\nActive version: {version}"
        ))
        .await;
    }

    pub async fn strategy_deployed(&self, version: &str, description: &str) {
        if !self.config.notifications.strategy_deployed {
            return;
        }
        let description: String = description.chars().take(500).collect();
        self.send(&format!("Strategy Deployed: {version}\n{description}"))
            .await;
    }

    pub async fn candidate_created(&self, slot: u32, version: &str, eval_days: Option<i64>) {
        if !self.config.notifications.candidate_created {
            return;
        }
        let eval = eval_days
            .map(|d| format!("{d}d"))
            .unwrap_or_else(|| "indefinite".to_string());
        self.send(&format!(
            "Candidate Created: slot {slot}\nVersion: {version}\nEvaluation: {eval}"
        ))
        .await;
    }

    pub async fn candidate_canceled(&self, slot: u32, reason: &str) {
        if !self.config.notifications.candidate_canceled {
            return;
        }
        self.send(&format!("Candidate Canceled: slot {slot}\nReason: {reason}"))
            .await;
    }

    pub async fn candidate_promoted(&self, slot: u32, version: &str) {
        if !self.config.notifications.candidate_promoted {
            return;
        }
        self.send(&format!(
            "Candidate Promoted: slot {slot} is now the active strategy\nVersion: {version}"
        ))
        .await;
    }

    pub async fn candidate_trade_executed(&self, slot: u32, summary: &str) {
        if !self.config.notifications.candidate_trade_executed {
            return;
        }
        self.send(&format!("Candidate {slot} trade: {summary}")).await;
    }

    pub async fn system_online(&self, portfolio_value: f64, positions: usize) {
        if !self.config.notifications.system_online {
            return;
        }
        self.send(&format!(
            "System Online\nPortfolio: ${portfolio_value:.2}\nPositions: {positions}"
        ))
        .await;
    }

    pub async fn system_error(&self, error: &str) {
        if !self.config.notifications.system_error {
            return;
        }
        let error: String = error.chars().take(500).collect();
        self.send(&format!("System Error: {error}")).await;
    }

    pub async fn websocket_failed(&self) {
        if !self.config.notifications.websocket_feed_lost {
            return;
        }
        self.send(
            "WARNING: WebSocket permanently disconnected after max retries.\n\
             Live price feed is down. Position monitor using REST fallback.",
        )
        .await;
    }

    pub async fn orchestrator_cycle_started(&self) {
        if !self.config.notifications.orchestrator_cycle_started {
            return;
        }
        self.send("Orchestrator: nightly cycle started").await;
    }

    pub async fn orchestrator_cycle_completed(&self, decision: &str) {
        if !self.config.notifications.orchestrator_cycle_completed {
            return;
        }
        self.send(&format!("Orchestrator cycle complete: {decision}"))
            .await;
    }

    pub async fn daily_summary(&self, summary: &str) {
        if !self.config.notifications.daily_summary {
            return;
        }
        self.send(summary).await;
    }

    pub async fn weekly_report(&self, report: &str) {
        if !self.config.notifications.weekly_report {
            return;
        }
        self.send(report).await;
    }
}
