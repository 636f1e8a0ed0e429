//! Out-of-process strategy execution.
//!
//! Generated strategy code never runs inside this process. It is
//! materialized to a throwaway file and executed by the configured worker
//! command; the shell speaks a line-delimited JSON request/response protocol
//! over the worker's stdin/stdout. Every call carries a timeout, and a
//! timeout kills the worker: fault containment mirrors the scan loop's
//! expectations, not the worker's goodwill.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, warn};

use crate::config::WorkerConfig;
use crate::domain::contract::{
    Action, Intent, PortfolioView, RiskLimits, Signal, Strategy, SymbolData,
};

pub struct WorkerProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    call_timeout: Duration,
}

impl WorkerProcess {
    /// Spawn the worker command with the script path appended as its final
    /// argument.
    pub async fn spawn(config: &WorkerConfig, script_path: &Path) -> Result<Self> {
        let (program, args) = config
            .command
            .split_first()
            .context("worker command is empty")?;
        let mut child = Command::new(program)
            .args(args)
            .arg(script_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn worker: {program}"))?;

        let stdin = child.stdin.take().context("worker stdin unavailable")?;
        let stdout = child.stdout.take().context("worker stdout unavailable")?;
        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
            call_timeout: Duration::from_secs(config.call_timeout_secs),
        })
    }

    /// One request/response round trip. A timeout or malformed reply kills
    /// the worker and surfaces as an error.
    pub async fn call(&mut self, request: &Value) -> Result<Value> {
        self.call_with_timeout(request, self.call_timeout).await
    }

    pub async fn call_with_timeout(&mut self, request: &Value, timeout: Duration) -> Result<Value> {
        let mut line = serde_json::to_string(request)?;
        line.push('\n');
        self.stdin
            .write_all(line.as_bytes())
            .await
            .context("worker stdin write failed")?;
        self.stdin.flush().await.ok();

        let mut response = String::new();
        let read = tokio::time::timeout(timeout, self.stdout.read_line(&mut response)).await;
        match read {
            Err(_) => {
                self.kill().await;
                bail!("worker call timed out after {:?}", timeout);
            }
            Ok(Err(e)) => {
                self.kill().await;
                bail!("worker stdout read failed: {e}");
            }
            Ok(Ok(0)) => {
                let stderr = self.drain_stderr().await;
                bail!("worker exited before responding: {stderr}");
            }
            Ok(Ok(_)) => {}
        }

        let parsed: Value = serde_json::from_str(response.trim())
            .with_context(|| format!("worker sent malformed JSON: {}", truncate(&response, 120)))?;
        if parsed.get("ok").and_then(Value::as_bool) == Some(false) {
            let error = parsed
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown worker error");
            bail!("worker error: {error}");
        }
        Ok(parsed)
    }

    /// Read a line the worker initiated (used by the analysis query
    /// protocol). Returns None on EOF.
    pub async fn read_message(&mut self, timeout: Duration) -> Result<Option<Value>> {
        let mut line = String::new();
        match tokio::time::timeout(timeout, self.stdout.read_line(&mut line)).await {
            Err(_) => {
                self.kill().await;
                bail!("worker read timed out after {:?}", timeout);
            }
            Ok(Err(e)) => bail!("worker stdout read failed: {e}"),
            Ok(Ok(0)) => Ok(None),
            Ok(Ok(_)) => Ok(Some(serde_json::from_str(line.trim()).with_context(
                || format!("worker sent malformed JSON: {}", truncate(&line, 120)),
            )?)),
        }
    }

    pub async fn send(&mut self, message: &Value) -> Result<()> {
        let mut line = serde_json::to_string(message)?;
        line.push('\n');
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.flush().await.ok();
        Ok(())
    }

    async fn drain_stderr(&mut self) -> String {
        use tokio::io::AsyncReadExt;
        let Some(mut stderr) = self.child.stderr.take() else {
            return String::new();
        };
        let mut buf = String::new();
        let _ = tokio::time::timeout(Duration::from_millis(500), stderr.read_to_string(&mut buf))
            .await;
        truncate(buf.trim(), 400).to_string()
    }

    pub async fn kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            debug!(error = %e, "worker kill failed (already gone?)");
        }
    }

    /// Polite shutdown: send the op, give it a moment, then kill.
    pub async fn shutdown(mut self) {
        let _ = self.send(&json!({"op": "shutdown"})).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        self.kill().await;
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// `Strategy` implementation backed by a worker process. The temp file
/// holding the code lives as long as the strategy does.
pub struct WorkerStrategy {
    worker: WorkerProcess,
    _script: NamedTempFile,
    scan_interval: u64,
    regime: Option<String>,
}

impl WorkerStrategy {
    /// Materialize `code` and spawn its worker. The code must already have
    /// passed the sandbox.
    pub async fn from_code(code: &str, config: &WorkerConfig) -> Result<Self> {
        let script = NamedTempFile::new().context("failed to create worker script file")?;
        std::fs::write(script.path(), code).context("failed to write worker script")?;
        let worker = WorkerProcess::spawn(config, script.path()).await?;
        Ok(Self {
            worker,
            _script: script,
            scan_interval: 5,
            regime: None,
        })
    }

    pub async fn stop(self) {
        self.worker.shutdown().await;
    }
}

#[async_trait]
impl Strategy for WorkerStrategy {
    async fn initialize(&mut self, risk_limits: &RiskLimits, symbols: &[String]) -> Result<()> {
        let response = self
            .worker
            .call(&json!({
                "op": "initialize",
                "risk_limits": risk_limits,
                "symbols": symbols,
            }))
            .await?;
        if let Some(interval) = response.get("scan_interval_minutes").and_then(Value::as_u64) {
            if interval >= 1 {
                self.scan_interval = interval;
            }
        }
        Ok(())
    }

    async fn analyze(
        &mut self,
        markets: &HashMap<String, SymbolData>,
        portfolio: &PortfolioView,
        timestamp: DateTime<Utc>,
    ) -> Result<Vec<Signal>> {
        let response = self
            .worker
            .call(&json!({
                "op": "analyze",
                "markets": markets,
                "portfolio": portfolio,
                "timestamp": timestamp.to_rfc3339(),
            }))
            .await?;
        self.regime = response
            .get("regime")
            .and_then(Value::as_str)
            .map(str::to_string);
        let result = response.get("result").cloned().unwrap_or(json!([]));
        let signals: Vec<Signal> = serde_json::from_value(result)
            .context("worker returned signals that do not match the contract")?;
        Ok(signals)
    }

    async fn on_fill(
        &mut self,
        symbol: &str,
        action: Action,
        qty: f64,
        price: f64,
        intent: Intent,
        tag: &str,
    ) -> Result<()> {
        self.worker
            .call(&json!({
                "op": "on_fill",
                "symbol": symbol,
                "action": action,
                "qty": qty,
                "price": price,
                "intent": intent,
                "tag": tag,
            }))
            .await
            .map(|_| ())
    }

    async fn on_position_closed(
        &mut self,
        symbol: &str,
        pnl: f64,
        pnl_pct: f64,
        tag: &str,
    ) -> Result<()> {
        self.worker
            .call(&json!({
                "op": "on_position_closed",
                "symbol": symbol,
                "pnl": pnl,
                "pnl_pct": pnl_pct,
                "tag": tag,
            }))
            .await
            .map(|_| ())
    }

    async fn get_state(&mut self) -> Result<Value> {
        let response = self.worker.call(&json!({"op": "get_state"})).await?;
        Ok(response.get("result").cloned().unwrap_or(json!({})))
    }

    async fn load_state(&mut self, state: Value) -> Result<()> {
        self.worker
            .call(&json!({"op": "load_state", "state": state}))
            .await
            .map(|_| ())
            .or_else(|e| {
                // A state blob from an older version may not load; that is
                // a warning, not a startup failure.
                warn!(error = %e, "worker rejected persisted state");
                Ok(())
            })
    }

    fn scan_interval_minutes(&self) -> u64 {
        self.scan_interval
    }

    fn regime(&self) -> Option<String> {
        self.regime.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A fake worker: answers every request line with a canned response.
    fn echo_worker_config(canned: &str) -> WorkerConfig {
        WorkerConfig {
            command: vec![
                "sh".to_string(),
                "-c".to_string(),
                format!("while read -r line; do echo '{canned}'; done"),
            ],
            call_timeout_secs: 5,
            ..WorkerConfig::default()
        }
    }

    #[tokio::test]
    async fn round_trip_with_fake_worker() {
        let config = echo_worker_config(r#"{"ok":true,"result":[]}"#);
        let mut strategy = WorkerStrategy::from_code("ignored", &config).await.unwrap();
        strategy
            .initialize(&crate::config::Config::default().risk_limits(), &[])
            .await
            .unwrap();
        let signals = strategy
            .analyze(
                &HashMap::new(),
                &PortfolioView {
                    cash: 0.0,
                    total_value: 0.0,
                    positions: vec![],
                    recent_trades: vec![],
                    daily_pnl: 0.0,
                    total_pnl: 0.0,
                    fees_today: 0.0,
                },
                Utc::now(),
            )
            .await
            .unwrap();
        assert!(signals.is_empty());
        strategy.stop().await;
    }

    #[tokio::test]
    async fn worker_error_response_surfaces() {
        let config = echo_worker_config(r#"{"ok":false,"error":"boom"}"#);
        let mut strategy = WorkerStrategy::from_code("ignored", &config).await.unwrap();
        let err = strategy
            .initialize(&crate::config::Config::default().risk_limits(), &[])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("boom"));
        strategy.stop().await;
    }

    #[tokio::test]
    async fn dead_worker_reports_exit() {
        let config = WorkerConfig {
            command: vec!["sh".to_string(), "-c".to_string(), "exit 3".to_string()],
            call_timeout_secs: 5,
            ..WorkerConfig::default()
        };
        let mut strategy = WorkerStrategy::from_code("ignored", &config).await.unwrap();
        // Depending on timing this surfaces as a broken pipe or an
        // exited-before-responding error; either way it must not hang.
        assert!(strategy
            .initialize(&crate::config::Config::default().risk_limits(), &[])
            .await
            .is_err());
    }
}
