//! Analysis module execution.
//!
//! Analysis code runs in a worker process with no store handle of its own.
//! Instead the worker sends query messages over the line protocol and the
//! shell answers them through the read-only facade, so every statement the
//! module runs is write-checked on this side of the boundary. The run ends
//! when the worker reports its result dict, bounded by a wall-clock
//! timeout.

use anyhow::{bail, Context, Result};
use serde_json::{json, Value};
use std::path::Path;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

use crate::application::strategy::worker::WorkerProcess;
use crate::config::WorkerConfig;
use crate::infrastructure::persistence::ReadOnlyStore;

/// Spawn the module at `script_path` and drive the analyze exchange to
/// completion. Returns the module's report dict.
pub async fn run_analysis_module(
    script_path: &Path,
    config: &WorkerConfig,
    ro: &ReadOnlyStore,
    timeout: Duration,
) -> Result<Value> {
    let mut worker = WorkerProcess::spawn(config, script_path).await?;
    let outcome = drive(&mut worker, ro, timeout).await;
    worker.shutdown().await;
    outcome
}

async fn drive(worker: &mut WorkerProcess, ro: &ReadOnlyStore, timeout: Duration) -> Result<Value> {
    let deadline = Instant::now() + timeout;
    worker
        .send(&json!({"op": "analyze", "schema": ro.schema()}))
        .await?;

    loop {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .unwrap_or(Duration::ZERO);
        if remaining.is_zero() {
            worker.kill().await;
            bail!("analysis module timed out (>{}s)", timeout.as_secs());
        }

        let Some(message) = worker.read_message(remaining).await? else {
            bail!("analysis module exited without a result");
        };

        if let Some(query) = message.get("query") {
            let reply = answer_query(ro, query).await;
            worker.send(&reply).await?;
            continue;
        }

        if message.get("ok").and_then(Value::as_bool) == Some(false) {
            let error = message
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            bail!("analysis module failed: {error}");
        }
        if message.get("ok").and_then(Value::as_bool) == Some(true) {
            let result = message
                .get("result")
                .cloned()
                .context("analysis result missing")?;
            if !result.is_object() {
                bail!("analysis module must return a dict");
            }
            return Ok(result);
        }

        warn!("analysis module sent an unrecognized message; ignoring");
    }
}

/// Answer one worker query through the read-only facade. Rejections come
/// back as error replies rather than killing the run, matching how the
/// facade raises into module code.
async fn answer_query(ro: &ReadOnlyStore, query: &Value) -> Value {
    let kind = query.get("kind").and_then(Value::as_str).unwrap_or("");
    let sql = query.get("sql").and_then(Value::as_str).unwrap_or("");
    let params: Vec<Value> = query
        .get("params")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    match kind {
        "fetch_one" => match ro.fetch_one(sql, &params).await {
            Ok(Some(row)) => json!({"row": row}),
            Ok(None) => json!({"row": null}),
            Err(e) => json!({"error": e.to_string()}),
        },
        "fetch_all" => match ro.fetch_all(sql, &params).await {
            Ok(rows) => json!({"rows": rows}),
            Err(e) => json!({"error": e.to_string()}),
        },
        "exec" => match ro.exec(sql, &params).await {
            Ok(n) => json!({"rows_affected": n}),
            Err(e) => json!({"error": e.to_string()}),
        },
        other => json!({"error": format!("unknown query kind: {other}")}),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::persistence::Store;

    fn worker_config(script: &str) -> WorkerConfig {
        WorkerConfig {
            command: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            call_timeout_secs: 5,
            ..WorkerConfig::default()
        }
    }

    #[tokio::test]
    async fn module_queries_then_reports() {
        let store = Store::connect_memory().await.unwrap();
        let ro = ReadOnlyStore::new(store);
        // Reads the analyze request, issues one query, echoes a result
        let script = r#"
            read -r _request
            echo '{"query":{"kind":"fetch_one","sql":"SELECT COUNT(*) as c FROM trades","params":[]}}'
            read -r _rows
            echo '{"ok":true,"result":{"trades":0}}'
        "#;
        let config = worker_config(script);
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let result = run_analysis_module(tmp.path(), &config, &ro, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result["trades"], json!(0));
    }

    #[tokio::test]
    async fn write_query_is_refused_but_run_continues() {
        let store = Store::connect_memory().await.unwrap();
        let ro = ReadOnlyStore::new(store.clone());
        let script = r#"
            read -r _request
            echo '{"query":{"kind":"exec","sql":"DELETE FROM trades","params":[]}}'
            read -r reply
            case "$reply" in
              *error*) echo '{"ok":true,"result":{"blocked":true}}';;
              *) echo '{"ok":true,"result":{"blocked":false}}';;
            esac
        "#;
        let config = worker_config(script);
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let result = run_analysis_module(tmp.path(), &config, &ro, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result["blocked"], json!(true));
    }

    #[tokio::test]
    async fn hung_module_hits_the_wall_clock() {
        let store = Store::connect_memory().await.unwrap();
        let ro = ReadOnlyStore::new(store);
        let config = worker_config("read -r _request; sleep 30");
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let err = run_analysis_module(tmp.path(), &config, &ro, Duration::from_millis(300))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"), "{err}");
    }
}
