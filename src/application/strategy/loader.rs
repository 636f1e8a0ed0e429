//! Strategy loading, deployment, and the restart fallback chain:
//! filesystem → latest store code → built-in baseline.

use anyhow::{Context, Result};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use tracing::{error, info, warn};

use crate::config::WorkerConfig;
use crate::domain::contract::Strategy;
use crate::infrastructure::persistence::{RowExt, Store};

use super::builtin::BaselineStrategy;
use super::sandbox::validate_strategy_static;
use super::worker::WorkerStrategy;

/// SHA-256 of the code, truncated like a short git hash.
pub fn code_hash(code: &str) -> String {
    let digest = Sha256::digest(code.as_bytes());
    hex::encode(digest)[..16].to_string()
}

/// Where the loaded strategy came from. `Builtin` means both external
/// sources failed and the baseline is holding the fort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSource {
    File,
    StoreFallback,
    Builtin,
}

pub struct LoadedStrategy {
    pub strategy: Box<dyn Strategy>,
    pub source: LoadSource,
    pub code_hash: Option<String>,
}

pub struct StrategyLoader {
    dir: PathBuf,
    worker: WorkerConfig,
}

impl StrategyLoader {
    pub fn new(dir: PathBuf, worker: WorkerConfig) -> Self {
        Self { dir, worker }
    }

    pub fn active_path(&self) -> PathBuf {
        self.dir.join("active").join("strategy.py")
    }

    fn archive_dir(&self) -> PathBuf {
        self.dir.join("archive")
    }

    pub fn active_code(&self) -> Option<String> {
        std::fs::read_to_string(self.active_path()).ok()
    }

    pub fn active_hash(&self) -> Option<String> {
        self.active_code().map(|code| code_hash(&code))
    }

    /// Write new code to the active slot, archiving the previous version
    /// first. Returns the new code hash.
    pub fn deploy(&self, code: &str, version: &str) -> Result<String> {
        let active = self.active_path();
        if let Ok(current) = std::fs::read_to_string(&active) {
            let archive = self.archive_dir();
            std::fs::create_dir_all(&archive)?;
            let dest = archive.join(format!("strategy_pre_{}_{}.py", version, code_hash(&current)));
            std::fs::write(dest, current)?;
        }

        std::fs::create_dir_all(active.parent().context("active path has no parent")?)?;
        std::fs::write(&active, code)?;
        let hash = code_hash(code);
        info!(%version, hash = %hash, "strategy deployed");
        Ok(hash)
    }

    /// Spawn a worker for `code` after a static re-check. Deployment-time
    /// validation already ran the full sandbox; this is the cheap guard
    /// against a tampered file.
    async fn load_from_code(&self, code: &str) -> Result<Box<dyn Strategy>> {
        let check = validate_strategy_static(code);
        if !check.passed {
            anyhow::bail!("strategy failed validation: {:?}", check.errors);
        }
        let strategy = WorkerStrategy::from_code(code, &self.worker).await?;
        Ok(Box::new(strategy))
    }

    /// Fallback chain: filesystem, then the newest deployed code in the
    /// store (rewritten to disk), then the built-in baseline. Never fails:
    /// the engine stays alive on the baseline and alerts instead.
    pub async fn load_with_fallback(&self, store: &Store) -> LoadedStrategy {
        match self.active_code() {
            Some(code) => match self.load_from_code(&code).await {
                Ok(strategy) => {
                    let hash = code_hash(&code);
                    info!(hash = %hash, "strategy loaded from file");
                    return LoadedStrategy {
                        strategy,
                        source: LoadSource::File,
                        code_hash: Some(hash),
                    };
                }
                Err(e) => warn!(error = %e, "filesystem strategy load failed"),
            },
            None => warn!(path = %self.active_path().display(), "no active strategy file"),
        }

        match self.load_from_store(store).await {
            Ok(Some((strategy, hash))) => {
                return LoadedStrategy {
                    strategy,
                    source: LoadSource::StoreFallback,
                    code_hash: Some(hash),
                }
            }
            Ok(None) => warn!("no deployable strategy code in store"),
            Err(e) => error!(error = %e, "store strategy fallback failed"),
        }

        error!("all strategy sources failed; running built-in baseline");
        LoadedStrategy {
            strategy: Box::new(BaselineStrategy::new()),
            source: LoadSource::Builtin,
            code_hash: None,
        }
    }

    async fn load_from_store(&self, store: &Store) -> Result<Option<(Box<dyn Strategy>, String)>> {
        let row = store
            .fetch_one(
                "SELECT code, version FROM strategy_versions \
                 WHERE code IS NOT NULL AND deployed_at IS NOT NULL \
                 ORDER BY deployed_at DESC LIMIT 1",
                &[],
            )
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let Some(code) = row.opt_str("code").filter(|c| !c.is_empty()) else {
            return Ok(None);
        };
        info!(
            version = %row.str_or("version", "?"),
            "recovering strategy from store"
        );
        let strategy = self.load_from_code(&code).await?;
        // Re-materialize so the next restart takes the fast path
        let _ = self.deploy(&code, &format!("recovered_{}", row.str_or("version", "unknown")));
        Ok(Some((strategy, code_hash(&code))))
    }

    /// Persist the strategy's opaque state blob.
    pub async fn save_state(&self, store: &Store, state: serde_json::Value) -> Result<()> {
        store
            .exec(
                "INSERT INTO strategy_state (state_json) VALUES (?)",
                &[json!(state.to_string())],
            )
            .await?;
        Ok(())
    }

    /// Most recently saved state blob, if any.
    pub async fn latest_state(&self, store: &Store) -> Result<Option<serde_json::Value>> {
        let row = store
            .fetch_one(
                "SELECT state_json FROM strategy_state ORDER BY saved_at DESC, id DESC LIMIT 1",
                &[],
            )
            .await?;
        Ok(row
            .and_then(|r| r.opt_str("state_json"))
            .and_then(|s| serde_json::from_str(&s).ok()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_hash_is_stable_and_short() {
        let h1 = code_hash("class Strategy: pass");
        let h2 = code_hash("class Strategy: pass");
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 16);
        assert_ne!(h1, code_hash("class Strategy: ..."));
    }

    #[tokio::test]
    async fn deploy_archives_previous_version() {
        let dir = tempfile::tempdir().unwrap();
        let loader = StrategyLoader::new(dir.path().to_path_buf(), WorkerConfig::default());

        loader.deploy("v1 code", "v1").unwrap();
        loader.deploy("v2 code", "v2").unwrap();

        assert_eq!(loader.active_code().unwrap(), "v2 code");
        let archived: Vec<_> = std::fs::read_dir(dir.path().join("archive"))
            .unwrap()
            .collect();
        assert_eq!(archived.len(), 1);
    }

    #[tokio::test]
    async fn fallback_lands_on_baseline_when_everything_is_missing() {
        let dir = tempfile::tempdir().unwrap();
        // A worker command that cannot work forces the baseline
        let worker = WorkerConfig {
            command: vec!["/nonexistent-worker".to_string()],
            ..WorkerConfig::default()
        };
        let loader = StrategyLoader::new(dir.path().to_path_buf(), worker);
        let store = Store::connect_memory().await.unwrap();
        let loaded = loader.load_with_fallback(&store).await;
        assert_eq!(loaded.source, LoadSource::Builtin);
        assert!(loaded.code_hash.is_none());
    }

    #[tokio::test]
    async fn state_blob_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let loader = StrategyLoader::new(dir.path().to_path_buf(), WorkerConfig::default());
        let store = Store::connect_memory().await.unwrap();
        assert!(loader.latest_state(&store).await.unwrap().is_none());
        loader
            .save_state(&store, json!({"trade_count": 3}))
            .await
            .unwrap();
        let state = loader.latest_state(&store).await.unwrap().unwrap();
        assert_eq!(state["trade_count"], json!(3));
    }
}
