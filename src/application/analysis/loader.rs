//! Analysis module deployment: two named slots (`market_analysis`,
//! `trade_performance`) under the analysis directory, archived on every
//! rewrite. Read-only modules deploy immediately after review, no paper
//! test.

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing::info;

use crate::application::strategy::loader::code_hash;

pub const MARKET_ANALYSIS: &str = "market_analysis";
pub const TRADE_PERFORMANCE: &str = "trade_performance";

pub struct AnalysisLoader {
    dir: PathBuf,
}

impl AnalysisLoader {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn module_path(&self, name: &str) -> PathBuf {
        self.dir.join("active").join(format!("{name}.py"))
    }

    pub fn module_code(&self, name: &str) -> Option<String> {
        std::fs::read_to_string(self.module_path(name)).ok()
    }

    pub fn deploy(&self, name: &str, code: &str, version: &str) -> Result<String> {
        let active = self.module_path(name);
        if let Ok(current) = std::fs::read_to_string(&active) {
            let archive = self.dir.join("archive");
            std::fs::create_dir_all(&archive)?;
            std::fs::write(
                archive.join(format!("{name}_pre_{version}.py")),
                current,
            )?;
        }
        std::fs::create_dir_all(active.parent().context("module path has no parent")?)?;
        std::fs::write(&active, code)?;
        let hash = code_hash(code);
        info!(module = name, version, hash = %hash, "analysis module deployed");
        Ok(hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deploy_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let loader = AnalysisLoader::new(dir.path().to_path_buf());
        assert!(loader.module_code(MARKET_ANALYSIS).is_none());

        loader.deploy(MARKET_ANALYSIS, "code v1", "v1").unwrap();
        assert_eq!(loader.module_code(MARKET_ANALYSIS).unwrap(), "code v1");

        loader.deploy(MARKET_ANALYSIS, "code v2", "v2").unwrap();
        assert_eq!(loader.module_code(MARKET_ANALYSIS).unwrap(), "code v2");
        assert!(dir
            .path()
            .join("archive")
            .join("market_analysis_pre_v2.py")
            .exists());
    }
}
