//! Analysis sandbox: stricter sibling of the strategy sandbox.
//!
//! Analysis modules are read-only, so the static policy additionally bans
//! raw store connectors and a wider set of loader/introspection modules,
//! and `load_extension` as a call. The dynamic stage runs the module
//! against an empty in-memory store behind the read-only facade and
//! verifies it returns a dict without crashing; the classic failure mode
//! is code that divides by zero on empty tables.

use std::time::Duration;
use tracing::info;

use crate::application::strategy::sandbox::{
    scan_source, SandboxResult, StaticPolicy, FORBIDDEN_ATTRS, FORBIDDEN_DUNDERS,
};
use crate::config::WorkerConfig;
use crate::infrastructure::persistence::{ReadOnlyStore, Store};

use super::runner::run_analysis_module;

const ANALYSIS_FORBIDDEN_CALLS: &[&str] = &[
    "eval",
    "exec",
    "__import__",
    "open",
    "compile",
    "print",
    "getattr",
    "setattr",
    "delattr",
    "globals",
    "vars",
    "dir",
    "load_extension",
];

const ANALYSIS_POLICY: StaticPolicy = StaticPolicy {
    forbidden_imports: &[
        "subprocess",
        "shutil",
        "socket",
        "http",
        "urllib",
        "requests",
        "httpx",
        "websockets",
        "aiohttp",
        // Raw store connectors: modules must use the provided facade
        "os",
        "sqlite3",
        "aiosqlite",
        "pathlib",
        "sys",
        "builtins",
        "ctypes",
        "importlib",
        "types",
        "code",
        "codeop",
        "runpy",
        "pkgutil",
        "threading",
        "multiprocessing",
        "pickle",
        "shelve",
        "marshal",
        "io",
        "tempfile",
        "gc",
        "inspect",
        "atexit",
        "signal",
    ],
    forbidden_calls: ANALYSIS_FORBIDDEN_CALLS,
    forbidden_attrs: FORBIDDEN_ATTRS,
    forbidden_dunders: FORBIDDEN_DUNDERS,
};

pub fn validate_analysis_static(code: &str) -> SandboxResult {
    let errors = scan_source(code, &ANALYSIS_POLICY);
    SandboxResult {
        passed: errors.is_empty(),
        errors,
        warnings: Vec::new(),
    }
}

/// Full validation of an analysis module: static scan, then a smoke run
/// against an empty in-memory store behind the read-only facade.
pub async fn validate_analysis_module(
    code: &str,
    module_name: &str,
    config: &WorkerConfig,
) -> SandboxResult {
    let static_result = validate_analysis_static(code);
    if !static_result.passed {
        return static_result;
    }

    let outcome = async {
        let script = tempfile::NamedTempFile::new()?;
        std::fs::write(script.path(), code)?;
        // Schema, no data: the common crash is an unguarded empty table
        let store = Store::connect_memory().await?;
        let ro = ReadOnlyStore::new(store);
        run_analysis_module(script.path(), config, &ro, Duration::from_secs(10)).await
    }
    .await;

    match outcome {
        Ok(_) => {
            info!(module = module_name, "analysis sandbox passed");
            SandboxResult {
                passed: true,
                errors: Vec::new(),
                warnings: Vec::new(),
            }
        }
        Err(e) => SandboxResult {
            passed: false,
            errors: vec![format!("Runtime error: {e:#}")],
            warnings: Vec::new(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_connector_imports_rejected() {
        assert!(!validate_analysis_static("import sqlite3\n").passed);
        assert!(!validate_analysis_static("import aiosqlite\n").passed);
        assert!(!validate_analysis_static("import os\n").passed);
    }

    #[test]
    fn load_extension_call_rejected() {
        assert!(!validate_analysis_static("db.load_extension('x')\n").passed);
        assert!(!validate_analysis_static("load_extension('x')\n").passed);
    }

    #[test]
    fn statistics_imports_allowed() {
        let code = "import statistics\nimport math\nfrom collections import Counter\n";
        assert!(validate_analysis_static(code).passed);
    }

    #[test]
    fn print_rejected_for_analysis() {
        assert!(!validate_analysis_static("print('hi')\n").passed);
    }
}
