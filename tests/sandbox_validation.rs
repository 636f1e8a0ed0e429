//! Sandbox fail-closed properties: forbidden constructs are rejected
//! before any code executes, and the dynamic smoke test only runs once the
//! static scan is clean.

use evotrade::application::analysis::sandbox::validate_analysis_static;
use evotrade::application::strategy::{validate_strategy, validate_strategy_static};
use evotrade::config::WorkerConfig;

#[test]
fn forbidden_import_is_rejected_with_the_exact_reason() {
    let code = "import subprocess\n\nclass Strategy:\n    pass\n";
    let result = validate_strategy_static(code);
    assert!(!result.passed);
    assert_eq!(result.errors, vec!["Forbidden import: subprocess"]);
}

#[test]
fn the_forbidden_construct_catalog_is_closed() {
    let samples = [
        "import os",
        "from os import path",
        "import socket",
        "import sys",
        "import importlib",
        "import threading",
        "import pickle",
        "x = eval('1')",
        "exec('pass')",
        "f = open('x')",
        "c = compile('1', '<s>', 'eval')",
        "g = globals()",
        "v = vars()",
        "d = dir()",
        "a = getattr(o, 'x')",
        "setattr(o, 'x', 1)",
        "k = ().__class__",
        "s = ().__class__.__subclasses__",
        "m = f.__globals__",
        "os.system('ls')",
    ];
    for code in samples {
        let result = validate_strategy_static(code);
        assert!(!result.passed, "should reject: {code}");
        assert!(!result.errors.is_empty());
    }
}

#[test]
fn clean_code_passes_both_variants() {
    let code = "import math\nimport statistics\nfrom collections import deque\n\n\
                class Strategy:\n    def analyze(self):\n        return []\n";
    assert!(validate_strategy_static(code).passed);
    assert!(validate_analysis_static(code).passed);
}

#[test]
fn analysis_variant_is_stricter() {
    // marshal is fine for strategies but banned for analysis modules,
    // which also lose the raw store connectors and load_extension
    assert!(validate_strategy_static("import marshal\n").passed);
    assert!(!validate_analysis_static("import marshal\n").passed);
    assert!(!validate_analysis_static("import sqlite3\n").passed);
    assert!(!validate_analysis_static("import aiosqlite\n").passed);
    assert!(!validate_analysis_static("conn.load_extension('evil')\n").passed);
}

#[tokio::test]
async fn static_rejection_blocks_before_any_execution() {
    // The worker command would create a marker file if it ever ran; a
    // static failure must short-circuit the dynamic stage entirely.
    let marker_dir = tempfile::tempdir().unwrap();
    let marker = marker_dir.path().join("executed");
    let config = WorkerConfig {
        command: vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("touch {} && cat", marker.display()),
        ],
        call_timeout_secs: 5,
        ..WorkerConfig::default()
    };

    let result = validate_strategy("import subprocess\n", &config).await;
    assert!(!result.passed);
    assert!(
        !marker.exists(),
        "forbidden code must never reach the worker runtime"
    );
}

#[tokio::test]
async fn crashing_worker_fails_closed() {
    let config = WorkerConfig {
        command: vec!["sh".to_string(), "-c".to_string(), "exit 7".to_string()],
        call_timeout_secs: 5,
        ..WorkerConfig::default()
    };
    let result = validate_strategy("x = 1\n", &config).await;
    assert!(!result.passed);
    assert!(result.errors.iter().any(|e| e.contains("Runtime error")));
}
