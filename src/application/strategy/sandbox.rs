//! Strategy sandbox: validates generated code before anything executes it.
//!
//! Stage 1 is a static lexical scan of the worker source with comments and
//! string literals stripped: forbidden imports, calls, attribute access,
//! and dangerous dunders are all hard failures. Stage 2 materializes the
//! code and smoke-tests it in a worker process against synthetic markets
//! under a tight timeout. Fail-closed throughout: `passed == false` blocks
//! deployment unconditionally.

use chrono::{Duration, Utc};
use rand::Rng;
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::info;

use crate::config::WorkerConfig;
use crate::domain::contract::{PortfolioView, RiskLimits, Signal, SymbolData};
use crate::domain::market::{Candle, CandleSeries, Timeframe};

use super::worker::WorkerProcess;

#[derive(Debug, Clone)]
pub struct SandboxResult {
    pub passed: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl SandboxResult {
    fn fail(errors: Vec<String>) -> Self {
        Self {
            passed: false,
            errors,
            warnings: Vec::new(),
        }
    }
}

pub(crate) struct StaticPolicy {
    pub forbidden_imports: &'static [&'static str],
    pub forbidden_calls: &'static [&'static str],
    pub forbidden_attrs: &'static [&'static str],
    pub forbidden_dunders: &'static [&'static str],
}

pub(crate) const FORBIDDEN_CALLS: &[&str] = &[
    "eval", "exec", "__import__", "open", "compile", "print", "getattr", "setattr", "delattr",
    "globals", "vars", "dir",
];

pub(crate) const FORBIDDEN_ATTRS: &[&str] =
    &["os.system", "os.popen", "os.exec", "os.environ", "os.path"];

pub(crate) const FORBIDDEN_DUNDERS: &[&str] = &[
    "__builtins__",
    "__import__",
    "__class__",
    "__subclasses__",
    "__bases__",
    "__mro__",
    "__globals__",
    "__code__",
    "__getattribute__",
    "__dict__",
];

pub(crate) const STRATEGY_POLICY: StaticPolicy = StaticPolicy {
    forbidden_imports: &[
        "subprocess",
        "os",
        "shutil",
        "socket",
        "http",
        "urllib",
        "requests",
        "httpx",
        "websockets",
        "aiohttp",
        "sqlite3",
        "aiosqlite",
        "pathlib",
        "sys",
        "builtins",
        "ctypes",
        "importlib",
        "types",
        "threading",
        "multiprocessing",
        "pickle",
        "io",
        "tempfile",
        "gc",
        "inspect",
    ],
    forbidden_calls: FORBIDDEN_CALLS,
    forbidden_attrs: FORBIDDEN_ATTRS,
    forbidden_dunders: FORBIDDEN_DUNDERS,
};

/// Strip comments and string literal contents so the scan only sees code.
/// Handles `#` line comments, single/double quotes, and triple quotes.
pub(crate) fn strip_noise(code: &str) -> String {
    let bytes = code.as_bytes();
    let mut out = String::with_capacity(code.len());
    let mut i = 0;

    while i < bytes.len() {
        let rest = &code[i..];
        if rest.starts_with("\"\"\"") || rest.starts_with("'''") {
            let delim = &rest[..3];
            out.push_str("\"\"");
            match rest[3..].find(delim) {
                Some(end) => {
                    // Keep line structure for accurate import-line detection
                    for c in rest[3..3 + end].chars().filter(|c| *c == '\n') {
                        out.push(c);
                    }
                    i += end + 6;
                }
                None => break,
            }
            continue;
        }
        let c = bytes[i] as char;
        match c {
            '#' => {
                while i < bytes.len() && bytes[i] as char != '\n' {
                    i += 1;
                }
            }
            '\'' | '"' => {
                out.push('"');
                i += 1;
                while i < bytes.len() {
                    let sc = bytes[i] as char;
                    if sc == '\\' {
                        i += 2;
                        continue;
                    }
                    if sc == c || sc == '\n' {
                        out.push('"');
                        i += 1;
                        break;
                    }
                    i += 1;
                }
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Whole-word occurrence of `needle` in `haystack`, with an optional
/// required following character (after whitespace). Attribute position
/// (`conn.load_extension(...)`) counts as a match (fail-closed).
fn find_word(haystack: &str, needle: &str, followed_by: Option<char>) -> bool {
    let mut start = 0;
    while let Some(pos) = haystack[start..].find(needle) {
        let abs = start + pos;
        let before_ok = abs == 0 || {
            let prev = haystack[..abs].chars().next_back().unwrap();
            !is_ident_char(prev)
        };
        let end = abs + needle.len();
        let after = haystack[end..].trim_start().chars().next();
        let after_boundary = haystack[end..]
            .chars()
            .next()
            .map(|c| !is_ident_char(c))
            .unwrap_or(true);
        let follow_ok = match followed_by {
            Some(ch) => after == Some(ch),
            None => after_boundary,
        };
        if before_ok && after_boundary && follow_ok {
            return true;
        }
        start = abs + 1;
    }
    false
}

/// Static scan of worker source against a policy. Returns every violation.
pub(crate) fn scan_source(code: &str, policy: &StaticPolicy) -> Vec<String> {
    let cleaned = strip_noise(code);
    let mut errors = Vec::new();

    for line in cleaned.lines() {
        let trimmed = line.trim_start();
        if let Some(rest) = trimmed.strip_prefix("import ") {
            for part in rest.split(',') {
                let module = part.trim().split_whitespace().next().unwrap_or("");
                let root = module.split('.').next().unwrap_or("");
                if policy.forbidden_imports.contains(&root) {
                    errors.push(format!("Forbidden import: {module}"));
                }
            }
        } else if let Some(rest) = trimmed.strip_prefix("from ") {
            let module = rest.split_whitespace().next().unwrap_or("");
            let root = module.split('.').next().unwrap_or("");
            if policy.forbidden_imports.contains(&root) {
                errors.push(format!("Forbidden import: from {module}"));
            }
        }
    }

    for call in policy.forbidden_calls {
        if find_word(&cleaned, call, Some('(')) {
            errors.push(format!("Forbidden function call: {call}()"));
        }
    }

    for attr in policy.forbidden_attrs {
        if cleaned.contains(attr) {
            errors.push(format!("Forbidden attribute access: {attr}"));
        }
    }

    for dunder in policy.forbidden_dunders {
        if cleaned.contains(&format!(".{dunder}")) {
            errors.push(format!("Forbidden dunder access: .{dunder}"));
        }
    }

    errors
}

/// Static validation only. Used where no worker runtime is available and by
/// the unit tests; the full pipeline runs `validate_strategy`.
pub fn validate_strategy_static(code: &str) -> SandboxResult {
    let errors = scan_source(code, &STRATEGY_POLICY);
    if errors.is_empty() {
        SandboxResult {
            passed: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    } else {
        SandboxResult::fail(errors)
    }
}

/// Full validation: static scan, then a smoke test in a worker process
/// against synthetic 100-bar markets for three symbols.
pub async fn validate_strategy(code: &str, config: &WorkerConfig) -> SandboxResult {
    let static_result = validate_strategy_static(code);
    if !static_result.passed {
        return static_result;
    }

    let mut warnings = Vec::new();
    match smoke_test(code, config, &mut warnings).await {
        Ok(()) => {
            info!(warnings = warnings.len(), "strategy sandbox passed");
            SandboxResult {
                passed: true,
                errors: Vec::new(),
                warnings,
            }
        }
        Err(e) => SandboxResult {
            passed: false,
            errors: vec![format!("Runtime error: {e:#}")],
            warnings,
        },
    }
}

async fn smoke_test(
    code: &str,
    config: &WorkerConfig,
    warnings: &mut Vec<String>,
) -> anyhow::Result<()> {
    let script = tempfile::NamedTempFile::new()?;
    std::fs::write(script.path(), code)?;
    let mut worker = WorkerProcess::spawn(config, script.path()).await?;

    let run = async {
        let (markets, portfolio, risk_limits) = sample_inputs();
        worker
            .call(&json!({
                "op": "initialize",
                "risk_limits": risk_limits,
                "symbols": markets.keys().collect::<Vec<_>>(),
            }))
            .await?;

        let response = worker
            .call(&json!({
                "op": "analyze",
                "markets": markets,
                "portfolio": portfolio,
                "timestamp": Utc::now().to_rfc3339(),
            }))
            .await?;
        let result = response.get("result").cloned().unwrap_or(Value::Null);
        let signals: Vec<Signal> = serde_json::from_value(result)
            .map_err(|e| anyhow::anyhow!("analyze() must return a list of signals: {e}"))?;
        for (i, sig) in signals.iter().enumerate() {
            if !(0.0..=1.0).contains(&sig.size_pct) {
                warnings.push(format!(
                    "Signal {i} size_pct={} outside 0-1 range",
                    sig.size_pct
                ));
            }
        }

        let state = worker.call(&json!({"op": "get_state"})).await?;
        let state_value = state.get("result").cloned().unwrap_or(json!({}));
        if !state_value.is_object() {
            warnings.push("get_state() did not return an object".to_string());
        } else {
            worker
                .call(&json!({"op": "load_state", "state": state_value}))
                .await?;
        }
        anyhow::Ok(())
    };

    let outcome = run.await;
    worker.shutdown().await;
    outcome
}

/// Random-walk 100-bar markets for three symbols, mirroring what live scans
/// hand the strategy.
pub(crate) fn sample_inputs() -> (HashMap<String, SymbolData>, PortfolioView, RiskLimits) {
    let mut rng = rand::rng();
    let mut markets = HashMap::new();
    for (symbol, base_price) in [("BTC/USD", 70_000.0), ("ETH/USD", 2_000.0), ("SOL/USD", 80.0)] {
        let start = Utc::now() - Duration::minutes(5 * 100);
        let mut price: f64 = base_price;
        let candles: Vec<Candle> = (0..100)
            .map(|i| {
                price += rng.random_range(-1.0..1.0) * base_price * 0.001;
                Candle {
                    timestamp: start + Duration::minutes(5 * i),
                    open: price,
                    high: price * 1.001,
                    low: price * 0.999,
                    close: price,
                    volume: rng.random_range(100.0..1000.0),
                }
            })
            .collect();
        let series = CandleSeries::new(candles);
        markets.insert(
            symbol.to_string(),
            SymbolData {
                symbol: symbol.to_string(),
                current_price: price,
                candles_1h: series.resample(Timeframe::H1),
                candles_1d: series.resample(Timeframe::D1),
                candles_5m: series,
                spread: 0.001,
                volume_24h: 1_000_000.0,
                maker_fee_pct: 0.25,
                taker_fee_pct: 0.40,
            },
        );
    }

    let portfolio = PortfolioView {
        cash: 200.0,
        total_value: 200.0,
        positions: vec![],
        recent_trades: vec![],
        daily_pnl: 0.0,
        total_pnl: 0.0,
        fees_today: 0.0,
    };

    let risk_limits = RiskLimits {
        max_trade_pct: 0.05,
        default_trade_pct: 0.02,
        max_positions: 5,
        max_daily_loss_pct: 0.03,
        max_drawdown_pct: 0.10,
        max_position_pct: 0.25,
        max_daily_trades: 20,
        rollback_consecutive_losses: 999,
    };

    (markets, portfolio, risk_limits)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forbidden_import_rejected() {
        let result = validate_strategy_static("import subprocess\nclass Strategy: pass\n");
        assert!(!result.passed);
        assert_eq!(result.errors, vec!["Forbidden import: subprocess"]);
    }

    #[test]
    fn from_import_and_dotted_roots_rejected() {
        assert!(!validate_strategy_static("from os import system\n").passed);
        assert!(!validate_strategy_static("import os.path\n").passed);
        assert!(!validate_strategy_static("import math, socket\n").passed);
    }

    #[test]
    fn benign_code_passes() {
        let code = "import math\nimport statistics\n\nclass Strategy:\n    def analyze(self):\n        return []\n";
        let result = validate_strategy_static(code);
        assert!(result.passed, "{:?}", result.errors);
    }

    #[test]
    fn forbidden_calls_rejected() {
        assert!(!validate_strategy_static("x = eval('1+1')\n").passed);
        assert!(!validate_strategy_static("exec ('pass')\n").passed);
        assert!(!validate_strategy_static("f = open('/etc/passwd')\n").passed);
        assert!(!validate_strategy_static("g = getattr(obj, 'x')\n").passed);
    }

    #[test]
    fn identifiers_containing_forbidden_names_pass() {
        // "reopen(" and "my_eval_result" must not trip the word matcher
        assert!(validate_strategy_static("x = reopen(1)\n").passed);
        assert!(validate_strategy_static("my_eval_result = 3\n").passed);
        // method call obj.evaluate() is fine; obj.eval() is not (fail-closed)
        assert!(validate_strategy_static("y = model.evaluate()\n").passed);
        assert!(!validate_strategy_static("y = model.eval()\n").passed);
    }

    #[test]
    fn dunder_access_rejected() {
        assert!(!validate_strategy_static("k = ().__class__\n").passed);
        assert!(!validate_strategy_static("m = f.__globals__\n").passed);
    }

    #[test]
    fn os_attribute_calls_rejected() {
        assert!(!validate_strategy_static("import math\nos.system('ls')\n").passed);
    }

    #[test]
    fn strings_and_comments_do_not_trip_the_scan() {
        let code = "# import subprocess in a comment\nnote = 'eval(this) is just text'\ndoc = \"\"\"\nimport os\n\"\"\"\n";
        let result = validate_strategy_static(code);
        assert!(result.passed, "{:?}", result.errors);
    }

    #[test]
    fn multiple_violations_all_reported() {
        let code = "import subprocess\nimport socket\nx = eval('1')\n";
        let result = validate_strategy_static(code);
        assert!(!result.passed);
        assert!(result.errors.len() >= 3, "{:?}", result.errors);
    }

    #[tokio::test]
    async fn smoke_test_accepts_well_behaved_worker() {
        let config = WorkerConfig {
            command: vec![
                "sh".to_string(),
                "-c".to_string(),
                r#"while read -r line; do echo '{"ok":true,"result":[]}'; done"#.to_string(),
            ],
            call_timeout_secs: 5,
            ..WorkerConfig::default()
        };
        let result = validate_strategy("x = 1\n", &config).await;
        assert!(result.passed, "{:?}", result.errors);
    }

    #[tokio::test]
    async fn smoke_test_fails_closed_on_crash() {
        let config = WorkerConfig {
            command: vec!["sh".to_string(), "-c".to_string(), "exit 1".to_string()],
            call_timeout_secs: 5,
            ..WorkerConfig::default()
        };
        let result = validate_strategy("x = 1\n", &config).await;
        assert!(!result.passed);
    }
}
