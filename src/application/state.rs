//! Shared scan state, owned by the engine behind a single `RwLock`. Tasks
//! communicate through these flags instead of ad-hoc shared maps: the
//! orchestrator raises `strategy_reload_needed` after a promotion and the
//! scan loop applies it before its next `analyze` call.

use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct ScanState {
    /// Per-symbol snapshot of the last scan (price, spread, signal info).
    pub symbols: HashMap<String, Value>,
    pub last_scan: Option<String>,
    /// Set by the orchestrator after promotion; consumed by the scan loop.
    pub strategy_reload_needed: bool,
    /// Hash of the currently loaded strategy code.
    pub strategy_hash: Option<String>,
    /// Operator flags.
    pub paused: bool,
    pub kill_requested: bool,
    /// True once the WebSocket feed has permanently failed; the position
    /// monitor falls back to REST polling.
    pub ws_degraded: bool,
}
