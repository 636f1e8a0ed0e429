//! Canonical schema plus the static table description handed to analysis
//! modules. The schema script is idempotent; constraint changes go through
//! the special migrations in `store.rs`.

use serde_json::{json, Value};

pub const SCHEMA: &str = r#"
-- Market data (tiered OHLCV)
CREATE TABLE IF NOT EXISTS candles (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    symbol TEXT NOT NULL,
    timeframe TEXT NOT NULL,          -- '5m', '1h', '1d'
    timestamp TEXT NOT NULL,
    open REAL NOT NULL,
    high REAL NOT NULL,
    low REAL NOT NULL,
    close REAL NOT NULL,
    volume REAL NOT NULL,
    UNIQUE(symbol, timeframe, timestamp)
);

-- Open positions (keyed by tag, multiple positions per symbol allowed)
CREATE TABLE IF NOT EXISTS positions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    symbol TEXT NOT NULL,
    tag TEXT NOT NULL,
    side TEXT NOT NULL DEFAULT 'long',
    qty REAL NOT NULL,
    avg_entry REAL NOT NULL,
    current_price REAL DEFAULT 0,
    unrealized_pnl REAL DEFAULT 0,
    entry_fee REAL DEFAULT 0,
    stop_loss REAL,
    take_profit REAL,
    intent TEXT NOT NULL DEFAULT 'DAY',
    strategy_version TEXT,
    max_adverse_excursion REAL DEFAULT 0,
    opened_at TEXT DEFAULT (datetime('now')),
    updated_at TEXT DEFAULT (datetime('now')),
    UNIQUE(tag)
);

-- Completed trades
CREATE TABLE IF NOT EXISTS trades (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    symbol TEXT NOT NULL,
    side TEXT NOT NULL,
    qty REAL NOT NULL,
    entry_price REAL NOT NULL,
    exit_price REAL,
    pnl REAL,
    pnl_pct REAL,
    fees REAL DEFAULT 0,
    intent TEXT NOT NULL DEFAULT 'DAY',
    strategy_version TEXT,
    strategy_regime TEXT,               -- the strategy's own regime opinion, not truth
    tag TEXT,
    close_reason TEXT,                  -- signal, stop_loss, take_profit, emergency, reconciliation
    max_adverse_excursion REAL DEFAULT 0,
    opened_at TEXT DEFAULT (datetime('now')),
    closed_at TEXT,
    notes TEXT
);

-- Signal history (acted on or rejected)
CREATE TABLE IF NOT EXISTS signals (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    symbol TEXT NOT NULL,
    action TEXT NOT NULL,
    size_pct REAL NOT NULL,
    confidence REAL,
    intent TEXT,
    reasoning TEXT,
    strategy_version TEXT,
    strategy_regime TEXT,
    acted_on INTEGER DEFAULT 0,
    rejected_reason TEXT,
    tag TEXT,
    created_at TEXT DEFAULT (datetime('now'))
);

-- Daily performance snapshots
CREATE TABLE IF NOT EXISTS daily_performance (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    date TEXT NOT NULL UNIQUE,
    portfolio_value REAL,
    cash REAL,
    total_trades INTEGER DEFAULT 0,
    wins INTEGER DEFAULT 0,
    losses INTEGER DEFAULT 0,
    gross_pnl REAL DEFAULT 0,
    net_pnl REAL DEFAULT 0,
    fees_total REAL DEFAULT 0,
    max_drawdown_pct REAL DEFAULT 0,
    win_rate REAL DEFAULT 0,
    expectancy REAL DEFAULT 0,
    sharpe REAL,
    strategy_version TEXT,
    notes TEXT
);

-- Strategy version index
CREATE TABLE IF NOT EXISTS strategy_versions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    version TEXT NOT NULL UNIQUE,
    parent_version TEXT,
    code_hash TEXT NOT NULL,
    description TEXT,
    backtest_result TEXT,               -- JSON
    market_conditions TEXT,             -- JSON
    code TEXT,
    deployed_at TEXT,
    retired_at TEXT,
    created_at TEXT DEFAULT (datetime('now'))
);

-- Opaque strategy state blobs
CREATE TABLE IF NOT EXISTS strategy_state (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    state_json TEXT NOT NULL,
    saved_at TEXT DEFAULT (datetime('now'))
);

-- Orchestrator decision log
CREATE TABLE IF NOT EXISTS orchestrator_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    date TEXT NOT NULL,
    action TEXT NOT NULL,
    analysis TEXT,                      -- JSON: full decision
    changes TEXT,
    strategy_version_from TEXT,
    strategy_version_to TEXT,
    tokens_used INTEGER DEFAULT 0,
    cost_usd REAL DEFAULT 0,
    created_at TEXT DEFAULT (datetime('now'))
);

-- Orchestrator thought spool (full AI prompts/responses for audit)
CREATE TABLE IF NOT EXISTS orchestrator_thoughts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    cycle_id TEXT NOT NULL,
    step TEXT NOT NULL,
    model TEXT NOT NULL,
    input_summary TEXT,
    full_response TEXT NOT NULL,
    parsed_result TEXT,
    created_at TEXT DEFAULT (datetime('now'))
);

-- Orchestrator daily observations (rolling 30-day window)
CREATE TABLE IF NOT EXISTS orchestrator_observations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    date TEXT NOT NULL,
    cycle_id TEXT NOT NULL,
    market_summary TEXT,
    strategy_assessment TEXT,
    notable_findings TEXT,
    created_at TEXT DEFAULT (datetime('now')),
    UNIQUE(date, cycle_id)
);

-- Token usage tracking (per AI call)
CREATE TABLE IF NOT EXISTS token_usage (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    model TEXT NOT NULL,
    input_tokens INTEGER NOT NULL,
    output_tokens INTEGER NOT NULL,
    cost_usd REAL NOT NULL,
    purpose TEXT,
    created_at TEXT DEFAULT (datetime('now'))
);

-- Fee schedule (refreshed from the exchange, per-pair)
CREATE TABLE IF NOT EXISTS fee_schedule (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    symbol TEXT,
    maker_fee_pct REAL NOT NULL,
    taker_fee_pct REAL NOT NULL,
    volume_tier TEXT,
    checked_at TEXT DEFAULT (datetime('now'))
);

-- Scan results: price + spread audit trail, signal tracking
CREATE TABLE IF NOT EXISTS scan_results (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    symbol TEXT NOT NULL,
    price REAL NOT NULL,
    spread REAL,
    signal_generated INTEGER DEFAULT 0,
    signal_action TEXT,
    signal_confidence REAL,
    created_at TEXT DEFAULT (datetime('now'))
);

-- Candidate strategy slots
CREATE TABLE IF NOT EXISTS candidates (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    slot INTEGER NOT NULL,
    strategy_version TEXT NOT NULL,
    code TEXT NOT NULL,
    code_hash TEXT NOT NULL,
    description TEXT,
    backtest_summary TEXT,
    portfolio_snapshot TEXT,            -- JSON: cash + cloned positions at creation
    evaluation_duration_days INTEGER,
    status TEXT NOT NULL DEFAULT 'running',  -- running, canceled, promoted
    created_at TEXT DEFAULT (datetime('now')),
    resolved_at TEXT
);

CREATE TABLE IF NOT EXISTS candidate_positions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    candidate_slot INTEGER NOT NULL,
    symbol TEXT NOT NULL,
    tag TEXT NOT NULL,
    side TEXT NOT NULL DEFAULT 'long',
    qty REAL NOT NULL,
    avg_entry REAL NOT NULL,
    current_price REAL DEFAULT 0,
    unrealized_pnl REAL DEFAULT 0,
    entry_fee REAL DEFAULT 0,
    stop_loss REAL,
    take_profit REAL,
    intent TEXT NOT NULL DEFAULT 'DAY',
    strategy_version TEXT,
    max_adverse_excursion REAL DEFAULT 0,
    opened_at TEXT,
    updated_at TEXT DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS candidate_trades (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    candidate_slot INTEGER NOT NULL,
    symbol TEXT NOT NULL,
    side TEXT NOT NULL DEFAULT 'long',
    qty REAL NOT NULL,
    entry_price REAL,
    exit_price REAL,
    pnl REAL,
    pnl_pct REAL,
    fees REAL DEFAULT 0,
    intent TEXT DEFAULT 'DAY',
    strategy_version TEXT,
    tag TEXT,
    close_reason TEXT,
    max_adverse_excursion REAL DEFAULT 0,
    opened_at TEXT,
    closed_at TEXT
);

CREATE TABLE IF NOT EXISTS candidate_signals (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    candidate_slot INTEGER NOT NULL,
    symbol TEXT NOT NULL,
    action TEXT NOT NULL,
    size_pct REAL,
    confidence REAL,
    intent TEXT,
    reasoning TEXT,
    strategy_regime TEXT,
    acted_on INTEGER DEFAULT 0,
    rejected_reason TEXT,
    tag TEXT,
    created_at TEXT DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS candidate_daily_performance (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    candidate_slot INTEGER NOT NULL,
    date TEXT NOT NULL,
    portfolio_value REAL,
    cash REAL,
    total_trades INTEGER DEFAULT 0,
    wins INTEGER DEFAULT 0,
    losses INTEGER DEFAULT 0,
    gross_pnl REAL DEFAULT 0,
    net_pnl REAL DEFAULT 0,
    fees_total REAL DEFAULT 0,
    win_rate REAL DEFAULT 0,
    strategy_version TEXT,
    UNIQUE(candidate_slot, date)
);

-- Exchange orders (live mode fill confirmation tracking)
CREATE TABLE IF NOT EXISTS orders (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    txid TEXT NOT NULL UNIQUE,
    tag TEXT,
    symbol TEXT NOT NULL,
    side TEXT NOT NULL,
    order_type TEXT NOT NULL,
    volume REAL NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',  -- pending, filled, timeout, canceled, expired
    filled_volume REAL DEFAULT 0,
    avg_fill_price REAL,
    fee REAL DEFAULT 0,
    cost REAL DEFAULT 0,
    placed_at TEXT DEFAULT (datetime('now')),
    filled_at TEXT,
    exchange_response TEXT,
    purpose TEXT DEFAULT 'entry',
    created_at TEXT DEFAULT (datetime('now'))
);

-- Exchange-native SL/TP orders (live mode)
CREATE TABLE IF NOT EXISTS conditional_orders (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    tag TEXT NOT NULL UNIQUE,
    symbol TEXT NOT NULL,
    entry_txid TEXT,
    sl_txid TEXT,
    tp_txid TEXT,
    sl_price REAL,
    tp_price REAL,
    status TEXT NOT NULL DEFAULT 'active',
    created_at TEXT DEFAULT (datetime('now')),
    updated_at TEXT DEFAULT (datetime('now'))
);

-- Capital events (deposits, withdrawals, adjustments)
CREATE TABLE IF NOT EXISTS capital_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    type TEXT NOT NULL,
    amount REAL NOT NULL,
    timestamp TEXT DEFAULT (datetime('now')),
    notes TEXT
);

-- System activity log (rolling 90 days)
CREATE TABLE IF NOT EXISTS activity_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    category TEXT NOT NULL,
    message TEXT NOT NULL,
    detail TEXT,
    timestamp TEXT DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_candles_symbol_tf ON candles(symbol, timeframe, timestamp);
CREATE INDEX IF NOT EXISTS idx_trades_symbol ON trades(symbol, closed_at);
CREATE INDEX IF NOT EXISTS idx_signals_created ON signals(created_at);
CREATE INDEX IF NOT EXISTS idx_daily_perf_date ON daily_performance(date);
CREATE INDEX IF NOT EXISTS idx_token_usage_date ON token_usage(created_at);
CREATE INDEX IF NOT EXISTS idx_scan_results_ts ON scan_results(timestamp);
CREATE INDEX IF NOT EXISTS idx_scan_results_symbol ON scan_results(symbol, timestamp);
CREATE INDEX IF NOT EXISTS idx_thoughts_cycle ON orchestrator_thoughts(cycle_id, created_at);
CREATE INDEX IF NOT EXISTS idx_observations_date ON orchestrator_observations(date);
CREATE INDEX IF NOT EXISTS idx_candidate_positions_slot ON candidate_positions(candidate_slot);
CREATE INDEX IF NOT EXISTS idx_candidate_trades_slot ON candidate_trades(candidate_slot);
CREATE INDEX IF NOT EXISTS idx_orders_txid ON orders(txid);
CREATE INDEX IF NOT EXISTS idx_orders_status ON orders(status);
CREATE INDEX IF NOT EXISTS idx_conditional_orders_tag ON conditional_orders(tag);
"#;

/// Column additions for databases created before the column existed.
/// (table, column, ALTER statement)
pub const MIGRATIONS: &[(&str, &str, &str)] = &[
    (
        "trades",
        "strategy_regime",
        "ALTER TABLE trades ADD COLUMN strategy_regime TEXT",
    ),
    (
        "signals",
        "strategy_regime",
        "ALTER TABLE signals ADD COLUMN strategy_regime TEXT",
    ),
    (
        "fee_schedule",
        "symbol",
        "ALTER TABLE fee_schedule ADD COLUMN symbol TEXT",
    ),
    (
        "positions",
        "entry_fee",
        "ALTER TABLE positions ADD COLUMN entry_fee REAL DEFAULT 0",
    ),
    (
        "positions",
        "strategy_version",
        "ALTER TABLE positions ADD COLUMN strategy_version TEXT",
    ),
    (
        "positions",
        "max_adverse_excursion",
        "ALTER TABLE positions ADD COLUMN max_adverse_excursion REAL DEFAULT 0",
    ),
    ("trades", "tag", "ALTER TABLE trades ADD COLUMN tag TEXT"),
    ("signals", "tag", "ALTER TABLE signals ADD COLUMN tag TEXT"),
    (
        "trades",
        "close_reason",
        "ALTER TABLE trades ADD COLUMN close_reason TEXT",
    ),
    (
        "trades",
        "max_adverse_excursion",
        "ALTER TABLE trades ADD COLUMN max_adverse_excursion REAL DEFAULT 0",
    ),
    (
        "strategy_versions",
        "code",
        "ALTER TABLE strategy_versions ADD COLUMN code TEXT",
    ),
];

/// Table/column description handed to analysis modules so they know what
/// data exists without poking at sqlite_master.
pub fn schema_description() -> Value {
    json!({
        "candles": {
            "description": "OHLCV market data, tiered by timeframe",
            "columns": {
                "symbol": "Trading pair (e.g., BTC/USD)",
                "timeframe": "'5m', '1h', or '1d'",
                "timestamp": "RFC 3339 UTC datetime",
                "open": "Opening price", "high": "High price",
                "low": "Low price", "close": "Closing price",
                "volume": "Trade volume",
            },
        },
        "trades": {
            "description": "Completed trades with P&L",
            "columns": {
                "symbol": "Trading pair",
                "tag": "Position tag (unique identifier)",
                "side": "'long' (system is long-only)",
                "qty": "Quantity traded",
                "entry_price": "Entry fill price",
                "exit_price": "Exit fill price",
                "pnl": "Realized profit/loss (USD, after fees)",
                "pnl_pct": "P&L as percentage of entry",
                "fees": "Fees paid (USD, entry + exit)",
                "intent": "DAY, SWING, or POSITION",
                "strategy_version": "Strategy version that generated this trade",
                "strategy_regime": "What the strategy thought the regime was (not truth)",
                "close_reason": "signal, stop_loss, take_profit, emergency, reconciliation",
                "max_adverse_excursion": "Deepest drawdown from entry while open",
                "opened_at": "Position open time",
                "closed_at": "Position close time",
            },
        },
        "signals": {
            "description": "All signals generated by the strategy",
            "columns": {
                "symbol": "Trading pair",
                "action": "BUY, SELL, CLOSE, or MODIFY",
                "tag": "Position tag (for targeted signals)",
                "size_pct": "Position size as fraction of portfolio",
                "confidence": "Strategy confidence 0.0-1.0",
                "intent": "DAY, SWING, or POSITION",
                "reasoning": "Strategy's reasoning text",
                "strategy_regime": "What the strategy thought the regime was",
                "acted_on": "1 if trade was executed, 0 if rejected",
                "rejected_reason": "Why the signal was rejected (if applicable)",
                "created_at": "Signal generation time",
            },
        },
        "scan_results": {
            "description": "Price + spread audit trail from every scan, with signal tracking",
            "columns": {
                "timestamp": "Scan time",
                "symbol": "Trading pair",
                "price": "Current price at scan time",
                "spread": "Bid-ask spread",
                "signal_generated": "1 if a signal was generated this scan",
                "signal_action": "BUY/SELL/CLOSE if signal generated",
                "signal_confidence": "Signal confidence if generated",
            },
        },
        "daily_performance": {
            "description": "Daily portfolio snapshots",
            "columns": {
                "date": "Date (YYYY-MM-DD, configured timezone)",
                "portfolio_value": "Total portfolio value",
                "cash": "Cash balance",
                "total_trades": "Trades completed that day",
                "wins": "Winning trades", "losses": "Losing trades",
                "gross_pnl": "P&L before fees", "net_pnl": "P&L after fees",
                "fees_total": "Total fees that day",
                "win_rate": "Win rate that day",
                "strategy_version": "Active strategy version",
            },
        },
        "positions": {
            "description": "Currently open positions (keyed by tag, multiple per symbol allowed)",
            "columns": {
                "symbol": "Trading pair",
                "tag": "Unique position identifier",
                "side": "'long' (system is long-only)",
                "qty": "Position size",
                "avg_entry": "Average entry price",
                "current_price": "Last known price",
                "stop_loss": "Stop-loss price",
                "take_profit": "Take-profit price",
                "intent": "DAY, SWING, or POSITION",
                "max_adverse_excursion": "Deepest drawdown from entry so far",
            },
        },
        "fee_schedule": {
            "description": "Per-pair fee schedule history from the exchange",
            "columns": {
                "symbol": "Trading pair (NULL for the account-wide row)",
                "maker_fee_pct": "Maker fee percentage",
                "taker_fee_pct": "Taker fee percentage",
                "checked_at": "When fees were last checked",
            },
        },
        "strategy_versions": {
            "description": "Strategy version history",
            "columns": {
                "version": "Version identifier",
                "parent_version": "Previous version",
                "description": "What changed",
                "backtest_result": "Backtest summary at creation",
                "deployed_at": "When deployed (NULL for candidates never promoted)",
                "retired_at": "When replaced (NULL for the active version)",
            },
        },
        "capital_events": {
            "description": "Capital deposits, withdrawals, and adjustments",
            "columns": {
                "type": "Event type (deposit, withdrawal, adjustment)",
                "amount": "Amount in USD",
                "timestamp": "When the event occurred",
                "notes": "Optional description",
            },
        },
        "orders": {
            "description": "Exchange order tracking with fill confirmation",
            "columns": {
                "txid": "Exchange transaction ID",
                "tag": "Position tag",
                "symbol": "Trading pair",
                "side": "buy or sell",
                "order_type": "market or limit",
                "volume": "Requested volume",
                "status": "pending, filled, timeout, canceled, expired",
                "filled_volume": "Actual filled volume",
                "avg_fill_price": "Actual fill price from the exchange",
                "fee": "Exchange fee",
                "purpose": "entry, exit, stop_loss, take_profit",
            },
        },
        "conditional_orders": {
            "description": "Exchange-native stop-loss and take-profit orders",
            "columns": {
                "tag": "Position tag (unique identifier)",
                "symbol": "Trading pair",
                "entry_txid": "Transaction ID of the entry order",
                "sl_txid": "Transaction ID of the stop-loss order",
                "tp_txid": "Transaction ID of the take-profit order",
                "sl_price": "Stop-loss trigger price",
                "tp_price": "Take-profit trigger price",
                "status": "active, canceled, filled_sl, filled_tp",
            },
        },
    })
}
