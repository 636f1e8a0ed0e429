//! Thin async facade over the embedded SQLite store.
//!
//! Single-writer discipline: the pool holds exactly one connection, so every
//! statement is serialized through it regardless of how many tasks hold a
//! `Store` clone. Writes autocommit per statement; handlers keep their
//! in-memory mutations contiguous and flush here before yielding.

use anyhow::{Context, Result};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use tracing::{info, warn};

use super::rows::{row_to_json, JsonRow, RowExt};
use super::schema::{MIGRATIONS, SCHEMA};

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if missing), apply the schema and all migrations.
    pub async fn connect(db_url: &str) -> Result<Self> {
        if let Some(path_part) = db_url.strip_prefix("sqlite://") {
            let path = Path::new(path_part);
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .context("failed to create database directory")?;
                }
            }
        }

        let options = SqliteConnectOptions::from_str(db_url)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .foreign_keys(true);

        // One connection: the store is the single writer.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("failed to connect to SQLite database")?;

        let store = Self { pool };
        store.init().await?;
        info!(url = db_url, "store connected");
        Ok(store)
    }

    /// In-memory store with the full schema. Used by tests and the analysis
    /// sandbox smoke-run.
    pub async fn connect_memory() -> Result<Self> {
        Self::connect("sqlite::memory:").await
    }

    async fn init(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .context("failed to apply schema")?;
        self.run_migrations().await?;
        self.run_special_migrations().await?;
        Ok(())
    }

    /// Additive column migrations, guarded by a table_info check.
    async fn run_migrations(&self) -> Result<()> {
        for (table, column, sql) in MIGRATIONS {
            if !self.column_exists(table, column).await? {
                sqlx::raw_sql(sql).execute(&self.pool).await?;
                info!(table, column, "store migration applied");
            }
        }
        Ok(())
    }

    /// Constraint changes SQLite can't ALTER: rebuild the positions table
    /// when it predates tags (UNIQUE(symbol) era). Existing rows are
    /// backfilled with deterministic auto-tags.
    async fn run_special_migrations(&self) -> Result<()> {
        if self.column_exists("positions", "tag").await? {
            return Ok(());
        }
        info!("store special migration: positions_add_tag");

        let rows = self.fetch_all("SELECT * FROM positions", &[]).await?;
        sqlx::raw_sql("DROP TABLE IF EXISTS positions")
            .execute(&self.pool)
            .await?;
        sqlx::raw_sql(
            r#"
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
            "#,
        )
        .execute(&self.pool)
        .await?;

        let mut counters: std::collections::HashMap<String, u32> = std::collections::HashMap::new();
        for row in &rows {
            let symbol = row.str_or("symbol", "");
            let n = counters.entry(symbol.clone()).or_insert(0);
            *n += 1;
            let tag = format!("auto_{}_{:03}", symbol.replace('/', ""), n);
            self.exec(
                "INSERT INTO positions \
                 (symbol, tag, side, qty, avg_entry, current_price, unrealized_pnl, \
                  entry_fee, stop_loss, take_profit, intent, strategy_version, opened_at, updated_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                &[
                    Value::from(symbol),
                    Value::from(tag),
                    Value::from(row.str_or("side", "long")),
                    Value::from(row.f64("qty")),
                    Value::from(row.f64("avg_entry")),
                    Value::from(row.f64("current_price")),
                    Value::from(row.f64("unrealized_pnl")),
                    Value::from(row.f64("entry_fee")),
                    row.get("stop_loss").cloned().unwrap_or(Value::Null),
                    row.get("take_profit").cloned().unwrap_or(Value::Null),
                    Value::from(row.str_or("intent", "DAY")),
                    row.get("strategy_version").cloned().unwrap_or(Value::Null),
                    row.get("opened_at").cloned().unwrap_or(Value::Null),
                    row.get("updated_at").cloned().unwrap_or(Value::Null),
                ],
            )
            .await?;
        }
        info!(backfilled = rows.len(), "positions_add_tag migration complete");
        Ok(())
    }

    async fn column_exists(&self, table: &str, column: &str) -> Result<bool> {
        let rows = self
            .fetch_all(&format!("PRAGMA table_info({table})"), &[])
            .await?;
        Ok(rows.iter().any(|r| r.str_or("name", "") == column))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Execute a statement; returns rows affected.
    pub async fn exec(&self, sql: &str, params: &[Value]) -> Result<u64> {
        let mut query = sqlx::query(sql);
        for p in params {
            query = bind_value(query, p);
        }
        let result = query
            .execute(&self.pool)
            .await
            .with_context(|| format!("store exec failed: {}", &sql[..sql.len().min(80)]))?;
        Ok(result.rows_affected())
    }

    pub async fn fetch_one(&self, sql: &str, params: &[Value]) -> Result<Option<JsonRow>> {
        let mut query = sqlx::query(sql);
        for p in params {
            query = bind_value(query, p);
        }
        let row = query.fetch_optional(&self.pool).await?;
        row.map(|r| row_to_json(&r)).transpose()
    }

    pub async fn fetch_all(&self, sql: &str, params: &[Value]) -> Result<Vec<JsonRow>> {
        let mut query = sqlx::query(sql);
        for p in params {
            query = bind_value(query, p);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(row_to_json).collect()
    }

    /// Append an activity-log row (rolling 90-day retention via the data
    /// store's pruning). Best-effort: failures only log.
    pub async fn log_activity(&self, category: &str, message: &str, detail: Option<&str>) {
        let result = self
            .exec(
                "INSERT INTO activity_log (category, message, detail) VALUES (?, ?, ?)",
                &[
                    Value::from(category),
                    Value::from(message),
                    detail.map(Value::from).unwrap_or(Value::Null),
                ],
            )
            .await;
        if let Err(e) = result {
            warn!(category, error = %e, "activity log write failed");
        }
    }

    /// Flush the WAL. Statements autocommit, so this only matters on the
    /// shutdown path.
    pub async fn commit(&self) -> Result<()> {
        sqlx::raw_sql("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .or_else(|e| {
                warn!(error = %e, "wal checkpoint failed");
                Ok(())
            })
    }

    pub async fn close(&self) {
        self.pool.close().await;
        info!("store closed");
    }
}

type SqliteQuery<'q> =
    sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>;

fn bind_value<'q>(query: SqliteQuery<'q>, value: &Value) -> SqliteQuery<'q> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(*b as i64),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                query.bind(i)
            } else {
                query.bind(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => query.bind(s.clone()),
        other => query.bind(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn schema_applies_and_is_idempotent() {
        let store = Store::connect_memory().await.unwrap();
        store.init().await.unwrap(); // second run must be a no-op
        let row = store
            .fetch_one("SELECT COUNT(*) as cnt FROM trades", &[])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.i64("cnt"), 0);
    }

    #[tokio::test]
    async fn exec_and_fetch_round_trip() {
        let store = Store::connect_memory().await.unwrap();
        store
            .exec(
                "INSERT INTO signals (symbol, action, size_pct, confidence, reasoning) \
                 VALUES (?, ?, ?, ?, ?)",
                &[
                    json!("BTC/USD"),
                    json!("BUY"),
                    json!(0.05),
                    json!(0.9),
                    json!("test"),
                ],
            )
            .await
            .unwrap();

        let row = store
            .fetch_one(
                "SELECT symbol, size_pct, acted_on FROM signals WHERE symbol = ?",
                &[json!("BTC/USD")],
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.str_or("symbol", ""), "BTC/USD");
        assert!((row.f64("size_pct") - 0.05).abs() < 1e-12);
        assert_eq!(row.i64("acted_on"), 0);
    }

    #[tokio::test]
    async fn null_params_bind_as_null() {
        let store = Store::connect_memory().await.unwrap();
        store
            .exec(
                "INSERT INTO positions (symbol, tag, qty, avg_entry, stop_loss) VALUES (?, ?, ?, ?, ?)",
                &[json!("ETH/USD"), json!("t1"), json!(1.0), json!(2000.0), Value::Null],
            )
            .await
            .unwrap();
        let row = store
            .fetch_one("SELECT stop_loss FROM positions WHERE tag = 't1'", &[])
            .await
            .unwrap()
            .unwrap();
        assert!(row.get("stop_loss").unwrap().is_null());
    }
}
