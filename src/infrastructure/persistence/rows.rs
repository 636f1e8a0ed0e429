//! Dynamic row representation for the store facade.
//!
//! SQLite is dynamically typed, and facade consumers (analysis modules, the
//! orchestrator context builder) work with whatever columns a query returns,
//! so rows surface as JSON maps keyed by column name.

use anyhow::Result;
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Row, TypeInfo, ValueRef};

pub type JsonRow = serde_json::Map<String, Value>;

pub fn row_to_json(row: &SqliteRow) -> Result<JsonRow> {
    let mut out = JsonRow::new();
    for col in row.columns() {
        let i = col.ordinal();
        let raw = row.try_get_raw(i)?;
        let value = if raw.is_null() {
            Value::Null
        } else {
            match raw.type_info().name() {
                "INTEGER" | "BOOLEAN" => Value::from(row.try_get::<i64, _>(i)?),
                "REAL" => Value::from(row.try_get::<f64, _>(i)?),
                "BLOB" => Value::from(hex::encode(row.try_get::<Vec<u8>, _>(i)?)),
                _ => Value::from(row.try_get::<String, _>(i)?),
            }
        };
        out.insert(col.name().to_string(), value);
    }
    Ok(out)
}

/// Typed accessors with the lenient defaults the original row dicts had.
pub trait RowExt {
    fn f64(&self, key: &str) -> f64;
    fn opt_f64(&self, key: &str) -> Option<f64>;
    fn i64(&self, key: &str) -> i64;
    fn str_or(&self, key: &str, default: &str) -> String;
    fn opt_str(&self, key: &str) -> Option<String>;
}

impl RowExt for JsonRow {
    fn f64(&self, key: &str) -> f64 {
        self.opt_f64(key).unwrap_or(0.0)
    }

    fn opt_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(Value::as_f64)
    }

    fn i64(&self, key: &str) -> i64 {
        self.get(key).and_then(Value::as_i64).unwrap_or(0)
    }

    fn str_or(&self, key: &str, default: &str) -> String {
        self.opt_str(key).unwrap_or_else(|| default.to_string())
    }

    fn opt_str(&self, key: &str) -> Option<String> {
        self.get(key).and_then(Value::as_str).map(str::to_string)
    }
}
