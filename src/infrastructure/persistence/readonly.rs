//! SELECT-only facade over the store.
//!
//! Analysis modules receive this instead of the raw `Store`. Every incoming
//! statement is normalized (NUL rejection, comment stripping, split on `;`)
//! and each sub-statement is checked against the write reject-list before it
//! touches the connection.

use anyhow::Result;
use serde_json::Value;

use crate::domain::errors::InvalidQuery;

use super::rows::JsonRow;
use super::schema::schema_description;
use super::store::Store;

/// Leading verbs that always indicate a write (or connection-level state
/// change). PRAGMA is handled separately: only assignments are blocked.
const WRITE_VERBS: &[&str] = &[
    "INSERT",
    "UPDATE",
    "DELETE",
    "DROP",
    "ALTER",
    "CREATE",
    "REPLACE",
    "ATTACH",
    "DETACH",
    "REINDEX",
    "VACUUM",
    "BEGIN",
    "COMMIT",
    "ROLLBACK",
    "SAVEPOINT",
    "RELEASE",
    "LOAD_EXTENSION",
];

/// Verbs that make a CTE a write when they appear anywhere after `WITH`.
const CTE_WRITE_VERBS: &[&str] = &[
    "INSERT",
    "UPDATE",
    "DELETE",
    "DROP",
    "ALTER",
    "CREATE",
    "REPLACE",
    "LOAD_EXTENSION",
];

#[derive(Clone)]
pub struct ReadOnlyStore {
    store: Store,
}

impl ReadOnlyStore {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub fn schema(&self) -> Value {
        schema_description()
    }

    pub async fn exec(&self, sql: &str, params: &[Value]) -> Result<u64> {
        check_readonly(sql)?;
        self.store.exec(sql, params).await
    }

    pub async fn fetch_one(&self, sql: &str, params: &[Value]) -> Result<Option<JsonRow>> {
        check_readonly(sql)?;
        self.store.fetch_one(sql, params).await
    }

    pub async fn fetch_all(&self, sql: &str, params: &[Value]) -> Result<Vec<JsonRow>> {
        check_readonly(sql)?;
        self.store.fetch_all(sql, params).await
    }
}

/// Reject anything that is not a plain read. Fail-closed: ambiguity is an
/// error, never a pass.
pub fn check_readonly(sql: &str) -> Result<(), InvalidQuery> {
    if sql.contains('\0') {
        return Err(InvalidQuery::new("statement contains NUL byte"));
    }

    let cleaned = strip_comments(sql);

    // load_extension() as a function call (e.g. SELECT load_extension(...))
    if contains_load_extension_call(&cleaned) {
        return Err(InvalidQuery::new(&cleaned));
    }

    for statement in cleaned.split(';') {
        let statement = statement.trim();
        if statement.is_empty() {
            continue;
        }
        let first = leading_word(statement);

        if first == "PRAGMA" {
            // PRAGMA reads are fine; assignments are not.
            if statement.contains('=') {
                return Err(InvalidQuery::new(statement));
            }
            continue;
        }

        if WRITE_VERBS.iter().any(|v| *v == first) {
            return Err(InvalidQuery::new(statement));
        }

        // CTE bypass: WITH ... INSERT/UPDATE/DELETE/...
        if first == "WITH" {
            let upper = statement.to_ascii_uppercase();
            for verb in CTE_WRITE_VERBS {
                if contains_word(&upper, verb) {
                    return Err(InvalidQuery::new(statement));
                }
            }
        }
    }

    Ok(())
}

/// Strip `--` line comments and `/* */` block comments, respecting
/// single-quoted string literals (with `''` escapes).
fn strip_comments(sql: &str) -> String {
    let bytes = sql.as_bytes();
    let mut out = String::with_capacity(sql.len());
    let mut i = 0;
    let mut in_string = false;

    while i < bytes.len() {
        let c = bytes[i] as char;
        if in_string {
            out.push(c);
            if c == '\'' {
                // '' escapes a quote inside the literal
                if i + 1 < bytes.len() && bytes[i + 1] as char == '\'' {
                    out.push('\'');
                    i += 2;
                    continue;
                }
                in_string = false;
            }
            i += 1;
            continue;
        }
        match c {
            '\'' => {
                in_string = true;
                out.push(c);
                i += 1;
            }
            '-' if i + 1 < bytes.len() && bytes[i + 1] as char == '-' => {
                while i < bytes.len() && bytes[i] as char != '\n' {
                    i += 1;
                }
            }
            '/' if i + 1 < bytes.len() && bytes[i + 1] as char == '*' => {
                i += 2;
                while i + 1 < bytes.len() && !(bytes[i] as char == '*' && bytes[i + 1] as char == '/') {
                    i += 1;
                }
                i = (i + 2).min(bytes.len());
                out.push(' ');
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

fn leading_word(statement: &str) -> String {
    statement
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect::<String>()
        .to_ascii_uppercase()
}

fn contains_word(upper: &str, word: &str) -> bool {
    let mut start = 0;
    while let Some(pos) = upper[start..].find(word) {
        let abs = start + pos;
        let before_ok = abs == 0
            || !upper.as_bytes()[abs - 1].is_ascii_alphanumeric()
                && upper.as_bytes()[abs - 1] != b'_';
        let end = abs + word.len();
        let after_ok = end >= upper.len()
            || !upper.as_bytes()[end].is_ascii_alphanumeric() && upper.as_bytes()[end] != b'_';
        if before_ok && after_ok {
            return true;
        }
        start = abs + 1;
    }
    false
}

fn contains_load_extension_call(cleaned: &str) -> bool {
    let lower = cleaned.to_ascii_lowercase();
    let mut start = 0;
    while let Some(pos) = lower[start..].find("load_extension") {
        let abs = start + pos;
        let rest = &lower[abs + "load_extension".len()..];
        if rest.trim_start().starts_with('(') {
            return true;
        }
        start = abs + 1;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selects_pass() {
        assert!(check_readonly("SELECT * FROM trades").is_ok());
        assert!(check_readonly("  select count(*) from signals  ").is_ok());
        assert!(check_readonly("WITH t AS (SELECT 1 AS x) SELECT x FROM t").is_ok());
        assert!(check_readonly("PRAGMA table_info(trades)").is_ok());
        assert!(check_readonly("EXPLAIN QUERY PLAN SELECT 1").is_ok());
    }

    #[test]
    fn write_verbs_rejected() {
        for sql in [
            "INSERT INTO trades (symbol) VALUES ('x')",
            "update trades set pnl = 0",
            "DELETE FROM trades",
            "DROP TABLE trades",
            "ALTER TABLE trades ADD COLUMN x TEXT",
            "CREATE TABLE evil (x)",
            "REPLACE INTO trades (symbol) VALUES ('x')",
            "ATTACH DATABASE '/tmp/x' AS evil",
            "BEGIN TRANSACTION",
            "VACUUM",
        ] {
            assert!(check_readonly(sql).is_err(), "should reject: {sql}");
        }
    }

    #[test]
    fn multi_statement_bypass_rejected() {
        assert!(check_readonly("SELECT 1; DROP TABLE trades").is_err());
        assert!(check_readonly("SELECT 1;;DELETE FROM trades").is_err());
    }

    #[test]
    fn comment_bypass_rejected() {
        assert!(check_readonly("/* hi */ DROP TABLE trades").is_err());
        assert!(check_readonly("-- comment\nDELETE FROM trades").is_err());
    }

    #[test]
    fn comments_inside_strings_do_not_hide_content() {
        // A literal containing "--" must not swallow the rest of the query
        assert!(check_readonly("SELECT '--' ; DROP TABLE trades").is_err());
        assert!(check_readonly("SELECT 'it''s -- fine' FROM trades").is_ok());
    }

    #[test]
    fn pragma_assignment_rejected() {
        assert!(check_readonly("PRAGMA journal_mode = DELETE").is_err());
        assert!(check_readonly("PRAGMA table_info(positions)").is_ok());
    }

    #[test]
    fn cte_terminal_write_rejected() {
        assert!(
            check_readonly("WITH t AS (SELECT 1) INSERT INTO trades (symbol) SELECT 'x' FROM t")
                .is_err()
        );
        assert!(check_readonly("WITH t AS (SELECT 1) DELETE FROM trades").is_err());
    }

    #[test]
    fn load_extension_call_rejected() {
        assert!(check_readonly("SELECT load_extension('evil.so')").is_err());
        assert!(check_readonly("SELECT load_extension ('evil.so')").is_err());
        // Column named load_extension_count is fine
        assert!(check_readonly("SELECT load_extension_count FROM trades").is_ok());
    }

    #[test]
    fn nul_byte_rejected() {
        assert!(check_readonly("SELECT 1\0; DROP TABLE trades").is_err());
    }

    #[test]
    fn error_fragment_is_truncated() {
        let long = format!("DELETE FROM trades WHERE symbol = '{}'", "x".repeat(200));
        let err = check_readonly(&long).unwrap_err();
        assert!(err.fragment.chars().count() <= 80);
    }

    #[tokio::test]
    async fn facade_blocks_writes_end_to_end() {
        let store = Store::connect_memory().await.unwrap();
        let ro = ReadOnlyStore::new(store.clone());
        assert!(ro.exec("DELETE FROM trades", &[]).await.is_err());
        assert!(ro.fetch_all("SELECT * FROM trades", &[]).await.is_ok());
        // Nothing was deleted because nothing could be
        assert!(store
            .fetch_one("SELECT COUNT(*) as c FROM trades", &[])
            .await
            .unwrap()
            .is_some());
    }
}
