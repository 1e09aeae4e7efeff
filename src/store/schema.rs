// src/store/schema.rs
//! SQLite schema shared by the capture and control processes
//!
//! Both processes run [`init_schema`] on open; every statement is idempotent
//! so whichever process starts first creates the tables.

use crate::utils::errors::{EngineError, Result};
use rusqlite::Connection;
use std::time::Duration;

/// Current schema version, stored in `PRAGMA user_version`
pub const SCHEMA_VERSION: i64 = 2;

/// Settings key holding the intercept-mode flag
pub const INTERCEPT_MODE_KEY: &str = "intercept_mode";

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS flows (
    seq          INTEGER PRIMARY KEY AUTOINCREMENT,
    flow_id      TEXT NOT NULL UNIQUE,
    method       TEXT NOT NULL,
    host         TEXT NOT NULL,
    port         INTEGER,
    path         TEXT NOT NULL,
    request      BLOB NOT NULL,
    response     BLOB,
    status       INTEGER,
    state        TEXT NOT NULL,
    edited       INTEGER NOT NULL DEFAULT 0,
    note         TEXT,
    captured_at  INTEGER NOT NULL,
    decided_at   INTEGER,
    completed_at INTEGER
);

CREATE INDEX IF NOT EXISTS idx_flows_state_seq ON flows(state, seq);

CREATE TABLE IF NOT EXISTS pending_commands (
    flow_id     TEXT PRIMARY KEY REFERENCES flows(flow_id),
    kind        TEXT NOT NULL CHECK (kind IN ('forward', 'drop')),
    edited      BLOB,
    issued_at   INTEGER NOT NULL,
    consumed_at INTEGER,
    rejected_at INTEGER
);

CREATE TABLE IF NOT EXISTS settings (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

INSERT OR IGNORE INTO settings (key, value) VALUES ('intercept_mode', 'false');
"#;

/// Per-connection pragmas needed for two-process access
pub fn configure_connection(conn: &Connection, busy_timeout: Duration) -> Result<()> {
    conn.busy_timeout(busy_timeout)?;
    conn.pragma_update(None, "foreign_keys", true)?;
    Ok(())
}

/// Switch the database file to WAL. The mode is persistent, so this runs
/// once per open rather than per connection.
pub fn enable_wal(conn: &Connection) -> Result<()> {
    let mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    if !mode.eq_ignore_ascii_case("wal") {
        tracing::debug!("journal_mode is {} (WAL unavailable)", mode);
    }
    Ok(())
}

/// Create tables and check the schema version
pub fn init_schema(conn: &Connection) -> Result<()> {
    let version: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    if version > SCHEMA_VERSION {
        return Err(EngineError::StoreUnavailable(format!(
            "store schema version {} is newer than supported version {}",
            version, SCHEMA_VERSION
        )));
    }

    conn.execute_batch(SCHEMA)?;

    // Version 1 stores predate edit rejection tracking
    if version == 1 {
        conn.execute_batch("ALTER TABLE pending_commands ADD COLUMN rejected_at INTEGER;")?;
    }

    if version < SCHEMA_VERSION {
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    }

    Ok(())
}
