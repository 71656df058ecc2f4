//! SQL DDL for the relay database.

use rusqlite::Connection;
use tracing::{info, warn};

pub const SCHEMA_VERSION: u32 = 1;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS conversation_memory (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    uid TEXT NOT NULL,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);

CREATE INDEX IF NOT EXISTS idx_conversation_memory_uid_created
    ON conversation_memory(uid, created_at);

CREATE TABLE IF NOT EXISTS session_continuity (
    uid TEXT PRIMARY KEY,
    response_id TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS usage_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    uid TEXT NOT NULL,
    model TEXT NOT NULL,
    input_tokens INTEGER NOT NULL DEFAULT 0,
    output_tokens INTEGER NOT NULL DEFAULT 0,
    embedding_model TEXT,
    embedding_input_tokens INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_usage_records_uid ON usage_records(uid);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
"#;

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;

/// Per-role tables written by earlier deployments.
const LEGACY_TABLES: &[(&str, &str)] = &[("assistant_memory", "assistant"), ("user_memory", "user")];

/// One-time import of the legacy per-role tables.
///
/// Runs only while `conversation_memory` is empty. A failure is logged and
/// leaves the unified table untouched. Returns the number of imported rows.
pub fn migrate_legacy(conn: &Connection) -> usize {
    match try_migrate_legacy(conn) {
        Ok(0) => 0,
        Ok(imported) => {
            info!(imported, "imported legacy memory tables");
            imported
        }
        Err(e) => {
            warn!(error = %e, "legacy memory migration skipped");
            0
        }
    }
}

fn try_migrate_legacy(conn: &Connection) -> Result<usize, rusqlite::Error> {
    let existing: i64 =
        conn.query_row("SELECT COUNT(1) FROM conversation_memory", [], |row| row.get(0))?;
    if existing > 0 {
        return Ok(0);
    }

    let tx = conn.unchecked_transaction()?;
    let mut imported = 0;
    for (table, role) in LEGACY_TABLES {
        let present: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            [table],
            |row| row.get(0),
        )?;
        if !present {
            continue;
        }
        imported += tx.execute(
            &format!(
                "INSERT INTO conversation_memory (uid, role, content, created_at)
                 SELECT uid, '{role}', content, created_at FROM {table}"
            ),
            [],
        )?;
    }
    tx.commit()?;
    Ok(imported)
}
