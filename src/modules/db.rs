use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;

use crate::error::AppResult;

/// Open (or create) a SQLite database shared between gateway instances
pub fn open_connection(path: &Path) -> AppResult<Connection> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let conn = Connection::open(path)?;
    // Other processes may hold the write lock briefly
    conn.busy_timeout(Duration::from_secs(5))?;
    // journal_mode answers with the resulting mode, so it needs the checking variant
    let _mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    Ok(conn)
}

/// Append-only audit table
pub fn init_audit_schema(conn: &Connection) -> AppResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS audit_log (
            seq               INTEGER PRIMARY KEY AUTOINCREMENT,
            id                TEXT NOT NULL UNIQUE,
            request_id        TEXT NOT NULL,
            timestamp         TEXT NOT NULL,
            action            TEXT NOT NULL,
            category          TEXT NOT NULL,
            channel           TEXT NOT NULL,
            masked_subject_id TEXT,
            outcome           TEXT NOT NULL,
            attempts          INTEGER NOT NULL,
            cache_hit         INTEGER NOT NULL,
            duration_ms       INTEGER NOT NULL,
            tenant_id         TEXT,
            actor             TEXT,
            context           TEXT NOT NULL,
            prev_hash         TEXT NOT NULL,
            hash              TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_audit_category_time
            ON audit_log (category, timestamp);
        CREATE TRIGGER IF NOT EXISTS audit_log_no_update
            BEFORE UPDATE ON audit_log
            BEGIN SELECT RAISE(ABORT, 'audit_log is append-only'); END;
        CREATE TRIGGER IF NOT EXISTS audit_log_no_delete
            BEFORE DELETE ON audit_log
            BEGIN SELECT RAISE(ABORT, 'audit_log is append-only'); END;",
    )?;
    Ok(())
}

/// Sliding-window timestamps, one row per admitted call
pub fn init_window_schema(conn: &Connection) -> AppResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS rate_window (
            channel      TEXT NOT NULL,
            admitted_ms  INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_rate_window_channel
            ON rate_window (channel, admitted_ms);",
    )?;
    Ok(())
}
