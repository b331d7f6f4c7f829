//! SQLite schema and connection pragmas.

use rusqlite::Connection;
use std::time::Duration;

/// Apply pragmas to every pooled connection.
///
/// WAL lets readers proceed while a write commits; `busy_timeout` turns
/// short write contention into a wait instead of `SQLITE_BUSY`.
pub fn apply_pragmas(conn: &Connection) -> rusqlite::Result<()> {
    // journal_mode reports the resulting mode as a row.
    let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.execute_batch(
        r#"
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        "#,
    )
}

/// Create tables and indexes if they do not exist.
pub fn initialize_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id           TEXT PRIMARY KEY,
            display_name TEXT NOT NULL DEFAULT '',
            role         TEXT NOT NULL DEFAULT 'USER',
            active       INTEGER NOT NULL DEFAULT 1
        );

        CREATE TABLE IF NOT EXISTS auth_tokens (
            token   TEXT PRIMARY KEY,
            user_id TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS notifications (
            id         TEXT PRIMARY KEY,
            user_id    TEXT NOT NULL,
            kind       TEXT NOT NULL,
            title      TEXT NOT NULL,
            message    TEXT NOT NULL,
            related_id TEXT,
            read       INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_notifications_user_unread
            ON notifications (user_id, read, created_at DESC);
        "#,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialize_schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        initialize_schema(&conn).unwrap();
        initialize_schema(&conn).unwrap();

        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 3);
    }
}
