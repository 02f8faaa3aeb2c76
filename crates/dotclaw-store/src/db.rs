use std::path::Path;

use rusqlite::Connection;

use crate::error::Result;

/// Open the store database with WAL journaling and a 3-second busy timeout.
pub fn open(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.busy_timeout(std::time::Duration::from_secs(3))?;
    Ok(conn)
}

/// Initialise the chat-store schema. Safe to call on every startup.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS chats (
            id               TEXT    NOT NULL PRIMARY KEY,
            display_name     TEXT    NOT NULL DEFAULT '',
            last_activity_ts INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS messages (
            msg_id      TEXT    NOT NULL,
            chat_id     TEXT    NOT NULL,
            sender_id   TEXT    NOT NULL,
            sender_name TEXT    NOT NULL DEFAULT '',
            body        TEXT    NOT NULL,
            ts          INTEGER NOT NULL,   -- epoch millis
            from_self   INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (msg_id, chat_id)
        );
        CREATE INDEX IF NOT EXISTS idx_messages_ts ON messages (ts);

        CREATE TABLE IF NOT EXISTS chat_state (
            chat_id          TEXT    NOT NULL PRIMARY KEY,
            last_seen_ts     INTEGER NOT NULL DEFAULT 0,
            last_seen_msg_id TEXT    NOT NULL DEFAULT '0'
        );

        CREATE TABLE IF NOT EXISTS tool_audit (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            trace_id    TEXT    NOT NULL,
            chat_id     TEXT,
            group_id    TEXT    NOT NULL,
            user_id     TEXT,
            tool_name   TEXT    NOT NULL,
            ok          INTEGER NOT NULL,
            duration_ms INTEGER NOT NULL DEFAULT 0,
            error       TEXT,
            created_at  INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_tool_audit_trace ON tool_audit (trace_id);
        CREATE INDEX IF NOT EXISTS idx_tool_audit_group ON tool_audit (group_id, created_at);

        CREATE TABLE IF NOT EXISTS group_sessions (
            group_id   TEXT    NOT NULL PRIMARY KEY,
            session_id TEXT    NOT NULL,
            updated_at INTEGER NOT NULL
        );
        ",
    )?;

    // Additive migrations for databases created before these columns existed.
    add_column(conn, "tool_audit", "source TEXT")?;
    add_column(conn, "chats", "display_name TEXT NOT NULL DEFAULT ''")?;
    Ok(())
}

/// Attempt `ALTER TABLE ... ADD COLUMN`, treating "duplicate column" as
/// success. Schemas only ever grow — columns are never renamed or dropped.
pub fn add_column(conn: &Connection, table: &str, column_def: &str) -> Result<()> {
    match conn.execute(&format!("ALTER TABLE {table} ADD COLUMN {column_def}"), []) {
        Ok(_) => Ok(()),
        Err(e) if e.to_string().contains("duplicate column name") => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        init_db(&conn).unwrap();
    }

    #[test]
    fn add_column_ignores_duplicates() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        add_column(&conn, "chats", "display_name TEXT NOT NULL DEFAULT ''").unwrap();
    }
}
