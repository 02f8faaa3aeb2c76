use std::path::Path;

use rusqlite::Connection;
use tracing::warn;

use crate::error::Result;

/// Open the memory database with WAL journaling and a 3-second busy timeout.
pub fn open(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.busy_timeout(std::time::Duration::from_secs(3))?;
    Ok(conn)
}

/// Initialise the memory schema. Returns whether FTS5 is available — the
/// probe attempts to create the virtual table and downgrades to LIKE search
/// when the build lacks the extension.
pub fn init_db(conn: &Connection) -> Result<bool> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS memory_items (
            id               TEXT    NOT NULL PRIMARY KEY,
            group_id         TEXT    NOT NULL,
            scope            TEXT    NOT NULL,
            subject_id       TEXT,
            type             TEXT    NOT NULL,
            kind             TEXT    NOT NULL,
            conflict_key     TEXT,
            content          TEXT    NOT NULL,
            normalized       TEXT    NOT NULL,
            tags_text        TEXT    NOT NULL DEFAULT '[]',
            importance       REAL    NOT NULL DEFAULT 0.5,
            confidence       REAL    NOT NULL DEFAULT 0.8,
            created_at       INTEGER NOT NULL,
            updated_at       INTEGER NOT NULL,
            last_accessed_at INTEGER,
            expires_at       INTEGER,
            source           TEXT,
            metadata         TEXT,
            embedding        TEXT            -- JSON array of f32, NULL until indexed
        );
        CREATE INDEX IF NOT EXISTS idx_memory_partition
            ON memory_items (group_id, scope, subject_id);
        CREATE INDEX IF NOT EXISTS idx_memory_conflict
            ON memory_items (group_id, scope, subject_id, type, conflict_key);

        CREATE TABLE IF NOT EXISTS memory_sources (
            id         TEXT    NOT NULL PRIMARY KEY,
            group_id   TEXT    NOT NULL,
            type       TEXT    NOT NULL,
            path       TEXT    NOT NULL,
            hash       TEXT    NOT NULL,
            indexed_at INTEGER NOT NULL,
            UNIQUE (group_id, path)
        );

        CREATE TABLE IF NOT EXISTS memory_meta (
            key   TEXT NOT NULL PRIMARY KEY,
            value TEXT NOT NULL
        );
        ",
    )?;

    Ok(probe_fts(conn))
}

/// Capability probe: try to create the FTS5 index. External-content table
/// over `memory_items`' implicit rowid, synced manually on every write.
fn probe_fts(conn: &Connection) -> bool {
    let res = conn.execute_batch(
        "CREATE VIRTUAL TABLE IF NOT EXISTS memory_fts
            USING fts5(normalized, tags_text,
                       content='memory_items', content_rowid='rowid');",
    );
    match res {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "FTS5 unavailable, memory search falls back to LIKE");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent_and_reports_fts() {
        let conn = Connection::open_in_memory().unwrap();
        // Bundled SQLite ships FTS5; the probe should succeed.
        assert!(init_db(&conn).unwrap());
        assert!(init_db(&conn).unwrap());
    }
}
