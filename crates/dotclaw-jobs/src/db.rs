use std::path::Path;

use rusqlite::Connection;

use crate::error::Result;

/// Open the jobs database with WAL journaling and a 3-second busy timeout.
pub fn open(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.busy_timeout(std::time::Duration::from_secs(3))?;
    Ok(conn)
}

/// Initialise the jobs schema. Idempotent.
///
/// The `(status, priority, created_at)` index serves the claim query
/// directly; events and workflow steps are append-only children.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS background_jobs (
            id               TEXT    NOT NULL PRIMARY KEY,
            group_id         TEXT    NOT NULL,
            chat_id          TEXT    NOT NULL,
            prompt           TEXT    NOT NULL,
            context_mode     TEXT    NOT NULL DEFAULT 'group',
            status           TEXT    NOT NULL DEFAULT 'queued',
            timeout_ms       INTEGER,
            max_tool_steps   INTEGER,
            tool_policy_json TEXT,
            model_override   TEXT,
            priority         INTEGER NOT NULL DEFAULT 0,
            tags             TEXT    NOT NULL DEFAULT '[]',
            parent_trace_id  TEXT,
            created_at       INTEGER NOT NULL,
            updated_at       INTEGER NOT NULL,
            started_at       INTEGER,
            finished_at      INTEGER,            -- non-null iff terminal
            lease_expires_at INTEGER,            -- non-null iff running
            last_error       TEXT,
            result_summary   TEXT,
            output_path      TEXT,
            output_truncated INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_jobs_claim
            ON background_jobs (status, priority, created_at);

        CREATE TABLE IF NOT EXISTS background_job_events (
            id         INTEGER PRIMARY KEY AUTOINCREMENT,
            job_id     TEXT    NOT NULL REFERENCES background_jobs(id),
            level      TEXT    NOT NULL,   -- info | progress | warn | error
            message    TEXT    NOT NULL,
            created_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_job_events ON background_job_events (job_id, id);

        CREATE TABLE IF NOT EXISTS workflow_runs (
            id          TEXT    NOT NULL PRIMARY KEY,
            group_id    TEXT    NOT NULL,
            name        TEXT    NOT NULL,
            status      TEXT    NOT NULL DEFAULT 'running',
            aggregated  TEXT,
            created_at  INTEGER NOT NULL,
            finished_at INTEGER
        );

        CREATE TABLE IF NOT EXISTS workflow_step_results (
            id             INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id         TEXT    NOT NULL REFERENCES workflow_runs(id),
            name           TEXT    NOT NULL,
            job_id         TEXT,
            status         TEXT    NOT NULL,
            result_summary TEXT,
            last_error     TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_workflow_steps ON workflow_step_results (run_id, id);
        ",
    )?;
    Ok(())
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
}
