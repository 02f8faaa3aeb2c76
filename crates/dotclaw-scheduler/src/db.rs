use std::path::Path;

use rusqlite::Connection;

use crate::error::Result;

/// Open the scheduler database with WAL journaling and a 3-second busy
/// timeout.
pub fn open(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.busy_timeout(std::time::Duration::from_secs(3))?;
    Ok(conn)
}

/// Initialise the scheduler schema in `conn`. Idempotent.
///
/// The `(next_run, status)` index keeps the due-task poll cheap even with
/// thousands of rows; run logs cascade-delete with their task.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS scheduled_tasks (
            id             TEXT    NOT NULL PRIMARY KEY,
            group_id       TEXT    NOT NULL,
            chat_id        TEXT    NOT NULL,
            prompt         TEXT    NOT NULL,
            schedule_kind  TEXT    NOT NULL,   -- cron | once | interval
            schedule_value TEXT    NOT NULL,
            context_mode   TEXT    NOT NULL DEFAULT 'group',
            timezone       TEXT    NOT NULL DEFAULT 'UTC',
            next_run       INTEGER,            -- epoch millis, NULL when exhausted
            last_run       INTEGER,
            last_result    TEXT,
            state          TEXT,               -- opaque JSON carried between runs
            retry_count    INTEGER NOT NULL DEFAULT 0,
            last_error     TEXT,
            status         TEXT    NOT NULL DEFAULT 'active',
            created_at     INTEGER NOT NULL,
            updated_at     INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_tasks_due ON scheduled_tasks (next_run, status);

        CREATE TABLE IF NOT EXISTS task_run_logs (
            id      INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id TEXT    NOT NULL REFERENCES scheduled_tasks(id),
            run_at  INTEGER NOT NULL,
            ok      INTEGER NOT NULL,
            result  TEXT,
            error   TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_task_logs ON task_run_logs (task_id, run_at);
        ",
    )?;
    Ok(())
}
