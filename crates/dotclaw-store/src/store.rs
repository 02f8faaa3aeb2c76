use std::sync::Mutex;

use rusqlite::Connection;
use tracing::{debug, instrument};

use crate::db::init_db;
use crate::error::{Result, StoreError};
use crate::types::*;

/// Thread-safe store for chats, messages, cursors, tool audit, and group
/// sessions.
///
/// Wraps a single SQLite connection in a `Mutex`; SQLite serialises writers
/// internally and WAL keeps readers off the write lock.
pub struct ChatStore {
    db: Mutex<Connection>,
}

impl ChatStore {
    /// Wrap a connection, initialising the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    /// Create-or-touch a chat. The display name only overwrites when the
    /// incoming one is non-empty; `last_activity_ts` never moves backwards.
    pub fn upsert_chat(&self, id: &str, display_name: &str, ts: i64) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO chats (id, display_name, last_activity_ts)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET
               display_name     = CASE WHEN excluded.display_name != ''
                                       THEN excluded.display_name
                                       ELSE display_name END,
               last_activity_ts = MAX(last_activity_ts, excluded.last_activity_ts)",
            rusqlite::params![id, display_name, ts],
        )?;
        Ok(())
    }

    /// Fetch one chat by id.
    pub fn chat(&self, id: &str) -> Result<Chat> {
        let db = self.db.lock().unwrap();
        db.query_row(
            "SELECT id, display_name, last_activity_ts FROM chats WHERE id = ?1",
            rusqlite::params![id],
            |row| {
                Ok(Chat {
                    id: row.get(0)?,
                    display_name: row.get(1)?,
                    last_activity_ts: row.get(2)?,
                })
            },
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound {
                what: format!("chat {id}"),
            },
            other => StoreError::Database(other),
        })
    }

    /// Persist a batch of incoming messages in one transaction, creating or
    /// touching their chats. Duplicate `(msg_id, chat_id)` rows are ignored.
    /// Returns the number of newly inserted rows.
    #[instrument(skip(self, batch), fields(count = batch.len()))]
    pub fn record_messages(&self, batch: &[NewMessage]) -> Result<usize> {
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        let mut inserted = 0usize;
        for msg in batch {
            tx.execute(
                "INSERT INTO chats (id, display_name, last_activity_ts)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET
                   display_name     = CASE WHEN excluded.display_name != ''
                                           THEN excluded.display_name
                                           ELSE display_name END,
                   last_activity_ts = MAX(last_activity_ts, excluded.last_activity_ts)",
                rusqlite::params![msg.chat_id, msg.sender_name, msg.ts],
            )?;
            inserted += tx.execute(
                "INSERT OR IGNORE INTO messages
                 (msg_id, chat_id, sender_id, sender_name, body, ts, from_self)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    msg.msg_id,
                    msg.chat_id,
                    msg.sender_id,
                    msg.sender_name,
                    msg.body,
                    msg.ts,
                    msg.from_self as i64,
                ],
            )?;
        }
        tx.commit()?;
        debug!(inserted, "message batch persisted");
        Ok(inserted)
    }

    /// User-input messages strictly after the cursor, in `(ts, numeric id)`
    /// order. Ties on `ts` break by numeric `msg_id` comparison so
    /// millisecond-collision timestamps still yield a total order.
    pub fn messages_since(&self, chat_id: &str, cursor: &ChatCursor) -> Result<Vec<StoredMessage>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT msg_id, chat_id, sender_id, sender_name, body, ts, from_self
             FROM messages
             WHERE chat_id = ?1 AND from_self = 0
               AND (ts > ?2 OR (ts = ?2 AND CAST(msg_id AS INTEGER) > CAST(?3 AS INTEGER)))
             ORDER BY ts, CAST(msg_id AS INTEGER)",
        )?;
        let rows = stmt.query_map(
            rusqlite::params![chat_id, cursor.last_seen_ts, cursor.last_seen_msg_id],
            row_to_message,
        )?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Current cursor for a chat; the zero cursor when none is stored yet.
    pub fn cursor(&self, chat_id: &str) -> Result<ChatCursor> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            "SELECT chat_id, last_seen_ts, last_seen_msg_id
             FROM chat_state WHERE chat_id = ?1",
            rusqlite::params![chat_id],
            |row| {
                Ok(ChatCursor {
                    chat_id: row.get(0)?,
                    last_seen_ts: row.get(1)?,
                    last_seen_msg_id: row.get(2)?,
                })
            },
        ) {
            Ok(c) => Ok(c),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(ChatCursor {
                chat_id: chat_id.to_string(),
                last_seen_ts: 0,
                last_seen_msg_id: "0".to_string(),
            }),
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    /// Advance the cursor to `(ts, msg_id)`. Strictly monotonic — a stale
    /// candidate (at or behind the stored cursor) is a no-op, so concurrent
    /// batches can race without rewinding the bookmark.
    pub fn advance_cursor(&self, chat_id: &str, ts: i64, msg_id: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO chat_state (chat_id, last_seen_ts, last_seen_msg_id)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(chat_id) DO UPDATE SET
               last_seen_ts     = excluded.last_seen_ts,
               last_seen_msg_id = excluded.last_seen_msg_id
             WHERE excluded.last_seen_ts > last_seen_ts
                OR (excluded.last_seen_ts = last_seen_ts
                    AND CAST(excluded.last_seen_msg_id AS INTEGER)
                        > CAST(last_seen_msg_id AS INTEGER))",
            rusqlite::params![chat_id, ts, msg_id],
        )?;
        Ok(())
    }

    /// Append one tool-audit row. Callers treat failures as non-fatal.
    pub fn record_tool_audit(&self, entry: &ToolAuditEntry) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO tool_audit
             (trace_id, chat_id, group_id, user_id, tool_name, ok,
              duration_ms, error, created_at, source)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            rusqlite::params![
                entry.trace_id,
                entry.chat_id,
                entry.group,
                entry.user_id,
                entry.tool_name,
                entry.ok as i64,
                entry.duration_ms,
                entry.error,
                entry.created_at,
                entry.source,
            ],
        )?;
        Ok(())
    }

    /// Audit rows for one trace, oldest first.
    pub fn audit_for_trace(&self, trace_id: &str) -> Result<Vec<ToolAuditEntry>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT trace_id, chat_id, group_id, user_id, tool_name, ok,
                    duration_ms, error, created_at, source
             FROM tool_audit WHERE trace_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(rusqlite::params![trace_id], row_to_audit)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Per-tool reliability over the `window` most-recent audit rows of a
    /// group: success rate and mean duration, highest-traffic tools first.
    pub fn tool_reliability(&self, group: &str, window: u32) -> Result<Vec<ToolReliability>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT tool_name,
                    COUNT(*)                       AS total,
                    AVG(CAST(ok AS REAL))          AS success_rate,
                    AVG(CAST(duration_ms AS REAL)) AS avg_duration_ms
             FROM (SELECT tool_name, ok, duration_ms
                   FROM tool_audit
                   WHERE group_id = ?1
                   ORDER BY created_at DESC
                   LIMIT ?2)
             GROUP BY tool_name
             ORDER BY total DESC",
        )?;
        let rows = stmt.query_map(rusqlite::params![group, window], |row| {
            Ok(ToolReliability {
                tool_name: row.get(0)?,
                total: row.get::<_, i64>(1)? as u32,
                success_rate: row.get(2)?,
                avg_duration_ms: row.get(3)?,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Delete audit rows created before `cutoff`. Returns rows removed.
    pub fn purge_tool_audit_before(&self, cutoff: i64) -> Result<usize> {
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "DELETE FROM tool_audit WHERE created_at < ?1",
            rusqlite::params![cutoff],
        )?;
        Ok(n)
    }

    /// Register (or replace) the active session for a group.
    pub fn set_group_session(&self, group: &str, session_id: &str, now: i64) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO group_sessions (group_id, session_id, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(group_id) DO UPDATE SET
               session_id = excluded.session_id,
               updated_at = excluded.updated_at",
            rusqlite::params![group, session_id, now],
        )?;
        Ok(())
    }

    /// The active session for a group, if any.
    pub fn group_session(&self, group: &str) -> Result<Option<GroupSession>> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            "SELECT group_id, session_id, updated_at FROM group_sessions WHERE group_id = ?1",
            rusqlite::params![group],
            |row| {
                Ok(GroupSession {
                    group: row.get(0)?,
                    session_id: row.get(1)?,
                    updated_at: row.get(2)?,
                })
            },
        ) {
            Ok(s) => Ok(Some(s)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::Database(e)),
        }
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredMessage> {
    Ok(StoredMessage {
        msg_id: row.get(0)?,
        chat_id: row.get(1)?,
        sender_id: row.get(2)?,
        sender_name: row.get(3)?,
        body: row.get(4)?,
        ts: row.get(5)?,
        from_self: row.get::<_, i64>(6)? != 0,
    })
}

fn row_to_audit(row: &rusqlite::Row<'_>) -> rusqlite::Result<ToolAuditEntry> {
    Ok(ToolAuditEntry {
        trace_id: row.get(0)?,
        chat_id: row.get(1)?,
        group: row.get(2)?,
        user_id: row.get(3)?,
        tool_name: row.get(4)?,
        ok: row.get::<_, i64>(5)? != 0,
        duration_ms: row.get(6)?,
        error: row.get(7)?,
        created_at: row.get(8)?,
        source: row.get(9)?,
    })
}
