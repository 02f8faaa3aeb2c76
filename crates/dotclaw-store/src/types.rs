use serde::{Deserialize, Serialize};

/// One chat (a conversation surface). Created on first sighting, never
/// destroyed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chat {
    pub id: String,
    pub display_name: String,
    pub last_activity_ts: i64,
}

/// Message as it arrives from the messaging adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMessage {
    pub msg_id: String,
    pub chat_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub body: String,
    /// Epoch milliseconds.
    pub ts: i64,
    /// Bot-originated messages are stored but excluded from user-input queries.
    pub from_self: bool,
}

/// Message as read back from the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub msg_id: String,
    pub chat_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub body: String,
    pub ts: i64,
    pub from_self: bool,
}

impl From<StoredMessage> for NewMessage {
    fn from(m: StoredMessage) -> Self {
        Self {
            msg_id: m.msg_id,
            chat_id: m.chat_id,
            sender_id: m.sender_id,
            sender_name: m.sender_name,
            body: m.body,
            ts: m.ts,
            from_self: m.from_self,
        }
    }
}

/// Per-chat bookmark over the `(ts, numeric msg_id)` total order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatCursor {
    pub chat_id: String,
    pub last_seen_ts: i64,
    pub last_seen_msg_id: String,
}

/// Append-only record of one tool invocation inside an agent run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolAuditEntry {
    pub trace_id: String,
    pub chat_id: Option<String>,
    pub group: String,
    pub user_id: Option<String>,
    pub tool_name: String,
    pub ok: bool,
    pub duration_ms: i64,
    pub error: Option<String>,
    pub created_at: i64,
    pub source: Option<String>,
}

/// Sliding-window projection of the audit table for one tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolReliability {
    pub tool_name: String,
    pub total: u32,
    pub success_rate: f64,
    pub avg_duration_ms: f64,
}

/// The single active conversation handle for one group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupSession {
    pub group: String,
    pub session_id: String,
    pub updated_at: i64,
}
