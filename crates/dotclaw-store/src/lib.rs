//! `dotclaw-store` — durable chat state on SQLite.
//!
//! # Overview
//!
//! Owns the conversational tables: chats, messages, per-chat cursors, the
//! append-only tool audit, and the per-group session registry. Writes go
//! through [`ChatStore`], which wraps a WAL-mode connection in a `Mutex`.
//! Multi-row writes run in one transaction.
//!
//! Cursor semantics: `(ts, numeric msg_id)` is the total order per chat.
//! `messages_since` and `advance_cursor` both break millisecond-collision
//! ties by comparing `CAST(msg_id AS INTEGER)`.

pub mod db;
pub mod error;
pub mod snapshot;
pub mod store;
pub mod types;

pub use error::{Result, StoreError};
pub use store::ChatStore;
pub use types::{
    Chat, ChatCursor, GroupSession, NewMessage, StoredMessage, ToolAuditEntry, ToolReliability,
};
