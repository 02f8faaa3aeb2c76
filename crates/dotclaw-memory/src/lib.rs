//! `dotclaw-memory` — scope-partitioned long-term memory on SQLite.
//!
//! # Overview
//!
//! Facts are content-addressed by their normalized text and partitioned by
//! `(group, scope, subject)`. Recall is hybrid: BM25 full-text (FTS5, probed
//! at init with a LIKE fallback) optionally blended with cosine similarity
//! from the embedding sidecar.
//!
//! | Module     | Contents                                               |
//! |------------|--------------------------------------------------------|
//! | `db`       | Schema, FTS5 capability probe, additive migrations     |
//! | `store`    | Upsert batches, search, hybrid recall, maintenance     |
//! | `behavior` | Preference projection into the typed behavior config   |
//! | `embed`    | Embedding client trait + HTTP sidecar implementation   |

pub mod behavior;
pub mod db;
pub mod embed;
pub mod error;
pub mod store;
pub mod types;

pub use behavior::{BehaviorConfig, ResponseStyle};
pub use embed::{cosine_similarity, run_backfill, EmbeddingClient, HttpEmbeddingClient};
pub use error::{MemoryError, Result};
pub use store::MemoryStore;
pub use types::{
    MemoryItem, MemoryKind, MemoryScope, MemoryStats, MemoryType, MemoryUpsert, RecallOutcome,
    RecallRequest, ScoredMemory,
};
