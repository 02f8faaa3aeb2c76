//! `dotclaw-agent` — per-request agent plumbing.
//!
//! # Overview
//!
//! Everything between an accepted message and a container run:
//!
//! | Module      | Contents                                                  |
//! |-------------|-----------------------------------------------------------|
//! | `semaphore` | Lane-aware admission control with starvation protection   |
//! | `policy`    | Layered tool-policy merge and per-run budgets             |
//! | `registry`  | Model routing precedence and capability lookup            |
//! | `context`   | Per-request `AgentContext` assembly                       |
//! | `failover`  | Error classification, cooldown registry, chain selection  |
//! | `humanize`  | Technical error → user-facing message mapping             |
//! | `stream`    | Chunk-file watcher and rate-limited chat delivery         |
//! | `dispatch`  | Container dispatch path binding the pieces together       |

pub mod context;
pub mod dispatch;
pub mod error;
pub mod failover;
pub mod humanize;
pub mod policy;
pub mod registry;
pub mod semaphore;
pub mod stream;

pub use context::{AgentContext, ContextBuilder, ContextRequest};
pub use dispatch::{AgentService, DispatchRequest};
pub use error::{AgentError, Result};
pub use failover::{
    choose_next_model, classify_error, CooldownRegistry, ErrorCategory, FailoverEnvelope,
};
pub use humanize::{humanize_error, severity, Severity};
pub use policy::{effective_tool_policy, ToolBudgetTracker, ToolPolicy};
pub use registry::ModelRegistry;
pub use semaphore::{LaneSemaphore, Permit, SemaphoreConfig};
pub use stream::{ChunkEvent, ChunkWatcher, StreamDelivery};
