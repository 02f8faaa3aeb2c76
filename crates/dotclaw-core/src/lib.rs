//! `dotclaw-core` — shared foundation for the dotclaw host.
//!
//! # Overview
//!
//! Everything the domain crates have in common lives here:
//!
//! | Module      | Contents                                                  |
//! |-------------|-----------------------------------------------------------|
//! | `config`    | Typed runtime config (JSON file + `DOTCLAW_*` env)        |
//! | `error`     | Top-level error enum with stable error codes              |
//! | `paths`     | Install home, derived directories, sandbox path mapping   |
//! | `timeparse` | Zoned local-time parsing and timezone validation          |
//! | `port`      | Traits for the external collaborators (chat, container)   |

pub mod config;
pub mod error;
pub mod paths;
pub mod port;
pub mod timeparse;

pub use config::RuntimeConfig;
pub use error::{DotclawError, Result};
pub use paths::InstallPaths;
pub use port::{
    ChatPort, ContainerOutput, ContainerRequest, ContainerRunner, ContainerStatus, Lane,
    MessageRef, PortError, ReasoningEffort, SandboxSpec,
};

/// Epoch milliseconds for "now". Single call site so tests can reason about it.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
