//! `dotclaw-host` — composition root for the chat-assistant host.
//!
//! # Overview
//!
//! Wires the domain crates into the per-request control flow: ingest →
//! cursor advance → turn hygiene → context build → lane admission →
//! container dispatch with streaming → telemetry and audit. Failures are
//! classified, cooled down, and humanized before anything reaches the chat.
//!
//! | Module        | Contents                                              |
//! |---------------|-------------------------------------------------------|
//! | `hygiene`     | Message sanitation, dedup, tool-envelope normalizing  |
//! | `maintenance` | Periodic retention enforcement across all stores      |
//! | `pipeline`    | The interactive request path and engine adapters      |

pub mod hygiene;
pub mod maintenance;
pub mod pipeline;

pub use maintenance::MaintenanceLoop;
pub use pipeline::{Host, JobExecutorAdapter, TaskRunnerAdapter};

/// Initialise tracing for the host process. `RUST_LOG` wins; the default
/// keeps dotclaw crates at info.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,dotclaw=debug"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
