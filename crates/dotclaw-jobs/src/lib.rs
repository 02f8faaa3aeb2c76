//! `dotclaw-jobs` — persistent background-job engine and orchestration.
//!
//! # Overview
//!
//! Jobs live in a SQLite queue with lease-based claim: the engine polls,
//! sweeps expired leases to `timed_out`, atomically claims the best queued
//! row (`priority DESC, created_at ASC`), and spawns a runner per claim.
//! Runners observe cancellation through both the database and an in-process
//! [`CancellationToken`](tokio_util::sync::CancellationToken); terminal
//! states are absorbing and a job id is never re-run.
//!
//! Orchestration fans out N sub-jobs with bounded concurrency, polls them to
//! completion under a deadline, and optionally runs one aggregation pass.
//!
//! | Module        | Contents                                            |
//! |---------------|-----------------------------------------------------|
//! | `db`          | Jobs, events, and workflow-run schema               |
//! | `store`       | Enqueue, atomic claim, lease sweep, events, finish  |
//! | `engine`      | Claim loop, runner lifecycle, progress, delivery    |
//! | `orchestrate` | Fan-out / polling join / aggregation                |

pub mod db;
pub mod engine;
pub mod error;
pub mod orchestrate;
pub mod store;
pub mod types;

pub use engine::{JobEngine, JobExecutor};
pub use error::{JobError, Result};
pub use orchestrate::{OrchestrationOutput, OrchestrationRequest, SubTask, SubTaskResult};
pub use store::JobStore;
pub use types::{BackgroundJob, EventLevel, JobEvent, JobStatus, NewJob};
