//! `dotclaw-scheduler` — time-based dispatch of scheduled tasks.
//!
//! # Overview
//!
//! Tasks are persisted to a SQLite `scheduled_tasks` table with a run log.
//! The [`engine::SchedulerEngine`] polls for due tasks, executes each on the
//! scheduled lane through a [`TaskRunner`], and records the outcome. Failures
//! retry with exponential backoff up to a cap, then the task completes with
//! its last error.
//!
//! # Schedule kinds
//!
//! | Kind       | Value                  | Behaviour                             |
//! |------------|------------------------|---------------------------------------|
//! | `cron`     | cron expression        | Next fire computed in the task's zone |
//! | `interval` | milliseconds           | `last_run + interval`                 |
//! | `once`     | timestamp (zone-aware) | Single fire, then `completed`         |

pub mod db;
pub mod engine;
pub mod error;
pub mod schedule;
pub mod types;

pub use engine::{SchedulerEngine, TaskRunner};
pub use error::{Result, SchedulerError};
pub use types::{ContextMode, NewTask, ScheduleSpec, ScheduledTask, TaskRunLog, TaskStatus};
