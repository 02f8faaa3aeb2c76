use thiserror::Error;

/// Errors from the scheduled-task subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The schedule kind/value pair cannot be interpreted.
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    /// No task with the given ID exists in the store.
    #[error("Task not found: {id}")]
    TaskNotFound { id: String },
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
