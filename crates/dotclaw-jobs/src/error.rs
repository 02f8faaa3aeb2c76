use thiserror::Error;

/// Errors from the background-job subsystem.
#[derive(Debug, Error)]
pub enum JobError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No job with the given ID exists.
    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    /// The requested model override is not on the allowlist.
    #[error("Model not permitted: {model}")]
    ModelNotPermitted { model: String },
}

pub type Result<T> = std::result::Result<T, JobError>;
