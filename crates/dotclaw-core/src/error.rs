use thiserror::Error;

#[derive(Debug, Error)]
pub enum DotclawError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Path error: {0}")]
    Path(String),

    #[error("Invalid timestamp: {0}")]
    Timestamp(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DotclawError {
    /// Short stable code string recorded in traces and run logs.
    pub fn code(&self) -> &'static str {
        match self {
            DotclawError::Config(_) => "CONFIG_ERROR",
            DotclawError::Path(_) => "PATH_ERROR",
            DotclawError::Timestamp(_) => "TIMESTAMP_ERROR",
            DotclawError::Serialization(_) => "SERIALIZATION_ERROR",
            DotclawError::Io(_) => "IO_ERROR",
            DotclawError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, DotclawError>;
