use thiserror::Error;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Embedding service error: {0}")]
    Embedding(String),

    #[error("Invalid memory input: {0}")]
    InvalidInput(String),
}

pub type Result<T> = std::result::Result<T, MemoryError>;
