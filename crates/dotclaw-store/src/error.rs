use thiserror::Error;

/// Errors from the durable chat store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The referenced row does not exist.
    #[error("Not found: {what}")]
    NotFound { what: String },
}

pub type Result<T> = std::result::Result<T, StoreError>;
