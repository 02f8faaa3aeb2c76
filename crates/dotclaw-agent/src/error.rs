use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    /// All models in the chain are exhausted or cooling down.
    #[error("No model available: {0}")]
    NoModelAvailable(String),

    /// Waited too long for an execution slot.
    #[error("Agent queue timeout after {ms}ms")]
    QueueTimeout { ms: u64 },

    /// The semaphore was torn down while waiting.
    #[error("Agent admission closed")]
    AdmissionClosed,

    /// Terminal container failure (after failover).
    #[error("Agent run failed: {0}")]
    RunFailed(String),

    #[error("Streaming error: {0}")]
    Stream(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AgentError>;
