//! Error types for the shard management core

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ShardError>;

#[derive(Error, Debug)]
pub enum ShardError {
    #[error("Backing store unavailable: {0}")]
    Unavailable(String),

    #[error("Topology contention: {0}")]
    Contention(String),

    #[error("Internal consistency fault: {0}")]
    InvariantViolation(String),

    #[error("Operation cancelled by stop signal")]
    Cancelled,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Topology not found for {0}")]
    TopologyNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ShardError {
    /// Get a stable error code for callers that map errors to responses
    pub fn code(&self) -> &'static str {
        match self {
            ShardError::Unavailable(_) => "STORE_UNAVAILABLE",
            ShardError::Contention(_) => "TOPOLOGY_CONTENTION",
            ShardError::InvariantViolation(_) => "INVARIANT_VIOLATION",
            ShardError::Cancelled => "CANCELLED",
            ShardError::Config(_) => "INVALID_CONFIG",
            ShardError::TopologyNotFound(_) => "TOPOLOGY_NOT_FOUND",
            _ => "INTERNAL_ERROR",
        }
    }

    /// Whether the caller may retry the same operation.
    ///
    /// The core never retries on its own; retry policy belongs to the
    /// caller or the backing-store client.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ShardError::Unavailable(_) | ShardError::Contention(_))
    }

    /// Whether this error reports a broken topology invariant.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ShardError::InvariantViolation(_))
    }
}
