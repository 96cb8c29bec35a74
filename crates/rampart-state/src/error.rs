//! Error types for the Rampart state store.

use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),
}

impl StateError {
    /// A transient condition worth one retry: another writer holds the
    /// store and has not committed yet.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StateError::Transaction(msg) | StateError::Write(msg)
                if msg.contains("busy") || msg.contains("lock")
        )
    }
}
