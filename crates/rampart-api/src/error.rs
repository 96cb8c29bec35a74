//! Error types for the distribution layer.

use thiserror::Error;

/// Result type alias for distribution operations.
pub type ApiResult<T> = Result<T, ApiError>;

/// Errors raised by the per-instance client.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("failed to build http client: {0}")]
    Client(reqwest::Error),

    #[error("request to {endpoint}{path} failed: {source}")]
    Request {
        endpoint: String,
        path: String,
        source: reqwest::Error,
    },

    #[error("request to {endpoint}{path} returned status {status}")]
    Status {
        endpoint: String,
        path: String,
        status: u16,
    },

    #[error("failed to archive {path}: {source}")]
    Archive {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
}
