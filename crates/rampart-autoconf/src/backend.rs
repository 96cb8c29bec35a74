//! The platform backend seam.
//!
//! A backend knows how to list the platform's current objects and how to
//! watch for changes. Watching only yields wake-up signals; the reconciler
//! always re-derives the full snapshot through the list operations.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use rampart_state::{CustomConf, Instance};

use crate::snapshot::ServiceConf;

/// Result alias for backend operations.
pub type BackendResult<T> = Result<T, BackendError>;

/// Errors raised while talking to a deployment platform.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("platform request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("platform returned status {status} for {url}")]
    Api { url: String, status: u16 },

    #[error("failed to decode platform payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("failed to read {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[error("event stream for {stream} ended")]
    StreamClosed { stream: &'static str },
}

/// A wake-up signal from a platform event stream. Carries only the stream
/// name for logging; the payload is never inspected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendEvent {
    pub stream: &'static str,
}

/// One deployment platform.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Short name for logs (`standalone`, `docker`, `swarm`, `kubernetes`).
    fn name(&self) -> &'static str;

    /// The proxy instances currently running on the platform.
    async fn list_instances(&self) -> BackendResult<Vec<Instance>>;

    /// The site definitions currently declared on the platform.
    async fn list_services(&self) -> BackendResult<Vec<ServiceConf>>;

    /// The auxiliary configs currently attached on the platform.
    async fn list_aux_configs(&self) -> BackendResult<Vec<CustomConf>>;

    /// Follow the platform's event stream(s), sending one [`BackendEvent`]
    /// per relevant change. Returns when the stream ends or the receiver
    /// is dropped; the reconciler restarts it.
    async fn watch(&self, tx: mpsc::Sender<BackendEvent>) -> BackendResult<()>;
}
