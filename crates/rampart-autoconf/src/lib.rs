//! rampart-autoconf — the fleet state reconciler.
//!
//! Watches a deployment platform for changes to the desired state (proxy
//! instances, site definitions, auxiliary configs), re-derives a full
//! snapshot on every wake-up and runs the apply pipeline when the snapshot
//! differs from the last applied one. Events are only wake-up signals; the
//! snapshot is always computed from the platform's total current state, so
//! the loop self-heals from missed or out-of-order events.
//!
//! Four backends implement the same [`Backend`] trait: standalone (one
//! static instance, settings from local files), docker (labels on
//! containers), swarm (labels on services plus native config objects) and
//! kubernetes (annotations on pods, ingress routing rules, configmaps).

pub mod backend;
pub mod docker;
pub mod kubernetes;
pub mod labels;
pub mod reconciler;
pub mod snapshot;
pub mod standalone;
pub mod swarm;

pub use backend::{Backend, BackendError, BackendEvent, BackendResult};
pub use reconciler::{ApplyPipeline, Reconciler};
pub use snapshot::{ServiceConf, Snapshot};
