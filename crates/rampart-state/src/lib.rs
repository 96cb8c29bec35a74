//! rampart-state — embedded state store for Rampart.
//!
//! Backed by [redb](https://docs.rs/redb), persists the last saved
//! configuration, the known instance set, auxiliary configs, job runs and
//! job cache entries.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{plugin}/{job}`, `{type}/{site}/{name}`) enable prefix
//! scans for related records.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks. Write transactions that fail with
//! a transient storage error are retried once before the error surfaces.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
