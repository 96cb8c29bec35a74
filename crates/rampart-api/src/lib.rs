//! rampart-api — the distribution layer.
//!
//! One [`Api`] client per proxy instance, and an [`ApiCaller`] that fans a
//! request out to every instance. Fan-out never aborts early: every
//! instance is attempted and the caller gets a single aggregate success
//! flag, so one unreachable instance does not hide the state of the rest.

pub mod api;
pub mod caller;
pub mod error;

pub use api::Api;
pub use caller::ApiCaller;
pub use error::{ApiError, ApiResult};
