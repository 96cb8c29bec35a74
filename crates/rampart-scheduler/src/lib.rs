//! rampart-scheduler — plugin background jobs.
//!
//! Builds a job table from the plugin manifests, runs every job once at
//! boot, then drives periodic jobs from a deadline loop. A job is re-armed
//! only after its previous run completes, so two runs of one job never
//! overlap. When a tick leaves any job asking for a reload, the scheduler
//! performs exactly one coordinated reload: cache push to the remote
//! instances, then a reload signal to all of them.

pub mod jobs;
pub mod scheduler;

pub use jobs::{Job, JobTable};
pub use scheduler::{Scheduler, TickReport};
