//! rampart-core — shared domain types for the Rampart control plane.
//!
//! Defines the `plugin.json` manifest model (plugin identity, setting
//! descriptors, job specs), manifest validation, and the content hashing
//! helpers used for cache checksums and auxiliary-config digests.

pub mod hash;
pub mod plugin;

pub use plugin::{
    JobEvery, JobSpec, ManifestError, Plugin, Setting, SettingContext, SettingKind,
};
