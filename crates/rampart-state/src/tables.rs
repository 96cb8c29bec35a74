//! redb table definitions for the Rampart state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain
//! types). Composite keys follow the pattern `{parent}/{child}`.

use redb::TableDefinition;

/// Saved configuration maps keyed by a fixed slot name (`current`).
pub const CONFIG: TableDefinition<&str, &[u8]> = TableDefinition::new("config");

/// Known proxy instances keyed by `{name}`.
pub const INSTANCES: TableDefinition<&str, &[u8]> = TableDefinition::new("instances");

/// Plugin manifests keyed by `{plugin_id}`.
pub const PLUGINS: TableDefinition<&str, &[u8]> = TableDefinition::new("plugins");

/// Auxiliary configs keyed by `{type}/{site}/{name}` (`-` for no site).
pub const CUSTOM_CONFS: TableDefinition<&str, &[u8]> = TableDefinition::new("custom_confs");

/// Job run records keyed by `{plugin_id}/{job_name}/{started_at_ms}`.
pub const JOB_RUNS: TableDefinition<&str, &[u8]> = TableDefinition::new("job_runs");

/// Job cache files keyed by `{plugin_id}/{job_name}/{file_name}`.
pub const JOB_CACHE: TableDefinition<&str, &[u8]> = TableDefinition::new("job_cache");
