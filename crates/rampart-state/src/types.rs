//! Domain types persisted by the Rampart state store.
//!
//! These are the shared shapes the reconciler, scheduler and distribution
//! layer exchange through the store. All are JSON round-trippable.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

// ── Instances ─────────────────────────────────────────────────────

/// A running proxy instance, as discovered on the platform. Instances are
/// observed, never created, by the control plane.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Instance {
    /// Platform-level name (container, task or pod name).
    pub name: String,
    /// Address the distribution layer reaches the instance's API on.
    pub hostname: String,
    pub health: InstanceHealth,
    /// Environment the platform exposes on the instance.
    pub env: BTreeMap<String, String>,
}

/// Health as reported by the platform, not measured by us.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceHealth {
    Up,
    Down,
    Unknown,
}

// ── Auxiliary configs ─────────────────────────────────────────────

/// A user-supplied config fragment attached via platform labels or
/// annotations, dropped verbatim into the rendered tree.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CustomConf {
    /// Target folder, e.g. `server-http` or `modsec`.
    pub conf_type: String,
    /// Owning site, when site-scoped.
    pub site: Option<String>,
    pub name: String,
    pub data: String,
    /// Hex sha256 of `data`; snapshots compare by this digest.
    pub checksum: String,
}

// ── Job runs ──────────────────────────────────────────────────────

/// Outcome of one job process execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    /// Exit 0: ran fine, nothing changed.
    NoReloadNeeded,
    /// Exit 1: ran fine and mutated the artifact set.
    ReloadNeeded,
    /// Exit ≥ 2, or the process could not be spawned.
    Failed,
}

impl JobOutcome {
    pub fn is_success(self) -> bool {
        !matches!(self, JobOutcome::Failed)
    }
}

/// One recorded job execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobRun {
    pub plugin_id: String,
    pub job_name: String,
    pub outcome: JobOutcome,
    /// Unix timestamp in milliseconds when the process was spawned.
    pub started_at: u64,
    /// Unix timestamp in milliseconds when the process exited.
    pub ended_at: u64,
}

// ── Job cache ─────────────────────────────────────────────────────

/// A file a job produced and cached for distribution to instances.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheEntry {
    pub plugin_id: String,
    pub job_name: String,
    pub file_name: String,
    pub data: Vec<u8>,
    /// Hex sha256 of `data`.
    pub checksum: String,
    /// Unix timestamp in milliseconds of the last write.
    pub updated_at: u64,
}

impl CustomConf {
    /// Composite key for the custom confs table; `-` marks the global
    /// scope so keys stay prefix-scannable by type.
    pub fn table_key(&self) -> String {
        format!(
            "{}/{}/{}",
            self.conf_type,
            self.site.as_deref().unwrap_or("-"),
            self.name
        )
    }
}

impl JobRun {
    /// Composite key for the job runs table.
    pub fn table_key(&self) -> String {
        format!("{}/{}/{}", self.plugin_id, self.job_name, self.started_at)
    }
}

impl CacheEntry {
    /// Composite key for the job cache table.
    pub fn table_key(&self) -> String {
        format!("{}/{}/{}", self.plugin_id, self.job_name, self.file_name)
    }
}
