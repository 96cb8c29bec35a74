//! Plugin manifest model and validation.
//!
//! Every feature module ships a `plugin.json` describing its identity, the
//! setting descriptors it contributes to the schema, and the background
//! jobs it declares. Manifests are validated structurally on load; an
//! invalid manifest is rejected as a whole so a half-trusted plugin never
//! contributes settings or jobs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

static PLUGIN_ID_RX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\w.-]{1,64}$").unwrap());
static SETTING_ID_RX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z0-9_]{1,256}$").unwrap());
static NAME_RX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[\w.-]{1,128}$").unwrap());
// The Unicode `\w` class repeated up to 256 times overflows the regex
// crate's default 10MB compiled-size limit, so this one needs a larger cap.
static JOB_FILE_RX: LazyLock<Regex> = LazyLock::new(|| {
    regex::RegexBuilder::new(r"^[\w./-]{1,256}$")
        .size_limit(32 * 1024 * 1024)
        .build()
        .unwrap()
});

/// Errors produced while loading or validating a plugin manifest.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read manifest {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse manifest {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("invalid manifest for plugin {plugin}: {reason}")]
    Invalid { plugin: String, reason: String },
}

/// Scope of a setting descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettingContext {
    /// One value per deployment.
    Global,
    /// One value per site, overridable with the `<site>_` prefix.
    Multisite,
}

/// Rendering/input kind of a setting. Drives UI hints and nothing else in
/// the core, but kinds outside this set are rejected at load time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettingKind {
    Text,
    Check,
    Select,
    Password,
}

/// One setting descriptor as declared in a plugin manifest.
///
/// The descriptor name is the key in [`Plugin::settings`]; it is not
/// repeated inside the value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Setting {
    pub context: SettingContext,
    pub default: String,
    #[serde(default)]
    pub help: String,
    #[serde(default)]
    pub label: String,
    pub regex: String,
    #[serde(rename = "type")]
    pub kind: SettingKind,
    /// Group key marking the setting as repeatable (`NAME_1`, `NAME_2`, …).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multiple: Option<String>,
    /// Allowed values for `select` kind settings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub select: Option<Vec<String>>,
}

/// Schedule granularity of a background job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobEvery {
    Once,
    Minute,
    Hour,
    Day,
    Week,
}

impl JobEvery {
    /// Recurrence interval, or `None` for one-shot jobs.
    pub fn interval(self) -> Option<Duration> {
        match self {
            JobEvery::Once => None,
            JobEvery::Minute => Some(Duration::from_secs(60)),
            JobEvery::Hour => Some(Duration::from_secs(60 * 60)),
            JobEvery::Day => Some(Duration::from_secs(24 * 60 * 60)),
            JobEvery::Week => Some(Duration::from_secs(7 * 24 * 60 * 60)),
        }
    }
}

/// One background job declared by a plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,
    /// Executable path relative to the plugin's `jobs/` directory.
    pub file: String,
    pub every: JobEvery,
    /// Whether a successful run can warrant a fleet-wide reload.
    pub reload: bool,
    /// Jobs flagged async have no cross-instance side effects and may run
    /// concurrently with their siblings.
    #[serde(default, rename = "async")]
    pub run_async: bool,
}

/// A loaded feature module manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plugin {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub version: String,
    #[serde(default)]
    pub settings: BTreeMap<String, Setting>,
    #[serde(default)]
    pub jobs: Vec<JobSpec>,
    /// Directory the manifest was loaded from. Not part of the manifest.
    #[serde(skip)]
    pub path: PathBuf,
}

impl Plugin {
    /// Load and validate a `plugin.json` manifest.
    pub fn from_file(path: &Path) -> Result<Self, ManifestError> {
        let content = std::fs::read_to_string(path).map_err(|source| ManifestError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut plugin: Plugin =
            serde_json::from_str(&content).map_err(|source| ManifestError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        plugin.path = path.parent().unwrap_or(Path::new(".")).to_path_buf();
        plugin.validate()?;
        Ok(plugin)
    }

    /// Structural validation of identity, settings, and jobs.
    pub fn validate(&self) -> Result<(), ManifestError> {
        let invalid = |reason: String| ManifestError::Invalid {
            plugin: self.id.clone(),
            reason,
        };

        if !PLUGIN_ID_RX.is_match(&self.id) {
            return Err(invalid(format!("invalid plugin id {:?}", self.id)));
        }
        if self.name.is_empty() || self.name.len() > 128 {
            return Err(invalid("plugin name must be 1-128 characters".into()));
        }
        if self.description.len() > 256 {
            return Err(invalid("plugin description exceeds 256 characters".into()));
        }

        for (name, setting) in &self.settings {
            if !SETTING_ID_RX.is_match(name) {
                return Err(invalid(format!("invalid setting name {name:?}")));
            }
            if setting.default.len() > 4096 {
                return Err(invalid(format!("default for {name} exceeds 4096 characters")));
            }
            if setting.regex.len() > 1024 {
                return Err(invalid(format!("regex for {name} exceeds 1024 characters")));
            }
            if let Some(group) = &setting.multiple {
                if !NAME_RX.is_match(group) {
                    return Err(invalid(format!("invalid multiple group for {name}")));
                }
            }
            if let Some(choices) = &setting.select {
                if let Some(bad) = choices.iter().find(|c| c.len() > 256) {
                    return Err(invalid(format!(
                        "select value {bad:?} for {name} exceeds 256 characters"
                    )));
                }
            }
        }

        for job in &self.jobs {
            if !NAME_RX.is_match(&job.name) {
                return Err(invalid(format!("invalid job name {:?}", job.name)));
            }
            if !JOB_FILE_RX.is_match(&job.file) || job.file.contains("..") {
                return Err(invalid(format!("invalid job file {:?}", job.file)));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(json: &str) -> Result<Plugin, ManifestError> {
        let mut plugin: Plugin = serde_json::from_str(json).unwrap();
        plugin.path = PathBuf::from("/tmp/test-plugin");
        plugin.validate().map(|_| plugin)
    }

    const MINIMAL: &str = r#"{
        "id": "blocklist",
        "name": "Blocklist",
        "version": "1.0",
        "settings": {
            "USE_BLOCKLIST": {
                "context": "multisite",
                "default": "yes",
                "regex": "^(yes|no)$",
                "type": "check"
            }
        },
        "jobs": [
            {"name": "blocklist-download", "file": "download.sh", "every": "hour", "reload": true}
        ]
    }"#;

    #[test]
    fn minimal_manifest_parses() {
        let plugin = manifest(MINIMAL).unwrap();
        assert_eq!(plugin.id, "blocklist");
        assert_eq!(plugin.settings.len(), 1);
        let setting = &plugin.settings["USE_BLOCKLIST"];
        assert_eq!(setting.context, SettingContext::Multisite);
        assert_eq!(setting.kind, SettingKind::Check);
        assert_eq!(plugin.jobs[0].every, JobEvery::Hour);
        assert!(plugin.jobs[0].reload);
        assert!(!plugin.jobs[0].run_async);
    }

    #[test]
    fn invalid_plugin_id_rejected() {
        let bad = MINIMAL.replace("\"blocklist\"", "\"bad plugin!\"");
        assert!(matches!(manifest(&bad), Err(ManifestError::Invalid { .. })));
    }

    #[test]
    fn lowercase_setting_name_rejected() {
        let bad = MINIMAL.replace("USE_BLOCKLIST", "use_blocklist");
        assert!(matches!(manifest(&bad), Err(ManifestError::Invalid { .. })));
    }

    #[test]
    fn job_file_traversal_rejected() {
        let bad = MINIMAL.replace("download.sh", "../../etc/passwd");
        assert!(matches!(manifest(&bad), Err(ManifestError::Invalid { .. })));
    }

    #[test]
    fn unknown_context_fails_parse() {
        let bad = MINIMAL.replace("\"multisite\"", "\"galactic\"");
        let parsed: Result<Plugin, _> = serde_json::from_str(&bad);
        assert!(parsed.is_err());
    }

    #[test]
    fn job_every_intervals() {
        assert_eq!(JobEvery::Once.interval(), None);
        assert_eq!(JobEvery::Minute.interval(), Some(Duration::from_secs(60)));
        assert_eq!(
            JobEvery::Week.interval(),
            Some(Duration::from_secs(7 * 24 * 60 * 60))
        );
    }

    #[test]
    fn from_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plugin.json");
        std::fs::write(&path, MINIMAL).unwrap();

        let plugin = Plugin::from_file(&path).unwrap();
        assert_eq!(plugin.path, dir.path());
        assert_eq!(plugin.jobs.len(), 1);
    }

    #[test]
    fn from_file_missing_is_read_error() {
        let err = Plugin::from_file(Path::new("/nonexistent/plugin.json")).unwrap_err();
        assert!(matches!(err, ManifestError::Read { .. }));
    }
}
