//! Settings schema — the merged descriptor table.
//!
//! The schema is assembled from a base settings file plus one `plugin.json`
//! per feature module. Later sources may add descriptors but never redefine
//! a name already claimed; a collision is a schema error, not a silent
//! override. Descriptor regexes are compiled once here so merge passes do
//! no recompilation.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use regex::Regex;
use thiserror::Error;
use tracing::{debug, warn};

use rampart_core::{ManifestError, Plugin, Setting};

/// Result alias for schema operations.
pub type SchemaResult<T> = Result<T, SchemaError>;

/// Errors raised while assembling the schema. All are fatal: a schema that
/// failed to load cannot be trusted downstream.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("failed to read base settings {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse base settings {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("setting {name} from plugin {plugin} collides with an existing descriptor")]
    Collision { name: String, plugin: String },

    #[error("base settings declare no descriptors")]
    Empty,
}

/// How an override key resolved against the schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution<'a> {
    /// Exact descriptor, or `NAME_<n>` match on a repeatable descriptor.
    Global { name: &'a str },
    /// `<site>_NAME` match; site is one of the active sites.
    Prefixed { site: String, name: &'a str },
    /// No descriptor claims this key.
    Unknown,
}

/// The merged, immutable descriptor table.
#[derive(Debug)]
pub struct Schema {
    settings: BTreeMap<String, Setting>,
    /// Compiled descriptor regexes; `None` when a descriptor's pattern
    /// itself failed to compile (checked is then skipped, with a warning
    /// already emitted at load time).
    patterns: HashMap<String, Option<Regex>>,
    plugins: Vec<Plugin>,
}

impl Schema {
    /// Load the base settings file plus every `*/plugin.json` under each
    /// plugin directory. Any malformed source or descriptor collision is
    /// fatal.
    pub fn load(settings_path: &Path, plugin_dirs: &[PathBuf]) -> SchemaResult<Self> {
        let content =
            std::fs::read_to_string(settings_path).map_err(|source| SchemaError::Read {
                path: settings_path.to_path_buf(),
                source,
            })?;
        let settings: BTreeMap<String, Setting> =
            serde_json::from_str(&content).map_err(|source| SchemaError::Parse {
                path: settings_path.to_path_buf(),
                source,
            })?;
        if settings.is_empty() {
            return Err(SchemaError::Empty);
        }

        let mut schema = Schema {
            settings,
            patterns: HashMap::new(),
            plugins: Vec::new(),
        };

        for dir in plugin_dirs {
            for manifest in manifest_paths(dir) {
                let plugin = Plugin::from_file(&manifest)?;
                schema.absorb(plugin)?;
            }
        }

        schema.compile_patterns();
        debug!(
            descriptors = schema.settings.len(),
            plugins = schema.plugins.len(),
            "schema loaded"
        );
        Ok(schema)
    }

    /// Build a schema from already-parsed parts (for tests and callers
    /// holding plugins from the store).
    pub fn from_parts(
        settings: BTreeMap<String, Setting>,
        plugins: Vec<Plugin>,
    ) -> SchemaResult<Self> {
        if settings.is_empty() {
            return Err(SchemaError::Empty);
        }
        let mut schema = Schema {
            settings,
            patterns: HashMap::new(),
            plugins: Vec::new(),
        };
        for plugin in plugins {
            schema.absorb(plugin)?;
        }
        schema.compile_patterns();
        Ok(schema)
    }

    fn absorb(&mut self, plugin: Plugin) -> SchemaResult<()> {
        for (name, setting) in &plugin.settings {
            if self.settings.contains_key(name) {
                return Err(SchemaError::Collision {
                    name: name.clone(),
                    plugin: plugin.id.clone(),
                });
            }
            self.settings.insert(name.clone(), setting.clone());
        }
        self.plugins.push(plugin);
        Ok(())
    }

    fn compile_patterns(&mut self) {
        for (name, setting) in &self.settings {
            let compiled = match Regex::new(&setting.regex) {
                Ok(rx) => Some(rx),
                Err(e) => {
                    warn!(setting = %name, error = %e, "descriptor regex does not compile, skipping validation for it");
                    None
                }
            };
            self.patterns.insert(name.clone(), compiled);
        }
    }

    /// Look up a descriptor by exact name.
    pub fn get(&self, name: &str) -> Option<&Setting> {
        self.settings.get(name)
    }

    /// Compiled pattern for a descriptor, when its regex was valid.
    pub fn pattern(&self, name: &str) -> Option<&Regex> {
        self.patterns.get(name).and_then(|p| p.as_ref())
    }

    /// All descriptors, in name order.
    pub fn settings(&self) -> &BTreeMap<String, Setting> {
        &self.settings
    }

    /// The plugins absorbed into this schema, in load order.
    pub fn plugins(&self) -> &[Plugin] {
        &self.plugins
    }

    /// Resolve an override key against the schema per the matching rules:
    /// exact descriptor name, `NAME_<n>` on a repeatable descriptor, or a
    /// `<site>_` prefixed form of either.
    pub fn resolve<'a>(&'a self, key: &str, sites: &[String]) -> Resolution<'a> {
        if let Some(name) = self.resolve_bare(key) {
            return Resolution::Global { name };
        }
        for site in sites {
            if let Some(rest) = key.strip_prefix(&format!("{site}_")) {
                if let Some(name) = self.resolve_bare(rest) {
                    return Resolution::Prefixed {
                        site: site.clone(),
                        name,
                    };
                }
            }
        }
        Resolution::Unknown
    }

    fn resolve_bare(&self, key: &str) -> Option<&str> {
        if let Some((name, _)) = self.settings.get_key_value(key) {
            return Some(name);
        }
        // NAME_<n> on a repeatable descriptor.
        let (base, suffix) = key.rsplit_once('_')?;
        if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let (name, setting) = self.settings.get_key_value(base)?;
        setting.multiple.as_ref().map(|_| name.as_str())
    }
}

fn manifest_paths(dir: &Path) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    let Ok(entries) = std::fs::read_dir(dir) else {
        return paths;
    };
    for entry in entries.flatten() {
        let manifest = entry.path().join("plugin.json");
        if manifest.is_file() {
            paths.push(manifest);
        }
    }
    // Deterministic load order regardless of directory iteration order.
    paths.sort();
    paths
}
