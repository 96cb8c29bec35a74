//! Configuration merge and validation.
//!
//! `Configurator::merge` seeds every descriptor's default, overlays the
//! operator-supplied overrides (validating each against the schema), and in
//! multisite mode synthesizes a fully populated `<site>_` namespace per
//! site. The output is a `BTreeMap` so two merges of the same inputs are
//! byte-identical regardless of input iteration order.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use tracing::warn;

use rampart_core::SettingContext;

use crate::schema::{Resolution, Schema};

/// The flat merged configuration: variable name to string value.
pub type ConfigMap = BTreeMap<String, String>;

/// Environment noise that is passed through by the platform but never a
/// setting; dropped without a warning.
const IGNORED_PREFIXES: &[&str] = &["_", "KUBERNETES_", "SVC_", "LB_"];
const IGNORED_VARS: &[&str] = &[
    "PATH", "HOME", "HOSTNAME", "LANG", "PWD", "OLDPWD", "SHLVL", "TZ", "TERM", "DOCKER_HOST",
];

/// Why an override key was dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WarnReason {
    /// No descriptor claims this name.
    UnknownKey,
    /// Site-prefixed override of a global-context descriptor.
    WrongContext,
    /// Value does not match the descriptor's pattern.
    PatternMismatch { value: String },
    /// Site name in `SERVER_NAME` (or a site's alias list) failed the
    /// server-name pattern.
    InvalidSiteName,
}

impl fmt::Display for WarnReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WarnReason::UnknownKey => write!(f, "variable name doesn't exist"),
            WarnReason::WrongContext => write!(f, "context isn't multisite"),
            WarnReason::PatternMismatch { value } => {
                write!(f, "value {value:?} doesn't match the setting pattern")
            }
            WarnReason::InvalidSiteName => write!(f, "invalid site name"),
        }
    }
}

/// One dropped override, with the exact key and reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeWarning {
    pub key: String,
    pub reason: WarnReason,
}

/// Result of a merge pass.
#[derive(Debug)]
pub struct MergeOutput {
    pub config: ConfigMap,
    /// Active sites, in `SERVER_NAME` order. Empty when not multisite.
    pub sites: Vec<String>,
    pub warnings: Vec<MergeWarning>,
}

/// Merges schema defaults with operator overrides.
pub struct Configurator<'a> {
    schema: &'a Schema,
    ignore_regex_check: bool,
}

impl<'a> Configurator<'a> {
    pub fn new(schema: &'a Schema) -> Self {
        Self {
            schema,
            ignore_regex_check: false,
        }
    }

    /// Debugging escape hatch: accept any override value without checking
    /// its pattern. Unknown-key and context checks still apply.
    pub fn ignore_regex_check(mut self, ignore: bool) -> Self {
        if ignore {
            warn!("setting pattern validation is disabled");
        }
        self.ignore_regex_check = ignore;
        self
    }

    /// Produce one validated configuration map from the overrides.
    /// Per-key problems are warnings, never errors: a bad value keeps the
    /// descriptor default and the merge always completes.
    pub fn merge(&self, overrides: &BTreeMap<String, String>) -> MergeOutput {
        let mut warnings = Vec::new();

        let multisite = self.effective(overrides, "MULTISITE") == "yes";
        let sites = if multisite {
            self.map_sites(overrides, &mut warnings)
        } else {
            Vec::new()
        };

        // Seed every descriptor's default.
        let mut config: ConfigMap = self
            .schema
            .settings()
            .iter()
            .map(|(name, setting)| (name.clone(), setting.default.clone()))
            .collect();

        // Overlay validated overrides.
        for (key, value) in overrides {
            if is_ignored(key) {
                continue;
            }
            // `SERVER_NAME` was already validated token by token during
            // site mapping; keep the surviving sites instead of judging
            // the list as a whole.
            if key == "SERVER_NAME" && multisite {
                if !sites.is_empty() {
                    config.insert(key.clone(), sites.join(" "));
                }
                continue;
            }
            match self.check_override(key, value, multisite, &sites) {
                Ok(()) => {
                    config.insert(key.clone(), value.clone());
                }
                Err(reason) => {
                    warn!(key = %key, reason = %reason, "ignoring variable");
                    warnings.push(MergeWarning {
                        key: key.clone(),
                        reason,
                    });
                }
            }
        }

        // Multisite expansion: every site gets the full multisite namespace.
        for site in &sites {
            for (name, setting) in self.schema.settings() {
                if setting.context != SettingContext::Multisite {
                    continue;
                }
                let key = format!("{site}_{name}");
                if config.contains_key(&key) {
                    continue;
                }
                let value = if name == "SERVER_NAME" {
                    site.clone()
                } else {
                    config.get(name).cloned().unwrap_or_default()
                };
                config.insert(key, value);
            }
        }

        MergeOutput {
            config,
            sites,
            warnings,
        }
    }

    /// Active site names from `SERVER_NAME`, validated against the
    /// server-name pattern. An invalid primary name skips only that site;
    /// an invalid alias list falls back to the primary alone.
    fn map_sites(
        &self,
        overrides: &BTreeMap<String, String>,
        warnings: &mut Vec<MergeWarning>,
    ) -> Vec<String> {
        let server_name = self.effective(overrides, "SERVER_NAME");
        let pattern = self.schema.pattern("SERVER_NAME");

        let mut sites = Vec::new();
        for site in server_name.split_whitespace() {
            let valid = self.ignore_regex_check
                || pattern.map(|rx| rx.is_match(site)).unwrap_or(true);
            if !valid {
                warn!(site = %site, "ignoring site because its name is not valid");
                warnings.push(MergeWarning {
                    key: site.to_string(),
                    reason: WarnReason::InvalidSiteName,
                });
                continue;
            }

            let alias_key = format!("{site}_SERVER_NAME");
            if let Some(aliases) = overrides.get(&alias_key) {
                let aliases_valid = self.ignore_regex_check
                    || pattern.map(|rx| rx.is_match(aliases.trim())).unwrap_or(true);
                if !aliases_valid {
                    warn!(key = %alias_key, "ignoring alias list because it is not valid");
                    warnings.push(MergeWarning {
                        key: alias_key,
                        reason: WarnReason::InvalidSiteName,
                    });
                }
            }

            sites.push(site.to_string());
        }
        sites
    }

    fn check_override(
        &self,
        key: &str,
        value: &str,
        multisite: bool,
        sites: &[String],
    ) -> Result<(), WarnReason> {
        let site_scope: &[String] = if multisite { sites } else { &[] };
        let name = match self.schema.resolve(key, site_scope) {
            Resolution::Global { name } => name,
            Resolution::Prefixed { name, .. } => {
                let setting = self.schema.get(name).ok_or(WarnReason::UnknownKey)?;
                if setting.context != SettingContext::Multisite {
                    return Err(WarnReason::WrongContext);
                }
                name
            }
            Resolution::Unknown => return Err(WarnReason::UnknownKey),
        };

        if !self.ignore_regex_check {
            if let Some(rx) = self.schema.pattern(name) {
                if !rx.is_match(value) {
                    return Err(WarnReason::PatternMismatch {
                        value: value.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Override value, or the descriptor default, or empty.
    fn effective(&self, overrides: &BTreeMap<String, String>, name: &str) -> String {
        overrides
            .get(name)
            .cloned()
            .or_else(|| self.schema.get(name).map(|s| s.default.clone()))
            .unwrap_or_default()
    }
}

fn is_ignored(key: &str) -> bool {
    IGNORED_PREFIXES.iter().any(|p| key.starts_with(p))
        || IGNORED_VARS.contains(&key)
        || key.contains("CUSTOM_CONF")
}

/// Read a `variable=value` line-oriented file into an override map.
/// Blank lines and `#` comments are skipped.
pub fn load_env_file(path: &Path) -> std::io::Result<BTreeMap<String, String>> {
    let content = std::fs::read_to_string(path)?;
    Ok(parse_env(&content))
}

/// Parse `variable=value` lines.
pub fn parse_env(content: &str) -> BTreeMap<String, String> {
    content
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                return None;
            }
            let (key, value) = line.split_once('=')?;
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}
