//! Desired-state snapshots.
//!
//! A snapshot is everything the platform currently wants: the instance
//! set, one settings map per site, and the auxiliary configs. Snapshots
//! compare by structural equality (aux configs through their sha256
//! digests), and only the last *applied* snapshot is ever retained.

use std::collections::BTreeMap;

use rampart_state::{CustomConf, Instance};

/// Per-site settings extracted from the platform, unprefixed. Must carry
/// `SERVER_NAME`; everything else is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceConf {
    pub settings: BTreeMap<String, String>,
}

impl ServiceConf {
    pub fn new(settings: BTreeMap<String, String>) -> Self {
        Self { settings }
    }

    /// The site's primary name: first token of its `SERVER_NAME`.
    pub fn first_server(&self) -> Option<&str> {
        self.settings
            .get("SERVER_NAME")
            .and_then(|s| s.split_whitespace().next())
    }
}

/// Full desired state derived from one collection pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub instances: Vec<Instance>,
    pub services: Vec<ServiceConf>,
    pub aux_configs: Vec<CustomConf>,
}

impl Snapshot {
    /// True once the platform exposes something worth reconciling. The
    /// bootstrap barrier blocks until this holds.
    pub fn is_reconcilable(&self) -> bool {
        !self.instances.is_empty() && !self.services.is_empty()
    }

    /// Normalize ordering so equal desired states compare equal no matter
    /// what order the platform listed the objects in.
    pub fn normalize(&mut self) {
        self.instances.sort_by(|a, b| a.name.cmp(&b.name));
        self.services.sort_by(|a, b| {
            a.first_server()
                .unwrap_or_default()
                .cmp(b.first_server().unwrap_or_default())
        });
        self.aux_configs.sort_by_key(CustomConf::table_key);
    }

    /// Flatten the snapshot into the override map the configurator merges:
    /// instance environments as globals, each site's settings under its
    /// primary name's prefix, `SERVER_NAME` rebuilt from the site list.
    /// Discovered fleets are always multisite.
    pub fn merged_overrides(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        for instance in &self.instances {
            for (key, value) in &instance.env {
                env.insert(key.clone(), value.clone());
            }
        }

        let mut server_names = Vec::new();
        for service in &self.services {
            let Some(first) = service.first_server() else {
                continue;
            };
            let first = first.to_string();
            for (key, value) in &service.settings {
                env.insert(format!("{first}_{key}"), value.clone());
            }
            server_names.push(first);
        }
        server_names.sort();
        server_names.dedup();

        env.insert("SERVER_NAME".to_string(), server_names.join(" "));
        env.insert("MULTISITE".to_string(), "yes".to_string());
        env
    }
}
