//! Standalone backend: one static instance, settings from local files.
//!
//! Instances never come and go here; the desired state changes only when
//! the operator edits the environment file or drops auxiliary configs into
//! the configs directory. The watch loop polls both for modifications and
//! emits a wake-up when anything changed.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::warn;
use walkdir::WalkDir;

use rampart_config::configurator::load_env_file;
use rampart_core::hash::sha256_hex;
use rampart_state::{CustomConf, Instance, InstanceHealth};

use crate::backend::{Backend, BackendError, BackendEvent, BackendResult};
use crate::snapshot::ServiceConf;

const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Folders under the configs directory that map into the rendered tree.
const CONF_TYPES: &[&str] = &["server-http", "server-stream", "modsec", "modsec-crs"];

pub struct StandaloneBackend {
    env_file: PathBuf,
    configs_dir: PathBuf,
    instance_hostname: String,
}

impl StandaloneBackend {
    pub fn new(env_file: impl Into<PathBuf>, configs_dir: impl Into<PathBuf>) -> Self {
        Self {
            env_file: env_file.into(),
            configs_dir: configs_dir.into(),
            instance_hostname: "127.0.0.1".to_string(),
        }
    }

    fn read_env(&self) -> BackendResult<BTreeMap<String, String>> {
        load_env_file(&self.env_file).map_err(|source| BackendError::Io {
            path: self.env_file.clone(),
            source,
        })
    }

    /// Fingerprint of everything the desired state is derived from, used
    /// by the poll loop to detect edits.
    fn fingerprint(&self) -> String {
        let mut acc = String::new();
        if let Ok(content) = std::fs::read(&self.env_file) {
            acc.push_str(&sha256_hex(&content));
        }
        for entry in WalkDir::new(&self.configs_dir)
            .sort_by_file_name()
            .into_iter()
            .flatten()
        {
            if entry.file_type().is_file() {
                acc.push_str(&entry.path().display().to_string());
                if let Ok(content) = std::fs::read(entry.path()) {
                    acc.push_str(&sha256_hex(&content));
                }
            }
        }
        sha256_hex(acc.as_bytes())
    }
}

#[async_trait]
impl Backend for StandaloneBackend {
    fn name(&self) -> &'static str {
        "standalone"
    }

    async fn list_instances(&self) -> BackendResult<Vec<Instance>> {
        let env = self.read_env()?;
        Ok(vec![Instance {
            name: "local".to_string(),
            hostname: self.instance_hostname.clone(),
            health: InstanceHealth::Up,
            env,
        }])
    }

    /// Sites come straight from the environment file: one per
    /// `SERVER_NAME` token, each picking up its own prefixed settings.
    async fn list_services(&self) -> BackendResult<Vec<ServiceConf>> {
        let env = self.read_env()?;
        let Some(server_name) = env.get("SERVER_NAME") else {
            return Ok(Vec::new());
        };

        let mut services = Vec::new();
        for site in server_name.split_whitespace() {
            let mut settings = BTreeMap::new();
            settings.insert("SERVER_NAME".to_string(), site.to_string());
            let prefix = format!("{site}_");
            for (key, value) in &env {
                if let Some(bare) = key.strip_prefix(&prefix) {
                    settings.insert(bare.to_string(), value.clone());
                }
            }
            services.push(ServiceConf::new(settings));
        }
        Ok(services)
    }

    /// Auxiliary configs are plain files under
    /// `configs/<type>/[<site>/]<name>.conf`.
    async fn list_aux_configs(&self) -> BackendResult<Vec<CustomConf>> {
        let mut confs = Vec::new();
        for conf_type in CONF_TYPES {
            let root = self.configs_dir.join(conf_type);
            if !root.is_dir() {
                continue;
            }
            for entry in WalkDir::new(&root).sort_by_file_name().into_iter().flatten() {
                let path = entry.path();
                if !entry.file_type().is_file()
                    || path.extension().map(|e| e != "conf").unwrap_or(true)
                {
                    continue;
                }
                let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                // A single directory level under the type scopes the file
                // to one site.
                let site = path
                    .parent()
                    .filter(|parent| *parent != root.as_path())
                    .and_then(Path::file_name)
                    .and_then(|s| s.to_str())
                    .map(str::to_string);
                let data = match std::fs::read_to_string(path) {
                    Ok(data) => data,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "skipping unreadable config file");
                        continue;
                    }
                };
                confs.push(CustomConf {
                    conf_type: conf_type.to_string(),
                    site,
                    name: name.to_string(),
                    checksum: sha256_hex(data.as_bytes()),
                    data,
                });
            }
        }
        Ok(confs)
    }

    async fn watch(&self, tx: mpsc::Sender<BackendEvent>) -> BackendResult<()> {
        let mut seen = self.fingerprint();
        loop {
            tokio::time::sleep(POLL_INTERVAL).await;
            let current = self.fingerprint();
            if current != seen {
                seen = current;
                if tx.send(BackendEvent { stream: "files" }).await.is_err() {
                    return Ok(());
                }
            }
        }
    }
}
