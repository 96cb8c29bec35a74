//! Docker backend: containers labeled in the `rampart.` namespace.
//!
//! Instances are containers labeled `rampart.INSTANCE`, sites are
//! containers labeled `rampart.SERVER_NAME` (all their `rampart.*` labels
//! become that site's settings), and auxiliary configs ride on site
//! containers as `rampart.CUSTOM_CONF_<TYPE>_<name>` labels. The engine
//! event stream is consumed as wake-up signals only.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use rampart_core::hash::sha256_hex;
use rampart_state::{CustomConf, Instance, InstanceHealth};

use crate::backend::{Backend, BackendError, BackendEvent, BackendResult};
use crate::labels::{DOCKER_LABELS, INSTANCE_MARKER, SERVER_NAME_MARKER};
use crate::snapshot::ServiceConf;

const API_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

// ── Engine API payloads (the fields we read) ───────────────────────

#[derive(Debug, Deserialize)]
struct ContainerSummary {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Names", default)]
    names: Vec<String>,
    #[serde(rename = "Labels", default)]
    labels: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct ContainerInspect {
    #[serde(rename = "Config")]
    config: ContainerConfig,
    #[serde(rename = "State")]
    state: ContainerState,
}

#[derive(Debug, Deserialize)]
struct ContainerConfig {
    #[serde(rename = "Env", default)]
    env: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ContainerState {
    #[serde(rename = "Status", default)]
    status: String,
    #[serde(rename = "Health")]
    health: Option<ContainerHealth>,
}

#[derive(Debug, Deserialize)]
struct ContainerHealth {
    #[serde(rename = "Status", default)]
    status: String,
}

#[derive(Debug, Deserialize)]
struct EngineEvent {
    #[serde(rename = "Type", default)]
    kind: String,
    #[serde(rename = "Actor")]
    actor: Option<EventActor>,
}

#[derive(Debug, Deserialize)]
struct EventActor {
    #[serde(rename = "Attributes", default)]
    attributes: HashMap<String, String>,
}

// ── Backend ────────────────────────────────────────────────────────

pub struct DockerBackend {
    api: Client,
    /// Client without a total-request timeout, for the event stream.
    stream: Client,
    base: String,
}

impl DockerBackend {
    /// `docker_host` is the engine endpoint, e.g. `tcp://10.0.0.2:2375`.
    pub fn new(docker_host: &str) -> BackendResult<Self> {
        let base = docker_host
            .strip_prefix("tcp://")
            .map(|rest| format!("http://{rest}"))
            .unwrap_or_else(|| docker_host.trim_end_matches('/').to_string());
        let api = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(API_TIMEOUT)
            .build()?;
        let stream = Client::builder().connect_timeout(CONNECT_TIMEOUT).build()?;
        Ok(Self { api, stream, base })
    }

    async fn containers_with_label(&self, marker: &str) -> BackendResult<Vec<ContainerSummary>> {
        let filters =
            serde_json::json!({ "label": [DOCKER_LABELS.qualify(marker)], "status": ["running"] })
                .to_string();
        let url = format!("{}/containers/json", self.base);
        let response = self
            .api
            .get(&url)
            .query(&[("filters", filters.as_str())])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(BackendError::Api {
                url,
                status: response.status().as_u16(),
            });
        }
        Ok(response.json().await?)
    }

    async fn inspect(&self, id: &str) -> BackendResult<ContainerInspect> {
        let url = format!("{}/containers/{id}/json", self.base);
        let response = self.api.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(BackendError::Api {
                url,
                status: response.status().as_u16(),
            });
        }
        Ok(response.json().await?)
    }
}

fn container_name(summary: &ContainerSummary) -> String {
    summary
        .names
        .first()
        .map(|n| n.trim_start_matches('/').to_string())
        .unwrap_or_else(|| summary.id.clone())
}

/// `rampart.*` labels of a site container, unprefixed. Auxiliary-config
/// labels are left out; they become [`CustomConf`]s instead.
fn site_settings(labels: &HashMap<String, String>) -> BTreeMap<String, String> {
    labels
        .iter()
        .filter(|(key, _)| DOCKER_LABELS.custom_conf(key).is_none())
        .filter_map(|(key, value)| {
            DOCKER_LABELS
                .setting(key)
                .map(|bare| (bare.to_string(), value.clone()))
        })
        .collect()
}

#[async_trait]
impl Backend for DockerBackend {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn list_instances(&self) -> BackendResult<Vec<Instance>> {
        let mut instances = Vec::new();
        for summary in self.containers_with_label(INSTANCE_MARKER).await? {
            let inspect = match self.inspect(&summary.id).await {
                Ok(inspect) => inspect,
                Err(e) => {
                    // The container may be gone between list and inspect.
                    warn!(container = %summary.id, error = %e, "inspect failed, skipping");
                    continue;
                }
            };
            let health = match (&inspect.state.status, &inspect.state.health) {
                (status, Some(h)) if status == "running" && h.status == "healthy" => {
                    InstanceHealth::Up
                }
                (status, None) if status == "running" => InstanceHealth::Up,
                _ => InstanceHealth::Down,
            };
            let name = container_name(&summary);
            instances.push(Instance {
                hostname: name.clone(),
                name,
                health,
                env: inspect
                    .config
                    .env
                    .iter()
                    .filter_map(|pair| pair.split_once('='))
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            });
        }
        Ok(instances)
    }

    async fn list_services(&self) -> BackendResult<Vec<ServiceConf>> {
        let mut services = Vec::new();
        for summary in self.containers_with_label(SERVER_NAME_MARKER).await? {
            let settings = site_settings(&summary.labels);
            if settings.contains_key("SERVER_NAME") {
                services.push(ServiceConf::new(settings));
            }
        }
        Ok(services)
    }

    async fn list_aux_configs(&self) -> BackendResult<Vec<CustomConf>> {
        let mut confs = Vec::new();
        for summary in self.containers_with_label(SERVER_NAME_MARKER).await? {
            let Some(site) = summary
                .labels
                .get(&DOCKER_LABELS.qualify(SERVER_NAME_MARKER))
                .and_then(|s| s.split_whitespace().next())
            else {
                continue;
            };
            for (key, value) in &summary.labels {
                let Some((conf_type, name)) = DOCKER_LABELS.custom_conf(key) else {
                    continue;
                };
                confs.push(CustomConf {
                    conf_type,
                    site: Some(site.to_string()),
                    name,
                    data: value.clone(),
                    checksum: sha256_hex(value.as_bytes()),
                });
            }
        }
        Ok(confs)
    }

    async fn watch(&self, tx: mpsc::Sender<BackendEvent>) -> BackendResult<()> {
        let filters = serde_json::json!({ "type": ["container"] }).to_string();
        let url = format!("{}/events", self.base);
        let response = self
            .stream
            .get(&url)
            .query(&[("filters", filters.as_str())])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(BackendError::Api {
                url,
                status: response.status().as_u16(),
            });
        }

        let instance_label = DOCKER_LABELS.qualify(INSTANCE_MARKER);
        let server_label = DOCKER_LABELS.qualify(SERVER_NAME_MARKER);
        let mut stream = response.bytes_stream();
        let mut buffer = Vec::new();
        while let Some(chunk) = stream.next().await {
            buffer.extend_from_slice(&chunk?);
            while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                let Ok(event) = serde_json::from_slice::<EngineEvent>(&line) else {
                    continue;
                };
                let relevant = event.kind == "container"
                    && event.actor.as_ref().is_some_and(|actor| {
                        actor.attributes.contains_key(&instance_label)
                            || actor.attributes.contains_key(&server_label)
                    });
                if relevant {
                    debug!("container event");
                    if tx.send(BackendEvent { stream: "container" }).await.is_err() {
                        return Ok(());
                    }
                }
            }
        }
        Err(BackendError::StreamClosed { stream: "container" })
    }
}
