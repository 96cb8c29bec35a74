//! Swarm backend: services, tasks and config objects.
//!
//! Instances are swarm services labeled `rampart.INSTANCE`; each running
//! task replica of such a service becomes one reachable instance, named
//! `{service}.{node}.{task}` the way swarm's internal DNS resolves it.
//! Sites are services labeled `rampart.SERVER_NAME`, and auxiliary configs
//! are swarm config objects labeled `rampart.CONFIG_TYPE` (payload is
//! base64 in the API). Service and config events both feed the same
//! wake-up channel.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use rampart_core::hash::sha256_hex;
use rampart_state::{CustomConf, Instance, InstanceHealth};

use crate::backend::{Backend, BackendError, BackendEvent, BackendResult};
use crate::labels::{
    CONFIG_SITE_MARKER, CONFIG_TYPE_MARKER, DOCKER_LABELS, INSTANCE_MARKER, SERVER_NAME_MARKER,
};
use crate::snapshot::ServiceConf;

const API_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

const CONF_TYPES: &[&str] = &["server-http", "server-stream", "modsec", "modsec-crs"];

// ── Engine API payloads (the fields we read) ───────────────────────

#[derive(Debug, Deserialize)]
struct SwarmService {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Spec")]
    spec: ServiceSpec,
}

#[derive(Debug, Deserialize)]
struct ServiceSpec {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Labels", default)]
    labels: HashMap<String, String>,
    #[serde(rename = "TaskTemplate")]
    task_template: Option<TaskTemplate>,
}

#[derive(Debug, Deserialize)]
struct TaskTemplate {
    #[serde(rename = "ContainerSpec")]
    container_spec: Option<ContainerSpec>,
}

#[derive(Debug, Deserialize)]
struct ContainerSpec {
    #[serde(rename = "Env", default)]
    env: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct SwarmTask {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "NodeID", default)]
    node_id: String,
    #[serde(rename = "Status")]
    status: Option<TaskStatus>,
}

#[derive(Debug, Deserialize)]
struct TaskStatus {
    #[serde(rename = "State", default)]
    state: String,
}

#[derive(Debug, Deserialize)]
struct SwarmConfig {
    #[serde(rename = "Spec")]
    spec: ConfigSpec,
}

#[derive(Debug, Deserialize)]
struct ConfigSpec {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Labels", default)]
    labels: HashMap<String, String>,
    #[serde(rename = "Data", default)]
    data: String,
}

// ── Backend ────────────────────────────────────────────────────────

pub struct SwarmBackend {
    api: Client,
    stream: Client,
    base: String,
}

impl SwarmBackend {
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

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        filters: serde_json::Value,
    ) -> BackendResult<T> {
        let filters = filters.to_string();
        let url = format!("{}{path}", self.base);
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

    async fn services_with_label(&self, marker: &str) -> BackendResult<Vec<SwarmService>> {
        self.get_json(
            "/services",
            serde_json::json!({ "label": [DOCKER_LABELS.qualify(marker)] }),
        )
        .await
    }

    async fn running_tasks(&self, service_id: &str) -> BackendResult<Vec<SwarmTask>> {
        self.get_json(
            "/tasks",
            serde_json::json!({ "service": [service_id], "desired-state": ["running"] }),
        )
        .await
    }

    /// Follow one `/events` stream, forwarding a wake-up per event. Both
    /// streams of this backend run concurrently against the same sender.
    async fn follow_events(
        &self,
        object_type: &'static str,
        tx: mpsc::Sender<BackendEvent>,
    ) -> BackendResult<()> {
        let filters = serde_json::json!({ "type": [object_type] }).to_string();
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

        let mut stream = response.bytes_stream();
        let mut buffer = Vec::new();
        while let Some(chunk) = stream.next().await {
            buffer.extend_from_slice(&chunk?);
            while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                if serde_json::from_slice::<serde_json::Value>(&line).is_err() {
                    continue;
                }
                debug!(object_type, "swarm event");
                if tx.send(BackendEvent { stream: object_type }).await.is_err() {
                    return Ok(());
                }
            }
        }
        Err(BackendError::StreamClosed { stream: object_type })
    }
}

fn container_env(service: &SwarmService) -> BTreeMap<String, String> {
    service
        .spec
        .task_template
        .as_ref()
        .and_then(|t| t.container_spec.as_ref())
        .map(|spec| {
            spec.env
                .iter()
                .filter_map(|pair| pair.split_once('='))
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect()
        })
        .unwrap_or_default()
}

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
impl Backend for SwarmBackend {
    fn name(&self) -> &'static str {
        "swarm"
    }

    async fn list_instances(&self) -> BackendResult<Vec<Instance>> {
        let mut instances = Vec::new();
        for service in self.services_with_label(INSTANCE_MARKER).await? {
            let env = container_env(&service);
            let tasks = match self.running_tasks(&service.id).await {
                Ok(tasks) => tasks,
                Err(e) => {
                    warn!(service = %service.spec.name, error = %e, "task listing failed, skipping service");
                    continue;
                }
            };
            for task in tasks {
                let running = task
                    .status
                    .as_ref()
                    .map(|s| s.state == "running")
                    .unwrap_or(false);
                // One entry per replica; swarm DNS resolves this form.
                let hostname = format!("{}.{}.{}", service.spec.name, task.node_id, task.id);
                instances.push(Instance {
                    name: hostname.clone(),
                    hostname,
                    health: if running {
                        InstanceHealth::Up
                    } else {
                        InstanceHealth::Down
                    },
                    env: env.clone(),
                });
            }
        }
        Ok(instances)
    }

    async fn list_services(&self) -> BackendResult<Vec<ServiceConf>> {
        let mut services = Vec::new();
        for service in self.services_with_label(SERVER_NAME_MARKER).await? {
            let settings = site_settings(&service.spec.labels);
            if settings.contains_key("SERVER_NAME") {
                services.push(ServiceConf::new(settings));
            }
        }
        Ok(services)
    }

    async fn list_aux_configs(&self) -> BackendResult<Vec<CustomConf>> {
        let configs: Vec<SwarmConfig> = self
            .get_json(
                "/configs",
                serde_json::json!({ "label": [DOCKER_LABELS.qualify(CONFIG_TYPE_MARKER)] }),
            )
            .await?;

        let mut confs = Vec::new();
        for config in configs {
            let Some(conf_type) = config
                .spec
                .labels
                .get(&DOCKER_LABELS.qualify(CONFIG_TYPE_MARKER))
            else {
                continue;
            };
            if !CONF_TYPES.contains(&conf_type.as_str()) {
                warn!(config = %config.spec.name, conf_type = %conf_type, "unsupported config type, skipping");
                continue;
            }
            let data = match BASE64.decode(&config.spec.data) {
                Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                Err(e) => {
                    warn!(config = %config.spec.name, error = %e, "undecodable config payload, skipping");
                    continue;
                }
            };
            let site = config
                .spec
                .labels
                .get(&DOCKER_LABELS.qualify(CONFIG_SITE_MARKER))
                .cloned();
            confs.push(CustomConf {
                conf_type: conf_type.clone(),
                site,
                name: config.spec.name,
                checksum: sha256_hex(data.as_bytes()),
                data,
            });
        }
        Ok(confs)
    }

    async fn watch(&self, tx: mpsc::Sender<BackendEvent>) -> BackendResult<()> {
        tokio::try_join!(
            self.follow_events("service", tx.clone()),
            self.follow_events("config", tx),
        )?;
        Ok(())
    }
}
