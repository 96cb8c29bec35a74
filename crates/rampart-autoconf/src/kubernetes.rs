//! Kubernetes backend: pods, ingresses and configmaps.
//!
//! Instances are pods annotated `rampart.io/INSTANCE`. Sites come from
//! ingress rules: each host becomes a reverse-proxied server, and
//! `rampart.io/<SETTING>` annotations on the ingress apply to every site
//! it declares. Auxiliary configs are configmaps annotated
//! `rampart.io/CONFIG_TYPE`, one config per data entry. Pods, ingresses
//! and services are watched as three streams feeding one wake-up channel.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
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
use crate::labels::{
    CONFIG_SITE_MARKER, CONFIG_TYPE_MARKER, INSTANCE_MARKER, K8S_ANNOTATIONS, SERVER_NAME_MARKER,
};
use crate::snapshot::ServiceConf;

const API_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const TOKEN_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";

const CONF_TYPES: &[&str] = &["server-http", "server-stream", "modsec", "modsec-crs"];

// ── API payloads (the fields we read) ──────────────────────────────

#[derive(Debug, Deserialize)]
struct List<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct Metadata {
    #[serde(default)]
    name: String,
    #[serde(default)]
    namespace: String,
    #[serde(default)]
    annotations: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct Pod {
    metadata: Metadata,
    spec: Option<PodSpec>,
    status: Option<PodStatus>,
}

#[derive(Debug, Deserialize)]
struct PodSpec {
    #[serde(default)]
    containers: Vec<Container>,
}

#[derive(Debug, Deserialize)]
struct Container {
    #[serde(default)]
    env: Vec<EnvVar>,
}

#[derive(Debug, Deserialize)]
struct EnvVar {
    name: String,
    value: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PodStatus {
    #[serde(rename = "podIP")]
    pod_ip: Option<String>,
    #[serde(default)]
    conditions: Vec<PodCondition>,
}

#[derive(Debug, Deserialize)]
struct PodCondition {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    status: String,
}

#[derive(Debug, Deserialize)]
struct Ingress {
    metadata: Metadata,
    spec: Option<IngressSpec>,
}

#[derive(Debug, Deserialize)]
struct IngressSpec {
    #[serde(default)]
    rules: Vec<IngressRule>,
}

#[derive(Debug, Deserialize)]
struct IngressRule {
    host: Option<String>,
    http: Option<HttpRule>,
}

#[derive(Debug, Deserialize)]
struct HttpRule {
    #[serde(default)]
    paths: Vec<HttpPath>,
}

#[derive(Debug, Deserialize)]
struct HttpPath {
    path: Option<String>,
    backend: Option<PathBackend>,
}

#[derive(Debug, Deserialize)]
struct PathBackend {
    service: Option<BackendService>,
}

#[derive(Debug, Deserialize)]
struct BackendService {
    name: String,
    port: Option<ServicePort>,
}

#[derive(Debug, Deserialize)]
struct ServicePort {
    number: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct ConfigMap {
    metadata: Metadata,
    #[serde(default)]
    data: HashMap<String, String>,
}

// ── Backend ────────────────────────────────────────────────────────

pub struct KubernetesBackend {
    api: Client,
    stream: Client,
    base: String,
    token: String,
}

impl KubernetesBackend {
    /// Connect through the in-cluster service account.
    pub fn in_cluster() -> BackendResult<Self> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST").unwrap_or_default();
        let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".to_string());
        let token = std::fs::read_to_string(TOKEN_PATH)
            .map_err(|source| BackendError::Io {
                path: Path::new(TOKEN_PATH).to_path_buf(),
                source,
            })?
            .trim()
            .to_string();
        Self::new(&format!("https://{host}:{port}"), token)
    }

    pub fn new(base: &str, token: String) -> BackendResult<Self> {
        // The service-account CA bundle is not loaded; the apiserver cert
        // is accepted as presented.
        let api = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(API_TIMEOUT)
            .danger_accept_invalid_certs(true)
            .build()?;
        let stream = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .danger_accept_invalid_certs(true)
            .build()?;
        Ok(Self {
            api,
            stream,
            base: base.trim_end_matches('/').to_string(),
            token,
        })
    }

    async fn get_list<T: serde::de::DeserializeOwned>(&self, path: &str) -> BackendResult<List<T>> {
        let url = format!("{}{path}", self.base);
        let response = self.api.get(&url).bearer_auth(&self.token).send().await?;
        if !response.status().is_success() {
            return Err(BackendError::Api {
                url,
                status: response.status().as_u16(),
            });
        }
        Ok(response.json().await?)
    }

    /// Follow one `?watch=true` stream, forwarding a wake-up per event.
    async fn follow_stream(
        &self,
        path: &str,
        name: &'static str,
        tx: mpsc::Sender<BackendEvent>,
    ) -> BackendResult<()> {
        let url = format!("{}{path}?watch=true", self.base);
        let response = self
            .stream
            .get(&url)
            .bearer_auth(&self.token)
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
                debug!(stream = name, "apiserver event");
                if tx.send(BackendEvent { stream: name }).await.is_err() {
                    return Ok(());
                }
            }
        }
        Err(BackendError::StreamClosed { stream: name })
    }
}

fn pod_ready(status: Option<&PodStatus>) -> bool {
    status
        .map(|s| {
            s.conditions
                .iter()
                .any(|c| c.kind == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

/// Site definitions declared by one ingress. Each host rule becomes one
/// reverse-proxied server; ingress annotations apply to all of them.
fn ingress_services(ingress: &Ingress) -> Vec<ServiceConf> {
    let namespace = if ingress.metadata.namespace.is_empty() {
        "default"
    } else {
        &ingress.metadata.namespace
    };
    let annotations: Vec<(&str, &String)> = ingress
        .metadata
        .annotations
        .iter()
        .filter_map(|(key, value)| K8S_ANNOTATIONS.setting(key).map(|bare| (bare, value)))
        .filter(|(bare, _)| {
            *bare != INSTANCE_MARKER && *bare != SERVER_NAME_MARKER && *bare != CONFIG_TYPE_MARKER
        })
        .collect();

    let mut services = Vec::new();
    let Some(spec) = &ingress.spec else {
        return services;
    };
    for rule in &spec.rules {
        let Some(host) = rule.host.as_deref().filter(|h| !h.is_empty()) else {
            continue;
        };
        let mut settings = BTreeMap::new();
        settings.insert("SERVER_NAME".to_string(), host.to_string());
        settings.insert("USE_REVERSE_PROXY".to_string(), "yes".to_string());

        let paths = rule.http.as_ref().map(|h| h.paths.as_slice()).unwrap_or(&[]);
        for (i, path) in paths.iter().enumerate() {
            let Some(service) = path.backend.as_ref().and_then(|b| b.service.as_ref()) else {
                warn!(host, "ingress path without a service backend, skipping");
                continue;
            };
            let port = service.port.as_ref().and_then(|p| p.number).unwrap_or(80);
            let suffix = i + 1;
            settings.insert(
                format!("REVERSE_PROXY_HOST_{suffix}"),
                format!("http://{}.{namespace}.svc.cluster.local:{port}", service.name),
            );
            settings.insert(
                format!("REVERSE_PROXY_URL_{suffix}"),
                path.path.clone().unwrap_or_else(|| "/".to_string()),
            );
        }

        for (bare, value) in &annotations {
            settings.insert(bare.to_string(), (*value).clone());
        }
        services.push(ServiceConf::new(settings));
    }
    services
}

#[async_trait]
impl Backend for KubernetesBackend {
    fn name(&self) -> &'static str {
        "kubernetes"
    }

    async fn list_instances(&self) -> BackendResult<Vec<Instance>> {
        let pods: List<Pod> = self.get_list("/api/v1/pods").await?;
        let marker = K8S_ANNOTATIONS.qualify(INSTANCE_MARKER);

        let mut instances = Vec::new();
        for pod in pods.items {
            if !pod.metadata.annotations.contains_key(&marker) {
                continue;
            }
            let env = pod
                .spec
                .as_ref()
                .map(|spec| {
                    spec.containers
                        .iter()
                        .flat_map(|c| &c.env)
                        .filter_map(|var| var.value.as_ref().map(|v| (var.name.clone(), v.clone())))
                        .collect()
                })
                .unwrap_or_default();
            let hostname = pod
                .status
                .as_ref()
                .and_then(|s| s.pod_ip.clone())
                .unwrap_or_else(|| pod.metadata.name.clone());
            let health = if pod_ready(pod.status.as_ref()) {
                InstanceHealth::Up
            } else {
                InstanceHealth::Down
            };
            instances.push(Instance {
                name: pod.metadata.name,
                hostname,
                health,
                env,
            });
        }
        Ok(instances)
    }

    async fn list_services(&self) -> BackendResult<Vec<ServiceConf>> {
        let ingresses: List<Ingress> = self
            .get_list("/apis/networking.k8s.io/v1/ingresses")
            .await?;
        Ok(ingresses.items.iter().flat_map(ingress_services).collect())
    }

    async fn list_aux_configs(&self) -> BackendResult<Vec<CustomConf>> {
        let configmaps: List<ConfigMap> = self.get_list("/api/v1/configmaps").await?;
        let type_marker = K8S_ANNOTATIONS.qualify(CONFIG_TYPE_MARKER);
        let site_marker = K8S_ANNOTATIONS.qualify(CONFIG_SITE_MARKER);

        let mut confs = Vec::new();
        for configmap in configmaps.items {
            let Some(conf_type) = configmap.metadata.annotations.get(&type_marker) else {
                continue;
            };
            if !CONF_TYPES.contains(&conf_type.as_str()) {
                warn!(configmap = %configmap.metadata.name, conf_type = %conf_type, "unsupported config type, skipping");
                continue;
            }
            let site = configmap.metadata.annotations.get(&site_marker).cloned();
            for (name, data) in configmap.data {
                confs.push(CustomConf {
                    conf_type: conf_type.clone(),
                    site: site.clone(),
                    name: name.trim_end_matches(".conf").to_string(),
                    checksum: sha256_hex(data.as_bytes()),
                    data,
                });
            }
        }
        Ok(confs)
    }

    async fn watch(&self, tx: mpsc::Sender<BackendEvent>) -> BackendResult<()> {
        tokio::try_join!(
            self.follow_stream("/api/v1/pods", "pods", tx.clone()),
            self.follow_stream("/apis/networking.k8s.io/v1/ingresses", "ingresses", tx.clone()),
            self.follow_stream("/api/v1/services", "services", tx),
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ingress(value: serde_json::Value) -> Ingress {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn ingress_rules_become_reverse_proxied_sites() {
        let ing = ingress(serde_json::json!({
            "metadata": { "name": "web", "namespace": "apps", "annotations": {} },
            "spec": {
                "rules": [{
                    "host": "a.com",
                    "http": { "paths": [
                        { "path": "/", "backend": { "service": { "name": "front", "port": { "number": 8080 } } } },
                        { "path": "/api", "backend": { "service": { "name": "api" } } }
                    ]}
                }]
            }
        }));

        let services = ingress_services(&ing);
        assert_eq!(services.len(), 1);
        let settings = &services[0].settings;
        assert_eq!(settings["SERVER_NAME"], "a.com");
        assert_eq!(settings["USE_REVERSE_PROXY"], "yes");
        assert_eq!(
            settings["REVERSE_PROXY_HOST_1"],
            "http://front.apps.svc.cluster.local:8080"
        );
        assert_eq!(settings["REVERSE_PROXY_URL_1"], "/");
        assert_eq!(
            settings["REVERSE_PROXY_HOST_2"],
            "http://api.apps.svc.cluster.local:80"
        );
        assert_eq!(settings["REVERSE_PROXY_URL_2"], "/api");
    }

    #[test]
    fn ingress_annotations_apply_to_every_declared_site() {
        let ing = ingress(serde_json::json!({
            "metadata": {
                "name": "web",
                "namespace": "apps",
                "annotations": {
                    "rampart.io/USE_GZIP": "yes",
                    "rampart.io/SERVER_NAME": "ignored",
                    "kubernetes.io/ingress.class": "rampart"
                }
            },
            "spec": {
                "rules": [
                    { "host": "a.com", "http": { "paths": [] } },
                    { "host": "b.com", "http": { "paths": [] } }
                ]
            }
        }));

        let services = ingress_services(&ing);
        assert_eq!(services.len(), 2);
        for service in &services {
            assert_eq!(service.settings["USE_GZIP"], "yes");
            assert!(!service.settings.contains_key("ingress.class"));
        }
        // The SERVER_NAME annotation must not clobber the rule host.
        assert_eq!(services[0].first_server(), Some("a.com"));
        assert_eq!(services[1].first_server(), Some("b.com"));
    }

    #[test]
    fn hostless_rules_are_skipped() {
        let ing = ingress(serde_json::json!({
            "metadata": { "name": "web", "namespace": "apps", "annotations": {} },
            "spec": { "rules": [ { "http": { "paths": [] } } ] }
        }));
        assert!(ingress_services(&ing).is_empty());
    }

    #[test]
    fn pod_readiness_needs_the_ready_condition() {
        let ready: PodStatus = serde_json::from_value(serde_json::json!({
            "podIP": "10.1.0.4",
            "conditions": [
                { "type": "Initialized", "status": "True" },
                { "type": "Ready", "status": "True" }
            ]
        }))
        .unwrap();
        let not_ready: PodStatus = serde_json::from_value(serde_json::json!({
            "conditions": [ { "type": "Ready", "status": "False" } ]
        }))
        .unwrap();
        assert!(pod_ready(Some(&ready)));
        assert!(!pod_ready(Some(&not_ready)));
        assert!(!pod_ready(None));
    }
}
