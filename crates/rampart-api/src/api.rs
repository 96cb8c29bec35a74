//! Per-instance HTTP client.
//!
//! Each proxy instance exposes a small control API (`/ping`, `/reload`,
//! cache upload). The client pins short timeouts so one hung instance
//! cannot stall a whole fan-out, and always sends the shared `Host` header
//! the instance's API vhost expects.

use std::time::Duration;

use reqwest::{header, Client, Method, StatusCode};
use serde_json::Value;

use rampart_state::Instance;

use crate::error::{ApiError, ApiResult};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

const DEFAULT_API_PORT: u16 = 5000;
const DEFAULT_API_HOST: &str = "rampart-api";

/// HTTP client bound to one instance's control API.
#[derive(Debug, Clone)]
pub struct Api {
    endpoint: String,
    host: String,
    token: Option<String>,
    client: Client,
}

impl Api {
    /// Build a client for an endpoint URL. The endpoint is normalized to a
    /// trailing slash so paths can be joined verbatim.
    pub fn new(
        endpoint: impl Into<String>,
        host: impl Into<String>,
        token: Option<String>,
    ) -> ApiResult<Self> {
        let mut endpoint = endpoint.into();
        if !endpoint.ends_with('/') {
            endpoint.push('/');
        }
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .user_agent("rampart")
            .build()
            .map_err(ApiError::Client)?;
        Ok(Self {
            endpoint,
            host: host.into(),
            token,
            client,
        })
    }

    /// Build a client for a discovered instance. Port and API vhost come
    /// from the instance's own environment when the platform exposes them.
    pub fn from_instance(instance: &Instance, token: Option<String>) -> ApiResult<Self> {
        let port = instance
            .env
            .get("API_HTTP_PORT")
            .and_then(|p| p.parse::<u16>().ok())
            .unwrap_or(DEFAULT_API_PORT);
        let host = instance
            .env
            .get("API_SERVER_NAME")
            .cloned()
            .unwrap_or_else(|| DEFAULT_API_HOST.to_string());
        Self::new(
            format!("http://{}:{port}", instance.hostname),
            host,
            token,
        )
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Send one request; 2xx is success, anything else is an error carrying
    /// the endpoint so fan-out logs stay attributable.
    pub async fn send(
        &self,
        method: Method,
        path: &str,
        json: Option<&Value>,
    ) -> ApiResult<Value> {
        let url = format!("{}{}", self.endpoint, path.trim_start_matches('/'));
        let mut request = self
            .client
            .request(method, &url)
            .header(header::HOST, &self.host);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        if let Some(body) = json {
            request = request.json(body);
        }
        let response = request.send().await.map_err(|source| ApiError::Request {
            endpoint: self.endpoint.clone(),
            path: path.to_string(),
            source,
        })?;
        self.check(path, response).await
    }

    /// POST a raw payload (the job-cache archive push).
    pub async fn send_bytes(
        &self,
        path: &str,
        content_type: &str,
        body: Vec<u8>,
    ) -> ApiResult<Value> {
        let url = format!("{}{}", self.endpoint, path.trim_start_matches('/'));
        let mut request = self
            .client
            .post(&url)
            .header(header::HOST, &self.host)
            .header(header::CONTENT_TYPE, content_type)
            .body(body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.map_err(|source| ApiError::Request {
            endpoint: self.endpoint.clone(),
            path: path.to_string(),
            source,
        })?;
        self.check(path, response).await
    }

    async fn check(&self, path: &str, response: reqwest::Response) -> ApiResult<Value> {
        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::Status {
                endpoint: self.endpoint.clone(),
                path: path.to_string(),
                status: status.as_u16(),
            });
        }
        if status == StatusCode::NO_CONTENT {
            return Ok(Value::Null);
        }
        // Instances answer JSON; tolerate an empty body.
        Ok(response.json().await.unwrap_or(Value::Null))
    }
}
