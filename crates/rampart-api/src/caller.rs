//! Fleet fan-out.
//!
//! `ApiCaller` holds one [`Api`] per discovered instance and pushes the
//! same request to all of them. Aggregation is all-or-partial: the caller
//! learns whether *everything* succeeded, and per-instance failures are
//! logged with the endpoint that caused them.

use std::path::Path;
use std::time::Duration;

use flate2::write::GzEncoder;
use flate2::Compression;
use reqwest::Method;
use serde_json::Value;
use tracing::{debug, warn};

use crate::api::Api;
use crate::error::{ApiError, ApiResult};

/// Fans requests out to every instance's control API.
#[derive(Debug, Clone, Default)]
pub struct ApiCaller {
    apis: Vec<Api>,
}

impl ApiCaller {
    pub fn new(apis: Vec<Api>) -> Self {
        Self { apis }
    }

    pub fn apis(&self) -> &[Api] {
        &self.apis
    }

    pub fn is_empty(&self) -> bool {
        self.apis.is_empty()
    }

    /// Send the same request to every instance. Every instance is
    /// attempted even after a failure; returns true only when all of them
    /// answered success.
    pub async fn send_to_apis(&self, method: Method, path: &str, json: Option<&Value>) -> bool {
        let mut ok = true;
        for api in &self.apis {
            match api.send(method.clone(), path, json).await {
                Ok(_) => {
                    debug!(endpoint = api.endpoint(), path, "request succeeded");
                }
                Err(e) => {
                    warn!(endpoint = api.endpoint(), path, error = %e, "request failed");
                    ok = false;
                }
            }
        }
        ok
    }

    /// Tar-gzip a directory and push the archive to every instance.
    /// Archiving happens once; the same bytes go to each endpoint.
    pub async fn send_files(&self, dir: &Path, path: &str) -> ApiResult<bool> {
        let archive = archive_dir(dir)?;
        let mut ok = true;
        for api in &self.apis {
            match api
                .send_bytes(path, "application/gzip", archive.clone())
                .await
            {
                Ok(_) => {
                    debug!(endpoint = api.endpoint(), path, "archive pushed");
                }
                Err(e) => {
                    warn!(endpoint = api.endpoint(), path, error = %e, "archive push failed");
                    ok = false;
                }
            }
        }
        Ok(ok)
    }

    /// Ping every instance until all answer, with fixed spacing and a hard
    /// retry ceiling. Returns false once the ceiling is hit so callers
    /// report instead of hanging.
    pub async fn wait_ready(&self, interval: Duration, max_retries: u32) -> bool {
        for attempt in 1..=max_retries {
            if self.send_to_apis(Method::POST, "/ping", None).await {
                return true;
            }
            debug!(attempt, max_retries, "instances not ready yet");
            tokio::time::sleep(interval).await;
        }
        false
    }
}

fn archive_dir(dir: &Path) -> ApiResult<Vec<u8>> {
    let map_io = |source: std::io::Error| ApiError::Archive {
        path: dir.to_path_buf(),
        source,
    };
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.append_dir_all(".", dir).map_err(map_io)?;
    let encoder = builder.into_inner().map_err(map_io)?;
    encoder.finish().map_err(map_io)
}
