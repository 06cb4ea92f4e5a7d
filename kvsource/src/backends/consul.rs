//! Consul KV backend.
//!
//! Uses the HTTP KV API. Consul stores keys without a leading slash; this
//! client strips it on the way in and restores it on the way out. Watches
//! are Consul blocking queries keyed on `X-Consul-Index`.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, instrument};

use crate::config::BackendKind;
use crate::error::{BackendError, Result};
use crate::http::{base_url, BasicAuth, HttpClient, TlsSettings};
use crate::traits::{KvPairs, StopSignal, StoreClient, WatchOutcome};

/// Upper bound a single blocking query may wait server side.
const BLOCKING_WAIT: &str = "5m";

/// Parameters for the Consul backend.
#[derive(Debug, Clone)]
pub struct ConsulParams {
    pub nodes: Vec<String>,
    pub scheme: String,
    pub tls: TlsSettings,
    pub basic_auth: Option<BasicAuth>,
}

#[derive(Debug, Deserialize)]
struct KvEntry {
    #[serde(rename = "Key")]
    key: String,
    #[serde(rename = "Value")]
    value: Option<String>,
}

/// Consul KV client bound to the first configured agent.
#[derive(Debug, Clone)]
pub struct ConsulStore {
    http: HttpClient,
    base: String,
}

impl ConsulStore {
    pub fn new(params: ConsulParams) -> Result<Self> {
        let node = params.nodes.first().ok_or(BackendError::MissingField {
            backend: BackendKind::Consul,
            field: "nodes",
        })?;

        Ok(Self {
            http: HttpClient::new(BackendKind::Consul, &params.tls, params.basic_auth)?,
            base: base_url(node, &params.scheme),
        })
    }

    fn kv_url(&self, key: &str) -> String {
        format!("{}/v1/kv/{}", self.base, key.trim_start_matches('/'))
    }

    /// Recursive read of `key`; returns the entries and the response index.
    async fn list(&self, key: &str, wait: Option<u64>) -> Result<(Vec<KvEntry>, u64)> {
        let mut request = self
            .http
            .request(Method::GET, &self.kv_url(key))
            .query(&[("recurse", "true")]);
        if let Some(index) = wait {
            request = request.query(&[("index", index.to_string()), ("wait", BLOCKING_WAIT.to_string())]);
        }

        let response = self.http.send(request).await?;
        let index = response
            .headers()
            .get("X-Consul-Index")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);

        match response.status() {
            StatusCode::NOT_FOUND => Ok((Vec::new(), index)),
            status if status.is_success() => {
                let entries = response
                    .json::<Vec<KvEntry>>()
                    .await
                    .map_err(|e| BackendError::decode(BackendKind::Consul, e))?;
                Ok((entries, index))
            }
            StatusCode::BAD_REQUEST => Err(BackendError::InvalidRequest(format!(
                "consul rejected key {}",
                key
            ))),
            status => Err(BackendError::unreachable(
                BackendKind::Consul,
                format!("unexpected status {}", status),
            )),
        }
    }
}

fn decode_value(entry: &KvEntry) -> Result<String> {
    match &entry.value {
        None => Ok(String::new()),
        Some(encoded) => {
            let raw = BASE64
                .decode(encoded)
                .map_err(|e| BackendError::decode(BackendKind::Consul, e))?;
            Ok(String::from_utf8_lossy(&raw).into_owned())
        }
    }
}

#[async_trait]
impl StoreClient for ConsulStore {
    #[instrument(skip(self), fields(backend = "consul"))]
    async fn get_values(&self, keys: &[String]) -> Result<KvPairs> {
        let mut vars = KvPairs::new();
        for key in keys {
            let (entries, _) = self.list(key, None).await?;
            for entry in &entries {
                // Folder markers end in `/`; report them under the folder path.
                let path = entry.key.trim_end_matches('/');
                vars.insert(format!("/{}", path), decode_value(entry)?);
            }
        }
        Ok(vars)
    }

    #[instrument(skip(self, stop), fields(backend = "consul"))]
    async fn watch_prefix(
        &self,
        prefix: &str,
        _keys: &[String],
        wait_index: u64,
        stop: &StopSignal,
    ) -> Result<WatchOutcome> {
        if stop.is_cancelled() {
            return Ok(WatchOutcome::Cancelled);
        }

        loop {
            let blocking = if wait_index == 0 { None } else { Some(wait_index) };
            let (_, index) = tokio::select! {
                biased;
                _ = stop.cancelled() => return Ok(WatchOutcome::Cancelled),
                result = self.list(prefix, blocking) => result?,
            };

            // Consul may return early with an unchanged index when the wait elapses.
            if wait_index == 0 || index != wait_index {
                debug!(prefix = %prefix, index, "Consul index advanced");
                return Ok(WatchOutcome::Changed(index.max(1)));
            }

            tokio::select! {
                biased;
                _ = stop.cancelled() => return Ok(WatchOutcome::Cancelled),
                _ = tokio::time::sleep(Duration::from_millis(10)) => {}
            }
        }
    }

    fn backend_kind(&self) -> BackendKind {
        BackendKind::Consul
    }
}
