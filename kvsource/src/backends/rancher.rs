//! Rancher metadata service backend.
//!
//! The metadata service exposes one JSON tree under `/latest`; it is fetched
//! whole and flattened. The service bumps `/latest/version` on every change,
//! so watches poll that document.

use async_trait::async_trait;
use reqwest::header::ACCEPT;
use reqwest::{Method, Response, StatusCode};
use std::time::Duration;
use tracing::instrument;

use super::file::flatten;
use crate::config::BackendKind;
use crate::error::{BackendError, Result};
use crate::http::{HttpClient, TlsSettings};
use crate::traits::{key_under, KvPairs, StopSignal, StoreClient, WatchOutcome};
use crate::watch::{fingerprint_bytes, poll_until_changed};

/// Metadata API version this client reads.
const API_VERSION: &str = "latest";

/// Parameters for the Rancher backend.
#[derive(Debug, Clone)]
pub struct RancherParams {
    pub nodes: Vec<String>,
    pub poll_interval: Duration,
}

/// Rancher metadata client.
#[derive(Debug, Clone)]
pub struct RancherStore {
    http: HttpClient,
    base: String,
    poll_interval: Duration,
}

impl RancherStore {
    pub fn new(params: RancherParams) -> Result<Self> {
        let node = params.nodes.first().ok_or(BackendError::MissingField {
            backend: BackendKind::Rancher,
            field: "nodes",
        })?;

        let base = if node.contains("://") {
            node.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", node.trim_end_matches('/'))
        };

        Ok(Self {
            http: HttpClient::new(BackendKind::Rancher, &TlsSettings::default(), None)?,
            base,
            poll_interval: params.poll_interval,
        })
    }

    async fn fetch(&self, path: &str) -> Result<Response> {
        let url = format!("{}/{}{}", self.base, API_VERSION, path);
        let request = self
            .http
            .request(Method::GET, &url)
            .header(ACCEPT, "application/json");
        let response = self.http.send(request).await?;

        match response.status() {
            status if status.is_success() => Ok(response),
            StatusCode::NOT_FOUND => Err(BackendError::InvalidRequest(format!(
                "metadata path {} not found",
                path
            ))),
            status => Err(BackendError::unreachable(
                BackendKind::Rancher,
                format!("unexpected status {}", status),
            )),
        }
    }

    async fn tree(&self) -> Result<KvPairs> {
        let document = self
            .fetch("")
            .await?
            .json::<serde_yaml::Value>()
            .await
            .map_err(|e| BackendError::decode(BackendKind::Rancher, e))?;

        let mut vars = KvPairs::new();
        flatten(&document, String::new(), &mut vars);
        Ok(vars)
    }

    async fn version(&self) -> Result<u64> {
        let body = self
            .fetch("/version")
            .await?
            .bytes()
            .await
            .map_err(|e| BackendError::unreachable(BackendKind::Rancher, e))?;
        Ok(fingerprint_bytes(&body))
    }
}

#[async_trait]
impl StoreClient for RancherStore {
    #[instrument(skip(self), fields(backend = "rancher"))]
    async fn get_values(&self, keys: &[String]) -> Result<KvPairs> {
        if keys.is_empty() {
            return Ok(KvPairs::new());
        }

        Ok(self
            .tree()
            .await?
            .into_iter()
            .filter(|(k, _)| keys.iter().any(|key| key_under(k, key)))
            .collect())
    }

    #[instrument(skip(self, stop), fields(backend = "rancher"))]
    async fn watch_prefix(
        &self,
        _prefix: &str,
        _keys: &[String],
        wait_index: u64,
        stop: &StopSignal,
    ) -> Result<WatchOutcome> {
        poll_until_changed(
            move || async move { self.version().await },
            wait_index,
            self.poll_interval,
            stop,
        )
        .await
    }

    fn backend_kind(&self) -> BackendKind {
        BackendKind::Rancher
    }
}
