//! etcd v2 backend.
//!
//! Talks to the `/v2/keys` HTTP API. Directories are flattened into their
//! leaf keys. Watches are index-based long polls
//! (`?wait=true&recursive=true&waitIndex=N`); events for keys outside the
//! watched set are skipped by re-arming at the event's index. Requests fail
//! over across the configured nodes in order.

use async_trait::async_trait;
use reqwest::{Method, Response, StatusCode};
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use crate::config::BackendKind;
use crate::error::{BackendError, Result};
use crate::http::{base_url, BasicAuth, HttpClient, TlsSettings};
use crate::traits::{key_is_watched, KvPairs, StopSignal, StoreClient, WatchOutcome};

/// etcd error code: key not found.
const ERR_KEY_NOT_FOUND: u64 = 100;
/// etcd error code: the requested watch index has been compacted away.
const ERR_EVENT_INDEX_CLEARED: u64 = 401;

/// Parameters shared by the etcd v2 and v3 backends.
#[derive(Debug, Clone)]
pub struct EtcdParams {
    pub nodes: Vec<String>,
    pub scheme: String,
    pub tls: TlsSettings,
    pub basic_auth: Option<BasicAuth>,
}

#[derive(Debug, Deserialize)]
struct EtcdResponse {
    node: Option<EtcdNode>,
}

#[derive(Debug, Deserialize)]
struct EtcdNode {
    key: Option<String>,
    value: Option<String>,
    #[serde(default)]
    dir: bool,
    #[serde(default)]
    nodes: Vec<EtcdNode>,
    #[serde(rename = "modifiedIndex", default)]
    modified_index: u64,
}

#[derive(Debug, Deserialize)]
struct EtcdErrorBody {
    #[serde(rename = "errorCode")]
    error_code: u64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    index: u64,
}

/// etcd v2 client.
#[derive(Debug, Clone)]
pub struct EtcdStore {
    http: HttpClient,
    endpoints: Vec<String>,
}

enum Reply {
    Found(EtcdResponse, u64),
    Missing(u64),
    Cleared(u64),
}

impl EtcdStore {
    pub fn new(params: EtcdParams) -> Result<Self> {
        if params.nodes.is_empty() {
            return Err(BackendError::MissingField {
                backend: BackendKind::Etcd,
                field: "nodes",
            });
        }

        Ok(Self {
            http: HttpClient::new(BackendKind::Etcd, &params.tls, params.basic_auth)?,
            endpoints: params
                .nodes
                .iter()
                .map(|n| base_url(n, &params.scheme))
                .collect(),
        })
    }

    /// Send to each endpoint in turn until one answers.
    async fn send(&self, key: &str, query: &[(&str, String)]) -> Result<Response> {
        let mut last_err = None;
        for endpoint in &self.endpoints {
            let url = format!("{}/v2/keys{}", endpoint, normalize(key));
            let request = self.http.request(Method::GET, &url).query(query);
            match self.http.send(request).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    warn!(endpoint = %endpoint, error = %e, "etcd endpoint failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            BackendError::unreachable(BackendKind::Etcd, "no endpoints configured")
        }))
    }

    async fn read(&self, key: &str, query: &[(&str, String)]) -> Result<Reply> {
        let response = self.send(key, query).await?;
        let index = response
            .headers()
            .get("X-Etcd-Index")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        let status = response.status();

        if status.is_success() {
            let body = response
                .json::<EtcdResponse>()
                .await
                .map_err(|e| BackendError::decode(BackendKind::Etcd, e))?;
            return Ok(Reply::Found(body, index));
        }

        let body = response
            .json::<EtcdErrorBody>()
            .await
            .map_err(|e| BackendError::decode(BackendKind::Etcd, format!("{}: {}", status, e)))?;
        match body.error_code {
            ERR_KEY_NOT_FOUND => Ok(Reply::Missing(index.max(body.index))),
            ERR_EVENT_INDEX_CLEARED => Ok(Reply::Cleared(index.max(body.index))),
            _ if status == StatusCode::BAD_REQUEST => {
                Err(BackendError::InvalidRequest(body.message))
            }
            code => Err(BackendError::unreachable(
                BackendKind::Etcd,
                format!("error {}: {}", code, body.message),
            )),
        }
    }
}

fn normalize(key: &str) -> String {
    if key.starts_with('/') {
        key.to_string()
    } else {
        format!("/{}", key)
    }
}

fn flatten(node: &EtcdNode, vars: &mut KvPairs) {
    if node.dir {
        for child in &node.nodes {
            flatten(child, vars);
        }
    } else if let Some(key) = &node.key {
        vars.insert(key.clone(), node.value.clone().unwrap_or_default());
    }
}

#[async_trait]
impl StoreClient for EtcdStore {
    #[instrument(skip(self), fields(backend = "etcd"))]
    async fn get_values(&self, keys: &[String]) -> Result<KvPairs> {
        let mut vars = KvPairs::new();
        let query = [
            ("recursive", "true".to_string()),
            ("quorum", "true".to_string()),
        ];

        for key in keys {
            match self.read(key, &query).await? {
                Reply::Found(body, _) => {
                    if let Some(node) = &body.node {
                        flatten(node, &mut vars);
                    }
                }
                Reply::Missing(_) | Reply::Cleared(_) => {}
            }
        }

        Ok(vars)
    }

    #[instrument(skip(self, stop), fields(backend = "etcd"))]
    async fn watch_prefix(
        &self,
        prefix: &str,
        keys: &[String],
        wait_index: u64,
        stop: &StopSignal,
    ) -> Result<WatchOutcome> {
        if stop.is_cancelled() {
            return Ok(WatchOutcome::Cancelled);
        }

        if wait_index == 0 {
            let reply = tokio::select! {
                biased;
                _ = stop.cancelled() => return Ok(WatchOutcome::Cancelled),
                reply = self.read(prefix, &[]) => reply?,
            };
            let index = match reply {
                Reply::Found(_, index) | Reply::Missing(index) | Reply::Cleared(index) => index,
            };
            return Ok(WatchOutcome::Changed(index.max(1)));
        }

        let mut next = wait_index.saturating_add(1);
        loop {
            let query = [
                ("wait", "true".to_string()),
                ("recursive", "true".to_string()),
                ("waitIndex", next.to_string()),
            ];
            let reply = tokio::select! {
                biased;
                _ = stop.cancelled() => return Ok(WatchOutcome::Cancelled),
                reply = self.read(prefix, &query) => reply?,
            };

            match reply {
                Reply::Found(body, _) => {
                    let Some(node) = body.node else {
                        return Err(BackendError::decode(
                            BackendKind::Etcd,
                            format!("watch reply for index {} carried no node", next),
                        ));
                    };
                    let key = node.key.clone().unwrap_or_default();
                    if key_is_watched(&key, keys) {
                        debug!(key = %key, index = node.modified_index, "etcd change");
                        return Ok(WatchOutcome::Changed(node.modified_index.max(1)));
                    }
                    next = next.max(node.modified_index.saturating_add(1));
                }
                // History was compacted past our index: report the current one.
                Reply::Cleared(index) | Reply::Missing(index) => {
                    return Ok(WatchOutcome::Changed(index.max(1)));
                }
            }
        }
    }

    fn backend_kind(&self) -> BackendKind {
        BackendKind::Etcd
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Path, Query};
    use axum::http::HeaderMap;
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;
    use std::collections::HashMap;
    use std::time::Duration;

    async fn keys(
        Path(key): Path<String>,
        Query(params): Query<HashMap<String, String>>,
    ) -> axum::response::Response {
        let mut headers = HeaderMap::new();
        headers.insert("X-Etcd-Index", "20".parse().unwrap());

        if params.get("wait").is_some() {
            let wait_index: u64 = params["waitIndex"].parse().unwrap();
            return match wait_index {
                11 => Json(json!({"action": "expire"})).into_response(),
                u64::MAX => Json(json!({"action": "set", "node": {"key": "/app/name", "value": "z", "modifiedIndex": u64::MAX}})).into_response(),
                // First event touches an unwatched key, the next a watched one.
                6 => Json(json!({"action": "set", "node": {"key": "/app/other", "value": "x", "modifiedIndex": 7}})).into_response(),
                8 => Json(json!({"action": "set", "node": {"key": "/app/db/host", "value": "y", "modifiedIndex": 9}})).into_response(),
                2 => (
                    StatusCode::BAD_REQUEST,
                    headers,
                    Json(json!({"errorCode": 401, "message": "The event in requested index is outdated and cleared", "index": 20})),
                )
                    .into_response(),
                _ => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    StatusCode::OK.into_response()
                }
            };
        }

        match key.as_str() {
            "app" => (
                headers,
                Json(json!({
                    "action": "get",
                    "node": {
                        "key": "/app", "dir": true,
                        "nodes": [
                            {"key": "/app/db", "dir": true, "nodes": [
                                {"key": "/app/db/host", "value": "10.0.0.1", "modifiedIndex": 3}
                            ]},
                            {"key": "/app/name", "value": "svc", "modifiedIndex": 2}
                        ]
                    }
                })),
            )
                .into_response(),
            _ => (
                StatusCode::NOT_FOUND,
                headers,
                Json(json!({"errorCode": 100, "message": "Key not found", "index": 20})),
            )
                .into_response(),
        }
    }

    async fn server() -> String {
        let app = Router::new().route("/v2/keys/*key", get(keys));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn store(nodes: Vec<String>) -> EtcdStore {
        EtcdStore::new(EtcdParams {
            nodes,
            scheme: "http".into(),
            tls: TlsSettings::default(),
            basic_auth: None,
        })
        .unwrap()
    }

    #[test]
    fn test_flatten_dirs() {
        let node: EtcdNode = serde_json::from_value(json!({
            "key": "/a", "dir": true,
            "nodes": [{"key": "/a/b", "value": "1"}, {"key": "/a/c", "dir": true, "nodes": []}]
        }))
        .unwrap();
        let mut vars = KvPairs::new();
        flatten(&node, &mut vars);
        assert_eq!(vars.len(), 1);
        assert_eq!(vars["/a/b"], "1");
    }

    #[tokio::test]
    async fn test_get_values_recursive() {
        let store = store(vec![server().await]);
        let values = store
            .get_values(&["/app".to_string(), "/nope".to_string()])
            .await
            .unwrap();
        assert_eq!(values.len(), 2);
        assert_eq!(values["/app/db/host"], "10.0.0.1");
        assert_eq!(values["/app/name"], "svc");
    }

    #[tokio::test]
    async fn test_failover_to_second_node() {
        let dead = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = format!("http://{}", dead.local_addr().unwrap());
        drop(dead);

        let store = store(vec![dead_addr, server().await]);
        let values = store.get_values(&["/app".to_string()]).await.unwrap();
        assert_eq!(values["/app/name"], "svc");
    }

    #[tokio::test]
    async fn test_watch_zero_returns_etcd_index() {
        let store = store(vec![server().await]);
        let stop = StopSignal::new();
        let outcome = store.watch_prefix("/app", &[], 0, &stop).await.unwrap();
        assert_eq!(outcome, WatchOutcome::Changed(20));
    }

    #[tokio::test]
    async fn test_watch_skips_unwatched_keys() {
        let store = store(vec![server().await]);
        let stop = StopSignal::new();
        let keys = vec!["/app/db".to_string()];
        let outcome = store.watch_prefix("/app", &keys, 5, &stop).await.unwrap();
        assert_eq!(outcome, WatchOutcome::Changed(9));
    }

    #[tokio::test]
    async fn test_watch_cleared_index() {
        let store = store(vec![server().await]);
        let stop = StopSignal::new();
        let outcome = store.watch_prefix("/app", &[], 1, &stop).await.unwrap();
        assert_eq!(outcome, WatchOutcome::Changed(20));
    }

    #[tokio::test]
    async fn test_concurrent_watches_on_disjoint_prefixes() {
        let store = std::sync::Arc::new(store(vec![server().await]));
        let stop = StopSignal::new();

        let blocked = {
            let store = store.clone();
            let stop = stop.clone();
            tokio::spawn(async move { store.watch_prefix("/quiet", &[], 99, &stop).await })
        };

        let keys = vec!["/app/db".to_string()];
        let outcome = store.watch_prefix("/app", &keys, 5, &stop).await.unwrap();
        assert_eq!(outcome, WatchOutcome::Changed(9));

        stop.cancel();
        let other = blocked.await.unwrap().unwrap();
        assert_eq!(other, WatchOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_watch_reply_without_node_is_an_error() {
        let store = store(vec![server().await]);
        let stop = StopSignal::new();
        let err = tokio::time::timeout(
            Duration::from_secs(5),
            store.watch_prefix("/app", &[], 10, &stop),
        )
        .await
        .expect("watch spun on an empty reply")
        .unwrap_err();
        assert!(matches!(err, BackendError::Decode { .. }));
    }

    #[tokio::test]
    async fn test_watch_at_max_index_does_not_overflow() {
        let store = store(vec![server().await]);
        let stop = StopSignal::new();
        let outcome = store
            .watch_prefix("/app", &[], u64::MAX, &stop)
            .await
            .unwrap();
        assert_eq!(outcome, WatchOutcome::Changed(u64::MAX));
    }
}
