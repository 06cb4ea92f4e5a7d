//! etcd v3 backend over the JSON gateway.
//!
//! Reads are `POST /v3/kv/range` prefix queries. Watches stream
//! `POST /v3/watch` from revision `wait_index + 1` and return the revision
//! of the first event touching a watched key.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::StreamExt;
use reqwest::{Method, Response};
use serde::{Deserialize, Deserializer};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, instrument, warn};

use super::etcd::EtcdParams;
use crate::config::BackendKind;
use crate::error::{BackendError, Result};
use crate::http::{base_url, HttpClient};
use crate::traits::{key_is_watched, KvPairs, StopSignal, StoreClient, WatchOutcome};

/// The gateway encodes int64 fields as JSON strings.
fn revision<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(u64),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

#[derive(Debug, Deserialize)]
struct ResponseHeader {
    #[serde(default, deserialize_with = "revision")]
    revision: u64,
}

#[derive(Debug, Deserialize)]
struct RangeResponse {
    header: ResponseHeader,
    #[serde(default)]
    kvs: Vec<KeyValue>,
}

#[derive(Debug, Deserialize)]
struct KeyValue {
    key: String,
    #[serde(default)]
    value: String,
    #[serde(default, deserialize_with = "revision")]
    mod_revision: u64,
}

/// One newline-delimited message of a `/v3/watch` stream.
#[derive(Debug, Deserialize)]
struct WatchMessage {
    result: Option<WatchResult>,
    error: Option<GatewayError>,
}

#[derive(Debug, Deserialize)]
struct WatchResult {
    #[serde(default)]
    canceled: bool,
    #[serde(default, deserialize_with = "revision")]
    compact_revision: u64,
    #[serde(default)]
    events: Vec<WatchEvent>,
}

#[derive(Debug, Deserialize)]
struct WatchEvent {
    kv: KeyValue,
}

#[derive(Debug, Deserialize)]
struct GatewayError {
    #[serde(default)]
    message: String,
}

/// How a single watch stream ended.
#[derive(Debug, PartialEq, Eq)]
enum StreamEnd {
    Changed(u64),
    Compacted,
    /// The server closed the stream; resume from this revision.
    Closed(u64),
}

/// etcd v3 client.
#[derive(Debug, Clone)]
pub struct EtcdV3Store {
    http: HttpClient,
    endpoints: Vec<String>,
    /// Pause before re-opening a watch stream the server closed.
    rearm_delay: Duration,
}

impl EtcdV3Store {
    pub fn new(params: EtcdParams, rearm_delay: Duration) -> Result<Self> {
        if params.nodes.is_empty() {
            return Err(BackendError::MissingField {
                backend: BackendKind::Etcdv3,
                field: "nodes",
            });
        }

        Ok(Self {
            http: HttpClient::new(BackendKind::Etcdv3, &params.tls, params.basic_auth)?,
            endpoints: params
                .nodes
                .iter()
                .map(|n| base_url(n, &params.scheme))
                .collect(),
            rearm_delay,
        })
    }

    /// POST `body` to `path` on the first endpoint that answers.
    async fn post(&self, path: &str, body: &Value) -> Result<Response> {
        let mut last_err = None;
        for endpoint in &self.endpoints {
            let url = format!("{}{}", endpoint, path);
            let request = self.http.request(Method::POST, &url).json(body);
            match self.http.send(request).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    warn!(endpoint = %endpoint, error = %e, "etcdv3 endpoint failed");
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            BackendError::unreachable(BackendKind::Etcdv3, "no endpoints configured")
        }))
    }

    /// Prefix read of `key` at the latest revision, with that revision.
    async fn latest(&self, key: &str) -> Result<(KvPairs, u64)> {
        let body = json!({
            "key": BASE64.encode(key),
            "range_end": BASE64.encode(prefix_end(key.as_bytes())),
        });

        let response = self.post("/v3/kv/range", &body).await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(BackendError::unreachable(
                BackendKind::Etcdv3,
                format!("{}: {}", status, text),
            ));
        }

        let parsed = response
            .json::<RangeResponse>()
            .await
            .map_err(|e| BackendError::decode(BackendKind::Etcdv3, e))?;
        let mut vars = KvPairs::new();
        for kv in parsed.kvs {
            vars.insert(decode(&kv.key)?, decode(&kv.value)?);
        }
        Ok((vars, parsed.header.revision))
    }

    /// Open one watch stream on `prefix` from `start` and read it until a
    /// watched key changes or the stream ends.
    async fn watch_stream(&self, prefix: &str, keys: &[String], start: u64) -> Result<StreamEnd> {
        let body = json!({
            "create_request": {
                "key": BASE64.encode(prefix),
                "range_end": BASE64.encode(prefix_end(prefix.as_bytes())),
                "start_revision": start.to_string(),
            }
        });

        let response = self.post("/v3/watch", &body).await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(BackendError::unreachable(
                BackendKind::Etcdv3,
                format!("{}: {}", status, text),
            ));
        }

        let mut resume = start;
        let mut buffer = Vec::new();
        let mut chunks = response.bytes_stream();
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk.map_err(|e| BackendError::unreachable(BackendKind::Etcdv3, e))?;
            buffer.extend_from_slice(&chunk);

            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                if let Some(end) = read_watch_message(&line, keys, &mut resume)? {
                    return Ok(end);
                }
            }
        }

        Ok(StreamEnd::Closed(resume))
    }
}

/// Apply one stream message; `Some` when the watch is decided.
fn read_watch_message(line: &[u8], keys: &[String], resume: &mut u64) -> Result<Option<StreamEnd>> {
    let message: WatchMessage =
        serde_json::from_slice(line).map_err(|e| BackendError::decode(BackendKind::Etcdv3, e))?;

    if let Some(error) = message.error {
        return Err(BackendError::unreachable(BackendKind::Etcdv3, error.message));
    }
    let Some(result) = message.result else {
        return Ok(None);
    };
    if result.compact_revision > 0 {
        return Ok(Some(StreamEnd::Compacted));
    }

    for event in result.events {
        let key = decode(&event.kv.key)?;
        if key_is_watched(&key, keys) {
            debug!(key = %key, revision = event.kv.mod_revision, "etcdv3 change");
            return Ok(Some(StreamEnd::Changed(event.kv.mod_revision)));
        }
        *resume = (*resume).max(event.kv.mod_revision.saturating_add(1));
    }

    if result.canceled {
        return Ok(Some(StreamEnd::Closed(*resume)));
    }
    Ok(None)
}

fn decode(encoded: &str) -> Result<String> {
    let raw = BASE64
        .decode(encoded)
        .map_err(|e| BackendError::decode(BackendKind::Etcdv3, e))?;
    Ok(String::from_utf8_lossy(&raw).into_owned())
}

/// Smallest key greater than every key starting with `prefix`.
fn prefix_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < 0xff {
            end.push(last + 1);
            return end;
        }
    }
    // All 0xff: range to the end of the keyspace.
    vec![0]
}

#[async_trait]
impl StoreClient for EtcdV3Store {
    #[instrument(skip(self), fields(backend = "etcdv3"))]
    async fn get_values(&self, keys: &[String]) -> Result<KvPairs> {
        let mut vars = KvPairs::new();
        for key in keys {
            let (found, _) = self.latest(key).await?;
            vars.extend(found);
        }
        Ok(vars)
    }

    #[instrument(skip(self, stop), fields(backend = "etcdv3"))]
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
            let (_, revision) = tokio::select! {
                biased;
                _ = stop.cancelled() => return Ok(WatchOutcome::Cancelled),
                latest = self.latest(prefix) => latest?,
            };
            return Ok(WatchOutcome::Changed(revision.max(1)));
        }

        let mut next = wait_index.saturating_add(1);
        loop {
            let end = tokio::select! {
                biased;
                _ = stop.cancelled() => return Ok(WatchOutcome::Cancelled),
                end = self.watch_stream(prefix, keys, next) => end?,
            };

            match end {
                StreamEnd::Changed(revision) => return Ok(WatchOutcome::Changed(revision.max(1))),
                // History before `next` is gone: report the current revision.
                StreamEnd::Compacted => {
                    let (_, revision) = self.latest(prefix).await?;
                    debug!(wait_index, revision, "etcdv3 revision compacted");
                    return Ok(WatchOutcome::Changed(revision.max(1)));
                }
                StreamEnd::Closed(resume) => {
                    next = next.max(resume);
                    debug!(next, "etcdv3 watch stream closed, re-arming");
                    tokio::select! {
                        biased;
                        _ = stop.cancelled() => return Ok(WatchOutcome::Cancelled),
                        _ = tokio::time::sleep(self.rearm_delay) => {}
                    }
                }
            }
        }
    }

    fn backend_kind(&self) -> BackendKind {
        BackendKind::Etcdv3
    }
}
