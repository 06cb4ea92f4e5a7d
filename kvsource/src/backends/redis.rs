//! Redis backend.
//!
//! Keys are stored with a configurable separator; `/app/db` maps to `app:db`
//! with separator `:` (unchanged with the default `/`). Strings read as
//! values, hashes expand to `key/field`, and any other key is treated as a
//! directory and scanned. Watches ride keyspace notifications.

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::collections::HashMap;
use tracing::{debug, instrument, warn};

use crate::config::BackendKind;
use crate::error::{BackendError, Result};
use crate::traits::{key_is_watched, KvPairs, StopSignal, StoreClient, WatchOutcome};

/// Batch size hint for `SCAN`.
const SCAN_COUNT: usize = 500;

/// Parameters for the Redis backend.
#[derive(Debug, Clone)]
pub struct RedisParams {
    /// `host:port` with an optional `/db` suffix.
    pub nodes: Vec<String>,
    pub password: Option<String>,
    pub separator: String,
}

/// Redis client over a multiplexed connection.
#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
    connection: MultiplexedConnection,
    separator: String,
    /// Database selected by the node address; scopes keyspace events.
    db: String,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("separator", &self.separator)
            .field("db", &self.db)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to the first node that answers.
    pub async fn connect(params: RedisParams) -> Result<Self> {
        if params.nodes.is_empty() {
            return Err(BackendError::MissingField {
                backend: BackendKind::Redis,
                field: "nodes",
            });
        }

        let mut last_err = String::new();
        for node in &params.nodes {
            let (addr, db) = split_node(node);
            let url = node_url(addr, db, params.password.as_deref());
            let client = redis::Client::open(url.as_str())
                .map_err(|e| BackendError::construction(BackendKind::Redis, e.to_string()))?;

            match client.get_multiplexed_async_connection().await {
                Ok(connection) => {
                    debug!(node = %node, "Connected to redis");
                    return Ok(Self {
                        client,
                        connection,
                        separator: params.separator.clone(),
                        db: db.to_string(),
                    });
                }
                Err(e) => {
                    warn!(node = %node, error = %e, "redis node unavailable");
                    last_err = e.to_string();
                }
            }
        }

        Err(BackendError::construction(BackendKind::Redis, last_err))
    }

    /// `/app/db` -> `app<sep>db`
    fn transform(&self, key: &str) -> String {
        transform(key, &self.separator)
    }

    /// `app<sep>db` -> `/app/db`
    fn clean(&self, key: &str) -> String {
        clean(key, &self.separator)
    }

    async fn read_key(&self, conn: &mut MultiplexedConnection, raw: &str, vars: &mut KvPairs) -> Result<bool> {
        let kind: String = redis::cmd("TYPE")
            .arg(raw)
            .query_async(&mut *conn)
            .await
            .map_err(|e| BackendError::unreachable(BackendKind::Redis, e))?;

        match kind.as_str() {
            "string" => {
                let value: Option<String> = conn
                    .get(raw)
                    .await
                    .map_err(|e| BackendError::unreachable(BackendKind::Redis, e))?;
                if let Some(value) = value {
                    vars.insert(self.clean(raw), value);
                }
                Ok(true)
            }
            "hash" => {
                let fields: HashMap<String, String> = conn
                    .hgetall(raw)
                    .await
                    .map_err(|e| BackendError::unreachable(BackendKind::Redis, e))?;
                let base = self.clean(raw);
                for (field, value) in fields {
                    vars.insert(format!("{}/{}", base, field), value);
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn scan(&self, conn: &mut MultiplexedConnection, pattern: &str) -> Result<Vec<String>> {
        let mut cursor: u64 = 0;
        let mut found = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut *conn)
                .await
                .map_err(|e| BackendError::unreachable(BackendKind::Redis, e))?;
            found.extend(batch);
            if next == 0 {
                return Ok(found);
            }
            cursor = next;
        }
    }
}

/// `host:port/db` -> (`host:port`, `db`); the database defaults to 0.
fn split_node(node: &str) -> (&str, &str) {
    let node = node
        .trim_start_matches("redis://")
        .trim_start_matches("tcp://");
    match node.split_once('/') {
        Some((addr, db)) if !db.is_empty() => (addr, db),
        Some((addr, _)) => (addr, "0"),
        None => (node, "0"),
    }
}

fn node_url(addr: &str, db: &str, password: Option<&str>) -> String {
    match password {
        Some(pw) if !pw.is_empty() => format!("redis://:{}@{}/{}", pw, addr, db),
        _ => format!("redis://{}/{}", addr, db),
    }
}

fn keyspace_pattern(db: &str, raw_prefix: &str) -> String {
    format!("__keyspace@{}__:{}*", db, raw_prefix)
}

fn transform(key: &str, separator: &str) -> String {
    if separator == "/" {
        return key.to_string();
    }
    key.trim_start_matches('/').replace('/', separator)
}

fn clean(key: &str, separator: &str) -> String {
    let key = if separator == "/" {
        key.to_string()
    } else {
        key.replace(separator, "/")
    };
    if key.starts_with('/') {
        key
    } else {
        format!("/{}", key)
    }
}

fn scan_pattern(raw: &str, separator: &str) -> String {
    if raw.ends_with(separator) {
        format!("{}*", raw)
    } else {
        format!("{}{}*", raw, separator)
    }
}

#[async_trait]
impl StoreClient for RedisStore {
    #[instrument(skip(self), fields(backend = "redis"))]
    async fn get_values(&self, keys: &[String]) -> Result<KvPairs> {
        let mut conn = self.connection.clone();
        let mut vars = KvPairs::new();

        for key in keys {
            let raw = self.transform(key);
            if self.read_key(&mut conn, &raw, &mut vars).await? {
                continue;
            }
            for child in self.scan(&mut conn, &scan_pattern(&raw, &self.separator)).await? {
                self.read_key(&mut conn, &child, &mut vars).await?;
            }
        }

        Ok(vars)
    }

    #[instrument(skip(self, stop), fields(backend = "redis"))]
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
            return Ok(WatchOutcome::Changed(1));
        }

        // Notifications may already be enabled or the command may be renamed.
        let mut conn = self.connection.clone();
        let enabled: redis::RedisResult<()> = redis::cmd("CONFIG")
            .arg("SET")
            .arg("notify-keyspace-events")
            .arg("KA")
            .query_async(&mut conn)
            .await;
        if let Err(e) = enabled {
            debug!(error = %e, "could not enable keyspace notifications");
        }

        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| BackendError::unreachable(BackendKind::Redis, e))?;
        let pattern = keyspace_pattern(&self.db, &self.transform(prefix));
        pubsub
            .psubscribe(&pattern)
            .await
            .map_err(|e| BackendError::unreachable(BackendKind::Redis, e))?;

        let mut messages = Box::pin(pubsub.on_message());
        loop {
            let message = tokio::select! {
                biased;
                _ = stop.cancelled() => return Ok(WatchOutcome::Cancelled),
                message = messages.next() => message,
            };
            let Some(message) = message else {
                return Err(BackendError::unreachable(
                    BackendKind::Redis,
                    "keyspace subscription closed",
                ));
            };

            let channel = message.get_channel_name();
            let Some((_, raw)) = channel.split_once("__:") else {
                continue;
            };
            let key = self.clean(raw);
            if key_is_watched(&key, keys) {
                debug!(key = %key, "redis keyspace event");
                return Ok(WatchOutcome::Changed(wait_index.saturating_add(1)));
            }
        }
    }

    fn backend_kind(&self) -> BackendKind {
        BackendKind::Redis
    }
}
