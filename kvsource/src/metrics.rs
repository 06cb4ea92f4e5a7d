//! Store metrics.
//!
//! [`MeteredStore`] wraps any adapter and records:
//! - `kvsource_get_values_total` / `kvsource_get_values_duration_seconds`
//! - `kvsource_watch_total` by outcome
//! - `kvsource_errors_total` by error type

use async_trait::async_trait;
use std::time::{Duration, Instant};

use crate::config::BackendKind;
use crate::error::{BackendError, Result};
use crate::traits::{KvPairs, StopSignal, StoreClient, WatchOutcome};

/// Record a `get_values` call.
pub fn record_get_values(backend: BackendKind, duration: Duration, keys: usize, status: &'static str) {
    metrics::histogram!(
        "kvsource_get_values_duration_seconds",
        "backend" => backend.as_str(),
    )
    .record(duration.as_secs_f64());

    metrics::counter!(
        "kvsource_get_values_total",
        "backend" => backend.as_str(),
        "status" => status,
    )
    .increment(1);

    metrics::histogram!(
        "kvsource_get_values_keys",
        "backend" => backend.as_str(),
    )
    .record(keys as f64);
}

/// Record a finished watch.
pub fn record_watch(backend: BackendKind, outcome: &'static str) {
    metrics::counter!(
        "kvsource_watch_total",
        "backend" => backend.as_str(),
        "outcome" => outcome,
    )
    .increment(1);
}

/// Record a backend error.
pub fn record_error(backend: BackendKind, operation: &'static str, error: &BackendError) {
    metrics::counter!(
        "kvsource_errors_total",
        "backend" => backend.as_str(),
        "operation" => operation,
        "error_type" => error.error_type(),
    )
    .increment(1);
}

/// Adapter wrapper that records call metrics.
pub struct MeteredStore {
    inner: Box<dyn StoreClient>,
}

impl MeteredStore {
    pub fn new(inner: Box<dyn StoreClient>) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> Box<dyn StoreClient> {
        self.inner
    }
}

impl std::fmt::Debug for MeteredStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeteredStore")
            .field("backend", &self.inner.backend_kind())
            .finish()
    }
}

#[async_trait]
impl StoreClient for MeteredStore {
    async fn get_values(&self, keys: &[String]) -> Result<KvPairs> {
        let backend = self.inner.backend_kind();
        let start = Instant::now();
        let result = self.inner.get_values(keys).await;

        match &result {
            Ok(_) => record_get_values(backend, start.elapsed(), keys.len(), "ok"),
            Err(e) => {
                record_get_values(backend, start.elapsed(), keys.len(), "error");
                record_error(backend, "get_values", e);
            }
        }
        result
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
        keys: &[String],
        wait_index: u64,
        stop: &StopSignal,
    ) -> Result<WatchOutcome> {
        let backend = self.inner.backend_kind();
        let result = self.inner.watch_prefix(prefix, keys, wait_index, stop).await;

        match &result {
            Ok(WatchOutcome::Changed(_)) => record_watch(backend, "changed"),
            Ok(WatchOutcome::Cancelled) => record_watch(backend, "cancelled"),
            Err(e) => {
                record_watch(backend, "error");
                record_error(backend, "watch_prefix", e);
            }
        }
        result
    }

    fn backend_kind(&self) -> BackendKind {
        self.inner.backend_kind()
    }
}
