//! Core store trait definitions.
//!
//! The `StoreClient` trait is the single contract every backend adapter
//! satisfies, whether the store pushes changes (etcd, consul, redis) or has
//! to be polled (files, environment, secret managers).

use async_trait::async_trait;
use std::collections::HashMap;

use crate::config::BackendKind;
use crate::error::Result;

/// Resolved key/value pairs. Keys are hierarchical paths such as `/app/db/host`.
pub type KvPairs = HashMap<String, String>;

/// Cooperative cancellation for [`StoreClient::watch_prefix`].
pub use tokio_util::sync::CancellationToken as StopSignal;

/// Result of a watch call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchOutcome {
    /// A change was observed; resume from this index on the next call.
    Changed(u64),
    /// The stop signal was raised before a change was observed.
    Cancelled,
}

impl WatchOutcome {
    /// The new index, if a change was observed.
    pub fn index(&self) -> Option<u64> {
        match self {
            WatchOutcome::Changed(index) => Some(*index),
            WatchOutcome::Cancelled => None,
        }
    }
}

/// Uniform read/watch contract over a key-value store.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`: one task may call `get_values`
/// while others watch disjoint prefixes on the same client.
///
/// # Missing keys
///
/// Keys that do not exist in the store are omitted from the result. A
/// missing key is never an error.
#[async_trait]
pub trait StoreClient: Send + Sync {
    /// Fetch every entry matching the given keys or key prefixes.
    ///
    /// An empty `keys` slice yields an empty map without contacting the store.
    async fn get_values(&self, keys: &[String]) -> Result<KvPairs>;

    /// Block until something under `prefix` affecting one of `keys` changes.
    ///
    /// `wait_index` is the index returned by the previous call, or 0 when
    /// the caller has not seen any state yet; with 0 the current index is
    /// returned right away. An empty `keys` slice matches any key under the
    /// prefix. Returns [`WatchOutcome::Cancelled`] once `stop` is cancelled.
    async fn watch_prefix(
        &self,
        prefix: &str,
        keys: &[String],
        wait_index: u64,
        stop: &StopSignal,
    ) -> Result<WatchOutcome>;

    /// The kind of backend behind this client.
    fn backend_kind(&self) -> BackendKind;
}

/// Whether `key` is one of the watched `keys` (or lives beneath one of them).
pub(crate) fn key_is_watched(key: &str, keys: &[String]) -> bool {
    keys.is_empty() || keys.iter().any(|k| key.starts_with(k.as_str()))
}

/// Whether `key` equals `prefix` or lives beneath it as a path.
pub(crate) fn key_under(key: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    prefix.is_empty()
        || key == prefix
        || (key.starts_with(prefix) && key.as_bytes().get(prefix.len()) == Some(&b'/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watch_outcome_index() {
        assert_eq!(WatchOutcome::Changed(7).index(), Some(7));
        assert_eq!(WatchOutcome::Cancelled.index(), None);
    }

    #[test]
    fn test_key_is_watched() {
        let keys = vec!["/app/db".to_string()];
        assert!(key_is_watched("/app/db/host", &keys));
        assert!(!key_is_watched("/app/cache/host", &keys));
        assert!(key_is_watched("/anything", &[]));
    }

    #[test]
    fn test_key_under() {
        assert!(key_under("/app/db/host", "/app/db"));
        assert!(key_under("/app/db", "/app/db/"));
        assert!(!key_under("/app/dbx", "/app/db"));
        assert!(key_under("/x", "/"));
    }
}
