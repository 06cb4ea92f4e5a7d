//! Polling-simulated watches.
//!
//! Stores without a change-notification primitive watch by re-reading their
//! data at a fixed interval. The watch index of such stores is a fingerprint
//! of the snapshot, so a caller resuming with an outdated index sees the
//! change on the first poll instead of waiting for the next one.

use sha2::{Digest, Sha256};
use std::future::Future;
use std::time::Duration;

use crate::error::Result;
use crate::traits::{KvPairs, StopSignal, WatchOutcome};

/// Default poll period for stores without native watches.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Stable, non-zero digest of a key/value snapshot.
pub fn fingerprint(pairs: &KvPairs) -> u64 {
    let mut entries: Vec<(&String, &String)> = pairs.iter().collect();
    entries.sort();

    let mut hasher = Sha256::new();
    for (key, value) in entries {
        hasher.update(key.as_bytes());
        hasher.update([0u8]);
        hasher.update(value.as_bytes());
        hasher.update([0u8]);
    }
    fingerprint_digest(hasher)
}

/// Non-zero digest of an arbitrary byte marker (e.g. a version string).
pub fn fingerprint_bytes(data: &[u8]) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(data);
    fingerprint_digest(hasher)
}

fn fingerprint_digest(hasher: Sha256) -> u64 {
    let digest = hasher.finalize();
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    // 0 means "no state" to callers
    u64::from_be_bytes(head).max(1)
}

/// Poll `current_index` until it differs from `wait_index` or `stop` fires.
///
/// With `wait_index == 0` the first index read is returned immediately.
/// Cancellation is observed while a poll is in flight and while sleeping,
/// so the call returns within one interval of the stop signal.
pub async fn poll_until_changed<F, Fut>(
    mut current_index: F,
    wait_index: u64,
    interval: Duration,
    stop: &StopSignal,
) -> Result<WatchOutcome>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<u64>>,
{
    if stop.is_cancelled() {
        return Ok(WatchOutcome::Cancelled);
    }

    loop {
        let index = tokio::select! {
            biased;
            _ = stop.cancelled() => return Ok(WatchOutcome::Cancelled),
            index = current_index() => index?,
        };

        if wait_index == 0 || index != wait_index {
            return Ok(WatchOutcome::Changed(index));
        }

        tokio::select! {
            biased;
            _ = stop.cancelled() => return Ok(WatchOutcome::Cancelled),
            _ = tokio::time::sleep(interval) => {}
        }
    }
}
