//! In-memory request statistics, periodically flushed to disk by the
//! snapshot persistence task.
//!
//! Holds a short sliding window of per-request samples plus per-key running
//! totals. A dirty flag gated by compare-and-swap lets the persistence loop
//! write at most once per interval unless new data arrived.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// One recorded request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestSample {
    pub at: DateTime<Utc>,
    pub api_key: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
}

/// Running totals for a single API key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyTotals {
    pub requests: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub last_used_at: Option<DateTime<Utc>>,
}

/// Serializable view of the statistics state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatisticsSnapshot {
    pub samples: Vec<RequestSample>,
    pub key_totals: HashMap<String, KeyTotals>,
}

/// Thread-safe request statistics.
#[derive(Debug, Default)]
pub struct RequestStatistics {
    inner: Mutex<StatisticsSnapshot>,
    dirty: AtomicBool,
}

impl RequestStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one request for `api_key`. Marks the state dirty.
    pub fn record(&self, api_key: &str, input_tokens: i64, output_tokens: i64) {
        let now = Utc::now();
        if let Ok(mut inner) = self.inner.lock() {
            inner.samples.push(RequestSample {
                at: now,
                api_key: api_key.to_string(),
                input_tokens,
                output_tokens,
            });
            let totals = inner.key_totals.entry(api_key.to_string()).or_default();
            totals.requests += 1;
            totals.input_tokens += input_tokens;
            totals.output_tokens += output_tokens;
            totals.last_used_at = Some(now);
        }
        self.dirty.store(true, Ordering::SeqCst);
    }

    /// Clone of the current state.
    pub fn snapshot(&self) -> StatisticsSnapshot {
        self.inner
            .lock()
            .map(|inner| inner.clone())
            .unwrap_or_default()
    }

    /// Drop all state. Does not touch the dirty flag.
    pub fn reset(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            *inner = StatisticsSnapshot::default();
        }
    }

    /// Merge a previously saved snapshot into the current state.
    pub fn merge_snapshot(&self, snapshot: StatisticsSnapshot) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.samples.extend(snapshot.samples);
            inner.samples.sort_by_key(|s| s.at);
            for (key, incoming) in snapshot.key_totals {
                let totals = inner.key_totals.entry(key).or_default();
                totals.requests += incoming.requests;
                totals.input_tokens += incoming.input_tokens;
                totals.output_tokens += incoming.output_tokens;
                if incoming.last_used_at > totals.last_used_at {
                    totals.last_used_at = incoming.last_used_at;
                }
            }
        }
    }

    /// Remove samples older than `cutoff`. Returns true when anything was
    /// removed.
    pub fn prune_before(&self, cutoff: DateTime<Utc>) -> bool {
        let Ok(mut inner) = self.inner.lock() else {
            return false;
        };
        let before = inner.samples.len();
        inner.samples.retain(|s| s.at >= cutoff);
        inner.samples.len() != before
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    /// Atomically consume the dirty flag. Returns true when there was new
    /// data since the last call.
    pub fn take_dirty(&self) -> bool {
        self.dirty
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn set_dirty(&self, dirty: bool) {
        self.dirty.store(dirty, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_updates_totals_and_dirty() {
        let stats = RequestStatistics::new();
        assert!(!stats.take_dirty());

        stats.record("sk-1", 10, 20);
        stats.record("sk-1", 1, 2);
        stats.record("sk-2", 5, 5);

        assert!(stats.take_dirty());
        assert!(!stats.take_dirty());

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.samples.len(), 3);
        assert_eq!(snapshot.key_totals["sk-1"].requests, 2);
        assert_eq!(snapshot.key_totals["sk-1"].input_tokens, 11);
        assert_eq!(snapshot.key_totals["sk-2"].output_tokens, 5);
        assert!(snapshot.key_totals["sk-1"].last_used_at.is_some());
    }

    #[test]
    fn test_prune_before_removes_old_samples() {
        let stats = RequestStatistics::new();
        stats.record("sk-1", 1, 1);

        assert!(!stats.prune_before(Utc::now() - chrono::Duration::hours(1)));
        assert!(stats.prune_before(Utc::now() + chrono::Duration::hours(1)));
        assert!(stats.snapshot().samples.is_empty());
    }

    #[test]
    fn test_merge_snapshot_accumulates() {
        let stats = RequestStatistics::new();
        stats.record("sk-1", 10, 10);

        let mut incoming = StatisticsSnapshot::default();
        incoming.key_totals.insert(
            "sk-1".to_string(),
            KeyTotals {
                requests: 3,
                input_tokens: 30,
                output_tokens: 30,
                last_used_at: Some(Utc::now()),
            },
        );
        stats.merge_snapshot(incoming);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.key_totals["sk-1"].requests, 4);
        assert_eq!(snapshot.key_totals["sk-1"].input_tokens, 40);
    }

    #[test]
    fn test_reset_clears_state() {
        let stats = RequestStatistics::new();
        stats.record("sk-1", 1, 1);
        stats.reset();
        let snapshot = stats.snapshot();
        assert!(snapshot.samples.is_empty());
        assert!(snapshot.key_totals.is_empty());
    }
}
