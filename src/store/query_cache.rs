//! TTL cache with single-flight coalescing for the aggregate read paths.
//!
//! A hit inside the TTL returns the cached value. On a miss, one computation
//! runs per key while every other caller for the same key awaits its result.
//! Values are stored as JSON so one cache serves all the aggregate result
//! shapes. Writes through the store clear the whole map.

use crate::error::TelemetryError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

struct CacheEntry {
    expires_at: Instant,
    value: serde_json::Value,
}

pub struct QueryCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, CacheEntry>>,
    // Per-key gates: the first miss holds the gate while computing; joiners
    // block on it and then re-check the entry map.
    gates: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl QueryCache {
    /// A zero TTL disables caching entirely: no cache object is created and
    /// callers fall through to their compute function.
    pub fn new(ttl: Duration) -> Option<Self> {
        if ttl.is_zero() {
            return None;
        }
        Some(Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
        })
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
        if let Ok(mut gates) = self.gates.lock() {
            gates.clear();
        }
    }

    fn lookup(&self, key: &str) -> Option<serde_json::Value> {
        let entries = self.entries.lock().ok()?;
        let entry = entries.get(key)?;
        if Instant::now() < entry.expires_at {
            Some(entry.value.clone())
        } else {
            None
        }
    }

    fn insert(&self, key: &str, value: serde_json::Value) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(
                key.to_string(),
                CacheEntry {
                    expires_at: Instant::now() + self.ttl,
                    value,
                },
            );
        }
    }

    fn gate_for(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut gates = match self.gates.lock() {
            Ok(gates) => gates,
            Err(poisoned) => poisoned.into_inner(),
        };
        gates.entry(key.to_string()).or_default().clone()
    }

    /// Return the cached value for `key`, computing it at most once across
    /// concurrent callers on a miss.
    pub async fn get_with<T, F, Fut>(&self, key: &str, compute: F) -> Result<T, TelemetryError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, TelemetryError>>,
    {
        if let Some(value) = self.lookup(key) {
            return serde_json::from_value(value).map_err(TelemetryError::from);
        }

        let gate = self.gate_for(key);
        let _guard = gate.lock().await;

        // Another caller may have populated the entry while we waited.
        if let Some(value) = self.lookup(key) {
            return serde_json::from_value(value).map_err(TelemetryError::from);
        }

        let value = compute().await?;
        self.insert(key, serde_json::to_value(&value)?);
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_hit_within_ttl_skips_compute() {
        let cache = QueryCache::new(Duration::from_secs(60)).unwrap();
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let value: i64 = cache
                .get_with("k", || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(42)
                })
                .await
                .unwrap();
            assert_eq!(value, 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_zero_ttl_disables_cache() {
        assert!(QueryCache::new(Duration::ZERO).is_none());
    }

    #[tokio::test]
    async fn test_expired_entry_recomputes() {
        let cache = QueryCache::new(Duration::from_millis(10)).unwrap();
        let calls = AtomicUsize::new(0);

        let _: i64 = cache
            .get_with("k", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(1)
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let _: i64 = cache
            .get_with("k", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(2)
            })
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_clear_invalidates() {
        let cache = QueryCache::new(Duration::from_secs(60)).unwrap();
        let calls = AtomicUsize::new(0);

        let _: i64 = cache
            .get_with("k", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(1)
            })
            .await
            .unwrap();
        cache.clear();
        let _: i64 = cache
            .get_with("k", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(2)
            })
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_single_flight_coalesces_concurrent_misses() {
        let cache = Arc::new(QueryCache::new(Duration::from_secs(60)).unwrap());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_with("k", || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        // Hold the computation long enough for the other
                        // tasks to pile up behind the gate.
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(7i64)
                    })
                    .await
                    .unwrap()
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), 7);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_error_is_not_cached() {
        let cache = QueryCache::new(Duration::from_secs(60)).unwrap();
        let calls = AtomicUsize::new(0);

        let result: Result<i64, _> = cache
            .get_with("k", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TelemetryError::Internal("boom".to_string()))
            })
            .await;
        assert!(result.is_err());

        let value: i64 = cache
            .get_with("k", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(5)
            })
            .await
            .unwrap();
        assert_eq!(value, 5);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
