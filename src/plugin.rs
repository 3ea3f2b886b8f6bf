//! Usage-event plugin: enriches the pending record with the token counts
//! the provider layer reports after the upstream call.
//!
//! The fast path patches the row the entry middleware inserted. When no
//! pending id exists (requests that never passed through the middleware,
//! e.g. non-HTTP invocations), a complete record is built from the event
//! and enqueued on the lossy write pipeline instead.

use crate::mask::mask_api_key;
use crate::record::UsageRecord;
use crate::scope::RequestScope;
use crate::store::{RecordPatch, Store, WriteQueue};
use chrono::{DateTime, Local};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

const PATCH_TIMEOUT: Duration = Duration::from_secs(2);

/// Callback invoked with `(api_key, input_tokens, output_tokens)` whenever a
/// usage event carries token counts for a non-empty key.
pub type TokenIncrementor = Arc<dyn Fn(&str, i64, i64) + Send + Sync>;

/// Callback invoked with the API key of every usage event, for usage-count
/// bookkeeping.
pub type UsageIncrementor = Arc<dyn Fn(&str) + Send + Sync>;

/// Token counts reported by the provider layer for one upstream call.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenUsage {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cached_tokens: i64,
    pub reasoning_tokens: i64,
    /// As reported by the API. Ignored at write time: the stored total is
    /// always `input + output`.
    pub total_tokens: i64,
}

/// A structured usage event from the provider layer.
#[derive(Debug, Clone, Default)]
pub struct UsageEvent {
    pub api_key: String,
    pub provider: String,
    pub model: String,
    pub requested_at: Option<DateTime<Local>>,
    pub failed: bool,
    pub detail: TokenUsage,
}

/// Persists usage events into the store.
pub struct UsagePlugin {
    store: Arc<Store>,
    queue: Arc<WriteQueue>,
    enabled: AtomicBool,
    token_incrementor: RwLock<Option<TokenIncrementor>>,
    usage_incrementor: RwLock<Option<UsageIncrementor>>,
}

impl UsagePlugin {
    pub fn new(store: Arc<Store>, queue: Arc<WriteQueue>) -> Self {
        Self {
            store,
            queue,
            enabled: AtomicBool::new(true),
            token_incrementor: RwLock::new(None),
            usage_incrementor: RwLock::new(None),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_token_incrementor(&self, incrementor: TokenIncrementor) {
        if let Ok(mut slot) = self.token_incrementor.write() {
            *slot = Some(incrementor);
        }
    }

    pub fn set_usage_incrementor(&self, incrementor: UsageIncrementor) {
        if let Ok(mut slot) = self.usage_incrementor.write() {
            *slot = Some(incrementor);
        }
    }

    /// Handle one usage event.
    ///
    /// When the request scope carries the pending record id, the row is
    /// patched in place with provider, model, and token counts; status,
    /// duration, and bodies are left for the middleware's exit patch. Without
    /// a pending id a full record is built and enqueued best-effort.
    pub async fn handle_usage(&self, scope: Option<&RequestScope>, event: UsageEvent) {
        if !self.enabled() {
            return;
        }

        let api_key = event.api_key.clone();
        let input_tokens = event.detail.input_tokens;
        let output_tokens = event.detail.output_tokens;

        let mut patched = false;
        if let Some(record_id) = scope.and_then(|s| s.record_id()) {
            let patch = RecordPatch {
                api_key: Some(event.api_key.clone()),
                api_key_masked: Some(mask_api_key(&event.api_key)),
                model: Some(event.model.clone()),
                provider: Some(event.provider.clone()),
                is_streaming: scope.and_then(|s| s.is_streaming()),
                input_tokens: Some(input_tokens),
                output_tokens: Some(output_tokens),
                total_tokens: Some(input_tokens + output_tokens),
                cached_tokens: Some(event.detail.cached_tokens),
                reasoning_tokens: Some(event.detail.reasoning_tokens),
                ..Default::default()
            };

            match tokio::time::timeout(PATCH_TIMEOUT, self.store.patch_by_id(record_id, patch)).await
            {
                Ok(Ok(_)) => patched = true,
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "usage record: failed to patch token usage")
                }
                Err(_) => tracing::warn!("usage record: token usage patch timed out"),
            }
        }

        if !patched {
            self.queue.enqueue_usage_record(build_record(scope, &event));
        }

        if !api_key.is_empty() {
            if input_tokens > 0 || output_tokens > 0 {
                let incrementor = self
                    .token_incrementor
                    .read()
                    .ok()
                    .and_then(|slot| slot.clone());
                if let Some(incrementor) = incrementor {
                    incrementor(&api_key, input_tokens, output_tokens);
                }
            }

            let incrementor = self
                .usage_incrementor
                .read()
                .ok()
                .and_then(|slot| slot.clone());
            if let Some(incrementor) = incrementor {
                incrementor(&api_key);
            }
        }
    }
}

/// Build a complete record from the event plus whatever request context is
/// available. The one-phase fallback for requests that never hit the entry
/// middleware.
fn build_record(scope: Option<&RequestScope>, event: &UsageEvent) -> UsageRecord {
    let timestamp = event.requested_at.unwrap_or_else(Local::now);

    let status_code = scope
        .and_then(|s| s.status_code())
        .map(|code| code as i32)
        .unwrap_or(0);
    let mut success = !event.failed;
    if status_code >= 400 {
        success = false;
    }

    let duration_ms = scope
        .and_then(|s| s.elapsed_ms())
        .or_else(|| {
            event
                .requested_at
                .map(|at| (Local::now() - at).num_milliseconds())
        })
        .unwrap_or(0);

    UsageRecord {
        request_id: scope.and_then(|s| s.request_id()).unwrap_or_default(),
        timestamp,
        ip: scope.and_then(|s| s.ip()).unwrap_or_default(),
        api_key: event.api_key.clone(),
        api_key_masked: mask_api_key(&event.api_key),
        model: event.model.clone(),
        provider: event.provider.clone(),
        is_streaming: scope.and_then(|s| s.is_streaming()).unwrap_or(false),
        input_tokens: event.detail.input_tokens,
        output_tokens: event.detail.output_tokens,
        // The API-reported total may be inaccurate; always input + output.
        total_tokens: event.detail.input_tokens + event.detail.output_tokens,
        cached_tokens: event.detail.cached_tokens,
        reasoning_tokens: event.detail.reasoning_tokens,
        duration_ms,
        status_code,
        success,
        request_url: scope.and_then(|s| s.request_url()).unwrap_or_default(),
        request_method: scope.and_then(|s| s.request_method()).unwrap_or_default(),
        request_headers: scope.and_then(|s| s.request_headers()).unwrap_or_default(),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::ListQuery;
    use std::sync::atomic::AtomicI64;

    async fn plugin_fixture() -> (Arc<Store>, Arc<WriteQueue>, UsagePlugin) {
        let store = Arc::new(Store::open_in_memory(Duration::ZERO).await.unwrap());
        let queue = WriteQueue::spawn(store.clone());
        let plugin = UsagePlugin::new(store.clone(), queue.clone());
        (store, queue, plugin)
    }

    fn token_event(api_key: &str, input: i64, output: i64) -> UsageEvent {
        UsageEvent {
            api_key: api_key.to_string(),
            provider: "openai".to_string(),
            model: "m1".to_string(),
            detail: TokenUsage {
                input_tokens: input,
                output_tokens: output,
                total_tokens: 9999, // deliberately wrong; must be ignored
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_patches_pending_record_in_place() {
        let (store, _queue, plugin) = plugin_fixture().await;

        let pending = UsageRecord {
            request_id: "req-1".to_string(),
            provider: "pending".to_string(),
            ..Default::default()
        };
        let id = store.insert(&pending).await.unwrap();

        let scope = RequestScope::new();
        scope.set_record_id(id);
        plugin.handle_usage(Some(&scope), token_event("sk-key-12345", 10, 20)).await;

        let record = store.get_by_id(id).await.unwrap().unwrap();
        assert_eq!(record.provider, "openai");
        assert_eq!(record.model, "m1");
        assert_eq!(record.input_tokens, 10);
        assert_eq!(record.output_tokens, 20);
        assert_eq!(record.total_tokens, 30);
        assert_eq!(record.api_key_masked, mask_api_key("sk-key-12345"));

        // Exactly one row for the request id.
        let listed = store.list(&ListQuery::default()).await.unwrap();
        assert_eq!(listed.total, 1);
    }

    #[tokio::test]
    async fn test_enqueues_new_record_without_pending_id() {
        let (store, _queue, plugin) = plugin_fixture().await;

        plugin.handle_usage(None, token_event("sk-key-12345", 5, 7)).await;

        // The fallback path goes through the write queue; wait for drain.
        let mut rounds = 0;
        loop {
            let listed = store.list(&ListQuery::default()).await.unwrap();
            if listed.total == 1 {
                assert_eq!(listed.records[0].total_tokens, 12);
                assert_eq!(listed.records[0].provider, "openai");
                break;
            }
            rounds += 1;
            assert!(rounds < 200, "fallback record never landed");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_disabled_plugin_ignores_events() {
        let (store, _queue, plugin) = plugin_fixture().await;
        plugin.set_enabled(false);

        plugin.handle_usage(None, token_event("sk-key-12345", 5, 7)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let listed = store.list(&ListQuery::default()).await.unwrap();
        assert_eq!(listed.total, 0);
    }

    #[tokio::test]
    async fn test_incrementors_fire_for_nonempty_key() {
        let (_store, _queue, plugin) = plugin_fixture().await;

        let tokens_seen = Arc::new(AtomicI64::new(0));
        let usage_seen = Arc::new(AtomicI64::new(0));
        {
            let tokens_seen = tokens_seen.clone();
            plugin.set_token_incrementor(Arc::new(move |_key, input, output| {
                tokens_seen.fetch_add(input + output, Ordering::SeqCst);
            }));
        }
        {
            let usage_seen = usage_seen.clone();
            plugin.set_usage_incrementor(Arc::new(move |_key| {
                usage_seen.fetch_add(1, Ordering::SeqCst);
            }));
        }

        plugin.handle_usage(None, token_event("sk-key-12345", 10, 20)).await;
        plugin.handle_usage(None, token_event("", 10, 20)).await; // empty key: skipped
        plugin.handle_usage(None, token_event("sk-key-12345", 0, 0)).await; // no tokens

        assert_eq!(tokens_seen.load(Ordering::SeqCst), 30);
        assert_eq!(usage_seen.load(Ordering::SeqCst), 2);
    }
}
