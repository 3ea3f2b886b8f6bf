//! Candidate hook: records every routing attempt the retry engine makes so
//! the dashboard can render a per-request trace timeline.

use crate::record::RequestCandidate;
use crate::store::WriteQueue;
use chrono::Local;
use std::sync::Arc;

/// One `(provider, credential)` attempt reported by the retry engine.
#[derive(Debug, Clone, Default)]
pub struct CandidateEvent {
    pub request_id: String,
    pub provider: String,
    pub auth_id: String,
    pub auth_file: String,
    pub status: String,
    pub status_code: i32,
    pub success: bool,
    pub duration_ms: i64,
    pub error_message: String,
    pub candidate_index: i32,
    pub retry_index: i32,
}

/// Receives per-attempt events from the retry engine and enqueues candidate
/// rows on the write pipeline.
pub struct CandidateHook {
    queue: Arc<WriteQueue>,
}

impl CandidateHook {
    pub fn new(queue: Arc<WriteQueue>) -> Self {
        Self { queue }
    }

    /// Normalize and enqueue one routing attempt. Returns `false` when the
    /// event was discarded (missing request id, missing credential identity,
    /// or a full queue).
    pub fn on_candidate(&self, event: CandidateEvent) -> bool {
        let request_id = event.request_id.trim().to_string();
        if request_id.is_empty() {
            return false;
        }

        let provider = event.provider.trim().to_string();
        let auth_id = event.auth_id.trim().to_string();
        let mut auth_file = event.auth_file.trim().to_string();
        if auth_file.is_empty() {
            auth_file = auth_id.clone();
        }
        if auth_id.is_empty() && auth_file.is_empty() {
            return false;
        }

        let status = match event.status.trim() {
            s @ ("pending" | "success" | "failed" | "skipped") => s.to_string(),
            _ if event.success => "success".to_string(),
            _ => "failed".to_string(),
        };

        let mut status_code = event.status_code;
        if status_code == 0 && status == "success" {
            status_code = 200;
        }

        self.queue.enqueue_request_candidate(RequestCandidate {
            request_id,
            timestamp: Local::now(),
            provider,
            api_key: auth_id,
            api_key_masked: auth_file,
            status,
            status_code,
            success: event.success,
            duration_ms: event.duration_ms,
            error_message: event.error_message.trim().to_string(),
            candidate_index: event.candidate_index,
            retry_index: event.retry_index,
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::ListQuery;
    use crate::store::Store;
    use std::time::Duration;

    async fn hook_fixture() -> (Arc<Store>, CandidateHook) {
        let store = Arc::new(Store::open_in_memory(Duration::ZERO).await.unwrap());
        let queue = WriteQueue::spawn(store.clone());
        (store, CandidateHook::new(queue))
    }

    fn event(request_id: &str, auth_id: &str) -> CandidateEvent {
        CandidateEvent {
            request_id: request_id.to_string(),
            provider: "openai".to_string(),
            auth_id: auth_id.to_string(),
            success: true,
            status: "success".to_string(),
            status_code: 200,
            ..Default::default()
        }
    }

    async fn wait_for_candidates(store: &Store, request_id: &str, expected: usize) {
        let mut rounds = 0;
        loop {
            let candidates = store.get_request_candidates(request_id).await.unwrap();
            if candidates.len() == expected {
                return;
            }
            rounds += 1;
            assert!(rounds < 200, "candidates never landed");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_discards_event_without_credentials() {
        let (_store, hook) = hook_fixture().await;
        let mut bare = event("r1", "");
        bare.auth_file = String::new();
        assert!(!hook.on_candidate(bare));
    }

    #[tokio::test]
    async fn test_discards_event_without_request_id() {
        let (_store, hook) = hook_fixture().await;
        assert!(!hook.on_candidate(event("   ", "auth-1")));
    }

    #[tokio::test]
    async fn test_blank_status_derived_from_success_flag() {
        let (store, hook) = hook_fixture().await;

        let mut failed = event("r1", "auth-1");
        failed.status = String::new();
        failed.success = false;
        failed.status_code = 429;
        assert!(hook.on_candidate(failed));
        wait_for_candidates(&store, "r1", 1).await;

        let candidates = store.get_request_candidates("r1").await.unwrap();
        assert_eq!(candidates[0].status, "failed");
        assert_eq!(candidates[0].status_code, 429);
    }

    #[tokio::test]
    async fn test_success_without_code_defaults_to_200() {
        let (store, hook) = hook_fixture().await;

        let mut ok = event("r2", "auth-1");
        ok.status_code = 0;
        assert!(hook.on_candidate(ok));
        wait_for_candidates(&store, "r2", 1).await;

        let candidates = store.get_request_candidates("r2").await.unwrap();
        assert_eq!(candidates[0].status_code, 200);
    }

    #[tokio::test]
    async fn test_auth_file_falls_back_to_auth_id() {
        let (store, hook) = hook_fixture().await;

        assert!(hook.on_candidate(event("r3", "auth-7")));
        wait_for_candidates(&store, "r3", 1).await;

        let candidates = store.get_request_candidates("r3").await.unwrap();
        assert_eq!(candidates[0].api_key, "auth-7");
        assert_eq!(candidates[0].api_key_masked, "auth-7");
    }

    #[tokio::test]
    async fn test_candidate_trail_keeps_attempt_order() {
        let (store, hook) = hook_fixture().await;

        for (candidate_index, retry_index, success, code) in
            [(0, 0, false, 429), (0, 1, false, 500), (1, 0, true, 200)]
        {
            let mut attempt = event("r4", "auth-1");
            attempt.candidate_index = candidate_index;
            attempt.retry_index = retry_index;
            attempt.success = success;
            attempt.status = String::new();
            attempt.status_code = code;
            assert!(hook.on_candidate(attempt));
        }
        wait_for_candidates(&store, "r4", 3).await;

        let candidates = store.get_request_candidates("r4").await.unwrap();
        let trail: Vec<(i32, i32, i32)> = candidates
            .iter()
            .map(|c| (c.candidate_index, c.retry_index, c.status_code))
            .collect();
        assert_eq!(trail, vec![(0, 0, 429), (0, 1, 500), (1, 0, 200)]);

        // No usage record rows were created by the candidate trail.
        let listed = store.list(&ListQuery::default()).await.unwrap();
        assert_eq!(listed.total, 0);
    }
}
