//! Data model for the usage-telemetry store.
//!
//! Two persisted entities: [`UsageRecord`] (one row per client request,
//! created pending at request entry and patched as the request progresses)
//! and [`RequestCandidate`] (one write-once row per routing attempt, stitched
//! to the primary record by `request_id`).

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A single API usage record.
///
/// Booleans are stored as 0/1, the timestamp as a local-time RFC3339 string,
/// and the header maps as JSON objects (empty map encodes as `{}`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: i64,
    pub request_id: String,
    pub timestamp: DateTime<Local>,
    pub ip: String,
    pub api_key: String,
    pub api_key_masked: String,
    pub model: String,
    pub provider: String,
    pub is_streaming: bool,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_tokens: i64,
    pub cached_tokens: i64,
    pub reasoning_tokens: i64,
    pub duration_ms: i64,
    pub status_code: i32,
    pub success: bool,
    pub request_url: String,
    pub request_method: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub request_headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub request_body: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub response_headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub response_body: String,
}

impl Default for UsageRecord {
    fn default() -> Self {
        Self {
            id: 0,
            request_id: String::new(),
            timestamp: Local::now(),
            ip: String::new(),
            api_key: String::new(),
            api_key_masked: String::new(),
            model: String::new(),
            provider: String::new(),
            is_streaming: false,
            input_tokens: 0,
            output_tokens: 0,
            total_tokens: 0,
            cached_tokens: 0,
            reasoning_tokens: 0,
            duration_ms: 0,
            status_code: 0,
            success: true,
            request_url: String::new(),
            request_method: String::new(),
            request_headers: HashMap::new(),
            request_body: String::new(),
            response_headers: HashMap::new(),
            response_body: String::new(),
        }
    }
}

/// One routing attempt (provider + credential) recorded by the retry engine.
///
/// Multiple candidates share a `request_id`; the dashboard orders them by
/// `(candidate_index, retry_index)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestCandidate {
    pub id: i64,
    pub request_id: String,
    pub timestamp: DateTime<Local>,
    pub provider: String,
    pub api_key: String,
    pub api_key_masked: String,
    /// One of `pending`, `success`, `failed`, `skipped`.
    pub status: String,
    pub status_code: i32,
    pub success: bool,
    pub duration_ms: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error_message: String,
    pub candidate_index: i32,
    pub retry_index: i32,
}

impl Default for RequestCandidate {
    fn default() -> Self {
        Self {
            id: 0,
            request_id: String::new(),
            timestamp: Local::now(),
            provider: String::new(),
            api_key: String::new(),
            api_key_masked: String::new(),
            status: "pending".to_string(),
            status_code: 0,
            success: false,
            duration_ms: 0,
            error_message: String::new(),
            candidate_index: 0,
            retry_index: 0,
        }
    }
}

/// Query parameters for listing usage records.
#[derive(Debug, Clone, Default)]
pub struct ListQuery {
    pub page: i64,
    pub page_size: i64,
    pub api_key: String,
    pub model: String,
    pub provider: String,
    pub url: String,
    pub ip: String,
    pub start_time: String,
    pub end_time: String,
    pub success: Option<bool>,
    pub search: String,
    pub sort_by: String,
    pub sort_order: String,
    pub include_kpis: bool,
}

/// Paginated list of usage records, optionally with KPI metrics computed
/// under the same filter set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListResult {
    pub records: Vec<UsageRecord>,
    pub total: i64,
    pub page: i64,
    pub page_size: i64,
    pub total_pages: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kpis: Option<crate::store::UsageKpis>,
}
