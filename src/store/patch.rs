//! Partial updates for existing usage records.

use super::{bind_args, SqlArg, Store};
use crate::error::TelemetryError;
use crate::timeparam::format_rfc3339_local;
use chrono::{DateTime, Local};
use std::collections::HashMap;

/// A partial update for an existing usage record. Any `None` field is left
/// untouched.
#[derive(Debug, Clone, Default)]
pub struct RecordPatch {
    pub timestamp: Option<DateTime<Local>>,
    pub ip: Option<String>,
    pub api_key: Option<String>,
    pub api_key_masked: Option<String>,
    pub model: Option<String>,
    pub provider: Option<String>,
    pub is_streaming: Option<bool>,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub total_tokens: Option<i64>,
    pub cached_tokens: Option<i64>,
    pub reasoning_tokens: Option<i64>,
    pub duration_ms: Option<i64>,
    pub status_code: Option<i32>,
    pub success: Option<bool>,
    pub request_url: Option<String>,
    pub request_method: Option<String>,
    pub request_headers: Option<HashMap<String, String>>,
    pub request_body: Option<String>,
    pub response_headers: Option<HashMap<String, String>>,
    pub response_body: Option<String>,
}

impl RecordPatch {
    fn into_sets(self) -> (Vec<&'static str>, Vec<SqlArg>) {
        let mut sets = Vec::new();
        let mut args = Vec::new();
        let mut add = |set: &'static str, arg: SqlArg| {
            sets.push(set);
            args.push(arg);
        };

        if let Some(timestamp) = self.timestamp {
            add("timestamp = ?", SqlArg::Text(format_rfc3339_local(timestamp)));
        }
        if let Some(ip) = self.ip {
            add("ip = ?", SqlArg::Text(ip));
        }
        if let Some(api_key) = self.api_key {
            add("api_key = ?", SqlArg::Text(api_key));
        }
        if let Some(api_key_masked) = self.api_key_masked {
            add("api_key_masked = ?", SqlArg::Text(api_key_masked));
        }
        if let Some(model) = self.model {
            add("model = ?", SqlArg::Text(model));
        }
        if let Some(provider) = self.provider {
            add("provider = ?", SqlArg::Text(provider));
        }
        if let Some(is_streaming) = self.is_streaming {
            add("is_streaming = ?", SqlArg::Int(is_streaming as i64));
        }
        if let Some(input_tokens) = self.input_tokens {
            add("input_tokens = ?", SqlArg::Int(input_tokens));
        }
        if let Some(output_tokens) = self.output_tokens {
            add("output_tokens = ?", SqlArg::Int(output_tokens));
        }
        if let Some(total_tokens) = self.total_tokens {
            add("total_tokens = ?", SqlArg::Int(total_tokens));
        }
        if let Some(cached_tokens) = self.cached_tokens {
            add("cached_tokens = ?", SqlArg::Int(cached_tokens));
        }
        if let Some(reasoning_tokens) = self.reasoning_tokens {
            add("reasoning_tokens = ?", SqlArg::Int(reasoning_tokens));
        }
        if let Some(duration_ms) = self.duration_ms {
            add("duration_ms = ?", SqlArg::Int(duration_ms));
        }
        if let Some(status_code) = self.status_code {
            add("status_code = ?", SqlArg::Int(status_code as i64));
        }
        if let Some(success) = self.success {
            add("success = ?", SqlArg::Int(success as i64));
        }
        if let Some(request_url) = self.request_url {
            add("request_url = ?", SqlArg::Text(request_url));
        }
        if let Some(request_method) = self.request_method {
            add("request_method = ?", SqlArg::Text(request_method));
        }
        if let Some(request_headers) = self.request_headers {
            let payload =
                serde_json::to_string(&request_headers).unwrap_or_else(|_| "{}".to_string());
            add("request_headers = ?", SqlArg::Text(payload));
        }
        if let Some(request_body) = self.request_body {
            add("request_body = ?", SqlArg::Text(request_body));
        }
        if let Some(response_headers) = self.response_headers {
            let payload =
                serde_json::to_string(&response_headers).unwrap_or_else(|_| "{}".to_string());
            add("response_headers = ?", SqlArg::Text(payload));
        }
        if let Some(response_body) = self.response_body {
            add("response_body = ?", SqlArg::Text(response_body));
        }

        (sets, args)
    }
}

impl Store {
    /// Apply a partial update to the record with the given id, writing only
    /// the fields set on the patch. An empty patch is a no-op returning 0
    /// rows affected. Returns the number of rows updated.
    pub async fn patch_by_id(&self, id: i64, patch: RecordPatch) -> Result<u64, TelemetryError> {
        if id <= 0 {
            return Err(TelemetryError::InvalidParam("invalid record id".to_string()));
        }

        let (sets, args) = patch.into_sets();
        if sets.is_empty() {
            return Ok(0);
        }

        let _guard = self.lock.write().await;
        self.ensure_open()?;

        let sql = format!("UPDATE usage_records SET {} WHERE id = ?", sets.join(", "));
        let result = bind_args(sqlx::query(&sql), &args)
            .bind(id)
            .execute(self.pool())
            .await?;

        self.invalidate_caches();
        Ok(result.rows_affected())
    }
}
