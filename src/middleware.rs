//! Entry middleware: opens a pending usage record when a tracked request
//! starts and patches it with the outcome on every exit path, including a
//! recovered panic.
//!
//! Only mutating methods are tracked, and only when the host's logging
//! layer has assigned a request id. The insert-then-patch discipline
//! guarantees that failed requests (upstream 5xx, panics) still show up in
//! the usage records UI.

use crate::mask::{is_sensitive_header, mask_api_key, mask_sensitive_query, mask_value};
use crate::record::UsageRecord;
use crate::scope::{RequestId, RequestScope};
use crate::service::{default_telemetry, Telemetry};
use crate::store::RecordPatch;
use axum::{
    body::Body,
    extract::{ConnectInfo, Request},
    http::{HeaderMap, Method, StatusCode},
    middleware::Next,
    response::Response,
};
use bytes::Bytes;
use chrono::Local;
use futures::FutureExt;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

const STORE_OP_TIMEOUT: Duration = Duration::from_secs(2);

/// Track a request through its lifecycle.
///
/// The service is taken from the request extensions when the host threads
/// one explicitly (`Extension<Arc<Telemetry>>`), falling back to the
/// process-level default. Without either, the middleware is a pass-through.
pub async fn usage_record_middleware(req: Request, next: Next) -> Response {
    next.run(req).await
}

/// Patch the pending record with the final outcome. `response` is `None`
/// when the handler panicked; the status is then forced to 500.
async fn finalize_record(
    telemetry: &Telemetry,
    scope: &RequestScope,
    record_id: i64,
    start_instant: Instant,
    response: Option<&Response>,
) {
    let duration_ms = start_instant.elapsed().as_millis() as i64;

    let status_code = match response {
        Some(response) => response.status().as_u16() as i32,
        None => StatusCode::INTERNAL_SERVER_ERROR.as_u16() as i32,
    };
    let success = (200..400).contains(&status_code);

    let api_key = scope.api_key().unwrap_or_default();
    let api_key_masked = if api_key.trim().is_empty() {
        String::new()
    } else {
        mask_api_key(&api_key)
    };

    let mut is_streaming = scope.is_streaming().unwrap_or(false);
    if !is_streaming {
        if let Some(response) = response {
            is_streaming = response
                .headers()
                .get("content-type")
                .and_then(|v| v.to_str().ok())
                .map(|ct| ct.to_ascii_lowercase().contains("text/event-stream"))
                .unwrap_or(false);
        }
    }

    let response_headers = response
        .map(|r| capture_headers(r.headers()))
        .unwrap_or_default();

    let response_body = response_body_best_effort(scope, status_code);

    let patch = RecordPatch {
        ip: scope.ip(),
        api_key: Some(api_key),
        api_key_masked: Some(api_key_masked),
        is_streaming: Some(is_streaming),
        duration_ms: Some(duration_ms),
        status_code: Some(status_code),
        success: Some(success),
        response_headers: Some(response_headers),
        response_body: Some(response_body),
        ..Default::default()
    };

    let store = telemetry.store();
    match tokio::time::timeout(STORE_OP_TIMEOUT, store.patch_by_id(record_id, patch)).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => tracing::warn!(error = %e, "usage record: failed to patch final record"),
        Err(_) => tracing::warn!("usage record: final patch timed out"),
    }
}

/// Response body resolution order: captured response body, raw upstream
/// response, recovered panic message, collected framework errors, then a
/// synthesized `"HTTP <status> <reason>"` for error statuses.
fn response_body_best_effort(scope: &RequestScope, status_code: i32) -> String {
    if let Some(body) = scope.response_body() {
        if !body.is_empty() {
            return String::from_utf8_lossy(&body).into_owned();
        }
    }

    if let Some(upstream) = scope.upstream_response() {
        let text = String::from_utf8_lossy(&upstream);
        if !text.trim().is_empty() {
            return text.into_owned();
        }
    }

    if let Some(message) = scope.panic_message() {
        let message = message.trim();
        if !message.is_empty() {
            return message.to_string();
        }
    }

    if let Some(errors) = scope.errors_joined() {
        let errors = errors.trim();
        if !errors.is_empty() {
            return errors.to_string();
        }
    }

    if status_code >= 400 {
        let reason = StatusCode::from_u16(status_code as u16)
            .ok()
            .and_then(|s| s.canonical_reason());
        return match reason {
            Some(reason) => format!("HTTP {} {}", status_code, reason),
            None => format!("HTTP {}", status_code),
        };
    }

    String::new()
}

/// First value of each header, with sensitive values masked.
fn capture_headers(headers: &HeaderMap) -> HashMap<String, String> {
    let mut out = HashMap::with_capacity(headers.keys_len());
    for name in headers.keys() {
        let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) else {
            continue;
        };
        let value = if is_sensitive_header(name.as_str()) {
            mask_value(value)
        } else {
            value.to_string()
        };
        out.insert(name.as_str().to_string(), value);
    }
    out
}

/// Client address: `X-Forwarded-For` (first hop), then `X-Real-IP`, then the
/// socket peer when the host registered connect info.
fn client_ip(req: &Request) -> String {
    if let Some(forwarded) = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    if let Some(real_ip) = req.headers().get("x-real-ip").and_then(|v| v.to_str().ok()) {
        let real_ip = real_ip.trim();
        if !real_ip.is_empty() {
            return real_ip.to_string();
        }
    }
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string())
        .unwrap_or_default()
}

/// Model name: parsed from `/v1beta/models/{model}:action`-shaped paths,
/// else from the JSON body's `"model"` field, else empty.
fn extract_model_best_effort(path: &str, body: &[u8]) -> String {
    let trimmed = path.trim();
    if let Some(rest) = trimmed.strip_prefix("/v1beta/models/") {
        let rest = rest.trim_start_matches('/');
        if rest.is_empty() {
            return String::new();
        }
        let rest = rest.split('/').next().unwrap_or(rest);
        let rest = rest.split(':').next().unwrap_or(rest);
        return rest.trim().to_string();
    }

    if body.is_empty() {
        return String::new();
    }
    serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|value| {
            value
                .get("model")
                .and_then(|m| m.as_str())
                .map(|m| m.trim().to_string())
        })
        .unwrap_or_default()
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_model_from_gemini_path() {
        assert_eq!(
            extract_model_best_effort("/v1beta/models/gemini-pro:generateContent", b""),
            "gemini-pro"
        );
        assert_eq!(
            extract_model_best_effort("/v1beta/models/gemini-pro/something", b""),
            "gemini-pro"
        );
        assert_eq!(extract_model_best_effort("/v1beta/models/", b""), "");
    }

    #[test]
    fn test_extract_model_from_body() {
        assert_eq!(
            extract_model_best_effort("/v1/chat/completions", br#"{"model":"m1","messages":[]}"#),
            "m1"
        );
        assert_eq!(extract_model_best_effort("/v1/chat/completions", b"{"), "");
        assert_eq!(extract_model_best_effort("/v1/chat/completions", b""), "");
    }

    #[test]
    fn test_response_body_fallback_synthesizes_error_text() {
        let scope = RequestScope::new();
        assert_eq!(response_body_best_effort(&scope, 502), "HTTP 502 Bad Gateway");
        assert_eq!(response_body_best_effort(&scope, 200), "");
    }

    #[test]
    fn test_response_body_prefers_captured_body() {
        let scope = RequestScope::new();
        scope.set_upstream_response(Bytes::from_static(b"upstream"));
        scope.set_response_body(Bytes::from_static(b"captured"));
        assert_eq!(response_body_best_effort(&scope, 200), "captured");
    }

    #[test]
    fn test_response_body_falls_back_to_panic_then_errors() {
        let scope = RequestScope::new();
        scope.set_panic_message("boom".to_string());
        assert_eq!(response_body_best_effort(&scope, 500), "boom");

        let scope = RequestScope::new();
        scope.push_error("handler failed");
        assert_eq!(response_body_best_effort(&scope, 500), "handler failed");
    }

    #[test]
    fn test_capture_headers_masks_sensitive_values() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer sk-123456789".parse().unwrap());
        headers.insert("content-type", "application/json".parse().unwrap());

        let captured = capture_headers(&headers);
        assert_eq!(captured["content-type"], "application/json");
        assert!(!captured["authorization"].contains("sk-123456789"));
        assert!(captured["authorization"].contains("..."));
    }

    #[test]
    fn test_panic_message_downcasts() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom".to_string());
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn std::any::Any + Send> = Box::new(42);
        assert_eq!(panic_message(payload.as_ref()), "panic");
    }
}
