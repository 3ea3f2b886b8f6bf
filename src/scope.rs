//! Per-request context shared between the entry middleware, the provider
//! layer, and the usage-event plugin.
//!
//! The middleware creates one [`RequestScope`] per tracked request and
//! stores it in the request extensions as `Arc<RequestScope>`. Collaborators
//! fill in what they learn as the request progresses: the response-writer
//! wrapper deposits the captured body, the auth layer the API key, the
//! provider layer the raw upstream response. The middleware reads it all
//! back on exit.

use bytes::Bytes;
use chrono::{DateTime, Local};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

/// Request id assigned by the host's logging layer. Inserted into request
/// extensions before the usage-record middleware runs.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

#[derive(Debug, Default)]
struct ScopeInner {
    record_id: Option<i64>,
    request_id: Option<String>,
    started_at: Option<DateTime<Local>>,
    start_instant: Option<Instant>,
    ip: Option<String>,
    request_url: Option<String>,
    request_method: Option<String>,
    request_headers: Option<HashMap<String, String>>,
    api_key: Option<String>,
    is_streaming: Option<bool>,
    status_code: Option<u16>,
    response_body: Option<Bytes>,
    upstream_response: Option<Bytes>,
    collected_errors: Vec<String>,
    panic_message: Option<String>,
}

/// Mutable per-request state bag with typed optional fields.
#[derive(Debug, Default)]
pub struct RequestScope {
    inner: Mutex<ScopeInner>,
}

macro_rules! scope_accessors {
    ($field:ident, $setter:ident, $ty:ty) => {
        pub fn $field(&self) -> Option<$ty> {
            self.inner.lock().ok().and_then(|inner| inner.$field.clone())
        }

        pub fn $setter(&self, value: $ty) {
            if let Ok(mut inner) = self.inner.lock() {
                inner.$field = Some(value);
            }
        }
    };
}

impl RequestScope {
    pub fn new() -> Self {
        Self::default()
    }

    scope_accessors!(record_id, set_record_id, i64);
    scope_accessors!(request_id, set_request_id, String);
    scope_accessors!(started_at, set_started_at, DateTime<Local>);
    scope_accessors!(start_instant, set_start_instant, Instant);
    scope_accessors!(ip, set_ip, String);
    scope_accessors!(request_url, set_request_url, String);
    scope_accessors!(request_method, set_request_method, String);
    scope_accessors!(request_headers, set_request_headers, HashMap<String, String>);
    scope_accessors!(api_key, set_api_key, String);
    scope_accessors!(is_streaming, set_is_streaming, bool);
    scope_accessors!(status_code, set_status_code, u16);
    scope_accessors!(response_body, set_response_body, Bytes);
    scope_accessors!(upstream_response, set_upstream_response, Bytes);
    scope_accessors!(panic_message, set_panic_message, String);

    /// Append a framework error collected while handling the request.
    pub fn push_error(&self, message: impl Into<String>) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.collected_errors.push(message.into());
        }
    }

    /// All collected errors joined into one message; `None` when empty.
    pub fn errors_joined(&self) -> Option<String> {
        let inner = self.inner.lock().ok()?;
        if inner.collected_errors.is_empty() {
            None
        } else {
            Some(inner.collected_errors.join("\n"))
        }
    }

    /// Milliseconds elapsed since the request entered the middleware.
    pub fn elapsed_ms(&self) -> Option<i64> {
        self.start_instant()
            .map(|start| start.elapsed().as_millis() as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fields_default_to_none() {
        let scope = RequestScope::new();
        assert!(scope.record_id().is_none());
        assert!(scope.api_key().is_none());
        assert!(scope.is_streaming().is_none());
        assert!(scope.errors_joined().is_none());
    }

    #[test]
    fn test_set_and_read_back() {
        let scope = RequestScope::new();
        scope.set_record_id(7);
        scope.set_api_key("sk-abc".to_string());
        scope.set_is_streaming(true);
        scope.set_response_body(Bytes::from_static(b"ok"));

        assert_eq!(scope.record_id(), Some(7));
        assert_eq!(scope.api_key().as_deref(), Some("sk-abc"));
        assert_eq!(scope.is_streaming(), Some(true));
        assert_eq!(scope.response_body().unwrap(), Bytes::from_static(b"ok"));
    }

    #[test]
    fn test_collected_errors_join() {
        let scope = RequestScope::new();
        scope.push_error("first failure");
        scope.push_error("second failure");
        assert_eq!(
            scope.errors_joined().unwrap(),
            "first failure\nsecond failure"
        );
    }
}
