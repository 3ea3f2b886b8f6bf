use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::fmt;

/// Telemetry subsystem error types
#[derive(Debug)]
pub enum TelemetryError {
    /// The store has been closed; every operation fails with this kind
    StoreClosed,
    /// Underlying SQLite error
    Database(sqlx::Error),
    /// Encoding/decoding of persisted JSON columns failed
    Encode(serde_json::Error),
    /// A caller-supplied parameter was rejected
    InvalidParam(String),
    /// Row lookup by id found nothing
    NotFound,
    /// Snapshot persistence failure
    Snapshot(String),
    /// Internal error
    Internal(String),
}

impl fmt::Display for TelemetryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StoreClosed => write!(f, "store is closed"),
            Self::Database(err) => write!(f, "database error: {}", err),
            Self::Encode(err) => write!(f, "encode error: {}", err),
            Self::InvalidParam(msg) => write!(f, "invalid parameter: {}", msg),
            Self::NotFound => write!(f, "record not found"),
            Self::Snapshot(msg) => write!(f, "snapshot error: {}", msg),
            Self::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for TelemetryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Database(err) => Some(err),
            Self::Encode(err) => Some(err),
            _ => None,
        }
    }
}

impl IntoResponse for TelemetryError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            Self::StoreClosed => (StatusCode::SERVICE_UNAVAILABLE, self.to_string()),
            Self::Database(_) | Self::Encode(_) | Self::Snapshot(_) | Self::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
            }
            Self::InvalidParam(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            Self::NotFound => (StatusCode::NOT_FOUND, self.to_string()),
        };

        let body = Json(json!({ "error": message }));
        (status, body).into_response()
    }
}

impl From<sqlx::Error> for TelemetryError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(err)
    }
}

impl From<serde_json::Error> for TelemetryError {
    fn from(err: serde_json::Error) -> Self {
        Self::Encode(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(TelemetryError::StoreClosed.to_string(), "store is closed");
        assert_eq!(
            TelemetryError::InvalidParam("days must be at least 1".to_string()).to_string(),
            "invalid parameter: days must be at least 1"
        );
    }

    #[tokio::test]
    async fn test_error_response_status() {
        assert_eq!(
            TelemetryError::NotFound.into_response().status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            TelemetryError::StoreClosed.into_response().status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            TelemetryError::InvalidParam("bad".into())
                .into_response()
                .status(),
            StatusCode::BAD_REQUEST
        );
    }
}
