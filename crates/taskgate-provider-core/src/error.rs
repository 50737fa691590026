use std::time::Duration;

use bytes::Bytes;
use http::StatusCode;

/// Task-level error with the HTTP status and machine readable code reported to the caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct TaskError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
}

impl TaskError {
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn bad_request(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, message)
    }

    pub fn internal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, code, message)
    }
}

/// Network level failure talking to a provider. Always retryable and never a
/// reason to touch persisted task state.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("invalid upstream request: {0}")]
    InvalidRequest(String),
    #[error("upstream request failed: {0}")]
    Request(String),
    #[error("upstream request timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("upstream returned {status}: {}", String::from_utf8_lossy(.body))]
    Status { status: StatusCode, body: Bytes },
}

impl TransportError {
    pub fn status(&self) -> StatusCode {
        match self {
            TransportError::InvalidRequest(_) => StatusCode::INTERNAL_SERVER_ERROR,
            TransportError::Request(_) => StatusCode::BAD_GATEWAY,
            TransportError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            TransportError::Status { status, .. } => *status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_error_keeps_upstream_body_in_message() {
        let err = TransportError::Status {
            status: StatusCode::TOO_MANY_REQUESTS,
            body: Bytes::from_static(b"{\"error\":\"slow down\"}"),
        };
        assert_eq!(err.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(err.to_string().contains("slow down"));
    }

    #[test]
    fn timeout_maps_to_gateway_timeout() {
        let err = TransportError::Timeout(Duration::from_secs(30));
        assert_eq!(err.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(err.to_string(), "upstream request timed out after 30s");
    }
}
