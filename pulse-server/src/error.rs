//! HTTP error responses.
//!
//! Every failure leaves the server as JSON `{code, message}` with a status
//! derived from the error taxonomy. Transient failures answer 503 so that
//! providers redeliver the webhook later.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use pulse_core::{ErrorKind, PulseError};
use serde::Serialize;
use std::fmt;

pub type ApiResult<T> = Result<T, ApiError>;

/// Structured error body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApiError {
    #[serde(skip)]
    pub status: StatusCode,
    pub code: String,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, ErrorKind::NotFound.as_str(), message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, ErrorKind::Validation.as_str(), message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
    }
}

/// Status for each taxonomy kind.
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Auth => StatusCode::UNAUTHORIZED,
        ErrorKind::Permission => StatusCode::FORBIDDEN,
        ErrorKind::Transient => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Permanent => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::NoSignal => StatusCode::UNPROCESSABLE_ENTITY,
    }
}

impl From<PulseError> for ApiError {
    fn from(err: PulseError) -> Self {
        let kind = err.kind();
        // Store faults carry driver text; keep it in the log only.
        let message = match kind {
            ErrorKind::Transient => {
                tracing::warn!(error = %err, "Request failed transiently");
                "temporarily unavailable, retry later".to_string()
            }
            _ => err.to_string(),
        };
        Self::new(status_for(kind), kind.as_str(), message)
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status;
        (status, Json(self)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_core::{IntegrationError, StorageError};

    #[test]
    fn test_kind_to_status() {
        let err: ApiError = PulseError::not_found("customer", "c1").into();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        assert_eq!(err.code, "not_found");

        let err: ApiError = PulseError::from(IntegrationError::auth("stripe", "bad signature")).into();
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);

        let err: ApiError = PulseError::validation("code", "missing").into();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_transient_hides_detail() {
        let err: ApiError = PulseError::from(StorageError::fault("connection reset by peer")).into();
        assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(!err.message.contains("peer"));
    }

    #[test]
    fn test_body_has_code_and_message() {
        let body = serde_json::to_value(ApiError::bad_request("nope")).unwrap();
        assert_eq!(body, serde_json::json!({"code": "validation", "message": "nope"}));
    }
}
