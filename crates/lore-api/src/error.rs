//! API error types and JSON error response formatting.
//!
//! ApiError carries a [`LoreError`] to the edge of the HTTP layer and maps its
//! class to a status code and a consistent JSON body.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::json;

use lore_core::error::LoreError;

/// JSON error response body.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    /// Machine-readable error code (e.g., "validation_error", "not_found").
    pub error: String,
    /// Human-readable error message.
    pub message: String,
    /// Whether repeating the same request later may succeed.
    pub retryable: bool,
    /// Optional structured details about the error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// API error type that maps to HTTP status codes and JSON responses.
#[derive(Debug)]
pub struct ApiError(pub LoreError);

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            LoreError::Validation(_) => StatusCode::BAD_REQUEST,
            LoreError::NotFound { .. } => StatusCode::NOT_FOUND,
            LoreError::ResourceExhausted { .. } => StatusCode::TOO_MANY_REQUESTS,
            LoreError::ProviderUnavailable { .. } | LoreError::ProviderTransient { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            LoreError::ProviderPermanent(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn details(&self) -> Option<serde_json::Value> {
        match &self.0 {
            LoreError::NotFound { entity, id } => Some(json!({"entity": entity, "id": id})),
            LoreError::ResourceExhausted {
                resource,
                retry_after,
            } => Some(json!({
                "resource": resource,
                "retry_after_ms": retry_after.as_millis() as u64,
            })),
            LoreError::ProviderUnavailable { retry_after } => {
                Some(json!({"retry_after_ms": retry_after.as_millis() as u64}))
            }
            LoreError::ProviderTransient { kind, .. } => Some(json!({"kind": kind.to_string()})),
            LoreError::DimensionMismatch {
                entity,
                expected,
                actual,
            } => Some(json!({"entity": entity, "expected": expected, "actual": actual})),
            _ => None,
        }
    }

    fn retry_after_secs(&self) -> Option<u64> {
        match &self.0 {
            LoreError::ResourceExhausted { retry_after, .. }
            | LoreError::ProviderUnavailable { retry_after } => {
                Some(retry_after.as_secs_f64().ceil().max(1.0) as u64)
            }
            _ => None,
        }
    }
}

impl From<LoreError> for ApiError {
    fn from(err: LoreError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(code = self.0.code(), error = %self.0, "Request failed");
        }

        let body = ErrorBody {
            error: self.0.code().to_string(),
            message: self.0.to_string(),
            retryable: self.0.is_retryable(),
            details: self.details(),
        };
        let retry_after = self.retry_after_secs();

        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use lore_core::error::TransientKind;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (LoreError::validation("x"), StatusCode::BAD_REQUEST),
            (LoreError::not_found("character", "abc"), StatusCode::NOT_FOUND),
            (
                LoreError::ResourceExhausted {
                    resource: "connection_pool",
                    retry_after: Duration::from_millis(200),
                },
                StatusCode::TOO_MANY_REQUESTS,
            ),
            (
                LoreError::ProviderUnavailable {
                    retry_after: Duration::from_secs(30),
                },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                LoreError::transient(TransientKind::Timeout, "slow"),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (LoreError::ProviderPermanent("bad key".into()), StatusCode::BAD_GATEWAY),
            (
                LoreError::DimensionMismatch {
                    entity: "fact".into(),
                    expected: 8,
                    actual: 4,
                },
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (LoreError::Storage("disk".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError(err).status(), status);
        }
    }

    #[test]
    fn test_retry_after_header() {
        let response = ApiError(LoreError::ResourceExhausted {
            resource: "rate_limiter",
            retry_after: Duration::from_millis(1_500),
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "2");
    }
}
