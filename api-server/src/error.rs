//! Error responses
//!
//! Every failure body carries a stable `error.code`, a human message,
//! and the request id. Routing failures additionally surface the
//! override outcome so clients can see why.

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use inference_fabric_contracts::RouterError;
use serde_json::json;

#[derive(Debug)]
pub struct ApiError {
    pub error: RouterError,
    pub request_id: String,
}

impl ApiError {
    pub fn new(error: RouterError, request_id: impl Into<String>) -> Self {
        Self {
            error,
            request_id: request_id.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>, request_id: impl Into<String>) -> Self {
        Self::new(
            RouterError::InvalidAnnotation {
                message: message.into(),
            },
            request_id,
        )
    }

    fn status(&self) -> StatusCode {
        match &self.error {
            RouterError::NoCandidate { .. } => StatusCode::SERVICE_UNAVAILABLE,
            RouterError::ProfileDisallowedTarget { .. } => StatusCode::CONFLICT,
            RouterError::BackendTransient { .. } => StatusCode::SERVICE_UNAVAILABLE,
            RouterError::BackendPermanent { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            RouterError::BreakerOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            RouterError::ModelUnsupported { .. } => StatusCode::BAD_REQUEST,
            RouterError::InvalidAnnotation { .. } => StatusCode::BAD_REQUEST,
            RouterError::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
            // Client closed request, in the nginx tradition
            RouterError::Cancelled => StatusCode::from_u16(499)
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            RouterError::InternalInvariant { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn retryable(&self) -> bool {
        matches!(
            self.error,
            RouterError::NoCandidate { .. }
                | RouterError::BackendTransient { .. }
                | RouterError::BreakerOpen { .. }
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = json!({
            "error": {
                "code": self.error.code(),
                "message": self.error.to_string(),
                "request_id": self.request_id,
            }
        });
        let mut response = (status, Json(body)).into_response();
        if self.retryable() {
            response.headers_mut().insert(
                "X-Retry-Hint",
                HeaderValue::from_static("retry-after-cooldown"),
            );
        }
        response
    }
}
