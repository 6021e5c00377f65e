//! HTTP-facing error type for the gateway handlers.

use axum::Json;
use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use cofe_core::{CorrelatorError, RequestId};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Bad or missing client input.
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    /// The request already reached a terminal state. Acknowledged, not failed.
    #[error("{0}")]
    AlreadyResolved(String),

    #[error("{0}")]
    TooManyWaiters(String),

    /// The workflow endpoint could not be reached; the request is already failed.
    #[error("Failed to send prompt to processing service: {message}")]
    Forwarding {
        request_id: RequestId,
        message: String,
    },
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::Validation(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::Validation(rejection.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        Self::Validation(rejection.body_text())
    }
}

impl From<CorrelatorError> for ApiError {
    fn from(err: CorrelatorError) -> Self {
        match err {
            CorrelatorError::NotFound(_) => Self::NotFound(err.to_string()),
            CorrelatorError::DuplicateDelivery { state, .. } => {
                Self::AlreadyResolved(format!("Request already {state}; callback ignored."))
            }
            CorrelatorError::TooManyWaiters { .. } => Self::TooManyWaiters(err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::AlreadyResolved(_) => StatusCode::OK,
            Self::TooManyWaiters(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::Forwarding { .. } => StatusCode::BAD_GATEWAY,
        };
        let body = match self {
            Self::Forwarding {
                request_id,
                message,
            } => json!({
                "status": "failed",
                "requestId": request_id,
                "error": message,
            }),
            Self::AlreadyResolved(message) => json!({
                "status": "duplicate",
                "message": message,
            }),
            other => json!({
                "status": "error",
                "message": other.to_string(),
            }),
        };
        (status, Json(body)).into_response()
    }
}
