//! HTTP routes for the chat gateway.
//!
//! - `POST /api/chat` accepts a prompt, forwards it, and answers per the
//!   configured [`DeliveryMode`].
//! - `GET /api/chat/{request_id}` polls (optionally long-polls) a request.
//! - `POST /api/n8n-callback` receives the workflow's answer or error.

use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use cofe_core::tracing_init::preview;
use cofe_core::{Correlator, CorrelatorError, DeliveryMode, Outcome, RequestId};

use crate::error::ApiError;
use crate::forwarder::WorkflowForwarder;

/// Path the workflow engine posts answers to.
pub const CALLBACK_PATH: &str = "/api/n8n-callback";

/// Characters of prompt/answer text kept in log lines.
const LOG_PREVIEW_CHARS: usize = 100;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub correlator: Arc<Correlator>,
    pub forwarder: Arc<dyn WorkflowForwarder>,
    pub delivery_mode: DeliveryMode,
    /// Upper bound for any held-open submission or poll.
    pub await_timeout: Duration,
}

/// Build the gateway router with CORS and request tracing.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/api/chat", post(submit_prompt))
        .route("/api/chat/{request_id}", get(poll_result))
        .route(CALLBACK_PATH, post(workflow_callback))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub prompt: Option<String>,
}

/// Body returned for a prompt submission or poll.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatResponse {
    pub status: String,
    pub request_id: RequestId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ChatResponse {
    fn new(status: &str, request_id: RequestId) -> Self {
        Self {
            status: status.to_string(),
            request_id,
            response: None,
            error: None,
            message: None,
        }
    }
}

/// Render an [`Outcome`] as an HTTP response.
///
/// A timed-out wait is not an error: it is a `202` telling the client to
/// poll again.
fn outcome_response(request_id: RequestId, outcome: Outcome) -> Response {
    match outcome {
        Outcome::Fulfilled(text) => {
            let mut body = ChatResponse::new("completed", request_id);
            body.response = Some(text);
            (StatusCode::OK, Json(body)).into_response()
        }
        Outcome::Failed(reason) => {
            let mut body = ChatResponse::new("failed", request_id);
            body.error = Some(reason);
            (StatusCode::BAD_GATEWAY, Json(body)).into_response()
        }
        Outcome::Expired => {
            let mut body = ChatResponse::new("expired", request_id);
            body.message = Some("No response arrived before the request expired.".into());
            (StatusCode::GONE, Json(body)).into_response()
        }
        Outcome::TimedOut => {
            let mut body = ChatResponse::new("pending", request_id.clone());
            body.message = Some(format!(
                "Still processing. Poll GET /api/chat/{request_id} for the result."
            ));
            (StatusCode::ACCEPTED, Json(body)).into_response()
        }
    }
}

/// `GET /`
pub async fn root() -> &'static str {
    "Cofe Code API is running and waiting for workflow callbacks on /api/n8n-callback!"
}

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "pending": state.correlator.pending_count().await,
    }))
}

/// `POST /api/chat`
pub async fn submit_prompt(
    State(state): State<AppState>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload?;
    let prompt = request
        .prompt
        .filter(|p| !p.trim().is_empty())
        .ok_or_else(|| ApiError::Validation("Invalid or empty prompt provided.".into()))?;

    let request_id = state.correlator.register().await;
    info!(
        request_id = %request_id,
        prompt = %preview(&prompt, LOG_PREVIEW_CHARS),
        "Received prompt"
    );

    if let Err(e) = state.forwarder.forward(&prompt, &request_id).await {
        let message = e.to_string();
        warn!(request_id = %request_id, error = %message, "Forwarding to workflow failed");
        match state.correlator.fail(request_id.as_str(), message.clone()).await {
            // The workflow answered before reporting an error; deliver that answer.
            Err(CorrelatorError::DuplicateDelivery { .. }) => {}
            result => {
                // The failure goes out in this response; nobody else will collect it.
                if result.is_ok() {
                    state.correlator.mark_delivered(request_id.as_str()).await;
                }
                return Err(ApiError::Forwarding {
                    request_id,
                    message,
                });
            }
        }
    }

    match state.delivery_mode {
        DeliveryMode::AsyncAck => {
            let mut body = ChatResponse::new("processing", request_id);
            body.message = Some("Prompt received. Processing via webhook...".into());
            Ok((StatusCode::ACCEPTED, Json(body)).into_response())
        }
        DeliveryMode::LongPoll => {
            let outcome = state
                .correlator
                .await_result(request_id.as_str(), state.await_timeout)
                .await?;
            Ok(outcome_response(request_id, outcome))
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct PollQuery {
    /// Seconds to hold the poll open; capped at the await timeout.
    #[serde(default)]
    pub wait: Option<u64>,
}

/// `GET /api/chat/{request_id}`
pub async fn poll_result(
    State(state): State<AppState>,
    request_id: Result<Path<String>, PathRejection>,
    query: Result<Query<PollQuery>, QueryRejection>,
) -> Result<Response, ApiError> {
    let Path(request_id) = request_id?;
    let Query(query) = query?;
    let wait = query
        .wait
        .map_or(Duration::ZERO, Duration::from_secs)
        .min(state.await_timeout);
    let outcome = state.correlator.await_result(&request_id, wait).await?;
    Ok(outcome_response(RequestId::from(request_id), outcome))
}

/// Payload the workflow engine posts back.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackPayload {
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub response: Option<String>,
    /// Free-form: workflow engines send either a string or an error object.
    #[serde(default)]
    pub error: Option<serde_json::Value>,
}

fn error_text(error: &serde_json::Value) -> Option<String> {
    match error {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) if s.trim().is_empty() => None,
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Object(map) => Some(
            map.get("message")
                .and_then(serde_json::Value::as_str)
                .map_or_else(|| error.to_string(), str::to_string),
        ),
        other => Some(other.to_string()),
    }
}

/// `POST /api/n8n-callback`
pub async fn workflow_callback(
    State(state): State<AppState>,
    payload: Result<Json<CallbackPayload>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(callback) = payload?;

    let request_id = callback
        .request_id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| ApiError::Validation("Missing requestId in callback.".into()))?;

    let answer = callback.response.filter(|r| !r.is_empty());
    let result = match (answer, callback.error.as_ref().and_then(error_text)) {
        (Some(text), _) => {
            info!(
                request_id = %request_id,
                response = %preview(&text, LOG_PREVIEW_CHARS),
                "Workflow callback with response"
            );
            state.correlator.fulfill(&request_id, text).await
        }
        (None, Some(reason)) => {
            warn!(request_id = %request_id, error = %reason, "Workflow callback with error");
            state.correlator.fail(&request_id, reason).await
        }
        (None, None) => {
            return Err(ApiError::Validation(
                "Missing response or error in callback.".into(),
            ));
        }
    };

    result?;
    Ok(Json(serde_json::json!({
        "status": "success",
        "message": "Callback received and delivered.",
    }))
    .into_response())
}
