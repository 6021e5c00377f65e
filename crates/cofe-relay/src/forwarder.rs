//! Outbound calls to the workflow webhook.
//!
//! The relay posts `{ "prompt", "requestId" }` to the configured webhook and
//! treats any transport error or non-2xx status as a forwarding failure.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use cofe_core::RequestId;

/// Longest slice of an error response body kept in [`ForwardError::Status`].
const MAX_ERROR_BODY: usize = 200;

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Workflow endpoint returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("No workflow webhook configured")]
    NotConfigured,
}

/// Hands a prompt to the external workflow engine.
#[async_trait]
pub trait WorkflowForwarder: Send + Sync {
    async fn forward(&self, prompt: &str, request_id: &RequestId) -> Result<(), ForwardError>;
}

/// JSON body sent to the webhook.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardPayload<'a> {
    pub prompt: &'a str,
    pub request_id: &'a str,
}

/// Forwarder backed by a reqwest client.
#[derive(Debug)]
pub struct HttpWorkflowForwarder {
    http: reqwest::Client,
    webhook_url: String,
}

impl HttpWorkflowForwarder {
    pub fn new(webhook_url: impl Into<String>, timeout: Duration) -> Result<Self, ForwardError> {
        // reqwest is built with rustls-no-provider; `Err` means already installed.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            webhook_url: webhook_url.into(),
        })
    }
}

#[async_trait]
impl WorkflowForwarder for HttpWorkflowForwarder {
    async fn forward(&self, prompt: &str, request_id: &RequestId) -> Result<(), ForwardError> {
        let payload = ForwardPayload {
            prompt,
            request_id: request_id.as_str(),
        };
        let resp = self.http.post(&self.webhook_url).json(&payload).send().await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ForwardError::Status {
                status: status.as_u16(),
                body: body.chars().take(MAX_ERROR_BODY).collect(),
            });
        }

        debug!(request_id = %request_id, status = status.as_u16(), "Prompt forwarded to workflow");
        Ok(())
    }
}

/// Stand-in used when no webhook URL is configured: every forward fails fast.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnconfiguredForwarder;

#[async_trait]
impl WorkflowForwarder for UnconfiguredForwarder {
    async fn forward(&self, _prompt: &str, _request_id: &RequestId) -> Result<(), ForwardError> {
        Err(ForwardError::NotConfigured)
    }
}
