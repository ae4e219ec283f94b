//! Request forwarder - posts envelopes to the worker's local listener.
//!
//! Flow:
//! 1. Wrap event + context in a [`RequestEnvelope`] (tolerant body decode)
//! 2. POST it as JSON to `<worker_url><path>`
//! 3. Normalize the response: status >= 400 becomes a [`HandlerFailure`],
//!    anything else is the decoded body (or the raw string)

use crate::envelope::{HandlerFailure, RequestEnvelope, ResponseEnvelope, flatten_headers};

/// Default address of the worker's listener.
pub const DEFAULT_WORKER_URL: &str = "http://localhost:9999";

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("worker unreachable: {0}")]
    Transport(#[source] reqwest::Error),
    /// Display is the JSON serialization of the failure.
    #[error("{0}")]
    Handler(HandlerFailure),
}

impl ForwardError {
    pub fn handler_failure(&self) -> Option<&HandlerFailure> {
        match self {
            Self::Handler(failure) => Some(failure),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Forwarder {
    client: reqwest::Client,
    worker_url: String,
}

impl Forwarder {
    pub fn new(worker_url: impl Into<String>) -> Self {
        Self::with_client(worker_url, reqwest::Client::new())
    }

    pub fn with_client(worker_url: impl Into<String>, client: reqwest::Client) -> Self {
        let worker_url = worker_url.into().trim_end_matches('/').to_string();
        Self { client, worker_url }
    }

    pub fn worker_url(&self) -> &str {
        &self.worker_url
    }

    fn route_url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.worker_url, path)
        } else {
            format!("{}/{}", self.worker_url, path)
        }
    }

    pub async fn forward(
        &self,
        path: &str,
        event: serde_json::Value,
        context: serde_json::Value,
    ) -> Result<serde_json::Value, ForwardError> {
        let envelope = RequestEnvelope::new(event, context);
        let body = serde_json::to_vec(&envelope)?;

        tracing::debug!(path, content_length = body.len(), "Forwarding request to worker");

        let response = self
            .client
            .post(self.route_url(path))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(ForwardError::Transport)?;

        let status = response.status().as_u16();
        let headers = flatten_headers(response.headers());
        let text = response.text().await.map_err(ForwardError::Transport)?;

        match ResponseEnvelope::from_parts(status, headers, text) {
            ResponseEnvelope::Success(value) => Ok(value),
            ResponseEnvelope::Failure(failure) => {
                tracing::debug!(path, status, "Worker reported handler failure");
                Err(ForwardError::Handler(failure))
            }
        }
    }
}

impl Default for Forwarder {
    fn default() -> Self {
        Self::new(DEFAULT_WORKER_URL)
    }
}
