//! HTTP route handlers.

use std::sync::Arc;

use axum::{
    Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use crate::bridge::Bridge;
use crate::invocation::InvokeError;

#[derive(Debug, Deserialize)]
pub struct InvocationRequest {
    #[serde(default)]
    pub event: serde_json::Value,
    #[serde(default)]
    pub context: serde_json::Value,
}

/// Lambda-style error body.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationErrorResponse {
    pub error_message: String,
    pub error_type: &'static str,
}

impl From<&InvokeError> for InvocationErrorResponse {
    fn from(error: &InvokeError) -> Self {
        Self {
            error_message: error.to_string(),
            error_type: error.kind(),
        }
    }
}

/// Give the context a request id if the caller did not supply one.
fn with_request_id(context: serde_json::Value) -> serde_json::Value {
    let mut context = match context {
        serde_json::Value::Null => serde_json::json!({}),
        other => other,
    };
    if let Some(fields) = context.as_object_mut()
        && !fields.contains_key("awsRequestId")
    {
        fields.insert(
            "awsRequestId".to_string(),
            serde_json::Value::String(uuid::Uuid::new_v4().to_string()),
        );
    }
    context
}

async fn dispatch(bridge: &Bridge, path: &str, request: InvocationRequest) -> Response {
    let context = with_request_id(request.context);
    match bridge.invoke(path, request.event, context).await {
        Ok(result) => (StatusCode::OK, Json(result)).into_response(),
        Err(e) => {
            tracing::info!(path, error_type = e.kind(), "Invocation failed");
            let body = InvocationErrorResponse::from(&e);
            (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
        }
    }
}

async fn invoke_main(
    State(bridge): State<Arc<Bridge>>,
    Json(request): Json<InvocationRequest>,
) -> Response {
    dispatch(&bridge, "/", request).await
}

async fn invoke_route(
    State(bridge): State<Arc<Bridge>>,
    Path(route): Path<String>,
    Json(request): Json<InvocationRequest>,
) -> Response {
    let path = format!("/{}", route.trim_start_matches('/'));
    dispatch(&bridge, &path, request).await
}

async fn health(State(bridge): State<Arc<Bridge>>) -> Response {
    match bridge.snapshot().await {
        Some(snapshot) => (StatusCode::OK, Json(snapshot)).into_response(),
        None => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}

pub fn routes(bridge: Arc<Bridge>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/invoke", post(invoke_main))
        .route("/invoke/{*route}", post(invoke_route))
        .with_state(bridge)
}
