//! HTTP surface: the webhook endpoint plus health and debug routes

use axum::{
    extract::{Json, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use relay_engine::Dispatcher;
use serde_json::json;
use std::sync::Arc;
use tracing::warn;

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub webhook_token: Option<String>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/tv", post(handle_tv))
        .route("/health", get(handle_health))
        .route("/healthz", get(handle_health))
        .route("/debug/seen", get(handle_debug_seen))
        .route("/debug/chain", get(handle_debug_chain))
        .with_state(state)
}

/// Webhook ingress. The token, when configured, is compared verbatim.
async fn handle_tv(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Response {
    if let Some(expected) = &state.webhook_token {
        let provided = headers
            .get("x-webhook-token")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if provided != expected {
            warn!("Webhook token mismatch");
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({"ok": false, "error": "unauthorized"})),
            )
                .into_response();
        }
    }

    match state.dispatcher.handle(&body).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(json!({"ok": false, "error": e.to_string()})),
        )
            .into_response(),
    }
}

async fn handle_health() -> Response {
    (StatusCode::OK, Json(json!({"ok": true}))).into_response()
}

async fn handle_debug_seen(State(state): State<AppState>) -> Response {
    let entries: Vec<serde_json::Value> = state
        .dispatcher
        .engine()
        .state
        .seen
        .snapshot()
        .into_iter()
        .map(|(fingerprint, age_ms)| json!({"fingerprint": fingerprint, "age_ms": age_ms}))
        .collect();
    (
        StatusCode::OK,
        Json(json!({"count": entries.len(), "entries": entries})),
    )
        .into_response()
}

async fn handle_debug_chain(State(state): State<AppState>) -> Response {
    let chains = state.dispatcher.engine().state.chains.snapshot();
    (
        StatusCode::OK,
        Json(json!({"count": chains.len(), "chains": chains})),
    )
        .into_response()
}
