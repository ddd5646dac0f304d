//! Health, session introspection and metrics endpoints

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde_json::json;

use crate::http::AppState;

pub fn create_health_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/sessions", get(list_sessions))
        .route("/metrics", get(metrics))
}

/// Basic health check (always returns OK if server is running)
pub async fn health_check() -> impl IntoResponse {
    "OK"
}

/// Sessions hosted by this instance
pub async fn list_sessions(State(state): State<AppState>) -> impl IntoResponse {
    let sessions = state.registry.list();
    Json(json!({
        "count": sessions.len(),
        "pendingRequests": state.relay.pending_count(),
        "sessions": sessions,
    }))
}

/// Prometheus text exposition
pub async fn metrics() -> impl IntoResponse {
    match toolrelay_core::metrics::gather_metrics() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("Failed to gather metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
