// Module: http
// Streaming, relay and introspection endpoints

pub mod error;
pub mod health;
pub mod mcp;

use axum::{routing::get, routing::post, Router};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use toolrelay_cluster::{Relay, SessionRegistry, SharedBroker, SharedHandler, StreamConfig};
use toolrelay_core::config::RelayConfig;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use error::{AppError, AppResult};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub broker: SharedBroker,
    pub relay: Relay,
    pub registry: SessionRegistry,
    pub handler: SharedHandler,
    pub stream_config: StreamConfig,
    pub request_timeout: Duration,
    /// Cancelled when the server begins shutting down
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        broker: SharedBroker,
        handler: SharedHandler,
        config: &RelayConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let request_timeout = config.request_timeout();
        Self {
            relay: Relay::new(Arc::clone(&broker), request_timeout),
            registry: SessionRegistry::new(Arc::clone(&broker), request_timeout),
            broker,
            handler,
            stream_config: StreamConfig::from(config),
            request_timeout,
            shutdown,
        }
    }
}

/// Create the HTTP router
pub fn create_router(state: AppState) -> Router {
    let router = Router::new()
        .merge(health::create_health_router())
        // Streaming endpoint and direct invocation
        .route("/mcp", get(mcp::stream_with_accept).post(mcp::direct))
        .route("/mcp/sse", get(mcp::stream))
        // Unary relay endpoint
        .route("/mcp/message", post(mcp::message));

    // Apply layers before state
    let router = router
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http());

    // Apply state to all routes (must be last)
    router.with_state(state)
}
