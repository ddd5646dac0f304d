use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use toolrelay_api::http::{create_router, AppState};
use toolrelay_cluster::{SharedBroker, SharedHandler};
use toolrelay_core::Config;

/// How long open sessions get to finish teardown after the listener stops
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// `ToolRelay` server - owns the HTTP listener and the session registry
pub struct ToolRelayServer {
    config: Config,
    state: AppState,
}

impl ToolRelayServer {
    pub fn new(config: Config, broker: SharedBroker, handler: SharedHandler) -> Self {
        let state = AppState::new(broker, handler, &config.relay, CancellationToken::new());
        Self { config, state }
    }

    /// Serve HTTP and wait for a shutdown signal
    pub async fn start(self) -> anyhow::Result<()> {
        let http_address = self.config.http_address();
        let listener = tokio::net::TcpListener::bind(&http_address)
            .await
            .map_err(|e| {
                error!("Failed to bind HTTP address {}: {}", http_address, e);
                anyhow::anyhow!("Failed to bind {http_address}: {e}")
            })?;
        info!("HTTP server listening on {}", http_address);

        let router = create_router(self.state.clone());

        // Cancelling the token ends every event stream, which lets the
        // graceful shutdown below complete.
        let shutdown = self.state.shutdown.clone();
        let graceful = async move {
            shutdown_signal().await;
            info!("Shutdown signal received, closing event streams...");
            shutdown.cancel();
        };

        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(graceful)
            .await
        {
            error!("HTTP server error: {}", e);
        }
        info!("HTTP server shut down gracefully");

        self.shutdown().await;
        Ok(())
    }

    async fn shutdown(&self) {
        info!("Shutting down ToolRelay...");
        self.state.shutdown.cancel();

        if tokio::time::timeout(DRAIN_TIMEOUT, self.state.registry.shutdown())
            .await
            .is_err()
        {
            warn!(
                remaining = self.state.registry.len(),
                "Timed out deregistering sessions"
            );
        }

        let pending = self.state.relay.pending_count();
        if pending > 0 {
            warn!(pending, "Abandoning in-flight relayed requests");
        }

        self.state.broker.shutdown();

        info!("ToolRelay shutdown complete");
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}
