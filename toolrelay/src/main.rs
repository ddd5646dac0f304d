mod server;

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};

use toolrelay_api::impls::{ToolHandler, ToolRegistry};
use toolrelay_core::{
    bootstrap::{ensure_valid, load_config},
    logging,
};

use server::ToolRelayServer;

#[derive(Parser, Debug)]
#[command(name = "toolrelay")]
#[command(about = "Stateless relay for streaming tool-protocol sessions", long_about = None)]
struct Args {
    /// Path to a YAML/TOML config file
    #[arg(long, env = "TOOLRELAY_CONFIG_PATH")]
    config: Option<String>,

    /// Broker URL (redis://, rediss:// or memory://)
    #[arg(long, env = "TOOLRELAY_BROKER__URL")]
    broker_url: Option<String>,

    /// HTTP listen port
    #[arg(long, env = "TOOLRELAY_SERVER__HTTP_PORT")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load configuration, flags win over file and environment
    let mut config = load_config(args.config.as_deref())?;
    if let Some(url) = args.broker_url {
        config.broker.url = url;
    }
    if let Some(port) = args.port {
        config.server.http_port = port;
    }

    // 2. Fail fast on misconfiguration
    if let Err(e) = ensure_valid(&config) {
        eprintln!("Config validation error: {e}");
        return Err(e);
    }

    // 3. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("ToolRelay starting...");
    info!("HTTP address: {}", config.http_address());
    info!(
        request_timeout_secs = config.relay.request_timeout_seconds,
        max_stream_secs = config.relay.effective_max_duration().as_secs(),
        keepalive_secs = config.relay.keepalive_interval_seconds,
        "Relay timings"
    );

    // 4. Connect to the broker; nothing works without it
    let broker = toolrelay_cluster::broker::connect(config.broker_url())
        .await
        .map_err(|e| {
            error!("Failed to connect to broker: {}", e);
            anyhow::anyhow!("Broker connection failed: {e}")
        })?;
    info!("Broker connected");

    // 5. Protocol handler
    let tools = Arc::new(ToolRegistry::with_builtin());
    info!(tools = tools.len(), "Tool registry ready");
    let handler = Arc::new(ToolHandler::new(tools));

    // 6. Serve until a shutdown signal arrives
    ToolRelayServer::new(config, broker, handler).start().await
}
