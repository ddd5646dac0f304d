use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, writer::BoxMakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::config::LoggingConfig;

/// Dependencies whose chatter is capped at `warn` unless `RUST_LOG` says otherwise
const QUIET_TARGETS: &[&str] = &["hyper", "h2", "redis", "tower"];

/// Initialize structured logging based on configuration
///
/// JSON output is meant for production, pretty output for development.
/// `RUST_LOG` takes precedence over the configured level.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let level = parse_log_level(&config.level)?;
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(filter_directives(level)))?;
    let writer = make_writer(config.file_path.as_deref())?;

    let registry = tracing_subscriber::registry().with(env_filter);

    if config.format.as_str() == "json" {
        let layer = fmt::layer()
            .json()
            .with_span_events(FmtSpan::CLOSE)
            .with_current_span(true)
            .with_target(true)
            .with_line_number(true)
            .with_writer(writer);
        registry.with(layer).try_init()?;
    } else {
        let layer = fmt::layer()
            .pretty()
            .with_target(true)
            .with_line_number(true)
            .with_file(false)
            .with_writer(writer);
        registry.with(layer).try_init()?;
    }

    Ok(())
}

/// Append to `file_path` when set, stdout otherwise
fn make_writer(file_path: Option<&str>) -> anyhow::Result<BoxMakeWriter> {
    Ok(match file_path {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| anyhow::anyhow!("Failed to open log file {path}: {e}"))?;
            BoxMakeWriter::new(Arc::new(file))
        }
        None => BoxMakeWriter::new(std::io::stdout),
    })
}

fn filter_directives(level: Level) -> String {
    let mut directives = level.as_str().to_lowercase();
    // Only quiet dependencies when they would otherwise be louder than warn.
    if level > Level::WARN {
        for target in QUIET_TARGETS {
            directives.push_str(&format!(",{target}=warn"));
        }
    }
    directives
}

fn parse_log_level(level: &str) -> anyhow::Result<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" | "warning" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(anyhow::anyhow!("Invalid log level: {level}")),
    }
}
