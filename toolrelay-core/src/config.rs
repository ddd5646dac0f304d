use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub broker: BrokerConfig,
    pub relay: RelayConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub http_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            http_port: 8080,
        }
    }
}

/// Broker connection settings
///
/// `redis://` / `rediss://` select the Redis broker, `memory://` an
/// in-process bus usable only when a single instance serves every request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// How long a unary caller waits for the correlated reply
    pub request_timeout_seconds: u64,
    /// Hard limit imposed by the hosting environment on one streaming connection
    pub max_duration_seconds: u64,
    /// Subtracted from `max_duration_seconds` so teardown finishes in time
    pub safety_margin_seconds: u64,
    pub keepalive_interval_seconds: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            request_timeout_seconds: 10,
            max_duration_seconds: 300,
            safety_margin_seconds: 5,
            keepalive_interval_seconds: 30,
        }
    }
}

impl RelayConfig {
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    /// Lifetime granted to a streaming connection before forced teardown
    #[must_use]
    pub const fn effective_max_duration(&self) -> Duration {
        Duration::from_secs(
            self.max_duration_seconds
                .saturating_sub(self.safety_margin_seconds),
        )
    }

    #[must_use]
    pub const fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // TOOLRELAY_BROKER__URL, TOOLRELAY_RELAY__REQUEST_TIMEOUT_SECONDS, ...
        builder = builder.add_source(
            Environment::with_prefix("TOOLRELAY")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only (for Docker/K8s)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Check every setting, returning all problems at once.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.broker.url.trim().is_empty() {
            errors.push("broker.url is required".to_string());
        } else {
            match url::Url::parse(&self.broker.url) {
                Ok(url) if matches!(url.scheme(), "redis" | "rediss" | "memory") => {}
                Ok(url) => errors.push(format!(
                    "broker.url has unsupported scheme '{}' (expected redis, rediss or memory)",
                    url.scheme()
                )),
                Err(e) => errors.push(format!("broker.url is not a valid URL: {e}")),
            }
        }

        if self.server.http_port == 0 {
            errors.push("server.http_port must be greater than 0".to_string());
        }

        let relay = &self.relay;
        if relay.request_timeout_seconds == 0 {
            errors.push("relay.request_timeout_seconds must be greater than 0".to_string());
        }
        if relay.keepalive_interval_seconds == 0 {
            errors.push("relay.keepalive_interval_seconds must be greater than 0".to_string());
        }
        if relay.max_duration_seconds <= relay.safety_margin_seconds {
            errors.push(format!(
                "relay.max_duration_seconds ({}) must exceed relay.safety_margin_seconds ({})",
                relay.max_duration_seconds, relay.safety_margin_seconds
            ));
        } else if relay.request_timeout() >= relay.effective_max_duration() {
            // A request could never complete inside the session that serves it.
            errors.push(format!(
                "relay.request_timeout_seconds ({}) must be shorter than max_duration - safety_margin ({}s)",
                relay.request_timeout_seconds,
                relay.effective_max_duration().as_secs()
            ));
        }

        if !matches!(
            self.logging.level.to_lowercase().as_str(),
            "trace" | "debug" | "info" | "warn" | "warning" | "error"
        ) {
            errors.push(format!("logging.level '{}' is invalid", self.logging.level));
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format '{}' is invalid (expected json or pretty)",
                self.logging.format
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    #[must_use]
    pub fn broker_url(&self) -> &str {
        &self.broker.url
    }

    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.http_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config {
            broker: BrokerConfig {
                url: "redis://127.0.0.1:6379".to_string(),
            },
            ..Config::default()
        }
    }

    #[test]
    fn test_default_relay_timings() {
        let relay = RelayConfig::default();
        assert_eq!(relay.request_timeout(), Duration::from_secs(10));
        assert_eq!(relay.effective_max_duration(), Duration::from_secs(295));
        assert_eq!(relay.keepalive_interval(), Duration::from_secs(30));
    }

    #[test]
    fn test_missing_broker_url_is_rejected() {
        let errors = Config::default().validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("broker.url is required")));
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(valid_config().validate().is_ok());

        let mut memory = valid_config();
        memory.broker.url = "memory://".to_string();
        assert!(memory.validate().is_ok());
    }

    #[test]
    fn test_unsupported_scheme_is_rejected() {
        let mut config = valid_config();
        config.broker.url = "nats://localhost:4222".to_string();
        let errors = config.validate().unwrap_err();
        assert!(errors[0].contains("unsupported scheme"));
    }

    #[test]
    fn test_request_timeout_must_fit_inside_session() {
        let mut config = valid_config();
        config.relay.max_duration_seconds = 12;
        config.relay.safety_margin_seconds = 5;
        config.relay.request_timeout_seconds = 10;
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("request_timeout_seconds")));

        config.relay.max_duration_seconds = 5;
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("must exceed")));
    }

    #[test]
    fn test_http_address() {
        let mut config = valid_config();
        config.server.host = "127.0.0.1".to_string();
        config.server.http_port = 9000;
        assert_eq!(config.http_address(), "127.0.0.1:9000");
    }
}
