//! Configuration loading

use anyhow::Result;

use crate::Config;

/// Load configuration from a config file or environment variables
///
/// Config file search order:
/// 1. explicit path (CLI flag)
/// 2. `TOOLRELAY_CONFIG_PATH` environment variable
/// 3. ./config.yaml (current working directory)
/// 4. /config/config.yaml (Kubernetes mount path)
/// 5. Fall back to environment variables only
///
/// Logging is not initialized yet when this runs, so progress goes to stderr.
pub fn load_config(explicit_path: Option<&str>) -> Result<Config> {
    let config_path = explicit_path
        .map(str::to_string)
        .or_else(|| {
            std::env::var("TOOLRELAY_CONFIG_PATH")
                .ok()
                .filter(|p| std::path::Path::new(p).exists())
        })
        .or_else(|| {
            ["config.yaml", "/config/config.yaml"]
                .into_iter()
                .find(|p| std::path::Path::new(p).exists())
                .map(str::to_string)
        });

    let config = if let Some(path) = config_path {
        eprintln!("Loading config from {path}");
        Config::from_file(&path)
            .map_err(|e| anyhow::anyhow!("Failed to load {path}: {e}"))?
    } else {
        eprintln!("No config file found, using environment variables");
        Config::from_env().map_err(|e| anyhow::anyhow!("Failed to load config: {e}"))?
    };

    Ok(config)
}

/// Validate a loaded configuration, folding every problem into one error.
pub fn ensure_valid(config: &Config) -> Result<()> {
    if let Err(errors) = config.validate() {
        return Err(crate::Error::Configuration(format!(
            "validation failed with {} error(s): {}",
            errors.len(),
            errors.join("; ")
        ))
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_valid_reports_all_errors() {
        let mut config = Config::default();
        config.logging.format = "xml".to_string();
        let err = ensure_valid(&config).unwrap_err().to_string();
        assert!(err.contains("2 error(s)"));
        assert!(err.contains("broker.url"));
        assert!(err.contains("logging.format"));
    }
}
