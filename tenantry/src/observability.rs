//! Tracing subscriber setup

use tracing_subscriber::EnvFilter;

use crate::{config::Config, error::Result};

/// Build the log filter: `RUST_LOG` when set, else the configured level
fn env_filter(config: &Config) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.service.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global tracing subscriber
///
/// Emits JSON records unless `service.json_logs` is off. Installing twice
/// is an error.
pub fn init_tracing(config: &Config) -> Result<()> {
    let builder = tracing_subscriber::fmt().with_env_filter(env_filter(config));
    let installed = if config.service.json_logs {
        builder.json().try_init()
    } else {
        builder.compact().try_init()
    };
    installed.map_err(|e| crate::error::Error::Internal(format!("Failed to initialize tracing: {}", e)))?;

    tracing::info!("Tracing initialized for service: {}", config.service.name);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_level_falls_back() {
        let mut config = Config::default();
        config.service.log_level = "registers=nonsense[".to_string();
        // Must not panic
        let _ = env_filter(&config);
    }

    #[test]
    fn test_second_init_is_an_error() {
        let config = Config::default();
        let _ = init_tracing(&config);
        assert!(init_tracing(&config).is_err());
    }
}
