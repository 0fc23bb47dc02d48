//! # Structured Logging
//!
//! Installs the global `tracing` subscriber. The level comes from the
//! configuration unless `RUST_LOG` is set, and output is either human readable
//! or one JSON object per line.

use crate::config::ObservabilityConfig;
use crate::errors::{LeafCertError, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Build the filter for the configured level, letting `RUST_LOG` win when present.
pub fn build_env_filter(config: &ObservabilityConfig) -> Result<EnvFilter> {
    if std::env::var("RUST_LOG").is_ok() {
        return Ok(EnvFilter::from_default_env());
    }
    EnvFilter::try_new(&config.log_level).map_err(|e| {
        LeafCertError::config(format!("Invalid log level '{}': {}", config.log_level, e))
    })
}

/// Initialize the global tracing subscriber.
///
/// Returns a configuration error if the level is invalid or a global subscriber
/// is already installed (tests commonly install their own).
pub fn init_logging(config: &ObservabilityConfig) -> Result<()> {
    let filter = build_env_filter(config)?;
    let registry = tracing_subscriber::registry().with(filter);

    let result = if config.json_logging {
        registry.with(tracing_subscriber::fmt::layer().json().with_current_span(false)).try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer().with_target(true)).try_init()
    };

    result.map_err(|e| LeafCertError::config(format!("Failed to initialize logging: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_level_is_rejected() {
        if std::env::var("RUST_LOG").is_ok() {
            return;
        }
        let config = ObservabilityConfig { log_level: "flowplane_leafcert=loudest".to_string(), ..Default::default() };
        assert!(matches!(build_env_filter(&config), Err(LeafCertError::Config { .. })));
    }

    #[test]
    fn test_valid_level_builds_filter() {
        let config = ObservabilityConfig {
            log_level: "flowplane_leafcert=debug,warn".to_string(),
            ..Default::default()
        };
        assert!(build_env_filter(&config).is_ok());
    }
}
