//! # Configuration Settings
//!
//! Defines the tunables of the leaf certificate manager and its observability.

use crate::errors::{LeafCertError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::Validate;

/// Time an entry stays cached after the last `get` touching it.
pub const DEFAULT_LAST_GET_TTL: Duration = Duration::from_secs(72 * 60 * 60);

/// Number of CSR refreshes a single entry may burst.
pub const DEFAULT_REFRESH_MAX_BURST: u32 = 2;

/// Blocking timeout applied when a request does not carry one.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Window over which renewals after a root change, and retries after a
/// rate-limited CSR, are spread.
pub const CA_CHANGE_JITTER_WINDOW: Duration = Duration::from_secs(30);

/// Leaf certificate manager configuration.
///
/// A zero value in any field falls back to that field's own default when
/// [`LeafCertConfig::with_defaults`] runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeafCertConfig {
    /// How long an entry survives without being read before it is evicted
    /// and its background refreshing stops.
    pub last_get_ttl: Duration,

    /// Maximum CSR refreshes per second for a single entry. `None` means unlimited.
    pub refresh_rate: Option<f64>,

    /// Burst size of the per-entry refresh limiter.
    pub refresh_max_burst: u32,

    /// Fixed delay used instead of the random root-change jitter. Intended for tests.
    pub ca_change_initial_delay_override: Option<Duration>,
}

impl Default for LeafCertConfig {
    fn default() -> Self {
        Self {
            last_get_ttl: DEFAULT_LAST_GET_TTL,
            refresh_rate: None,
            refresh_max_burst: DEFAULT_REFRESH_MAX_BURST,
            ca_change_initial_delay_override: None,
        }
    }
}

impl LeafCertConfig {
    /// Replace unset (zero) tunables with their defaults, each independently.
    pub fn with_defaults(mut self) -> Self {
        if self.last_get_ttl.is_zero() {
            self.last_get_ttl = DEFAULT_LAST_GET_TTL;
        }
        if self.refresh_rate == Some(0.0) {
            self.refresh_rate = None;
        }
        if self.refresh_max_burst == 0 {
            self.refresh_max_burst = DEFAULT_REFRESH_MAX_BURST;
        }
        if self.ca_change_initial_delay_override.is_some_and(|d| d.is_zero()) {
            self.ca_change_initial_delay_override = None;
        }
        self
    }

    /// Validate the configuration after defaults have been applied
    pub fn validate(&self) -> Result<()> {
        if let Some(rate) = self.refresh_rate {
            if !rate.is_finite() || rate < 0.0 {
                return Err(LeafCertError::config(format!(
                    "Refresh rate must be a positive number of refreshes per second, got {}",
                    rate
                )));
            }
        }
        if self.last_get_ttl.is_zero() {
            return Err(LeafCertError::config("Last get TTL must be greater than zero"));
        }
        Ok(())
    }

    /// Load the leaf certificate settings from `FLOWPLANE_LEAFCERT_*` variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(value) = std::env::var("FLOWPLANE_LEAFCERT_LAST_GET_TTL_SECS") {
            let secs: u64 = value.parse().map_err(|e| {
                LeafCertError::config(format!("Invalid FLOWPLANE_LEAFCERT_LAST_GET_TTL_SECS: {}", e))
            })?;
            config.last_get_ttl = Duration::from_secs(secs);
        }

        if let Ok(value) = std::env::var("FLOWPLANE_LEAFCERT_REFRESH_RATE") {
            let rate: f64 = value.parse().map_err(|e| {
                LeafCertError::config(format!("Invalid FLOWPLANE_LEAFCERT_REFRESH_RATE: {}", e))
            })?;
            config.refresh_rate = Some(rate);
        }

        if let Ok(value) = std::env::var("FLOWPLANE_LEAFCERT_REFRESH_MAX_BURST") {
            config.refresh_max_burst = value.parse().map_err(|e| {
                LeafCertError::config(format!("Invalid FLOWPLANE_LEAFCERT_REFRESH_MAX_BURST: {}", e))
            })?;
        }

        let config = config.with_defaults();
        config.validate()?;
        Ok(config)
    }
}

/// Observability configuration for logging and metrics
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ObservabilityConfig {
    /// Enable metrics collection
    pub enable_metrics: bool,

    /// Metrics server port (0 = disabled)
    pub metrics_port: u16,

    /// Service name attached to exported metrics
    #[validate(length(min = 1, message = "Service name cannot be empty"))]
    pub service_name: String,

    /// Log level (trace, debug, info, warn, error)
    #[validate(length(min = 1, message = "Log level cannot be empty"))]
    pub log_level: String,

    /// Enable JSON structured logging
    pub json_logging: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            enable_metrics: false,
            metrics_port: 0,
            service_name: "flowplane-leafcert".to_string(),
            log_level: "info".to_string(),
            json_logging: false,
        }
    }
}

impl ObservabilityConfig {
    /// Get metrics bind address (None if disabled)
    pub fn metrics_bind_address(&self) -> Option<String> {
        if self.metrics_port == 0 {
            None
        } else {
            Some(format!("0.0.0.0:{}", self.metrics_port))
        }
    }

    /// Load observability settings from `FLOWPLANE_*` variables
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let metrics_port = match std::env::var("FLOWPLANE_METRICS_PORT") {
            Ok(value) => value
                .parse()
                .map_err(|e| LeafCertError::config(format!("Invalid metrics port: {}", e)))?,
            Err(_) => defaults.metrics_port,
        };

        let json_logging = match std::env::var("FLOWPLANE_LOG_JSON") {
            Ok(value) => value
                .parse()
                .map_err(|e| LeafCertError::config(format!("Invalid FLOWPLANE_LOG_JSON: {}", e)))?,
            Err(_) => defaults.json_logging,
        };

        let config = Self {
            enable_metrics: metrics_port != 0,
            metrics_port,
            service_name: std::env::var("FLOWPLANE_SERVICE_NAME").unwrap_or(defaults.service_name),
            log_level: std::env::var("FLOWPLANE_LOG_LEVEL").unwrap_or(defaults.log_level),
            json_logging,
        };

        Validate::validate(&config).map_err(|e| LeafCertError::config(e.to_string()))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leaf_cert_defaults() {
        let config = LeafCertConfig::default();
        assert_eq!(config.last_get_ttl, DEFAULT_LAST_GET_TTL);
        assert_eq!(config.refresh_rate, None);
        assert_eq!(config.refresh_max_burst, 2);
        assert!(config.ca_change_initial_delay_override.is_none());
    }

    #[test]
    fn test_with_defaults_fills_each_field_independently() {
        let config = LeafCertConfig {
            last_get_ttl: Duration::ZERO,
            refresh_rate: Some(5.0),
            refresh_max_burst: 0,
            ca_change_initial_delay_override: Some(Duration::ZERO),
        }
        .with_defaults();

        assert_eq!(config.last_get_ttl, DEFAULT_LAST_GET_TTL);
        // An explicit rate survives even though its neighbours were zero
        assert_eq!(config.refresh_rate, Some(5.0));
        assert_eq!(config.refresh_max_burst, DEFAULT_REFRESH_MAX_BURST);
        assert!(config.ca_change_initial_delay_override.is_none());

        let config = LeafCertConfig {
            last_get_ttl: Duration::from_secs(60),
            refresh_rate: Some(0.0),
            refresh_max_burst: 7,
            ca_change_initial_delay_override: None,
        }
        .with_defaults();
        assert_eq!(config.last_get_ttl, Duration::from_secs(60));
        assert_eq!(config.refresh_rate, None);
        assert_eq!(config.refresh_max_burst, 7);
    }

    #[test]
    fn test_validate_rejects_bad_rates() {
        for rate in [-1.0, f64::NAN, f64::INFINITY] {
            let config = LeafCertConfig { refresh_rate: Some(rate), ..Default::default() };
            assert!(matches!(config.validate(), Err(LeafCertError::Config { .. })), "rate {rate}");
        }
        assert!(LeafCertConfig::default().validate().is_ok());
    }

    #[test]
    fn test_metrics_bind_address() {
        let mut config = ObservabilityConfig::default();
        assert_eq!(config.metrics_bind_address(), None);
        config.metrics_port = 9102;
        assert_eq!(config.metrics_bind_address().as_deref(), Some("0.0.0.0:9102"));
    }
}
