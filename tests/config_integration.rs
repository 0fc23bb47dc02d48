//! Integration tests for configuration loading
//!
//! These tests check that the manager's tunables are read from the
//! environment and that each one falls back to its own default.

use flowplane_leafcert::config::{DEFAULT_LAST_GET_TTL, DEFAULT_REFRESH_MAX_BURST};
use flowplane_leafcert::{Config, LeafCertConfig, Result};
use std::env;
use std::sync::Mutex;
use std::time::Duration;

// Use a mutex to serialize tests that modify environment variables
static ENV_MUTEX: Mutex<()> = Mutex::new(());

const VARS: [&str; 5] = [
    "FLOWPLANE_LEAFCERT_LAST_GET_TTL_SECS",
    "FLOWPLANE_LEAFCERT_REFRESH_RATE",
    "FLOWPLANE_LEAFCERT_REFRESH_MAX_BURST",
    "FLOWPLANE_METRICS_PORT",
    "FLOWPLANE_LOG_LEVEL",
];

fn with_clean_env<T>(test: impl FnOnce() -> T) -> T {
    let _guard = ENV_MUTEX.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let saved: Vec<_> = VARS.iter().map(|name| (*name, env::var(name).ok())).collect();
    for name in VARS {
        env::remove_var(name);
    }

    let result = test();

    for (name, value) in saved {
        match value {
            Some(value) => env::set_var(name, value),
            None => env::remove_var(name),
        }
    }
    result
}

/// Test that configuration properly reads environment variables
#[test]
fn test_config_environment_integration() -> Result<()> {
    with_clean_env(|| {
        env::set_var("FLOWPLANE_LEAFCERT_LAST_GET_TTL_SECS", "3600");
        env::set_var("FLOWPLANE_LEAFCERT_REFRESH_RATE", "0.5");
        env::set_var("FLOWPLANE_LEAFCERT_REFRESH_MAX_BURST", "4");
        env::set_var("FLOWPLANE_METRICS_PORT", "9191");
        env::set_var("FLOWPLANE_LOG_LEVEL", "debug");

        let config = Config::from_env()?;
        assert_eq!(config.leaf_cert.last_get_ttl, Duration::from_secs(3600));
        assert_eq!(config.leaf_cert.refresh_rate, Some(0.5));
        assert_eq!(config.leaf_cert.refresh_max_burst, 4);
        assert!(config.observability.enable_metrics);
        assert_eq!(config.observability.metrics_bind_address().as_deref(), Some("0.0.0.0:9191"));
        assert_eq!(config.observability.log_level, "debug");
        Ok(())
    })
}

/// Test that configuration defaults work when no environment variables are set
#[test]
fn test_config_defaults_integration() -> Result<()> {
    with_clean_env(|| {
        let config = Config::from_env()?;
        assert_eq!(config.leaf_cert, LeafCertConfig::default());
        assert_eq!(config.leaf_cert.last_get_ttl, DEFAULT_LAST_GET_TTL);
        assert_eq!(config.leaf_cert.refresh_max_burst, DEFAULT_REFRESH_MAX_BURST);
        assert!(!config.observability.enable_metrics);
        assert!(config.observability.metrics_bind_address().is_none());
        Ok(())
    })
}

/// Zero values fall back to defaults field by field
#[test]
fn test_zero_values_fall_back_independently() -> Result<()> {
    with_clean_env(|| {
        env::set_var("FLOWPLANE_LEAFCERT_LAST_GET_TTL_SECS", "0");
        env::set_var("FLOWPLANE_LEAFCERT_REFRESH_RATE", "2");
        env::set_var("FLOWPLANE_LEAFCERT_REFRESH_MAX_BURST", "0");

        let config = LeafCertConfig::from_env()?;
        assert_eq!(config.last_get_ttl, DEFAULT_LAST_GET_TTL);
        assert_eq!(config.refresh_rate, Some(2.0));
        assert_eq!(config.refresh_max_burst, DEFAULT_REFRESH_MAX_BURST);
        Ok(())
    })
}

#[test]
fn test_invalid_values_are_rejected() {
    with_clean_env(|| {
        env::set_var("FLOWPLANE_LEAFCERT_REFRESH_MAX_BURST", "many");
        assert!(LeafCertConfig::from_env().is_err());
        env::remove_var("FLOWPLANE_LEAFCERT_REFRESH_MAX_BURST");

        env::set_var("FLOWPLANE_LEAFCERT_REFRESH_RATE", "-1");
        assert!(LeafCertConfig::from_env().is_err());
        env::remove_var("FLOWPLANE_LEAFCERT_REFRESH_RATE");

        env::set_var("FLOWPLANE_METRICS_PORT", "not-a-port");
        assert!(Config::from_env().is_err());
    });
}
