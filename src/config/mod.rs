//! # Configuration Management
//!
//! Configuration for the leaf certificate manager. Every tunable has its own
//! default and can be overridden from the environment.

pub mod settings;

pub use settings::{
    LeafCertConfig, ObservabilityConfig, CA_CHANGE_JITTER_WINDOW, DEFAULT_LAST_GET_TTL,
    DEFAULT_QUERY_TIMEOUT, DEFAULT_REFRESH_MAX_BURST,
};

use crate::Result;

/// Application configuration
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub leaf_cert: LeafCertConfig,
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            leaf_cert: LeafCertConfig::from_env()?,
            observability: ObservabilityConfig::from_env()?,
        })
    }
}
