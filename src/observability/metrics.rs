//! # Metrics Collection
//!
//! Leaf certificate cache metrics, emitted through the `metrics` facade. No
//! exporter is installed unless [`init_metrics`] is called.

use crate::config::ObservabilityConfig;
use crate::errors::{LeafCertError, Result};
use ::tracing::{info, warn};
use metrics::{counter, describe_counter, describe_gauge, gauge, Unit};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

/// Number of cached leaf certificate entries
pub const ENTRIES_COUNT: &str = "leaf_certs_entries_count";
/// Entries evicted because nobody read them within the last-get TTL
pub const EVICT_EXPIRED_TOTAL: &str = "leaf_certs_evict_expired_total";
/// Refresh attempts grouped by outcome
pub const REFRESH_TOTAL: &str = "leaf_certs_refresh_total";

/// Outcome of one refresh attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// A new certificate was issued
    Issued,
    /// The attempt ended without a new certificate and without an error
    Unchanged,
    /// The signer rate limited the CSR
    RateLimited,
    /// The attempt failed
    Error,
}

impl RefreshOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Issued => "issued",
            Self::Unchanged => "unchanged",
            Self::RateLimited => "rate_limited",
            Self::Error => "error",
        }
    }
}

/// Metrics recorder for the leaf certificate manager
#[derive(Debug, Clone, Default)]
pub struct MetricsRecorder;

impl MetricsRecorder {
    /// Create a new metrics recorder instance
    pub fn new() -> Self {
        Self
    }

    /// Record the current number of cache entries
    pub fn record_entries_count(&self, count: usize) {
        gauge!(ENTRIES_COUNT).set(count as f64);
    }

    /// Record one TTL eviction
    pub fn record_eviction(&self) {
        counter!(EVICT_EXPIRED_TOTAL).increment(1);
    }

    /// Record the outcome of a refresh attempt
    pub fn record_refresh(&self, outcome: RefreshOutcome) {
        let labels = [("outcome", outcome.as_str().to_string())];
        counter!(REFRESH_TOTAL, &labels).increment(1);
    }

    /// Register metric descriptions so exporters show them before events occur.
    pub fn register_leaf_cert_metrics(&self) {
        describe_gauge!(ENTRIES_COUNT, Unit::Count, "Number of cached leaf certificate entries");
        describe_counter!(
            EVICT_EXPIRED_TOTAL,
            Unit::Count,
            "Leaf certificate entries evicted after their last-get TTL"
        );
        describe_counter!(REFRESH_TOTAL, Unit::Count, "Leaf certificate refresh attempts grouped by outcome");
    }
}

/// Install the Prometheus exporter when metrics are enabled.
pub fn init_metrics(config: &ObservabilityConfig) -> Result<()> {
    if !config.enable_metrics {
        return Ok(());
    }

    let metrics_addr = match config.metrics_bind_address() {
        Some(addr) => addr,
        None => {
            warn!("Metrics disabled: no bind address configured");
            return Ok(());
        }
    };

    let socket_addr: SocketAddr = metrics_addr.parse().map_err(|e| {
        LeafCertError::config(format!("Invalid metrics bind address '{}': {}", metrics_addr, e))
    })?;

    PrometheusBuilder::new()
        .with_http_listener(socket_addr)
        .add_global_label("service", &config.service_name)
        .install()
        .map_err(|e| LeafCertError::config(format!("Failed to initialize metrics exporter: {}", e)))?;

    MetricsRecorder::new().register_leaf_cert_metrics();

    info!(
        metrics_addr = %metrics_addr,
        service_name = %config.service_name,
        "Metrics collection initialized"
    );

    Ok(())
}
