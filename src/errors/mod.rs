//! # Error Handling
//!
//! Error types for the leaf certificate manager, built with `thiserror`.
//!
//! `LeafCertError` is `Clone` because a failed refresh is stored on the cache
//! entry and handed to every caller that observes it afterwards.

/// Custom result type for leaf certificate operations
pub type Result<T> = std::result::Result<T, LeafCertError>;

/// Message returned by signers that throttle CSR traffic.
pub const RATE_LIMITED_MESSAGE: &str = "Rate limit reached, try again later";

/// Main error type for the leaf certificate manager
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum LeafCertError {
    /// The signer refused the CSR because it is rate limiting
    #[error("Rate limit reached, try again later")]
    RateLimited,

    /// Any other signer or transport failure
    #[error("Signer error: {message}")]
    Signer { message: String },

    /// The roots reader failed to produce the current root set
    #[error("CA roots unavailable: {message}")]
    RootsUnavailable { message: String },

    /// The roots reader returned nothing
    #[error("no CA roots")]
    NoRoots,

    /// The root set has no trust domain yet
    #[error("cluster has no CA bootstrapped yet")]
    NoTrustDomain,

    /// The request cannot be served
    #[error("{message}")]
    InvalidRequest { message: String },

    /// Prepopulate was called without a certificate
    #[error("value is required")]
    MissingValue,

    /// Key, CSR or certificate handling failed
    #[error("Certificate error: {message}")]
    Certificate { message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// The caller's cancellation token fired
    #[error("request cancelled")]
    Cancelled,
}

impl LeafCertError {
    /// Create a new signer error
    pub fn signer<S: Into<String>>(message: S) -> Self {
        Self::Signer { message: message.into() }
    }

    /// Create a new roots-unavailable error
    pub fn roots_unavailable<S: Into<String>>(message: S) -> Self {
        Self::RootsUnavailable { message: message.into() }
    }

    /// Create a new invalid-request error
    pub fn invalid_request<S: Into<String>>(message: S) -> Self {
        Self::InvalidRequest { message: message.into() }
    }

    /// Create a new certificate error
    pub fn certificate<S: Into<String>>(message: S) -> Self {
        Self::Certificate { message: message.into() }
    }

    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config { message: message.into() }
    }

    /// Whether this is the signer's rate-limit sentinel
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited)
    }
}

impl From<rcgen::Error> for LeafCertError {
    fn from(err: rcgen::Error) -> Self {
        Self::certificate(err.to_string())
    }
}
