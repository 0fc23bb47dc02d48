//! Per-entry token bucket limiting how often a cache entry may request a CSR.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::errors::{LeafCertError, Result};

/// Token bucket for rate limiting.
#[derive(Debug, Clone)]
struct TokenBucket {
    /// Current number of tokens available
    tokens: f64,
    /// Maximum tokens in the bucket
    max_tokens: f64,
    /// Time of last token refill
    last_refill: Instant,
    /// Token refill rate (tokens per second)
    refill_rate_per_sec: f64,
}

impl TokenBucket {
    fn new(refill_rate_per_sec: f64, max_tokens: u32) -> Self {
        let max_tokens = f64::from(max_tokens.max(1));
        Self { tokens: max_tokens, max_tokens, last_refill: Instant::now(), refill_rate_per_sec }
    }

    /// Try to consume a token from the bucket.
    ///
    /// Returns how long to wait for the next token when the bucket is empty.
    fn try_consume(&mut self) -> std::result::Result<(), Duration> {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate_per_sec).min(self.max_tokens);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let seconds_until_refill = (1.0 - self.tokens) / self.refill_rate_per_sec;
            Err(Duration::from_secs_f64(seconds_until_refill))
        }
    }
}

/// Limits CSR refreshes of a single entry. Unlimited when built without a rate.
#[derive(Debug)]
pub(crate) struct RefreshLimiter {
    bucket: Option<Mutex<TokenBucket>>,
}

impl RefreshLimiter {
    pub(crate) fn new(rate: Option<f64>, max_burst: u32) -> Self {
        let bucket = rate.filter(|rate| *rate > 0.0).map(|rate| Mutex::new(TokenBucket::new(rate, max_burst)));
        Self { bucket }
    }

    /// Wait for a token.
    ///
    /// Fails with [`LeafCertError::Cancelled`] once `shutdown` fires, which only
    /// happens when the whole manager is stopping.
    pub(crate) async fn wait(&self, shutdown: &CancellationToken) -> Result<()> {
        if shutdown.is_cancelled() {
            return Err(LeafCertError::Cancelled);
        }
        let Some(bucket) = &self.bucket else {
            return Ok(());
        };

        loop {
            let delay = {
                let mut bucket = bucket.lock().expect("refresh limiter lock poisoned");
                match bucket.try_consume() {
                    Ok(()) => return Ok(()),
                    Err(delay) => delay,
                }
            };

            debug!(delay_ms = delay.as_millis() as u64, "refresh rate limited, waiting for token");
            tokio::select! {
                _ = shutdown.cancelled() => return Err(LeafCertError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
