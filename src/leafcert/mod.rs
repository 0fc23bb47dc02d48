//! # Leaf certificate manager
//!
//! Issues and caches mTLS leaf certificates per identity. A [`LeafCertManager::get`]
//! returns the cached certificate when it satisfies the request, otherwise it
//! triggers (at most one per key at a time) a background refresh and waits for
//! it, bounded by the request's `max_query_time`.
//!
//! ## Blocking semantics
//!
//! - `min_query_index == 0`: the cached value is revalidated against the
//!   active CA root before it is returned.
//! - `min_query_index > 0`: the call blocks until a value with a higher index
//!   exists. On timeout the last known value is returned without an error.
//!
//! A refresh waits until the certificate enters its renewal window or the
//! active root changes, then signs a new leaf. Root changes are spread over a
//! jitter window and rate-limited CSRs are retried in widening windows, so a
//! cluster-wide rotation does not produce a burst of CSRs.
//!
//! Entries nobody reads within the last-get TTL are evicted.

mod cert;
mod generate;
mod limiter;
mod refresh;
mod request;
mod roots;
mod singleflight;


pub use cert::FetchState;
pub use generate::CertSigner;
pub use refresh::calculate_soft_expiry;
pub use request::{LeafCertRequest, LeafIdentity, ResultMeta};
pub use roots::{RootsReader, RootsUpdateEvent, ROOTS_CORRELATION_ID};

use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};

use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{LeafCertConfig, DEFAULT_QUERY_TIMEOUT};
use crate::domain::IssuedCert;
use crate::errors::{LeafCertError, Result};
use crate::observability::{MetricsRecorder, RefreshOutcome};
use crate::ttlcache::{ExpiryEntry, ExpiryHeap, ExpiryTimer};

use cert::{cert_needs_update, CertData};
use limiter::RefreshLimiter;
use roots::RootWatcher;
use singleflight::{FlightDone, Group};

/// Collaborators and configuration of a [`LeafCertManager`].
pub struct Deps {
    pub config: LeafCertConfig,
    pub roots_reader: Arc<dyn RootsReader>,
    pub cert_signer: Arc<dyn CertSigner>,
}

/// Cached, self-renewing leaf certificates keyed by identity.
///
/// Cheap to clone; clones share the cache. Background work stops on
/// [`LeafCertManager::stop`] or when the last clone is dropped.
#[derive(Clone)]
pub struct LeafCertManager {
    inner: Arc<ManagerInner>,
}

struct CertSlot {
    data: Arc<CertData>,
    expiry: Arc<ExpiryEntry>,
}

/// Entries and their expiry heap share one lock so heap indexes and map
/// membership never disagree.
#[derive(Default)]
struct CertStore {
    entries: HashMap<String, CertSlot>,
    expiry: ExpiryHeap,
}

struct ManagerInner {
    config: LeafCertConfig,
    roots_reader: Arc<dyn RootsReader>,
    cert_signer: Arc<dyn CertSigner>,
    root_watcher: RootWatcher,
    /// Cancels background work only, never a caller's wait.
    shutdown: CancellationToken,
    store: RwLock<CertStore>,
    cert_group: Group,
    metrics: MetricsRecorder,
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for LeafCertManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeafCertManager")
            .field("config", &self.inner.config)
            .field("entries", &self.entries_count())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl LeafCertManager {
    /// Build a manager and start its expiry sweep.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(deps: Deps) -> Result<Self> {
        let config = deps.config.with_defaults();
        config.validate()?;

        let shutdown = CancellationToken::new();
        let store = CertStore::default();
        let expiry_notify = store.expiry.notifier();

        let inner = Arc::new(ManagerInner {
            root_watcher: RootWatcher::new(Arc::clone(&deps.roots_reader), shutdown.clone()),
            roots_reader: deps.roots_reader,
            cert_signer: deps.cert_signer,
            shutdown: shutdown.clone(),
            store: RwLock::new(store),
            cert_group: Group::default(),
            metrics: MetricsRecorder::new(),
            config,
        });

        tokio::spawn(run_expiry_loop(Arc::downgrade(&inner), expiry_notify, shutdown));

        info!(
            last_get_ttl_secs = inner.config.last_get_ttl.as_secs(),
            refresh_rate = ?inner.config.refresh_rate,
            refresh_max_burst = inner.config.refresh_max_burst,
            "leaf certificate manager started"
        );
        Ok(Self { inner })
    }

    /// Leaf certificate for `req`.
    ///
    /// Returns immediately when the cache satisfies the request, otherwise
    /// waits for a refresh. A timeout returns the last known value (possibly
    /// none) without an error. A refresh failure is returned once the call has
    /// made at least one attempt of its own. Firing `cancel` abandons only this
    /// call; the refresh it started keeps going.
    ///
    /// `meta.hit` is set when the answer is the leaf that was already cached,
    /// including after a revalidation that kept it.
    ///
    /// When the call's own refresh fails, only the error is returned, not the
    /// stale leaf the cache still holds.
    pub async fn get(
        &self,
        cancel: &CancellationToken,
        req: &LeafCertRequest,
    ) -> Result<(Option<Arc<IssuedCert>>, ResultMeta)> {
        let mut req = req.clone();
        // Non-blocking queries must never see a leaf that is expired or
        // signed by a superseded root.
        if req.min_query_index == 0 {
            req.must_revalidate = true;
        }
        self.inner.internal_get(cancel, req).await
    }

    /// Seed the entry for `key` with a certificate obtained out of band,
    /// without fetching.
    pub fn prepopulate(
        &self,
        key: &str,
        index: u64,
        value: IssuedCert,
        authority_key_id: impl Into<String>,
    ) -> Result<()> {
        if key.is_empty() {
            return Err(LeafCertError::invalid_request("a key is required"));
        }
        if value.cert_pem.is_empty() {
            return Err(LeafCertError::MissingValue);
        }

        self.inner.cert_data(key).prefill(index, value, authority_key_id.into());
        debug!(key = %key, index, "prepopulated leaf certificate");
        Ok(())
    }

    /// Stop background work: the expiry sweep, the root watch and pending
    /// refreshes. Callers already inside [`LeafCertManager::get`] still
    /// return, and cached values stay readable.
    pub fn stop(&self) {
        if !self.inner.shutdown.is_cancelled() {
            info!("stopping leaf certificate manager");
            self.inner.shutdown.cancel();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    pub fn entries_count(&self) -> usize {
        self.inner.store.read().expect("cert store lock poisoned").entries.len()
    }
}

impl ManagerInner {
    async fn internal_get(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        mut req: LeafCertRequest,
    ) -> Result<(Option<Arc<IssuedCert>>, ResultMeta)> {
        let key = req.key().ok_or_else(|| LeafCertError::invalid_request("a key is required"))?;
        if req.max_query_time.is_zero() {
            req.max_query_time = DEFAULT_QUERY_TIMEOUT;
        }
        let timeout = tokio::time::sleep(req.max_query_time);
        tokio::pin!(timeout);

        let mut first = true;
        let mut first_seen: Option<(u64, Arc<IssuedCert>)> = None;
        loop {
            // Touched on every pass, also for errors and unchanged values
            let data = self.touch(&key);
            let snapshot = data.snapshot();

            if !cert_needs_update(&req, snapshot.index, snapshot.value.as_deref(), snapshot.refreshing) {
                // A revalidation that kept the cached leaf still counts as a hit
                let unchanged = snapshot.last_fetch_err.is_none()
                    && matches!(
                        (&first_seen, &snapshot.value),
                        (Some((index, seen)), Some(value)) if *index == snapshot.index && Arc::ptr_eq(seen, value)
                    );
                let meta = ResultMeta {
                    hit: first || unchanged,
                    age: snapshot.fetched_at.map(|fetched_at| fetched_at.elapsed()).unwrap_or_default(),
                    index: snapshot.index,
                };
                debug!(key = %key, index = meta.index, hit = meta.hit, "returning cached leaf certificate");
                return Ok((snapshot.value, meta));
            }

            // One attempt per call: don't spin on a failure until the timeout
            if !first {
                if let Some(err) = snapshot.last_fetch_err {
                    debug!(key = %key, error = %err, "returning refresh error");
                    return Err(err);
                }
            }

            if first {
                first_seen = snapshot.value.clone().map(|value| (snapshot.index, value));
            }
            let done = self.trigger_refresh(&key, &req, &data);
            first = false;

            tokio::select! {
                _ = cancel.cancelled() => return Err(LeafCertError::Cancelled),
                _ = done.wait() => {
                    req.must_revalidate = false;
                }
                _ = &mut timeout => {
                    debug!(key = %key, index = snapshot.index, "leaf certificate query timed out");
                    return Ok((snapshot.value, ResultMeta { index: snapshot.index, ..ResultMeta::default() }));
                }
            }

            // No refresh will run any more
            if self.shutdown.is_cancelled() {
                let snapshot = data.snapshot();
                return Ok((snapshot.value, ResultMeta { index: snapshot.index, ..ResultMeta::default() }));
            }
        }
    }

    /// Start a refresh of `data` unless one is already running for `key`.
    fn trigger_refresh(self: &Arc<Self>, key: &str, req: &LeafCertRequest, data: &Arc<CertData>) -> FlightDone {
        let inner = Arc::clone(self);
        let data = Arc::clone(data);
        let mut req = req.clone();
        let flight_key = key.to_string();

        self.cert_group.do_chan(key, async move {
            let snapshot = data.snapshot();
            // A flight that landed between the caller's check and now may
            // already have produced what this request needs.
            if !cert_needs_update(&req, snapshot.index, snapshot.value.as_deref(), snapshot.refreshing) {
                return;
            }

            if let Err(err) = data.limiter().wait(&inner.shutdown).await {
                debug!(key = %flight_key, error = %err, "refresh abandoned");
                return;
            }

            let _refreshing = data.mark_refreshing();
            req.min_query_index = snapshot.index;
            inner.refresh_leaf_and_update(&req, &data).await;
        })
    }

    /// Run one refresh attempt and store its outcome in `data`.
    async fn refresh_leaf_and_update(&self, req: &LeafCertRequest, data: &CertData) {
        let (existing, mut state) = data.value_and_state();
        let rate_limit_errs = state.consecutive_rate_limit_errs;

        let result = self.attempt_leaf_refresh(req, existing.as_deref(), &mut state).await;

        let outcome = match &result {
            Ok(Some(_)) => RefreshOutcome::Issued,
            Ok(None) if state.consecutive_rate_limit_errs > rate_limit_errs => RefreshOutcome::RateLimited,
            Ok(None) => RefreshOutcome::Unchanged,
            Err(err) if err.is_rate_limited() => RefreshOutcome::RateLimited,
            Err(_) => RefreshOutcome::Error,
        };
        self.metrics.record_refresh(outcome);

        match result {
            Ok(cert) => {
                data.update(cert, state, None);
            }
            Err(err) => {
                data.update(None, state, Some(err));
            }
        }
    }

    /// Entry for `key`, created if missing, with its TTL extended.
    fn touch(&self, key: &str) -> Arc<CertData> {
        let ttl = self.config.last_get_ttl;
        let mut store = self.store.write().expect("cert store lock poisoned");
        let store = &mut *store;

        if let Some(slot) = store.entries.get(key) {
            store.expiry.update(slot.expiry.index(), ttl);
            return Arc::clone(&slot.data);
        }
        self.insert(store, key)
    }

    /// Entry for `key`, created if missing.
    fn cert_data(&self, key: &str) -> Arc<CertData> {
        if let Some(slot) = self.store.read().expect("cert store lock poisoned").entries.get(key) {
            return Arc::clone(&slot.data);
        }

        let mut store = self.store.write().expect("cert store lock poisoned");
        if let Some(slot) = store.entries.get(key) {
            return Arc::clone(&slot.data);
        }
        self.insert(&mut store, key)
    }

    fn insert(&self, store: &mut CertStore, key: &str) -> Arc<CertData> {
        let limiter = RefreshLimiter::new(self.config.refresh_rate, self.config.refresh_max_burst);
        let data = Arc::new(CertData::new(limiter));
        let expiry = store.expiry.add(key, self.config.last_get_ttl);
        store.entries.insert(key.to_string(), CertSlot { data: Arc::clone(&data), expiry });

        self.metrics.record_entries_count(store.entries.len());
        data
    }

    /// Remove the entry `timer` fired for, unless it was touched since.
    fn evict(&self, timer: &ExpiryTimer) {
        let Some(entry) = timer.entry() else {
            return;
        };

        let mut store = self.store.write().expect("cert store lock poisoned");
        if !store.expiry.is_expired(entry, Instant::now()) {
            return;
        }
        store.expiry.remove(entry.index());
        if store.entries.get(entry.key()).is_some_and(|slot| Arc::ptr_eq(&slot.expiry, entry)) {
            store.entries.remove(entry.key());
        }

        self.metrics.record_eviction();
        self.metrics.record_entries_count(store.entries.len());
        debug!(key = %entry.key(), "evicted idle leaf certificate");
    }
}

/// Evict entries whose last-get TTL ran out.
///
/// Holds the manager weakly so an abandoned manager can be dropped.
async fn run_expiry_loop(inner: Weak<ManagerInner>, notify: Arc<Notify>, shutdown: CancellationToken) {
    loop {
        let timer = match inner.upgrade() {
            Some(inner) => {
                let store = inner.store.read().expect("cert store lock poisoned");
                let timer = store.expiry.next();
                timer
            }
            None => return,
        };

        tokio::select! {
            _ = shutdown.cancelled() => return,
            // The soonest expiry changed: recompute
            _ = notify.notified() => continue,
            _ = timer.wait() => {
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                inner.evict(&timer);
            }
        }
    }
}
