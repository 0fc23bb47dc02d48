//! Per-key cache entry.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::domain::IssuedCert;
use crate::errors::LeafCertError;

use super::limiter::RefreshLimiter;
use super::request::LeafCertRequest;

/// Rotation and backoff bookkeeping carried between refresh attempts.
///
/// Always handled by value: an attempt works on its own copy and hands the
/// result back through [`CertData::update`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchState {
    /// Key id of the CA that signed the current certificate.
    pub authority_key_id: String,
    /// Renew at this instant even if the certificate is not due yet. Set when
    /// a root rotation or a rate-limited CSR defers the renewal.
    pub force_expire_after: Option<DateTime<Utc>>,
    /// When the current root rotation (or rate-limit episode) was first seen.
    pub active_root_rotation_start: Option<DateTime<Utc>>,
    pub consecutive_rate_limit_errs: u32,
}

/// Point-in-time copy of an entry, taken under its lock.
#[derive(Debug, Clone, Default)]
pub(crate) struct CertSnapshot {
    pub(crate) index: u64,
    pub(crate) value: Option<Arc<IssuedCert>>,
    pub(crate) refreshing: bool,
    pub(crate) fetched_at: Option<Instant>,
    pub(crate) last_fetch_err: Option<LeafCertError>,
}

#[derive(Debug, Default)]
struct CertDataState {
    index: u64,
    value: Option<Arc<IssuedCert>>,
    fetch_state: FetchState,
    fetched_at: Option<Instant>,
    refreshing: bool,
    last_fetch_err: Option<LeafCertError>,
}

#[derive(Debug)]
pub(crate) struct CertData {
    state: Mutex<CertDataState>,
    limiter: RefreshLimiter,
}

impl CertData {
    pub(crate) fn new(limiter: RefreshLimiter) -> Self {
        Self { state: Mutex::new(CertDataState::default()), limiter }
    }

    pub(crate) fn limiter(&self) -> &RefreshLimiter {
        &self.limiter
    }

    pub(crate) fn snapshot(&self) -> CertSnapshot {
        let state = self.state.lock().expect("cert data lock poisoned");
        CertSnapshot {
            index: state.index,
            value: state.value.clone(),
            refreshing: state.refreshing,
            fetched_at: state.fetched_at,
            last_fetch_err: state.last_fetch_err.clone(),
        }
    }

    pub(crate) fn value_and_state(&self) -> (Option<Arc<IssuedCert>>, FetchState) {
        let state = self.state.lock().expect("cert data lock poisoned");
        (state.value.clone(), state.fetch_state.clone())
    }

    /// Apply the outcome of one refresh attempt.
    ///
    /// The fetch state and error are always replaced, so a failed attempt
    /// clears the previous failure. The index never moves backwards and is at
    /// least 1 afterwards.
    pub(crate) fn update(
        &self,
        new_cert: Option<IssuedCert>,
        fetch_state: FetchState,
        err: Option<LeafCertError>,
    ) -> u64 {
        let mut state = self.state.lock().expect("cert data lock poisoned");
        state.fetch_state = fetch_state;
        state.last_fetch_err = err;

        if let Some(cert) = new_cert {
            state.index = state.index.max(cert.modify_index);
            state.value = Some(Arc::new(cert));
            state.fetched_at = Some(Instant::now());
        }
        if state.index < 1 {
            state.index = 1;
        }
        state.index
    }

    /// Seed the entry with a value obtained out of band.
    pub(crate) fn prefill(&self, index: u64, value: IssuedCert, authority_key_id: String) {
        let mut state = self.state.lock().expect("cert data lock poisoned");
        state.index = state.index.max(index).max(1);
        state.value = Some(Arc::new(value));
        state.fetch_state = FetchState { authority_key_id, ..FetchState::default() };
    }

    /// Flag the entry as refreshing until the returned guard drops.
    pub(crate) fn mark_refreshing(&self) -> RefreshingGuard<'_> {
        self.set_refreshing(true);
        RefreshingGuard { data: self }
    }

    fn set_refreshing(&self, refreshing: bool) {
        self.state.lock().expect("cert data lock poisoned").refreshing = refreshing;
    }
}

pub(crate) struct RefreshingGuard<'a> {
    data: &'a CertData,
}

impl Drop for RefreshingGuard<'_> {
    fn drop(&mut self) {
        self.data.set_refreshing(false);
    }
}

/// Whether the cached value cannot answer `req` and a refresh is needed.
///
/// A revalidation request is satisfied while another refresh is running: that
/// refresh is blocked waiting for a change, which means the cached value is
/// current.
pub(crate) fn cert_needs_update(
    req: &LeafCertRequest,
    index: u64,
    value: Option<&IssuedCert>,
    refreshing: bool,
) -> bool {
    if value.is_none() {
        return true;
    }
    if req.min_query_index > 0 && req.min_query_index >= index {
        return true;
    }
    if req.must_revalidate {
        return !refreshing;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn cert(modify_index: u64) -> IssuedCert {
        let now = Utc::now();
        IssuedCert {
            serial_number: format!("{modify_index:02x}"),
            cert_pem: "-----BEGIN CERTIFICATE-----".to_string(),
            private_key_pem: String::new(),
            identity_uri: "spiffe://example.consul/ns/default/dc/dc1/svc/web".to_string(),
            valid_after: now,
            valid_before: now + TimeDelta::hours(72),
            create_index: modify_index,
            modify_index,
        }
    }

    fn data() -> CertData {
        CertData::new(RefreshLimiter::new(None, 1))
    }

    #[test]
    fn needs_update_without_value() {
        let req = LeafCertRequest::service("dc1", "web");
        assert!(cert_needs_update(&req, 0, None, false));
        assert!(cert_needs_update(&req, 5, None, true));
    }

    #[test]
    fn needs_update_when_min_index_not_passed() {
        let value = cert(5);
        let req = LeafCertRequest::service("dc1", "web").with_min_query_index(5);
        assert!(cert_needs_update(&req, 5, Some(&value), false));
        assert!(!cert_needs_update(&req, 6, Some(&value), false));
    }

    #[test]
    fn revalidation_is_skipped_while_refreshing() {
        let value = cert(5);
        let mut req = LeafCertRequest::service("dc1", "web");
        req.must_revalidate = true;
        assert!(cert_needs_update(&req, 5, Some(&value), false));
        assert!(!cert_needs_update(&req, 5, Some(&value), true));

        req.must_revalidate = false;
        assert!(!cert_needs_update(&req, 5, Some(&value), false));
    }

    #[test]
    fn update_keeps_index_monotonic_and_at_least_one() {
        let data = data();
        assert_eq!(data.update(None, FetchState::default(), None), 1);
        assert_eq!(data.update(Some(cert(7)), FetchState::default(), None), 7);
        assert_eq!(data.update(Some(cert(3)), FetchState::default(), None), 7);

        let snapshot = data.snapshot();
        assert_eq!(snapshot.value.as_deref().map(|c| c.modify_index), Some(3));
        assert!(snapshot.fetched_at.is_some());
    }

    #[test]
    fn update_replaces_error_on_every_attempt() {
        let data = data();
        data.update(Some(cert(2)), FetchState::default(), None);
        data.update(None, FetchState::default(), Some(LeafCertError::signer("first")));
        assert_eq!(data.snapshot().last_fetch_err, Some(LeafCertError::signer("first")));

        data.update(None, FetchState::default(), Some(LeafCertError::RateLimited));
        assert_eq!(data.snapshot().last_fetch_err, Some(LeafCertError::RateLimited));

        data.update(None, FetchState::default(), None);
        let snapshot = data.snapshot();
        assert_eq!(snapshot.last_fetch_err, None);
        assert_eq!(snapshot.index, 2);
        assert!(snapshot.value.is_some());
    }

    #[test]
    fn update_stores_state_by_value() {
        let data = data();
        let mut state = FetchState { authority_key_id: "aa:bb".to_string(), ..FetchState::default() };
        data.update(Some(cert(2)), state.clone(), None);

        state.consecutive_rate_limit_errs = 9;
        let (_, stored) = data.value_and_state();
        assert_eq!(stored.authority_key_id, "aa:bb");
        assert_eq!(stored.consecutive_rate_limit_errs, 0);
    }

    #[test]
    fn refreshing_guard_resets_flag() {
        let data = data();
        {
            let _guard = data.mark_refreshing();
            assert!(data.snapshot().refreshing);
        }
        assert!(!data.snapshot().refreshing);
    }

    #[test]
    fn prefill_seeds_value_and_state() {
        let data = data();
        data.prefill(0, cert(4), "aa:bb".to_string());
        let snapshot = data.snapshot();
        assert_eq!(snapshot.index, 1);
        assert!(snapshot.value.is_some());
        assert!(snapshot.fetched_at.is_none());
        assert_eq!(data.value_and_state().1.authority_key_id, "aa:bb");
    }
}
