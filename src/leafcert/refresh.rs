//! Renewal of a cached leaf: when to renew, and waiting for that moment.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::DEFAULT_QUERY_TIMEOUT;
use crate::domain::IssuedCert;
use crate::errors::Result;
use crate::utils::random_stagger;

use super::cert::FetchState;
use super::request::LeafCertRequest;
use super::ManagerInner;

/// Window `[min, max]` in which `cert` should be renewed.
///
/// ```text
///        0                              60%             90%
/// Issued [------------------------------|===============|!!!!!] Expires
/// ```
///
/// The first attempt lands at a random point of the `===` region. Inside it,
/// `now` becomes the lower bound; past it, renewal is due immediately.
pub fn calculate_soft_expiry(now: DateTime<Utc>, cert: &IssuedCert) -> (DateTime<Utc>, DateTime<Utc>) {
    let lifetime = cert.lifetime();
    // Too short to jitter
    if lifetime < TimeDelta::minutes(10) {
        return (now, now);
    }

    let soft = cert.valid_after + tenths_of(lifetime, 6);
    let hard = cert.valid_after + tenths_of(lifetime, 9);

    if now > hard {
        return (now, now);
    }
    if now > soft {
        return (now, hard);
    }
    (soft, hard)
}

fn tenths_of(duration: TimeDelta, tenths: i64) -> TimeDelta {
    match duration.num_nanoseconds() {
        Some(nanos) => TimeDelta::nanoseconds((i128::from(nanos) * i128::from(tenths) / 10) as i64),
        None => TimeDelta::milliseconds(duration.num_milliseconds() / 10 * tenths),
    }
}

fn until(deadline: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (deadline - now).to_std().unwrap_or(Duration::ZERO)
}

impl ManagerInner {
    /// One renewal attempt for an entry.
    ///
    /// Returns `Ok(None)` when the current certificate stays. `state` is this
    /// attempt's working copy of the entry's fetch state and is stored back
    /// whatever the outcome.
    pub(super) async fn attempt_leaf_refresh(
        &self,
        req: &LeafCertRequest,
        existing: Option<&IssuedCert>,
        state: &mut FetchState,
    ) -> Result<Option<IssuedCert>> {
        let Some(existing) = existing else {
            return self.generate_new_leaf(req, false, state).await;
        };

        let now = Utc::now();
        let (min_expire, max_expire) = calculate_soft_expiry(now, existing);
        let mut expires_at = min_expire + random_stagger(max_expire - min_expire);
        if let Some(force_expire_after) = state.force_expire_after {
            expires_at = expires_at.min(force_expire_after);
        }
        if expires_at <= now {
            debug!(serial = %existing.serial_number, "leaf certificate due for renewal");
            return self.generate_new_leaf(req, true, state).await;
        }

        // Non-blocking callers only need the certificate to chain to the active root
        if req.must_revalidate {
            let roots = self.current_roots().await?;
            if roots.active_root_has_key(&state.authority_key_id) {
                return Ok(None);
            }
            info!(
                active_root_id = %roots.active_root_id,
                authority_key_id = %state.authority_key_id,
                "leaf certificate not signed by the active root, renewing"
            );
            return self.generate_new_leaf(req, true, state).await;
        }

        // The pending signal makes the first pass compare against the current
        // roots, catching rotations that happened while nobody was watching.
        let (root_tx, mut root_rx) = mpsc::channel(1);
        let _ = root_tx.try_send(());
        let _subscription = self.root_watcher.subscribe(root_tx);

        let timeout = tokio::time::sleep(query_timeout(req));
        tokio::pin!(timeout);
        let expiry = tokio::time::sleep(until(expires_at, now));
        tokio::pin!(expiry);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(None),
                _ = &mut timeout => return Ok(None),
                _ = &mut expiry => return self.generate_new_leaf(req, true, state).await,
                Some(()) = root_rx.recv() => {
                    let roots = self.current_roots().await?;
                    if roots.active_root_has_key(&state.authority_key_id) {
                        continue;
                    }
                    // A rotation already scheduled keeps its deadline; moving it
                    // on every wake-up would postpone renewal indefinitely.
                    if state.force_expire_after.is_some() {
                        continue;
                    }

                    let rotation_start = Utc::now();
                    let delay = self.ca_change_delay();
                    let force_expire_after = rotation_start + delay;
                    state.active_root_rotation_start = Some(rotation_start);
                    state.force_expire_after = Some(force_expire_after);
                    info!(
                        active_root_id = %roots.active_root_id,
                        renew_at = %force_expire_after,
                        "CA root rotated, scheduling leaf renewal"
                    );

                    if force_expire_after < expires_at {
                        expires_at = force_expire_after;
                        expiry.as_mut().reset(Instant::now() + delay.to_std().unwrap_or(Duration::ZERO));
                    }
                }
            }
        }
    }
}

fn query_timeout(req: &LeafCertRequest) -> Duration {
    if req.max_query_time.is_zero() {
        DEFAULT_QUERY_TIMEOUT
    } else {
        req.max_query_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn cert_valid(valid_after: DateTime<Utc>, lifetime: TimeDelta) -> IssuedCert {
        IssuedCert {
            serial_number: "01".to_string(),
            cert_pem: String::new(),
            private_key_pem: String::new(),
            identity_uri: String::new(),
            valid_after,
            valid_before: valid_after + lifetime,
            create_index: 1,
            modify_index: 1,
        }
    }

    fn epoch() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn soft_expiry_windows() {
        let issued = epoch();
        let cert = cert_valid(issued, TimeDelta::hours(72));
        let soft = issued + TimeDelta::minutes(2592); // 43.2h
        let hard = issued + TimeDelta::minutes(3888); // 64.8h

        let cases = [
            ("fresh", issued + TimeDelta::hours(1), (soft, hard)),
            ("inside soft window", issued + TimeDelta::hours(50), (issued + TimeDelta::hours(50), hard)),
            ("past hard", issued + TimeDelta::hours(70), (issued + TimeDelta::hours(70), issued + TimeDelta::hours(70))),
            ("expired", issued + TimeDelta::hours(80), (issued + TimeDelta::hours(80), issued + TimeDelta::hours(80))),
        ];
        for (name, now, expected) in cases {
            assert_eq!(calculate_soft_expiry(now, &cert), expected, "{name}");
        }
    }

    #[test]
    fn one_hour_cert() {
        let issued = epoch();
        let cert = cert_valid(issued, TimeDelta::hours(1));
        assert_eq!(
            calculate_soft_expiry(issued, &cert),
            (issued + TimeDelta::minutes(36), issued + TimeDelta::minutes(54))
        );
    }

    #[test]
    fn short_lived_cert_renews_now() {
        let issued = epoch();
        let cert = cert_valid(issued, TimeDelta::minutes(9));
        assert_eq!(calculate_soft_expiry(issued, &cert), (issued, issued));
    }

    #[test]
    fn zero_max_query_time_uses_default() {
        let req = LeafCertRequest::service("dc1", "web");
        assert_eq!(query_timeout(&req), DEFAULT_QUERY_TIMEOUT);
        let req = req.with_max_query_time(Duration::from_millis(35));
        assert_eq!(query_timeout(&req), Duration::from_millis(35));
    }

    proptest! {
        #[test]
        fn window_is_ordered_and_never_before_now(
            lifetime_secs in 600i64..(400 * 24 * 3600),
            offset_secs in -(30 * 24 * 3600i64)..(500 * 24 * 3600),
        ) {
            let issued = epoch();
            let cert = cert_valid(issued, TimeDelta::seconds(lifetime_secs));
            let now = issued + TimeDelta::seconds(offset_secs);
            let (min, max) = calculate_soft_expiry(now, &cert);

            prop_assert!(min <= max);
            prop_assert!(min >= now);
            prop_assert!(max <= cert.valid_before.max(now));
        }
    }
}
