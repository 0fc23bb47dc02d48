//! Issuing a new leaf: key, CSR, signature.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use tracing::{info, warn};

use crate::config::CA_CHANGE_JITTER_WINDOW;
use crate::domain::{CaSignRequest, IndexedCaRoots, IssuedCert, ServiceKind, SpiffeId};
use crate::errors::{LeafCertError, Result};
use crate::utils::certificates::{create_csr, generate_private_key, parse_authority_key_id};
use crate::utils::random_stagger;

use super::cert::FetchState;
use super::request::{LeafCertRequest, LeafIdentity};
use super::ManagerInner;

/// Remote CA that signs leaf CSRs.
#[async_trait]
pub trait CertSigner: Send + Sync {
    /// Sign the CSR in `req`. Throttled requests fail with
    /// [`LeafCertError::RateLimited`].
    async fn sign_cert(&self, req: &CaSignRequest) -> Result<IssuedCert>;
}

/// Identity URI and extra SANs for a leaf requested under `trust_domain`.
pub(crate) fn leaf_names(
    req: &LeafCertRequest,
    trust_domain: &str,
) -> Result<(SpiffeId, Vec<String>, Vec<IpAddr>)> {
    let host = trust_domain.to_string();
    let partition = req.target_partition().to_string();
    let datacenter = req.datacenter.clone();

    match &req.identity {
        LeafIdentity::Service(service) => Ok((
            SpiffeId::Service {
                host,
                partition,
                namespace: req.target_namespace().to_string(),
                datacenter,
                service: service.clone(),
            },
            req.dns_san.clone(),
            Vec::new(),
        )),
        LeafIdentity::Agent(agent) => {
            let dns_names = std::iter::once("localhost".to_string()).chain(req.dns_san.iter().cloned()).collect();
            let ip_addresses = [IpAddr::V4(Ipv4Addr::LOCALHOST), IpAddr::V6(Ipv6Addr::LOCALHOST)]
                .into_iter()
                .chain(req.ip_san.iter().copied())
                .collect();
            Ok((SpiffeId::Agent { host, partition, datacenter, agent: agent.clone() }, dns_names, ip_addresses))
        }
        LeafIdentity::Kind(ServiceKind::MeshGateway) => {
            Ok((SpiffeId::MeshGateway { host, partition, datacenter }, req.dns_san.clone(), Vec::new()))
        }
        LeafIdentity::Kind(kind) => Err(LeafCertError::invalid_request(format!("unsupported kind: {}", kind))),
        LeafIdentity::Server => {
            let dns_name = format!("server.{}.peering.{}", datacenter, trust_domain);
            Ok((SpiffeId::Server { host, datacenter }, vec![dns_name], Vec::new()))
        }
    }
}

impl ManagerInner {
    /// Delay before reacting to a root change or retrying a rate-limited CSR.
    pub(super) fn ca_change_delay(&self) -> TimeDelta {
        if let Some(delay) = self.config.ca_change_initial_delay_override {
            if let Ok(delay) = TimeDelta::from_std(delay) {
                return delay;
            }
        }
        random_stagger(TimeDelta::seconds(CA_CHANGE_JITTER_WINDOW.as_secs() as i64))
    }

    pub(super) async fn current_roots(&self) -> Result<Arc<IndexedCaRoots>> {
        self.roots_reader.get().await?.ok_or(LeafCertError::NoRoots)
    }

    /// Generate a key and CSR and have it signed.
    ///
    /// A rate-limited CSR for an entry that already holds a certificate is not
    /// an error: the retry is scheduled in `state` and `Ok(None)` is returned.
    pub(super) async fn generate_new_leaf(
        &self,
        req: &LeafCertRequest,
        has_existing: bool,
        state: &mut FetchState,
    ) -> Result<Option<IssuedCert>> {
        let roots = self.current_roots().await?;
        if roots.trust_domain.is_empty() {
            return Err(LeafCertError::NoTrustDomain);
        }

        let (id, dns_names, ip_addresses) = leaf_names(req, &roots.trust_domain)?;
        let uri = id.uri();
        let (csr_pem, key_pem) = {
            let (key_pair, key_pem) = generate_private_key()?;
            (create_csr(&uri, &key_pair, &dns_names, &ip_addresses)?, key_pem)
        };

        let sign_req = CaSignRequest { token: req.token.clone(), datacenter: req.datacenter.clone(), csr_pem };
        let mut reply = match self.cert_signer.sign_cert(&sign_req).await {
            Ok(reply) => reply,
            Err(err) if err.is_rate_limited() && has_existing => {
                // Treat a stray rate limit like the start of a rotation so the
                // retry windows spread out from now.
                let start = *state.active_root_rotation_start.get_or_insert_with(Utc::now);
                state.consecutive_rate_limit_errs += 1;

                let delay = self.ca_change_delay();
                let window_start = i32::try_from(state.consecutive_rate_limit_errs)
                    .ok()
                    .and_then(|errs| delay.checked_mul(errs))
                    .and_then(|offset| start.checked_add_signed(offset))
                    .unwrap_or(start);
                let retry_at = window_start + delay;
                state.force_expire_after = Some(retry_at);

                warn!(
                    uri = %uri,
                    consecutive_errors = state.consecutive_rate_limit_errs,
                    retry_at = %retry_at,
                    "CSR rate limited, keeping current certificate"
                );
                return Ok(None);
            }
            Err(err) => {
                warn!(uri = %uri, error = %err, "failed to sign leaf certificate");
                return Err(err);
            }
        };

        let authority_key_id = parse_authority_key_id(&reply.cert_pem)?;
        reply.private_key_pem = key_pem;
        *state = FetchState { authority_key_id, ..FetchState::default() };

        info!(
            uri = %uri,
            serial = %reply.serial_number,
            index = reply.modify_index,
            valid_before = %reply.valid_before,
            "issued leaf certificate"
        );
        Ok(Some(reply))
    }
}
