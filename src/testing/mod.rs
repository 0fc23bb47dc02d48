//! In-memory CA for exercising the leaf certificate manager.
//!
//! [`TestSigner`] signs CSRs with a locally generated CA and publishes its
//! roots through a [`TestRootsReader`], so rotations can be driven from tests
//! without any cluster.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, TimeDelta, Utc};
use rcgen::{
    BasicConstraints, CertificateParams, CertificateSigningRequestParams, DnType, ExtendedKeyUsagePurpose, IsCa,
    Issuer, KeyPair, KeyUsagePurpose, SerialNumber,
};
use time::OffsetDateTime;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::domain::{CaRoot, CaSignRequest, IndexedCaRoots, IssuedCert};
use crate::errors::{LeafCertError, Result};
use crate::leafcert::{CertSigner, RootsReader, RootsUpdateEvent};
use crate::utils::certificates::{
    encode_signing_key_id, parse_authority_key_id, parse_csr_names, validate_key_pair, verify_signed_by,
};

/// Trust domain of every root set the test CA publishes.
pub const TEST_TRUST_DOMAIN: &str = "11111111-2222-3333-4444-555555555555.consul";

/// How the next sign call is answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignBehavior {
    /// Sign normally
    Ok,
    /// Fail with [`LeafCertError::RateLimited`]
    RateLimited,
    /// Fail with a signer error carrying this message
    Fail(String),
    /// Sign a certificate that expired an hour ago
    ExpiredCert,
}

/// Roots reader backed by a watch channel.
///
/// `notify` streams only changes made after it was called.
#[derive(Debug)]
pub struct TestRootsReader {
    roots: watch::Sender<Result<Option<Arc<IndexedCaRoots>>>>,
}

impl Default for TestRootsReader {
    fn default() -> Self {
        Self::new()
    }
}

impl TestRootsReader {
    pub fn new() -> Self {
        let (roots, _) = watch::channel(Ok(None));
        Self { roots }
    }

    pub fn set(&self, roots: Option<IndexedCaRoots>) {
        self.roots.send_replace(Ok(roots.map(Arc::new)));
    }

    pub fn set_error(&self, err: LeafCertError) {
        self.roots.send_replace(Err(err));
    }

    fn current(&self) -> Result<Option<Arc<IndexedCaRoots>>> {
        self.roots.borrow().clone()
    }
}

#[async_trait]
impl RootsReader for TestRootsReader {
    async fn get(&self) -> Result<Option<Arc<IndexedCaRoots>>> {
        self.current()
    }

    async fn notify(
        &self,
        cancel: CancellationToken,
        correlation_id: &str,
        updates: mpsc::Sender<RootsUpdateEvent>,
    ) -> Result<()> {
        let mut rx = self.roots.subscribe();
        let correlation_id = correlation_id.to_string();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }

                let result = rx.borrow_and_update().clone();
                let index = match &result {
                    Ok(Some(roots)) => roots.index,
                    _ => 0,
                };
                let event = RootsUpdateEvent { correlation_id: correlation_id.clone(), index, result };

                tokio::select! {
                    _ = cancel.cancelled() => return,
                    sent = updates.send(event) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
        });
        Ok(())
    }
}

struct ActiveCa {
    root: CaRoot,
    issuer: Issuer<'static, KeyPair>,
}

#[derive(Default)]
struct SignerState {
    roots: Vec<CaRoot>,
    active: Option<ActiveCa>,
    /// Raft-like index shared by root sets and issued certificates
    index: u64,
    next_serial: u64,
    behaviors: VecDeque<SignBehavior>,
    captures: Vec<CaSignRequest>,
    sign_calls: u64,
    sign_errors: u64,
}

/// Signer backed by a locally generated CA.
pub struct TestSigner {
    roots_reader: Arc<TestRootsReader>,
    state: Mutex<SignerState>,
}

impl Default for TestSigner {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TestSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestSigner")
            .field("sign_calls", &self.sign_call_count())
            .field("sign_errors", &self.sign_call_error_count())
            .finish_non_exhaustive()
    }
}

impl TestSigner {
    /// A signer without any CA. Call [`TestSigner::update_ca`] before signing.
    pub fn new() -> Self {
        Self { roots_reader: Arc::new(TestRootsReader::new()), state: Mutex::new(SignerState::default()) }
    }

    pub fn roots_reader(&self) -> Arc<TestRootsReader> {
        Arc::clone(&self.roots_reader)
    }

    /// Generate a new CA, make it the active root and publish the root set.
    pub fn update_ca(&self) -> Result<CaRoot> {
        let (root, roots) = {
            let mut state = self.state.lock().expect("test signer lock poisoned");
            let serial = state.roots.len() + 1;
            let now = Utc::now().trunc_subsecs(0);

            let key = KeyPair::generate()?;
            let mut params = CertificateParams::default();
            params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
            params.distinguished_name.push(DnType::CommonName, format!("Test CA {}", serial));
            params.key_usages =
                vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign, KeyUsagePurpose::DigitalSignature];
            params.not_before = to_offset(now - TimeDelta::hours(1))?;
            params.not_after = to_offset(now + TimeDelta::days(3650))?;
            let root_cert_pem = params.self_signed(&key)?.pem();

            let issuer = Issuer::from_ca_cert_pem(&root_cert_pem, key)?;
            let signing_key_id = probe_signing_key_id(&issuer)?;

            for root in &mut state.roots {
                root.active = false;
            }
            let root = CaRoot {
                id: signing_key_id.clone(),
                name: format!("Test CA {}", serial),
                root_cert_pem,
                signing_key_id,
                active: true,
            };
            state.roots.push(root.clone());
            state.index += 1;
            state.active = Some(ActiveCa { root: root.clone(), issuer });

            let roots = IndexedCaRoots {
                active_root_id: root.id.clone(),
                trust_domain: TEST_TRUST_DOMAIN.to_string(),
                roots: state.roots.clone(),
                index: state.index,
            };
            (root, roots)
        };

        self.roots_reader.set(Some(roots));
        Ok(root)
    }

    /// Answer the next sign calls, in order, with `behaviors`. Calls beyond
    /// the queue sign normally.
    pub fn set_sign_behaviors(&self, behaviors: impl IntoIterator<Item = SignBehavior>) {
        self.state.lock().expect("test signer lock poisoned").behaviors = behaviors.into_iter().collect();
    }

    pub fn sign_call_count(&self) -> u64 {
        self.state.lock().expect("test signer lock poisoned").sign_calls
    }

    pub fn sign_call_error_count(&self) -> u64 {
        self.state.lock().expect("test signer lock poisoned").sign_errors
    }

    /// The `n`th sign request received.
    pub fn capture(&self, n: usize) -> Option<CaSignRequest> {
        self.state.lock().expect("test signer lock poisoned").captures.get(n).cloned()
    }

    pub fn active_root(&self) -> Option<CaRoot> {
        self.state.lock().expect("test signer lock poisoned").active.as_ref().map(|ca| ca.root.clone())
    }
}

#[async_trait]
impl CertSigner for TestSigner {
    async fn sign_cert(&self, req: &CaSignRequest) -> Result<IssuedCert> {
        let mut state = self.state.lock().expect("test signer lock poisoned");
        state.captures.push(req.clone());
        state.sign_calls += 1;

        let now = Utc::now().trunc_subsecs(0);
        let (valid_after, valid_before) = match state.behaviors.pop_front().unwrap_or(SignBehavior::Ok) {
            SignBehavior::Ok => (now - TimeDelta::minutes(1), now + TimeDelta::hours(72)),
            SignBehavior::ExpiredCert => (now - TimeDelta::hours(2), now - TimeDelta::hours(1)),
            SignBehavior::RateLimited => {
                state.sign_errors += 1;
                return Err(LeafCertError::RateLimited);
            }
            SignBehavior::Fail(message) => {
                state.sign_errors += 1;
                return Err(LeafCertError::signer(message));
            }
        };

        let identity_uri = parse_csr_names(&req.csr_pem)?
            .uris
            .into_iter()
            .next()
            .ok_or_else(|| LeafCertError::certificate("CSR carries no URI SAN"))?;

        state.index += 1;
        state.next_serial += 1;
        let index = state.index;
        let serial = state.next_serial;
        let ca = state.active.as_ref().ok_or_else(|| LeafCertError::signer("no CA configured"))?;

        let mut csr = CertificateSigningRequestParams::from_pem(&req.csr_pem)?;
        csr.params.not_before = to_offset(valid_after)?;
        csr.params.not_after = to_offset(valid_before)?;
        csr.params.serial_number = Some(SerialNumber::from(serial));
        csr.params.use_authority_key_identifier_extension = true;
        csr.params.key_usages = vec![KeyUsagePurpose::DigitalSignature, KeyUsagePurpose::KeyEncipherment];
        csr.params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth, ExtendedKeyUsagePurpose::ClientAuth];
        let cert = csr.signed_by(&ca.issuer)?;

        Ok(IssuedCert {
            serial_number: encode_signing_key_id(&serial.to_be_bytes()),
            cert_pem: cert.pem(),
            private_key_pem: String::new(),
            identity_uri,
            valid_after,
            valid_before,
            create_index: index,
            modify_index: index,
        })
    }
}

/// Key id the CA stamps into the authority key identifier of its leaves.
fn probe_signing_key_id(issuer: &Issuer<'_, KeyPair>) -> Result<String> {
    let key = KeyPair::generate()?;
    let mut params = CertificateParams::default();
    params.use_authority_key_identifier_extension = true;
    let probe = params.signed_by(&key, issuer)?;
    parse_authority_key_id(&probe.pem())
}

fn to_offset(at: DateTime<Utc>) -> Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(at.timestamp())
        .map_err(|e| LeafCertError::certificate(format!("invalid validity bound: {}", e)))
}

/// Check that `cert` chains to `ca` and carries the matching private key.
pub fn verify_leaf_under_ca(cert: &IssuedCert, ca: &CaRoot) -> Result<()> {
    verify_signed_by(&cert.cert_pem, &ca.root_cert_pem)?;
    validate_key_pair(&cert.cert_pem, &cert.private_key_pem)
}
