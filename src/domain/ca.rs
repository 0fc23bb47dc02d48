//! CA roots, sign requests and issued leaf certificates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One CA root certificate known to the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaRoot {
    pub id: String,
    pub name: String,
    pub root_cert_pem: String,
    /// Colon-separated hex key id of the key that signs leaves under this root.
    /// Matches the authority key id of every leaf it issues.
    pub signing_key_id: String,
    pub active: bool,
}

/// The cluster's root set at a given raft index.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IndexedCaRoots {
    pub active_root_id: String,
    pub trust_domain: String,
    pub roots: Vec<CaRoot>,
    pub index: u64,
}

impl IndexedCaRoots {
    pub fn active_root(&self) -> Option<&CaRoot> {
        self.roots.iter().find(|root| root.active)
    }

    /// Whether the active root signs with `signing_key_id`.
    ///
    /// A root set without an active root never matches.
    pub fn active_root_has_key(&self, signing_key_id: &str) -> bool {
        self.active_root().is_some_and(|root| root.signing_key_id == signing_key_id)
    }
}

/// CSR submitted to the signer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaSignRequest {
    pub token: String,
    pub datacenter: String,
    pub csr_pem: String,
}

/// A leaf certificate with its private key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedCert {
    pub serial_number: String,
    pub cert_pem: String,
    /// Filled in locally after signing; the signer never sees it.
    pub private_key_pem: String,
    /// SPIFFE URI the certificate was issued for
    pub identity_uri: String,
    pub valid_after: DateTime<Utc>,
    pub valid_before: DateTime<Utc>,
    pub create_index: u64,
    pub modify_index: u64,
}

impl IssuedCert {
    pub fn lifetime(&self) -> chrono::Duration {
        self.valid_before - self.valid_after
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root(id: &str, key: &str, active: bool) -> CaRoot {
        CaRoot {
            id: id.to_string(),
            name: format!("root {id}"),
            root_cert_pem: String::new(),
            signing_key_id: key.to_string(),
            active,
        }
    }

    #[test]
    fn active_root_has_key_checks_only_the_active_root() {
        let roots = IndexedCaRoots {
            active_root_id: "b".to_string(),
            trust_domain: "example.consul".to_string(),
            roots: vec![root("a", "aa:aa", false), root("b", "bb:bb", true)],
            index: 4,
        };

        assert_eq!(roots.active_root().map(|r| r.id.as_str()), Some("b"));
        assert!(roots.active_root_has_key("bb:bb"));
        assert!(!roots.active_root_has_key("aa:aa"));
    }

    #[test]
    fn no_active_root_never_matches() {
        let roots = IndexedCaRoots { roots: vec![root("a", "", false)], ..Default::default() };
        assert!(!roots.active_root_has_key(""));
    }
}
