use std::net::IpAddr;

use chrono::{DateTime, Utc};
use rcgen::{string::Ia5String, CertificateParams, DistinguishedName, KeyPair, SanType};
use ring::{
    rand::SystemRandom,
    signature::{EcdsaKeyPair, KeyPair as _, ECDSA_P256_SHA256_ASN1_SIGNING},
};
use x509_parser::certification_request::X509CertificationRequest;
use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::pem::{parse_x509_pem, Pem};
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::errors::{LeafCertError, Result};

/// Metadata extracted from a leaf certificate.
#[derive(Debug, Clone)]
pub struct CertificateInfo {
    pub subject: String,
    pub issuer: String,
    pub serial_number: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    /// Colon-separated hex of the Authority Key Identifier, empty when absent.
    pub authority_key_id: String,
    pub uris: Vec<String>,
    pub dns_names: Vec<String>,
    pub public_key: Vec<u8>,
}

/// Subject alternative names requested by a CSR.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CsrNames {
    pub uris: Vec<String>,
    pub dns_names: Vec<String>,
    pub ip_addresses: Vec<IpAddr>,
}

/// Generate a fresh ECDSA P-256 key, returned with its PKCS#8 PEM encoding.
pub fn generate_private_key() -> Result<(KeyPair, String)> {
    let key_pair = KeyPair::generate()
        .map_err(|e| LeafCertError::certificate(format!("failed to generate private key: {}", e)))?;
    let pem = key_pair.serialize_pem();
    Ok((key_pair, pem))
}

/// Build a PEM CSR carrying `uri` plus the given DNS and IP SANs.
pub fn create_csr(
    uri: &str,
    key_pair: &KeyPair,
    dns_names: &[String],
    ip_addresses: &[IpAddr],
) -> Result<String> {
    let mut params = CertificateParams::default();
    params.distinguished_name = DistinguishedName::new();

    let mut names = Vec::with_capacity(1 + dns_names.len() + ip_addresses.len());
    names.push(SanType::URI(ia5(uri)?));
    for dns in dns_names {
        names.push(SanType::DnsName(ia5(dns)?));
    }
    names.extend(ip_addresses.iter().copied().map(SanType::IpAddress));
    params.subject_alt_names = names;

    let csr = params
        .serialize_request(key_pair)
        .map_err(|e| LeafCertError::certificate(format!("failed to create CSR: {}", e)))?;
    csr.pem().map_err(|e| LeafCertError::certificate(format!("failed to serialize CSR: {}", e)))
}

fn ia5(value: &str) -> Result<Ia5String> {
    Ia5String::try_from(value.to_string())
        .map_err(|e| LeafCertError::certificate(format!("invalid SAN '{}': {}", value, e)))
}

/// Format a key identifier the way CA roots report their signing key id.
pub fn encode_signing_key_id(key_id: &[u8]) -> String {
    key_id.iter().map(|b| format!("{:02x}", b)).collect::<Vec<_>>().join(":")
}

fn decode_pem(pem: &str, what: &str) -> Result<Pem> {
    let (_, pem) = parse_x509_pem(pem.as_bytes())
        .map_err(|e| LeafCertError::certificate(format!("failed to decode {} PEM: {}", what, e)))?;
    Ok(pem)
}

fn parse_der<'a>(der: &'a [u8], what: &str) -> Result<X509Certificate<'a>> {
    let (_, cert) = X509Certificate::from_der(der)
        .map_err(|e| LeafCertError::certificate(format!("failed to parse {}: {}", what, e)))?;
    Ok(cert)
}

/// Parse the first certificate in `cert_pem`.
pub fn parse_certificate(cert_pem: &str) -> Result<CertificateInfo> {
    let pem = decode_pem(cert_pem, "certificate")?;
    let cert = parse_der(&pem.contents, "certificate")?;

    let mut authority_key_id = String::new();
    let mut uris = Vec::new();
    let mut dns_names = Vec::new();
    for extension in cert.extensions() {
        match extension.parsed_extension() {
            ParsedExtension::AuthorityKeyIdentifier(aki) => {
                if let Some(key_id) = &aki.key_identifier {
                    authority_key_id = encode_signing_key_id(key_id.0);
                }
            }
            ParsedExtension::SubjectAlternativeName(san) => {
                for name in &san.general_names {
                    match name {
                        GeneralName::URI(uri) => uris.push(uri.to_string()),
                        GeneralName::DNSName(dns) => dns_names.push(dns.to_string()),
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }

    Ok(CertificateInfo {
        subject: cert.subject().to_string(),
        issuer: cert.issuer().to_string(),
        serial_number: cert.raw_serial_as_string(),
        not_before: to_chrono(cert.validity().not_before.timestamp())?,
        not_after: to_chrono(cert.validity().not_after.timestamp())?,
        authority_key_id,
        uris,
        dns_names,
        public_key: cert.public_key().subject_public_key.data.to_vec(),
    })
}

fn to_chrono(timestamp: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(timestamp, 0)
        .ok_or_else(|| LeafCertError::certificate("failed to convert certificate time"))
}

/// Authority Key Identifier of a PEM certificate, encoded like a signing key id.
pub fn parse_authority_key_id(cert_pem: &str) -> Result<String> {
    parse_certificate(cert_pem).map(|info| info.authority_key_id)
}

/// SANs requested by a PEM CSR.
pub fn parse_csr_names(csr_pem: &str) -> Result<CsrNames> {
    let (_, pem) = parse_x509_pem(csr_pem.as_bytes())
        .map_err(|e| LeafCertError::certificate(format!("failed to decode CSR PEM: {}", e)))?;
    let (_, csr) = X509CertificationRequest::from_der(&pem.contents)
        .map_err(|e| LeafCertError::certificate(format!("failed to parse CSR: {}", e)))?;

    let mut names = CsrNames::default();
    if let Some(extensions) = csr.requested_extensions() {
        for extension in extensions {
            if let ParsedExtension::SubjectAlternativeName(san) = extension {
                for name in &san.general_names {
                    match name {
                        GeneralName::URI(uri) => names.uris.push(uri.to_string()),
                        GeneralName::DNSName(dns) => names.dns_names.push(dns.to_string()),
                        GeneralName::IPAddress(raw) => {
                            if let Some(ip) = ip_from_bytes(raw) {
                                names.ip_addresses.push(ip);
                            }
                        }
                        _ => {}
                    }
                }
            }
        }
    }
    Ok(names)
}

fn ip_from_bytes(raw: &[u8]) -> Option<IpAddr> {
    match raw.len() {
        4 => <[u8; 4]>::try_from(raw).ok().map(IpAddr::from),
        16 => <[u8; 16]>::try_from(raw).ok().map(IpAddr::from),
        _ => None,
    }
}

/// Check that `cert_pem` was signed by the CA certificate `ca_pem`.
pub fn verify_signed_by(cert_pem: &str, ca_pem: &str) -> Result<()> {
    let leaf_pem = decode_pem(cert_pem, "certificate")?;
    let leaf = parse_der(&leaf_pem.contents, "certificate")?;
    let ca_pem = decode_pem(ca_pem, "CA certificate")?;
    let ca = parse_der(&ca_pem.contents, "CA certificate")?;

    leaf.verify_signature(Some(ca.public_key()))
        .map_err(|e| LeafCertError::certificate(format!("certificate not signed by CA: {}", e)))
}

/// Check that the PKCS#8 P-256 key in `key_pem` belongs to `cert_pem`.
pub fn validate_key_pair(cert_pem: &str, key_pem: &str) -> Result<()> {
    let info = parse_certificate(cert_pem)?;
    let key_pair = KeyPair::from_pem(key_pem)
        .map_err(|e| LeafCertError::certificate(format!("invalid private key: {}", e)))?;

    let rng = SystemRandom::new();
    let ecdsa =
        EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, &key_pair.serialize_der(), &rng)
            .map_err(|_| LeafCertError::certificate("private key is not an ECDSA P-256 key"))?;

    if ecdsa.public_key().as_ref() == info.public_key.as_slice() {
        Ok(())
    } else {
        Err(LeafCertError::certificate("certificate and private key do not match"))
    }
}
