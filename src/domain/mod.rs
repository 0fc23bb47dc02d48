//! Domain layer
//!
//! Plain data types shared between the manager and its collaborators, with
//! no runtime dependencies.
//!
//! ## Module Organization
//!
//! - `ca`: root sets, sign requests and issued certificates
//! - `spiffe`: identity URIs and workload kinds

pub mod ca;
pub mod spiffe;

pub use ca::{CaRoot, CaSignRequest, IndexedCaRoots, IssuedCert};
pub use spiffe::{ServiceKind, SpiffeId, DEFAULT_NAMESPACE, DEFAULT_PARTITION};
