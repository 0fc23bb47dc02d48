//! # Flowplane leaf certificates
//!
//! Issues, caches and renews the mTLS leaf certificates that identify
//! services, agents, servers and mesh gateways, following rotations of the
//! cluster's CA roots.
//!
//! ## Architecture
//!
//! ```text
//! get() ──► cache entry ──► singleflight refresh ──► CertSigner
//!               │                    ▲
//!          expiry heap          root watcher ◄── RootsReader
//! ```
//!
//! ## Core Components
//!
//! - **Manager** ([`LeafCertManager`]): blocking-query cache front end
//! - **Root watcher**: one shared root stream fanned out to waiting refreshes
//! - **Expiry heap** ([`ttlcache`]): evicts entries nobody reads any more
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use flowplane_leafcert::testing::TestSigner;
//! use flowplane_leafcert::{Deps, LeafCertConfig, LeafCertManager, LeafCertRequest, Result};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let signer = Arc::new(TestSigner::new());
//!     signer.update_ca()?;
//!
//!     let manager = LeafCertManager::new(Deps {
//!         config: LeafCertConfig::from_env()?,
//!         roots_reader: signer.roots_reader(),
//!         cert_signer: signer,
//!     })?;
//!
//!     let req = LeafCertRequest::service("dc1", "web");
//!     let (cert, meta) = manager.get(&CancellationToken::new(), &req).await?;
//!     println!("index {}: {:?}", meta.index, cert.map(|c| c.serial_number.clone()));
//!
//!     manager.stop();
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod domain;
pub mod errors;
pub mod leafcert;
pub mod observability;
pub mod testing;
pub mod ttlcache;
pub mod utils;

// Re-export commonly used types and traits
pub use config::{Config, LeafCertConfig};
pub use domain::{CaRoot, IndexedCaRoots, IssuedCert};
pub use errors::{LeafCertError, Result};
pub use leafcert::{CertSigner, Deps, LeafCertManager, LeafCertRequest, LeafIdentity, ResultMeta, RootsReader};
pub use observability::init_observability;

/// Library version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name from Cargo.toml
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
