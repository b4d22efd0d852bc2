//! VPN PKI - private certificate authority for a VPN fleet
//!
//! Issues, renews, revokes and exports the X.509 material a VPN deployment runs on: a root CA,
//! an optional intermediate, one certificate per VPN server and one per client (optionally as a
//! password-protected PKCS#12 bundle), plus the CRL the servers check clients against.
//!
//! # Overview
//!
//! ```text
//! Root CA (self-signed, pathlen=1)
//!   └── Intermediate CA (optional, signed by Root, pathlen=0)
//!       ├── Server certificates   -> <export root>/_<server>/
//!       └── Client certificates   -> <export root>/<user>/
//! ```
//!
//! The crate is a library. Persistence is injected through the [`storage::Repository`] and
//! [`storage::OwnerDirectory`] traits, so the same engine runs against an application database or
//! the bundled [`storage::memory`] implementation.
//!
//! # Guarantees
//!
//! - **Serial uniqueness**: serials come from a repository counter and are never reused, also
//!   across renew/revoke cycles.
//! - **One current certificate per owner**: renewal supersedes, it never duplicates.
//! - **Consistent revocation**: the CRL on disk always reflects exactly the ledger's entry set.
//! - **Commit-or-nothing**: a failing operation leaves no record, blob, file or owner link behind.
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use vpn_pki::configs::CaConfig;
//! use vpn_pki::engine::CaEngine;
//! use vpn_pki::storage::memory::{MemoryOwners, MemoryRepository};
//!
//! # fn example() -> anyhow::Result<()> {
//! let config = CaConfig::load()?;
//! let engine = CaEngine::new(
//!     Arc::new(MemoryRepository::new()),
//!     Arc::new(MemoryOwners::new()),
//!     config.clone(),
//! );
//! engine.issue_root(config.ca.root_validity_days, &config.subject)?;
//! engine.publish_crl()?;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`engine`]: issue, renew, revoke, re-enable, remove
//! - [`ledger`]: revocation entries and CRL regeneration
//! - [`export`]: PEM/DER files, PKCS#12 bundles, chain file
//! - [`import`]: file tree and LDAP attribute import
//! - [`signing`]: key generation, certificate building, CRL signing
//! - [`storage`]: repository traits and the in-memory implementation

pub mod configs;
pub mod engine;
pub mod error;
pub mod export;
pub mod import;
pub mod ledger;
pub mod locks;
pub mod model;
pub mod signing;
pub mod storage;
pub mod subject;

pub use configs::CaConfig;
pub use engine::CaEngine;
pub use error::{CaError, CaResult};
pub use model::{Certificate, CertificateId, CertificateType, Owner};
