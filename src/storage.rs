//! Persistence boundary of the CA core.
//!
//! The relational layer that backs a real deployment lives outside this crate and implements
//! [`Repository`] and [`OwnerDirectory`]. [`memory`] provides a complete in-process
//! implementation used for embedding and tests.
//!
//! Implementations must make every single call atomic on its own; the engine composes calls and
//! compensates on failure, so no multi-call transactions are required from the store.

use std::fmt::Debug;

use thiserror::Error;

use crate::model::{
    Certificate, CertificateId, CertificateType, CrlEntry, CrlEntryId, CrlRecord, Owner,
    Pkcs12Blob, ServerProfile, UserProfile,
};

pub mod memory;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Record {0} does not exist")]
    Missing(String),

    #[error("Constraint violated: {0}")]
    Conflict(String),

    #[error(transparent)]
    Internal(#[from] Box<dyn std::error::Error + Send + Sync>),
}

pub type StoreResult<T> = Result<T, StoreError>;

pub trait CertificateStore {
    /// Persist a new record and return its id. The `id` field of `record` is ignored.
    fn create_certificate(&self, record: &Certificate) -> StoreResult<CertificateId>;
    fn read_certificate(&self, id: CertificateId) -> StoreResult<Option<Certificate>>;
    fn update_certificate(&self, record: &Certificate) -> StoreResult<()>;
    /// Returns whether a record was removed.
    fn delete_certificate(&self, id: CertificateId) -> StoreResult<bool>;
    fn certificate_ids(&self) -> StoreResult<Vec<CertificateId>>;
    fn find_by_owner(&self, owner: Owner) -> StoreResult<Vec<Certificate>>;
    fn find_by_serial(&self, serial: &str) -> StoreResult<Option<Certificate>>;
    fn find_by_type(&self, certificate_type: CertificateType) -> StoreResult<Vec<Certificate>>;
    /// Hand out the next value of the CA serial counter. Values are never handed out twice.
    fn next_serial(&self) -> StoreResult<u64>;
}

pub trait LedgerStore {
    fn crl_entries(&self) -> StoreResult<Vec<CrlEntry>>;
    /// All entries carrying `serial`. More than one means the ledger is corrupt.
    fn find_crl_entries(&self, serial: &str) -> StoreResult<Vec<CrlEntry>>;
    fn create_crl_entry(&self, entry: &CrlEntry) -> StoreResult<CrlEntryId>;
    fn delete_crl_entry(&self, id: CrlEntryId) -> StoreResult<bool>;
    fn active_crl(&self) -> StoreResult<Option<CrlRecord>>;
    /// Replace the active CRL record and return its id.
    fn save_crl(&self, crl: &CrlRecord) -> StoreResult<i64>;
    /// Highest CRL number ever saved, 0 when none.
    fn max_crl_number(&self) -> StoreResult<u64>;
}

pub trait Pkcs12Store {
    /// Insert or replace the bundle for `blob.certificate_id`.
    fn save_pkcs12(&self, blob: &Pkcs12Blob) -> StoreResult<()>;
    fn read_pkcs12(&self, certificate_id: CertificateId) -> StoreResult<Option<Pkcs12Blob>>;
    fn delete_pkcs12(&self, certificate_id: CertificateId) -> StoreResult<bool>;
}

pub trait Repository: CertificateStore + LedgerStore + Pkcs12Store + Send + Sync + 'static {}

impl<T> Repository for T where T: CertificateStore + LedgerStore + Pkcs12Store + Send + Sync + 'static
{}

/// Read access to users and servers plus the single hook that moves their certificate link.
pub trait OwnerDirectory: Send + Sync + 'static {
    fn user(&self, id: i64) -> StoreResult<Option<UserProfile>>;
    fn server(&self, id: i64) -> StoreResult<Option<ServerProfile>>;
    fn find_user_by_username(&self, username: &str) -> StoreResult<Option<UserProfile>>;
    fn set_certificate_id(
        &self,
        owner: Owner,
        certificate_id: Option<CertificateId>,
    ) -> StoreResult<()>;

    fn certificate_id(&self, owner: Owner) -> StoreResult<Option<CertificateId>> {
        Ok(match owner {
            Owner::User(id) => self.user(id)?.and_then(|u| u.certificate_id),
            Owner::Server(id) => self.server(id)?.and_then(|s| s.certificate_id),
        })
    }

    /// Name used for export directories and ledger display.
    fn owner_name(&self, owner: Owner) -> StoreResult<Option<String>> {
        Ok(match owner {
            Owner::User(id) => self.user(id)?.map(|u| u.username),
            Owner::Server(id) => self.server(id)?.map(|s| s.name),
        })
    }
}
