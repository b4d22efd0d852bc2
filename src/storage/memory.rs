//! Thread-safe in-memory repository and owner directory.

use std::collections::BTreeMap;

use parking_lot::RwLock;

use super::{
    CertificateStore, LedgerStore, OwnerDirectory, Pkcs12Store, StoreError, StoreResult,
};
use crate::model::{
    Certificate, CertificateId, CertificateType, CrlEntry, CrlEntryId, CrlRecord, Owner,
    Pkcs12Blob, ServerProfile, UserProfile,
};

const ACTIVE_CRL_ID: i64 = 1;

#[derive(Debug, Default)]
struct Tables {
    certificates: BTreeMap<CertificateId, Certificate>,
    next_certificate_id: i64,
    serial_counter: u64,
    crl_entries: BTreeMap<CrlEntryId, CrlEntry>,
    next_crl_entry_id: i64,
    active_crl: Option<CrlRecord>,
    max_crl_number: u64,
    pkcs12: BTreeMap<CertificateId, Pkcs12Blob>,
}

#[derive(Debug, Default)]
pub struct MemoryRepository {
    tables: RwLock<Tables>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CertificateStore for MemoryRepository {
    fn create_certificate(&self, record: &Certificate) -> StoreResult<CertificateId> {
        let mut tables = self.tables.write();
        if tables
            .certificates
            .values()
            .any(|existing| existing.serial == record.serial)
        {
            return Err(StoreError::Conflict(format!(
                "serial {} already stored",
                record.serial
            )));
        }
        tables.next_certificate_id += 1;
        let id = CertificateId(tables.next_certificate_id);
        let mut stored = record.clone();
        stored.id = Some(id);
        tables.certificates.insert(id, stored);
        Ok(id)
    }

    fn read_certificate(&self, id: CertificateId) -> StoreResult<Option<Certificate>> {
        Ok(self.tables.read().certificates.get(&id).cloned())
    }

    fn update_certificate(&self, record: &Certificate) -> StoreResult<()> {
        let id = record
            .id
            .ok_or_else(|| StoreError::Missing("certificate without id".to_string()))?;
        let mut tables = self.tables.write();
        match tables.certificates.get_mut(&id) {
            Some(slot) => {
                *slot = record.clone();
                Ok(())
            }
            None => Err(StoreError::Missing(format!("certificate {}", id))),
        }
    }

    fn delete_certificate(&self, id: CertificateId) -> StoreResult<bool> {
        Ok(self.tables.write().certificates.remove(&id).is_some())
    }

    fn certificate_ids(&self) -> StoreResult<Vec<CertificateId>> {
        Ok(self.tables.read().certificates.keys().copied().collect())
    }

    fn find_by_owner(&self, owner: Owner) -> StoreResult<Vec<Certificate>> {
        Ok(self
            .tables
            .read()
            .certificates
            .values()
            .filter(|c| c.owner == Some(owner))
            .cloned()
            .collect())
    }

    fn find_by_serial(&self, serial: &str) -> StoreResult<Option<Certificate>> {
        Ok(self
            .tables
            .read()
            .certificates
            .values()
            .find(|c| c.serial == serial)
            .cloned())
    }

    fn find_by_type(&self, certificate_type: CertificateType) -> StoreResult<Vec<Certificate>> {
        Ok(self
            .tables
            .read()
            .certificates
            .values()
            .filter(|c| c.certificate_type == certificate_type)
            .cloned()
            .collect())
    }

    fn next_serial(&self) -> StoreResult<u64> {
        let mut tables = self.tables.write();
        tables.serial_counter += 1;
        Ok(tables.serial_counter)
    }
}

impl LedgerStore for MemoryRepository {
    fn crl_entries(&self) -> StoreResult<Vec<CrlEntry>> {
        Ok(self.tables.read().crl_entries.values().cloned().collect())
    }

    fn find_crl_entries(&self, serial: &str) -> StoreResult<Vec<CrlEntry>> {
        Ok(self
            .tables
            .read()
            .crl_entries
            .values()
            .filter(|e| e.serial == serial)
            .cloned()
            .collect())
    }

    fn create_crl_entry(&self, entry: &CrlEntry) -> StoreResult<CrlEntryId> {
        let mut tables = self.tables.write();
        tables.next_crl_entry_id += 1;
        let id = CrlEntryId(tables.next_crl_entry_id);
        let mut stored = entry.clone();
        stored.id = Some(id);
        tables.crl_entries.insert(id, stored);
        Ok(id)
    }

    fn delete_crl_entry(&self, id: CrlEntryId) -> StoreResult<bool> {
        Ok(self.tables.write().crl_entries.remove(&id).is_some())
    }

    fn active_crl(&self) -> StoreResult<Option<CrlRecord>> {
        Ok(self.tables.read().active_crl.clone())
    }

    fn save_crl(&self, crl: &CrlRecord) -> StoreResult<i64> {
        let mut tables = self.tables.write();
        let mut stored = crl.clone();
        stored.id = Some(ACTIVE_CRL_ID);
        tables.max_crl_number = tables.max_crl_number.max(stored.number);
        tables.active_crl = Some(stored);
        Ok(ACTIVE_CRL_ID)
    }

    fn max_crl_number(&self) -> StoreResult<u64> {
        Ok(self.tables.read().max_crl_number)
    }
}

impl Pkcs12Store for MemoryRepository {
    fn save_pkcs12(&self, blob: &Pkcs12Blob) -> StoreResult<()> {
        self.tables
            .write()
            .pkcs12
            .insert(blob.certificate_id, blob.clone());
        Ok(())
    }

    fn read_pkcs12(&self, certificate_id: CertificateId) -> StoreResult<Option<Pkcs12Blob>> {
        Ok(self.tables.read().pkcs12.get(&certificate_id).cloned())
    }

    fn delete_pkcs12(&self, certificate_id: CertificateId) -> StoreResult<bool> {
        Ok(self.tables.write().pkcs12.remove(&certificate_id).is_some())
    }
}

#[derive(Debug, Default)]
struct Owners {
    users: BTreeMap<i64, UserProfile>,
    servers: BTreeMap<i64, ServerProfile>,
}

/// Users and servers kept in memory, standing in for the application's own tables.
#[derive(Debug, Default)]
pub struct MemoryOwners {
    owners: RwLock<Owners>,
}

impl MemoryOwners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_user(&self, user: UserProfile) {
        self.owners.write().users.insert(user.id, user);
    }

    pub fn insert_server(&self, server: ServerProfile) {
        self.owners.write().servers.insert(server.id, server);
    }
}

impl OwnerDirectory for MemoryOwners {
    fn user(&self, id: i64) -> StoreResult<Option<UserProfile>> {
        Ok(self.owners.read().users.get(&id).cloned())
    }

    fn server(&self, id: i64) -> StoreResult<Option<ServerProfile>> {
        Ok(self.owners.read().servers.get(&id).cloned())
    }

    fn find_user_by_username(&self, username: &str) -> StoreResult<Option<UserProfile>> {
        Ok(self
            .owners
            .read()
            .users
            .values()
            .find(|u| u.username == username)
            .cloned())
    }

    fn set_certificate_id(
        &self,
        owner: Owner,
        certificate_id: Option<CertificateId>,
    ) -> StoreResult<()> {
        let mut owners = self.owners.write();
        let slot = match owner {
            Owner::User(id) => owners.users.get_mut(&id).map(|u| &mut u.certificate_id),
            Owner::Server(id) => owners.servers.get_mut(&id).map(|s| &mut s.certificate_id),
        };
        match slot {
            Some(slot) => {
                *slot = certificate_id;
                Ok(())
            }
            None => Err(StoreError::Missing(owner.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn record(serial: &str) -> Certificate {
        let ts = NaiveDate::from_ymd_opt(2026, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        Certificate {
            id: None,
            serial: serial.to_string(),
            subject_dn: "CN=test".to_string(),
            issuer_dn: "CN=ca".to_string(),
            common_name: "test".to_string(),
            certificate_type: CertificateType::Client,
            certificate_pem: String::new(),
            private_key_pem: None,
            valid_from: ts,
            valid_to: ts,
            generated: true,
            owner: Some(Owner::User(7)),
            file_name: None,
            export_path: None,
        }
    }

    #[test]
    fn test_certificate_crud() {
        let repo = MemoryRepository::new();
        let id = repo.create_certificate(&record("01")).unwrap();
        let mut stored = repo.read_certificate(id).unwrap().unwrap();
        assert_eq!(stored.id, Some(id));

        stored.file_name = Some("test.crt".to_string());
        repo.update_certificate(&stored).unwrap();
        assert_eq!(
            repo.find_by_serial("01").unwrap().unwrap().file_name.as_deref(),
            Some("test.crt")
        );
        assert_eq!(repo.find_by_owner(Owner::User(7)).unwrap().len(), 1);

        assert!(repo.delete_certificate(id).unwrap());
        assert!(!repo.delete_certificate(id).unwrap());
        assert!(repo.read_certificate(id).unwrap().is_none());
    }

    #[test]
    fn test_duplicate_serial_rejected() {
        let repo = MemoryRepository::new();
        repo.create_certificate(&record("0A")).unwrap();
        assert!(matches!(
            repo.create_certificate(&record("0A")),
            Err(StoreError::Conflict(_))
        ));
    }

    #[test]
    fn test_ids_and_serials_never_reused() {
        let repo = MemoryRepository::new();
        let first = repo.create_certificate(&record("01")).unwrap();
        repo.delete_certificate(first).unwrap();
        let second = repo.create_certificate(&record("02")).unwrap();
        assert_ne!(first, second);

        let a = repo.next_serial().unwrap();
        let b = repo.next_serial().unwrap();
        assert!(b > a);
    }

    #[test]
    fn test_max_crl_number_survives_restore() {
        let repo = MemoryRepository::new();
        let ts = chrono::Local::now().naive_local();
        let crl = |number| CrlRecord {
            id: None,
            number,
            issuer: "CN=ca".to_string(),
            created_at: ts,
            valid_from: ts,
            next_update: ts,
            content_pem: String::new(),
        };
        repo.save_crl(&crl(3)).unwrap();
        repo.save_crl(&crl(2)).unwrap();
        assert_eq!(repo.max_crl_number().unwrap(), 3);
        assert_eq!(repo.active_crl().unwrap().unwrap().number, 2);
    }

    #[test]
    fn test_owner_link() {
        let owners = MemoryOwners::new();
        owners.insert_user(UserProfile {
            id: 1,
            username: "alice".to_string(),
            common_name: None,
            organizational_unit: None,
            certificate_id: None,
        });
        owners
            .set_certificate_id(Owner::User(1), Some(CertificateId(5)))
            .unwrap();
        assert_eq!(
            owners.certificate_id(Owner::User(1)).unwrap(),
            Some(CertificateId(5))
        );
        assert_eq!(
            owners.owner_name(Owner::User(1)).unwrap().as_deref(),
            Some("alice")
        );
        assert!(owners
            .set_certificate_id(Owner::Server(9), None)
            .is_err());
    }
}
