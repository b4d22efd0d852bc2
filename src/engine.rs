//! The CA engine: issues, renews, revokes and re-enables certificates.
//!
//! Every operation is commit-or-nothing. Records, PKCS#12 blobs, exported files and owner links
//! created by a failing call are removed again before the error is returned, and the previous
//! owner link is restored.
//!
//! # Locking
//! Lock order is owner, then certificate, then the ledger's own lock. Key generation happens
//! under the owner lock at most, never under the ledger lock.

use std::sync::Arc;

use chrono::{Duration, Utc};
use openssl::x509::X509;
use secrecy::SecretString;
use tracing::{debug, info, warn};

use crate::configs::{CaConfig, SubjectDefaults};
use crate::error::{CaError, CaResult};
use crate::export::{ExportReport, Exporter};
use crate::ledger::RevocationLedger;
use crate::locks::{KeyedGuard, KeyedLocks};
use crate::model::{naive_local, Certificate, CertificateId, CertificateType, CrlRecord, Owner};
use crate::signing::{
    CertificateProfile, IssueRequest, OpenSslBackend, SigningBackend, SigningIdentity,
};
use crate::storage::{OwnerDirectory, Repository, StoreError};
use crate::subject::SubjectName;

const SECONDS_PER_DAY: i64 = 86_400;
const MAX_SERIAL_ATTEMPTS: usize = 1024;

pub struct CaEngine {
    repository: Arc<dyn Repository>,
    owners: Arc<dyn OwnerDirectory>,
    backend: Arc<dyn SigningBackend>,
    config: CaConfig,
    ledger: RevocationLedger,
    exporter: Exporter,
    owner_locks: KeyedLocks<Owner>,
    certificate_locks: KeyedLocks<CertificateId>,
}

impl CaEngine {
    /// Engine backed by openssl with the configured key size.
    pub fn new(
        repository: Arc<dyn Repository>,
        owners: Arc<dyn OwnerDirectory>,
        config: CaConfig,
    ) -> Self {
        let backend = Arc::new(OpenSslBackend::new(config.ca.key_size));
        Self::with_backend(repository, owners, backend, config)
    }

    pub fn with_backend(
        repository: Arc<dyn Repository>,
        owners: Arc<dyn OwnerDirectory>,
        backend: Arc<dyn SigningBackend>,
        config: CaConfig,
    ) -> Self {
        let exporter = Exporter::new(repository.clone(), owners.clone(), &config);
        let ledger = RevocationLedger::new(
            repository.clone(),
            backend.clone(),
            exporter.crl_path(),
            config.crl.validity_days,
        );
        Self {
            repository,
            owners,
            backend,
            config,
            ledger,
            exporter,
            owner_locks: KeyedLocks::new(),
            certificate_locks: KeyedLocks::new(),
        }
    }

    pub fn config(&self) -> &CaConfig {
        &self.config
    }

    pub fn ledger(&self) -> &RevocationLedger {
        &self.ledger
    }

    pub fn exporter(&self) -> &Exporter {
        &self.exporter
    }

    /// Active trust chain, root first.
    pub fn chain(&self) -> CaResult<Vec<Certificate>> {
        self.exporter.chain()
    }

    /// The CA that signs leaf certificates and the CRL: the intermediate when one is
    /// configured and usable, else the root.
    pub fn signing_identity(&self) -> CaResult<SigningIdentity> {
        let chain = self.chain()?;
        let ca = chain
            .last()
            .ok_or_else(|| CaError::not_found("signing CA", "root"))?;
        let key = ca.private_key_pem.as_deref().ok_or_else(|| {
            CaError::Signing(format!("signing CA {} has no private key", ca.serial))
        })?;
        SigningIdentity::from_pem(&ca.certificate_pem, key)
    }

    pub fn certificate(&self, id: CertificateId) -> CaResult<Certificate> {
        self.repository
            .read_certificate(id)?
            .ok_or_else(|| CaError::not_found("certificate", id))
    }

    pub fn is_revoked(&self, certificate: &Certificate) -> CaResult<bool> {
        self.ledger.contains(&certificate.serial)
    }

    /// Issue a self-signed root. Does not check for an existing root.
    pub fn issue_root(
        &self,
        validity_days: u32,
        template: &SubjectDefaults,
    ) -> CaResult<Certificate> {
        let subject = SubjectName::root(template);
        let mut cert = self.create_issued(
            CertificateProfile::Root,
            CertificateType::Root,
            subject,
            validity_days,
            None,
            None,
            None,
        )?;
        if let Err(e) = self.exporter.export_certificate(&mut cert) {
            self.discard(&cert);
            return Err(e);
        }
        self.refresh_chain();
        info!(serial = %cert.serial, id = ?cert.id, "root CA issued");
        Ok(cert)
    }

    /// Issue an intermediate signed by the root `root_id`.
    pub fn issue_intermediate(
        &self,
        root_id: CertificateId,
        validity_days: u32,
    ) -> CaResult<Certificate> {
        let root = self.certificate(root_id)?;
        if root.certificate_type != CertificateType::Root {
            return Err(CaError::InvalidRequest(format!(
                "certificate {} is not a root CA",
                root_id
            )));
        }
        let key = root.private_key_pem.as_deref().ok_or_else(|| {
            CaError::InvalidRequest(format!("root {} has no private key", root_id))
        })?;
        let issuer = SigningIdentity::from_pem(&root.certificate_pem, key)?;

        let subject = SubjectName::intermediate(&self.config.subject);
        let mut cert = self.create_issued(
            CertificateProfile::Intermediate,
            CertificateType::Intermediate,
            subject,
            validity_days,
            Some(&issuer),
            None,
            None,
        )?;
        if let Err(e) = self.exporter.export_certificate(&mut cert) {
            self.discard(&cert);
            return Err(e);
        }
        self.refresh_chain();
        info!(serial = %cert.serial, root = %root_id, "intermediate CA issued");
        Ok(cert)
    }

    pub fn issue_server(&self, server_id: i64, validity_days: u32) -> CaResult<Certificate> {
        let owner = Owner::Server(server_id);
        let _owner_guard = self.lock_owner(owner);
        let server = self
            .owners
            .server(server_id)?
            .ok_or_else(|| CaError::not_found("server", server_id))?;
        self.ensure_no_current_certificate(owner)?;

        let subject = SubjectName::for_server(&self.config.subject, &server);
        let cert = self.issue_leaf(
            owner,
            CertificateType::Server,
            subject,
            validity_days,
            None,
        )?;
        info!(serial = %cert.serial, server = %server.name, "server certificate issued");
        Ok(cert)
    }

    /// Issue a client certificate, wrapped as PKCS#12 when bundles are enabled.
    ///
    /// `pkcs12_password` is only consulted under the per-certificate password policy.
    pub fn issue_client(
        &self,
        user_id: i64,
        pkcs12_password: Option<&SecretString>,
        validity_days: u32,
    ) -> CaResult<Certificate> {
        let owner = Owner::User(user_id);
        let _owner_guard = self.lock_owner(owner);
        let user = self
            .owners
            .user(user_id)?
            .ok_or_else(|| CaError::not_found("user", user_id))?;
        self.ensure_no_current_certificate(owner)?;

        let subject = SubjectName::for_user(&self.config.subject, &user);
        let cert = self.issue_leaf(
            owner,
            self.client_type(),
            subject,
            validity_days,
            pkcs12_password,
        )?;
        info!(serial = %cert.serial, user = %user.username, "client certificate issued");
        Ok(cert)
    }

    pub fn renew(&self, id: CertificateId, validity_days: u32) -> CaResult<Certificate> {
        self.renew_with_password(id, validity_days, None)
    }

    /// Supersede certificate `id` with a fresh one for the same subject and type.
    ///
    /// Only the certificate the owner currently links to can be renewed. The old serial ends up
    /// in the ledger, the old record is deleted and the owner points at the new certificate.
    pub fn renew_with_password(
        &self,
        id: CertificateId,
        validity_days: u32,
        pkcs12_password: Option<&SecretString>,
    ) -> CaResult<Certificate> {
        let (old, _guards) = self.lock_certificate(id)?;
        if old.certificate_type.is_ca() {
            return Err(CaError::InvalidRequest(format!(
                "certificate {} is a CA certificate and cannot be renewed",
                id
            )));
        }
        let owner = old.owner.ok_or_else(|| {
            CaError::InvalidRequest(format!("certificate {} has no owner to renew for", id))
        })?;
        let previous_link = self.owners.certificate_id(owner)?;
        if previous_link != Some(id) {
            return Err(CaError::InvalidRequest(format!(
                "certificate {} is not the current certificate of {}",
                id, owner
            )));
        }

        let parsed = X509::from_pem(old.certificate_pem.as_bytes())
            .map_err(|e| CaError::signing("Failed to parse certificate", e))?;
        let subject = SubjectName::from_x509_name(parsed.subject_name());
        let certificate_type = if old.certificate_type.is_client() {
            self.client_type()
        } else {
            old.certificate_type
        };

        let issuer = self.signing_identity()?;
        let mut new = self.create_issued(
            profile_for(certificate_type),
            certificate_type,
            subject,
            validity_days,
            Some(&issuer),
            Some(owner),
            pkcs12_password,
        )?;

        let username = self.owners.owner_name(owner)?;
        let revoked_now = match self.ledger.revoke(&old, username, &issuer) {
            Ok(added) => added,
            Err(e) => {
                self.discard_record(&new);
                return Err(e);
            }
        };

        let result = self
            .exporter
            .export_certificate(&mut new)
            .and_then(|_| Ok(self.owners.set_certificate_id(owner, new.id)?))
            .and_then(|_| self.delete_record(&old));
        if let Err(e) = result {
            warn!(id = %id, error = %e, "renewal failed, rolling back");
            self.discard(&new);
            self.restore_link(owner, previous_link);
            if revoked_now {
                if let Err(clear_err) = self.ledger.clear(&old.serial, &issuer) {
                    warn!(serial = %old.serial, error = %clear_err, "failed to clear revocation");
                }
            }
            self.reexport(Some(id));
            return Err(e);
        }

        info!(
            old_id = %id,
            old_serial = %old.serial,
            serial = %new.serial,
            id = ?new.id,
            "certificate renewed"
        );
        Ok(new)
    }

    /// Enter the certificate's serial in the ledger. Returns `false` if it was already revoked.
    pub fn revoke(&self, id: CertificateId) -> CaResult<bool> {
        let (cert, _guards) = self.lock_certificate(id)?;
        let username = match cert.owner {
            Some(owner) => self.owners.owner_name(owner)?,
            None => None,
        };
        let issuer = self.signing_identity()?;
        self.ledger.revoke(&cert, username, &issuer)
    }

    /// Remove the certificate's serial from the ledger. Returns `false` if it was not revoked.
    pub fn re_enable(&self, id: CertificateId) -> CaResult<bool> {
        let (cert, _guards) = self.lock_certificate(id)?;
        let issuer = self.signing_identity()?;
        self.ledger.clear(&cert.serial, &issuer)
    }

    /// Delete a certificate with its bundle and unlink its owner. The ledger is left alone.
    ///
    /// Exported files are removed only when they belong to this certificate; a superseded leaf
    /// shares its paths with the owner's current one.
    pub fn remove(&self, id: CertificateId) -> CaResult<()> {
        let (cert, _guards) = self.lock_certificate(id)?;
        match self.exporter.is_current(&cert) {
            Ok(true) => {
                if let Err(e) = self.exporter.remove_files(&cert) {
                    warn!(id = %id, error = %e, "failed to remove exported files");
                }
            }
            Ok(false) => debug!(id = %id, "files belong to the owner's current certificate"),
            Err(e) => warn!(id = %id, error = %e, "failed to resolve exported files"),
        }
        self.delete_record(&cert)?;
        if let Some(owner) = cert.owner {
            if self.owners.certificate_id(owner)? == Some(id) {
                self.owners.set_certificate_id(owner, None)?;
            }
        }
        if cert.certificate_type.is_ca() {
            self.refresh_chain();
        }
        info!(id = %id, serial = %cert.serial, "certificate removed");
        Ok(())
    }

    /// Re-sign the CRL over the current entry set.
    pub fn publish_crl(&self) -> CaResult<CrlRecord> {
        let issuer = self.signing_identity()?;
        self.ledger.regenerate(&issuer)
    }

    /// Non-revoked certificates whose validity ends within `days`, soonest first.
    pub fn expiring_within(&self, days: u32) -> CaResult<Vec<Certificate>> {
        let limit = naive_local(Utc::now().timestamp()) + Duration::days(i64::from(days));
        let mut expiring = Vec::new();
        for id in self.repository.certificate_ids()? {
            let Some(cert) = self.repository.read_certificate(id)? else {
                continue;
            };
            if cert.valid_to <= limit && !self.ledger.contains(&cert.serial)? {
                expiring.push(cert);
            }
        }
        expiring.sort_by_key(|c| c.valid_to);
        Ok(expiring)
    }

    /// Export every certificate, the chain and the current CRL.
    pub fn export_all(&self) -> CaResult<ExportReport> {
        let report = self.exporter.export_all()?;
        self.ledger.export_current()?;
        Ok(report)
    }

    fn client_type(&self) -> CertificateType {
        if self.config.pkcs12.enabled {
            CertificateType::ClientPkcs12
        } else {
            CertificateType::Client
        }
    }

    fn lock_owner(&self, owner: Owner) -> KeyedGuard {
        debug!(owner = %owner, "waiting for owner lock");
        self.owner_locks.lock(&owner)
    }

    /// Lock the certificate's owner and the certificate itself, then re-read the record so the
    /// caller sees the state that holds while the guards are alive.
    fn lock_certificate(&self, id: CertificateId) -> CaResult<(Certificate, Vec<KeyedGuard>)> {
        let mut guards = Vec::with_capacity(2);
        if let Some(owner) = self.certificate(id)?.owner {
            guards.push(self.lock_owner(owner));
        }
        guards.push(self.certificate_locks.lock(&id));
        let cert = self.certificate(id)?;
        Ok((cert, guards))
    }

    fn ensure_no_current_certificate(&self, owner: Owner) -> CaResult<()> {
        let Some(current) = self.owners.certificate_id(owner)? else {
            return Ok(());
        };
        match self.repository.read_certificate(current)? {
            Some(cert) if !self.ledger.contains(&cert.serial)? => {
                Err(CaError::InvalidRequest(format!(
                    "{} already holds valid certificate {}; renew it instead",
                    owner, current
                )))
            }
            _ => Ok(()),
        }
    }

    fn issue_leaf(
        &self,
        owner: Owner,
        certificate_type: CertificateType,
        subject: SubjectName,
        validity_days: u32,
        pkcs12_password: Option<&SecretString>,
    ) -> CaResult<Certificate> {
        let issuer = self.signing_identity()?;
        let mut cert = self.create_issued(
            profile_for(certificate_type),
            certificate_type,
            subject,
            validity_days,
            Some(&issuer),
            Some(owner),
            pkcs12_password,
        )?;

        let previous_link = self.owners.certificate_id(owner)?;
        let result = self
            .exporter
            .export_certificate(&mut cert)
            .and_then(|_| Ok(self.owners.set_certificate_id(owner, cert.id)?));
        if let Err(e) = result {
            warn!(owner = %owner, error = %e, "issuance failed, rolling back");
            self.discard(&cert);
            self.restore_link(owner, previous_link);
            self.reexport(previous_link);
            return Err(e);
        }
        Ok(cert)
    }

    /// Sign a certificate and persist its record plus, for bundles, the PKCS#12 blob.
    #[allow(clippy::too_many_arguments)]
    fn create_issued(
        &self,
        profile: CertificateProfile,
        certificate_type: CertificateType,
        subject: SubjectName,
        validity_days: u32,
        issuer: Option<&SigningIdentity>,
        owner: Option<Owner>,
        pkcs12_password: Option<&SecretString>,
    ) -> CaResult<Certificate> {
        if validity_days == 0 {
            return Err(CaError::InvalidRequest(
                "validity must be at least one day".to_string(),
            ));
        }
        let bundle = certificate_type == CertificateType::ClientPkcs12;
        let (chain, password) = if bundle {
            (
                self.chain()?,
                Some(self.exporter.resolve_password(pkcs12_password)?),
            )
        } else {
            (Vec::new(), None)
        };

        let serial = self.allocate_serial()?;
        let not_before = Utc::now().timestamp();
        let request = IssueRequest {
            subject,
            serial,
            not_before,
            not_after: not_before + i64::from(validity_days) * SECONDS_PER_DAY,
            profile,
        };
        let issued = self.backend.issue(&request, issuer)?;

        let record = Certificate::from_x509(
            &issued.certificate,
            Some(&issued.private_key),
            certificate_type,
            true,
            owner,
        )?;
        let id = match self.repository.create_certificate(&record) {
            Ok(id) => id,
            Err(StoreError::Conflict(_)) => return Err(CaError::DuplicateSerial(record.serial)),
            Err(e) => return Err(e.into()),
        };
        let cert = Certificate {
            id: Some(id),
            ..record
        };

        if bundle {
            let saved = self
                .exporter
                .bundle(&cert, &chain, password.as_ref())
                .and_then(|blob| Ok(self.repository.save_pkcs12(&blob)?));
            if let Err(e) = saved {
                self.discard_record(&cert);
                return Err(e);
            }
        }
        debug!(serial = %cert.serial, id = %id, "certificate record created");
        Ok(cert)
    }

    /// Next serial from the repository counter, skipping values that imports or the ledger
    /// already occupy.
    fn allocate_serial(&self) -> CaResult<u64> {
        for _ in 0..MAX_SERIAL_ATTEMPTS {
            let serial = self.repository.next_serial()?;
            let hex = serial_to_hex(serial)?;
            if self.repository.find_by_serial(&hex)?.is_none() && !self.ledger.contains(&hex)? {
                return Ok(serial);
            }
            debug!(serial = %hex, "serial already taken, skipping");
        }
        Err(CaError::DuplicateSerial(
            "no free serial within the allocation window".to_string(),
        ))
    }

    fn delete_record(&self, cert: &Certificate) -> CaResult<()> {
        let Some(id) = cert.id else {
            return Ok(());
        };
        self.repository.delete_pkcs12(id)?;
        if !self.repository.delete_certificate(id)? {
            return Err(CaError::not_found("certificate", id));
        }
        Ok(())
    }

    /// Best-effort removal of a freshly created certificate, its blob and the files its export
    /// wrote. Callers re-export whatever previously lived at those paths.
    fn discard(&self, cert: &Certificate) {
        if let Err(e) = self.exporter.remove_files(cert) {
            warn!(serial = %cert.serial, error = %e, "failed to remove exported files");
        }
        self.discard_record(cert);
    }

    /// Like [`CaEngine::discard`] for a certificate that was never exported.
    fn discard_record(&self, cert: &Certificate) {
        if let Err(e) = self.delete_record(cert) {
            warn!(serial = %cert.serial, error = %e, "failed to delete certificate record");
        }
    }

    fn restore_link(&self, owner: Owner, previous: Option<CertificateId>) {
        if let Err(e) = self.owners.set_certificate_id(owner, previous) {
            warn!(owner = %owner, error = %e, "failed to restore owner link");
        }
    }

    /// Put back files that a rolled-back export overwrote or removed.
    fn reexport(&self, id: Option<CertificateId>) {
        let Some(id) = id else {
            return;
        };
        match self.repository.read_certificate(id) {
            Ok(Some(mut cert)) => {
                if let Err(e) = self.exporter.export_certificate(&mut cert) {
                    warn!(id = %id, error = %e, "failed to re-export certificate");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(id = %id, error = %e, "failed to read certificate for re-export"),
        }
    }

    fn refresh_chain(&self) {
        if let Err(e) = self.exporter.export_chain() {
            warn!(error = %e, "failed to export CA chain");
        }
    }
}

fn profile_for(certificate_type: CertificateType) -> CertificateProfile {
    match certificate_type {
        CertificateType::Root => CertificateProfile::Root,
        CertificateType::Intermediate => CertificateProfile::Intermediate,
        CertificateType::Server => CertificateProfile::Server,
        CertificateType::Client | CertificateType::ClientPkcs12 => CertificateProfile::Client,
    }
}

fn serial_to_hex(serial: u64) -> CaResult<String> {
    let bn = openssl::bn::BigNum::from_dec_str(&serial.to_string())?;
    Ok(bn.to_hex_str()?.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configs::PasswordPolicy;
    use crate::model::{ServerProfile, UserProfile};
    use crate::signing::tests::TEST_KEY_SIZE;
    use crate::storage::memory::{MemoryOwners, MemoryRepository};
    use crate::storage::{CertificateStore, Pkcs12Store};

    struct Fixture {
        _dir: tempfile::TempDir,
        repository: Arc<MemoryRepository>,
        owners: Arc<MemoryOwners>,
        engine: CaEngine,
    }

    fn fixture(configure: impl FnOnce(&mut CaConfig)) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut config = CaConfig::default();
        config.ca.key_size = TEST_KEY_SIZE;
        config.export.root = dir.path().join("exports");
        configure(&mut config);

        let repository = Arc::new(MemoryRepository::new());
        let owners = Arc::new(MemoryOwners::new());
        owners.insert_user(UserProfile {
            id: 1,
            username: "alice".to_string(),
            common_name: None,
            organizational_unit: Some("staff".to_string()),
            certificate_id: None,
        });
        owners.insert_server(ServerProfile {
            id: 7,
            name: "gateway-1".to_string(),
            common_name: Some("vpn.example.org".to_string()),
            organizational_unit: None,
            certificate_id: None,
        });
        let engine = CaEngine::new(repository.clone(), owners.clone(), config);
        Fixture {
            _dir: dir,
            repository,
            owners,
            engine,
        }
    }

    fn with_root(f: &Fixture) -> Certificate {
        f.engine
            .issue_root(3650, &f.engine.config().subject.clone())
            .unwrap()
    }

    fn user_link(f: &Fixture) -> Option<CertificateId> {
        f.owners.certificate_id(Owner::User(1)).unwrap()
    }

    #[test]
    fn test_leaf_requires_signing_ca() {
        let f = fixture(|_| {});
        assert!(matches!(
            f.engine.issue_client(1, None, 90),
            Err(CaError::NotFound { .. })
        ));
        assert!(f.repository.certificate_ids().unwrap().is_empty());
    }

    #[test]
    fn test_issue_server_and_client() {
        let f = fixture(|_| {});
        let root = with_root(&f);
        assert!(f.engine.exporter().root().join("ca.crt").exists());
        assert!(f.engine.exporter().chain_path().exists());

        let server = f.engine.issue_server(7, 365).unwrap();
        assert_eq!(server.certificate_type, CertificateType::Server);
        assert_eq!(server.common_name, "vpn.example.org");
        assert_eq!(server.issuer_dn, root.subject_dn);
        assert_eq!(
            f.owners.certificate_id(Owner::Server(7)).unwrap(),
            server.id
        );
        assert!(f
            .engine
            .exporter()
            .root()
            .join("_gateway-1/gateway-1.crt")
            .exists());

        let client = f.engine.issue_client(1, None, 90).unwrap();
        assert_eq!(client.common_name, "alice");
        assert!(client.subject_dn.contains("OU=staff"));
        assert_eq!(user_link(&f), client.id);
        assert_ne!(client.serial, server.serial);
    }

    #[test]
    fn test_second_issue_for_owner_is_rejected() {
        let f = fixture(|_| {});
        with_root(&f);
        let first = f.engine.issue_client(1, None, 90).unwrap();
        assert!(matches!(
            f.engine.issue_client(1, None, 90),
            Err(CaError::InvalidRequest(_))
        ));

        f.engine.revoke(first.id.unwrap()).unwrap();
        let second = f.engine.issue_client(1, None, 90).unwrap();
        assert_eq!(user_link(&f), second.id);
    }

    #[test]
    fn test_unknown_owner_is_not_found() {
        let f = fixture(|_| {});
        with_root(&f);
        assert!(matches!(
            f.engine.issue_server(99, 30),
            Err(CaError::NotFound { .. })
        ));
        assert!(matches!(
            f.engine.revoke(CertificateId(999)),
            Err(CaError::NotFound { .. })
        ));
        assert!(matches!(
            f.engine.re_enable(CertificateId(999)),
            Err(CaError::NotFound { .. })
        ));
    }

    #[test]
    fn test_revoke_and_re_enable_are_idempotent() {
        let f = fixture(|_| {});
        with_root(&f);
        let client = f.engine.issue_client(1, None, 90).unwrap();
        let id = client.id.unwrap();

        assert!(f.engine.revoke(id).unwrap());
        assert!(!f.engine.revoke(id).unwrap());
        assert_eq!(f.engine.ledger().current().unwrap().unwrap().number, 1);
        assert!(f.engine.is_revoked(&client).unwrap());

        assert!(f.engine.re_enable(id).unwrap());
        assert!(!f.engine.re_enable(id).unwrap());
        assert!(!f.engine.is_revoked(&client).unwrap());

        assert!(f.engine.revoke(id).unwrap());
        assert_eq!(f.engine.ledger().entries().unwrap().len(), 1);
        assert_eq!(f.engine.ledger().current().unwrap().unwrap().number, 3);
    }

    #[test]
    fn test_renew_supersedes() {
        let f = fixture(|_| {});
        with_root(&f);
        let old = f.engine.issue_client(1, None, 90).unwrap();
        let renewed = f.engine.renew(old.id.unwrap(), 365).unwrap();

        assert_ne!(renewed.id, old.id);
        assert_ne!(renewed.serial, old.serial);
        assert_eq!(renewed.common_name, old.common_name);
        assert_eq!(renewed.subject_dn, old.subject_dn);
        assert!(f.repository.read_certificate(old.id.unwrap()).unwrap().is_none());
        assert_eq!(user_link(&f), renewed.id);
        assert!(f.engine.ledger().contains(&old.serial).unwrap());
        assert!(!f.engine.ledger().contains(&renewed.serial).unwrap());

        assert!(matches!(
            f.engine.re_enable(old.id.unwrap()),
            Err(CaError::NotFound { .. })
        ));
        assert!(matches!(
            f.engine.renew(old.id.unwrap(), 365),
            Err(CaError::NotFound { .. })
        ));
    }

    #[test]
    fn test_failed_export_rolls_back_issue() {
        let f = fixture(|_| {});
        with_root(&f);
        // A regular file where the user's export directory should go.
        std::fs::write(f.engine.exporter().root().join("alice"), b"blocked").unwrap();

        let before = f.repository.certificate_ids().unwrap();
        assert!(matches!(
            f.engine.issue_client(1, None, 90),
            Err(CaError::ExportIo { .. })
        ));
        assert_eq!(f.repository.certificate_ids().unwrap(), before);
        assert!(user_link(&f).is_none());
    }

    #[test]
    fn test_pkcs12_client_bundle() {
        let f = fixture(|c| {
            c.pkcs12.enabled = true;
            c.pkcs12.password_policy = PasswordPolicy::PerCertificate;
        });
        with_root(&f);
        assert!(matches!(
            f.engine.issue_client(1, None, 90),
            Err(CaError::InvalidRequest(_))
        ));

        let password = SecretString::from("bundle-pw".to_string());
        let client = f.engine.issue_client(1, Some(&password), 90).unwrap();
        assert_eq!(client.certificate_type, CertificateType::ClientPkcs12);
        let id = client.id.unwrap();
        assert!(f.repository.read_pkcs12(id).unwrap().is_some());
        assert!(f.engine.exporter().root().join("alice/alice.p12").exists());

        let (cert, _key) = f.engine.exporter().open_pkcs12(id, &password).unwrap();
        assert_eq!(crate::model::serial_hex(&cert).unwrap(), client.serial);

        let renewed = f
            .engine
            .renew_with_password(id, 30, Some(&password))
            .unwrap();
        assert!(f.repository.read_pkcs12(id).unwrap().is_none());
        assert!(f.repository.read_pkcs12(renewed.id.unwrap()).unwrap().is_some());
    }

    #[test]
    fn test_intermediate_signs_leaves_and_crl() {
        let f = fixture(|c| c.ca.use_intermediate = true);
        let root = with_root(&f);
        let intermediate = f.engine.issue_intermediate(root.id.unwrap(), 1825).unwrap();
        assert_eq!(intermediate.issuer_dn, root.subject_dn);
        assert_eq!(f.engine.chain().unwrap().len(), 2);

        let server = f.engine.issue_server(7, 365).unwrap();
        assert_eq!(server.issuer_dn, intermediate.subject_dn);

        let crl = f.engine.publish_crl().unwrap();
        assert_eq!(crl.issuer, intermediate.subject_dn);

        assert!(matches!(
            f.engine.issue_intermediate(server.id.unwrap(), 30),
            Err(CaError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_remove_unlinks_owner() {
        let f = fixture(|_| {});
        with_root(&f);
        let client = f.engine.issue_client(1, None, 90).unwrap();
        f.engine.remove(client.id.unwrap()).unwrap();
        assert!(user_link(&f).is_none());
        assert!(!f.engine.exporter().root().join("alice/alice.crt").exists());
        assert!(f.engine.ledger().entries().unwrap().is_empty());
    }

    #[test]
    fn test_remove_superseded_keeps_current_files() {
        let f = fixture(|_| {});
        with_root(&f);
        let stale = f.engine.issue_client(1, None, 90).unwrap();
        f.engine.revoke(stale.id.unwrap()).unwrap();
        let current = f.engine.issue_client(1, None, 90).unwrap();
        let cert_path = f.engine.exporter().root().join("alice/alice.crt");

        f.engine.remove(stale.id.unwrap()).unwrap();
        assert!(f.repository.read_certificate(stale.id.unwrap()).unwrap().is_none());
        assert_eq!(user_link(&f), current.id);
        assert_eq!(
            std::fs::read_to_string(&cert_path).unwrap(),
            current.certificate_pem
        );
        assert!(f
            .engine
            .exporter()
            .root()
            .join("alice/alice.key")
            .exists());
    }

    #[test]
    fn test_renew_of_superseded_certificate_is_rejected() {
        let f = fixture(|_| {});
        with_root(&f);
        let stale = f.engine.issue_client(1, None, 90).unwrap();
        f.engine.revoke(stale.id.unwrap()).unwrap();
        let current = f.engine.issue_client(1, None, 90).unwrap();
        let ids_before = f.repository.certificate_ids().unwrap().len();
        let crl_before = f.engine.ledger().current().unwrap().unwrap().number;

        assert!(matches!(
            f.engine.renew(stale.id.unwrap(), 30),
            Err(CaError::InvalidRequest(_))
        ));
        assert_eq!(user_link(&f), current.id);
        assert_eq!(f.repository.certificate_ids().unwrap().len(), ids_before);
        assert!(!f.engine.is_revoked(&current).unwrap());
        assert_eq!(f.engine.ledger().entries().unwrap().len(), 1);
        assert_eq!(
            f.engine.ledger().current().unwrap().unwrap().number,
            crl_before
        );
        assert_eq!(
            std::fs::read_to_string(f.engine.exporter().root().join("alice/alice.crt")).unwrap(),
            current.certificate_pem
        );

        let renewed = f.engine.renew(current.id.unwrap(), 30).unwrap();
        assert_eq!(user_link(&f), renewed.id);
        assert!(f.engine.is_revoked(&current).unwrap());
    }

    #[test]
    fn test_expiring_within() {
        let f = fixture(|_| {});
        with_root(&f);
        let short = f.engine.issue_client(1, None, 5).unwrap();
        f.engine.issue_server(7, 365).unwrap();

        let expiring = f.engine.expiring_within(30).unwrap();
        assert_eq!(expiring.len(), 1);
        assert_eq!(expiring[0].id, short.id);

        f.engine.revoke(short.id.unwrap()).unwrap();
        assert!(f.engine.expiring_within(30).unwrap().is_empty());
    }

    #[test]
    fn test_allocation_skips_imported_serials() {
        let f = fixture(|_| {});
        let root = with_root(&f);
        // Occupy the next counter value the way an import would.
        let mut imported = root.clone();
        imported.id = None;
        imported.serial = "02".to_string();
        imported.certificate_type = CertificateType::Client;
        imported.generated = false;
        f.repository.create_certificate(&imported).unwrap();

        let client = f.engine.issue_client(1, None, 90).unwrap();
        assert_eq!(client.serial, "03");
    }

    #[test]
    fn test_zero_validity_rejected() {
        let f = fixture(|_| {});
        assert!(matches!(
            f.engine.issue_root(0, &SubjectDefaults::default()),
            Err(CaError::InvalidRequest(_))
        ));
    }
}
