//! Materializes stored certificates on the filesystem.
//!
//! # Layout
//! ```text
//! <export root>/
//! ├── ca.crt, ca.key               root (key only with export_ca_key)
//! ├── intermediate.crt, .key       intermediate
//! ├── ca-chain.crt                 trust chain, root first
//! ├── crl.pem                      written by the revocation ledger
//! ├── <username>/<username>.crt    client certificate, key and .p12
//! └── _<servername>/<servername>.crt
//! ```
//! Certificates follow the configured format (PEM `.crt` or DER `.der`); keys are always PEM
//! `.key`. Every file is written through a temporary file in the target directory and renamed
//! into place, so readers never see a half-written file. Private material is created 0600 on
//! Unix.
//!
//! Export reads only stored content, so exporting again after the directory was deleted
//! reproduces the files byte for byte.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use openssl::pkcs12::Pkcs12;
use openssl::pkey::{PKey, Private};
use openssl::stack::Stack;
use openssl::x509::X509;
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::configs::{
    CaConfig, ExportFormat, ExportSettings, PasswordPolicy, PasswordStorage, Pkcs12Settings,
};
use crate::error::{CaError, CaResult};
use crate::model::{
    Certificate, CertificateId, CertificateType, Owner, Pkcs12Blob, StoredPassword,
};
use crate::storage::{OwnerDirectory, Repository};

const ROOT_BASE_NAME: &str = "ca";
const INTERMEDIATE_BASE_NAME: &str = "intermediate";
const KEY_EXTENSION: &str = "key";
const PKCS12_EXTENSION: &str = "p12";
const SERVER_DIR_PREFIX: char = '_';

/// Write `bytes` to `path`, creating parent directories. `private` files get mode 0600.
pub(crate) fn write_file_atomic(path: &Path, bytes: &[u8], private: bool) -> CaResult<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|e| CaError::export_io(parent, e))?;

    let mut file = NamedTempFile::new_in(parent).map_err(|e| CaError::export_io(path, e))?;
    file.write_all(bytes)
        .and_then(|_| file.as_file().sync_all())
        .map_err(|e| CaError::export_io(path, e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = if private { 0o600 } else { 0o644 };
        fs::set_permissions(file.path(), fs::Permissions::from_mode(mode))
            .map_err(|e| CaError::export_io(path, e))?;
    }
    #[cfg(not(unix))]
    let _ = private;

    file.persist(path).map_err(|e| CaError::export_io(path, e.error))?;
    debug!(path = %path.display(), "file written");
    Ok(())
}

fn remove_if_present(path: &Path) -> CaResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CaError::export_io(path, e)),
    }
}

/// Outcome of a full-fleet export. Failures are per certificate and never abort the batch.
#[derive(Debug, Default)]
pub struct ExportReport {
    pub exported: usize,
    /// Superseded leaves that share their owner's paths with the linked certificate.
    pub skipped: usize,
    pub failures: Vec<(CertificateId, CaError)>,
}

impl ExportReport {
    pub fn failed(&self) -> usize {
        self.failures.len()
    }
}

/// Files produced for one certificate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportedFiles {
    pub certificate: PathBuf,
    pub private_key: Option<PathBuf>,
    pub pkcs12: Option<PathBuf>,
}

impl ExportedFiles {
    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        std::iter::once(self.certificate.as_path())
            .chain(self.private_key.as_deref())
            .chain(self.pkcs12.as_deref())
    }
}

pub struct Exporter {
    repository: Arc<dyn Repository>,
    owners: Arc<dyn OwnerDirectory>,
    settings: ExportSettings,
    pkcs12: Pkcs12Settings,
    use_intermediate: bool,
}

impl Exporter {
    pub fn new(
        repository: Arc<dyn Repository>,
        owners: Arc<dyn OwnerDirectory>,
        config: &CaConfig,
    ) -> Self {
        Self {
            repository,
            owners,
            settings: config.export.clone(),
            pkcs12: config.pkcs12.clone(),
            use_intermediate: config.ca.use_intermediate,
        }
    }

    pub fn root(&self) -> &Path {
        &self.settings.root
    }

    pub fn crl_path(&self) -> PathBuf {
        self.settings.root.join(&self.settings.crl_file_name)
    }

    pub fn chain_path(&self) -> PathBuf {
        self.settings.root.join(&self.settings.chain_file_name)
    }

    /// The CA certificates leaf material chains to, root first.
    ///
    /// The newest usable root is picked; with `use_intermediate` the newest usable intermediate
    /// issued by that root is appended. Usable means: private key present and not revoked.
    pub fn chain(&self) -> CaResult<Vec<Certificate>> {
        let Some(root) = self.newest_usable(CertificateType::Root, None)? else {
            return Ok(Vec::new());
        };
        let mut chain = Vec::with_capacity(2);
        let intermediate = if self.use_intermediate {
            self.newest_usable(CertificateType::Intermediate, Some(&root.subject_dn))?
        } else {
            None
        };
        chain.push(root);
        chain.extend(intermediate);
        Ok(chain)
    }

    fn newest_usable(
        &self,
        certificate_type: CertificateType,
        issuer_dn: Option<&str>,
    ) -> CaResult<Option<Certificate>> {
        let mut candidates = Vec::new();
        for cert in self.repository.find_by_type(certificate_type)? {
            if !cert.has_private_key() {
                continue;
            }
            if issuer_dn.is_some_and(|dn| dn != cert.issuer_dn) {
                continue;
            }
            if !self.repository.find_crl_entries(&cert.serial)?.is_empty() {
                continue;
            }
            candidates.push(cert);
        }
        Ok(candidates.into_iter().max_by_key(|c| (c.valid_from, c.id)))
    }

    /// Directory a certificate's files live in.
    pub fn owner_dir(&self, cert: &Certificate) -> CaResult<PathBuf> {
        if cert.certificate_type.is_ca() {
            return Ok(self.settings.root.clone());
        }
        let dir = match cert.owner {
            Some(owner @ Owner::Server(_)) => {
                format!("{}{}", SERVER_DIR_PREFIX, sanitize(&self.owner_name(owner, cert)?))
            }
            Some(owner @ Owner::User(_)) => sanitize(&self.owner_name(owner, cert)?),
            None => sanitize(&cert.common_name),
        };
        Ok(self.settings.root.join(dir))
    }

    /// File stem shared by the certificate, key and bundle.
    pub fn base_name(&self, cert: &Certificate) -> CaResult<String> {
        Ok(match (cert.certificate_type, cert.owner) {
            (CertificateType::Root, _) => ROOT_BASE_NAME.to_string(),
            (CertificateType::Intermediate, _) => INTERMEDIATE_BASE_NAME.to_string(),
            (_, Some(owner)) => sanitize(&self.owner_name(owner, cert)?),
            (_, None) => sanitize(&cert.common_name),
        })
    }

    fn owner_name(&self, owner: Owner, cert: &Certificate) -> CaResult<String> {
        match self.owners.owner_name(owner)? {
            Some(name) if !name.trim().is_empty() => Ok(name),
            Some(_) => Ok(cert.common_name.clone()),
            None => Err(CaError::not_found("owner", owner)),
        }
    }

    /// Whether `cert` owns its export paths: CA certificates, unowned leaves and the leaf its
    /// owner currently links to. Every other leaf of an owner maps onto the linked one's files.
    pub fn is_current(&self, cert: &Certificate) -> CaResult<bool> {
        if cert.certificate_type.is_ca() {
            return Ok(true);
        }
        let Some(owner) = cert.owner else {
            return Ok(true);
        };
        let linked = match owner {
            Owner::User(id) => self.owners.user(id)?.map(|u| u.certificate_id),
            Owner::Server(id) => self.owners.server(id)?.map(|s| s.certificate_id),
        }
        .ok_or_else(|| CaError::not_found("owner", owner))?;
        Ok(cert.id.is_some() && linked == cert.id)
    }

    /// Paths `cert` exports to, whether or not they exist yet.
    pub fn planned_files(&self, cert: &Certificate) -> CaResult<ExportedFiles> {
        let dir = self.owner_dir(cert)?;
        let base = self.base_name(cert)?;
        let write_key = cert.has_private_key()
            && (!cert.certificate_type.is_ca() || self.settings.export_ca_key);
        Ok(ExportedFiles {
            certificate: dir.join(format!(
                "{}.{}",
                base,
                self.settings.format.certificate_extension()
            )),
            private_key: write_key.then(|| dir.join(format!("{}.{}", base, KEY_EXTENSION))),
            pkcs12: (cert.certificate_type == CertificateType::ClientPkcs12)
                .then(|| dir.join(format!("{}.{}", base, PKCS12_EXTENSION))),
        })
    }

    /// Write `cert`'s files and record where they went.
    ///
    /// The record is updated in the repository when its file name or path changed. Files
    /// written before a failure are left in place; callers that need all-or-nothing remove them
    /// with [`Exporter::remove_files`].
    pub fn export_certificate(&self, cert: &mut Certificate) -> CaResult<ExportedFiles> {
        let files = self.planned_files(cert)?;

        let body = match self.settings.format {
            ExportFormat::Pem => cert.certificate_pem.as_bytes().to_vec(),
            ExportFormat::Der => X509::from_pem(cert.certificate_pem.as_bytes())
                .and_then(|x| x.to_der())
                .map_err(|e| CaError::signing("Failed to encode certificate as DER", e))?,
        };
        write_file_atomic(&files.certificate, &body, false)?;

        if let (Some(path), Some(key)) = (&files.private_key, &cert.private_key_pem) {
            write_file_atomic(path, key.as_bytes(), true)?;
        }

        if let Some(path) = &files.pkcs12 {
            let id = stored_id(cert)?;
            let blob = self
                .repository
                .read_pkcs12(id)?
                .ok_or_else(|| CaError::not_found("PKCS#12 bundle", id))?;
            write_file_atomic(path, &blob.content, true)?;
        }

        let file_name = files
            .certificate
            .file_name()
            .map(|n| n.to_string_lossy().into_owned());
        let export_path = files.certificate.parent().map(Path::to_path_buf);
        if cert.id.is_some() && (cert.file_name != file_name || cert.export_path != export_path) {
            cert.file_name = file_name;
            cert.export_path = export_path;
            self.repository.update_certificate(cert)?;
        }

        debug!(serial = %cert.serial, path = %files.certificate.display(), "certificate exported");
        Ok(files)
    }

    pub fn export_by_id(&self, id: CertificateId) -> CaResult<ExportedFiles> {
        let mut cert = self
            .repository
            .read_certificate(id)?
            .ok_or_else(|| CaError::not_found("certificate", id))?;
        self.export_certificate(&mut cert)
    }

    /// Delete the files `cert` exports to. Missing files are fine.
    pub fn remove_files(&self, cert: &Certificate) -> CaResult<()> {
        let files = self.planned_files(cert)?;
        for path in files.paths() {
            remove_if_present(path)?;
        }
        Ok(())
    }

    /// Write `<export root>/<chain file>` with every CA certificate of the active chain.
    pub fn export_chain(&self) -> CaResult<Option<PathBuf>> {
        let chain = self.chain()?;
        if chain.is_empty() {
            return Ok(None);
        }
        let mut content = String::new();
        for cert in &chain {
            content.push_str(&cert.certificate_pem);
            if !cert.certificate_pem.ends_with('\n') {
                content.push('\n');
            }
        }
        let path = self.chain_path();
        write_file_atomic(&path, content.as_bytes(), false)?;
        Ok(Some(path))
    }

    /// Re-export every current certificate plus the chain file.
    pub fn export_all(&self) -> CaResult<ExportReport> {
        let mut report = ExportReport::default();
        for id in self.repository.certificate_ids()? {
            let Some(mut cert) = self.repository.read_certificate(id)? else {
                continue;
            };
            let exported = self.is_current(&cert).and_then(|current| {
                if current {
                    self.export_certificate(&mut cert).map(|_| true)
                } else {
                    Ok(false)
                }
            });
            match exported {
                Ok(true) => report.exported += 1,
                Ok(false) => {
                    debug!(id = %id, serial = %cert.serial, "superseded certificate not exported");
                    report.skipped += 1;
                }
                Err(e) => {
                    warn!(id = %id, error = %e, "export failed");
                    report.failures.push((id, e));
                }
            }
        }
        self.export_chain()?;
        info!(
            exported = report.exported,
            skipped = report.skipped,
            failed = report.failed(),
            "fleet export finished"
        );
        Ok(report)
    }

    /// Pick the password protecting a new bundle.
    ///
    /// `Single` always uses the configured password, `PerCertificate` requires `supplied`,
    /// `None` yields an empty password.
    pub fn resolve_password(&self, supplied: Option<&SecretString>) -> CaResult<SecretString> {
        match self.pkcs12.password_policy {
            PasswordPolicy::None => Ok(SecretString::from(String::new())),
            PasswordPolicy::Single => self
                .pkcs12
                .password
                .clone()
                .map(SecretString::from)
                .ok_or_else(|| {
                    CaError::InvalidRequest("single PKCS#12 password is not configured".to_string())
                }),
            PasswordPolicy::PerCertificate => supplied.cloned().ok_or_else(|| {
                CaError::InvalidRequest("a PKCS#12 password is required".to_string())
            }),
        }
    }

    fn stored_password(&self, password: &SecretString) -> StoredPassword {
        let secret = password.expose_secret();
        if secret.is_empty() {
            return StoredPassword::None;
        }
        match self.pkcs12.password_storage {
            PasswordStorage::None => StoredPassword::None,
            PasswordStorage::Plain => StoredPassword::Plain(secret.to_string()),
            PasswordStorage::Sha256 => StoredPassword::Sha256(hash_password(secret)),
        }
    }

    /// Wrap `cert`'s key and certificate with `chain` into a PKCS#12 blob.
    pub fn bundle(
        &self,
        cert: &Certificate,
        chain: &[Certificate],
        password: Option<&SecretString>,
    ) -> CaResult<Pkcs12Blob> {
        let id = stored_id(cert)?;
        let key_pem = cert.private_key_pem.as_deref().ok_or_else(|| {
            CaError::InvalidRequest(format!("certificate {} has no private key to bundle", id))
        })?;
        if chain.is_empty() {
            return Err(CaError::InvalidRequest(
                "no signing chain to anchor the PKCS#12 bundle".to_string(),
            ));
        }
        let password = self.resolve_password(password)?;

        let leaf = X509::from_pem(cert.certificate_pem.as_bytes())
            .map_err(|e| CaError::signing("Failed to parse certificate", e))?;
        let key: PKey<Private> = PKey::private_key_from_pem(key_pem.as_bytes())
            .map_err(|e| CaError::signing("Failed to parse private key", e))?;

        let mut ca_stack =
            Stack::new().map_err(|e| CaError::signing("Failed to create CA stack", e))?;
        for ca in chain.iter().rev() {
            let ca_cert = X509::from_pem(ca.certificate_pem.as_bytes())
                .map_err(|e| CaError::signing("Failed to parse CA certificate", e))?;
            ca_stack
                .push(ca_cert)
                .map_err(|e| CaError::signing("Failed to add CA certificate to bundle", e))?;
        }

        let pkcs12 = Pkcs12::builder()
            .name(&cert.common_name)
            .pkey(&key)
            .cert(&leaf)
            .ca(ca_stack)
            .build2(password.expose_secret())
            .map_err(|e| CaError::signing("Failed to build PKCS#12 bundle", e))?;
        let content = pkcs12
            .to_der()
            .map_err(|e| CaError::signing("Failed to encode PKCS#12 bundle", e))?;

        Ok(Pkcs12Blob {
            certificate_id: id,
            friendly_name: cert.common_name.clone(),
            password: self.stored_password(&password),
            content,
        })
    }

    /// Rebuild the bundle of a stored certificate without re-signing, then persist and export it.
    pub fn rebuild_pkcs12(
        &self,
        id: CertificateId,
        password: Option<&SecretString>,
    ) -> CaResult<Pkcs12Blob> {
        let mut cert = self
            .repository
            .read_certificate(id)?
            .ok_or_else(|| CaError::not_found("certificate", id))?;
        if !cert.certificate_type.is_client() {
            return Err(CaError::InvalidRequest(format!(
                "certificate {} is not a client certificate",
                id
            )));
        }
        let chain = self.chain()?;
        let blob = self.bundle(&cert, &chain, password)?;
        self.repository.save_pkcs12(&blob)?;
        if cert.certificate_type != CertificateType::ClientPkcs12 {
            cert.certificate_type = CertificateType::ClientPkcs12;
            self.repository.update_certificate(&cert)?;
        }
        self.export_certificate(&mut cert)?;
        info!(id = %id, "PKCS#12 bundle rebuilt");
        Ok(blob)
    }

    /// Open a stored bundle, returning its certificate and key.
    pub fn open_pkcs12(
        &self,
        id: CertificateId,
        password: &SecretString,
    ) -> CaResult<(X509, PKey<Private>)> {
        let blob = self
            .repository
            .read_pkcs12(id)?
            .ok_or_else(|| CaError::not_found("PKCS#12 bundle", id))?;
        let parsed = Pkcs12::from_der(&blob.content)
            .and_then(|p| p.parse2(password.expose_secret()))
            .map_err(|e| CaError::signing("Failed to open PKCS#12 bundle", e))?;
        match (parsed.cert, parsed.pkey) {
            (Some(cert), Some(key)) => Ok((cert, key)),
            _ => Err(CaError::Signing(format!(
                "PKCS#12 bundle {} lacks certificate or key",
                id
            ))),
        }
    }
}

/// Whether `password` matches what was stored with a bundle.
pub fn verify_stored_password(stored: &StoredPassword, password: &SecretString) -> bool {
    match stored {
        StoredPassword::None => true,
        StoredPassword::Plain(plain) => plain == password.expose_secret(),
        StoredPassword::Sha256(hash) => *hash == hash_password(password.expose_secret()),
    }
}

fn hash_password(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

fn stored_id(cert: &Certificate) -> CaResult<CertificateId> {
    cert.id.ok_or_else(|| {
        CaError::InvalidRequest(format!("certificate {} is not stored yet", cert.serial))
    })
}

/// Owner names become directory and file names; path separators and leading dots are replaced.
fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '\0' => '_',
            c => c,
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{naive_local, UserProfile};
    use crate::signing::tests::{request, test_root};
    use crate::signing::{CertificateProfile, OpenSslBackend, SigningBackend};
    use crate::storage::memory::{MemoryOwners, MemoryRepository};
    use crate::storage::CertificateStore;
    use crate::signing::tests::TEST_KEY_SIZE;
    use crate::subject::{common_name, dn_string};

    struct Fixture {
        _dir: tempfile::TempDir,
        repository: Arc<MemoryRepository>,
        owners: Arc<MemoryOwners>,
        exporter: Exporter,
    }

    fn fixture(configure: impl FnOnce(&mut CaConfig)) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut config = CaConfig::default();
        config.export.root = dir.path().join("exports");
        configure(&mut config);
        let repository = Arc::new(MemoryRepository::new());
        let owners = Arc::new(MemoryOwners::new());
        owners.insert_user(UserProfile {
            id: 1,
            username: "alice".to_string(),
            common_name: None,
            organizational_unit: None,
            certificate_id: None,
        });
        let exporter = Exporter::new(repository.clone(), owners.clone(), &config);
        Fixture {
            _dir: dir,
            repository,
            owners,
            exporter,
        }
    }

    fn store_root(repository: &MemoryRepository) -> Certificate {
        let root = test_root();
        let record = record(&root.certificate, Some(&root.private_key), CertificateType::Root, None);
        let id = repository.create_certificate(&record).unwrap();
        repository.read_certificate(id).unwrap().unwrap()
    }

    fn store_client(repository: &MemoryRepository, root: &Certificate, serial: u64) -> Certificate {
        let issuer = crate::signing::SigningIdentity::from_pem(
            &root.certificate_pem,
            root.private_key_pem.as_deref().unwrap(),
        )
        .unwrap();
        let issued = OpenSslBackend::new(TEST_KEY_SIZE)
            .issue(&request(CertificateProfile::Client, "alice", serial), Some(&issuer))
            .unwrap();
        let record = record(
            &issued.certificate,
            Some(&issued.private_key),
            CertificateType::Client,
            Some(Owner::User(1)),
        );
        let id = repository.create_certificate(&record).unwrap();
        repository.read_certificate(id).unwrap().unwrap()
    }

    fn record(
        cert: &X509,
        key: Option<&PKey<Private>>,
        certificate_type: CertificateType,
        owner: Option<Owner>,
    ) -> Certificate {
        Certificate {
            id: None,
            serial: cert.serial_number().to_bn().unwrap().to_hex_str().unwrap().to_string(),
            subject_dn: dn_string(cert.subject_name()),
            issuer_dn: dn_string(cert.issuer_name()),
            common_name: common_name(cert.subject_name()).unwrap(),
            certificate_type,
            certificate_pem: String::from_utf8(cert.to_pem().unwrap()).unwrap(),
            private_key_pem: key
                .map(|k| String::from_utf8(k.private_key_to_pem_pkcs8().unwrap()).unwrap()),
            valid_from: naive_local(0),
            valid_to: naive_local(0),
            generated: true,
            owner,
            file_name: None,
            export_path: None,
        }
    }

    #[test]
    fn test_owner_directories() {
        let f = fixture(|_| {});
        let root = store_root(&f.repository);
        let client = store_client(&f.repository, &root, 5);

        assert_eq!(f.exporter.owner_dir(&root).unwrap(), f.exporter.root());
        assert_eq!(
            f.exporter.planned_files(&root).unwrap().certificate,
            f.exporter.root().join("ca.crt")
        );
        let files = f.exporter.planned_files(&client).unwrap();
        assert_eq!(files.certificate, f.exporter.root().join("alice/alice.crt"));
        assert_eq!(files.private_key, Some(f.exporter.root().join("alice/alice.key")));
        assert!(files.pkcs12.is_none());

        let mut server = client.clone();
        server.owner = None;
        server.common_name = "../gw".to_string();
        assert_eq!(f.exporter.owner_dir(&server).unwrap(), f.exporter.root().join("_gw"));
    }

    #[test]
    fn test_export_is_reproducible_after_directory_deletion() {
        let f = fixture(|_| {});
        let root = store_root(&f.repository);
        let mut client = store_client(&f.repository, &root, 5);

        let files = f.exporter.export_certificate(&mut client).unwrap();
        let cert_bytes = fs::read(&files.certificate).unwrap();
        let key_bytes = fs::read(files.private_key.as_ref().unwrap()).unwrap();
        let stored = f.repository.read_certificate(client.id.unwrap()).unwrap().unwrap();
        assert_eq!(stored.file_name.as_deref(), Some("alice.crt"));

        fs::remove_dir_all(f.exporter.root().join("alice")).unwrap();
        let again = f.exporter.export_by_id(client.id.unwrap()).unwrap();
        assert_eq!(again, files);
        assert_eq!(fs::read(&files.certificate).unwrap(), cert_bytes);
        assert_eq!(fs::read(files.private_key.as_ref().unwrap()).unwrap(), key_bytes);
    }

    #[cfg(unix)]
    #[test]
    fn test_key_files_are_private() {
        use std::os::unix::fs::PermissionsExt;
        let f = fixture(|_| {});
        let root = store_root(&f.repository);
        let mut client = store_client(&f.repository, &root, 5);
        let files = f.exporter.export_certificate(&mut client).unwrap();
        let mode = fs::metadata(files.private_key.unwrap()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_der_format_and_ca_key_flag() {
        let f = fixture(|c| c.export.format = ExportFormat::Der);
        let mut root = store_root(&f.repository);
        let files = f.exporter.export_certificate(&mut root).unwrap();
        assert_eq!(files.certificate, f.exporter.root().join("ca.der"));
        assert!(files.private_key.is_none());
        assert!(X509::from_der(&fs::read(&files.certificate).unwrap()).is_ok());

        let f = fixture(|c| c.export.export_ca_key = true);
        let root = store_root(&f.repository);
        assert!(f.exporter.planned_files(&root).unwrap().private_key.is_some());
    }

    #[test]
    fn test_pkcs12_bundle_with_per_certificate_password() {
        let f = fixture(|c| {
            c.pkcs12.enabled = true;
            c.pkcs12.password_policy = PasswordPolicy::PerCertificate;
        });
        let root = store_root(&f.repository);
        let client = store_client(&f.repository, &root, 5);
        let chain = f.exporter.chain().unwrap();
        assert_eq!(chain.len(), 1);

        assert!(matches!(
            f.exporter.bundle(&client, &chain, None),
            Err(CaError::InvalidRequest(_))
        ));

        let password = SecretString::from("s3cret".to_string());
        let blob = f.exporter.rebuild_pkcs12(client.id.unwrap(), Some(&password)).unwrap();
        assert!(matches!(blob.password, StoredPassword::Sha256(_)));
        assert!(verify_stored_password(&blob.password, &password));
        assert!(!verify_stored_password(
            &blob.password,
            &SecretString::from("wrong".to_string())
        ));

        let (cert, key) = f.exporter.open_pkcs12(client.id.unwrap(), &password).unwrap();
        assert!(cert.public_key().unwrap().public_eq(&key));
        assert!(f
            .exporter
            .open_pkcs12(client.id.unwrap(), &SecretString::from("wrong".to_string()))
            .is_err());
        assert!(f.exporter.root().join("alice/alice.p12").exists());
    }

    #[test]
    fn test_export_all_isolates_failures() {
        let f = fixture(|_| {});
        let root = store_root(&f.repository);
        let client = store_client(&f.repository, &root, 5);
        f.owners.set_certificate_id(Owner::User(1), client.id).unwrap();
        let mut orphan = store_client(&f.repository, &root, 6);
        orphan.owner = Some(Owner::User(42));
        f.repository.update_certificate(&orphan).unwrap();

        let report = f.exporter.export_all().unwrap();
        assert_eq!(report.exported, 2);
        assert_eq!(report.failed(), 1);
        assert!(matches!(report.failures[0].1, CaError::NotFound { .. }));
        assert!(f.exporter.chain_path().exists());
    }

    #[test]
    fn test_export_all_leaves_superseded_certificate_out() {
        let f = fixture(|_| {});
        let root = store_root(&f.repository);
        let stale = store_client(&f.repository, &root, 5);
        let current = store_client(&f.repository, &root, 6);
        f.owners.set_certificate_id(Owner::User(1), current.id).unwrap();
        assert!(!f.exporter.is_current(&stale).unwrap());
        assert!(f.exporter.is_current(&current).unwrap());
        assert!(f.exporter.is_current(&root).unwrap());

        let report = f.exporter.export_all().unwrap();
        assert_eq!(report.exported, 2);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.failed(), 0);
        let written = fs::read_to_string(f.exporter.root().join("alice/alice.crt")).unwrap();
        assert_eq!(written, current.certificate_pem);
    }
}
