//! Registration of externally issued certificates.
//!
//! Imported certificates are stored with `generated = false` and keep the serial, names and
//! validity of the parsed certificate. A file that cannot be parsed, a key that does not belong
//! to its certificate, or a serial that is already stored fails that one item; the batch goes on
//! and the failure is reported.
//!
//! Leaves with a serverAuth-only extended key usage are typed `Server`, every other leaf
//! `Client`. CA certificates are refused: the signing chain is issued here, never imported.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use openssl::pkey::{PKey, Private};
use openssl::x509::X509;
use tracing::{debug, info, warn};
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::error::{CaError, CaResult};
use crate::model::{Certificate, CertificateId, CertificateType, Owner};
use crate::storage::{OwnerDirectory, Repository, StoreError};
use crate::subject::SubjectName;

const CERTIFICATE_EXTENSIONS: [&str; 4] = ["crt", "pem", "cer", "der"];
const KEY_EXTENSION: &str = "key";

#[derive(Debug, Default)]
pub struct ImportReport {
    pub imported: Vec<CertificateId>,
    pub failures: Vec<(PathBuf, CaError)>,
}

impl ImportReport {
    pub fn imported_count(&self) -> usize {
        self.imported.len()
    }

    pub fn failed_count(&self) -> usize {
        self.failures.len()
    }

    fn record(&mut self, source: PathBuf, result: CaResult<Certificate>) {
        match result.and_then(|cert| {
            cert.id
                .ok_or_else(|| CaError::import_parse(&source, "record was not stored"))
        }) {
            Ok(id) => self.imported.push(id),
            Err(e) => {
                warn!(path = %source.display(), error = %e, "import skipped");
                self.failures.push((source, e));
            }
        }
    }
}

/// Persistence path shared by both importers.
struct Registrar {
    repository: Arc<dyn Repository>,
    owners: Arc<dyn OwnerDirectory>,
    link_owners: bool,
}

impl Registrar {
    fn register(
        &self,
        source: &Path,
        certificate: &X509,
        private_key: Option<&PKey<Private>>,
    ) -> CaResult<Certificate> {
        if let Some(key) = private_key {
            let public_key = certificate
                .public_key()
                .map_err(|e| CaError::import_parse(source, e))?;
            if !public_key.public_eq(key) {
                return Err(CaError::import_parse(
                    source,
                    "private key does not match certificate",
                ));
            }
        }

        let certificate_type = classify(source, certificate)?;
        let mut record = Certificate::from_x509(
            certificate,
            private_key.map(|k| &**k),
            certificate_type,
            false,
            None,
        )
        .map_err(|e| CaError::import_parse(source, e))?;

        let owner = if self.link_owners && certificate_type.is_client() {
            self.linkable_owner(&record.common_name)?
        } else {
            None
        };
        record.owner = owner;

        let id = match self.repository.create_certificate(&record) {
            Ok(id) => id,
            Err(StoreError::Conflict(_)) => return Err(CaError::DuplicateSerial(record.serial)),
            Err(e) => return Err(e.into()),
        };
        record.id = Some(id);

        if let Some(owner) = owner {
            if let Err(e) = self.owners.set_certificate_id(owner, Some(id)) {
                if let Err(delete_err) = self.repository.delete_certificate(id) {
                    warn!(id = %id, error = %delete_err, "failed to delete unlinked import");
                }
                return Err(e.into());
            }
            debug!(id = %id, owner = %owner, "import linked to owner");
        }
        Ok(record)
    }

    /// The user named like the certificate's CN, if that user holds no usable certificate.
    fn linkable_owner(&self, common_name: &str) -> CaResult<Option<Owner>> {
        let Some(user) = self.owners.find_user_by_username(common_name)? else {
            return Ok(None);
        };
        let free = match user.certificate_id {
            None => true,
            Some(current) => match self.repository.read_certificate(current)? {
                None => true,
                Some(cert) => !self.repository.find_crl_entries(&cert.serial)?.is_empty(),
            },
        };
        Ok(free.then_some(Owner::User(user.id)))
    }
}

/// Imports certificate files, each optionally paired with `<stem>.key`.
pub struct FileImporter {
    registrar: Registrar,
}

impl FileImporter {
    pub fn new(repository: Arc<dyn Repository>, owners: Arc<dyn OwnerDirectory>) -> Self {
        Self {
            registrar: Registrar {
                repository,
                owners,
                link_owners: false,
            },
        }
    }

    /// Link each import to the user whose username equals its CN.
    pub fn link_owners(mut self, link: bool) -> Self {
        self.registrar.link_owners = link;
        self
    }

    /// Import every certificate file directly inside `dir`.
    ///
    /// Files with a certificate extension (`crt`, `pem`, `cer`, `der`) are candidates; key files
    /// are consumed with their certificate and anything else is ignored.
    pub fn import_dir(&self, dir: &Path) -> CaResult<ImportReport> {
        let mut report = ImportReport::default();
        for path in candidate_files(dir)? {
            let result = self.import_file(&path);
            report.record(path, result);
        }
        info!(
            dir = %dir.display(),
            imported = report.imported_count(),
            failed = report.failed_count(),
            "file import finished"
        );
        Ok(report)
    }

    pub fn import_file(&self, path: &Path) -> CaResult<Certificate> {
        let bytes = fs::read(path).map_err(|e| CaError::import_parse(path, e))?;
        let certificate = parse_certificate(path, &bytes)?;

        let key_path = path.with_extension(KEY_EXTENSION);
        let private_key = if key_path.is_file() {
            let key_bytes = fs::read(&key_path).map_err(|e| CaError::import_parse(&key_path, e))?;
            Some(
                PKey::private_key_from_pem(&key_bytes)
                    .or_else(|_| PKey::private_key_from_der(&key_bytes))
                    .map_err(|e| CaError::import_parse(&key_path, e))?,
            )
        } else {
            None
        };

        self.registrar
            .register(path, &certificate, private_key.as_ref())
    }
}

/// Imports certificates taken from directory attributes. These never carry a private key.
pub struct LdapImporter {
    registrar: Registrar,
}

impl LdapImporter {
    pub fn new(repository: Arc<dyn Repository>, owners: Arc<dyn OwnerDirectory>) -> Self {
        Self {
            registrar: Registrar {
                repository,
                owners,
                link_owners: false,
            },
        }
    }

    pub fn link_owners(mut self, link: bool) -> Self {
        self.registrar.link_owners = link;
        self
    }

    /// Import one attribute value: DER, PEM or base64 text. `source` names the value in errors,
    /// typically the entry's DN.
    pub fn import_value(&self, source: &str, value: &[u8]) -> CaResult<Certificate> {
        let source = PathBuf::from(source);
        let certificate = parse_certificate(&source, value)?;
        self.registrar.register(&source, &certificate, None)
    }

    /// Import a directory of exported attribute values, one file per CN.
    ///
    /// A file whose stem differs from its certificate's CN fails that item.
    pub fn import_dir(&self, dir: &Path) -> CaResult<ImportReport> {
        let mut report = ImportReport::default();
        for path in candidate_files(dir)? {
            let result = fs::read(&path)
                .map_err(|e| CaError::import_parse(&path, e))
                .and_then(|bytes| parse_certificate(&path, &bytes))
                .and_then(|cert| {
                    check_keyed_by_cn(&path, &cert)?;
                    self.registrar.register(&path, &cert, None)
                });
            report.record(path, result);
        }
        info!(
            dir = %dir.display(),
            imported = report.imported_count(),
            failed = report.failed_count(),
            "LDAP import finished"
        );
        Ok(report)
    }
}

fn candidate_files(dir: &Path) -> CaResult<Vec<PathBuf>> {
    let entries = fs::read_dir(dir).map_err(|e| CaError::import_parse(dir, e))?;
    let mut files = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| CaError::import_parse(dir, e))?.path();
        if !path.is_file() {
            continue;
        }
        let is_candidate = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| {
                CERTIFICATE_EXTENSIONS
                    .iter()
                    .any(|known| known.eq_ignore_ascii_case(ext))
            });
        if is_candidate {
            files.push(path);
        } else {
            debug!(path = %path.display(), "not a certificate file, ignored");
        }
    }
    files.sort();
    Ok(files)
}

fn check_keyed_by_cn(path: &Path, certificate: &X509) -> CaResult<()> {
    let common_name = SubjectName::from_x509_name(certificate.subject_name()).common_name;
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy())
        .unwrap_or_default();
    if stem != common_name.as_str() {
        return Err(CaError::import_parse(
            path,
            format!("file name does not match CN {:?}", common_name),
        ));
    }
    Ok(())
}

/// Certificate type from BasicConstraints and extended key usage.
fn classify(source: &Path, certificate: &X509) -> CaResult<CertificateType> {
    let der = certificate
        .to_der()
        .map_err(|e| CaError::import_parse(source, e))?;
    let (_, parsed) =
        X509Certificate::from_der(&der).map_err(|e| CaError::import_parse(source, e))?;

    let is_ca = parsed
        .basic_constraints()
        .map_err(|e| CaError::import_parse(source, e))?
        .is_some_and(|bc| bc.value.ca);
    if is_ca {
        return Err(CaError::import_parse(
            source,
            "CA certificates cannot be imported",
        ));
    }

    let server_only = parsed
        .extended_key_usage()
        .map_err(|e| CaError::import_parse(source, e))?
        .is_some_and(|eku| eku.value.server_auth && !eku.value.client_auth);
    Ok(if server_only {
        CertificateType::Server
    } else {
        CertificateType::Client
    })
}

/// PEM, DER, or base64 text of DER.
fn parse_certificate(source: &Path, bytes: &[u8]) -> CaResult<X509> {
    if let Ok(cert) = X509::from_pem(bytes) {
        return Ok(cert);
    }
    if let Ok(cert) = X509::from_der(bytes) {
        return Ok(cert);
    }
    let text: Vec<u8> = bytes
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    let der = STANDARD
        .decode(&text)
        .map_err(|_| CaError::import_parse(source, "not a PEM, DER or base64 certificate"))?;
    X509::from_der(&der).map_err(|e| CaError::import_parse(source, e))
}
