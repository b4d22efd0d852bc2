//! Revocation ledger: the set of revoked serials and the CRL derived from it.
//!
//! Every change to the entry set re-renders the whole CRL: the number is bumped, the dates are
//! stamped, the document is signed and written to `<export root>/<crl file name>`, and only then
//! is the change persisted. A failure at any step leaves the previous CRL file, record and entry
//! set in place.
//!
//! All mutations run under a single ledger lock, so CRL numbers are strictly increasing and a
//! serial can never be entered twice.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{CaError, CaResult};
use crate::export::write_file_atomic;
use crate::model::{naive_local, unix_from_naive_local, Certificate, CrlEntry, CrlRecord};
use crate::signing::{CrlRequest, RevokedSerial, SigningBackend, SigningIdentity};
use crate::storage::Repository;
use crate::subject::dn_string;

const SECONDS_PER_DAY: i64 = 86_400;

pub struct RevocationLedger {
    repository: Arc<dyn Repository>,
    backend: Arc<dyn SigningBackend>,
    crl_path: PathBuf,
    crl_validity_days: u32,
    lock: Mutex<()>,
}

/// A signed CRL that has been written to disk but not yet persisted.
struct Published {
    record: CrlRecord,
    previous_file: Option<Vec<u8>>,
    previous_record: Option<CrlRecord>,
}

impl RevocationLedger {
    pub fn new(
        repository: Arc<dyn Repository>,
        backend: Arc<dyn SigningBackend>,
        crl_path: PathBuf,
        crl_validity_days: u32,
    ) -> Self {
        Self {
            repository,
            backend,
            crl_path,
            crl_validity_days,
            lock: Mutex::new(()),
        }
    }

    pub fn crl_path(&self) -> &Path {
        &self.crl_path
    }

    pub fn contains(&self, serial: &str) -> CaResult<bool> {
        Ok(!self.repository.find_crl_entries(serial)?.is_empty())
    }

    pub fn entries(&self) -> CaResult<Vec<CrlEntry>> {
        Ok(self.repository.crl_entries()?)
    }

    pub fn current(&self) -> CaResult<Option<CrlRecord>> {
        Ok(self.repository.active_crl()?)
    }

    /// Enter `certificate`'s serial. Returns `false` when it was already revoked.
    pub(crate) fn revoke(
        &self,
        certificate: &Certificate,
        username: Option<String>,
        issuer: &SigningIdentity,
    ) -> CaResult<bool> {
        let _guard = self.lock.lock();

        let existing = self.single_entry(&certificate.serial)?;
        if let Some(entry) = existing {
            let other = entry
                .certificate_id
                .filter(|other| Some(*other) != certificate.id);
            if let Some(other) = other {
                if self.repository.read_certificate(other)?.is_some() {
                    return Err(CaError::RevocationInconsistency(format!(
                        "serial {} is revoked for certificate {} but presented as {:?}",
                        certificate.serial, other, certificate.id
                    )));
                }
            }
            debug!(serial = %certificate.serial, "serial already revoked");
            return Ok(false);
        }

        let mut entry = CrlEntry {
            id: None,
            serial: certificate.serial.clone(),
            revoked_at: naive_local(Utc::now().timestamp()),
            username,
            certificate_id: certificate.id,
            crl_id: None,
        };
        let mut entries = self.repository.crl_entries()?;
        entries.push(entry.clone());

        let published = self.publish(&entries, issuer)?;
        let crl_id = match self.repository.save_crl(&published.record) {
            Ok(id) => id,
            Err(e) => {
                self.restore(&published, false);
                return Err(e.into());
            }
        };
        entry.crl_id = Some(crl_id);
        if let Err(e) = self.repository.create_crl_entry(&entry) {
            self.restore(&published, true);
            return Err(e.into());
        }

        info!(
            serial = %certificate.serial,
            crl_number = published.record.number,
            "certificate revoked"
        );
        Ok(true)
    }

    /// Remove `serial` from the ledger. Returns `false` when it was not revoked.
    pub(crate) fn clear(&self, serial: &str, issuer: &SigningIdentity) -> CaResult<bool> {
        let _guard = self.lock.lock();

        let Some(entry) = self.single_entry(serial)? else {
            debug!(serial = %serial, "serial not revoked, nothing to clear");
            return Ok(false);
        };
        let entry_id = entry.id.ok_or_else(|| {
            CaError::RevocationInconsistency(format!("ledger entry for {} has no id", serial))
        })?;
        let remaining: Vec<CrlEntry> = self
            .repository
            .crl_entries()?
            .into_iter()
            .filter(|e| e.id != Some(entry_id))
            .collect();

        let published = self.publish(&remaining, issuer)?;
        if let Err(e) = self.repository.save_crl(&published.record) {
            self.restore(&published, false);
            return Err(e.into());
        }
        match self.repository.delete_crl_entry(entry_id) {
            Ok(true) => {}
            Ok(false) => {
                self.restore(&published, true);
                return Err(CaError::RevocationInconsistency(format!(
                    "ledger entry {} for {} vanished while clearing",
                    entry_id, serial
                )));
            }
            Err(e) => {
                self.restore(&published, true);
                return Err(e.into());
            }
        }

        info!(
            serial = %serial,
            crl_number = published.record.number,
            "revocation cleared"
        );
        Ok(true)
    }

    /// Re-sign the CRL over the unchanged entry set, e.g. to publish the first, empty CRL or to
    /// refresh `next_update`.
    pub fn regenerate(&self, issuer: &SigningIdentity) -> CaResult<CrlRecord> {
        let _guard = self.lock.lock();
        let entries = self.repository.crl_entries()?;
        let published = self.publish(&entries, issuer)?;
        if let Err(e) = self.repository.save_crl(&published.record) {
            self.restore(&published, false);
            return Err(e.into());
        }
        info!(crl_number = published.record.number, "CRL regenerated");
        Ok(published.record)
    }

    /// Rewrite the CRL file from the active record, without re-signing.
    pub fn export_current(&self) -> CaResult<bool> {
        match self.repository.active_crl()? {
            Some(record) => {
                write_file_atomic(&self.crl_path, record.content_pem.as_bytes(), false)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn single_entry(&self, serial: &str) -> CaResult<Option<CrlEntry>> {
        let mut entries = self.repository.find_crl_entries(serial)?;
        if entries.len() > 1 {
            return Err(CaError::RevocationInconsistency(format!(
                "serial {} has {} ledger entries",
                serial,
                entries.len()
            )));
        }
        Ok(entries.pop())
    }

    fn publish(&self, entries: &[CrlEntry], issuer: &SigningIdentity) -> CaResult<Published> {
        let mut serials: Vec<&str> = entries.iter().map(|e| e.serial.as_str()).collect();
        serials.sort_unstable();
        if serials.windows(2).any(|pair| pair[0] == pair[1]) {
            return Err(CaError::RevocationInconsistency(
                "ledger holds duplicate serials".to_string(),
            ));
        }

        let previous_record = self.repository.active_crl()?;
        let number = self.repository.max_crl_number()? + 1;
        let now = Utc::now().timestamp();
        let next_update = now + i64::from(self.crl_validity_days) * SECONDS_PER_DAY;

        let request = CrlRequest {
            number,
            this_update: now,
            next_update,
            revoked: entries
                .iter()
                .map(|e| RevokedSerial {
                    serial: e.serial.clone(),
                    revoked_at: unix_from_naive_local(&e.revoked_at),
                })
                .collect(),
        };
        let content_pem = self.backend.sign_crl(&request, issuer)?;

        let previous_file = match fs::read(&self.crl_path) {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => return Err(CaError::export_io(&self.crl_path, e)),
        };
        write_file_atomic(&self.crl_path, content_pem.as_bytes(), false)?;

        Ok(Published {
            record: CrlRecord {
                id: previous_record.as_ref().and_then(|r| r.id),
                number,
                issuer: dn_string(issuer.certificate.subject_name()),
                created_at: naive_local(now),
                valid_from: naive_local(now),
                next_update: naive_local(next_update),
                content_pem,
            },
            previous_file,
            previous_record,
        })
    }

    /// Best-effort undo of a publish whose persistence step failed.
    fn restore(&self, published: &Published, record_saved: bool) {
        if record_saved {
            if let Some(previous) = &published.previous_record {
                if let Err(e) = self.repository.save_crl(previous) {
                    warn!(error = %e, "failed to restore previous CRL record");
                }
            } else {
                warn!("no previous CRL record to restore");
            }
        }
        let restored = match &published.previous_file {
            Some(bytes) => write_file_atomic(&self.crl_path, bytes, false),
            None => fs::remove_file(&self.crl_path).map_err(|e| CaError::export_io(&self.crl_path, e)),
        };
        if let Err(e) = restored {
            warn!(error = %e, path = %self.crl_path.display(), "failed to restore previous CRL file");
        }
    }
}
