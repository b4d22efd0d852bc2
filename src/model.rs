//! Persisted records owned by the repository.
//!
//! Records carry data only. Everything that mutates them goes through the
//! [`CaEngine`](crate::engine::CaEngine), the [`RevocationLedger`](crate::ledger::RevocationLedger)
//! or the import/export adapters.

use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use openssl::asn1::{Asn1Time, Asn1TimeRef};
use openssl::pkey::{PKeyRef, Private};
use openssl::x509::X509Ref;
use std::fmt;
use std::path::PathBuf;

use crate::error::{CaError, CaResult};
use crate::subject::{common_name, dn_string};

/// Unix seconds to the naive local timestamps stored on records.
pub fn naive_local(unix: i64) -> NaiveDateTime {
    DateTime::from_timestamp(unix, 0)
        .map(|dt| dt.with_timezone(&Local).naive_local())
        .unwrap_or_default()
}

/// Inverse of [`naive_local`]. Ambiguous local times resolve to the earlier instant.
pub fn unix_from_naive_local(naive: &NaiveDateTime) -> i64 {
    Local
        .from_local_datetime(naive)
        .earliest()
        .map(|dt| dt.timestamp())
        .unwrap_or_else(|| naive.and_utc().timestamp())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CertificateId(pub i64);

impl fmt::Display for CertificateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CertificateType {
    Root,
    Intermediate,
    Server,
    Client,
    ClientPkcs12,
}

impl CertificateType {
    pub fn is_ca(self) -> bool {
        matches!(self, CertificateType::Root | CertificateType::Intermediate)
    }

    pub fn is_client(self) -> bool {
        matches!(self, CertificateType::Client | CertificateType::ClientPkcs12)
    }
}

/// The user or server a leaf certificate belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Owner {
    User(i64),
    Server(i64),
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Owner::User(id) => write!(f, "user:{}", id),
            Owner::Server(id) => write!(f, "server:{}", id),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Certificate {
    /// Assigned by the repository on create; `None` until then.
    pub id: Option<CertificateId>,
    /// Upper-case hex of the X.509 serial number.
    pub serial: String,
    pub subject_dn: String,
    pub issuer_dn: String,
    pub common_name: String,
    pub certificate_type: CertificateType,
    pub certificate_pem: String,
    /// PKCS#8 PEM. Absent for imports without key material.
    pub private_key_pem: Option<String>,
    pub valid_from: NaiveDateTime,
    pub valid_to: NaiveDateTime,
    /// True when issued by this CA, false when imported.
    pub generated: bool,
    pub owner: Option<Owner>,
    pub file_name: Option<String>,
    pub export_path: Option<PathBuf>,
}

impl Certificate {
    /// Unsaved record describing `certificate`. Serial, names and validity come from the
    /// certificate itself.
    pub fn from_x509(
        certificate: &X509Ref,
        private_key: Option<&PKeyRef<Private>>,
        certificate_type: CertificateType,
        generated: bool,
        owner: Option<Owner>,
    ) -> CaResult<Self> {
        let certificate_pem = String::from_utf8(certificate.to_pem()?)
            .map_err(|e| CaError::signing("Certificate PEM is not UTF-8", e))?;
        let private_key_pem = match private_key {
            Some(key) => Some(
                String::from_utf8(key.private_key_to_pem_pkcs8()?)
                    .map_err(|e| CaError::signing("Key PEM is not UTF-8", e))?,
            ),
            None => None,
        };
        let subject_dn = dn_string(certificate.subject_name());
        Ok(Self {
            id: None,
            serial: serial_hex(certificate)?,
            common_name: common_name(certificate.subject_name()).unwrap_or_else(|| subject_dn.clone()),
            subject_dn,
            issuer_dn: dn_string(certificate.issuer_name()),
            certificate_type,
            certificate_pem,
            private_key_pem,
            valid_from: naive_local(unix_from_asn1(certificate.not_before())?),
            valid_to: naive_local(unix_from_asn1(certificate.not_after())?),
            generated,
            owner,
            file_name: None,
            export_path: None,
        })
    }

    pub fn has_private_key(&self) -> bool {
        self.private_key_pem.is_some()
    }
}

/// Upper-case hex serial, as stored on records and in the ledger.
pub fn serial_hex(certificate: &X509Ref) -> CaResult<String> {
    Ok(certificate
        .serial_number()
        .to_bn()?
        .to_hex_str()?
        .to_string())
}

fn unix_from_asn1(time: &Asn1TimeRef) -> CaResult<i64> {
    let epoch = Asn1Time::from_unix(0)?;
    let diff = epoch.diff(time)?;
    Ok(i64::from(diff.days) * 86_400 + i64::from(diff.secs))
}

/// A user record as seen through the owner hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserProfile {
    pub id: i64,
    pub username: String,
    pub common_name: Option<String>,
    pub organizational_unit: Option<String>,
    pub certificate_id: Option<CertificateId>,
}

/// A VPN server record as seen through the owner hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerProfile {
    pub id: i64,
    pub name: String,
    pub common_name: Option<String>,
    pub organizational_unit: Option<String>,
    pub certificate_id: Option<CertificateId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CrlEntryId(pub i64);

impl fmt::Display for CrlEntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrlEntry {
    pub id: Option<CrlEntryId>,
    pub serial: String,
    pub revoked_at: NaiveDateTime,
    /// Owner name at revocation time, for display only.
    pub username: Option<String>,
    /// May point at a record that renewal has since deleted.
    pub certificate_id: Option<CertificateId>,
    pub crl_id: Option<i64>,
}

/// The single active CRL, re-rendered whenever the entry set changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrlRecord {
    pub id: Option<i64>,
    pub number: u64,
    pub issuer: String,
    pub created_at: NaiveDateTime,
    pub valid_from: NaiveDateTime,
    pub next_update: NaiveDateTime,
    pub content_pem: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredPassword {
    None,
    Plain(String),
    /// Hex-encoded SHA-256 of the password.
    Sha256(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pkcs12Blob {
    pub certificate_id: CertificateId,
    pub friendly_name: String,
    pub password: StoredPassword,
    pub content: Vec<u8>,
}
