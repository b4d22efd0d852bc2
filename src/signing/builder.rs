//! X.509v3 certificate builder for every profile this CA issues.
//!
//! # Certificate Properties
//! - **Version**: X.509v3
//! - **Signature Algorithm**: SHA-256 with RSA
//! - **Serial Number**: allocated by the engine, never random
//! - **Root**: CA=true, pathlen=1, keyCertSign + cRLSign + digitalSignature
//! - **Intermediate**: CA=true, pathlen=0, same key usage as the root
//! - **Server**: CA=false, digitalSignature + keyEncipherment, extendedKeyUsage serverAuth
//! - **Client**: CA=false, digitalSignature + keyAgreement, extendedKeyUsage clientAuth

use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::x509::extension::{
    AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage, KeyUsage, SubjectKeyIdentifier,
};
use openssl::x509::X509;

use super::{CertificateProfile, SigningIdentity};
use crate::error::{CaError, CaResult};
use crate::subject::SubjectName;

const X509_VERSION_3: i32 = 2; // X509 version 3 is represented by 2
const ROOT_CA_PATH_LENGTH: u32 = 1;
const INTERMEDIATE_CA_PATH_LENGTH: u32 = 0; // Can only sign end-entity certs, not other CAs

/// Builder for a single certificate over an already generated key.
///
/// Without an issuer the certificate is self-signed with `subject_key`; otherwise the issuer's
/// subject becomes the issuer name and the issuer's key signs.
pub struct CertificateBuilder<'a> {
    profile: CertificateProfile,
    subject: Option<&'a SubjectName>,
    serial: u64,
    not_before: i64,
    not_after: i64,
    issuer: Option<&'a SigningIdentity>,
}

impl<'a> CertificateBuilder<'a> {
    pub fn new(profile: CertificateProfile) -> Self {
        Self {
            profile,
            subject: None,
            serial: 0,
            not_before: 0,
            not_after: 0,
            issuer: None,
        }
    }

    pub fn subject(mut self, subject: &'a SubjectName) -> Self {
        self.subject = Some(subject);
        self
    }

    pub fn serial(mut self, serial: u64) -> Self {
        self.serial = serial;
        self
    }

    /// Validity window in unix seconds.
    pub fn validity(mut self, not_before: i64, not_after: i64) -> Self {
        self.not_before = not_before;
        self.not_after = not_after;
        self
    }

    pub fn issuer(mut self, issuer: Option<&'a SigningIdentity>) -> Self {
        self.issuer = issuer;
        self
    }

    /// Build and sign the certificate for `subject_key`.
    ///
    /// # Errors
    /// Returns [`CaError::InvalidRequest`] when the subject or serial is missing and
    /// [`CaError::Signing`] when openssl rejects any field, extension or the signature.
    pub fn build(self, subject_key: &PKey<Private>) -> CaResult<X509> {
        let subject = self
            .subject
            .ok_or_else(|| CaError::InvalidRequest("certificate subject not set".to_string()))?;
        if self.serial == 0 {
            return Err(CaError::InvalidRequest(
                "certificate serial not set".to_string(),
            ));
        }

        let mut builder =
            X509::builder().map_err(|e| CaError::signing("Failed to create X509 builder", e))?;

        builder
            .set_version(X509_VERSION_3)
            .map_err(|e| CaError::signing("Failed to set version", e))?;

        let serial = BigNum::from_dec_str(&self.serial.to_string())?;
        let asn1_serial = serial.to_asn1_integer()?;
        builder
            .set_serial_number(&asn1_serial)
            .map_err(|e| CaError::signing("Failed to set serial number", e))?;

        let subject_name = subject.to_x509_name()?;
        builder
            .set_subject_name(&subject_name)
            .map_err(|e| CaError::signing("Failed to set subject", e))?;

        match self.issuer {
            Some(issuer) => builder
                .set_issuer_name(issuer.certificate.subject_name())
                .map_err(|e| CaError::signing("Failed to set issuer from signing CA", e))?,
            None => builder
                .set_issuer_name(&subject_name)
                .map_err(|e| CaError::signing("Failed to set issuer", e))?,
        }

        let not_before = Asn1Time::from_unix(self.not_before)
            .map_err(|e| CaError::signing("Failed to create not_before", e))?;
        builder
            .set_not_before(&not_before)
            .map_err(|e| CaError::signing("Failed to set not_before", e))?;

        let not_after = Asn1Time::from_unix(self.not_after)
            .map_err(|e| CaError::signing("Failed to create not_after", e))?;
        builder
            .set_not_after(&not_after)
            .map_err(|e| CaError::signing("Failed to set not_after", e))?;

        builder
            .set_pubkey(subject_key)
            .map_err(|e| CaError::signing("Failed to set public key", e))?;

        let mut bc = BasicConstraints::new();
        bc.critical();
        match self.profile {
            CertificateProfile::Root => {
                bc.ca().pathlen(ROOT_CA_PATH_LENGTH);
            }
            CertificateProfile::Intermediate => {
                bc.ca().pathlen(INTERMEDIATE_CA_PATH_LENGTH);
            }
            CertificateProfile::Server | CertificateProfile::Client => {}
        }
        let extension = bc
            .build()
            .map_err(|e| CaError::signing("Failed to build BasicConstraints", e))?;
        builder
            .append_extension(extension)
            .map_err(|e| CaError::signing("Failed to add BasicConstraints", e))?;

        let mut ku = KeyUsage::new();
        ku.critical();
        match self.profile {
            CertificateProfile::Root | CertificateProfile::Intermediate => {
                ku.key_cert_sign().crl_sign().digital_signature();
            }
            CertificateProfile::Server => {
                ku.digital_signature().key_encipherment();
            }
            CertificateProfile::Client => {
                ku.digital_signature().key_agreement();
            }
        }
        let ku_extension = ku
            .build()
            .map_err(|e| CaError::signing("Failed to build KeyUsage", e))?;
        builder
            .append_extension(ku_extension)
            .map_err(|e| CaError::signing("Failed to add KeyUsage", e))?;

        let eku = match self.profile {
            CertificateProfile::Server => Some(ExtendedKeyUsage::new().server_auth().build()),
            CertificateProfile::Client => Some(ExtendedKeyUsage::new().client_auth().build()),
            _ => None,
        };
        if let Some(eku) = eku {
            let eku = eku.map_err(|e| CaError::signing("Failed to build ExtendedKeyUsage", e))?;
            builder
                .append_extension(eku)
                .map_err(|e| CaError::signing("Failed to add ExtendedKeyUsage", e))?;
        }

        let ski = SubjectKeyIdentifier::new()
            .build(&builder.x509v3_context(None, None))
            .map_err(|e| CaError::signing("Failed to build SubjectKeyIdentifier", e))?;
        builder
            .append_extension(ski)
            .map_err(|e| CaError::signing("Failed to add SubjectKeyIdentifier", e))?;

        if let Some(issuer) = self.issuer {
            let aki = AuthorityKeyIdentifier::new()
                .keyid(false)
                .build(&builder.x509v3_context(Some(&issuer.certificate), None))
                .map_err(|e| CaError::signing("Failed to build AuthorityKeyIdentifier", e))?;
            builder
                .append_extension(aki)
                .map_err(|e| CaError::signing("Failed to add AuthorityKeyIdentifier", e))?;
        }

        let signing_key = self.issuer.map(|i| &i.private_key).unwrap_or(subject_key);
        builder
            .sign(signing_key, MessageDigest::sha256())
            .map_err(|e| CaError::signing("Failed to sign certificate", e))?;

        Ok(builder.build())
    }
}
