//! Signing backend: key generation, X.509 issuance and CRL signing.
//!
//! The engine only talks to [`SigningBackend`]. [`OpenSslBackend`] is the production
//! implementation; it generates RSA keys with openssl, builds certificates through
//! [`builder::CertificateBuilder`] and renders CRLs through [`crl`].
//!
//! # Certificate profiles
//! ```text
//! Root CA (self-signed, CA=true, pathlen=1)
//!   └── Intermediate CA (signed by Root, CA=true, pathlen=0)
//!       └── Server / Client (CA=false, serverAuth / clientAuth)
//! ```
//! Leaf certificates are signed by the intermediate when one is active, else directly by the
//! root.

use openssl::pkey::{PKey, Private};
use openssl::x509::X509;

use crate::error::{CaError, CaResult};
use crate::subject::SubjectName;

pub mod builder;
pub mod crl;

use builder::CertificateBuilder;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateProfile {
    Root,
    Intermediate,
    Server,
    Client,
}

#[derive(Debug, Clone)]
pub struct IssueRequest {
    pub subject: SubjectName,
    pub serial: u64,
    /// Unix seconds.
    pub not_before: i64,
    /// Unix seconds.
    pub not_after: i64,
    pub profile: CertificateProfile,
}

/// A CA certificate together with the key that signs on its behalf.
pub struct SigningIdentity {
    pub certificate: X509,
    pub private_key: PKey<Private>,
}

impl SigningIdentity {
    pub fn new(certificate: X509, private_key: PKey<Private>) -> CaResult<Self> {
        let public_key = certificate.public_key()?;
        if !public_key.public_eq(&private_key) {
            return Err(CaError::Signing(
                "CA private key does not match its certificate".to_string(),
            ));
        }
        Ok(Self {
            certificate,
            private_key,
        })
    }

    pub fn from_pem(certificate_pem: &str, private_key_pem: &str) -> CaResult<Self> {
        let certificate = X509::from_pem(certificate_pem.as_bytes())
            .map_err(|e| CaError::signing("Failed to parse CA certificate", e))?;
        let private_key = PKey::private_key_from_pem(private_key_pem.as_bytes())
            .map_err(|e| CaError::signing("Failed to parse CA private key", e))?;
        Self::new(certificate, private_key)
    }
}

pub struct IssuedMaterial {
    pub certificate: X509,
    pub private_key: PKey<Private>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevokedSerial {
    /// Hex serial as stored in the ledger.
    pub serial: String,
    /// Unix seconds.
    pub revoked_at: i64,
}

#[derive(Debug, Clone)]
pub struct CrlRequest {
    pub number: u64,
    /// Unix seconds.
    pub this_update: i64,
    /// Unix seconds.
    pub next_update: i64,
    pub revoked: Vec<RevokedSerial>,
}

pub trait SigningBackend: Send + Sync {
    /// Generate a key pair and a certificate for it. `issuer` is `None` only for roots.
    fn issue(
        &self,
        request: &IssueRequest,
        issuer: Option<&SigningIdentity>,
    ) -> CaResult<IssuedMaterial>;

    /// Render and sign a CRL, returned as PEM.
    fn sign_crl(&self, request: &CrlRequest, issuer: &SigningIdentity) -> CaResult<String>;
}

pub struct OpenSslBackend {
    key_size: u32,
}

impl OpenSslBackend {
    pub fn new(key_size: u32) -> Self {
        Self { key_size }
    }
}

impl SigningBackend for OpenSslBackend {
    fn issue(
        &self,
        request: &IssueRequest,
        issuer: Option<&SigningIdentity>,
    ) -> CaResult<IssuedMaterial> {
        match (request.profile, issuer) {
            (CertificateProfile::Root, Some(_)) => {
                return Err(CaError::InvalidRequest(
                    "a root certificate is self-signed and takes no issuer".to_string(),
                ))
            }
            (CertificateProfile::Root, None) => {}
            (_, None) => {
                return Err(CaError::InvalidRequest(format!(
                    "{:?} certificate requires an issuer",
                    request.profile
                )))
            }
            _ => {}
        }
        if request.not_after <= request.not_before {
            return Err(CaError::InvalidRequest(
                "validity window ends before it starts".to_string(),
            ));
        }

        let rsa = openssl::rsa::Rsa::generate(self.key_size)
            .map_err(|e| CaError::signing("Failed to generate RSA keypair", e))?;
        let private_key =
            PKey::from_rsa(rsa).map_err(|e| CaError::signing("Failed to create private key", e))?;

        let certificate = CertificateBuilder::new(request.profile)
            .subject(&request.subject)
            .serial(request.serial)
            .validity(request.not_before, request.not_after)
            .issuer(issuer)
            .build(&private_key)?;

        Ok(IssuedMaterial {
            certificate,
            private_key,
        })
    }

    fn sign_crl(&self, request: &CrlRequest, issuer: &SigningIdentity) -> CaResult<String> {
        crl::sign_crl(request, issuer)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::configs::SubjectDefaults;

    pub(crate) const TEST_KEY_SIZE: u32 = 2048;

    pub(crate) fn request(profile: CertificateProfile, cn: &str, serial: u64) -> IssueRequest {
        let now = chrono::Utc::now().timestamp();
        let mut subject = SubjectName::root(&SubjectDefaults::default());
        subject.common_name = cn.to_string();
        IssueRequest {
            subject,
            serial,
            not_before: now,
            not_after: now + 30 * 86_400,
            profile,
        }
    }

    pub(crate) fn test_root() -> SigningIdentity {
        let backend = OpenSslBackend::new(TEST_KEY_SIZE);
        let root = backend
            .issue(&request(CertificateProfile::Root, "Test Root", 1), None)
            .unwrap();
        SigningIdentity::new(root.certificate, root.private_key).unwrap()
    }

    #[test]
    fn test_root_is_self_signed() {
        let root = test_root();
        let public_key = root.certificate.public_key().unwrap();
        assert!(root.certificate.verify(&public_key).unwrap());
        assert_eq!(
            crate::subject::dn_string(root.certificate.subject_name()),
            crate::subject::dn_string(root.certificate.issuer_name())
        );
    }

    #[test]
    fn test_leaf_signed_by_issuer() {
        let root = test_root();
        let backend = OpenSslBackend::new(TEST_KEY_SIZE);
        let leaf = backend
            .issue(&request(CertificateProfile::Client, "alice", 2), Some(&root))
            .unwrap();
        let root_key = root.certificate.public_key().unwrap();
        assert!(leaf.certificate.verify(&root_key).unwrap());
        assert!(leaf
            .certificate
            .public_key()
            .unwrap()
            .public_eq(&leaf.private_key));
        assert_eq!(
            leaf.certificate
                .serial_number()
                .to_bn()
                .unwrap()
                .to_hex_str()
                .unwrap()
                .to_string(),
            "02"
        );
    }

    #[test]
    fn test_issuer_rules() {
        let backend = OpenSslBackend::new(TEST_KEY_SIZE);
        assert!(matches!(
            backend.issue(&request(CertificateProfile::Server, "vpn", 3), None),
            Err(CaError::InvalidRequest(_))
        ));

        let mut inverted = request(CertificateProfile::Root, "root", 4);
        inverted.not_after = inverted.not_before - 1;
        assert!(matches!(
            backend.issue(&inverted, None),
            Err(CaError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_signing_identity_rejects_mismatched_key() {
        let a = test_root();
        let b = test_root();
        assert!(SigningIdentity::new(a.certificate, b.private_key).is_err());
    }
}
