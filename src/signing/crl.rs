//! CRL rendering.
//!
//! The openssl bindings cannot build CRLs, so the CA certificate and key are handed to rcgen:
//! the key travels as PKCS#8 PEM and the CA certificate is reconstructed from its own PEM, which
//! keeps the issuer name and key identifier of the certificate actually in use.

use openssl::bn::BigNum;
use rcgen::{
    CertificateParams, CertificateRevocationListParams, KeyIdMethod, KeyPair, RevokedCertParams,
    SerialNumber,
};
use time::OffsetDateTime;

use super::{CrlRequest, SigningIdentity};
use crate::error::{CaError, CaResult};

pub(crate) fn sign_crl(request: &CrlRequest, issuer: &SigningIdentity) -> CaResult<String> {
    let key_pem = issuer
        .private_key
        .private_key_to_pem_pkcs8()
        .map_err(|e| CaError::signing("Failed to export CA key", e))?;
    let key_pem = String::from_utf8(key_pem)
        .map_err(|e| CaError::signing("CA key PEM is not UTF-8", e))?;
    let key_pair = KeyPair::from_pem(&key_pem)
        .map_err(|e| CaError::signing("Failed to load CA key for CRL signing", e))?;

    let ca_pem = issuer
        .certificate
        .to_pem()
        .map_err(|e| CaError::signing("Failed to export CA certificate", e))?;
    let ca_pem = String::from_utf8(ca_pem)
        .map_err(|e| CaError::signing("CA certificate PEM is not UTF-8", e))?;
    let ca_params = CertificateParams::from_ca_cert_pem(&ca_pem)
        .map_err(|e| CaError::signing("Failed to parse CA certificate", e))?;
    let ca_certificate = ca_params
        .self_signed(&key_pair)
        .map_err(|e| CaError::signing("Failed to recreate CA certificate for CRL signing", e))?;

    let revoked_certs = request
        .revoked
        .iter()
        .map(|entry| -> CaResult<RevokedCertParams> {
            Ok(RevokedCertParams {
                serial_number: serial_number_from_hex(&entry.serial)?,
                revocation_time: timestamp(entry.revoked_at)?,
                reason_code: None,
                invalidity_date: None,
            })
        })
        .collect::<CaResult<Vec<_>>>()?;

    let crl_number = BigNum::from_dec_str(&request.number.to_string())?.to_vec();
    let crl_params = CertificateRevocationListParams {
        this_update: timestamp(request.this_update)?,
        next_update: timestamp(request.next_update)?,
        crl_number: SerialNumber::from_slice(&crl_number),
        issuing_distribution_point: None,
        revoked_certs,
        key_identifier_method: KeyIdMethod::Sha256,
    };

    let crl = crl_params
        .signed_by(&ca_certificate, &key_pair)
        .map_err(|e| CaError::signing("Failed to sign CRL", e))?;

    Ok(crl.pem()?)
}

fn serial_number_from_hex(serial: &str) -> CaResult<SerialNumber> {
    let bytes = BigNum::from_hex_str(serial)
        .map_err(|e| CaError::RevocationInconsistency(format!("ledger serial {}: {}", serial, e)))?
        .to_vec();
    if bytes.is_empty() {
        return Err(CaError::RevocationInconsistency(format!(
            "ledger serial {} is zero",
            serial
        )));
    }
    Ok(SerialNumber::from_slice(&bytes))
}

fn timestamp(unix: i64) -> CaResult<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(unix)
        .map_err(|e| CaError::signing("Timestamp out of range", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signing::tests::test_root;
    use crate::signing::RevokedSerial;
    use openssl::x509::X509Crl;

    #[test]
    fn test_crl_lists_serials_and_verifies() {
        let root = test_root();
        let now = chrono::Utc::now().timestamp();
        let request = CrlRequest {
            number: 7,
            this_update: now,
            next_update: now + 86_400,
            revoked: vec![
                RevokedSerial {
                    serial: "0A".to_string(),
                    revoked_at: now,
                },
                RevokedSerial {
                    serial: "1F".to_string(),
                    revoked_at: now,
                },
            ],
        };
        let pem = sign_crl(&request, &root).unwrap();

        let crl = X509Crl::from_pem(pem.as_bytes()).unwrap();
        let root_key = root.certificate.public_key().unwrap();
        assert!(crl.verify(&root_key).unwrap());

        let mut serials: Vec<String> = crl
            .get_revoked()
            .unwrap()
            .iter()
            .map(|r| r.serial_number().to_bn().unwrap().to_hex_str().unwrap().to_string())
            .collect();
        serials.sort();
        assert_eq!(serials, vec!["0A".to_string(), "1F".to_string()]);
    }

    #[test]
    fn test_empty_crl() {
        let root = test_root();
        let now = chrono::Utc::now().timestamp();
        let pem = sign_crl(
            &CrlRequest {
                number: 1,
                this_update: now,
                next_update: now + 86_400,
                revoked: Vec::new(),
            },
            &root,
        )
        .unwrap();
        let crl = X509Crl::from_pem(pem.as_bytes()).unwrap();
        assert!(crl.get_revoked().map_or(true, |r| r.is_empty()));
    }

    #[test]
    fn test_invalid_ledger_serial() {
        let root = test_root();
        let result = sign_crl(
            &CrlRequest {
                number: 1,
                this_update: 0,
                next_update: 86_400,
                revoked: vec![RevokedSerial {
                    serial: "not-hex".to_string(),
                    revoked_at: 0,
                }],
            },
            &root,
        );
        assert!(matches!(result, Err(CaError::RevocationInconsistency(_))));
    }
}
