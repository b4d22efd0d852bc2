//! Error types shared by every component of the CA core.

use std::path::PathBuf;

use crate::storage::StoreError;

pub type CaResult<T> = Result<T, CaError>;

#[derive(Debug, thiserror::Error)]
pub enum CaError {
    /// The crypto library rejected the parameters of a single operation.
    #[error("Signing failed: {0}")]
    Signing(String),

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    /// The ledger and the certificate store disagree. Never guessed around.
    #[error("Revocation ledger inconsistent: {0}")]
    RevocationInconsistency(String),

    #[error("Export to {path:?} failed: {source}")]
    ExportIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path:?}: {reason}")]
    ImportParse { path: PathBuf, reason: String },

    #[error("Serial {0} is already in use")]
    DuplicateSerial(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),
}

impl CaError {
    pub(crate) fn signing(context: &str, err: impl std::fmt::Display) -> Self {
        CaError::Signing(format!("{}: {}", context, err))
    }

    pub(crate) fn not_found(kind: &'static str, id: impl ToString) -> Self {
        CaError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub(crate) fn export_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CaError::ExportIo {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn import_parse(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        CaError::ImportParse {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<openssl::error::ErrorStack> for CaError {
    fn from(err: openssl::error::ErrorStack) -> Self {
        CaError::Signing(err.to_string())
    }
}

impl From<rcgen::Error> for CaError {
    fn from(err: rcgen::Error) -> Self {
        CaError::Signing(err.to_string())
    }
}
