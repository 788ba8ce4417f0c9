use chrono::{DateTime, Utc};
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Signature error: {0}")]
    Signature(String),

    #[error("Invalid certificate template: {0}")]
    InvalidTemplate(String),

    #[error("Policy violation: {0}")]
    PolicyViolation(String),

    #[error("OCSP staple missing: {0}")]
    OcspMissing(String),

    #[error("OCSP staple has no response for certificate serial {0}")]
    OcspNoMatchingResponse(String),

    #[error("OCSP response signature invalid: {0}")]
    OcspInvalidSignature(String),

    #[error("OCSP response stale: next update {next_update:?}, now {now}")]
    OcspStale {
        next_update: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    },

    #[error("Certificate not in good standing: serial {serial} is {status}")]
    OcspRevoked { serial: String, status: String },

    #[error("Signing deadline exceeded: {0}")]
    Timeout(String),

    #[error("Signing backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Trust anchor not found: {0}")]
    TrustAnchorNotFound(String),

    #[error("Invalid certificate chain: {0}")]
    InvalidChain(String),

    #[error("Certificate expired or not yet valid: {0}")]
    CertExpired(String),

    #[error("Certificate already revoked: serial {0}")]
    AlreadyRevoked(String),

    #[error("Certificate generation error: {0}")]
    CertGen(String),

    #[error("PEM parsing error: {0}")]
    Pem(String),

    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Whether a caller may reasonably try the same operation again.
    ///
    /// Malformed or adversarial input (parse and signature failures) is never
    /// retryable. Backend trouble and stale staples are: a refresher can
    /// re-fetch, and a token can come back.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_) | Error::BackendUnavailable(_) | Error::OcspStale { .. }
        )
    }
}

impl From<rcgen::Error> for Error {
    fn from(err: rcgen::Error) -> Self {
        Error::CertGen(err.to_string())
    }
}

impl From<rustls::Error> for Error {
    fn from(err: rustls::Error) -> Self {
        Error::Tls(err.to_string())
    }
}

impl From<x509_parser::error::X509Error> for Error {
    fn from(err: x509_parser::error::X509Error) -> Self {
        Error::Parse(err.to_string())
    }
}

impl From<x509_parser::nom::Err<x509_parser::error::X509Error>> for Error {
    fn from(err: x509_parser::nom::Err<x509_parser::error::X509Error>) -> Self {
        Error::Parse(err.to_string())
    }
}

impl From<yasna::ASN1Error> for Error {
    fn from(err: yasna::ASN1Error) -> Self {
        Error::Parse(err.to_string())
    }
}

impl From<pem::PemError> for Error {
    fn from(err: pem::PemError) -> Self {
        Error::Pem(err.to_string())
    }
}

impl From<p256::ecdsa::Error> for Error {
    fn from(err: p256::ecdsa::Error) -> Self {
        Error::Signature(err.to_string())
    }
}

#[cfg(feature = "json")]
impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::Timeout("lock".into()).is_retryable());
        assert!(Error::BackendUnavailable("unplugged".into()).is_retryable());
        assert!(Error::OcspStale {
            next_update: None,
            now: Utc::now()
        }
        .is_retryable());

        assert!(!Error::Parse("garbage".into()).is_retryable());
        assert!(!Error::Signature("mismatch".into()).is_retryable());
        assert!(!Error::OcspRevoked {
            serial: "01".into(),
            status: "revoked".into()
        }
        .is_retryable());
    }
}
