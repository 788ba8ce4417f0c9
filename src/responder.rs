//! Local OCSP response construction.

use crate::ca::CertificateAuthority;
use crate::certificate::Certificate;
use crate::error::{Error, Result};
use crate::keys::Digest;
use crate::ocsp::{self, CertId, CertStatus, HashAlgorithm, SingleResponse};
use crate::types::truncate_to_seconds;
use chrono::{DateTime, Duration, Utc};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct ResponderConfig {
    /// nextUpdate - thisUpdate for responses built by [`OcspResponder::build_current`].
    pub validity_window: Duration,
    pub cert_id_hash: HashAlgorithm,
}

impl Default for ResponderConfig {
    fn default() -> Self {
        Self {
            validity_window: Duration::hours(1),
            cert_id_hash: HashAlgorithm::Sha1,
        }
    }
}

impl ResponderConfig {
    pub fn with_validity_window(mut self, window: Duration) -> Self {
        self.validity_window = window;
        self
    }

    pub fn with_cert_id_hash(mut self, hash: HashAlgorithm) -> Self {
        self.cert_id_hash = hash;
        self
    }
}

/// Builds signed OCSP responses on behalf of a [`CertificateAuthority`].
///
/// The responder owns no key. Every response is signed through the
/// authority's serialized signer, so a hardware-backed authority produces
/// hardware-signed staples.
#[derive(Debug, Clone, Default)]
pub struct OcspResponder {
    config: ResponderConfig,
}

impl OcspResponder {
    pub fn new(config: ResponderConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ResponderConfig {
        &self.config
    }

    /// DER of a successful `OCSPResponse` for `subject` with
    /// `nextUpdate = this_update + window`.
    pub fn build_response(
        &self,
        authority: &CertificateAuthority,
        subject: &Certificate,
        status: CertStatus,
        this_update: DateTime<Utc>,
        window: Duration,
    ) -> Result<Vec<u8>> {
        if window <= Duration::zero() {
            return Err(Error::InvalidInput(format!(
                "OCSP validity window must be positive, got {}s",
                window.num_seconds()
            )));
        }
        if !authority.issued(subject) {
            return Err(Error::InvalidInput(format!(
                "certificate {} was not issued by {}",
                subject.subject(),
                authority.root().subject()
            )));
        }

        let this_update = truncate_to_seconds(this_update);
        let single = SingleResponse {
            cert_id: CertId::for_pair(self.config.cert_id_hash, authority.root(), subject),
            status,
            this_update,
            next_update: Some(this_update + window),
        };

        let responder_key_hash = authority.public_key().key_id();
        let produced_at = truncate_to_seconds(Utc::now());
        let tbs = ocsp::encode_response_data(&responder_key_hash, produced_at, &[single])?;
        let signature = authority.sign_digest(&Digest::sha256(&tbs))?;

        debug!(
            serial = %subject.serial(),
            status = status.name(),
            this_update = %this_update,
            window_secs = window.num_seconds(),
            "built OCSP response"
        );
        Ok(ocsp::encode_ocsp_response(&tbs, signature.as_bytes()))
    }

    pub fn build_current(
        &self,
        authority: &CertificateAuthority,
        subject: &Certificate,
        now: DateTime<Utc>,
    ) -> Result<Vec<u8>> {
        let status = match authority.revocation_status(subject.serial()) {
            Some(revoked) => CertStatus::Revoked {
                revoked_at: revoked.revocation_time,
                reason: Some(revoked.reason),
            },
            None => CertStatus::Good,
        };
        self.build_response(authority, subject, status, now, self.config.validity_window)
    }
}
