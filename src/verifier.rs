//! Client-side checking of stapled OCSP responses.

use crate::certificate::Certificate;
use crate::error::{Error, Result};
use crate::ocsp::OcspResponse;
use crate::trust::TrustStore;
use chrono::{DateTime, Utc};
use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct VerifierConfig {
    pub require_anchor_staple: bool,
}

impl VerifierConfig {
    pub fn with_require_anchor_staple(mut self, require: bool) -> Self {
        self.require_anchor_staple = require;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct OcspVerifier {
    config: VerifierConfig,
}

impl OcspVerifier {
    pub fn new(config: VerifierConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &VerifierConfig {
        &self.config
    }

    /// Checks `staple` against every (issuer, subject) pair of a leaf-first
    /// chain.
    ///
    /// For each pair the order is: matching single response, signature by
    /// the issuer key, status, freshness. A revoked certificate is reported
    /// as revoked even when its response is also stale.
    pub fn verify(
        &self,
        chain: &[Certificate],
        staple: Option<&[u8]>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let staple = match staple {
            Some(bytes) if !bytes.is_empty() => bytes,
            _ => {
                return Err(Error::OcspMissing(
                    "peer did not staple an OCSP response".into(),
                ))
            }
        };
        let response = OcspResponse::parse(staple)?;

        let mut pairs: Vec<(&Certificate, &Certificate)> =
            chain.windows(2).map(|pair| (&pair[1], &pair[0])).collect();
        if self.config.require_anchor_staple {
            if let Some(anchor) = chain.last().filter(|c| c.is_self_issued()) {
                pairs.push((anchor, anchor));
            }
        }
        if pairs.is_empty() {
            return Err(Error::InvalidChain(
                "chain has no issuer to check a staple against".into(),
            ));
        }

        for (issuer, subject) in pairs {
            let single = response.response_for(issuer, subject).ok_or_else(|| {
                Error::OcspNoMatchingResponse(subject.serial().to_hex())
            })?;
            response.verify_signature(issuer.public_key())?;

            if !single.status.is_good() {
                return Err(Error::OcspRevoked {
                    serial: subject.serial().to_hex(),
                    status: single.status.to_string(),
                });
            }
            if single.is_stale(now) {
                return Err(Error::OcspStale {
                    next_update: single.next_update,
                    now,
                });
            }
            debug!(
                subject = %subject.subject(),
                serial = %subject.serial(),
                next_update = ?single.next_update,
                "staple verified"
            );
        }
        Ok(())
    }

    /// Chain validation against `trust`, then [`OcspVerifier::verify`].
    /// A chain that stops short of its root gets the trusted root appended.
    pub fn verify_peer(
        &self,
        trust: &TrustStore,
        chain: &[Certificate],
        staple: Option<&[u8]>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let anchor = trust.verify_chain(chain, now)?;
        if chain.last() == Some(&anchor) {
            return self.verify(chain, staple, now);
        }

        let mut full = chain.to_vec();
        full.push(anchor);
        self.verify(&full, staple, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::CertificateAuthority;
    use crate::cert::{CertificateBuilder, IssuedCertificate};
    use crate::ocsp::CertStatus;
    use crate::responder::OcspResponder;
    use crate::trust::{TrustBundle, TrustStoreConfig};
    use crate::types::{DistinguishedName, RevocationReason};
    use chrono::Duration;

    fn setup() -> (CertificateAuthority, IssuedCertificate) {
        let ca = CertificateAuthority::new(DistinguishedName::new("my-ca"), Duration::days(1))
            .unwrap();
        let leaf = CertificateBuilder::server("my-server")
            .with_ip_san("127.0.0.1".parse().unwrap())
            .issue(&ca)
            .unwrap();
        (ca, leaf)
    }

    fn staple(
        ca: &CertificateAuthority,
        leaf: &Certificate,
        status: CertStatus,
        now: DateTime<Utc>,
    ) -> Vec<u8> {
        OcspResponder::default()
            .build_response(ca, leaf, status, now, Duration::seconds(60))
            .unwrap()
    }

    #[test]
    fn test_missing_staple() {
        let (_, leaf) = setup();
        let verifier = OcspVerifier::default();
        for staple in [None, Some(&[][..])] {
            assert!(matches!(
                verifier.verify(&leaf.full_chain(), staple, Utc::now()),
                Err(Error::OcspMissing(_))
            ));
        }
    }

    #[test]
    fn test_good_staple_until_next_update() {
        let (ca, leaf) = setup();
        let now = crate::types::truncate_to_seconds(Utc::now());
        let der = staple(&ca, &leaf.certificate, CertStatus::Good, now);
        let verifier = OcspVerifier::default();

        assert!(verifier.verify(&leaf.full_chain(), Some(&der), now).is_ok());
        assert!(verifier
            .verify(&leaf.full_chain(), Some(&der), now + Duration::seconds(60))
            .is_ok());
        assert!(matches!(
            verifier.verify(&leaf.full_chain(), Some(&der), now + Duration::seconds(61)),
            Err(Error::OcspStale { .. })
        ));
    }

    #[test]
    fn test_staple_for_other_certificate() {
        let (ca, leaf) = setup();
        let other = CertificateBuilder::client("other").issue(&ca).unwrap();
        let der = staple(&ca, &other.certificate, CertStatus::Good, Utc::now());

        assert!(matches!(
            OcspVerifier::default().verify(&leaf.full_chain(), Some(&der), Utc::now()),
            Err(Error::OcspNoMatchingResponse(_))
        ));
    }

    #[test]
    fn test_revoked_wins_over_stale() {
        let (ca, leaf) = setup();
        let now = Utc::now();
        let der = staple(
            &ca,
            &leaf.certificate,
            CertStatus::Revoked {
                revoked_at: now,
                reason: Some(RevocationReason::KeyCompromise),
            },
            now,
        );

        assert!(matches!(
            OcspVerifier::default().verify(
                &leaf.full_chain(),
                Some(&der),
                now + Duration::hours(2)
            ),
            Err(Error::OcspRevoked { .. })
        ));

        let unknown = staple(&ca, &leaf.certificate, CertStatus::Unknown, now);
        assert!(matches!(
            OcspVerifier::default().verify(&leaf.full_chain(), Some(&unknown), now),
            Err(Error::OcspRevoked { .. })
        ));
    }

    #[test]
    fn test_tampered_signature() {
        let (ca, leaf) = setup();
        let now = Utc::now();
        let der = staple(&ca, &leaf.certificate, CertStatus::Good, now);
        let mut response = der.clone();
        let last = response.len() - 2;
        response[last] ^= 0x01;

        assert!(matches!(
            OcspVerifier::default().verify(&leaf.full_chain(), Some(&response), now),
            Err(Error::OcspInvalidSignature(_))
        ));
    }

    #[test]
    fn test_anchor_staple_required() {
        let (ca, leaf) = setup();
        let now = Utc::now();
        let der = staple(&ca, &leaf.certificate, CertStatus::Good, now);
        let strict = OcspVerifier::new(VerifierConfig::default().with_require_anchor_staple(true));

        assert!(matches!(
            strict.verify(&leaf.full_chain(), Some(&der), now),
            Err(Error::OcspNoMatchingResponse(_))
        ));
    }

    #[test]
    fn test_verify_peer_appends_anchor() {
        let (ca, leaf) = setup();
        let now = Utc::now();
        let der = staple(&ca, &leaf.certificate, CertStatus::Good, now);
        let trust = TrustStore::new(
            TrustBundle::new(1, vec![ca.root().clone()]).unwrap(),
            TrustStoreConfig::default(),
        );

        let verifier = OcspVerifier::default();
        assert!(verifier
            .verify_peer(&trust, &[leaf.certificate.clone()], Some(&der), now)
            .is_ok());
        assert!(matches!(
            verifier.verify(&[leaf.certificate.clone()], Some(&der), now),
            Err(Error::InvalidChain(_))
        ));
    }
}
