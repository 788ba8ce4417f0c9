//! minipki - a minimal self-hosted PKI core for internal mutual TLS
//!
//! This library covers the life of an internal certificate from key to
//! revocation check:
//!
//! - Creating a root Certificate Authority whose key lives in memory or on a
//!   hardware token
//! - Validating certificate signing requests and issuing leaf certificates
//!   under an explicit policy
//! - Building signed OCSP responses and stapling them to served chains
//! - Verifying stapled responses on the client side
//! - Rotating the set of trusted roots without a flag day
//!
//! # Examples
//!
//! ## Creating a Root CA
//!
//! ```no_run
//! use chrono::Duration;
//! use minipki::ca::CertificateAuthority;
//! use minipki::types::DistinguishedName;
//!
//! let subject = DistinguishedName::new("My Root CA")
//!     .with_organization("My Company")
//!     .with_country("US");
//!
//! let ca = CertificateAuthority::new(subject, Duration::days(3650)).unwrap();
//! ca.save_pem("ca.pem", "ca-key.pem").unwrap();
//! ```
//!
//! ## Issuing from a CSR
//!
//! ```no_run
//! use minipki::ca::{AuthorityConfig, CertificateAuthority};
//! use minipki::cert::{CertificateIssuer, IssuancePolicy};
//!
//! let ca = CertificateAuthority::load_pem("ca.pem", "ca-key.pem", AuthorityConfig::default())
//!     .unwrap();
//! let csr = std::fs::read("request.csr").unwrap();
//!
//! let der = CertificateIssuer::new(IssuancePolicy::server())
//!     .issue(&ca, &csr)
//!     .unwrap();
//! ```
//!
//! ## Stapling and verifying
//!
//! ```no_run
//! use chrono::Utc;
//! use minipki::{CertificateAuthority, CertificateBuilder, OcspResponder, OcspVerifier};
//! # let ca: CertificateAuthority = unimplemented!();
//!
//! let issued = CertificateBuilder::server("svc.internal")
//!     .with_dns_san("svc.internal")
//!     .issue(&ca)
//!     .unwrap();
//!
//! let staple = OcspResponder::default()
//!     .build_current(&ca, &issued.certificate, Utc::now())
//!     .unwrap();
//!
//! OcspVerifier::default()
//!     .verify(&issued.full_chain(), Some(&staple), Utc::now())
//!     .unwrap();
//! ```

pub mod backend;
pub mod ca;
pub mod cert;
pub mod certificate;
pub mod csr;
pub mod error;
pub mod fetch;
pub mod keys;
pub mod ocsp;
pub mod responder;
pub mod staple;
pub mod token;
pub mod trust;
pub mod types;
pub mod verifier;

#[cfg(feature = "cli")]
pub mod cli;
#[cfg(feature = "cli")]
pub mod inspect;

pub use error::{Error, Result};

pub use backend::{BackendKind, InMemoryBackend, SignPurpose, SignerHandle, SigningBackend};
pub use ca::{AuthorityConfig, CertificateAuthority};
pub use cert::{
    issue_client_cert, issue_server_cert, CertificateBuilder, CertificateIssuer, IssuancePolicy,
    IssuedCertificate,
};
pub use certificate::Certificate;
pub use csr::{CertificateSigningRequest, CsrBuilder, CsrValidator};
pub use fetch::{fetch_peer, PeerCertificates};
pub use keys::{Digest, KeyPair, PublicKey, Signature};
pub use ocsp::{CertId, CertStatus, HashAlgorithm, OcspResponse, SingleResponse};
pub use responder::{OcspResponder, ResponderConfig};
pub use staple::{StapleRefresher, StapleStore};
pub use token::{
    Slot, SoftToken, TokenBackend, TokenCredentials, TokenDevice, TokenProbe, TokenState,
};
pub use trust::{TrustBundle, TrustStore, TrustStoreConfig};
pub use types::{
    CertType, CertificateTemplate, Curve, DistinguishedName, ExtendedKeyUsage, KeyUsage,
    RevocationReason, RevokedCertificate, SerialNumber, SubjectAltName,
};
pub use verifier::{OcspVerifier, VerifierConfig};

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn acme_ca(name: &str) -> CertificateAuthority {
        let subject = DistinguishedName::new(name).with_organization("Acme Co");
        CertificateAuthority::new(subject, Duration::hours(1)).unwrap()
    }

    fn server_csr(key: &KeyPair) -> Vec<u8> {
        CsrBuilder::new("my-server")
            .with_subject(DistinguishedName::new("my-server").with_organization("Acme Co"))
            .with_ip_san("127.0.0.1".parse().unwrap())
            .request_extended_key_usage(ExtendedKeyUsage::ServerAuth)
            .build(key)
            .unwrap()
    }

    #[test]
    fn test_end_to_end_staple_lifecycle() {
        let ca = acme_ca("my-ca");
        assert!(ca.root().verify_signature(ca.public_key()).is_ok());

        let key = KeyPair::generate(Curve::P256).unwrap();
        let der = CertificateIssuer::new(IssuancePolicy::server())
            .issue(&ca, &server_csr(&key))
            .unwrap();
        let leaf = Certificate::from_der(&der).unwrap();
        assert!(leaf.verify_issued_by(ca.root()).is_ok());
        assert_eq!(leaf.subject().common_name, "my-server");
        assert_eq!(
            leaf.subject_alt_names().ip_addresses,
            vec!["127.0.0.1".parse::<std::net::IpAddr>().unwrap()]
        );

        let now = types::truncate_to_seconds(Utc::now());
        let staple = OcspResponder::default()
            .build_response(&ca, &leaf, CertStatus::Good, now, Duration::seconds(60))
            .unwrap();

        let store = StapleStore::new();
        store
            .insert("my-server", vec![leaf.clone(), ca.root().clone()], &key, Some(staple))
            .unwrap();
        let (chain, served) = store.get("my-server").unwrap();

        let verifier = OcspVerifier::default();
        assert!(verifier.verify(&chain, served.as_deref(), now).is_ok());
        assert!(matches!(
            verifier.verify(&chain, served.as_deref(), now + Duration::seconds(61)),
            Err(Error::OcspStale { .. })
        ));

        let trust = TrustStore::new(
            TrustBundle::new(1, vec![ca.root().clone()]).unwrap(),
            TrustStoreConfig::default(),
        );
        assert!(verifier
            .verify_peer(&trust, &chain[..1], served.as_deref(), now)
            .is_ok());
    }

    #[test]
    fn test_tampered_csr_never_reaches_issuance() {
        let ca = acme_ca("my-ca");
        let key = KeyPair::generate(Curve::P256).unwrap();
        let mut csr = server_csr(&key);
        let last = csr.len() - 1;
        csr[last] ^= 0x01;

        assert!(matches!(
            CertificateIssuer::default().issue(&ca, &csr),
            Err(Error::Signature(_))
        ));
    }

    #[test]
    fn test_eku_policy_is_enforced() {
        let ca = acme_ca("my-ca");
        let key = KeyPair::generate(Curve::P256).unwrap();
        let csr = CsrBuilder::new("svc")
            .with_dns_san("svc.internal")
            .request_extended_key_usage(ExtendedKeyUsage::ClientAuth)
            .build(&key)
            .unwrap();

        assert!(matches!(
            CertificateIssuer::new(IssuancePolicy::server()).issue(&ca, &csr),
            Err(Error::PolicyViolation(_))
        ));
        assert!(CertificateIssuer::new(IssuancePolicy::mutual())
            .issue(&ca, &csr)
            .is_ok());
    }

    #[test]
    fn test_revocation_takes_precedence_over_staleness() {
        let ca = acme_ca("my-ca");
        let issued = issue_client_cert(&ca, "svc", 30).unwrap();
        ca.revoke(issued.serial(), RevocationReason::KeyCompromise).unwrap();

        let now = Utc::now();
        let staple = OcspResponder::new(
            ResponderConfig::default().with_validity_window(Duration::seconds(60)),
        )
        .build_current(&ca, &issued.certificate, now)
        .unwrap();

        match OcspVerifier::default().verify(
            &issued.full_chain(),
            Some(&staple),
            now + Duration::minutes(10),
        ) {
            Err(Error::OcspRevoked { serial, .. }) => assert_eq!(serial, issued.serial().to_hex()),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_token_authority_signs_staples() {
        let token = SoftToken::new();
        let probe = token.probe();
        let backend = TokenBackend::provision(
            token,
            Slot::Signature,
            TokenCredentials::default(),
            Curve::P256,
        )
        .unwrap();
        let ca = CertificateAuthority::with_backend(
            DistinguishedName::new("token-ca"),
            Duration::days(1),
            Box::new(backend),
            AuthorityConfig::default(),
        )
        .unwrap();

        let issued = CertificateBuilder::server("svc.internal")
            .with_dns_san("svc.internal")
            .issue(&ca)
            .unwrap();
        let before = probe.signatures();
        let staple = OcspResponder::default()
            .build_current(&ca, &issued.certificate, Utc::now())
            .unwrap();
        assert_eq!(probe.signatures(), before + 1);
        assert!(OcspVerifier::default()
            .verify(&issued.full_chain(), Some(&staple), Utc::now())
            .is_ok());

        probe.unplug();
        let err = OcspResponder::default()
            .build_current(&ca, &issued.certificate, Utc::now())
            .unwrap_err();
        assert!(matches!(err, Error::BackendUnavailable(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_rotation_keeps_old_peers_working_until_commit() {
        let old_ca = acme_ca("old-ca");
        let new_ca = acme_ca("new-ca");
        let trust = TrustStore::new(
            TrustBundle::new(1, vec![old_ca.root().clone()]).unwrap(),
            TrustStoreConfig::default().with_overlap_window(Duration::minutes(10)),
        );

        let old_leaf = issue_client_cert(&old_ca, "svc", 1).unwrap();
        let now = Utc::now();
        let staple = OcspResponder::default()
            .build_current(&old_ca, &old_leaf.certificate, now)
            .unwrap();
        let verifier = OcspVerifier::default();

        trust
            .rotate_pem(format!("{}{}", new_ca.root_pem(), old_ca.root_pem()).as_bytes())
            .unwrap();
        trust.commit();
        assert!(verifier
            .verify_peer(&trust, &old_leaf.full_chain(), Some(&staple), now)
            .is_ok());

        trust.rotate_pem(new_ca.root_pem().as_bytes()).unwrap();
        assert!(verifier
            .verify_peer(&trust, &old_leaf.full_chain(), Some(&staple), now)
            .is_ok());
        assert!(matches!(
            verifier.verify_peer(
                &trust,
                &old_leaf.full_chain(),
                Some(&staple),
                now + Duration::minutes(11)
            ),
            Err(Error::TrustAnchorNotFound(_))
        ));

        trust.commit();
        assert!(matches!(
            verifier.verify_peer(&trust, &old_leaf.full_chain(), Some(&staple), now),
            Err(Error::TrustAnchorNotFound(_))
        ));
    }
}
