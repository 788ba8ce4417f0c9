use crate::error::{Error, Result};
use crate::keys::PublicKey;
use crate::types::{
    chrono_from_unix, DistinguishedName, ExtendedKeyUsage, KeyUsage, SerialNumber,
    SubjectAltName,
};
use chrono::{DateTime, Utc};
use rustls::pki_types::CertificateDer;
use sha2::{Digest as _, Sha256};
use std::fmt;
use x509_parser::oid_registry::OID_SIG_ECDSA_WITH_SHA256;
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;

const PEM_TAG: &str = "CERTIFICATE";

/// An immutable, parsed X.509 certificate.
///
/// The fields this crate cares about are extracted once at parse time; the
/// original DER is kept for signature checks and re-encoding.
#[derive(Clone)]
pub struct Certificate {
    der: CertificateDer<'static>,
    tbs: Vec<u8>,
    signature: Vec<u8>,
    subject: DistinguishedName,
    issuer: DistinguishedName,
    subject_raw: Vec<u8>,
    issuer_raw: Vec<u8>,
    serial: SerialNumber,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    san: SubjectAltName,
    is_ca: bool,
    key_usage: Vec<KeyUsage>,
    extended_key_usage: Vec<ExtendedKeyUsage>,
    public_key: PublicKey,
    ecdsa_sha256: bool,
}

impl Certificate {
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (rest, x509) = X509Certificate::from_der(der)
            .map_err(|e| Error::Parse(format!("Failed to parse certificate: {}", e)))?;
        if !rest.is_empty() {
            return Err(Error::Parse(format!(
                "{} trailing bytes after certificate",
                rest.len()
            )));
        }

        let public_key = PublicKey::from_spki(x509.public_key())?;

        let san = match x509.subject_alternative_name()? {
            Some(ext) => SubjectAltName::from_general_names(&ext.value.general_names),
            None => SubjectAltName::new(),
        };

        let is_ca = x509
            .basic_constraints()?
            .map(|bc| bc.value.ca)
            .unwrap_or(false);

        let key_usage = x509
            .key_usage()?
            .map(|ext| KeyUsage::from_x509(ext.value))
            .unwrap_or_default();

        let extended_key_usage = x509
            .extended_key_usage()?
            .map(|ext| ExtendedKeyUsage::from_x509(ext.value).0)
            .unwrap_or_default();

        Ok(Self {
            der: CertificateDer::from(der.to_vec()),
            tbs: x509.tbs_certificate.as_ref().to_vec(),
            signature: x509.signature_value.data.to_vec(),
            subject: DistinguishedName::from_x509(x509.subject()),
            issuer: DistinguishedName::from_x509(x509.issuer()),
            subject_raw: x509.subject().as_raw().to_vec(),
            issuer_raw: x509.issuer().as_raw().to_vec(),
            serial: SerialNumber::from_be_bytes(x509.raw_serial()),
            not_before: chrono_from_unix(x509.validity().not_before.timestamp())?,
            not_after: chrono_from_unix(x509.validity().not_after.timestamp())?,
            san,
            is_ca,
            key_usage,
            extended_key_usage,
            public_key,
            ecdsa_sha256: x509.signature_algorithm.algorithm == OID_SIG_ECDSA_WITH_SHA256,
        })
    }

    pub fn from_pem(pem_str: &str) -> Result<Self> {
        let block = pem::parse(pem_str)?;
        if block.tag() != PEM_TAG {
            return Err(Error::Pem(format!(
                "expected {} block, found {}",
                PEM_TAG,
                block.tag()
            )));
        }
        Self::from_der(block.contents())
    }

    /// Parses every `CERTIFICATE` block in `pem_str`, in order. Other block
    /// types are skipped.
    pub fn parse_pem_bundle(pem_str: &str) -> Result<Vec<Self>> {
        let certs = pem::parse_many(pem_str)?
            .iter()
            .filter(|block| block.tag() == PEM_TAG)
            .map(|block| Self::from_der(block.contents()))
            .collect::<Result<Vec<_>>>()?;

        if certs.is_empty() {
            return Err(Error::Pem("no certificates found".into()));
        }
        Ok(certs)
    }

    pub fn to_pem(&self) -> String {
        pem::encode(&pem::Pem::new(PEM_TAG, self.der.to_vec()))
    }

    pub fn der(&self) -> &[u8] {
        self.der.as_ref()
    }

    pub fn certificate_der(&self) -> &CertificateDer<'static> {
        &self.der
    }

    pub fn subject(&self) -> &DistinguishedName {
        &self.subject
    }

    pub fn issuer(&self) -> &DistinguishedName {
        &self.issuer
    }

    pub(crate) fn subject_raw(&self) -> &[u8] {
        &self.subject_raw
    }

    pub fn serial(&self) -> &SerialNumber {
        &self.serial
    }

    pub fn not_before(&self) -> DateTime<Utc> {
        self.not_before
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    pub fn subject_alt_names(&self) -> &SubjectAltName {
        &self.san
    }

    pub fn is_ca(&self) -> bool {
        self.is_ca
    }

    pub fn key_usage(&self) -> &[KeyUsage] {
        &self.key_usage
    }

    pub fn extended_key_usage(&self) -> &[ExtendedKeyUsage] {
        &self.extended_key_usage
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn is_self_issued(&self) -> bool {
        self.subject_raw == self.issuer_raw
    }

    pub fn verify_signature(&self, issuer_key: &PublicKey) -> Result<()> {
        if !self.ecdsa_sha256 {
            return Err(Error::UnsupportedAlgorithm(
                "certificate is not signed with ecdsa-with-SHA256".into(),
            ));
        }
        issuer_key.verify(&self.tbs, &self.signature)
    }

    /// Checks that `issuer` named and signed this certificate.
    pub fn verify_issued_by(&self, issuer: &Certificate) -> Result<()> {
        if self.issuer_raw != issuer.subject_raw {
            return Err(Error::InvalidChain(format!(
                "issuer '{}' does not match subject '{}'",
                self.issuer, issuer.subject
            )));
        }
        self.verify_signature(issuer.public_key())
    }

    pub fn check_validity(&self, now: DateTime<Utc>) -> Result<()> {
        if now < self.not_before {
            return Err(Error::CertExpired(format!(
                "'{}' is not valid before {}",
                self.subject.common_name, self.not_before
            )));
        }
        if now > self.not_after {
            return Err(Error::CertExpired(format!(
                "'{}' expired at {}",
                self.subject.common_name, self.not_after
            )));
        }
        Ok(())
    }

    pub fn fingerprint(&self) -> String {
        Sha256::digest(self.der.as_ref())
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(":")
    }
}

impl PartialEq for Certificate {
    fn eq(&self, other: &Self) -> bool {
        self.der == other.der
    }
}

impl Eq for Certificate {}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("subject", &self.subject.to_string())
            .field("issuer", &self.issuer.to_string())
            .field("serial", &self.serial)
            .field("not_after", &self.not_after)
            .field("is_ca", &self.is_ca)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyPair;
    use crate::types::{CertType, CertificateTemplate, Curve};

    fn self_signed(cn: &str) -> (Certificate, KeyPair) {
        let key = KeyPair::generate(Curve::P256).unwrap();
        let template = CertificateTemplate::new(cn, CertType::RootCA);
        let serial = SerialNumber::from_be_bytes(&[0x42]);
        let params = template.to_rcgen(&serial).unwrap();
        let cert = params.self_signed(&key).unwrap();
        (Certificate::from_der(cert.der()).unwrap(), key)
    }

    #[test]
    fn test_parse_extracts_fields() {
        let (cert, key) = self_signed("unit-root");
        assert_eq!(cert.subject().common_name, "unit-root");
        assert_eq!(cert.serial().to_hex(), "42");
        assert!(cert.is_ca());
        assert!(cert.is_self_issued());
        assert!(cert.key_usage().contains(&KeyUsage::KeyCertSign));
        assert_eq!(cert.public_key(), key.public_key());
    }

    #[test]
    fn test_self_signature_verifies() {
        let (cert, _) = self_signed("unit-root");
        assert!(cert.verify_issued_by(&cert).is_ok());

        let (other, _) = self_signed("other-root");
        assert!(matches!(
            cert.verify_signature(other.public_key()),
            Err(Error::Signature(_))
        ));
        assert!(matches!(
            cert.verify_issued_by(&other),
            Err(Error::InvalidChain(_))
        ));
    }

    #[test]
    fn test_pem_bundle() {
        let (a, _) = self_signed("a");
        let (b, _) = self_signed("b");
        let bundle = format!("{}{}", a.to_pem(), b.to_pem());
        let parsed = Certificate::parse_pem_bundle(&bundle).unwrap();
        assert_eq!(parsed, vec![a, b]);

        assert!(matches!(
            Certificate::parse_pem_bundle(""),
            Err(Error::Pem(_))
        ));
    }

    #[test]
    fn test_from_pem() {
        let (cert, _) = self_signed("unit-root");
        let parsed = Certificate::from_pem(&cert.to_pem()).unwrap();
        assert_eq!(parsed, cert);

        let key_block = pem::encode(&pem::Pem::new("PRIVATE KEY", vec![0u8; 4]));
        assert!(matches!(
            Certificate::from_pem(&key_block),
            Err(Error::Pem(_))
        ));
    }

    #[test]
    fn test_garbage_is_parse_error() {
        assert!(matches!(
            Certificate::from_der(&[0x30, 0x03, 0x01, 0x02]),
            Err(Error::Parse(_))
        ));
    }

    #[test]
    fn test_validity_window() {
        let (cert, _) = self_signed("unit-root");
        assert!(cert.check_validity(cert.not_before()).is_ok());
        assert!(matches!(
            cert.check_validity(cert.not_after() + chrono::Duration::seconds(1)),
            Err(Error::CertExpired(_))
        ));
    }
}
