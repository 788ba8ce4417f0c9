//! Certificate signing requests.
//!
//! A [`CertificateSigningRequest`] can only be obtained from
//! [`CsrValidator::validate`], which checks the self-signature before any
//! field is extracted. Nothing downstream ever sees an unverified subject or
//! SAN.

use crate::error::{Error, Result};
use crate::keys::{KeyPair, PublicKey};
use crate::types::{exact_name, DistinguishedName, ExtendedKeyUsage, SubjectAltName};
use std::net::IpAddr;
use tracing::debug;
use x509_parser::certification_request::X509CertificationRequest;
use x509_parser::extensions::ParsedExtension;
use x509_parser::prelude::FromDer;
use x509_parser::x509::X509Name;

const PEM_TAGS: [&str; 2] = ["CERTIFICATE REQUEST", "NEW CERTIFICATE REQUEST"];
const OID_BASIC_CONSTRAINTS: &[u64] = &[2, 5, 29, 19];

#[derive(Debug, Clone)]
pub struct CertificateSigningRequest {
    subject: DistinguishedName,
    subject_der: Vec<u8>,
    san: SubjectAltName,
    public_key: PublicKey,
    requested_extended_key_usage: Vec<ExtendedKeyUsage>,
    unrecognized_extended_key_usage: Vec<String>,
    requested_ca: bool,
    der: Vec<u8>,
}

impl CertificateSigningRequest {
    pub fn subject(&self) -> &DistinguishedName {
        &self.subject
    }

    /// The subject exactly as encoded in the request, attribute for attribute.
    pub(crate) fn exact_subject(&self) -> Result<rcgen::DistinguishedName> {
        let (_, name) = X509Name::from_der(&self.subject_der)
            .map_err(|e| Error::Parse(format!("Failed to parse CSR subject: {}", e)))?;
        exact_name(&name)
    }

    pub fn subject_alt_names(&self) -> &SubjectAltName {
        &self.san
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn requested_extended_key_usage(&self) -> &[ExtendedKeyUsage] {
        &self.requested_extended_key_usage
    }

    /// Dotted OIDs of requested purposes that have no [`ExtendedKeyUsage`] variant.
    pub fn unrecognized_extended_key_usage(&self) -> &[String] {
        &self.unrecognized_extended_key_usage
    }

    /// Set when the request carries `cA=TRUE` or asks for keyCertSign.
    pub fn requests_ca(&self) -> bool {
        self.requested_ca
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }
}

pub struct CsrValidator;

impl CsrValidator {
    /// Accepts a DER or PEM encoded PKCS#10 request.
    pub fn validate(bytes: &[u8]) -> Result<CertificateSigningRequest> {
        let der = decode(bytes)?;

        let (rest, csr) = X509CertificationRequest::from_der(&der)
            .map_err(|e| Error::Parse(format!("Failed to parse CSR: {}", e)))?;
        if !rest.is_empty() {
            return Err(Error::Parse(format!(
                "{} trailing bytes after CSR",
                rest.len()
            )));
        }

        csr.verify_signature()
            .map_err(|e| Error::Signature(format!("CSR self-signature does not verify: {}", e)))?;

        let info = &csr.certification_request_info;
        let public_key = PublicKey::from_spki(&info.subject_pki)?;

        let mut san = SubjectAltName::new();
        let mut requested_extended_key_usage = Vec::new();
        let mut unrecognized_extended_key_usage = Vec::new();
        let mut requested_ca = false;

        if let Some(extensions) = csr.requested_extensions() {
            for ext in extensions {
                match ext {
                    ParsedExtension::SubjectAlternativeName(names) => {
                        san = SubjectAltName::from_general_names(&names.general_names);
                    }
                    ParsedExtension::ExtendedKeyUsage(eku) => {
                        let (known, unknown) = ExtendedKeyUsage::from_x509(eku);
                        requested_extended_key_usage = known;
                        unrecognized_extended_key_usage = unknown;
                    }
                    ParsedExtension::BasicConstraints(bc) => requested_ca |= bc.ca,
                    ParsedExtension::KeyUsage(ku) => requested_ca |= ku.key_cert_sign(),
                    _ => {}
                }
            }
        }

        let request = CertificateSigningRequest {
            subject: DistinguishedName::from_x509(&info.subject),
            subject_der: info.subject.as_raw().to_vec(),
            san,
            public_key,
            requested_extended_key_usage,
            unrecognized_extended_key_usage,
            requested_ca,
            der,
        };
        debug!(subject = %request.subject, "validated CSR");
        Ok(request)
    }
}

fn decode(bytes: &[u8]) -> Result<Vec<u8>> {
    let trimmed = bytes.trim_ascii_start();
    if !trimmed.starts_with(b"-----BEGIN") {
        return Ok(bytes.to_vec());
    }

    let block = pem::parse(trimmed)
        .map_err(|e| Error::Parse(format!("Malformed CSR PEM: {}", e)))?;
    if !PEM_TAGS.contains(&block.tag()) {
        return Err(Error::Parse(format!(
            "expected a CERTIFICATE REQUEST block, found {}",
            block.tag()
        )));
    }
    Ok(block.into_contents())
}

/// Requester-side CSR construction.
#[derive(Debug, Clone)]
pub struct CsrBuilder {
    subject: DistinguishedName,
    san: SubjectAltName,
    extended_key_usage: Vec<ExtendedKeyUsage>,
    request_ca: bool,
}

impl CsrBuilder {
    pub fn new(common_name: impl Into<String>) -> Self {
        Self {
            subject: DistinguishedName::new(common_name),
            san: SubjectAltName::new(),
            extended_key_usage: Vec::new(),
            request_ca: false,
        }
    }

    pub fn with_subject(mut self, subject: DistinguishedName) -> Self {
        self.subject = subject;
        self
    }

    pub fn with_dns_san(mut self, dns: impl Into<String>) -> Self {
        self.san = self.san.with_dns(dns);
        self
    }

    pub fn with_ip_san(mut self, ip: IpAddr) -> Self {
        self.san = self.san.with_ip(ip);
        self
    }

    pub fn request_extended_key_usage(mut self, eku: ExtendedKeyUsage) -> Self {
        self.extended_key_usage.push(eku);
        self
    }

    pub fn request_ca(mut self) -> Self {
        self.request_ca = true;
        self
    }

    pub fn build(&self, key: &KeyPair) -> Result<Vec<u8>> {
        let mut params = rcgen::CertificateParams::default();
        params.distinguished_name = self.subject.to_rcgen();
        params.subject_alt_names = self.san.to_rcgen()?;
        params.extended_key_usages = self
            .extended_key_usage
            .iter()
            .map(|eku| eku.to_rcgen())
            .collect();

        if self.request_ca {
            // rcgen will not put is_ca into a request; encode the extension by hand
            let content = yasna::construct_der(|writer| {
                writer.write_sequence(|writer| writer.next().write_bool(true))
            });
            let mut ext =
                rcgen::CustomExtension::from_oid_content(OID_BASIC_CONSTRAINTS, content);
            ext.set_criticality(true);
            params.custom_extensions.push(ext);
            params.key_usages = vec![rcgen::KeyUsagePurpose::KeyCertSign];
        }

        let csr = params.serialize_request(key)?;
        Ok(csr.der().to_vec())
    }

    pub fn build_pem(&self, key: &KeyPair) -> Result<String> {
        let der = self.build(key)?;
        Ok(pem::encode(&pem::Pem::new(PEM_TAGS[0], der)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Curve;

    fn sample_key() -> KeyPair {
        KeyPair::generate(Curve::P256).unwrap()
    }

    #[test]
    fn test_validate_der_and_pem() {
        let key = sample_key();
        let builder = CsrBuilder::new("my-server")
            .with_dns_san("my-server.internal")
            .with_ip_san("127.0.0.1".parse().unwrap())
            .request_extended_key_usage(ExtendedKeyUsage::ServerAuth);

        let der = builder.build(&key).unwrap();
        let csr = CsrValidator::validate(&der).unwrap();
        assert_eq!(csr.subject().common_name, "my-server");
        assert_eq!(csr.subject_alt_names().dns_names, vec!["my-server.internal"]);
        assert_eq!(
            csr.subject_alt_names().ip_addresses,
            vec!["127.0.0.1".parse::<IpAddr>().unwrap()]
        );
        assert_eq!(
            csr.requested_extended_key_usage(),
            &[ExtendedKeyUsage::ServerAuth][..]
        );
        assert_eq!(csr.public_key(), key.public_key());
        assert!(!csr.requests_ca());

        let pem = builder.build_pem(&key).unwrap();
        let from_pem = CsrValidator::validate(pem.as_bytes()).unwrap();
        assert_eq!(from_pem.der(), csr.der());
    }

    #[test]
    fn test_flipped_signature_byte_is_rejected() {
        let key = sample_key();
        let mut der = CsrBuilder::new("svc").build(&key).unwrap();
        let last = der.len() - 1;
        der[last] ^= 0x01;

        assert!(matches!(
            CsrValidator::validate(&der),
            Err(Error::Signature(_))
        ));
    }

    #[test]
    fn test_tampered_subject_is_rejected() {
        let key = sample_key();
        let der = CsrBuilder::new("aaaa").build(&key).unwrap();
        let pos = der
            .windows(4)
            .position(|w| w == b"aaaa")
            .unwrap();
        let mut tampered = der.clone();
        tampered[pos..pos + 4].copy_from_slice(b"root");

        assert!(matches!(
            CsrValidator::validate(&tampered),
            Err(Error::Signature(_))
        ));
    }

    #[test]
    fn test_malformed_input_is_parse_error() {
        assert!(matches!(
            CsrValidator::validate(b"not a csr"),
            Err(Error::Parse(_))
        ));
        let garbled =
            b"-----BEGIN CERTIFICATE REQUEST-----\n!!!\n-----END CERTIFICATE REQUEST-----\n";
        assert!(matches!(
            CsrValidator::validate(garbled),
            Err(Error::Parse(_))
        ));

        let key = sample_key();
        let der = CsrBuilder::new("svc").build(&key).unwrap();
        let wrong_tag = pem::encode(&pem::Pem::new("CERTIFICATE", der));
        assert!(matches!(
            CsrValidator::validate(wrong_tag.as_bytes()),
            Err(Error::Parse(_))
        ));
    }

    #[test]
    fn test_ca_request_detected() {
        let key = sample_key();
        let der = CsrBuilder::new("sneaky").request_ca().build(&key).unwrap();
        let csr = CsrValidator::validate(&der).unwrap();
        assert!(csr.requests_ca());
    }
}
