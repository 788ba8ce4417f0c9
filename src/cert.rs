use crate::ca::CertificateAuthority;
use crate::certificate::Certificate;
use crate::csr::{CertificateSigningRequest, CsrValidator};
use crate::error::{Error, Result};
use crate::keys::{KeyPair, PublicKey};
use crate::types::{
    truncate_to_seconds, CertType, CertificateTemplate, Curve, DistinguishedName,
    ExtendedKeyUsage, KeyUsage, SerialNumber,
};
use chrono::{Duration, Utc};
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use tracing::warn;
use zeroize::Zeroizing;

/// Authority-controlled fields of an issued certificate.
///
/// `extended_key_usage` is what gets written into the certificate;
/// `allowed_extended_key_usage` is what a CSR may ask for without being
/// rejected.
#[derive(Debug, Clone)]
pub struct IssuancePolicy {
    pub validity: Duration,
    pub backdate: Duration,
    pub key_usage: Vec<KeyUsage>,
    pub extended_key_usage: Vec<ExtendedKeyUsage>,
    pub allowed_extended_key_usage: Vec<ExtendedKeyUsage>,
}

impl IssuancePolicy {
    pub fn for_type(cert_type: CertType) -> Self {
        let (key_usage, extended_key_usage) = cert_type.default_usages();
        Self {
            validity: Duration::days(90),
            backdate: Duration::minutes(1),
            key_usage,
            allowed_extended_key_usage: extended_key_usage.clone(),
            extended_key_usage,
        }
    }

    pub fn server() -> Self {
        Self::for_type(CertType::Server)
    }

    pub fn client() -> Self {
        Self::for_type(CertType::Client)
    }

    pub fn mutual() -> Self {
        Self::for_type(CertType::Both)
    }

    pub fn with_validity(mut self, validity: Duration) -> Self {
        self.validity = validity;
        self
    }

    pub fn with_backdate(mut self, backdate: Duration) -> Self {
        self.backdate = backdate;
        self
    }

    pub fn with_allowed_usage(mut self, eku: ExtendedKeyUsage) -> Self {
        if !self.allowed_extended_key_usage.contains(&eku) {
            self.allowed_extended_key_usage.push(eku);
        }
        self
    }

    fn check(&self, csr: &CertificateSigningRequest) -> Result<()> {
        if csr.requests_ca() {
            return Err(Error::PolicyViolation(format!(
                "'{}' requests CA status",
                csr.subject().common_name
            )));
        }
        if let Some(oid) = csr.unrecognized_extended_key_usage().first() {
            return Err(Error::PolicyViolation(format!(
                "extended key usage {} is not permitted",
                oid
            )));
        }
        if let Some(eku) = csr
            .requested_extended_key_usage()
            .iter()
            .find(|eku| !self.allowed_extended_key_usage.contains(eku))
        {
            return Err(Error::PolicyViolation(format!(
                "extended key usage '{}' is not permitted",
                eku.name()
            )));
        }
        Ok(())
    }

    fn check_template(&self, template: &CertificateTemplate) -> Result<()> {
        if template.is_ca {
            return Err(Error::PolicyViolation(format!(
                "'{}' is a CA template",
                template.subject
            )));
        }
        if let Some(ku) = template
            .key_usage
            .iter()
            .find(|ku| !self.key_usage.contains(ku))
        {
            return Err(Error::PolicyViolation(format!(
                "key usage '{}' is not permitted",
                ku.name()
            )));
        }
        if let Some(eku) = template
            .extended_key_usage
            .iter()
            .find(|eku| !self.allowed_extended_key_usage.contains(eku))
        {
            return Err(Error::PolicyViolation(format!(
                "extended key usage '{}' is not permitted",
                eku.name()
            )));
        }
        if template.not_after - template.not_before > self.validity + self.backdate {
            return Err(Error::PolicyViolation(format!(
                "validity of '{}' exceeds {} days",
                template.subject,
                self.validity.num_days()
            )));
        }
        Ok(())
    }
}

impl Default for IssuancePolicy {
    fn default() -> Self {
        Self::server()
    }
}

#[derive(Debug, Clone, Default)]
pub struct CertificateIssuer {
    policy: IssuancePolicy,
}

impl CertificateIssuer {
    pub fn new(policy: IssuancePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &IssuancePolicy {
        &self.policy
    }

    /// Issues a certificate for a validated request.
    ///
    /// Only the subject and SAN are taken from the request. Serial, validity,
    /// key usage and extended key usage come from the authority and policy.
    pub fn issue_from_csr(
        &self,
        authority: &CertificateAuthority,
        csr: CertificateSigningRequest,
    ) -> Result<Certificate> {
        if let Err(e) = self.policy.check(&csr) {
            warn!(subject = %csr.subject(), error = %e, "rejected certificate request");
            return Err(e);
        }

        let subject_name = match csr.exact_subject() {
            Ok(name) => name,
            Err(e) => {
                warn!(subject = %csr.subject(), error = %e, "rejected certificate request");
                return Err(e);
            }
        };

        let now = truncate_to_seconds(Utc::now());
        let template = CertificateTemplate {
            subject: csr.subject().clone(),
            san: csr.subject_alt_names().clone(),
            not_before: now - self.policy.backdate,
            not_after: now + self.policy.validity,
            is_ca: false,
            key_usage: self.policy.key_usage.clone(),
            extended_key_usage: self.policy.extended_key_usage.clone(),
            serial_number: None,
            subject_name: Some(subject_name),
        };

        authority.sign(&template, csr.public_key())
    }

    /// Operator boundary: raw CSR bytes in, DER certificate out.
    pub fn issue(&self, authority: &CertificateAuthority, csr_bytes: &[u8]) -> Result<Vec<u8>> {
        let csr = CsrValidator::validate(csr_bytes)?;
        let certificate = self.issue_from_csr(authority, csr)?;
        Ok(certificate.der().to_vec())
    }

    /// Signs a caller-built leaf template for a locally generated key.
    ///
    /// The template is held to the same policy as a request: no CA bit, no
    /// usage outside the policy and no validity longer than it allows.
    pub fn issue_template(
        &self,
        authority: &CertificateAuthority,
        template: &CertificateTemplate,
        subject_key: &PublicKey,
    ) -> Result<Certificate> {
        if let Err(e) = self.policy.check_template(template) {
            warn!(subject = %template.subject, error = %e, "rejected certificate template");
            return Err(e);
        }
        authority.sign(template, subject_key)
    }

    /// Self-issuance of the authority's own root. Leaf certificates never
    /// come through here.
    pub fn issue_direct(
        &self,
        authority: &CertificateAuthority,
        template: &CertificateTemplate,
    ) -> Result<Certificate> {
        authority.reissue_root(template)
    }
}

pub struct CertificateBuilder {
    template: CertificateTemplate,
    policy: IssuancePolicy,
    curve: Curve,
}

impl CertificateBuilder {
    pub fn new(common_name: impl Into<String>, cert_type: CertType) -> Self {
        Self {
            template: CertificateTemplate::new(common_name, cert_type),
            policy: IssuancePolicy::for_type(cert_type).with_validity(Duration::days(365)),
            curve: Curve::P256,
        }
    }

    pub fn server(common_name: impl Into<String>) -> Self {
        Self::new(common_name, CertType::Server)
    }

    pub fn client(common_name: impl Into<String>) -> Self {
        Self::new(common_name, CertType::Client)
    }

    pub fn with_curve(mut self, curve: Curve) -> Self {
        self.curve = curve;
        self
    }

    pub fn with_subject(mut self, subject: DistinguishedName) -> Self {
        self.template = self.template.with_subject(subject);
        self
    }

    pub fn with_dns_san(mut self, dns: impl Into<String>) -> Self {
        self.template.san = self.template.san.with_dns(dns);
        self
    }

    pub fn with_dns_sans(mut self, dns_names: Vec<String>) -> Self {
        for dns in dns_names {
            self.template.san = self.template.san.with_dns(dns);
        }
        self
    }

    pub fn with_ip_san(mut self, ip: IpAddr) -> Self {
        self.template.san = self.template.san.with_ip(ip);
        self
    }

    pub fn with_validity_days(mut self, days: u32) -> Self {
        self.template = self.template.with_validity_days(days);
        self.policy = self.policy.with_validity(Duration::days(days as i64));
        self
    }

    pub fn with_policy(mut self, policy: IssuancePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Generates a key pair locally and has `ca` sign it under the builder's
    /// policy.
    pub fn issue(self, ca: &CertificateAuthority) -> Result<IssuedCertificate> {
        let key_pair = KeyPair::generate(self.curve)?;
        let certificate = CertificateIssuer::new(self.policy).issue_template(
            ca,
            &self.template,
            key_pair.public_key(),
        )?;

        Ok(IssuedCertificate {
            certificate,
            key_pair,
            chain: vec![ca.root().clone()],
        })
    }

    pub fn build(self) -> (CertificateTemplate, Curve) {
        (self.template, self.curve)
    }
}

#[derive(Debug)]
pub struct IssuedCertificate {
    pub certificate: Certificate,
    pub key_pair: KeyPair,
    pub chain: Vec<Certificate>,
}

impl IssuedCertificate {
    pub fn serial(&self) -> &SerialNumber {
        self.certificate.serial()
    }

    pub fn cert_pem(&self) -> String {
        self.certificate.to_pem()
    }

    pub fn key_pem(&self) -> Result<Zeroizing<String>> {
        self.key_pair.export_pem()
    }

    /// Leaf first, then its issuers.
    pub fn full_chain(&self) -> Vec<Certificate> {
        let mut chain = vec![self.certificate.clone()];
        chain.extend(self.chain.iter().cloned());
        chain
    }

    pub fn save_pem(&self, cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<()> {
        fs::write(cert_path, self.cert_pem())?;
        fs::write(key_path, self.key_pem()?.as_bytes())?;
        Ok(())
    }

    pub fn save_chain(&self, chain_path: impl AsRef<Path>) -> Result<()> {
        let full_chain: String = self.full_chain().iter().map(Certificate::to_pem).collect();
        fs::write(chain_path, full_chain)?;
        Ok(())
    }
}

pub fn issue_server_cert(
    ca: &CertificateAuthority,
    common_name: impl Into<String>,
    dns_names: Vec<String>,
    validity_days: u32,
) -> Result<IssuedCertificate> {
    CertificateBuilder::server(common_name)
        .with_validity_days(validity_days)
        .with_dns_sans(dns_names)
        .issue(ca)
}

pub fn issue_client_cert(
    ca: &CertificateAuthority,
    common_name: impl Into<String>,
    validity_days: u32,
) -> Result<IssuedCertificate> {
    CertificateBuilder::client(common_name)
        .with_validity_days(validity_days)
        .issue(ca)
}
