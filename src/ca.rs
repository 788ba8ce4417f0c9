use crate::backend::{BackendKind, InMemoryBackend, SignPurpose, SignerHandle, SigningBackend};
use crate::certificate::Certificate;
use crate::error::{Error, Result};
use crate::keys::{Digest, PublicKey, Signature};
use crate::types::{
    truncate_to_seconds, CertType, CertificateTemplate, Curve, DistinguishedName,
    RevocationReason, RevokedCertificate, SerialNumber,
};
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use rand::RngCore;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info};
use zeroize::Zeroizing;

const SERIAL_BYTES: usize = 16;

#[derive(Debug, Clone)]
pub struct AuthorityConfig {
    pub curve: Curve,
    /// Upper bound on waiting for and using the signing backend.
    pub signing_timeout: std::time::Duration,
    pub backdate: Duration,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            curve: Curve::P256,
            signing_timeout: std::time::Duration::from_secs(30),
            backdate: Duration::minutes(1),
        }
    }
}

impl AuthorityConfig {
    pub fn with_curve(mut self, curve: Curve) -> Self {
        self.curve = curve;
        self
    }

    pub fn with_signing_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.signing_timeout = timeout;
        self
    }

    pub fn with_backdate(mut self, backdate: Duration) -> Self {
        self.backdate = backdate;
        self
    }
}

/// A root certificate authority.
///
/// The private key lives behind a [`SigningBackend`]; every signature the
/// authority produces, including its own root, goes through one serialized
/// [`SignerHandle`]. Serials come from the OS RNG, never from callers.
pub struct CertificateAuthority {
    signer: SignerHandle,
    root: Certificate,
    config: AuthorityConfig,
    revoked: RwLock<HashMap<SerialNumber, RevokedCertificate>>,
}

impl CertificateAuthority {
    pub fn new(identity: DistinguishedName, validity: Duration) -> Result<Self> {
        Self::with_config(identity, validity, AuthorityConfig::default())
    }

    pub fn with_config(
        identity: DistinguishedName,
        validity: Duration,
        config: AuthorityConfig,
    ) -> Result<Self> {
        let backend = InMemoryBackend::generate(config.curve)?;
        Self::with_backend(identity, validity, Box::new(backend), config)
    }

    /// Builds and self-signs a root for the key held by `backend`, then
    /// installs the root into the backend.
    pub fn with_backend(
        identity: DistinguishedName,
        validity: Duration,
        backend: Box<dyn SigningBackend>,
        config: AuthorityConfig,
    ) -> Result<Self> {
        let signer = SignerHandle::new(backend, config.signing_timeout)?;

        let now = truncate_to_seconds(Utc::now());
        let template = CertificateTemplate::new(identity.common_name.clone(), CertType::RootCA)
            .with_subject(identity)
            .with_validity(now - config.backdate, now + validity);
        let root = Self::self_sign(&signer, &template, SignPurpose::SelfCertify)?;
        signer.install_certificate(&root)?;

        info!(
            subject = %root.subject(),
            serial = %root.serial(),
            backend = signer.kind().name(),
            "created certificate authority"
        );

        Ok(Self {
            signer,
            root,
            config,
            revoked: RwLock::new(HashMap::new()),
        })
    }

    fn self_sign(
        signer: &SignerHandle,
        template: &CertificateTemplate,
        purpose: SignPurpose,
    ) -> Result<Certificate> {
        template.validate()?;
        if !template.is_ca {
            return Err(Error::InvalidTemplate(
                "a self-issued certificate must be a CA template".into(),
            ));
        }

        let serial = Self::allocate_serial();
        let params = template.to_rcgen(&serial)?;

        let der = {
            let rcgen_signer = signer.rcgen_signer(purpose, signer.deadline());
            let cert = params
                .self_signed(&rcgen_signer)
                .map_err(|e| rcgen_signer.resolve(e))?;
            cert.der().to_vec()
        };

        let root = Certificate::from_der(&der)?;
        root.verify_signature(signer.public_key()).map_err(|e| {
            Error::Signature(format!("root self-signature does not verify: {}", e))
        })?;
        Ok(root)
    }

    /// Self-issues a new root certificate over the authority's existing key,
    /// e.g. to extend the root's validity ahead of a trust bundle rotation.
    ///
    /// The authority keeps signing under its current root; the returned
    /// certificate is for distribution only.
    pub fn reissue_root(&self, template: &CertificateTemplate) -> Result<Certificate> {
        let root = Self::self_sign(&self.signer, template, SignPurpose::Issue)?;
        info!(
            subject = %root.subject(),
            serial = %root.serial(),
            not_after = %root.not_after(),
            "reissued root certificate"
        );
        Ok(root)
    }

    pub fn from_pem(cert_pem: &str, key_pem: &str, config: AuthorityConfig) -> Result<Self> {
        let root = Certificate::from_pem(cert_pem)?;
        if !root.is_ca() {
            return Err(Error::InvalidInput(format!(
                "'{}' is not a CA certificate",
                root.subject()
            )));
        }

        let backend = InMemoryBackend::from_pem(key_pem)?;
        let signer = SignerHandle::new(Box::new(backend), config.signing_timeout)?;
        if root.public_key() != signer.public_key() {
            return Err(Error::InvalidInput(
                "private key does not match the root certificate".into(),
            ));
        }
        root.verify_issued_by(&root)?;

        info!(subject = %root.subject(), serial = %root.serial(), "loaded certificate authority");
        Ok(Self {
            signer,
            root,
            config,
            revoked: RwLock::new(HashMap::new()),
        })
    }

    pub fn load_pem(
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
        config: AuthorityConfig,
    ) -> Result<Self> {
        let cert_pem = fs::read_to_string(cert_path)?;
        let key_pem = Zeroizing::new(fs::read_to_string(key_path)?);
        Self::from_pem(&cert_pem, &key_pem, config)
    }

    pub fn save_pem(&self, cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<()> {
        let key_pem = self.export_key_pem()?;
        fs::write(cert_path, self.root_pem())?;
        fs::write(key_path, key_pem.as_bytes())?;
        Ok(())
    }

    /// Explicit export of the root private key. Only in-memory backends allow it.
    pub fn export_key_pem(&self) -> Result<Zeroizing<String>> {
        self.signer.export_pem()
    }

    /// 128 random bits from the OS RNG. Needs no coordination between callers.
    pub fn allocate_serial() -> SerialNumber {
        loop {
            let mut bytes = [0u8; SERIAL_BYTES];
            rand::rngs::OsRng.fill_bytes(&mut bytes);
            let serial = SerialNumber::from_be_bytes(&bytes);
            if !serial.is_zero() {
                return serial;
            }
        }
    }

    pub fn sign(
        &self,
        template: &CertificateTemplate,
        subject_key: &PublicKey,
    ) -> Result<Certificate> {
        self.sign_with_deadline(template, subject_key, self.signer.deadline())
    }

    /// Signs a leaf certificate for `subject_key`.
    ///
    /// Any serial on the template is replaced. The result is parsed back and
    /// verified against the root before it is returned.
    pub fn sign_with_deadline(
        &self,
        template: &CertificateTemplate,
        subject_key: &PublicKey,
        deadline: Instant,
    ) -> Result<Certificate> {
        template.validate()?;
        if template.is_ca {
            return Err(Error::InvalidTemplate(
                "the authority does not issue CA certificates".into(),
            ));
        }
        if let Some(requested) = &template.serial_number {
            debug!(requested = %requested, "ignoring caller-supplied serial");
        }

        let serial = Self::allocate_serial();
        let params = template.to_rcgen(&serial)?;

        let der = {
            let rcgen_signer = self.signer.rcgen_signer(SignPurpose::Issue, deadline);
            let issuer =
                rcgen::Issuer::from_ca_cert_der(self.root.certificate_der(), &rcgen_signer)?;
            let cert = params
                .signed_by(subject_key, &issuer)
                .map_err(|e| rcgen_signer.resolve(e))?;
            cert.der().to_vec()
        };

        let certificate = Certificate::from_der(&der)?;
        certificate.verify_issued_by(&self.root).map_err(|e| {
            Error::Signature(format!("issued certificate failed verification: {}", e))
        })?;

        info!(
            subject = %certificate.subject(),
            serial = %certificate.serial(),
            not_after = %certificate.not_after(),
            "issued certificate"
        );
        Ok(certificate)
    }

    pub(crate) fn sign_digest(&self, digest: &Digest) -> Result<Signature> {
        self.signer
            .sign_digest(digest, SignPurpose::Issue, self.signer.deadline())
    }

    pub fn issued(&self, certificate: &Certificate) -> bool {
        certificate.verify_issued_by(&self.root).is_ok()
    }

    pub fn revoke(
        &self,
        serial: &SerialNumber,
        reason: RevocationReason,
    ) -> Result<RevokedCertificate> {
        self.revoke_at(serial, reason, Utc::now())
    }

    pub fn revoke_at(
        &self,
        serial: &SerialNumber,
        reason: RevocationReason,
        at: DateTime<Utc>,
    ) -> Result<RevokedCertificate> {
        let mut revoked = self.revoked.write();
        if revoked.contains_key(serial) {
            return Err(Error::AlreadyRevoked(serial.to_hex()));
        }

        let entry = RevokedCertificate {
            serial_number: serial.clone(),
            revocation_time: truncate_to_seconds(at),
            reason,
        };
        revoked.insert(serial.clone(), entry.clone());

        info!(serial = %serial, ?reason, "revoked certificate");
        Ok(entry)
    }

    pub fn revocation_status(&self, serial: &SerialNumber) -> Option<RevokedCertificate> {
        self.revoked.read().get(serial).cloned()
    }

    pub fn revoked_certificates(&self) -> Vec<RevokedCertificate> {
        let mut list: Vec<_> = self.revoked.read().values().cloned().collect();
        list.sort_by_key(|r| r.revocation_time);
        list
    }

    pub fn root(&self) -> &Certificate {
        &self.root
    }

    pub fn root_pem(&self) -> String {
        self.root.to_pem()
    }

    pub fn public_key(&self) -> &PublicKey {
        self.signer.public_key()
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.signer.kind()
    }

    pub fn config(&self) -> &AuthorityConfig {
        &self.config
    }
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("root", &self.root)
            .field("signer", &self.signer)
            .finish_non_exhaustive()
    }
}
