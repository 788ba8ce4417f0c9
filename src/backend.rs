//! Signing backends and the serialized signer handle shared by the
//! authority and the OCSP responder.

use crate::certificate::Certificate;
use crate::error::{Error, Result};
use crate::keys::{Digest, KeyPair, PublicKey, Signature};
use crate::types::Curve;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use zeroize::Zeroizing;

/// Why the authority is asking for a signature. Hardware tokens only allow
/// `SelfCertify` before the root certificate is installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignPurpose {
    SelfCertify,
    Issue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    InMemory,
    HardwareToken,
}

impl BackendKind {
    pub fn name(&self) -> &'static str {
        match self {
            BackendKind::InMemory => "in-memory",
            BackendKind::HardwareToken => "hardware-token",
        }
    }
}

/// Something that holds a private key and can sign digests with it.
///
/// Backends are never shared directly; the authority wraps one in a
/// [`SignerHandle`] which serializes every call.
pub trait SigningBackend: Send {
    fn kind(&self) -> BackendKind;

    fn public_key(&self) -> Result<PublicKey>;

    fn sign(&mut self, digest: &Digest, purpose: SignPurpose, deadline: Instant)
        -> Result<Signature>;

    /// Called once the root certificate for this key exists.
    fn install_certificate(&mut self, _certificate: &Certificate) -> Result<()> {
        Ok(())
    }

    /// Explicit private-key export. Most backends refuse.
    fn export_pem(&self) -> Result<Zeroizing<String>> {
        Err(Error::InvalidInput(format!(
            "{} backend does not export private keys",
            self.kind().name()
        )))
    }
}

pub struct InMemoryBackend {
    key: KeyPair,
}

impl InMemoryBackend {
    pub fn generate(curve: Curve) -> Result<Self> {
        Ok(Self {
            key: KeyPair::generate(curve)?,
        })
    }

    pub fn from_key_pair(key: KeyPair) -> Self {
        Self { key }
    }

    pub fn from_pem(pem_str: &str) -> Result<Self> {
        Ok(Self {
            key: KeyPair::from_pem(pem_str)?,
        })
    }
}

impl fmt::Debug for InMemoryBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryBackend")
            .field("public_key", self.key.public_key())
            .finish_non_exhaustive()
    }
}

impl SigningBackend for InMemoryBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::InMemory
    }

    fn public_key(&self) -> Result<PublicKey> {
        Ok(self.key.public_key().clone())
    }

    fn sign(
        &mut self,
        digest: &Digest,
        _purpose: SignPurpose,
        _deadline: Instant,
    ) -> Result<Signature> {
        self.key.sign_digest(digest)
    }

    fn export_pem(&self) -> Result<Zeroizing<String>> {
        self.key.export_pem()
    }
}

/// Shared access to a [`SigningBackend`] with at most one signature in
/// flight. Waiting for the lock is bounded by the caller's deadline.
#[derive(Clone)]
pub struct SignerHandle {
    backend: Arc<Mutex<Box<dyn SigningBackend>>>,
    public_key: PublicKey,
    kind: BackendKind,
    timeout: Duration,
}

impl SignerHandle {
    pub fn new(backend: Box<dyn SigningBackend>, timeout: Duration) -> Result<Self> {
        let public_key = backend.public_key()?;
        let kind = backend.kind();
        Ok(Self {
            backend: Arc::new(Mutex::new(backend)),
            public_key,
            kind,
            timeout,
        })
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn deadline(&self) -> Instant {
        Instant::now() + self.timeout
    }

    pub fn sign_digest(
        &self,
        digest: &Digest,
        purpose: SignPurpose,
        deadline: Instant,
    ) -> Result<Signature> {
        let mut backend = self.backend.try_lock_until(deadline).ok_or_else(|| {
            warn!(backend = self.kind.name(), "timed out waiting for signer");
            Error::Timeout("waiting for the signing backend".into())
        })?;

        let result = backend.sign(digest, purpose, deadline);
        drop(backend);

        let signature = result?;
        if Instant::now() > deadline {
            warn!(backend = self.kind.name(), "signature completed after deadline");
            return Err(Error::Timeout("signing backend overran the deadline".into()));
        }

        debug!(backend = self.kind.name(), ?purpose, "digest signed");
        Ok(signature)
    }

    pub(crate) fn install_certificate(&self, certificate: &Certificate) -> Result<()> {
        self.backend.lock().install_certificate(certificate)
    }

    pub(crate) fn export_pem(&self) -> Result<Zeroizing<String>> {
        self.backend.lock().export_pem()
    }

    pub(crate) fn rcgen_signer(&self, purpose: SignPurpose, deadline: Instant) -> RcgenSigner<'_> {
        RcgenSigner {
            handle: self,
            purpose,
            deadline,
            failure: Mutex::new(None),
        }
    }
}

impl fmt::Debug for SignerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignerHandle")
            .field("kind", &self.kind)
            .field("public_key", &self.public_key)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Adapter handing a [`SignerHandle`] to rcgen.
///
/// rcgen only understands its own error type, so the typed failure is parked
/// here and recovered with [`RcgenSigner::resolve`].
pub(crate) struct RcgenSigner<'a> {
    handle: &'a SignerHandle,
    purpose: SignPurpose,
    deadline: Instant,
    failure: Mutex<Option<Error>>,
}

impl RcgenSigner<'_> {
    pub(crate) fn resolve(&self, err: rcgen::Error) -> Error {
        self.failure.lock().take().unwrap_or_else(|| err.into())
    }
}

impl rcgen::PublicKeyData for RcgenSigner<'_> {
    fn der_bytes(&self) -> &[u8] {
        self.handle.public_key.sec1_bytes()
    }

    fn algorithm(&self) -> &'static rcgen::SignatureAlgorithm {
        Curve::P256.signature_algorithm()
    }
}

impl rcgen::SigningKey for RcgenSigner<'_> {
    fn sign(&self, msg: &[u8]) -> std::result::Result<Vec<u8>, rcgen::Error> {
        match self
            .handle
            .sign_digest(&Digest::sha256(msg), self.purpose, self.deadline)
        {
            Ok(signature) => Ok(signature.into_vec()),
            Err(e) => {
                *self.failure.lock() = Some(e);
                Err(rcgen::Error::RemoteKeyError)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;

    struct SlowBackend {
        inner: InMemoryBackend,
        delay: Duration,
    }

    impl SigningBackend for SlowBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::InMemory
        }

        fn public_key(&self) -> Result<PublicKey> {
            self.inner.public_key()
        }

        fn sign(
            &mut self,
            digest: &Digest,
            purpose: SignPurpose,
            deadline: Instant,
        ) -> Result<Signature> {
            thread::sleep(self.delay);
            self.inner.sign(digest, purpose, deadline)
        }
    }

    fn slow_handle(delay: Duration) -> SignerHandle {
        let backend = SlowBackend {
            inner: InMemoryBackend::generate(Curve::P256).unwrap(),
            delay,
        };
        SignerHandle::new(Box::new(backend), Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_handle_signs_with_backend_key() {
        let handle = SignerHandle::new(
            Box::new(InMemoryBackend::generate(Curve::P256).unwrap()),
            Duration::from_secs(1),
        )
        .unwrap();
        let digest = Digest::sha256(b"hello");
        let sig = handle
            .sign_digest(&digest, SignPurpose::Issue, handle.deadline())
            .unwrap();
        assert!(handle
            .public_key()
            .verify_digest(&digest, sig.as_bytes())
            .is_ok());
    }

    #[test]
    fn test_overrun_reports_timeout_and_releases_lock() {
        let handle = slow_handle(Duration::from_millis(50));
        let digest = Digest::sha256(b"slow");

        let deadline = Instant::now() + Duration::from_millis(10);
        let err = handle
            .sign_digest(&digest, SignPurpose::Issue, deadline)
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));

        // lock is free again
        let sig = handle.sign_digest(&digest, SignPurpose::Issue, handle.deadline());
        assert!(sig.is_ok());
    }

    #[test]
    fn test_waiter_times_out_while_lock_held() {
        let handle = slow_handle(Duration::from_millis(300));
        let holder = handle.clone();
        let (started_tx, started_rx) = mpsc::channel();

        let worker = thread::spawn(move || {
            started_tx.send(()).unwrap();
            holder.sign_digest(
                &Digest::sha256(b"first"),
                SignPurpose::Issue,
                Instant::now() + Duration::from_secs(5),
            )
        });

        started_rx.recv().unwrap();
        thread::sleep(Duration::from_millis(50));
        let err = handle
            .sign_digest(
                &Digest::sha256(b"second"),
                SignPurpose::Issue,
                Instant::now() + Duration::from_millis(20),
            )
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));

        assert!(worker.join().unwrap().is_ok());
    }

    #[test]
    fn test_concurrent_signers_are_serialized() {
        let handle = SignerHandle::new(
            Box::new(InMemoryBackend::generate(Curve::P256).unwrap()),
            Duration::from_secs(5),
        )
        .unwrap();

        let workers: Vec<_> = (0..8)
            .map(|i| {
                let handle = handle.clone();
                thread::spawn(move || {
                    let digest = Digest::sha256(format!("msg-{}", i).as_bytes());
                    let sig = handle
                        .sign_digest(&digest, SignPurpose::Issue, handle.deadline())
                        .unwrap();
                    handle
                        .public_key()
                        .verify_digest(&digest, sig.as_bytes())
                        .is_ok()
                })
            })
            .collect();

        for worker in workers {
            assert!(worker.join().unwrap());
        }
    }

    #[test]
    fn test_debug_is_redacted() {
        let backend = InMemoryBackend::generate(Curve::P256).unwrap();
        let pem = backend.export_pem().unwrap();
        let debug = format!("{:?}", backend);
        assert!(!debug.contains(pem.lines().nth(1).unwrap()));
    }
}
