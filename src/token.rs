//! Hardware token signing backend.
//!
//! A [`TokenBackend`] drives a PIV-style device through
//! `Unprovisioned -> KeyGenerated -> CertificateLoaded`. Only self-certifying
//! signatures are allowed before the root certificate is loaded; issuing
//! signatures only after. The session is released on every exit path.

use crate::backend::{BackendKind, SignPurpose, SigningBackend};
use crate::certificate::Certificate;
use crate::error::{Error, Result};
use crate::keys::{Digest, KeyPair, PublicKey, Signature};
use crate::types::Curve;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

const DEFAULT_PIN: &str = "123456";
const DEFAULT_MANAGEMENT_KEY: [u8; 24] = [
    0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07,
    0x08, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08,
];
const PIN_RETRIES: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Slot {
    Authentication,
    #[default]
    Signature,
    KeyManagement,
    CardAuthentication,
}

impl Slot {
    pub fn id(&self) -> u8 {
        match self {
            Slot::Authentication => 0x9a,
            Slot::Signature => 0x9c,
            Slot::KeyManagement => 0x9d,
            Slot::CardAuthentication => 0x9e,
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}", self.id())
    }
}

impl std::str::FromStr for Slot {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().trim_start_matches("0x") {
            "9a" | "authentication" => Ok(Slot::Authentication),
            "9c" | "signature" => Ok(Slot::Signature),
            "9d" | "key-management" => Ok(Slot::KeyManagement),
            "9e" | "card-authentication" => Ok(Slot::CardAuthentication),
            _ => Err(Error::InvalidInput(format!("Unknown PIV slot: {}", s))),
        }
    }
}

pub struct TokenCredentials {
    pin: Zeroizing<String>,
    management_key: Zeroizing<Vec<u8>>,
}

impl TokenCredentials {
    pub fn new(pin: impl Into<String>, management_key: Vec<u8>) -> Self {
        Self {
            pin: Zeroizing::new(pin.into()),
            management_key: Zeroizing::new(management_key),
        }
    }

    pub fn with_pin(mut self, pin: impl Into<String>) -> Self {
        self.pin = Zeroizing::new(pin.into());
        self
    }

    pub fn pin(&self) -> &str {
        &self.pin
    }

    pub fn management_key(&self) -> &[u8] {
        &self.management_key
    }
}

impl Default for TokenCredentials {
    fn default() -> Self {
        Self::new(DEFAULT_PIN, DEFAULT_MANAGEMENT_KEY.to_vec())
    }
}

impl fmt::Debug for TokenCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TokenCredentials { .. }")
    }
}

pub trait TokenDevice: Send {
    fn is_present(&self) -> bool;
    fn open_session(&mut self) -> Result<()>;
    fn close_session(&mut self);
    fn login(&mut self, pin: &str) -> Result<()>;
    fn logout(&mut self);
    fn authenticate(&mut self, management_key: &[u8]) -> Result<()>;
    fn deauthenticate(&mut self);
    fn generate_key(&mut self, slot: Slot, curve: Curve) -> Result<PublicKey>;
    fn sign_digest(&mut self, slot: Slot, digest: &Digest) -> Result<Signature>;
    fn store_certificate(&mut self, slot: Slot, der: &[u8]) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    Unprovisioned,
    KeyGenerated,
    CertificateLoaded,
}

/// Runs `release` on the device when dropped, unless disarmed.
struct DeviceGuard<'a, D: TokenDevice> {
    device: &'a mut D,
    release: fn(&mut D),
    armed: bool,
}

impl<'a, D: TokenDevice> DeviceGuard<'a, D> {
    fn new(device: &'a mut D, release: fn(&mut D)) -> Self {
        Self {
            device,
            release,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<D: TokenDevice> Drop for DeviceGuard<'_, D> {
    fn drop(&mut self) {
        if self.armed {
            (self.release)(self.device);
        }
    }
}

pub struct TokenBackend<D: TokenDevice> {
    device: D,
    slot: Slot,
    credentials: TokenCredentials,
    state: TokenState,
    public_key: Option<PublicKey>,
    session_open: bool,
}

impl<D: TokenDevice> TokenBackend<D> {
    /// Opens a session and verifies the PIN. If login fails the session is
    /// closed again before the error is returned.
    pub fn open(mut device: D, slot: Slot, credentials: TokenCredentials) -> Result<Self> {
        if !device.is_present() {
            return Err(Error::BackendUnavailable("token not present".into()));
        }

        device.open_session()?;
        {
            let guard = DeviceGuard::new(&mut device, D::close_session);
            guard.device.login(credentials.pin())?;
            guard.disarm();
        }

        debug!(slot = %slot, "token session opened");
        Ok(Self {
            device,
            slot,
            credentials,
            state: TokenState::Unprovisioned,
            public_key: None,
            session_open: true,
        })
    }

    /// Opens a session and generates a fresh key in `slot`.
    pub fn provision(
        device: D,
        slot: Slot,
        credentials: TokenCredentials,
        curve: Curve,
    ) -> Result<Self> {
        let mut backend = Self::open(device, slot, credentials)?;
        backend.generate_key(curve)?;
        Ok(backend)
    }

    pub fn generate_key(&mut self, curve: Curve) -> Result<PublicKey> {
        self.ensure_session()?;
        if self.state != TokenState::Unprovisioned {
            return Err(Error::InvalidInput(format!(
                "slot {} already holds a key",
                self.slot
            )));
        }

        let public_key = {
            let guard = DeviceGuard::new(&mut self.device, D::deauthenticate);
            guard
                .device
                .authenticate(self.credentials.management_key())?;
            guard.device.generate_key(self.slot, curve)?
        };

        info!(
            slot = %self.slot,
            key_id = %hex::encode(public_key.key_id()),
            "generated key on token"
        );
        self.public_key = Some(public_key.clone());
        self.state = TokenState::KeyGenerated;
        Ok(public_key)
    }

    pub fn state(&self) -> TokenState {
        self.state
    }

    pub fn slot(&self) -> Slot {
        self.slot
    }

    /// Logs out and closes the session. Dropping the backend does the same.
    pub fn close(mut self) {
        self.release_session();
    }

    fn ensure_session(&self) -> Result<()> {
        if !self.session_open {
            return Err(Error::BackendUnavailable("no active token session".into()));
        }
        if !self.device.is_present() {
            return Err(Error::BackendUnavailable("token removed".into()));
        }
        Ok(())
    }

    fn release_session(&mut self) {
        if self.session_open {
            self.device.logout();
            self.device.close_session();
            self.session_open = false;
            debug!(slot = %self.slot, "token session closed");
        }
    }
}

impl<D: TokenDevice> Drop for TokenBackend<D> {
    fn drop(&mut self) {
        self.release_session();
    }
}

impl<D: TokenDevice> fmt::Debug for TokenBackend<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenBackend")
            .field("slot", &self.slot)
            .field("state", &self.state)
            .field("session_open", &self.session_open)
            .finish_non_exhaustive()
    }
}

impl<D: TokenDevice> SigningBackend for TokenBackend<D> {
    fn kind(&self) -> BackendKind {
        BackendKind::HardwareToken
    }

    fn public_key(&self) -> Result<PublicKey> {
        self.public_key.clone().ok_or_else(|| {
            Error::BackendUnavailable(format!("no key generated in slot {}", self.slot))
        })
    }

    fn sign(
        &mut self,
        digest: &Digest,
        purpose: SignPurpose,
        deadline: Instant,
    ) -> Result<Signature> {
        if Instant::now() >= deadline {
            return Err(Error::Timeout("deadline passed before token signing".into()));
        }
        self.ensure_session()?;

        match (self.state, purpose) {
            (TokenState::KeyGenerated, SignPurpose::SelfCertify)
            | (TokenState::CertificateLoaded, SignPurpose::Issue) => {}
            (state, purpose) => {
                return Err(Error::BackendUnavailable(format!(
                    "slot {} is {:?}; cannot sign for {:?}",
                    self.slot, state, purpose
                )))
            }
        }

        self.device.sign_digest(self.slot, digest)
    }

    fn install_certificate(&mut self, certificate: &Certificate) -> Result<()> {
        self.ensure_session()?;
        if self.state != TokenState::KeyGenerated {
            return Err(Error::BackendUnavailable(format!(
                "slot {} is {:?}; expected a freshly generated key",
                self.slot, self.state
            )));
        }
        if Some(certificate.public_key()) != self.public_key.as_ref() {
            return Err(Error::InvalidInput(
                "certificate does not match the key in the token slot".into(),
            ));
        }

        {
            let guard = DeviceGuard::new(&mut self.device, D::deauthenticate);
            guard
                .device
                .authenticate(self.credentials.management_key())?;
            guard.device.store_certificate(self.slot, certificate.der())?;
        }

        self.state = TokenState::CertificateLoaded;
        info!(
            slot = %self.slot,
            serial = %certificate.serial(),
            "root certificate loaded on token"
        );
        Ok(())
    }
}

/// Counters and switches shared between a [`SoftToken`] and the test or
/// operator that owns it.
#[derive(Debug, Clone)]
pub struct TokenProbe {
    inner: Arc<ProbeState>,
}

#[derive(Debug)]
struct ProbeState {
    present: AtomicBool,
    open_sessions: AtomicUsize,
    signatures: AtomicUsize,
    sign_delay_ms: AtomicU64,
}

impl TokenProbe {
    fn new() -> Self {
        Self {
            inner: Arc::new(ProbeState {
                present: AtomicBool::new(true),
                open_sessions: AtomicUsize::new(0),
                signatures: AtomicUsize::new(0),
                sign_delay_ms: AtomicU64::new(0),
            }),
        }
    }

    pub fn unplug(&self) {
        self.inner.present.store(false, Ordering::SeqCst);
    }

    pub fn plug(&self) {
        self.inner.present.store(true, Ordering::SeqCst);
    }

    pub fn is_present(&self) -> bool {
        self.inner.present.load(Ordering::SeqCst)
    }

    pub fn open_sessions(&self) -> usize {
        self.inner.open_sessions.load(Ordering::SeqCst)
    }

    pub fn signatures(&self) -> usize {
        self.inner.signatures.load(Ordering::SeqCst)
    }

    pub fn set_sign_delay(&self, delay: Duration) {
        self.inner
            .sign_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    fn sign_delay(&self) -> Duration {
        Duration::from_millis(self.inner.sign_delay_ms.load(Ordering::SeqCst))
    }
}

struct SoftSlot {
    key: KeyPair,
    certificate: Option<Vec<u8>>,
}

/// Software stand-in for a PIV token. Keys never leave the struct; the
/// behavior around PINs, management-key authentication and sessions follows
/// what a real device enforces.
pub struct SoftToken {
    pin: Zeroizing<String>,
    management_key: Zeroizing<Vec<u8>>,
    pin_retries: u8,
    session: bool,
    logged_in: bool,
    authenticated: bool,
    slots: HashMap<Slot, SoftSlot>,
    probe: TokenProbe,
}

impl SoftToken {
    pub fn new() -> Self {
        let defaults = TokenCredentials::default();
        Self::with_credentials(&defaults)
    }

    pub fn with_credentials(credentials: &TokenCredentials) -> Self {
        Self {
            pin: Zeroizing::new(credentials.pin().to_string()),
            management_key: Zeroizing::new(credentials.management_key().to_vec()),
            pin_retries: PIN_RETRIES,
            session: false,
            logged_in: false,
            authenticated: false,
            slots: HashMap::new(),
            probe: TokenProbe::new(),
        }
    }

    pub fn probe(&self) -> TokenProbe {
        self.probe.clone()
    }

    pub fn certificate(&self, slot: Slot) -> Option<&[u8]> {
        self.slots
            .get(&slot)
            .and_then(|s| s.certificate.as_deref())
    }

    fn require_present(&self) -> Result<()> {
        if self.probe.is_present() {
            Ok(())
        } else {
            Err(Error::BackendUnavailable("token not present".into()))
        }
    }

    fn require_session(&self) -> Result<()> {
        self.require_present()?;
        if !self.session {
            return Err(Error::BackendUnavailable("no open session".into()));
        }
        Ok(())
    }
}

impl Default for SoftToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SoftToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftToken")
            .field("session", &self.session)
            .field("logged_in", &self.logged_in)
            .field("slots", &self.slots.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl TokenDevice for SoftToken {
    fn is_present(&self) -> bool {
        self.probe.is_present()
    }

    fn open_session(&mut self) -> Result<()> {
        self.require_present()?;
        if !self.session {
            self.session = true;
            self.probe.inner.open_sessions.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn close_session(&mut self) {
        if self.session {
            self.session = false;
            self.logged_in = false;
            self.authenticated = false;
            self.probe.inner.open_sessions.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn login(&mut self, pin: &str) -> Result<()> {
        self.require_session()?;
        if self.pin_retries == 0 {
            return Err(Error::BackendUnavailable("PIN blocked".into()));
        }
        if pin != self.pin.as_str() {
            self.pin_retries -= 1;
            warn!(retries_left = self.pin_retries, "incorrect token PIN");
            return Err(Error::InvalidInput(format!(
                "incorrect PIN, {} retries left",
                self.pin_retries
            )));
        }
        self.pin_retries = PIN_RETRIES;
        self.logged_in = true;
        Ok(())
    }

    fn logout(&mut self) {
        self.logged_in = false;
    }

    fn authenticate(&mut self, management_key: &[u8]) -> Result<()> {
        self.require_session()?;
        if management_key != self.management_key.as_slice() {
            return Err(Error::InvalidInput("management key rejected".into()));
        }
        self.authenticated = true;
        Ok(())
    }

    fn deauthenticate(&mut self) {
        self.authenticated = false;
    }

    fn generate_key(&mut self, slot: Slot, curve: Curve) -> Result<PublicKey> {
        self.require_session()?;
        if !self.authenticated {
            return Err(Error::BackendUnavailable(
                "management key authentication required".into(),
            ));
        }
        let key = KeyPair::generate(curve)?;
        let public_key = key.public_key().clone();
        self.slots.insert(
            slot,
            SoftSlot {
                key,
                certificate: None,
            },
        );
        Ok(public_key)
    }

    fn sign_digest(&mut self, slot: Slot, digest: &Digest) -> Result<Signature> {
        self.require_session()?;
        if !self.logged_in {
            return Err(Error::BackendUnavailable("PIN not verified".into()));
        }
        let entry = self
            .slots
            .get(&slot)
            .ok_or_else(|| Error::BackendUnavailable(format!("slot {} is empty", slot)))?;

        let delay = self.probe.sign_delay();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        let signature = entry.key.sign_digest(digest)?;
        self.probe.inner.signatures.fetch_add(1, Ordering::SeqCst);
        Ok(signature)
    }

    fn store_certificate(&mut self, slot: Slot, der: &[u8]) -> Result<()> {
        self.require_session()?;
        if !self.authenticated {
            return Err(Error::BackendUnavailable(
                "management key authentication required".into(),
            ));
        }
        let entry = self
            .slots
            .get_mut(&slot)
            .ok_or_else(|| Error::BackendUnavailable(format!("slot {} is empty", slot)))?;
        entry.certificate = Some(der.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    #[test]
    fn test_unprovisioned_token_cannot_sign() {
        let mut backend =
            TokenBackend::open(SoftToken::new(), Slot::Signature, TokenCredentials::default())
                .unwrap();
        assert_eq!(backend.state(), TokenState::Unprovisioned);
        assert!(matches!(
            backend.public_key(),
            Err(Error::BackendUnavailable(_))
        ));

        let digest = Digest::sha256(b"root tbs");
        for purpose in [SignPurpose::SelfCertify, SignPurpose::Issue] {
            assert!(matches!(
                backend.sign(&digest, purpose, far_deadline()),
                Err(Error::BackendUnavailable(_))
            ));
        }
    }

    #[test]
    fn test_key_generated_allows_only_self_certify() {
        let mut backend = TokenBackend::provision(
            SoftToken::new(),
            Slot::Signature,
            TokenCredentials::default(),
            Curve::P256,
        )
        .unwrap();
        assert_eq!(backend.state(), TokenState::KeyGenerated);

        let digest = Digest::sha256(b"root tbs");
        let sig = backend
            .sign(&digest, SignPurpose::SelfCertify, far_deadline())
            .unwrap();
        assert!(backend
            .public_key()
            .unwrap()
            .verify_digest(&digest, sig.as_bytes())
            .is_ok());

        assert!(matches!(
            backend.sign(&digest, SignPurpose::Issue, far_deadline()),
            Err(Error::BackendUnavailable(_))
        ));
    }

    #[test]
    fn test_second_key_generation_rejected() {
        let mut backend = TokenBackend::provision(
            SoftToken::new(),
            Slot::Signature,
            TokenCredentials::default(),
            Curve::P256,
        )
        .unwrap();
        assert!(matches!(
            backend.generate_key(Curve::P256),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_wrong_pin_closes_session() {
        let token = SoftToken::new();
        let probe = token.probe();
        let credentials = TokenCredentials::default().with_pin("000000");

        let err = TokenBackend::open(token, Slot::Signature, credentials).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert_eq!(probe.open_sessions(), 0);
    }

    #[test]
    fn test_unplugged_token_is_unavailable() {
        let token = SoftToken::new();
        let probe = token.probe();
        let mut backend = TokenBackend::provision(
            token,
            Slot::Signature,
            TokenCredentials::default(),
            Curve::P256,
        )
        .unwrap();

        probe.unplug();
        let err = backend
            .sign(
                &Digest::sha256(b"x"),
                SignPurpose::SelfCertify,
                far_deadline(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::BackendUnavailable(_)));
        assert!(err.is_retryable());

        probe.plug();
        assert!(backend
            .sign(
                &Digest::sha256(b"x"),
                SignPurpose::SelfCertify,
                far_deadline()
            )
            .is_ok());
    }

    #[test]
    fn test_session_released_on_drop_and_close() {
        let token = SoftToken::new();
        let probe = token.probe();
        let backend =
            TokenBackend::open(token, Slot::Signature, TokenCredentials::default()).unwrap();
        assert_eq!(probe.open_sessions(), 1);
        drop(backend);
        assert_eq!(probe.open_sessions(), 0);

        let token = SoftToken::new();
        let probe = token.probe();
        let backend =
            TokenBackend::open(token, Slot::Signature, TokenCredentials::default()).unwrap();
        backend.close();
        assert_eq!(probe.open_sessions(), 0);
    }

    #[test]
    fn test_expired_deadline_is_timeout() {
        let mut backend = TokenBackend::provision(
            SoftToken::new(),
            Slot::Signature,
            TokenCredentials::default(),
            Curve::P256,
        )
        .unwrap();
        let past = Instant::now();
        std::thread::sleep(Duration::from_millis(2));
        assert!(matches!(
            backend.sign(&Digest::sha256(b"x"), SignPurpose::SelfCertify, past),
            Err(Error::Timeout(_))
        ));
    }

    #[test]
    fn test_slot_parsing() {
        assert_eq!("9c".parse::<Slot>().unwrap(), Slot::Signature);
        assert_eq!("0x9A".parse::<Slot>().unwrap(), Slot::Authentication);
        assert!("9f".parse::<Slot>().is_err());
        assert_eq!(Slot::KeyManagement.to_string(), "9d");
    }
}
