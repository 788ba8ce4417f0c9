//! Serving-side staple distribution.
//!
//! [`StapleStore`] keeps, per server name, the certificate chain, the leaf key
//! and the current OCSP staple, and hands them to rustls through
//! [`ResolvesServerCert`]. Updates replace a whole entry, so a handshake
//! never pairs a certificate with another certificate's staple.

use crate::ca::CertificateAuthority;
use crate::certificate::Certificate;
use crate::error::{Error, Result};
use crate::keys::KeyPair;
use crate::ocsp::OcspResponse;
use crate::responder::OcspResponder;
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::{CertifiedKey, SigningKey};
use std::collections::HashMap;
use std::fmt;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

struct Entry {
    chain: Vec<Certificate>,
    signing_key: Arc<dyn SigningKey>,
    certified: Arc<CertifiedKey>,
    staple: Option<Vec<u8>>,
    next_update: Option<DateTime<Utc>>,
}

impl Entry {
    fn new(
        chain: Vec<Certificate>,
        signing_key: Arc<dyn SigningKey>,
        staple: Option<Vec<u8>>,
    ) -> Result<Self> {
        let next_update = match &staple {
            Some(der) => staple_next_update(&chain, der)?,
            None => None,
        };
        let mut certified = CertifiedKey::new(
            chain.iter().map(|c| c.certificate_der().clone()).collect(),
            Arc::clone(&signing_key),
        );
        certified.ocsp = staple.clone();

        Ok(Self {
            chain,
            signing_key,
            certified: Arc::new(certified),
            staple,
            next_update,
        })
    }

    fn with_staple(&self, staple: Vec<u8>) -> Result<Self> {
        Self::new(self.chain.clone(), Arc::clone(&self.signing_key), Some(staple))
    }

    fn leaf(&self) -> &Certificate {
        &self.chain[0]
    }
}

/// nextUpdate of the response that covers the leaf.
fn staple_next_update(chain: &[Certificate], der: &[u8]) -> Result<Option<DateTime<Utc>>> {
    let response = OcspResponse::parse(der)?;
    let single = match chain.get(1) {
        Some(issuer) => response.response_for(issuer, &chain[0]),
        None => response
            .responses()
            .iter()
            .find(|single| single.cert_id.serial == *chain[0].serial()),
    };
    single
        .map(|single| single.next_update)
        .ok_or_else(|| Error::OcspNoMatchingResponse(chain[0].serial().to_hex()))
}

pub struct StapleStore {
    entries: RwLock<HashMap<String, Arc<Entry>>>,
    default_name: RwLock<Option<String>>,
    refresh_margin: Duration,
}

impl Default for StapleStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StapleStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            default_name: RwLock::new(None),
            refresh_margin: Duration::minutes(5),
        }
    }

    /// Staples whose nextUpdate is closer than `margin` get rebuilt on refresh.
    pub fn with_refresh_margin(mut self, margin: Duration) -> Self {
        self.refresh_margin = margin;
        self
    }

    /// Registers `chain` (leaf first) under `name`. The first name
    /// registered also answers handshakes that carry no SNI.
    pub fn insert(
        &self,
        name: impl Into<String>,
        chain: Vec<Certificate>,
        key: &KeyPair,
        staple: Option<Vec<u8>>,
    ) -> Result<()> {
        let name = name.into();
        let leaf = chain
            .first()
            .ok_or_else(|| Error::InvalidInput(format!("empty chain for '{}'", name)))?;
        if leaf.public_key() != key.public_key() {
            return Err(Error::InvalidInput(format!(
                "key does not match the certificate for '{}'",
                name
            )));
        }

        let signing_key = rustls::crypto::ring::sign::any_ecdsa_type(&key.to_rustls_key()?)?;
        let entry = Entry::new(chain, signing_key, staple)?;
        debug!(name = %name, stapled = entry.staple.is_some(), "registered server certificate");

        self.entries.write().insert(name.clone(), Arc::new(entry));
        self.default_name.write().get_or_insert(name);
        Ok(())
    }

    pub fn set_default(&self, name: impl Into<String>) -> Result<()> {
        let name = name.into();
        if !self.entries.read().contains_key(&name) {
            return Err(Error::InvalidInput(format!("unknown server name '{}'", name)));
        }
        *self.default_name.write() = Some(name);
        Ok(())
    }

    pub fn remove(&self, name: &str) -> bool {
        let removed = self.entries.write().remove(name).is_some();
        let mut default_name = self.default_name.write();
        if default_name.as_deref() == Some(name) {
            *default_name = None;
        }
        removed
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.entries.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// The chain and current staple served for `name`.
    pub fn get(&self, name: &str) -> Option<(Vec<Certificate>, Option<Vec<u8>>)> {
        self.entries
            .read()
            .get(name)
            .map(|entry| (entry.chain.clone(), entry.staple.clone()))
    }

    /// Attaches `staple` to whatever chain is registered under `name` when
    /// the swap happens. A staple that does not cover that chain's leaf is
    /// rejected.
    pub fn update_staple(&self, name: &str, staple: Vec<u8>) -> Result<()> {
        loop {
            let current = self
                .entries
                .read()
                .get(name)
                .cloned()
                .ok_or_else(|| Error::InvalidInput(format!("unknown server name '{}'", name)))?;
            let next = current.with_staple(staple.clone())?;
            if self.replace_if_current(name, &current, next) {
                return Ok(());
            }
        }
    }

    /// Swaps in `next` only if `name` still maps to `expected`.
    fn replace_if_current(&self, name: &str, expected: &Arc<Entry>, next: Entry) -> bool {
        let mut entries = self.entries.write();
        match entries.get_mut(name) {
            Some(slot) if Arc::ptr_eq(slot, expected) => {
                *slot = Arc::new(next);
                true
            }
            _ => {
                debug!(name = %name, "entry changed while its staple was rebuilt");
                false
            }
        }
    }

    fn needs_refresh(&self, entry: &Entry, now: DateTime<Utc>) -> bool {
        match entry.next_update {
            Some(next_update) => next_update - self.refresh_margin <= now,
            None => true,
        }
    }

    /// Rebuilds staples for `authority`'s certificates that are missing or
    /// near expiry. On a retryable failure the previous staple stays in
    /// place. Returns how many staples were replaced.
    pub fn refresh(
        &self,
        authority: &CertificateAuthority,
        responder: &OcspResponder,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let due: Vec<(String, Arc<Entry>)> = self
            .entries
            .read()
            .iter()
            .filter(|(_, entry)| {
                self.needs_refresh(entry, now) && authority.issued(entry.leaf())
            })
            .map(|(name, entry)| (name.clone(), Arc::clone(entry)))
            .collect();

        let mut refreshed = 0;
        for (name, entry) in due {
            match responder.build_current(authority, entry.leaf(), now) {
                Ok(staple) => {
                    let next = entry.with_staple(staple)?;
                    if self.replace_if_current(&name, &entry, next) {
                        refreshed += 1;
                    }
                }
                Err(e) if e.is_retryable() => {
                    warn!(
                        name = %name,
                        error = %e,
                        "staple refresh failed, keeping previous staple"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        if refreshed > 0 {
            info!(refreshed, "refreshed OCSP staples");
        }
        Ok(refreshed)
    }
}

impl fmt::Debug for StapleStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StapleStore")
            .field("names", &self.names())
            .field("default_name", &*self.default_name.read())
            .field("refresh_margin", &self.refresh_margin)
            .finish()
    }
}

impl ResolvesServerCert for StapleStore {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let entries = self.entries.read();
        let entry = match client_hello.server_name() {
            Some(name) => entries.get(name),
            None => {
                let default_name = self.default_name.read().clone();
                default_name.and_then(|name| entries.get(&name))
            }
        };
        if entry.is_none() {
            debug!(sni = ?client_hello.server_name(), "no certificate for server name");
        }
        entry.map(|entry| Arc::clone(&entry.certified))
    }
}

/// Background thread calling [`StapleStore::refresh`] on an interval.
/// Stops and joins when dropped.
pub struct StapleRefresher {
    stop: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl StapleRefresher {
    pub fn spawn(
        store: Arc<StapleStore>,
        authority: Arc<CertificateAuthority>,
        responder: OcspResponder,
        interval: std::time::Duration,
    ) -> Result<Self> {
        let (stop, stopped) = mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name("staple-refresher".into())
            .spawn(move || loop {
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        if let Err(e) = store.refresh(&authority, &responder, Utc::now()) {
                            warn!(error = %e, "staple refresh failed");
                        }
                    }
                    _ => break,
                }
            })?;

        Ok(Self {
            stop: Some(stop),
            handle: Some(handle),
        })
    }

    /// Same as dropping the refresher.
    pub fn stop(self) {
        drop(self);
    }
}

impl Drop for StapleRefresher {
    fn drop(&mut self) {
        drop(self.stop.take());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("staple refresher thread panicked");
            }
        }
    }
}
