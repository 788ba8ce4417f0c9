//! Trust anchors and their rotation.
//!
//! A [`TrustStore`] holds one immutable generation behind an `Arc`. Rotation
//! builds the next generation and swaps the pointer under a short write
//! lock, so a lookup always runs against one consistent generation even if
//! a rotation lands halfway through it.

use crate::certificate::Certificate;
use crate::error::{Error, Result};
use crate::types::KeyUsage;
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info};

/// A versioned, ordered set of self-signed roots.
#[derive(Debug, Clone)]
pub struct TrustBundle {
    version: u64,
    roots: Vec<Certificate>,
}

impl TrustBundle {
    pub fn new(version: u64, roots: Vec<Certificate>) -> Result<Self> {
        if roots.is_empty() {
            return Err(Error::InvalidInput("trust bundle has no roots".into()));
        }
        for root in &roots {
            if !may_issue(root) || !root.is_self_issued() {
                return Err(Error::InvalidInput(format!(
                    "'{}' is not a self-signed CA certificate",
                    root.subject()
                )));
            }
            root.verify_signature(root.public_key())?;
        }
        Ok(Self { version, roots })
    }

    pub fn from_pem(version: u64, pem_str: &str) -> Result<Self> {
        Self::new(version, Certificate::parse_pem_bundle(pem_str)?)
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn roots(&self) -> &[Certificate] {
        &self.roots
    }

    /// The root that is `certificate`, or that issued it.
    pub fn find_issuer(&self, certificate: &Certificate) -> Option<&Certificate> {
        self.roots.iter().find(|root| {
            *root == certificate || (may_issue(root) && certificate.verify_issued_by(root).is_ok())
        })
    }

    pub fn to_pem(&self) -> String {
        self.roots.iter().map(Certificate::to_pem).collect()
    }
}

/// A certificate may sign others only as a CA with keyCertSign.
fn may_issue(certificate: &Certificate) -> bool {
    certificate.is_ca() && certificate.key_usage().contains(&KeyUsage::KeyCertSign)
}

#[derive(Debug, Clone)]
pub struct TrustStoreConfig {
    /// How long the previous bundle keeps answering after a rotation.
    pub overlap_window: Duration,
}

impl Default for TrustStoreConfig {
    fn default() -> Self {
        Self {
            overlap_window: Duration::hours(24),
        }
    }
}

impl TrustStoreConfig {
    pub fn with_overlap_window(mut self, window: Duration) -> Self {
        self.overlap_window = window;
        self
    }
}

#[derive(Debug)]
struct Retained {
    bundle: Arc<TrustBundle>,
    expires_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Generation {
    active: Arc<TrustBundle>,
    previous: Option<Retained>,
}

impl Generation {
    fn previous_at(&self, now: DateTime<Utc>) -> Option<&Arc<TrustBundle>> {
        self.previous
            .as_ref()
            .filter(|retained| now <= retained.expires_at)
            .map(|retained| &retained.bundle)
    }
}

#[derive(Debug)]
pub struct TrustStore {
    config: TrustStoreConfig,
    current: RwLock<Arc<Generation>>,
}

impl TrustStore {
    pub fn new(initial: TrustBundle, config: TrustStoreConfig) -> Self {
        Self {
            config,
            current: RwLock::new(Arc::new(Generation {
                active: Arc::new(initial),
                previous: None,
            })),
        }
    }

    fn snapshot(&self) -> Arc<Generation> {
        Arc::clone(&self.current.read())
    }

    pub fn config(&self) -> &TrustStoreConfig {
        &self.config
    }

    pub fn active(&self) -> Arc<TrustBundle> {
        Arc::clone(&self.snapshot().active)
    }

    /// The retained bundle, if the overlap window is still open at `now`.
    pub fn previous(&self, now: DateTime<Utc>) -> Option<Arc<TrustBundle>> {
        self.snapshot().previous_at(now).cloned()
    }

    pub fn rotate(&self, bundle: TrustBundle) -> Result<()> {
        self.rotate_at(bundle, Utc::now())
    }

    pub fn rotate_at(&self, bundle: TrustBundle, now: DateTime<Utc>) -> Result<()> {
        let mut current = self.current.write();
        if bundle.version <= current.active.version {
            return Err(Error::InvalidInput(format!(
                "bundle version {} does not follow active version {}",
                bundle.version, current.active.version
            )));
        }
        *current = Arc::new(self.next_generation(&current, bundle, now));
        Ok(())
    }

    /// Installs a PEM bundle as the next version. Returns that version.
    pub fn rotate_pem(&self, bundle_pem: &[u8]) -> Result<u64> {
        let pem_str = std::str::from_utf8(bundle_pem)
            .map_err(|e| Error::Parse(format!("trust bundle is not UTF-8: {}", e)))?;
        let roots = Certificate::parse_pem_bundle(pem_str)?;

        let mut current = self.current.write();
        let bundle = TrustBundle::new(current.active.version + 1, roots)?;
        let version = bundle.version;
        *current = Arc::new(self.next_generation(&current, bundle, Utc::now()));
        Ok(version)
    }

    fn next_generation(
        &self,
        current: &Generation,
        bundle: TrustBundle,
        now: DateTime<Utc>,
    ) -> Generation {
        info!(
            from = current.active.version,
            to = bundle.version,
            roots = bundle.roots.len(),
            overlap_secs = self.config.overlap_window.num_seconds(),
            "rotating trust bundle"
        );
        Generation {
            active: Arc::new(bundle),
            previous: Some(Retained {
                bundle: Arc::clone(&current.active),
                expires_at: now + self.config.overlap_window,
            }),
        }
    }

    /// Drops the retained bundle immediately.
    pub fn commit(&self) {
        let mut current = self.current.write();
        if current.previous.is_some() {
            info!(version = current.active.version, "committed trust bundle");
            *current = Arc::new(Generation {
                active: Arc::clone(&current.active),
                previous: None,
            });
        }
    }

    /// The trusted root that is `certificate` or issued it.
    pub fn find_anchor(
        &self,
        certificate: &Certificate,
        now: DateTime<Utc>,
    ) -> Result<Certificate> {
        let generation = self.snapshot();
        if let Some(root) = generation.active.find_issuer(certificate) {
            return Ok(root.clone());
        }
        if let Some(previous) = generation.previous_at(now) {
            if let Some(root) = previous.find_issuer(certificate) {
                debug!(version = previous.version, "anchor found in retained bundle");
                return Ok(root.clone());
            }
        }
        Err(Error::TrustAnchorNotFound(format!(
            "no trusted root for '{}' issued by '{}'",
            certificate.subject(),
            certificate.issuer()
        )))
    }

    /// Checks validity periods and issuer linkage of a leaf-first chain and
    /// returns the anchor it ends in.
    pub fn verify_chain(&self, chain: &[Certificate], now: DateTime<Utc>) -> Result<Certificate> {
        let last = chain
            .last()
            .ok_or_else(|| Error::InvalidChain("empty certificate chain".into()))?;

        for certificate in chain {
            certificate.check_validity(now)?;
        }
        for pair in chain.windows(2) {
            if !may_issue(&pair[1]) {
                return Err(Error::InvalidChain(format!(
                    "'{}' is not a CA and cannot issue '{}'",
                    pair[1].subject(),
                    pair[0].subject()
                )));
            }
            pair[0].verify_issued_by(&pair[1])?;
        }

        let anchor = self.find_anchor(last, now)?;
        anchor.check_validity(now)?;
        Ok(anchor)
    }
}
