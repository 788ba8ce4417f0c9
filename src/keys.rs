//! Key material: P-256 key pairs, public keys, digests and DER signatures.
//!
//! [`KeyPair`] and [`PublicKey`] implement rcgen's key traits so they can be
//! handed straight to certificate and CSR serialization.

use crate::backend::InMemoryBackend;
use crate::error::{Error, Result};
use crate::types::Curve;
use p256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use p256::ecdsa::{Signature as EcdsaSignature, SigningKey as EcdsaSigningKey, VerifyingKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use p256::SecretKey;
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use sha1::Sha1;
use sha2::{Digest as _, Sha256};
use std::fmt;
use x509_parser::oid_registry::{OID_EC_P256, OID_KEY_TYPE_EC_PUBLIC_KEY};
use x509_parser::prelude::FromDer;
use x509_parser::x509::SubjectPublicKeyInfo;
use zeroize::Zeroizing;

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Digest([u8; 32]);

impl Digest {
    pub fn sha256(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", hex::encode(self.0))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature(Vec<u8>);

impl Signature {
    pub fn from_der(der: Vec<u8>) -> Self {
        Self(der)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.0
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey {
    key: p256::PublicKey,
    sec1: Vec<u8>,
}

impl PublicKey {
    pub fn from_sec1_bytes(bytes: &[u8]) -> Result<Self> {
        let key = p256::PublicKey::from_sec1_bytes(bytes)
            .map_err(|e| Error::UnsupportedAlgorithm(format!("Invalid P-256 point: {}", e)))?;
        Ok(Self::from_p256(key))
    }

    fn from_p256(key: p256::PublicKey) -> Self {
        let sec1 = key.to_encoded_point(false).as_bytes().to_vec();
        Self { key, sec1 }
    }

    /// Extracts a P-256 key from a parsed SubjectPublicKeyInfo. Any other
    /// algorithm or curve is rejected.
    pub fn from_spki(spki: &SubjectPublicKeyInfo<'_>) -> Result<Self> {
        if spki.algorithm.algorithm != OID_KEY_TYPE_EC_PUBLIC_KEY {
            return Err(Error::UnsupportedAlgorithm(format!(
                "key algorithm {} is not id-ecPublicKey",
                spki.algorithm.algorithm
            )));
        }

        let curve = spki
            .algorithm
            .parameters
            .as_ref()
            .and_then(|p| p.as_oid().ok())
            .ok_or_else(|| Error::UnsupportedAlgorithm("EC key without named curve".into()))?;
        if curve != OID_EC_P256 {
            return Err(Error::UnsupportedAlgorithm(format!(
                "curve {} is not P-256",
                curve
            )));
        }

        Self::from_sec1_bytes(&spki.subject_public_key.data)
    }

    pub fn from_spki_der(der: &[u8]) -> Result<Self> {
        let (_, spki) = SubjectPublicKeyInfo::from_der(der)
            .map_err(|e| Error::Parse(format!("Failed to parse public key: {}", e)))?;
        Self::from_spki(&spki)
    }

    pub fn to_spki_der(&self) -> Result<Vec<u8>> {
        self.key
            .to_public_key_der()
            .map(|doc| doc.as_bytes().to_vec())
            .map_err(|e| Error::CertGen(format!("Failed to encode public key: {}", e)))
    }

    /// Uncompressed SEC1 point, i.e. the contents of the SPKI bit string.
    pub fn sec1_bytes(&self) -> &[u8] {
        &self.sec1
    }

    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<()> {
        self.verify_digest(&Digest::sha256(message), signature)
    }

    pub fn verify_digest(&self, digest: &Digest, signature: &[u8]) -> Result<()> {
        let verifying_key = VerifyingKey::from(&self.key);
        let sig = EcdsaSignature::from_der(signature)?;
        verifying_key.verify_prehash(digest.as_bytes(), &sig)?;
        Ok(())
    }

    /// SHA-1 over the public key bits (RFC 5280 key identifier, method 1).
    pub fn key_id(&self) -> [u8; 20] {
        Sha1::digest(&self.sec1).into()
    }

    pub fn fingerprint(&self) -> String {
        Sha256::digest(&self.sec1)
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(":")
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublicKey")
            .field("curve", &Curve::P256.name())
            .field("key_id", &hex::encode(self.key_id()))
            .finish()
    }
}

impl rcgen::PublicKeyData for PublicKey {
    fn der_bytes(&self) -> &[u8] {
        &self.sec1
    }

    fn algorithm(&self) -> &'static rcgen::SignatureAlgorithm {
        Curve::P256.signature_algorithm()
    }
}

/// A private key together with its public half. The secret scalar is zeroed
/// when the pair is dropped.
pub struct KeyPair {
    curve: Curve,
    secret: SecretKey,
    public: PublicKey,
}

impl KeyPair {
    pub fn generate(curve: Curve) -> Result<Self> {
        let secret = match curve {
            Curve::P256 => SecretKey::random(&mut rand::rngs::OsRng),
        };
        Ok(Self::from_secret(curve, secret))
    }

    fn from_secret(curve: Curve, secret: SecretKey) -> Self {
        let public = PublicKey::from_p256(secret.public_key());
        Self {
            curve,
            secret,
            public,
        }
    }

    /// Accepts either a SEC1 `EC PRIVATE KEY` or a PKCS#8 `PRIVATE KEY` block.
    pub fn from_pem(pem_str: &str) -> Result<Self> {
        let secret = if pem_str.contains("BEGIN EC PRIVATE KEY") {
            SecretKey::from_sec1_pem(pem_str)
                .map_err(|e| Error::Pem(format!("Failed to parse EC private key: {}", e)))?
        } else {
            SecretKey::from_pkcs8_pem(pem_str)
                .map_err(|e| Error::Pem(format!("Failed to parse private key: {}", e)))?
        };
        Ok(Self::from_secret(Curve::P256, secret))
    }

    pub fn curve(&self) -> Curve {
        self.curve
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub fn export_pem(&self) -> Result<Zeroizing<String>> {
        self.secret
            .to_sec1_pem(LineEnding::LF)
            .map_err(|e| Error::Pem(format!("Failed to encode private key: {}", e)))
    }

    pub fn export_pkcs8_der(&self) -> Result<Zeroizing<Vec<u8>>> {
        self.secret
            .to_pkcs8_der()
            .map(|doc| Zeroizing::new(doc.as_bytes().to_vec()))
            .map_err(|e| Error::Pem(format!("Failed to encode private key: {}", e)))
    }

    pub fn to_rustls_key(&self) -> Result<PrivateKeyDer<'static>> {
        let der = self.export_pkcs8_der()?;
        Ok(PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(der.to_vec())))
    }

    /// Hands the key to a signing backend. After this the private half is
    /// only reachable through the backend.
    pub fn into_backend(self) -> InMemoryBackend {
        InMemoryBackend::from_key_pair(self)
    }

    pub fn sign_digest(&self, digest: &Digest) -> Result<Signature> {
        let signing_key = EcdsaSigningKey::from(&self.secret);
        let sig: EcdsaSignature = signing_key.sign_prehash(digest.as_bytes())?;
        Ok(Signature(sig.to_der().as_bytes().to_vec()))
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("curve", &self.curve)
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

impl rcgen::PublicKeyData for KeyPair {
    fn der_bytes(&self) -> &[u8] {
        self.public.sec1_bytes()
    }

    fn algorithm(&self) -> &'static rcgen::SignatureAlgorithm {
        self.curve.signature_algorithm()
    }
}

impl rcgen::SigningKey for KeyPair {
    fn sign(&self, msg: &[u8]) -> std::result::Result<Vec<u8>, rcgen::Error> {
        self.sign_digest(&Digest::sha256(msg))
            .map(Signature::into_vec)
            .map_err(|_| rcgen::Error::RemoteKeyError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let key = KeyPair::generate(Curve::P256).unwrap();
        let digest = Digest::sha256(b"to be signed");
        let sig = key.sign_digest(&digest).unwrap();

        assert!(key.public_key().verify(b"to be signed", sig.as_bytes()).is_ok());
        assert!(matches!(
            key.public_key().verify(b"something else", sig.as_bytes()),
            Err(Error::Signature(_))
        ));
    }

    #[test]
    fn test_pem_reload_keeps_public_key() {
        let key = KeyPair::generate(Curve::P256).unwrap();
        let pem = key.export_pem().unwrap();
        assert!(pem.contains("BEGIN EC PRIVATE KEY"));

        let reloaded = KeyPair::from_pem(&pem).unwrap();
        assert_eq!(reloaded.public_key(), key.public_key());
    }

    #[test]
    fn test_spki_der_reparse() {
        let key = KeyPair::generate(Curve::P256).unwrap();
        let der = key.public_key().to_spki_der().unwrap();
        let parsed = PublicKey::from_spki_der(&der).unwrap();
        assert_eq!(&parsed, key.public_key());
        assert_eq!(parsed.sec1_bytes().len(), 65);
    }

    #[test]
    fn test_debug_does_not_leak_secret() {
        let key = KeyPair::generate(Curve::P256).unwrap();
        let pem = key.export_pem().unwrap();
        let debug = format!("{:?}", key);
        assert!(!debug.contains(pem.lines().nth(1).unwrap()));
    }

    #[test]
    fn test_garbage_point_rejected() {
        assert!(matches!(
            PublicKey::from_sec1_bytes(&[0x04; 10]),
            Err(Error::UnsupportedAlgorithm(_))
        ));
    }
}
