//! RFC 6960 OCSP response encoding and parsing.
//!
//! Only what a stapling deployment needs: successful `id-pkix-ocsp-basic`
//! responses, responder identified by key hash, ECDSA-SHA256 signatures,
//! CertIDs hashed with SHA-1 or SHA-256.

use crate::certificate::Certificate;
use crate::error::{Error, Result};
use crate::keys::PublicKey;
use crate::types::{offset_from_chrono, RevocationReason, SerialNumber};
use chrono::{DateTime, Utc};
use sha1::Sha1;
use sha2::{Digest as _, Sha256};
use std::fmt;
use yasna::models::{GeneralizedTime, ObjectIdentifier};
use yasna::{ASN1Error, ASN1ErrorKind, ASN1Result, BERReader, DERWriter, Tag};

const OID_PKIX_OCSP_BASIC: &[u64] = &[1, 3, 6, 1, 5, 5, 7, 48, 1, 1];
const OID_ECDSA_WITH_SHA256: &[u64] = &[1, 2, 840, 10045, 4, 3, 2];
const OID_SHA1: &[u64] = &[1, 3, 14, 3, 2, 26];
const OID_SHA256: &[u64] = &[2, 16, 840, 1, 101, 3, 4, 2, 1];

/// Hash used for the issuer name and key hashes inside a CertID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HashAlgorithm {
    #[default]
    Sha1,
    Sha256,
}

impl HashAlgorithm {
    fn oid(&self) -> &'static [u64] {
        match self {
            HashAlgorithm::Sha1 => OID_SHA1,
            HashAlgorithm::Sha256 => OID_SHA256,
        }
    }

    fn from_oid(oid: &ObjectIdentifier) -> Option<Self> {
        match oid.components().as_slice() {
            c if c == OID_SHA1 => Some(HashAlgorithm::Sha1),
            c if c == OID_SHA256 => Some(HashAlgorithm::Sha256),
            _ => None,
        }
    }

    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        match self {
            HashAlgorithm::Sha1 => Sha1::digest(data).to_vec(),
            HashAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
        }
    }
}

/// Identifies one certificate by its issuer and serial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertId {
    pub hash_algorithm: HashAlgorithm,
    pub issuer_name_hash: Vec<u8>,
    pub issuer_key_hash: Vec<u8>,
    pub serial: SerialNumber,
}

impl CertId {
    pub fn for_pair(
        hash_algorithm: HashAlgorithm,
        issuer: &Certificate,
        subject: &Certificate,
    ) -> Self {
        Self {
            hash_algorithm,
            issuer_name_hash: hash_algorithm.digest(issuer.subject_raw()),
            issuer_key_hash: hash_algorithm.digest(issuer.public_key().sec1_bytes()),
            serial: subject.serial().clone(),
        }
    }

    pub fn matches(&self, issuer: &Certificate, subject: &Certificate) -> bool {
        *self == Self::for_pair(self.hash_algorithm, issuer, subject)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertStatus {
    Good,
    Revoked {
        revoked_at: DateTime<Utc>,
        reason: Option<RevocationReason>,
    },
    Unknown,
}

impl CertStatus {
    pub fn name(&self) -> &'static str {
        match self {
            CertStatus::Good => "good",
            CertStatus::Revoked { .. } => "revoked",
            CertStatus::Unknown => "unknown",
        }
    }

    pub fn is_good(&self) -> bool {
        matches!(self, CertStatus::Good)
    }
}

impl fmt::Display for CertStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CertStatus::Revoked {
                revoked_at,
                reason: Some(reason),
            } => write!(f, "revoked at {} ({:?})", revoked_at, reason),
            CertStatus::Revoked { revoked_at, .. } => write!(f, "revoked at {}", revoked_at),
            other => f.write_str(other.name()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SingleResponse {
    pub cert_id: CertId,
    pub status: CertStatus,
    pub this_update: DateTime<Utc>,
    pub next_update: Option<DateTime<Utc>>,
}

impl SingleResponse {
    /// A response without nextUpdate is treated as stale at any time.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        match self.next_update {
            Some(next_update) => now > next_update,
            None => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponderId {
    ByName(Vec<u8>),
    ByKey(Vec<u8>),
}

/// A parsed, not yet verified, basic OCSP response.
#[derive(Debug, Clone)]
pub struct OcspResponse {
    responder_id: ResponderId,
    produced_at: DateTime<Utc>,
    responses: Vec<SingleResponse>,
    tbs: Vec<u8>,
    ecdsa_sha256: bool,
    signature: Vec<u8>,
    raw: Vec<u8>,
}

impl OcspResponse {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let (status, body) = yasna::parse_der(bytes, |reader| {
            reader.read_sequence(|reader| {
                let status = reader.next().read_enum()?;
                let body = reader.read_optional(|reader| {
                    reader.read_tagged(Tag::context(0), |reader| {
                        reader.read_sequence(|reader| {
                            let oid = reader.next().read_oid()?;
                            let response = reader.next().read_bytes()?;
                            Ok((oid, response))
                        })
                    })
                })?;
                Ok((status, body))
            })
        })?;

        if status != 0 {
            return Err(Error::Parse(format!(
                "OCSP responder returned {}",
                response_status_name(status)
            )));
        }
        let (oid, basic) = body.ok_or_else(|| {
            Error::Parse("successful OCSP response without responseBytes".into())
        })?;
        if oid.components().as_slice() != OID_PKIX_OCSP_BASIC {
            return Err(Error::Parse(format!("unsupported OCSP response type {}", oid)));
        }

        let (tbs, algorithm, signature) = yasna::parse_der(&basic, |reader| {
            reader.read_sequence(|reader| {
                let tbs = reader.next().read_der()?;
                let algorithm = reader.next().read_sequence(|reader| {
                    let oid = reader.next().read_oid()?;
                    reader.read_optional(|reader| reader.read_der())?;
                    Ok(oid)
                })?;
                let (signature, _) = reader.next().read_bitvec_bytes()?;
                reader.read_optional(|reader| {
                    reader.read_tagged(Tag::context(0), |reader| reader.read_der())
                })?;
                Ok((tbs, algorithm, signature))
            })
        })?;

        let (responder_id, produced_at, responses) =
            yasna::parse_der(&tbs, |reader| reader.read_sequence(read_response_data))?;

        Ok(Self {
            responder_id,
            produced_at,
            responses,
            tbs,
            ecdsa_sha256: algorithm.components().as_slice() == OID_ECDSA_WITH_SHA256,
            signature,
            raw: bytes.to_vec(),
        })
    }

    /// The single response whose CertID names `subject` as issued by `issuer`.
    pub fn response_for(
        &self,
        issuer: &Certificate,
        subject: &Certificate,
    ) -> Option<&SingleResponse> {
        self.responses
            .iter()
            .find(|single| single.cert_id.matches(issuer, subject))
    }

    pub fn verify_signature(&self, issuer_key: &PublicKey) -> Result<()> {
        if !self.ecdsa_sha256 {
            return Err(Error::OcspInvalidSignature(
                "response is not signed with ecdsa-with-SHA256".into(),
            ));
        }
        if let ResponderId::ByKey(hash) = &self.responder_id {
            if hash.as_slice() != issuer_key.key_id() {
                return Err(Error::OcspInvalidSignature(
                    "responder key hash does not match the issuer".into(),
                ));
            }
        }
        issuer_key
            .verify(&self.tbs, &self.signature)
            .map_err(|e| Error::OcspInvalidSignature(e.to_string()))
    }

    pub fn responder_id(&self) -> &ResponderId {
        &self.responder_id
    }

    pub fn produced_at(&self) -> DateTime<Utc> {
        self.produced_at
    }

    pub fn responses(&self) -> &[SingleResponse] {
        &self.responses
    }

    pub fn tbs(&self) -> &[u8] {
        &self.tbs
    }

    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }
}

fn response_status_name(status: i64) -> &'static str {
    match status {
        0 => "successful",
        1 => "malformedRequest",
        2 => "internalError",
        3 => "tryLater",
        5 => "sigRequired",
        6 => "unauthorized",
        _ => "an unknown status",
    }
}

fn invalid() -> ASN1Error {
    ASN1Error::new(ASN1ErrorKind::Invalid)
}

fn read_time(reader: BERReader) -> ASN1Result<DateTime<Utc>> {
    let time = reader.read_generalized_time()?;
    DateTime::from_timestamp(time.datetime().unix_timestamp(), 0).ok_or_else(invalid)
}

fn read_response_data(
    reader: &mut yasna::BERReaderSeq,
) -> ASN1Result<(ResponderId, DateTime<Utc>, Vec<SingleResponse>)> {
    reader.read_optional(|reader| reader.read_tagged(Tag::context(0), |reader| reader.read_u8()))?;

    let responder = reader.next();
    let tag = responder.lookahead_tag()?;
    let responder_id = if tag == Tag::context(1) {
        ResponderId::ByName(responder.read_tagged(Tag::context(1), |reader| reader.read_der())?)
    } else if tag == Tag::context(2) {
        ResponderId::ByKey(responder.read_tagged(Tag::context(2), |reader| reader.read_bytes())?)
    } else {
        return Err(invalid());
    };

    let produced_at = read_time(reader.next())?;

    let mut responses = Vec::new();
    reader.next().read_sequence_of(|reader| {
        responses.push(reader.read_sequence(read_single_response)?);
        Ok(())
    })?;

    reader.read_optional(|reader| reader.read_tagged(Tag::context(1), |reader| reader.read_der()))?;
    Ok((responder_id, produced_at, responses))
}

fn read_single_response(reader: &mut yasna::BERReaderSeq) -> ASN1Result<SingleResponse> {
    let cert_id = reader.next().read_sequence(|reader| {
        let algorithm = reader.next().read_sequence(|reader| {
            let oid = reader.next().read_oid()?;
            reader.read_optional(|reader| reader.read_null())?;
            Ok(oid)
        })?;
        let hash_algorithm = HashAlgorithm::from_oid(&algorithm).ok_or_else(invalid)?;
        let issuer_name_hash = reader.next().read_bytes()?;
        let issuer_key_hash = reader.next().read_bytes()?;
        let (serial, _) = reader.next().read_bigint_bytes()?;
        Ok(CertId {
            hash_algorithm,
            issuer_name_hash,
            issuer_key_hash,
            serial: SerialNumber::from_be_bytes(&serial),
        })
    })?;

    let status_reader = reader.next();
    let tag = status_reader.lookahead_tag()?;
    let status = if tag == Tag::context(0) {
        status_reader.read_tagged_implicit(Tag::context(0), |reader| reader.read_null())?;
        CertStatus::Good
    } else if tag == Tag::context(1) {
        status_reader.read_tagged_implicit(Tag::context(1), |reader| {
            reader.read_sequence(|reader| {
                let revoked_at = read_time(reader.next())?;
                let reason = reader.read_optional(|reader| {
                    reader.read_tagged(Tag::context(0), |reader| reader.read_enum())
                })?;
                Ok(CertStatus::Revoked {
                    revoked_at,
                    reason: reason.and_then(RevocationReason::from_code),
                })
            })
        })?
    } else if tag == Tag::context(2) {
        status_reader.read_tagged_implicit(Tag::context(2), |reader| reader.read_null())?;
        CertStatus::Unknown
    } else {
        return Err(invalid());
    };

    let this_update = read_time(reader.next())?;
    let next_update =
        reader.read_optional(|reader| reader.read_tagged(Tag::context(0), read_time))?;
    reader.read_optional(|reader| reader.read_tagged(Tag::context(1), |reader| reader.read_der()))?;

    Ok(SingleResponse {
        cert_id,
        status,
        this_update,
        next_update,
    })
}

fn generalized_time(dt: DateTime<Utc>) -> Result<GeneralizedTime> {
    Ok(GeneralizedTime::from_datetime(offset_from_chrono(dt)?))
}

struct EncodedStatus {
    status: CertStatus,
    revoked_at: Option<GeneralizedTime>,
}

struct EncodedSingle<'a> {
    cert_id: &'a CertId,
    status: EncodedStatus,
    this_update: GeneralizedTime,
    next_update: Option<GeneralizedTime>,
}

impl<'a> EncodedSingle<'a> {
    fn new(single: &'a SingleResponse) -> Result<Self> {
        let revoked_at = match single.status {
            CertStatus::Revoked { revoked_at, .. } => Some(generalized_time(revoked_at)?),
            _ => None,
        };
        Ok(Self {
            cert_id: &single.cert_id,
            status: EncodedStatus {
                status: single.status,
                revoked_at,
            },
            this_update: generalized_time(single.this_update)?,
            next_update: single.next_update.map(generalized_time).transpose()?,
        })
    }

    fn write(&self, writer: DERWriter) {
        writer.write_sequence(|writer| {
            write_cert_id(writer.next(), self.cert_id);
            self.status.write(writer.next());
            writer.next().write_generalized_time(&self.this_update);
            if let Some(next_update) = &self.next_update {
                writer.next().write_tagged(Tag::context(0), |writer| {
                    writer.write_generalized_time(next_update)
                });
            }
        });
    }
}

impl EncodedStatus {
    fn write(&self, writer: DERWriter) {
        match (&self.status, &self.revoked_at) {
            (CertStatus::Revoked { reason, .. }, Some(revoked_at)) => {
                writer.write_tagged_implicit(Tag::context(1), |writer| {
                    writer.write_sequence(|writer| {
                        writer.next().write_generalized_time(revoked_at);
                        if let Some(reason) = reason {
                            writer.next().write_tagged(Tag::context(0), |writer| {
                                writer.write_enum(reason.to_code())
                            });
                        }
                    })
                });
            }
            (CertStatus::Good, _) => {
                writer.write_tagged_implicit(Tag::context(0), |writer| writer.write_null())
            }
            _ => writer.write_tagged_implicit(Tag::context(2), |writer| writer.write_null()),
        }
    }
}

fn write_cert_id(writer: DERWriter, cert_id: &CertId) {
    writer.write_sequence(|writer| {
        writer.next().write_sequence(|writer| {
            writer
                .next()
                .write_oid(&ObjectIdentifier::from_slice(cert_id.hash_algorithm.oid()));
            writer.next().write_null();
        });
        writer.next().write_bytes(&cert_id.issuer_name_hash);
        writer.next().write_bytes(&cert_id.issuer_key_hash);
        writer
            .next()
            .write_bigint_bytes(cert_id.serial.as_bytes(), true);
    });
}

/// DER of the `ResponseData` that gets signed.
pub(crate) fn encode_response_data(
    responder_key_hash: &[u8],
    produced_at: DateTime<Utc>,
    responses: &[SingleResponse],
) -> Result<Vec<u8>> {
    let produced_at = generalized_time(produced_at)?;
    let singles = responses
        .iter()
        .map(EncodedSingle::new)
        .collect::<Result<Vec<_>>>()?;

    Ok(yasna::construct_der(|writer| {
        writer.write_sequence(|writer| {
            writer
                .next()
                .write_tagged(Tag::context(2), |writer| writer.write_bytes(responder_key_hash));
            writer.next().write_generalized_time(&produced_at);
            writer.next().write_sequence(|writer| {
                for single in &singles {
                    single.write(writer.next());
                }
            });
        })
    }))
}

/// Wraps signed `ResponseData` into a complete, successful `OCSPResponse`.
pub(crate) fn encode_ocsp_response(tbs: &[u8], signature: &[u8]) -> Vec<u8> {
    let basic = yasna::construct_der(|writer| {
        writer.write_sequence(|writer| {
            writer.next().write_der(tbs);
            writer.next().write_sequence(|writer| {
                writer
                    .next()
                    .write_oid(&ObjectIdentifier::from_slice(OID_ECDSA_WITH_SHA256));
            });
            writer
                .next()
                .write_bitvec_bytes(signature, signature.len() * 8);
        })
    });

    yasna::construct_der(|writer| {
        writer.write_sequence(|writer| {
            writer.next().write_enum(0);
            writer.next().write_tagged(Tag::context(0), |writer| {
                writer.write_sequence(|writer| {
                    writer
                        .next()
                        .write_oid(&ObjectIdentifier::from_slice(OID_PKIX_OCSP_BASIC));
                    writer.next().write_bytes(&basic);
                })
            });
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{Digest, KeyPair};
    use crate::types::Curve;
    use chrono::Duration;

    fn sample_id(serial: u8) -> CertId {
        CertId {
            hash_algorithm: HashAlgorithm::Sha1,
            issuer_name_hash: vec![0x11; 20],
            issuer_key_hash: vec![0x22; 20],
            serial: SerialNumber::from_be_bytes(&[0x80, serial]),
        }
    }

    fn signed(key: &KeyPair, responses: &[SingleResponse]) -> Vec<u8> {
        let now = crate::types::truncate_to_seconds(Utc::now());
        let tbs = encode_response_data(&key.public_key().key_id(), now, responses).unwrap();
        let sig = key.sign_digest(&Digest::sha256(&tbs)).unwrap();
        encode_ocsp_response(&tbs, sig.as_bytes())
    }

    #[test]
    fn test_statuses_survive_encoding() {
        let key = KeyPair::generate(Curve::P256).unwrap();
        let now = crate::types::truncate_to_seconds(Utc::now());
        let responses = vec![
            SingleResponse {
                cert_id: sample_id(1),
                status: CertStatus::Good,
                this_update: now,
                next_update: Some(now + Duration::seconds(60)),
            },
            SingleResponse {
                cert_id: sample_id(2),
                status: CertStatus::Revoked {
                    revoked_at: now - Duration::hours(1),
                    reason: Some(RevocationReason::KeyCompromise),
                },
                this_update: now,
                next_update: None,
            },
            SingleResponse {
                cert_id: sample_id(3),
                status: CertStatus::Unknown,
                this_update: now,
                next_update: Some(now),
            },
        ];

        let parsed = OcspResponse::parse(&signed(&key, &responses)).unwrap();
        assert_eq!(parsed.responses(), &responses[..]);
        assert_eq!(
            parsed.responder_id(),
            &ResponderId::ByKey(key.public_key().key_id().to_vec())
        );
        assert!(parsed.verify_signature(key.public_key()).is_ok());
    }

    #[test]
    fn test_signature_checked_against_key() {
        let key = KeyPair::generate(Curve::P256).unwrap();
        let other = KeyPair::generate(Curve::P256).unwrap();
        let now = Utc::now();
        let der = signed(
            &key,
            &[SingleResponse {
                cert_id: sample_id(1),
                status: CertStatus::Good,
                this_update: crate::types::truncate_to_seconds(now),
                next_update: None,
            }],
        );

        let parsed = OcspResponse::parse(&der).unwrap();
        assert!(matches!(
            parsed.verify_signature(other.public_key()),
            Err(Error::OcspInvalidSignature(_))
        ));
    }

    #[test]
    fn test_unsuccessful_status_is_parse_error() {
        let try_later = yasna::construct_der(|writer| {
            writer.write_sequence(|writer| writer.next().write_enum(3))
        });
        match OcspResponse::parse(&try_later) {
            Err(Error::Parse(msg)) => assert!(msg.contains("tryLater")),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_garbage_is_parse_error() {
        assert!(matches!(
            OcspResponse::parse(b"\x30\x03\x0a\x01"),
            Err(Error::Parse(_))
        ));
        assert!(matches!(OcspResponse::parse(&[]), Err(Error::Parse(_))));
    }

    #[test]
    fn test_staleness() {
        let now = Utc::now();
        let mut single = SingleResponse {
            cert_id: sample_id(1),
            status: CertStatus::Good,
            this_update: now,
            next_update: Some(now + Duration::seconds(60)),
        };
        assert!(!single.is_stale(now + Duration::seconds(60)));
        assert!(single.is_stale(now + Duration::seconds(61)));
        single.next_update = None;
        assert!(single.is_stale(now));
    }
}
