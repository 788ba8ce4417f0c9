use crate::error::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use std::fmt;
use std::net::IpAddr;
use x509_parser::prelude::X509Name;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Curve {
    #[default]
    P256,
}

impl Curve {
    pub fn signature_algorithm(&self) -> &'static rcgen::SignatureAlgorithm {
        match self {
            Curve::P256 => &rcgen::PKCS_ECDSA_P256_SHA256,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Curve::P256 => "ECDSA P-256",
        }
    }
}

impl std::str::FromStr for Curve {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "p256" | "p-256" | "ecdsa-p256" | "prime256v1" | "secp256r1" => Ok(Curve::P256),
            _ => Err(Error::UnsupportedAlgorithm(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertType {
    RootCA,
    Server,
    Client,
    Both,
}

impl std::str::FromStr for CertType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "server" => Ok(CertType::Server),
            "client" => Ok(CertType::Client),
            "both" | "mutual" => Ok(CertType::Both),
            _ => Err(Error::InvalidInput(format!("Invalid cert type: {}", s))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DistinguishedName {
    pub common_name: String,
    pub organization: Option<String>,
    pub organizational_unit: Option<String>,
    pub country: Option<String>,
    pub state: Option<String>,
    pub locality: Option<String>,
}

impl DistinguishedName {
    pub fn new(cn: impl Into<String>) -> Self {
        Self {
            common_name: cn.into(),
            ..Default::default()
        }
    }

    pub fn with_organization(mut self, org: impl Into<String>) -> Self {
        self.organization = Some(org.into());
        self
    }

    pub fn with_organizational_unit(mut self, ou: impl Into<String>) -> Self {
        self.organizational_unit = Some(ou.into());
        self
    }

    pub fn with_country(mut self, country: impl Into<String>) -> Self {
        self.country = Some(country.into());
        self
    }

    pub fn with_state(mut self, state: impl Into<String>) -> Self {
        self.state = Some(state.into());
        self
    }

    pub fn with_locality(mut self, locality: impl Into<String>) -> Self {
        self.locality = Some(locality.into());
        self
    }

    pub fn to_rcgen(&self) -> rcgen::DistinguishedName {
        let mut dn = rcgen::DistinguishedName::new();
        if !self.common_name.is_empty() {
            dn.push(rcgen::DnType::CommonName, self.common_name.as_str());
        }

        if let Some(ref org) = self.organization {
            dn.push(rcgen::DnType::OrganizationName, org.as_str());
        }
        if let Some(ref ou) = self.organizational_unit {
            dn.push(rcgen::DnType::OrganizationalUnitName, ou.as_str());
        }
        if let Some(ref country) = self.country {
            dn.push(rcgen::DnType::CountryName, country.as_str());
        }
        if let Some(ref state) = self.state {
            dn.push(rcgen::DnType::StateOrProvinceName, state.as_str());
        }
        if let Some(ref locality) = self.locality {
            dn.push(rcgen::DnType::LocalityName, locality.as_str());
        }

        dn
    }

    /// Reads the attributes this crate models out of a parsed X.509 name.
    /// Anything else in the name is ignored.
    pub fn from_x509(name: &X509Name<'_>) -> Self {
        fn first<'a, 'b: 'a>(
            mut iter: impl Iterator<Item = &'a x509_parser::x509::AttributeTypeAndValue<'b>>,
        ) -> Option<String> {
            iter.next()
                .and_then(|attr| attr.as_str().ok())
                .map(str::to_string)
        }

        Self {
            common_name: first(name.iter_common_name()).unwrap_or_default(),
            organization: first(name.iter_organization()),
            organizational_unit: first(name.iter_organizational_unit()),
            country: first(name.iter_country()),
            state: first(name.iter_state_or_province()),
            locality: first(name.iter_locality()),
        }
    }
}

/// Rebuilds `name` as an rcgen name that encodes to the same attributes,
/// in the same order and with the same string types.
///
/// rcgen keys attributes by type and writes one attribute per RDN, so
/// multi-valued RDNs and repeated attribute types are refused rather than
/// silently merged.
pub(crate) fn exact_name(name: &X509Name<'_>) -> Result<rcgen::DistinguishedName> {
    use x509_parser::der_parser::asn1_rs::Tag;

    let unrepresentable = |why: String| {
        Error::PolicyViolation(format!("subject cannot be issued as requested: {}", why))
    };

    let mut dn = rcgen::DistinguishedName::new();
    let mut seen = Vec::new();
    for rdn in name.iter() {
        let mut attrs = rdn.iter();
        let attr = match (attrs.next(), attrs.next()) {
            (Some(attr), None) => attr,
            (None, _) => return Err(unrepresentable("empty RDN".into())),
            (Some(_), Some(_)) => return Err(unrepresentable("multi-valued RDN".into())),
        };

        let oid: Vec<u64> = attr
            .attr_type()
            .iter()
            .ok_or_else(|| unrepresentable(format!("attribute type {}", attr.attr_type())))?
            .collect();
        if seen.contains(&oid) {
            return Err(unrepresentable(format!(
                "attribute {} appears more than once",
                attr.attr_type()
            )));
        }

        let value = attr.attr_value();
        let text = || {
            std::str::from_utf8(value.data).map_err(|_| {
                unrepresentable(format!("attribute {} is not text", attr.attr_type()))
            })
        };
        let invalid = |e: rcgen::Error| unrepresentable(e.to_string());
        let dn_value = match value.tag() {
            Tag::Utf8String => rcgen::DnValue::Utf8String(text()?.to_string()),
            Tag::PrintableString => {
                rcgen::DnValue::PrintableString(text()?.try_into().map_err(invalid)?)
            }
            Tag::Ia5String => rcgen::DnValue::Ia5String(text()?.try_into().map_err(invalid)?),
            Tag::T61String => rcgen::DnValue::TeletexString(text()?.try_into().map_err(invalid)?),
            Tag::BmpString => rcgen::DnValue::BmpString(
                rcgen::string::BmpString::from_utf16be(value.data.to_vec()).map_err(invalid)?,
            ),
            Tag::UniversalString => rcgen::DnValue::UniversalString(
                rcgen::string::UniversalString::from_utf32be(value.data.to_vec())
                    .map_err(invalid)?,
            ),
            tag => {
                return Err(unrepresentable(format!(
                    "attribute {} has unsupported value type {:?}",
                    attr.attr_type(),
                    tag
                )))
            }
        };

        dn.push(rcgen::DnType::from_oid(&oid), dn_value);
        seen.push(oid);
    }
    Ok(dn)
}

impl fmt::Display for DistinguishedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if !self.common_name.is_empty() {
            parts.push(format!("CN={}", self.common_name));
        }
        let optional = [
            ("O", &self.organization),
            ("OU", &self.organizational_unit),
            ("C", &self.country),
            ("ST", &self.state),
            ("L", &self.locality),
        ];
        for (label, value) in optional {
            if let Some(v) = value {
                parts.push(format!("{}={}", label, v));
            }
        }
        write!(f, "{}", parts.join(", "))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SubjectAltName {
    pub dns_names: Vec<String>,
    pub ip_addresses: Vec<IpAddr>,
}

impl SubjectAltName {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dns(mut self, dns: impl Into<String>) -> Self {
        self.dns_names.push(dns.into());
        self
    }

    pub fn with_ip(mut self, ip: IpAddr) -> Self {
        self.ip_addresses.push(ip);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.dns_names.is_empty() && self.ip_addresses.is_empty()
    }

    pub fn to_rcgen(&self) -> Result<Vec<rcgen::SanType>> {
        let mut san_vec = Vec::new();
        for dns in &self.dns_names {
            san_vec.push(rcgen::SanType::DnsName(dns.clone().try_into()?));
        }
        for ip in &self.ip_addresses {
            san_vec.push(rcgen::SanType::IpAddress(*ip));
        }
        Ok(san_vec)
    }

    pub(crate) fn from_general_names(names: &[x509_parser::extensions::GeneralName<'_>]) -> Self {
        use x509_parser::extensions::GeneralName;

        let mut san = Self::new();
        for name in names {
            match name {
                GeneralName::DNSName(dns) => san.dns_names.push(dns.to_string()),
                GeneralName::IPAddress(bytes) => {
                    if let Some(ip) = ip_from_bytes(bytes) {
                        san.ip_addresses.push(ip);
                    }
                }
                _ => {}
            }
        }
        san
    }
}

fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => {
            let octets: [u8; 4] = bytes.try_into().ok()?;
            Some(IpAddr::from(octets))
        }
        16 => {
            let octets: [u8; 16] = bytes.try_into().ok()?;
            Some(IpAddr::from(octets))
        }
        _ => None,
    }
}

/// Certificate serial number: an unsigned big-endian integer, stored without
/// leading zero bytes so that serials read back from DER compare equal to the
/// ones that were allocated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SerialNumber(Vec<u8>);

impl SerialNumber {
    pub fn from_be_bytes(bytes: &[u8]) -> Self {
        let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
        Self(bytes[start..].to_vec())
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let cleaned = s.replace([':', ' ', '-'], "");
        let bytes = hex::decode(&cleaned)
            .map_err(|e| Error::InvalidInput(format!("Invalid serial '{}': {}", s, e)))?;
        Ok(Self::from_be_bytes(&bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_hex(&self) -> String {
        if self.0.is_empty() {
            return "00".to_string();
        }
        hex::encode(&self.0)
    }
}

impl fmt::Display for SerialNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Everything the authority needs to sign a certificate except the subject
/// key and the serial number.
///
/// `serial_number` exists so callers can round-trip templates, but the
/// authority always overwrites it with a value from its own allocator.
#[derive(Debug, Clone)]
pub struct CertificateTemplate {
    pub subject: DistinguishedName,
    pub san: SubjectAltName,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub is_ca: bool,
    pub key_usage: Vec<KeyUsage>,
    pub extended_key_usage: Vec<ExtendedKeyUsage>,
    pub serial_number: Option<SerialNumber>,
    /// Exact encoded subject taken from a CSR; wins over `subject` when set.
    pub(crate) subject_name: Option<rcgen::DistinguishedName>,
}

impl CertificateTemplate {
    pub fn new(cn: impl Into<String>, cert_type: CertType) -> Self {
        let (key_usage, extended_key_usage) = cert_type.default_usages();
        let not_before = Utc::now();

        Self {
            subject: DistinguishedName::new(cn),
            san: SubjectAltName::new(),
            not_before,
            not_after: not_before + Duration::days(365),
            is_ca: cert_type == CertType::RootCA,
            key_usage,
            extended_key_usage,
            serial_number: None,
            subject_name: None,
        }
    }

    pub fn with_subject(mut self, subject: DistinguishedName) -> Self {
        self.subject = subject;
        self.subject_name = None;
        self
    }

    pub fn with_san(mut self, san: SubjectAltName) -> Self {
        self.san = san;
        self
    }

    pub fn with_validity(mut self, not_before: DateTime<Utc>, not_after: DateTime<Utc>) -> Self {
        self.not_before = not_before;
        self.not_after = not_after;
        self
    }

    pub fn with_validity_days(mut self, days: u32) -> Self {
        self.not_after = self.not_before + Duration::days(days as i64);
        self
    }

    pub fn is_server_auth(&self) -> bool {
        self.extended_key_usage.contains(&ExtendedKeyUsage::ServerAuth)
    }

    /// Checks the template as it will be encoded, with whole-second validity.
    pub fn validate(&self) -> Result<()> {
        if truncate_to_seconds(self.not_after) <= truncate_to_seconds(self.not_before) {
            return Err(Error::InvalidTemplate(format!(
                "not_after ({}) must be later than not_before ({})",
                self.not_after, self.not_before
            )));
        }
        if self.is_server_auth() && self.san.is_empty() {
            return Err(Error::InvalidTemplate(format!(
                "server-auth certificate for '{}' has no subject alternative name",
                self.subject.common_name
            )));
        }
        Ok(())
    }

    pub(crate) fn to_rcgen(&self, serial: &SerialNumber) -> Result<rcgen::CertificateParams> {
        let mut params = rcgen::CertificateParams::default();
        params.distinguished_name = match &self.subject_name {
            Some(name) => name.clone(),
            None => self.subject.to_rcgen(),
        };
        params.subject_alt_names = self.san.to_rcgen()?;

        params.is_ca = if self.is_ca {
            rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained)
        } else {
            rcgen::IsCa::ExplicitNoCa
        };

        params.key_usages = self.key_usage.iter().map(|ku| ku.to_rcgen()).collect();
        params.extended_key_usages = self
            .extended_key_usage
            .iter()
            .map(|eku| eku.to_rcgen())
            .collect();

        params.not_before = offset_from_chrono(self.not_before)?;
        params.not_after = offset_from_chrono(self.not_after)?;
        params.serial_number = Some(rcgen::SerialNumber::from_slice(serial.as_bytes()));
        params.use_authority_key_identifier_extension = !self.is_ca;

        Ok(params)
    }
}

impl CertType {
    pub fn default_usages(&self) -> (Vec<KeyUsage>, Vec<ExtendedKeyUsage>) {
        match self {
            CertType::RootCA => (
                vec![
                    KeyUsage::DigitalSignature,
                    KeyUsage::KeyCertSign,
                    KeyUsage::CrlSign,
                ],
                vec![],
            ),
            CertType::Server => (
                vec![KeyUsage::DigitalSignature, KeyUsage::KeyEncipherment],
                vec![ExtendedKeyUsage::ServerAuth],
            ),
            CertType::Client => (
                vec![KeyUsage::DigitalSignature, KeyUsage::KeyEncipherment],
                vec![ExtendedKeyUsage::ClientAuth],
            ),
            CertType::Both => (
                vec![KeyUsage::DigitalSignature, KeyUsage::KeyEncipherment],
                vec![ExtendedKeyUsage::ServerAuth, ExtendedKeyUsage::ClientAuth],
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyUsage {
    DigitalSignature,
    KeyEncipherment,
    KeyAgreement,
    KeyCertSign,
    CrlSign,
    DataEncipherment,
    NonRepudiation,
}

impl KeyUsage {
    pub fn to_rcgen(&self) -> rcgen::KeyUsagePurpose {
        match self {
            KeyUsage::DigitalSignature => rcgen::KeyUsagePurpose::DigitalSignature,
            KeyUsage::KeyEncipherment => rcgen::KeyUsagePurpose::KeyEncipherment,
            KeyUsage::KeyAgreement => rcgen::KeyUsagePurpose::KeyAgreement,
            KeyUsage::KeyCertSign => rcgen::KeyUsagePurpose::KeyCertSign,
            KeyUsage::CrlSign => rcgen::KeyUsagePurpose::CrlSign,
            KeyUsage::DataEncipherment => rcgen::KeyUsagePurpose::DataEncipherment,
            KeyUsage::NonRepudiation => rcgen::KeyUsagePurpose::ContentCommitment,
        }
    }

    pub(crate) fn from_x509(ku: &x509_parser::extensions::KeyUsage) -> Vec<Self> {
        let mut usages = Vec::new();
        if ku.digital_signature() {
            usages.push(KeyUsage::DigitalSignature);
        }
        if ku.non_repudiation() {
            usages.push(KeyUsage::NonRepudiation);
        }
        if ku.key_encipherment() {
            usages.push(KeyUsage::KeyEncipherment);
        }
        if ku.data_encipherment() {
            usages.push(KeyUsage::DataEncipherment);
        }
        if ku.key_agreement() {
            usages.push(KeyUsage::KeyAgreement);
        }
        if ku.key_cert_sign() {
            usages.push(KeyUsage::KeyCertSign);
        }
        if ku.crl_sign() {
            usages.push(KeyUsage::CrlSign);
        }
        usages
    }

    pub fn name(&self) -> &'static str {
        match self {
            KeyUsage::DigitalSignature => "Digital Signature",
            KeyUsage::KeyEncipherment => "Key Encipherment",
            KeyUsage::KeyAgreement => "Key Agreement",
            KeyUsage::KeyCertSign => "Certificate Sign",
            KeyUsage::CrlSign => "CRL Sign",
            KeyUsage::DataEncipherment => "Data Encipherment",
            KeyUsage::NonRepudiation => "Non Repudiation",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExtendedKeyUsage {
    ServerAuth,
    ClientAuth,
    CodeSigning,
    EmailProtection,
    TimeStamping,
    OcspSigning,
    Any,
}

impl ExtendedKeyUsage {
    pub fn to_rcgen(&self) -> rcgen::ExtendedKeyUsagePurpose {
        match self {
            ExtendedKeyUsage::ServerAuth => rcgen::ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsage::ClientAuth => rcgen::ExtendedKeyUsagePurpose::ClientAuth,
            ExtendedKeyUsage::CodeSigning => rcgen::ExtendedKeyUsagePurpose::CodeSigning,
            ExtendedKeyUsage::EmailProtection => rcgen::ExtendedKeyUsagePurpose::EmailProtection,
            ExtendedKeyUsage::TimeStamping => rcgen::ExtendedKeyUsagePurpose::TimeStamping,
            ExtendedKeyUsage::OcspSigning => rcgen::ExtendedKeyUsagePurpose::OcspSigning,
            ExtendedKeyUsage::Any => rcgen::ExtendedKeyUsagePurpose::Any,
        }
    }

    /// Maps a parsed EKU extension onto the purposes this crate models.
    ///
    /// The second element lists dotted OIDs of purposes that have no variant
    /// here; callers enforcing a policy must treat those as unknown requests.
    pub(crate) fn from_x509(
        eku: &x509_parser::extensions::ExtendedKeyUsage<'_>,
    ) -> (Vec<Self>, Vec<String>) {
        let mut usages = Vec::new();
        if eku.any {
            usages.push(ExtendedKeyUsage::Any);
        }
        if eku.server_auth {
            usages.push(ExtendedKeyUsage::ServerAuth);
        }
        if eku.client_auth {
            usages.push(ExtendedKeyUsage::ClientAuth);
        }
        if eku.code_signing {
            usages.push(ExtendedKeyUsage::CodeSigning);
        }
        if eku.email_protection {
            usages.push(ExtendedKeyUsage::EmailProtection);
        }
        if eku.time_stamping {
            usages.push(ExtendedKeyUsage::TimeStamping);
        }
        if eku.ocsp_signing {
            usages.push(ExtendedKeyUsage::OcspSigning);
        }
        let other = eku.other.iter().map(|oid| oid.to_id_string()).collect();
        (usages, other)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ExtendedKeyUsage::ServerAuth => "TLS Web Server Authentication",
            ExtendedKeyUsage::ClientAuth => "TLS Web Client Authentication",
            ExtendedKeyUsage::CodeSigning => "Code Signing",
            ExtendedKeyUsage::EmailProtection => "Email Protection",
            ExtendedKeyUsage::TimeStamping => "Time Stamping",
            ExtendedKeyUsage::OcspSigning => "OCSP Signing",
            ExtendedKeyUsage::Any => "Any Extended Key Usage",
        }
    }
}

impl std::str::FromStr for ExtendedKeyUsage {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "server" | "serverauth" | "server-auth" => Ok(ExtendedKeyUsage::ServerAuth),
            "client" | "clientauth" | "client-auth" => Ok(ExtendedKeyUsage::ClientAuth),
            "codesigning" | "code-signing" => Ok(ExtendedKeyUsage::CodeSigning),
            "email" | "emailprotection" | "email-protection" => {
                Ok(ExtendedKeyUsage::EmailProtection)
            }
            "timestamping" | "time-stamping" => Ok(ExtendedKeyUsage::TimeStamping),
            "ocspsigning" | "ocsp-signing" => Ok(ExtendedKeyUsage::OcspSigning),
            "any" => Ok(ExtendedKeyUsage::Any),
            _ => Err(Error::InvalidInput(format!(
                "Invalid extended key usage: {}",
                s
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RevokedCertificate {
    pub serial_number: SerialNumber,
    pub revocation_time: DateTime<Utc>,
    pub reason: RevocationReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevocationReason {
    Unspecified,
    KeyCompromise,
    CACompromise,
    AffiliationChanged,
    Superseded,
    CessationOfOperation,
    CertificateHold,
    RemoveFromCRL,
    PrivilegeWithdrawn,
    AACompromise,
}

impl RevocationReason {
    pub fn to_code(&self) -> i64 {
        match self {
            RevocationReason::Unspecified => 0,
            RevocationReason::KeyCompromise => 1,
            RevocationReason::CACompromise => 2,
            RevocationReason::AffiliationChanged => 3,
            RevocationReason::Superseded => 4,
            RevocationReason::CessationOfOperation => 5,
            RevocationReason::CertificateHold => 6,
            RevocationReason::RemoveFromCRL => 8,
            RevocationReason::PrivilegeWithdrawn => 9,
            RevocationReason::AACompromise => 10,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(RevocationReason::Unspecified),
            1 => Some(RevocationReason::KeyCompromise),
            2 => Some(RevocationReason::CACompromise),
            3 => Some(RevocationReason::AffiliationChanged),
            4 => Some(RevocationReason::Superseded),
            5 => Some(RevocationReason::CessationOfOperation),
            6 => Some(RevocationReason::CertificateHold),
            8 => Some(RevocationReason::RemoveFromCRL),
            9 => Some(RevocationReason::PrivilegeWithdrawn),
            10 => Some(RevocationReason::AACompromise),
            _ => None,
        }
    }
}

impl std::str::FromStr for RevocationReason {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "unspecified" => Ok(RevocationReason::Unspecified),
            "keycompromise" | "key-compromise" => Ok(RevocationReason::KeyCompromise),
            "cacompromise" | "ca-compromise" => Ok(RevocationReason::CACompromise),
            "affiliationchanged" | "affiliation-changed" => {
                Ok(RevocationReason::AffiliationChanged)
            }
            "superseded" => Ok(RevocationReason::Superseded),
            "cessationofoperation" | "cessation" => Ok(RevocationReason::CessationOfOperation),
            "certificatehold" | "hold" => Ok(RevocationReason::CertificateHold),
            "privilegewithdrawn" | "privilege-withdrawn" => {
                Ok(RevocationReason::PrivilegeWithdrawn)
            }
            _ => Err(Error::InvalidInput(format!(
                "Invalid revocation reason: {}",
                s
            ))),
        }
    }
}

pub(crate) fn offset_from_chrono(dt: DateTime<Utc>) -> Result<time::OffsetDateTime> {
    time::OffsetDateTime::from_unix_timestamp(dt.timestamp())
        .map_err(|e| Error::CertGen(format!("Invalid timestamp: {}", e)))
}

pub(crate) fn chrono_from_offset(dt: time::OffsetDateTime) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(dt.unix_timestamp(), 0)
        .ok_or_else(|| Error::Parse(format!("Timestamp out of range: {}", dt)))
}

pub(crate) fn chrono_from_unix(ts: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(ts, 0)
        .ok_or_else(|| Error::Parse(format!("Timestamp out of range: {}", ts)))
}

/// Drops sub-second precision; X.509 and OCSP timestamps carry whole seconds.
pub(crate) fn truncate_to_seconds(dt: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(dt.timestamp(), 0).unwrap_or(dt)
}

#[cfg(feature = "json")]
use serde::{Deserialize, Serialize};

#[cfg(feature = "json")]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateInfo {
    pub subject: String,
    pub issuer: String,
    pub serial_number: String,
    pub not_before: String,
    pub not_after: String,
    pub fingerprint: String,
    pub subject_alt_names: Vec<String>,
    pub is_ca: bool,
    pub key_usage: Vec<String>,
    pub extended_key_usage: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_normalization() {
        let a = SerialNumber::from_be_bytes(&[0x00, 0x00, 0x8f, 0x01]);
        let b = SerialNumber::from_be_bytes(&[0x8f, 0x01]);
        assert_eq!(a, b);
        assert_eq!(a.to_hex(), "8f01");
        assert_eq!(SerialNumber::from_hex("8F:01").unwrap(), b);
        assert!(SerialNumber::from_be_bytes(&[0, 0]).is_zero());
    }

    #[test]
    fn test_template_rejects_inverted_validity() {
        let now = Utc::now();
        let template = CertificateTemplate::new("svc", CertType::Client)
            .with_validity(now, now - Duration::seconds(1));
        assert!(matches!(
            template.validate(),
            Err(Error::InvalidTemplate(_))
        ));

        let equal = CertificateTemplate::new("svc", CertType::Client).with_validity(now, now);
        assert!(matches!(equal.validate(), Err(Error::InvalidTemplate(_))));
    }

    #[test]
    fn test_template_validity_within_one_second_is_empty() {
        let second = truncate_to_seconds(Utc::now());
        let template = CertificateTemplate::new("svc", CertType::Client).with_validity(
            second + Duration::milliseconds(100),
            second + Duration::milliseconds(900),
        );
        assert!(matches!(
            template.validate(),
            Err(Error::InvalidTemplate(_))
        ));

        let template = template.with_validity(second, second + Duration::seconds(1));
        assert!(template.validate().is_ok());
    }

    #[test]
    fn test_server_template_requires_san() {
        let template = CertificateTemplate::new("my-server", CertType::Server);
        assert!(matches!(
            template.validate(),
            Err(Error::InvalidTemplate(_))
        ));

        let san = SubjectAltName::new().with_ip("127.0.0.1".parse().unwrap());
        let template = template.with_san(san);
        assert!(template.validate().is_ok());
    }

    #[test]
    fn test_client_template_without_san_is_valid() {
        let template = CertificateTemplate::new("alice", CertType::Client);
        assert!(template.validate().is_ok());
    }

    #[test]
    fn test_parsing_names() {
        assert_eq!("prime256v1".parse::<Curve>().unwrap(), Curve::P256);
        assert!("rsa4096".parse::<Curve>().is_err());
        assert_eq!("both".parse::<CertType>().unwrap(), CertType::Both);
        assert_eq!(
            "code-signing".parse::<ExtendedKeyUsage>().unwrap(),
            ExtendedKeyUsage::CodeSigning
        );
        assert_eq!(
            "key-compromise".parse::<RevocationReason>().unwrap(),
            RevocationReason::KeyCompromise
        );
    }

    #[test]
    fn test_revocation_codes() {
        for reason in [
            RevocationReason::Unspecified,
            RevocationReason::KeyCompromise,
            RevocationReason::RemoveFromCRL,
            RevocationReason::AACompromise,
        ] {
            assert_eq!(RevocationReason::from_code(reason.to_code()), Some(reason));
        }
        assert_eq!(RevocationReason::from_code(7), None);
    }

    #[test]
    fn test_dn_display() {
        let dn = DistinguishedName::new("my-ca").with_organization("Acme Co");
        assert_eq!(dn.to_string(), "CN=my-ca, O=Acme Co");

        let no_cn = DistinguishedName::new("").with_organization("Acme Co");
        assert_eq!(no_cn.to_string(), "O=Acme Co");
        assert!(no_cn
            .to_rcgen()
            .get(&rcgen::DnType::CommonName)
            .is_none());
    }
}
