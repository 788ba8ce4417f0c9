//! Human-readable and JSON rendering of certificate chains and staples.

use crate::certificate::Certificate;
use crate::error::Result;
use crate::ocsp::{CertStatus, OcspResponse, ResponderId};
use chrono::{DateTime, Utc};
use colored::Colorize;

pub enum OutputFormat {
    Pretty,
    #[cfg(feature = "json")]
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "pretty" | "text" => Ok(OutputFormat::Pretty),
            #[cfg(feature = "json")]
            "json" => Ok(OutputFormat::Json),
            _ => Err(crate::error::Error::InvalidInput(format!(
                "Unsupported output format: {}",
                s
            ))),
        }
    }
}

fn validity_status(certificate: &Certificate, now: DateTime<Utc>) -> (&'static str, bool) {
    if now < certificate.not_before() {
        ("Not yet valid", false)
    } else if now > certificate.not_after() {
        ("Expired", false)
    } else {
        ("Valid", true)
    }
}

fn san_strings(certificate: &Certificate) -> Vec<String> {
    let san = certificate.subject_alt_names();
    san.dns_names
        .iter()
        .map(|dns| format!("DNS:{}", dns))
        .chain(san.ip_addresses.iter().map(|ip| format!("IP:{}", ip)))
        .collect()
}

fn chain_label(idx: usize, certificate: &Certificate, len: usize) -> &'static str {
    if idx == 0 {
        "End-Entity Certificate"
    } else if idx == len - 1 && certificate.is_self_issued() {
        "Root CA Certificate"
    } else {
        "Intermediate CA Certificate"
    }
}

/// Renders `chain` and, when present, the staple that came with it.
pub fn display_chain(
    chain: &[Certificate],
    staple: Option<&OcspResponse>,
    now: DateTime<Utc>,
    format: OutputFormat,
) -> Result<String> {
    match format {
        OutputFormat::Pretty => Ok(display_pretty(chain, staple, now)),
        #[cfg(feature = "json")]
        OutputFormat::Json => display_json(chain, staple, now),
    }
}

fn display_pretty(
    chain: &[Certificate],
    staple: Option<&OcspResponse>,
    now: DateTime<Utc>,
) -> String {
    let mut output = String::new();

    output.push_str(&format!("\n{}\n", "Certificate Chain".bold().cyan()));
    output.push_str(&format!("{}\n\n", "=".repeat(80)));

    for (idx, cert) in chain.iter().enumerate() {
        output.push_str(&format!(
            "{} {}\n",
            "Certificate".bold(),
            format!("[{}]", idx).dimmed()
        ));
        output.push_str(&format!(
            "{}: {}\n",
            "Type".bold(),
            chain_label(idx, cert, chain.len())
        ));
        output.push_str(&format!("{}\n", "-".repeat(80)));

        output.push_str(&format!("  {}: {}\n", "Subject".bold().yellow(), cert.subject()));
        output.push_str(&format!("  {}: {}\n", "Issuer".bold().yellow(), cert.issuer()));
        output.push_str(&format!(
            "  {}: {}\n",
            "Serial Number".bold().yellow(),
            cert.serial()
        ));

        let (status, valid) = validity_status(cert, now);
        let status = if valid { status.green() } else { status.red() };
        output.push_str(&format!("  {}: {}\n", "Validity Status".bold().yellow(), status));
        output.push_str(&format!(
            "  {}: {}\n",
            "Not Before".bold().yellow(),
            cert.not_before().to_rfc3339().dimmed()
        ));
        output.push_str(&format!(
            "  {}: {}\n",
            "Not After".bold().yellow(),
            cert.not_after().to_rfc3339().dimmed()
        ));
        output.push_str(&format!(
            "  {}: {}\n",
            "Public Key".bold().yellow(),
            format!("ECDSA P-256 ({})", cert.public_key().fingerprint()).dimmed()
        ));
        output.push_str(&format!(
            "  {}: {}\n",
            "Fingerprint".bold().yellow(),
            cert.fingerprint().dimmed()
        ));

        if cert.is_ca() {
            output.push_str(&format!(
                "  {}: {}\n",
                "CA Certificate".bold().yellow(),
                "Yes".green()
            ));
        }

        let sans = san_strings(cert);
        if !sans.is_empty() {
            output.push_str(&format!("  {}:\n", "Subject Alternative Names".bold().yellow()));
            for san in &sans {
                output.push_str(&format!("    - {}\n", san.cyan()));
            }
        }

        if !cert.key_usage().is_empty() {
            let names: Vec<_> = cert.key_usage().iter().map(|ku| ku.name()).collect();
            output.push_str(&format!(
                "  {}: {}\n",
                "Key Usage".bold().yellow(),
                names.join(", ").dimmed()
            ));
        }

        if !cert.extended_key_usage().is_empty() {
            let names: Vec<_> = cert.extended_key_usage().iter().map(|eku| eku.name()).collect();
            output.push_str(&format!(
                "  {}: {}\n",
                "Extended Key Usage".bold().yellow(),
                names.join(", ").dimmed()
            ));
        }

        output.push('\n');
    }

    if let Some(response) = staple {
        output.push_str(&display_staple_pretty(response, now));
    }

    output.push_str(&format!("{}\n", "=".repeat(80)));
    output.push_str(&format!(
        "{}: {}\n",
        "Total Certificates".bold().cyan(),
        chain.len()
    ));
    output
}

fn display_staple_pretty(response: &OcspResponse, now: DateTime<Utc>) -> String {
    let mut output = String::new();
    output.push_str(&format!("{}\n", "OCSP Staple".bold()));
    output.push_str(&format!("{}\n", "-".repeat(80)));

    let responder = match response.responder_id() {
        ResponderId::ByKey(hash) => format!("key {}", hex::encode(hash)),
        ResponderId::ByName(_) => "by name".to_string(),
    };
    output.push_str(&format!("  {}: {}\n", "Responder".bold().yellow(), responder));
    output.push_str(&format!(
        "  {}: {}\n",
        "Produced At".bold().yellow(),
        response.produced_at().to_rfc3339().dimmed()
    ));

    for single in response.responses() {
        let status = match single.status {
            CertStatus::Good => single.status.to_string().green(),
            _ => single.status.to_string().red(),
        };
        output.push_str(&format!(
            "  {} {}: {}\n",
            "Serial".bold().yellow(),
            single.cert_id.serial,
            status
        ));
        output.push_str(&format!(
            "    {}: {}\n",
            "This Update".bold(),
            single.this_update.to_rfc3339().dimmed()
        ));
        let next_update = match single.next_update {
            Some(next) if !single.is_stale(now) => next.to_rfc3339().green(),
            Some(next) => format!("{} (stale)", next.to_rfc3339()).red(),
            None => "absent".red(),
        };
        output.push_str(&format!("    {}: {}\n", "Next Update".bold(), next_update));
    }
    output.push('\n');
    output
}

#[cfg(feature = "json")]
impl From<&Certificate> for crate::types::CertificateInfo {
    fn from(cert: &Certificate) -> Self {
        Self {
            subject: cert.subject().to_string(),
            issuer: cert.issuer().to_string(),
            serial_number: cert.serial().to_hex(),
            not_before: cert.not_before().to_rfc3339(),
            not_after: cert.not_after().to_rfc3339(),
            fingerprint: cert.fingerprint(),
            subject_alt_names: san_strings(cert),
            is_ca: cert.is_ca(),
            key_usage: cert.key_usage().iter().map(|ku| ku.name().to_string()).collect(),
            extended_key_usage: cert
                .extended_key_usage()
                .iter()
                .map(|eku| eku.name().to_string())
                .collect(),
        }
    }
}

#[cfg(feature = "json")]
fn display_json(
    chain: &[Certificate],
    staple: Option<&OcspResponse>,
    now: DateTime<Utc>,
) -> Result<String> {
    use crate::types::CertificateInfo;
    use serde::Serialize;

    #[derive(Serialize)]
    struct JsonSingle {
        serial_number: String,
        status: String,
        this_update: String,
        next_update: Option<String>,
        stale: bool,
    }

    #[derive(Serialize)]
    struct JsonStaple {
        produced_at: String,
        responses: Vec<JsonSingle>,
    }

    #[derive(Serialize)]
    struct JsonChain {
        total_certificates: usize,
        certificates: Vec<CertificateInfo>,
        staple: Option<JsonStaple>,
    }

    let json_chain = JsonChain {
        total_certificates: chain.len(),
        certificates: chain.iter().map(CertificateInfo::from).collect(),
        staple: staple.map(|response| JsonStaple {
            produced_at: response.produced_at().to_rfc3339(),
            responses: response
                .responses()
                .iter()
                .map(|single| JsonSingle {
                    serial_number: single.cert_id.serial.to_hex(),
                    status: single.status.name().to_string(),
                    this_update: single.this_update.to_rfc3339(),
                    next_update: single.next_update.map(|t| t.to_rfc3339()),
                    stale: single.is_stale(now),
                })
                .collect(),
        }),
    };

    Ok(serde_json::to_string_pretty(&json_chain)?)
}
