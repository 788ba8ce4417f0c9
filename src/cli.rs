use crate::ca::{AuthorityConfig, CertificateAuthority};
use crate::cert::{CertificateIssuer, IssuancePolicy};
use crate::certificate::Certificate;
use crate::csr::CsrBuilder;
use crate::error::{Error, Result};
use crate::fetch::fetch_peer;
use crate::inspect::{display_chain, OutputFormat};
use crate::keys::KeyPair;
use crate::ocsp::{CertStatus, HashAlgorithm, OcspResponse};
use crate::responder::{OcspResponder, ResponderConfig};
use crate::trust::{TrustBundle, TrustStore, TrustStoreConfig};
use crate::types::{CertType, Curve, DistinguishedName, ExtendedKeyUsage, RevocationReason};
use crate::verifier::{OcspVerifier, VerifierConfig};
use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "minipki")]
#[command(version, about = "A minimal self-hosted PKI with OCSP stapling", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    #[command(about = "Initialize a new root Certificate Authority")]
    Init {
        #[arg(short, long, help = "Common name for the CA")]
        cn: String,

        #[arg(short, long, help = "Organization name")]
        org: Option<String>,

        #[arg(short = 'u', long, help = "Organizational unit")]
        ou: Option<String>,

        #[arg(short = 'C', long, help = "Country code (2 letters)")]
        country: Option<String>,

        #[arg(short = 'S', long, help = "State or province")]
        state: Option<String>,

        #[arg(short = 'L', long, help = "Locality or city")]
        locality: Option<String>,

        #[arg(short = 'k', long, default_value = "p256", help = "Key curve")]
        curve: String,

        #[arg(short, long, default_value = "3650", help = "Validity in days")]
        validity: u32,

        #[arg(
            long,
            default_value = "ca.pem",
            env = "MINIPKI_CA_CERT",
            help = "CA certificate output path"
        )]
        cert_out: PathBuf,

        #[arg(
            long,
            default_value = "ca-key.pem",
            env = "MINIPKI_CA_KEY",
            help = "CA private key output path"
        )]
        key_out: PathBuf,
    },

    #[command(about = "Generate a key pair and a certificate signing request")]
    Request {
        #[arg(short, long, help = "Common name for the request")]
        cn: String,

        #[arg(short, long, help = "DNS Subject Alternative Names", value_delimiter = ',')]
        dns: Vec<String>,

        #[arg(short, long, help = "IP Subject Alternative Names", value_delimiter = ',')]
        ip: Vec<String>,

        #[arg(
            short,
            long,
            help = "Requested extended key usages (server, client)",
            value_delimiter = ','
        )]
        eku: Vec<String>,

        #[arg(short, long, help = "Organization name")]
        org: Option<String>,

        #[arg(long, default_value = "request.csr", help = "CSR output path")]
        csr_out: PathBuf,

        #[arg(long, default_value = "key.pem", help = "Private key output path")]
        key_out: PathBuf,
    },

    #[command(about = "Validate a CSR and issue a certificate for it")]
    Issue {
        #[arg(help = "CSR path (PEM or DER)")]
        csr: PathBuf,

        #[arg(
            short,
            long,
            default_value = "server",
            help = "Issuance profile: server, client, both"
        )]
        profile: String,

        #[arg(short, long, default_value = "90", help = "Validity in days")]
        validity: u32,

        #[arg(
            long,
            default_value = "ca.pem",
            env = "MINIPKI_CA_CERT",
            help = "CA certificate path"
        )]
        ca_cert: PathBuf,

        #[arg(long, default_value = "ca-key.pem", env = "MINIPKI_CA_KEY", help = "CA key path")]
        ca_key: PathBuf,

        #[arg(
            long,
            default_value = "30",
            env = "MINIPKI_SIGNING_TIMEOUT",
            help = "Signing timeout in seconds"
        )]
        signing_timeout: u64,

        #[arg(long, default_value = "cert.pem", help = "Certificate output path")]
        cert_out: PathBuf,

        #[arg(long, help = "Output full chain file")]
        chain_out: Option<PathBuf>,
    },

    #[command(about = "Build a signed OCSP staple for a certificate")]
    Staple {
        #[arg(help = "Certificate path")]
        cert: PathBuf,

        #[arg(short, long, default_value = "good", help = "Status: good, revoked, unknown")]
        status: String,

        #[arg(short, long, help = "Revocation reason (with --status revoked)")]
        reason: Option<String>,

        #[arg(short, long, default_value = "3600", help = "Seconds until nextUpdate")]
        window: i64,

        #[arg(long, help = "Hash the CertID with SHA-256 instead of SHA-1")]
        sha256: bool,

        #[arg(
            long,
            default_value = "ca.pem",
            env = "MINIPKI_CA_CERT",
            help = "CA certificate path"
        )]
        ca_cert: PathBuf,

        #[arg(long, default_value = "ca-key.pem", env = "MINIPKI_CA_KEY", help = "CA key path")]
        ca_key: PathBuf,

        #[arg(short, long, default_value = "staple.der", help = "Staple output path")]
        output: PathBuf,
    },

    #[command(about = "Verify a chain and its OCSP staple")]
    Verify {
        #[arg(long, help = "Chain path (PEM bundle, leaf first)", conflicts_with = "connect")]
        chain: Option<PathBuf>,

        #[arg(long, help = "Staple path (DER)")]
        staple: Option<PathBuf>,

        #[arg(long, help = "Fetch chain and staple from host:port")]
        connect: Option<String>,

        #[arg(short, long, env = "MINIPKI_TRUST_BUNDLE", help = "Trusted roots (PEM bundle)")]
        trust: Option<PathBuf>,

        #[arg(long, help = "Also require a staple for the root")]
        require_anchor_staple: bool,

        #[arg(long, help = "Verification time (RFC 3339), defaults to now")]
        at: Option<String>,
    },

    #[command(about = "Display a certificate chain and optional staple")]
    Inspect {
        #[arg(help = "Certificate or chain path (PEM)", required_unless_present = "connect")]
        path: Option<PathBuf>,

        #[arg(long, help = "Staple path (DER)")]
        staple: Option<PathBuf>,

        #[arg(long, help = "Fetch chain and staple from host:port", conflicts_with = "path")]
        connect: Option<String>,

        #[arg(short, long, default_value = "pretty", help = "Output format: pretty or json")]
        format: String,

        #[arg(short, long, help = "Save output to file")]
        output: Option<PathBuf>,
    },
}

pub fn run_cli() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Init {
            cn,
            org,
            ou,
            country,
            state,
            locality,
            curve,
            validity,
            cert_out,
            key_out,
        } => {
            let curve = curve.parse::<Curve>()?;
            let mut subject = DistinguishedName::new(cn);

            if let Some(o) = org {
                subject = subject.with_organization(o);
            }
            if let Some(u) = ou {
                subject = subject.with_organizational_unit(u);
            }
            if let Some(c) = country {
                subject = subject.with_country(c);
            }
            if let Some(s) = state {
                subject = subject.with_state(s);
            }
            if let Some(l) = locality {
                subject = subject.with_locality(l);
            }

            let config = AuthorityConfig::default().with_curve(curve);
            let validity = Duration::days(validity.into());
            let ca = CertificateAuthority::with_config(subject, validity, config)?;
            ca.save_pem(&cert_out, &key_out)?;

            println!("{}", "Root CA created successfully!".green().bold());
            println!("  {}: {}", "Certificate".cyan(), cert_out.display());
            println!("  {}: {}", "Private Key".cyan(), key_out.display());
            println!("  {}: {}", "Serial".cyan(), ca.root().serial());
            println!("  {}: {}", "Curve".cyan(), curve.name());
            println!("  {}: {} days", "Validity".cyan(), validity);
        }

        Commands::Request {
            cn,
            dns,
            ip,
            eku,
            org,
            csr_out,
            key_out,
        } => {
            let key = KeyPair::generate(Curve::P256)?;
            let mut subject = DistinguishedName::new(cn.clone());
            if let Some(o) = org {
                subject = subject.with_organization(o);
            }

            let mut builder = CsrBuilder::new(cn).with_subject(subject);
            for d in dns {
                builder = builder.with_dns_san(d);
            }
            for ip_str in ip {
                builder = builder.with_ip_san(parse_ip(&ip_str)?);
            }
            for e in eku {
                builder = builder.request_extended_key_usage(e.parse::<ExtendedKeyUsage>()?);
            }

            fs::write(&csr_out, builder.build_pem(&key)?)?;
            fs::write(&key_out, key.export_pem()?.as_bytes())?;

            println!("{}", "Certificate request created!".green().bold());
            println!("  {}: {}", "Request".cyan(), csr_out.display());
            println!("  {}: {}", "Private Key".cyan(), key_out.display());
            println!("  {}: {}", "Key Fingerprint".cyan(), key.public_key().fingerprint());
        }

        Commands::Issue {
            csr,
            profile,
            validity,
            ca_cert,
            ca_key,
            signing_timeout,
            cert_out,
            chain_out,
        } => {
            let config = AuthorityConfig::default()
                .with_signing_timeout(std::time::Duration::from_secs(signing_timeout));
            let ca = CertificateAuthority::load_pem(ca_cert, ca_key, config)?;

            let policy = IssuancePolicy::for_type(profile.parse::<CertType>()?)
                .with_validity(Duration::days(validity.into()));
            let der = CertificateIssuer::new(policy).issue(&ca, &fs::read(&csr)?)?;
            let certificate = Certificate::from_der(&der)?;
            fs::write(&cert_out, certificate.to_pem())?;

            println!("{}", "Certificate issued successfully!".green().bold());
            println!("  {}: {}", "Subject".cyan(), certificate.subject());
            println!("  {}: {}", "Serial".cyan(), certificate.serial());
            println!("  {}: {}", "Not After".cyan(), certificate.not_after().to_rfc3339());
            println!("  {}: {}", "Certificate".cyan(), cert_out.display());

            if let Some(chain_path) = chain_out {
                fs::write(&chain_path, certificate.to_pem() + &ca.root_pem())?;
                println!("  {}: {}", "Full Chain".cyan(), chain_path.display());
            }
        }

        Commands::Staple {
            cert,
            status,
            reason,
            window,
            sha256,
            ca_cert,
            ca_key,
            output,
        } => {
            let ca = CertificateAuthority::load_pem(ca_cert, ca_key, AuthorityConfig::default())?;
            let subject = read_chain(&cert)?.remove(0);

            let now = Utc::now();
            let status = parse_status(&status, reason.as_deref(), now)?;
            let hash = if sha256 { HashAlgorithm::Sha256 } else { HashAlgorithm::Sha1 };
            let responder = OcspResponder::new(ResponderConfig::default().with_cert_id_hash(hash));
            let window = Duration::seconds(window);
            let der = responder.build_response(&ca, &subject, status, now, window)?;
            fs::write(&output, &der)?;

            println!("{}", "OCSP staple created!".green().bold());
            println!("  {}: {}", "Serial".cyan(), subject.serial());
            println!("  {}: {}", "Status".cyan(), status);
            println!(
                "  {}: {}",
                "Next Update".cyan(),
                (now + window).to_rfc3339()
            );
            println!("  {}: {}", "Output".cyan(), output.display());
        }

        Commands::Verify {
            chain,
            staple,
            connect,
            trust,
            require_anchor_staple,
            at,
        } => {
            let now = match at {
                Some(at) => parse_time(&at)?,
                None => Utc::now(),
            };
            let (chain, staple) =
                load_peer(chain.as_deref(), staple.as_deref(), connect.as_deref())?;

            let verifier = OcspVerifier::new(
                VerifierConfig::default().with_require_anchor_staple(require_anchor_staple),
            );
            match trust {
                Some(trust_path) => {
                    let bundle = TrustBundle::from_pem(1, &fs::read_to_string(trust_path)?)?;
                    let store = TrustStore::new(bundle, TrustStoreConfig::default());
                    verifier.verify_peer(&store, &chain, staple.as_deref(), now)?;
                }
                None => verifier.verify(&chain, staple.as_deref(), now)?,
            }

            println!("{}", "Chain and staple verified!".green().bold());
            println!("  {}: {}", "Subject".cyan(), chain[0].subject());
            println!("  {}: {}", "Serial".cyan(), chain[0].serial());
            println!("  {}: {}", "Checked At".cyan(), now.to_rfc3339());
        }

        Commands::Inspect {
            path,
            staple,
            connect,
            format,
            output,
        } => {
            let format = format.parse::<OutputFormat>()?;
            let (chain, staple) =
                load_peer(path.as_deref(), staple.as_deref(), connect.as_deref())?;
            let staple = staple.map(|der| OcspResponse::parse(&der)).transpose()?;

            let display = display_chain(&chain, staple.as_ref(), Utc::now(), format)?;
            println!("{}", display);

            if let Some(out_path) = output {
                fs::write(&out_path, &display)?;
                println!("\n{}", format!("Saved to: {}", out_path.display()).green());
            }
        }
    }

    Ok(())
}

type Peer = (Vec<Certificate>, Option<Vec<u8>>);

fn load_peer(chain: Option<&Path>, staple: Option<&Path>, connect: Option<&str>) -> Result<Peer> {
    if let Some(target) = connect {
        let (host, port) = parse_target(target)?;
        println!("{}", format!("Fetching certificate chain from {}...", target).cyan());
        let peer = fetch_peer(host, port)?;
        return Ok((peer.chain, peer.staple));
    }

    let chain_path = chain.ok_or_else(|| {
        Error::InvalidInput("either a chain path or --connect is required".into())
    })?;
    let chain = read_chain(chain_path)?;
    let staple = staple.map(fs::read).transpose()?;
    Ok((chain, staple))
}

fn read_chain(path: &Path) -> Result<Vec<Certificate>> {
    let chain = Certificate::parse_pem_bundle(&fs::read_to_string(path)?)?;
    if chain.is_empty() {
        return Err(Error::InvalidInput(format!(
            "no certificates in {}",
            path.display()
        )));
    }
    Ok(chain)
}

fn parse_target(target: &str) -> Result<(&str, u16)> {
    let (host, port) = target
        .rsplit_once(':')
        .ok_or_else(|| Error::InvalidInput("Target must be in format host:port".to_string()))?;
    let port = port
        .parse()
        .map_err(|_| Error::InvalidInput("Invalid port number".to_string()))?;
    Ok((host, port))
}

fn parse_ip(s: &str) -> Result<IpAddr> {
    s.parse()
        .map_err(|_| Error::InvalidInput(format!("Invalid IP address: {}", s)))
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::InvalidInput(format!("Invalid time '{}': {}", s, e)))
}

fn parse_status(status: &str, reason: Option<&str>, now: DateTime<Utc>) -> Result<CertStatus> {
    match status.to_lowercase().as_str() {
        "good" => Ok(CertStatus::Good),
        "unknown" => Ok(CertStatus::Unknown),
        "revoked" => Ok(CertStatus::Revoked {
            revoked_at: now,
            reason: reason.map(str::parse::<RevocationReason>).transpose()?,
        }),
        _ => Err(Error::InvalidInput(format!("Invalid status: {}", status))),
    }
}
