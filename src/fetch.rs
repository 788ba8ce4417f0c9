//! Fetches a remote server's certificate chain and OCSP staple over TLS.
//!
//! The handshake accepts whatever the server presents; judging the chain
//! and staple is left to [`crate::OcspVerifier`] and [`crate::TrustStore`].

use crate::certificate::Certificate;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use tracing::debug;

/// What a server presented during the handshake.
#[derive(Debug, Clone)]
pub struct PeerCertificates {
    pub chain: Vec<Certificate>,
    pub staple: Option<Vec<u8>>,
}

#[derive(Default)]
struct Captured {
    chain: Vec<Vec<u8>>,
    staple: Vec<u8>,
}

#[derive(Debug)]
struct CaptureVerifier {
    captured: Arc<Mutex<Captured>>,
    provider: Arc<rustls::crypto::CryptoProvider>,
}

impl std::fmt::Debug for Captured {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Captured")
            .field("certificates", &self.chain.len())
            .field("staple_len", &self.staple.len())
            .finish()
    }
}

impl ServerCertVerifier for CaptureVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let mut captured = self.captured.lock();
        captured.chain = std::iter::once(end_entity)
            .chain(intermediates)
            .map(|cert| cert.to_vec())
            .collect();
        captured.staple = ocsp_response.to_vec();
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Connects to `host:port`, completes a handshake and returns the presented
/// chain together with the stapled OCSP response, if any.
pub fn fetch_peer(host: &str, port: u16) -> Result<PeerCertificates> {
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| Error::InvalidInput(format!("Invalid server name '{}': {}", host, e)))?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let captured = Arc::new(Mutex::new(Captured::default()));
    let verifier = Arc::new(CaptureVerifier {
        captured: Arc::clone(&captured),
        provider: Arc::clone(&provider),
    });

    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth();

    let mut conn = rustls::ClientConnection::new(Arc::new(config), server_name)
        .map_err(|e| Error::Tls(format!("Failed to create TLS connection: {}", e)))?;

    let addr = format!("{}:{}", host, port);
    let mut sock = TcpStream::connect(&addr)?;
    let mut tls = rustls::Stream::new(&mut conn, &mut sock);

    let request = format!("HEAD / HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n", host);
    tls.write_all(request.as_bytes())
        .map_err(|e| Error::Tls(format!("Handshake with {} failed: {}", addr, e)))?;

    // The chain and staple are already captured; the response body is not needed.
    let mut response = [0u8; 512];
    if let Err(e) = tls.read(&mut response) {
        debug!(peer = %addr, error = %e, "no response after handshake");
    }

    let captured = std::mem::take(&mut *captured.lock());
    if captured.chain.is_empty() {
        return Err(Error::Tls(format!("{} presented no certificates", addr)));
    }

    let chain = captured
        .chain
        .iter()
        .map(|der| Certificate::from_der(der))
        .collect::<Result<Vec<_>>>()?;
    let staple = Some(captured.staple).filter(|staple| !staple.is_empty());

    debug!(
        peer = %addr,
        certificates = chain.len(),
        stapled = staple.is_some(),
        "fetched peer certificates"
    );
    Ok(PeerCertificates { chain, staple })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::CertificateAuthority;
    use crate::cert::CertificateBuilder;
    use crate::responder::OcspResponder;
    use crate::staple::StapleStore;
    use crate::types::DistinguishedName;
    use chrono::{Duration, Utc};
    use std::net::TcpListener;
    use std::thread;

    /// Serves one connection. With `respond` unset the socket is dropped
    /// right after the request arrives, without a close_notify.
    fn serve_once(store: StapleStore, respond: bool) -> (u16, thread::JoinHandle<()>) {
        let config = rustls::ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(store));
        let config = Arc::new(config);

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let (sock, _) = listener.accept().unwrap();
            let conn = rustls::ServerConnection::new(config).unwrap();
            let mut tls = rustls::StreamOwned::new(conn, sock);
            let mut buf = [0u8; 512];
            let _ = tls.read(&mut buf);
            if !respond {
                return;
            }
            let _ = tls.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n");
            tls.conn.send_close_notify();
            let _ = tls.flush();
        });
        (port, handle)
    }

    #[test]
    fn test_fetch_captures_chain_and_staple() {
        let ca =
            CertificateAuthority::new(DistinguishedName::new("my-ca"), Duration::days(1)).unwrap();
        let leaf = CertificateBuilder::server("my-server")
            .with_ip_san("127.0.0.1".parse().unwrap())
            .issue(&ca)
            .unwrap();
        let staple = OcspResponder::default()
            .build_current(&ca, &leaf.certificate, Utc::now())
            .unwrap();

        let store = StapleStore::new();
        store
            .insert("my-server", leaf.full_chain(), &leaf.key_pair, Some(staple.clone()))
            .unwrap();

        let (port, server) = serve_once(store, true);
        let peer = fetch_peer("127.0.0.1", port).unwrap();
        server.join().unwrap();

        assert_eq!(peer.chain, leaf.full_chain());
        assert_eq!(peer.staple, Some(staple));
    }

    #[test]
    fn test_fetch_tolerates_reset_after_handshake() {
        let ca =
            CertificateAuthority::new(DistinguishedName::new("my-ca"), Duration::days(1)).unwrap();
        let leaf = CertificateBuilder::server("my-server")
            .with_ip_san("127.0.0.1".parse().unwrap())
            .issue(&ca)
            .unwrap();
        let store = StapleStore::new();
        store
            .insert("my-server", leaf.full_chain(), &leaf.key_pair, None)
            .unwrap();

        let (port, server) = serve_once(store, false);
        let peer = fetch_peer("127.0.0.1", port).unwrap();
        server.join().unwrap();

        assert_eq!(peer.chain, leaf.full_chain());
        assert!(peer.staple.is_none());
    }

    #[test]
    fn test_invalid_server_name() {
        assert!(matches!(
            fetch_peer("not a host name", 443),
            Err(Error::InvalidInput(_))
        ));
    }
}
