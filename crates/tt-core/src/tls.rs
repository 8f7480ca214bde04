//! TLS certificate material and rustls configuration
//!
//! The listener presents a certificate (self-signed unless PEM files are
//! configured). Agents identify it by the SHA-256 fingerprint of its DER
//! encoding rather than by a CA chain.

use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{ring, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::DigitallySignedStruct;
use sha2::{Digest, Sha256};

use crate::error::TlsError;

/// Message carried by the handshake error when pinning fails
pub const FINGERPRINT_MISMATCH: &str = "fingerprint mismatch";

/// Subject names on generated certificates
const CERT_NAMES: &[&str] = &["localhost", "tether-listener"];

/// A certificate with its private key
pub struct CertificateBundle {
    pub cert_der: CertificateDer<'static>,
    pub key_der: PrivateKeyDer<'static>,
    pub cert_pem: String,
    /// Lowercase hex SHA-256 of `cert_der`
    pub fingerprint: String,
}

/// Lowercase hex SHA-256 of a DER certificate (64 characters)
pub fn fingerprint(cert_der: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(cert_der);
    hex::encode(hasher.finalize())
}

/// Generate a fresh self-signed certificate
pub fn generate_certificate() -> Result<CertificateBundle, TlsError> {
    let names: Vec<String> = CERT_NAMES.iter().map(|s| s.to_string()).collect();
    let certified = rcgen::generate_simple_self_signed(names)
        .map_err(|e| TlsError::Generate(e.to_string()))?;

    let cert_der = certified.cert.der().clone();
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
        certified.key_pair.serialize_der(),
    ));

    Ok(CertificateBundle {
        fingerprint: fingerprint(&cert_der),
        cert_pem: certified.cert.pem(),
        cert_der,
        key_der,
    })
}

/// Load a certificate and key from PEM files
pub fn load_certificate(cert_path: &Path, key_path: &Path) -> Result<CertificateBundle, TlsError> {
    let cert_pem = std::fs::read_to_string(cert_path)?;
    let key_pem = std::fs::read(key_path)?;

    let cert_der = rustls_pemfile::certs(&mut BufReader::new(cert_pem.as_bytes()))
        .next()
        .transpose()?
        .ok_or_else(|| TlsError::InvalidPem(format!("no certificate in {:?}", cert_path)))?;

    let key_der = rustls_pemfile::private_key(&mut BufReader::new(key_pem.as_slice()))?
        .ok_or_else(|| TlsError::InvalidPem(format!("no private key in {:?}", key_path)))?;

    Ok(CertificateBundle {
        fingerprint: fingerprint(&cert_der),
        cert_pem,
        cert_der,
        key_der,
    })
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(ring::default_provider())
}

/// Server configuration presenting `bundle`
pub fn server_config(bundle: &CertificateBundle) -> Result<Arc<rustls::ServerConfig>, TlsError> {
    let config = rustls::ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(vec![bundle.cert_der.clone()], bundle.key_der.clone_key())?;
    Ok(Arc::new(config))
}

/// Client configuration that accepts only a certificate with the expected
/// fingerprint. With `None`, any certificate is accepted.
pub fn client_config(
    expected_fingerprint: Option<&str>,
) -> Result<Arc<rustls::ClientConfig>, TlsError> {
    let provider = provider();
    let verifier = Arc::new(FingerprintVerifier {
        expected: expected_fingerprint.map(|f| f.to_ascii_lowercase()),
        provider: Arc::clone(&provider),
    });

    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// Server name for the handshake. The name is not verified, so anything
/// unparsable falls back to loopback.
pub fn server_name(host: &str) -> ServerName<'static> {
    ServerName::try_from(host.to_string()).unwrap_or_else(|_| {
        ServerName::IpAddress(std::net::IpAddr::from(std::net::Ipv4Addr::LOCALHOST).into())
    })
}

/// Whether a handshake I/O error came from fingerprint pinning
pub fn is_fingerprint_mismatch(err: &std::io::Error) -> bool {
    err.get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>())
        .map(|e| matches!(e, rustls::Error::General(msg) if msg == FINGERPRINT_MISMATCH))
        .unwrap_or(false)
}

/// Verifies the leaf certificate by fingerprint, and handshake signatures
/// with the provider's algorithms.
#[derive(Debug)]
struct FingerprintVerifier {
    expected: Option<String>,
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for FingerprintVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        match &self.expected {
            Some(expected) => {
                let actual = fingerprint(end_entity);
                if &actual != expected {
                    tracing::error!(
                        "Listener certificate fingerprint {} does not match pinned {}",
                        actual,
                        expected
                    );
                    return Err(rustls::Error::General(FINGERPRINT_MISMATCH.to_string()));
                }
            }
            None => {
                tracing::warn!("No certificate fingerprint pinned; accepting any listener certificate");
            }
        }
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
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
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
