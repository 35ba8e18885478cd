//! TLS transport over TCP (rustls)

use crate::{BoxedStream, TransportAcceptor, TransportConnector, TransportError, TransportResult};
use async_trait::async_trait;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tether_cert::Certificate;
use tokio::net::TcpStream;
use tracing::{debug, warn};

fn crypto_provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Terminates TLS on accepted control connections
#[derive(Clone)]
pub struct TlsServerAcceptor {
    inner: tokio_rustls::TlsAcceptor,
}

impl TlsServerAcceptor {
    pub fn new(certificate: Certificate) -> TransportResult<Self> {
        let config = ServerConfig::builder_with_provider(crypto_provider())
            .with_safe_default_protocol_versions()
            .map_err(|e| TransportError::TlsError(e.to_string()))?
            .with_no_client_auth()
            .with_single_cert(certificate.cert_chain, certificate.private_key)
            .map_err(|e| TransportError::TlsError(format!("Invalid cert/key: {}", e)))?;

        Ok(Self {
            inner: tokio_rustls::TlsAcceptor::from(Arc::new(config)),
        })
    }
}

#[async_trait]
impl TransportAcceptor for TlsServerAcceptor {
    async fn accept_stream(&self, stream: TcpStream) -> TransportResult<BoxedStream> {
        stream.set_nodelay(true)?;
        let tls = self
            .inner
            .accept(stream)
            .await
            .map_err(|e| TransportError::TlsError(format!("TLS handshake failed: {}", e)))?;
        Ok(Box::new(tls))
    }

    fn protocol(&self) -> &'static str {
        "tls"
    }
}

/// How the agent verifies the relay's certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerVerification {
    /// Mozilla root store
    WebPki,
    /// Trust only the certificates in this PEM file
    CaFile(PathBuf),
    /// Accept any certificate (development only)
    Insecure,
}

/// Dials TLS connections to the relay
#[derive(Clone)]
pub struct TlsConnector {
    inner: tokio_rustls::TlsConnector,
    server_name: ServerName<'static>,
}

impl TlsConnector {
    pub fn new(server_name: &str, verification: ServerVerification) -> TransportResult<Self> {
        let server_name = ServerName::try_from(server_name.to_string()).map_err(|e| {
            TransportError::ConfigurationError(format!(
                "Invalid server name '{}': {}",
                server_name, e
            ))
        })?;

        let builder = ClientConfig::builder_with_provider(crypto_provider())
            .with_safe_default_protocol_versions()
            .map_err(|e| TransportError::TlsError(e.to_string()))?;

        let config = match verification {
            ServerVerification::WebPki => {
                let mut roots = RootCertStore::empty();
                roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
                builder.with_root_certificates(roots).with_no_client_auth()
            }
            ServerVerification::CaFile(path) => {
                let mut roots = RootCertStore::empty();
                let certs = tether_cert::load_certs(&path)
                    .map_err(|e| TransportError::ConfigurationError(e.to_string()))?;
                for cert in certs {
                    roots
                        .add(cert)
                        .map_err(|e| TransportError::TlsError(e.to_string()))?;
                }
                builder.with_root_certificates(roots).with_no_client_auth()
            }
            ServerVerification::Insecure => {
                warn!("⚠️  TLS certificate verification is DISABLED");
                builder
                    .dangerous()
                    .with_custom_certificate_verifier(SkipVerification::new())
                    .with_no_client_auth()
            }
        };

        Ok(Self {
            inner: tokio_rustls::TlsConnector::from(Arc::new(config)),
            server_name,
        })
    }
}

#[async_trait]
impl TransportConnector for TlsConnector {
    async fn connect(&self, addr: &str) -> TransportResult<BoxedStream> {
        let tcp = TcpStream::connect(addr)
            .await
            .map_err(|e| TransportError::ConnectionError(format!("{}: {}", addr, e)))?;
        tcp.set_nodelay(true)?;

        let tls = self
            .inner
            .connect(self.server_name.clone(), tcp)
            .await
            .map_err(|e| TransportError::TlsError(format!("TLS handshake failed: {}", e)))?;

        debug!("Connected to {} over tls", addr);
        Ok(Box::new(tls))
    }

    fn protocol(&self) -> &'static str {
        "tls"
    }
}

/// Certificate verifier that accepts anything
#[derive(Debug)]
struct SkipVerification;

impl SkipVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl rustls::client::danger::ServerCertVerifier for SkipVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}
