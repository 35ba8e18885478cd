//! Certificate handling for the relay's TLS listener
//!
//! Loads PEM certificate chains and private keys from disk, and generates
//! self-signed certificates for local development.

pub mod self_signed;

pub use self_signed::{
    generate_self_signed_cert, generate_self_signed_cert_with_domains, SelfSignedCertificate,
};

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum CertError {
    #[error("Failed to open {path}: {source}")]
    Open {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse PEM in {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("No certificates found in {0}")]
    NoCertificates(String),

    #[error("No private key found in {0}")]
    NoPrivateKey(String),

    #[error("Certificate generation failed: {0}")]
    Generation(String),
}

/// Certificate with private key
#[derive(Debug)]
pub struct Certificate {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub private_key: PrivateKeyDer<'static>,
}

impl Certificate {
    pub fn new(
        cert_chain: Vec<CertificateDer<'static>>,
        private_key: PrivateKeyDer<'static>,
    ) -> Self {
        Self {
            cert_chain,
            private_key,
        }
    }

    /// Load a certificate chain and its key from PEM files
    pub fn from_pem_files(
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<Self, CertError> {
        let cert_chain = load_certs(cert_path)?;
        let private_key = load_private_key(key_path)?;
        Ok(Self::new(cert_chain, private_key))
    }
}

fn open(path: &Path) -> Result<BufReader<File>, CertError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| CertError::Open {
            path: path.display().to_string(),
            source,
        })
}

/// Load every certificate from a PEM file
pub fn load_certs(path: impl AsRef<Path>) -> Result<Vec<CertificateDer<'static>>, CertError> {
    let path = path.as_ref();
    let mut reader = open(path)?;

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| CertError::Parse {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

    if certs.is_empty() {
        return Err(CertError::NoCertificates(path.display().to_string()));
    }

    debug!("Loaded {} certificate(s) from {}", certs.len(), path.display());
    Ok(certs)
}

/// Load the first private key from a PEM file
pub fn load_private_key(path: impl AsRef<Path>) -> Result<PrivateKeyDer<'static>, CertError> {
    let path = path.as_ref();
    let mut reader = open(path)?;

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| CertError::Parse {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?
        .ok_or_else(|| CertError::NoPrivateKey(path.display().to_string()))
}
