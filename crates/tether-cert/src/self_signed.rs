//! Self-signed certificate generation for development and testing
//!
//! **DO NOT use in production** - use a CA-signed certificate instead.

use crate::CertError;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, SerialNumber};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::path::Path;

/// Names covered by the default development certificate
const DEFAULT_NAMES: &[&str] = &["localhost", "127.0.0.1", "::1"];

/// A self-signed certificate with its private key
pub struct SelfSignedCertificate {
    /// Certificate in DER format
    pub cert_der: CertificateDer<'static>,

    /// Private key in DER format
    pub key_der: PrivateKeyDer<'static>,

    /// Certificate in PEM format
    pub pem_cert: String,

    /// Private key in PEM format
    pub pem_key: String,
}

impl SelfSignedCertificate {
    /// Save certificate and key to PEM files
    pub fn save_to_files(
        &self,
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> std::io::Result<()> {
        std::fs::write(cert_path, &self.pem_cert)?;
        std::fs::write(key_path, &self.pem_key)?;
        Ok(())
    }

    pub fn into_certificate(self) -> crate::Certificate {
        crate::Certificate::new(vec![self.cert_der], self.key_der)
    }
}

/// Generate a certificate valid for localhost, 127.0.0.1 and ::1
pub fn generate_self_signed_cert() -> Result<SelfSignedCertificate, CertError> {
    let names: Vec<String> = DEFAULT_NAMES.iter().map(|s| s.to_string()).collect();
    generate_self_signed_cert_with_domains(&names)
}

/// Generate a certificate for the given DNS names / IP addresses
pub fn generate_self_signed_cert_with_domains(
    names: &[String],
) -> Result<SelfSignedCertificate, CertError> {
    let mut params = CertificateParams::new(names.to_vec())
        .map_err(|e| CertError::Generation(e.to_string()))?;

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "Tether Development Certificate");
    dn.push(DnType::OrganizationName, "Tether Dev");
    params.distinguished_name = dn;
    params.serial_number = Some(SerialNumber::from(rand::random::<u64>()));

    let key_pair = KeyPair::generate().map_err(|e| CertError::Generation(e.to_string()))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| CertError::Generation(e.to_string()))?;

    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
        .map_err(|e| CertError::Generation(e.to_string()))?;

    Ok(SelfSignedCertificate {
        cert_der: CertificateDer::from(cert.der().to_vec()),
        key_der,
        pem_cert: cert.pem(),
        pem_key: key_pair.serialize_pem(),
    })
}
