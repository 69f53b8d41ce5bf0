//! Issued certificate with the metadata needed for renewal decisions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while building or validating a certificate record
#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("Invalid domain: {0}")]
    InvalidDomain(String),

    #[error("No certificate found in PEM chain")]
    EmptyChain,

    #[error("Failed to parse PEM: {0}")]
    Pem(String),

    #[error("Failed to parse X.509 certificate: {0}")]
    X509(String),

    #[error("Certificate validity timestamp out of range: {0}")]
    InvalidTimestamp(i64),
}

/// A certificate chain and private key issued for a single domain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateRecord {
    /// Common name the certificate was issued for
    pub domain: String,
    /// Leaf certificate followed by intermediates, PEM encoded
    pub certificate_chain_pem: String,
    /// Private key matching the leaf certificate, PEM encoded
    pub private_key_pem: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    /// Serial number assigned by the issuing CA
    pub issuer_id: String,
    /// Vendor-side id once the certificate has been uploaded to the CDN
    pub cdn_cert_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl CertificateRecord {
    /// Build a record from a freshly issued chain, reading validity and serial
    /// from the leaf certificate.
    pub fn from_pem(
        domain: &str,
        certificate_chain_pem: String,
        private_key_pem: String,
    ) -> Result<Self, CertificateError> {
        let leaf = rustls_pemfile::certs(&mut certificate_chain_pem.as_bytes())
            .next()
            .ok_or(CertificateError::EmptyChain)?
            .map_err(|e| CertificateError::Pem(e.to_string()))?;

        let (_, cert) = x509_parser::parse_x509_certificate(leaf.as_ref())
            .map_err(|e| CertificateError::X509(e.to_string()))?;

        let validity = cert.validity();
        let not_before = timestamp(validity.not_before.timestamp())?;
        let not_after = timestamp(validity.not_after.timestamp())?;
        let issuer_id = cert.raw_serial_as_string();

        Ok(Self {
            domain: domain.to_string(),
            certificate_chain_pem,
            private_key_pem,
            not_before,
            not_after,
            issuer_id,
            cdn_cert_id: None,
            created_at: Utc::now(),
        })
    }

    /// Attach the id the CDN assigned on upload
    pub fn with_cdn_cert_id(mut self, cert_id: impl Into<String>) -> Self {
        self.cdn_cert_id = Some(cert_id.into());
        self
    }
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>, CertificateError> {
    DateTime::from_timestamp(secs, 0).ok_or(CertificateError::InvalidTimestamp(secs))
}

/// Validate a single-domain certificate name.
///
/// Domains double as file names in the certificate store, so anything that
/// could escape the store directory is rejected along with wildcards.
pub fn validate_domain(domain: &str) -> Result<(), CertificateError> {
    if domain.is_empty() {
        return Err(CertificateError::InvalidDomain(
            "Domain cannot be empty".to_string(),
        ));
    }

    if domain.contains(' ') {
        return Err(CertificateError::InvalidDomain(
            "Domain cannot contain spaces".to_string(),
        ));
    }

    if domain.starts_with('.') || domain.ends_with('.') {
        return Err(CertificateError::InvalidDomain(
            "Domain cannot start or end with a dot".to_string(),
        ));
    }

    if domain.contains('*') {
        return Err(CertificateError::InvalidDomain(
            "Wildcard domains are not supported".to_string(),
        ));
    }

    if domain.contains("..") || domain.contains('/') || domain.contains('\\') {
        return Err(CertificateError::InvalidDomain(format!(
            "Domain contains invalid path characters: {}",
            domain
        )));
    }

    Ok(())
}
