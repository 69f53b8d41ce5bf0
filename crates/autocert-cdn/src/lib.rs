//! CDN control plane access
//!
//! [`CdnController`] is the narrow interface the renewal orchestrator drives;
//! [`QiniuClient`] implements it against the Qiniu CDN REST API.

pub mod qiniu;
pub mod signing;
pub mod types;

use async_trait::async_trait;
use autocert_cert::CertificateRecord;
use thiserror::Error;

pub use qiniu::{QiniuClient, QiniuConfig};
pub use types::{CertInfo, DomainHttpsState};

/// Errors returned by CDN vendor calls
#[derive(Debug, Error)]
pub enum CdnError {
    /// The vendor answered with an error code in the response body
    #[error("CDN API error {code}: {message}")]
    Api { code: i64, message: String },

    #[error("CDN returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid response body: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Request signing failed: {0}")]
    Signing(String),
}

impl CdnError {
    /// Vendor error code, when the failure came from the API itself
    pub fn code(&self) -> Option<i64> {
        match self {
            CdnError::Api { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Domain and certificate operations against the CDN vendor
#[async_trait]
pub trait CdnController: Send + Sync {
    /// Current HTTPS binding of `domain`
    async fn get_domain_https_state(&self, domain: &str) -> Result<DomainHttpsState, CdnError>;

    /// Details of an uploaded certificate
    async fn get_cert_info(&self, cert_id: &str) -> Result<CertInfo, CdnError>;

    /// Upload a certificate, returning the vendor-assigned id
    async fn upload_certificate(&self, record: &CertificateRecord) -> Result<String, CdnError>;

    /// Turn HTTPS on for a domain that has none yet
    async fn enable_https(
        &self,
        domain: &str,
        cert_id: &str,
        force_https: bool,
    ) -> Result<(), CdnError>;

    /// Point an HTTPS-enabled domain at another certificate
    async fn update_https_cert_id(
        &self,
        domain: &str,
        cert_id: &str,
        force_https: bool,
    ) -> Result<(), CdnError>;

    async fn delete_certificate(&self, cert_id: &str) -> Result<(), CdnError>;
}
