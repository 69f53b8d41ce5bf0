//! DNS-01 challenge providers
//!
//! A provider publishes the `_acme-challenge` TXT record for the duration of
//! an order and removes it afterwards.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

pub mod cloudflare;

pub use cloudflare::{CloudflareConfig, CloudflareDnsProvider};

/// Reference to a published TXT record, returned by the provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxtRecordHandle {
    record_id: String,
    record_name: String,
}

impl TxtRecordHandle {
    pub fn new(record_id: String, record_name: String) -> Self {
        Self {
            record_id,
            record_name,
        }
    }

    /// Provider-specific record id
    pub fn record_id(&self) -> &str {
        &self.record_id
    }

    pub fn record_name(&self) -> &str {
        &self.record_name
    }
}

/// Errors raised by DNS providers
#[derive(Debug, Error)]
pub enum DnsProviderError {
    #[error("Unknown DNS provider: {0}")]
    UnknownProvider(String),

    #[error("Missing DNS provider setting: {0}")]
    MissingSetting(&'static str),

    #[error("No DNS zone found for {0}")]
    ZoneNotFound(String),

    #[error("DNS provider rejected the request: {0}")]
    Provider(String),

    #[error("DNS provider request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// Common interface for DNS providers
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
#[async_trait]
pub trait DnsProvider: Send + Sync {
    /// Publish a TXT record and return a handle used for removal
    async fn publish_txt(
        &self,
        record_name: &str,
        record_value: &str,
    ) -> Result<TxtRecordHandle, DnsProviderError>;

    /// Remove a record published earlier
    async fn remove_txt(&self, handle: &TxtRecordHandle) -> Result<(), DnsProviderError>;
}

/// Build the provider named by `identifier` (the `DNS_PROVIDER` setting),
/// reading its credentials from the environment.
pub fn provider_from_env(identifier: &str) -> Result<Arc<dyn DnsProvider>, DnsProviderError> {
    match identifier.to_ascii_lowercase().as_str() {
        "cloudflare" => {
            let config = CloudflareConfig::from_env()?;
            Ok(Arc::new(CloudflareDnsProvider::new(config)?))
        }
        other => Err(DnsProviderError::UnknownProvider(other.to_string())),
    }
}
