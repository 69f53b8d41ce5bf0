//! ACME client for certificate provisioning via Let's Encrypt
//!
//! Uses DNS-01 validation through a [`DnsProvider`]. Account credentials are
//! persisted to disk and reused across runs.

use async_trait::async_trait;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, Order, OrderStatus, RetryPolicy,
};
use rcgen::{CertificateParams, DistinguishedName, KeyPair};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::authority::CertificateAuthority;
use crate::dns::{DnsProvider, DnsProviderError, TxtRecordHandle};
use crate::record::{validate_domain, CertificateError, CertificateRecord};
use crate::storage::{write_private, StorageError};

pub const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";
pub const LETS_ENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

/// ACME errors
#[derive(Debug, Error)]
pub enum AcmeError {
    #[error("Account creation failed: {0}")]
    AccountCreationFailed(String),

    #[error("No ACME account available for renewal")]
    AccountUnavailable,

    #[error("Order creation failed: {0}")]
    OrderCreationFailed(String),

    #[error("Challenge failed: {0}")]
    ChallengeFailed(String),

    #[error("Certificate finalization failed: {0}")]
    FinalizationFailed(String),

    #[error("Invalid domain: {0}")]
    InvalidDomain(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Account storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Certificate generation error: {0}")]
    CertGen(String),

    #[error("Issued certificate unusable: {0}")]
    Certificate(#[from] CertificateError),

    #[error("DNS provider error: {0}")]
    Dns(#[from] DnsProviderError),
}

/// ACME configuration
#[derive(Debug, Clone)]
pub struct AcmeConfig {
    /// Use Let's Encrypt staging environment (for testing)
    pub use_staging: bool,
    /// Custom directory URL, overrides `use_staging`
    pub directory_url: Option<String>,
    /// PEM bundle of extra trusted roots for the ACME server (e.g. Pebble)
    pub root_ca: Option<PathBuf>,
    /// Where the account credentials are kept
    pub account_path: PathBuf,
    /// Wait between publishing the TXT record and asking for validation
    pub propagation_delay: Duration,
    /// Upper bound for order and certificate polling
    pub order_timeout: Duration,
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            use_staging: false,
            directory_url: None,
            root_ca: None,
            account_path: PathBuf::from("./.certs/account.json"),
            propagation_delay: Duration::from_secs(30),
            order_timeout: Duration::from_secs(300),
        }
    }
}

impl AcmeConfig {
    /// Directory URL to talk to
    pub fn directory(&self) -> &str {
        match &self.directory_url {
            Some(url) => url,
            None if self.use_staging => LETS_ENCRYPT_STAGING,
            None => LETS_ENCRYPT_PRODUCTION,
        }
    }
}

/// ACME-backed certificate authority
pub struct AcmeAuthority {
    config: AcmeConfig,
    dns: Arc<dyn DnsProvider>,
    account: Mutex<Option<Account>>,
}

impl AcmeAuthority {
    pub fn new(config: AcmeConfig, dns: Arc<dyn DnsProvider>) -> Self {
        Self {
            config,
            dns,
            account: Mutex::new(None),
        }
    }

    /// Return the cached account, loading persisted credentials or registering
    /// a new account with `contact_email` when none exist.
    async fn account(&self, contact_email: Option<&str>) -> Result<Account, AcmeError> {
        let mut cached = self.account.lock().await;
        if let Some(account) = cached.as_ref() {
            return Ok(account.clone());
        }

        let account = match self.load_credentials().await? {
            Some(credentials) => {
                debug!("Loading ACME account from {:?}", self.config.account_path);
                let builder = match &self.config.root_ca {
                    Some(root) => Account::builder_with_root(root),
                    None => Account::builder(),
                }
                .map_err(|e| AcmeError::AccountCreationFailed(e.to_string()))?;
                builder
                    .from_credentials(credentials)
                    .await
                    .map_err(|e| AcmeError::AccountCreationFailed(e.to_string()))?
            }
            None => {
                let email = contact_email.ok_or(AcmeError::AccountUnavailable)?;
                self.create_account(email).await?
            }
        };

        *cached = Some(account.clone());
        Ok(account)
    }

    async fn load_credentials(&self) -> Result<Option<AccountCredentials>, AcmeError> {
        let json = match fs::read_to_string(&self.config.account_path).await {
            Ok(json) => json,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_str(&json) {
            Ok(credentials) => Ok(Some(credentials)),
            Err(e) => {
                warn!(
                    "Ignoring unreadable ACME credentials {:?}: {}",
                    self.config.account_path, e
                );
                Ok(None)
            }
        }
    }

    async fn create_account(&self, contact_email: &str) -> Result<Account, AcmeError> {
        let contact = format!("mailto:{}", contact_email);
        let builder = match &self.config.root_ca {
            Some(root) => Account::builder_with_root(root),
            None => Account::builder(),
        }
        .map_err(|e| AcmeError::AccountCreationFailed(e.to_string()))?;
        let (account, credentials) = builder
            .create(
                &NewAccount {
                    contact: &[contact.as_str()],
                    terms_of_service_agreed: true,
                    only_return_existing: false,
                },
                self.config.directory().to_string(),
                None,
            )
            .await
            .map_err(|e| AcmeError::AccountCreationFailed(e.to_string()))?;

        info!("Registered ACME account for {}", contact_email);

        if let Some(parent) = self.config.account_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(&credentials)
            .map_err(|e| AcmeError::AccountCreationFailed(e.to_string()))?;
        write_private(&self.config.account_path, &json).await?;

        Ok(account)
    }

    /// Run one order for `domain` with `key_pair`, cleaning up every TXT record
    /// it published whatever the outcome.
    async fn issue(
        &self,
        account: &Account,
        domain: &str,
        key_pair: KeyPair,
    ) -> Result<CertificateRecord, AcmeError> {
        let identifiers = [Identifier::Dns(domain.to_string())];
        let mut order = account
            .new_order(&NewOrder::new(&identifiers))
            .await
            .map_err(|e| AcmeError::OrderCreationFailed(e.to_string()))?;

        let mut published = Vec::new();
        let result = self
            .complete_order(&mut order, domain, &key_pair, &mut published)
            .await;

        for handle in &published {
            if let Err(e) = self.dns.remove_txt(handle).await {
                warn!("Failed to remove TXT record {}: {}", handle.record_name(), e);
            }
        }

        let chain = result?;
        info!("Certificate issued for {}", domain);
        Ok(CertificateRecord::from_pem(
            domain,
            chain,
            key_pair.serialize_pem(),
        )?)
    }

    async fn complete_order(
        &self,
        order: &mut Order,
        domain: &str,
        key_pair: &KeyPair,
        published: &mut Vec<TxtRecordHandle>,
    ) -> Result<String, AcmeError> {
        let record_name = format!("_acme-challenge.{}", domain);

        let mut authorizations = order.authorizations();
        while let Some(authz) = authorizations.next().await {
            let mut authz = authz.map_err(|e| AcmeError::ChallengeFailed(e.to_string()))?;
            match &authz.status {
                AuthorizationStatus::Pending => {}
                AuthorizationStatus::Valid => continue,
                status => {
                    return Err(AcmeError::ChallengeFailed(format!(
                        "unexpected authorization status: {:?}",
                        status
                    )))
                }
            }

            let mut challenge = authz.challenge(ChallengeType::Dns01).ok_or_else(|| {
                AcmeError::ChallengeFailed("no DNS-01 challenge offered".to_string())
            })?;

            let dns_value = challenge.key_authorization().dns_value();
            debug!("DNS-01 challenge: {} TXT {}", record_name, dns_value);
            published.push(self.dns.publish_txt(&record_name, &dns_value).await?);

            if !self.config.propagation_delay.is_zero() {
                debug!(
                    "Waiting {}s for DNS propagation",
                    self.config.propagation_delay.as_secs()
                );
                tokio::time::sleep(self.config.propagation_delay).await;
            }

            challenge
                .set_ready()
                .await
                .map_err(|e| AcmeError::ChallengeFailed(e.to_string()))?;
        }
        drop(authorizations);

        let retry_policy = RetryPolicy::new()
            .timeout(self.config.order_timeout)
            .initial_delay(Duration::from_secs(2));

        let status = order
            .poll_ready(&retry_policy)
            .await
            .map_err(|e| AcmeError::ChallengeFailed(e.to_string()))?;
        if !matches!(status, OrderStatus::Ready) {
            return Err(AcmeError::ChallengeFailed(format!(
                "order not ready: {:?}",
                status
            )));
        }

        let csr = certificate_request(domain, key_pair)?;
        order
            .finalize_csr(&csr)
            .await
            .map_err(|e| AcmeError::FinalizationFailed(e.to_string()))?;

        order
            .poll_certificate(&retry_policy)
            .await
            .map_err(|e| AcmeError::FinalizationFailed(e.to_string()))
    }
}

fn certificate_request(domain: &str, key_pair: &KeyPair) -> Result<Vec<u8>, AcmeError> {
    let mut params = CertificateParams::new(vec![domain.to_string()])
        .map_err(|e| AcmeError::CertGen(e.to_string()))?;
    params.distinguished_name = DistinguishedName::new();
    let csr = params
        .serialize_request(key_pair)
        .map_err(|e| AcmeError::CertGen(e.to_string()))?;
    Ok(csr.der().as_ref().to_vec())
}

fn check_domain(domain: &str) -> Result<(), AcmeError> {
    validate_domain(domain).map_err(|e| AcmeError::InvalidDomain(e.to_string()))
}

#[async_trait]
impl CertificateAuthority for AcmeAuthority {
    async fn obtain(
        &self,
        domain: &str,
        contact_email: &str,
    ) -> Result<CertificateRecord, AcmeError> {
        check_domain(domain)?;
        info!("Requesting new certificate for {}", domain);

        let account = self.account(Some(contact_email)).await?;
        let key_pair = KeyPair::generate().map_err(|e| AcmeError::CertGen(e.to_string()))?;
        self.issue(&account, domain, key_pair).await
    }

    /// Re-issue with the prior private key on a new order
    async fn renew(&self, prior: &CertificateRecord) -> Result<CertificateRecord, AcmeError> {
        check_domain(&prior.domain)?;
        info!("Renewing certificate for {}", prior.domain);

        let account = self.account(None).await?;
        let key_pair = KeyPair::from_pem(&prior.private_key_pem)
            .map_err(|e| AcmeError::CertGen(format!("Failed to parse private key: {}", e)))?;
        self.issue(&account, &prior.domain, key_pair).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::MockDnsProvider;

    #[test]
    fn test_acme_config_directory() {
        let mut config = AcmeConfig::default();
        assert_eq!(config.directory(), LETS_ENCRYPT_PRODUCTION);

        config.use_staging = true;
        assert_eq!(config.directory(), LETS_ENCRYPT_STAGING);

        config.directory_url = Some("https://localhost:14000/dir".to_string());
        assert_eq!(config.directory(), "https://localhost:14000/dir");
    }

    #[test]
    fn test_certificate_request() {
        let key_pair = KeyPair::generate().unwrap();
        let csr = certificate_request("example.com", &key_pair).unwrap();
        assert!(!csr.is_empty());
    }

    #[tokio::test]
    async fn test_obtain_rejects_invalid_domain() {
        let authority = AcmeAuthority::new(AcmeConfig::default(), Arc::new(MockDnsProvider::new()));

        let result = authority.obtain("*.example.com", "admin@example.com").await;
        assert!(matches!(result, Err(AcmeError::InvalidDomain(_))));
    }

    #[tokio::test]
    async fn test_renew_without_account_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = AcmeConfig {
            account_path: dir.path().join("account.json"),
            ..AcmeConfig::default()
        };
        let authority = AcmeAuthority::new(config, Arc::new(MockDnsProvider::new()));

        let prior = CertificateRecord {
            domain: "example.com".to_string(),
            certificate_chain_pem: String::new(),
            private_key_pem: String::new(),
            not_before: chrono::Utc::now(),
            not_after: chrono::Utc::now(),
            issuer_id: String::new(),
            cdn_cert_id: None,
            created_at: chrono::Utc::now(),
        };

        let result = authority.renew(&prior).await;
        assert!(matches!(result, Err(AcmeError::AccountUnavailable)));
    }

    #[tokio::test]
    async fn test_unreadable_credentials_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let account_path = dir.path().join("account.json");
        std::fs::write(&account_path, "garbage").unwrap();

        let config = AcmeConfig {
            account_path,
            ..AcmeConfig::default()
        };
        let authority = AcmeAuthority::new(config, Arc::new(MockDnsProvider::new()));
        assert!(authority.load_credentials().await.unwrap().is_none());
    }
}
