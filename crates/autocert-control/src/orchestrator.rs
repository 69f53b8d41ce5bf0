//! Renewal orchestration for one CDN domain
//!
//! One call to [`RenewalOrchestrator::ensure_valid_certificate`] inspects the
//! domain's HTTPS binding, decides whether a new certificate is needed, and
//! drives issuance, upload, rebinding and cleanup in that order. The old
//! certificate is only deleted after the domain points at the new one.

use std::fmt;
use std::sync::Arc;

use autocert_cdn::{CdnController, CdnError, DomainHttpsState};
use autocert_cert::{
    AcmeError, CertificateAuthority, CertificateRecord, CertificateStore, StorageError,
};
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Source of "now" for expiry decisions
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Orchestrator tuning
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Renew once the active certificate has this much validity left or less
    pub renew_before: Duration,
    /// Redirect HTTP to HTTPS when enabling HTTPS for the first time; a rebind
    /// keeps whatever the domain already has
    pub force_https: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            renew_before: Duration::days(7),
            force_https: true,
        }
    }
}

/// Step of a renewal cycle, used to tag errors and log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    QueryDomain,
    QueryCertificate,
    Issue,
    Renew,
    Upload,
    EnableHttps,
    Rebind,
    Cleanup,
    Persist,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::QueryDomain => "query_domain",
            Stage::QueryCertificate => "query_certificate",
            Stage::Issue => "issue",
            Stage::Renew => "renew",
            Stage::Upload => "upload",
            Stage::EnableHttps => "enable_https",
            Stage::Rebind => "rebind",
            Stage::Cleanup => "cleanup",
            Stage::Persist => "persist",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failures that abort a renewal cycle
#[derive(Debug, Error)]
pub enum OrchestrationError {
    /// Current CDN state could not be read; nothing was changed
    #[error("{stage}: failed to read CDN state: {source}")]
    FatalQuery {
        stage: Stage,
        #[source]
        source: CdnError,
    },

    #[error("{stage}: certificate issuance failed: {source}")]
    IssuanceFailure {
        stage: Stage,
        #[source]
        source: AcmeError,
    },

    #[error("{stage}: certificate upload failed: {source}")]
    UploadFailure {
        stage: Stage,
        #[source]
        source: CdnError,
    },

    /// The domain still serves its previous certificate
    #[error("{stage}: failed to bind certificate {cert_id}: {source}")]
    BindFailure {
        stage: Stage,
        cert_id: String,
        #[source]
        source: CdnError,
    },

    /// CDN state is correct but the local record was not written
    #[error("{stage}: failed to save certificate record: {source}")]
    PersistFailure {
        stage: Stage,
        #[source]
        source: StorageError,
    },
}

impl OrchestrationError {
    pub fn stage(&self) -> Stage {
        match self {
            OrchestrationError::FatalQuery { stage, .. }
            | OrchestrationError::IssuanceFailure { stage, .. }
            | OrchestrationError::UploadFailure { stage, .. }
            | OrchestrationError::BindFailure { stage, .. }
            | OrchestrationError::PersistFailure { stage, .. } => *stage,
        }
    }
}

/// Renewal could not reuse the stored certificate; a fresh one was obtained
#[derive(Debug, Error)]
#[error("renewal failed, issued a new certificate instead: {reason}")]
pub struct RenewalFailure {
    pub reason: String,
}

/// The superseded certificate could not be deleted from the CDN
#[derive(Debug, Error)]
#[error("failed to delete old certificate {cert_id}: {source}")]
pub struct CleanupFailure {
    pub cert_id: String,
    #[source]
    pub source: CdnError,
}

/// What a successful cycle did
#[derive(Debug)]
pub enum RenewalOutcome {
    /// HTTPS was enabled with a newly issued certificate
    Issued { cert_id: String },

    /// The domain was moved to a new certificate
    Renewed {
        previous_cert_id: String,
        cert_id: String,
        renewal: Option<RenewalFailure>,
        cleanup: Option<CleanupFailure>,
    },

    /// The active certificate is valid for longer than the renewal window
    Skipped { cert_id: String, remaining: Duration },
}

impl RenewalOutcome {
    /// Certificate id bound to the domain after the cycle
    pub fn cert_id(&self) -> &str {
        match self {
            RenewalOutcome::Issued { cert_id }
            | RenewalOutcome::Renewed { cert_id, .. }
            | RenewalOutcome::Skipped { cert_id, .. } => cert_id,
        }
    }
}

/// Keeps a CDN domain bound to a valid certificate
pub struct RenewalOrchestrator {
    cdn: Arc<dyn CdnController>,
    authority: Arc<dyn CertificateAuthority>,
    store: Arc<dyn CertificateStore>,
    clock: Arc<dyn Clock>,
    config: OrchestratorConfig,
}

impl RenewalOrchestrator {
    pub fn new(
        cdn: Arc<dyn CdnController>,
        authority: Arc<dyn CertificateAuthority>,
        store: Arc<dyn CertificateStore>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            cdn,
            authority,
            store,
            clock: Arc::new(SystemClock),
            config,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Run one renewal cycle for `domain`.
    pub async fn ensure_valid_certificate(
        &self,
        domain: &str,
        contact_email: &str,
    ) -> Result<RenewalOutcome, OrchestrationError> {
        let state = self
            .cdn
            .get_domain_https_state(domain)
            .await
            .map_err(|source| OrchestrationError::FatalQuery {
                stage: Stage::QueryDomain,
                source,
            })?;

        if state.https_enabled() {
            self.renew_if_due(domain, contact_email, &state).await
        } else {
            self.first_issuance(domain, contact_email).await
        }
    }

    async fn first_issuance(
        &self,
        domain: &str,
        contact_email: &str,
    ) -> Result<RenewalOutcome, OrchestrationError> {
        info!(domain = %domain, "HTTPS is not enabled, issuing a first certificate");

        let record = self
            .authority
            .obtain(domain, contact_email)
            .await
            .map_err(|source| OrchestrationError::IssuanceFailure {
                stage: Stage::Issue,
                source,
            })?;

        let cert_id = self.upload(&record).await?;

        self.cdn
            .enable_https(domain, &cert_id, self.config.force_https)
            .await
            .map_err(|source| OrchestrationError::BindFailure {
                stage: Stage::EnableHttps,
                cert_id: cert_id.clone(),
                source,
            })?;
        info!(domain = %domain, cert_id = %cert_id, "HTTPS enabled");

        self.persist(domain, record.with_cdn_cert_id(cert_id.as_str()))
            .await?;
        Ok(RenewalOutcome::Issued { cert_id })
    }

    async fn renew_if_due(
        &self,
        domain: &str,
        contact_email: &str,
        state: &DomainHttpsState,
    ) -> Result<RenewalOutcome, OrchestrationError> {
        let active_cert_id = state.active_cert_id.as_str();
        let info = self
            .cdn
            .get_cert_info(active_cert_id)
            .await
            .map_err(|source| OrchestrationError::FatalQuery {
                stage: Stage::QueryCertificate,
                source,
            })?;

        let remaining = info.not_after - self.clock.now();
        if remaining > self.config.renew_before {
            debug!(
                domain = %domain,
                cert_id = %active_cert_id,
                "Certificate valid for {} more days, nothing to do",
                remaining.num_days()
            );
            return Ok(RenewalOutcome::Skipped {
                cert_id: active_cert_id.to_string(),
                remaining,
            });
        }

        info!(
            domain = %domain,
            cert_id = %active_cert_id,
            not_after = %info.not_after,
            "Certificate is due for renewal"
        );

        let (record, renewal) = self.renew_or_obtain(domain, contact_email).await?;
        let cert_id = self.upload(&record).await?;

        let cleanup = if cert_id == active_cert_id {
            warn!(
                domain = %domain,
                cert_id = %cert_id,
                "CDN returned the active certificate id for the upload, leaving binding as is"
            );
            None
        } else {
            self.cdn
                .update_https_cert_id(domain, &cert_id, state.force_https)
                .await
                .map_err(|source| OrchestrationError::BindFailure {
                    stage: Stage::Rebind,
                    cert_id: cert_id.clone(),
                    source,
                })?;
            info!(domain = %domain, cert_id = %cert_id, "Domain now serves the new certificate");

            self.remove_previous(domain, active_cert_id).await
        };

        self.persist(domain, record.with_cdn_cert_id(cert_id.as_str()))
            .await?;

        Ok(RenewalOutcome::Renewed {
            previous_cert_id: active_cert_id.to_string(),
            cert_id,
            renewal,
            cleanup,
        })
    }

    /// Renew from the stored record when there is one, otherwise (or when
    /// renewal fails) obtain a new certificate.
    async fn renew_or_obtain(
        &self,
        domain: &str,
        contact_email: &str,
    ) -> Result<(CertificateRecord, Option<RenewalFailure>), OrchestrationError> {
        let renewal = match self.store.load(domain).await {
            Ok(Some(prior)) => match self.authority.renew(&prior).await {
                Ok(record) => return Ok((record, None)),
                Err(e) => {
                    warn!(
                        domain = %domain,
                        stage = %Stage::Renew,
                        "Renewal failed, obtaining a new certificate: {}",
                        e
                    );
                    Some(RenewalFailure {
                        reason: e.to_string(),
                    })
                }
            },
            Ok(None) => {
                info!(domain = %domain, "No stored certificate, obtaining a new one");
                None
            }
            Err(e) => {
                warn!(
                    domain = %domain,
                    stage = %Stage::Renew,
                    "Stored certificate unreadable, obtaining a new one: {}",
                    e
                );
                Some(RenewalFailure {
                    reason: e.to_string(),
                })
            }
        };

        let record = self
            .authority
            .obtain(domain, contact_email)
            .await
            .map_err(|source| OrchestrationError::IssuanceFailure {
                stage: Stage::Issue,
                source,
            })?;
        Ok((record, renewal))
    }

    async fn upload(&self, record: &CertificateRecord) -> Result<String, OrchestrationError> {
        let cert_id = self
            .cdn
            .upload_certificate(record)
            .await
            .map_err(|source| OrchestrationError::UploadFailure {
                stage: Stage::Upload,
                source,
            })?;
        info!(
            domain = %record.domain,
            cert_id = %cert_id,
            not_after = %record.not_after,
            "Certificate uploaded"
        );
        Ok(cert_id)
    }

    async fn remove_previous(&self, domain: &str, cert_id: &str) -> Option<CleanupFailure> {
        match self.cdn.delete_certificate(cert_id).await {
            Ok(()) => {
                debug!(domain = %domain, cert_id = %cert_id, "Old certificate deleted");
                None
            }
            Err(source) => {
                warn!(
                    domain = %domain,
                    cert_id = %cert_id,
                    stage = %Stage::Cleanup,
                    "Failed to delete old certificate: {}",
                    source
                );
                Some(CleanupFailure {
                    cert_id: cert_id.to_string(),
                    source,
                })
            }
        }
    }

    async fn persist(
        &self,
        domain: &str,
        record: CertificateRecord,
    ) -> Result<(), OrchestrationError> {
        self.store.save(domain, &record).await.map_err(|source| {
            error!(
                domain = %domain,
                stage = %Stage::Persist,
                "Failed to save certificate record: {}",
                source
            );
            OrchestrationError::PersistFailure {
                stage: Stage::Persist,
                source,
            }
        })
    }
}
