//! Certificate authority abstraction consumed by the renewal orchestrator

use async_trait::async_trait;

use crate::acme::AcmeError;
use crate::record::CertificateRecord;

/// Issues certificates for a single domain.
///
/// `renew` is best effort: callers must be prepared for it to fail for
/// legitimate reasons (expired order, CA policy change, missing account) and
/// fall back to `obtain`.
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
#[async_trait]
pub trait CertificateAuthority: Send + Sync {
    /// Full domain validation and issuance of a new certificate
    async fn obtain(
        &self,
        domain: &str,
        contact_email: &str,
    ) -> Result<CertificateRecord, AcmeError>;

    /// Re-issue the certificate described by `prior`
    async fn renew(&self, prior: &CertificateRecord) -> Result<CertificateRecord, AcmeError>;
}
