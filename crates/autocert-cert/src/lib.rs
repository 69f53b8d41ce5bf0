//! Certificate management for CDN auto-renewal
//!
//! Handles certificate provisioning via Let's Encrypt/ACME with DNS-01
//! validation, certificate metadata, and per-domain persistence used as the
//! renewal hint for the next cycle.

pub mod acme;
pub mod authority;
pub mod dns;
pub mod record;
pub mod storage;

pub use acme::{AcmeAuthority, AcmeConfig, AcmeError};
pub use authority::CertificateAuthority;
#[cfg(any(test, feature = "mock"))]
pub use authority::MockCertificateAuthority;
pub use dns::{
    provider_from_env, CloudflareConfig, CloudflareDnsProvider, DnsProvider, DnsProviderError,
    TxtRecordHandle,
};
pub use record::{validate_domain, CertificateError, CertificateRecord};
pub use storage::{CertificateStore, FileCertificateStore, MemoryCertificateStore, StorageError};
