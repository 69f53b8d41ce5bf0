//! Certificate storage
//!
//! A stored record is only a renewal hint: a missing record is not an error,
//! it just means the next cycle issues a fresh certificate.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, trace};

use crate::record::{validate_domain, CertificateError, CertificateRecord};

/// Certificate storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Invalid domain: {0}")]
    InvalidDomain(#[from] CertificateError),

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt certificate metadata {path}: {source}")]
    Metadata {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Storage error: {0}")]
    StorageError(String),
}

/// Persistence for the last certificate issued per domain
#[async_trait]
pub trait CertificateStore: Send + Sync {
    /// Load the record for `domain`, `None` when nothing was stored yet
    async fn load(&self, domain: &str) -> Result<Option<CertificateRecord>, StorageError>;

    /// Store `record` as the current certificate for `domain`
    async fn save(&self, domain: &str, record: &CertificateRecord) -> Result<(), StorageError>;
}

/// On-disk metadata. PEM material lives in sibling `.crt`/`.key` files.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CertificateMetadata {
    domain: String,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    issuer_id: String,
    #[serde(default)]
    cdn_cert_id: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<&CertificateRecord> for CertificateMetadata {
    fn from(record: &CertificateRecord) -> Self {
        Self {
            domain: record.domain.clone(),
            not_before: record.not_before,
            not_after: record.not_after,
            issuer_id: record.issuer_id.clone(),
            cdn_cert_id: record.cdn_cert_id.clone(),
            created_at: record.created_at,
        }
    }
}

/// File-backed store: `<domain>.json`, `<domain>.key` and `<domain>.crt`
/// under a single directory.
#[derive(Debug, Clone)]
pub struct FileCertificateStore {
    base_dir: PathBuf,
}

impl FileCertificateStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Default location: the user's local data dir, falling back to the
    /// system temp dir when there is none.
    pub fn default_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("cdn-autocert")
    }

    fn metadata_path(&self, domain: &str) -> PathBuf {
        self.base_dir.join(format!("{}.json", domain))
    }

    fn key_path(&self, domain: &str) -> PathBuf {
        self.base_dir.join(format!("{}.key", domain))
    }

    fn chain_path(&self, domain: &str) -> PathBuf {
        self.base_dir.join(format!("{}.crt", domain))
    }

    async fn read_optional(path: &Path) -> Result<Option<String>, StorageError> {
        match fs::read_to_string(path).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StorageError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }
}

#[async_trait]
impl CertificateStore for FileCertificateStore {
    async fn load(&self, domain: &str) -> Result<Option<CertificateRecord>, StorageError> {
        validate_domain(domain)?;
        trace!("Loading certificate for domain: {}", domain);

        let metadata_path = self.metadata_path(domain);
        let Some(metadata) = Self::read_optional(&metadata_path).await? else {
            return Ok(None);
        };
        let Some(private_key_pem) = Self::read_optional(&self.key_path(domain)).await? else {
            return Ok(None);
        };
        let Some(certificate_chain_pem) = Self::read_optional(&self.chain_path(domain)).await?
        else {
            return Ok(None);
        };

        let metadata: CertificateMetadata =
            serde_json::from_str(&metadata).map_err(|source| StorageError::Metadata {
                path: metadata_path,
                source,
            })?;

        Ok(Some(CertificateRecord {
            domain: metadata.domain,
            certificate_chain_pem,
            private_key_pem,
            not_before: metadata.not_before,
            not_after: metadata.not_after,
            issuer_id: metadata.issuer_id,
            cdn_cert_id: metadata.cdn_cert_id,
            created_at: metadata.created_at,
        }))
    }

    async fn save(&self, domain: &str, record: &CertificateRecord) -> Result<(), StorageError> {
        validate_domain(domain)?;
        debug!("Storing certificate for domain: {}", domain);

        fs::create_dir_all(&self.base_dir)
            .await
            .map_err(|source| StorageError::Io {
                path: self.base_dir.clone(),
                source,
            })?;

        let metadata = serde_json::to_vec_pretty(&CertificateMetadata::from(record)).map_err(
            |source| StorageError::Metadata {
                path: self.metadata_path(domain),
                source,
            },
        )?;

        let files = [
            (self.key_path(domain), record.private_key_pem.as_bytes()),
            (self.chain_path(domain), record.certificate_chain_pem.as_bytes()),
            (self.metadata_path(domain), metadata.as_slice()),
        ];

        // Stage everything before replacing anything; metadata goes in last
        for (path, contents) in &files {
            stage_private(path, contents).await?;
        }
        for (path, _) in &files {
            commit_staged(path).await?;
        }

        Ok(())
    }
}

/// Replace `path` with `contents`, readable only by the owner
pub(crate) async fn write_private(path: &Path, contents: &[u8]) -> Result<(), StorageError> {
    stage_private(path, contents).await?;
    commit_staged(path).await
}

fn staged_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

async fn stage_private(path: &Path, contents: &[u8]) -> Result<(), StorageError> {
    let staged = staged_path(path);
    let io_err = |source| StorageError::Io {
        path: staged.clone(),
        source,
    };

    fs::write(&staged, contents).await.map_err(io_err)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&staged, std::fs::Permissions::from_mode(0o600))
            .await
            .map_err(io_err)?;
    }

    Ok(())
}

async fn commit_staged(path: &Path) -> Result<(), StorageError> {
    fs::rename(staged_path(path), path)
        .await
        .map_err(|source| StorageError::Io {
            path: path.to_path_buf(),
            source,
        })
}

/// In-memory certificate store
pub struct MemoryCertificateStore {
    certificates: RwLock<HashMap<String, CertificateRecord>>,
}

impl MemoryCertificateStore {
    pub fn new() -> Self {
        Self {
            certificates: RwLock::new(HashMap::new()),
        }
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, HashMap<String, CertificateRecord>>, StorageError> {
        self.certificates
            .read()
            .map_err(|_| StorageError::StorageError("certificate map poisoned".to_string()))
    }
}

impl Default for MemoryCertificateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CertificateStore for MemoryCertificateStore {
    async fn load(&self, domain: &str) -> Result<Option<CertificateRecord>, StorageError> {
        trace!("Retrieving certificate for domain: {}", domain);
        Ok(self.read()?.get(domain).cloned())
    }

    async fn save(&self, domain: &str, record: &CertificateRecord) -> Result<(), StorageError> {
        debug!("Storing certificate for domain: {}", domain);

        let mut certs = self
            .certificates
            .write()
            .map_err(|_| StorageError::StorageError("certificate map poisoned".to_string()))?;
        certs.insert(domain.to_string(), record.clone());

        Ok(())
    }
}
