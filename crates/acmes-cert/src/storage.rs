//! Persistent store for accounts and issued certificates
//!
//! # Directory Structure
//!
//! ```text
//! <root>/
//! └── admin@example.com/
//!     ├── user.json              # account registration
//!     ├── key.pem                # account private key
//!     └── [x].example.com/       # "*.example.com"
//!         ├── cert.pem           # certificate chain, leaf first
//!         ├── key.pem            # certificate private key
//!         ├── cert.json          # issuance resource
//!         └── expiration.txt     # RFC3339 notAfter of the leaf
//! ```
//!
//! Two domains that map to the same directory after the `*` substitution
//! share their artifacts; callers must not use both.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, trace};

use crate::{pem, StorageError};

const WILDCARD_MARKER: &str = "[x]";

const ACCOUNT_REGISTRATION_FILE: &str = "user.json";
const ACCOUNT_KEY_FILE: &str = "key.pem";
const CERT_CHAIN_FILE: &str = "cert.pem";
const CERT_KEY_FILE: &str = "key.pem";
const CERT_RESOURCE_FILE: &str = "cert.json";
const CERT_EXPIRATION_FILE: &str = "expiration.txt";

/// Registered issuance account
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub email: String,
    /// Opaque registration issued by the engine
    pub registration: Vec<u8>,
    /// Account private key, PEM
    pub private_key: Vec<u8>,
}

/// Issued certificate for one (email, domain) pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateRecord {
    pub email: String,
    pub domain: String,
    /// Opaque blob the engine needs to renew
    pub resource: Vec<u8>,
    /// PEM chain, leaf first
    pub certificate_chain: Vec<u8>,
    /// PEM private key of the leaf
    pub private_key: Vec<u8>,
    /// Always the leaf's expiry
    pub not_after: DateTime<Utc>,
}

impl CertificateRecord {
    /// Build a record whose expiry is read from the chain's leaf
    pub fn from_chain(
        email: impl Into<String>,
        domain: impl Into<String>,
        resource: Vec<u8>,
        certificate_chain: Vec<u8>,
        private_key: Vec<u8>,
    ) -> Result<Self, crate::CertError> {
        let not_after = pem::leaf_not_after(&certificate_chain)?;
        Ok(Self {
            email: email.into(),
            domain: domain.into(),
            resource,
            certificate_chain,
            private_key,
            not_after,
        })
    }

    /// Whether the leaf is still valid at `now`
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.not_after > now
    }
}

/// Account and certificate persistence
#[async_trait]
pub trait CertificateStore: Send + Sync {
    /// Load the account for `email`, `None` when never registered
    async fn get_account(&self, email: &str) -> Result<Option<Account>, StorageError>;

    /// Persist an account, overwriting any previous one
    async fn save_account(&self, account: &Account) -> Result<(), StorageError>;

    /// Load a certificate, `None` when any artifact is missing
    async fn get_certificate(
        &self,
        email: &str,
        domain: &str,
    ) -> Result<Option<CertificateRecord>, StorageError>;

    /// Persist a certificate and return it as stored.
    ///
    /// `not_after` is recomputed from the leaf; the caller's value is ignored.
    async fn save_certificate(
        &self,
        record: &CertificateRecord,
    ) -> Result<CertificateRecord, StorageError>;
}

/// Open a store from a URI; only `file://<dir>` is supported
pub async fn open_store(uri: &str) -> Result<Arc<dyn CertificateStore>, StorageError> {
    let path = uri
        .strip_prefix("file://")
        .ok_or_else(|| StorageError::UnsupportedUri(uri.to_string()))?;

    if path.is_empty() {
        return Err(StorageError::UnsupportedUri(format!(
            "{} (missing directory)",
            uri
        )));
    }

    Ok(Arc::new(FileStore::open(path).await?))
}

/// Filesystem store with one directory per email
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl FileStore {
    /// Open (and create) a store rooted at `root`
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, StorageError> {
        let root = root.as_ref().to_path_buf();
        ensure_dir(&root).await?;

        info!(storage_path = %root.display(), "Opened certificate store");

        Ok(Self {
            root,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Lock serializing all operations on one account directory.
    ///
    /// Keyed by directory name so emails differing only in surrounding
    /// whitespace share a lock. Entries nobody holds are dropped.
    fn lock_for(&self, email: &str) -> Result<Arc<tokio::sync::Mutex<()>>, StorageError> {
        let key = storage_key(email)?;
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        Ok(locks.entry(key).or_default().clone())
    }

    fn account_dir(&self, email: &str) -> Result<PathBuf, StorageError> {
        Ok(self.root.join(storage_key(email)?))
    }

    fn domain_dir(&self, email: &str, domain: &str) -> Result<PathBuf, StorageError> {
        Ok(self.account_dir(email)?.join(domain_key(domain)?))
    }
}

#[async_trait]
impl CertificateStore for FileStore {
    async fn get_account(&self, email: &str) -> Result<Option<Account>, StorageError> {
        let dir = self.account_dir(email)?;
        let lock = self.lock_for(email)?;
        let _guard = lock.lock().await;

        let registration = read_optional(&dir.join(ACCOUNT_REGISTRATION_FILE)).await?;
        let private_key = read_optional(&dir.join(ACCOUNT_KEY_FILE)).await?;

        match (registration, private_key) {
            (Some(registration), Some(private_key)) => {
                trace!(email = %email, "Loaded account");
                Ok(Some(Account {
                    email: email.to_string(),
                    registration,
                    private_key,
                }))
            }
            _ => {
                trace!(email = %email, "No stored account");
                Ok(None)
            }
        }
    }

    async fn save_account(&self, account: &Account) -> Result<(), StorageError> {
        let dir = self.account_dir(&account.email)?;
        let lock = self.lock_for(&account.email)?;
        let _guard = lock.lock().await;

        ensure_dir(&dir).await?;
        write_atomic(&dir.join(ACCOUNT_KEY_FILE), &account.private_key).await?;
        write_atomic(&dir.join(ACCOUNT_REGISTRATION_FILE), &account.registration).await?;

        info!(email = %account.email, "Saved account");
        Ok(())
    }

    async fn get_certificate(
        &self,
        email: &str,
        domain: &str,
    ) -> Result<Option<CertificateRecord>, StorageError> {
        let dir = self.domain_dir(email, domain)?;
        let lock = self.lock_for(email)?;
        let _guard = lock.lock().await;

        let chain_path = dir.join(CERT_CHAIN_FILE);
        let Some(certificate_chain) = read_optional(&chain_path).await? else {
            trace!(email = %email, domain = %domain, "No stored certificate");
            return Ok(None);
        };
        let Some(private_key) = read_optional(&dir.join(CERT_KEY_FILE)).await? else {
            return Ok(None);
        };
        let Some(resource) = read_optional(&dir.join(CERT_RESOURCE_FILE)).await? else {
            return Ok(None);
        };
        if read_optional(&dir.join(CERT_EXPIRATION_FILE)).await?.is_none() {
            return Ok(None);
        }

        let not_after =
            pem::leaf_not_after(&certificate_chain).map_err(|e| StorageError::Corrupt {
                path: chain_path.display().to_string(),
                reason: e.to_string(),
            })?;

        debug!(
            email = %email,
            domain = %domain,
            not_after = %not_after,
            "Loaded certificate"
        );

        Ok(Some(CertificateRecord {
            email: email.to_string(),
            domain: domain.to_string(),
            resource,
            certificate_chain,
            private_key,
            not_after,
        }))
    }

    async fn save_certificate(
        &self,
        record: &CertificateRecord,
    ) -> Result<CertificateRecord, StorageError> {
        let not_after = pem::leaf_not_after(&record.certificate_chain)?;

        let dir = self.domain_dir(&record.email, &record.domain)?;
        let lock = self.lock_for(&record.email)?;
        let _guard = lock.lock().await;

        ensure_dir(&dir).await?;
        write_atomic(&dir.join(CERT_RESOURCE_FILE), &record.resource).await?;
        write_atomic(&dir.join(CERT_KEY_FILE), &record.private_key).await?;
        write_atomic(&dir.join(CERT_CHAIN_FILE), &record.certificate_chain).await?;
        // Written last: a present expiration file means the set is complete
        write_atomic(
            &dir.join(CERT_EXPIRATION_FILE),
            not_after
                .to_rfc3339_opts(SecondsFormat::Secs, true)
                .as_bytes(),
        )
        .await?;

        info!(
            email = %record.email,
            domain = %record.domain,
            not_after = %not_after,
            "Saved certificate"
        );

        Ok(CertificateRecord {
            not_after,
            ..record.clone()
        })
    }
}

/// Directory name for an email
fn storage_key(value: &str) -> Result<String, StorageError> {
    let value = value.trim();
    if value.is_empty()
        || value == "."
        || value == ".."
        || value.contains('/')
        || value.contains('\\')
    {
        return Err(StorageError::InvalidKey(value.to_string()));
    }
    Ok(value.to_string())
}

/// Directory name for a domain, `*` replaced by `[x]`
pub fn domain_key(domain: &str) -> Result<String, StorageError> {
    storage_key(&domain.trim().replace('*', WILDCARD_MARKER))
}

async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, StorageError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn ensure_dir(path: &Path) -> Result<(), StorageError> {
    tokio::fs::create_dir_all(path).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700)).await?;
    }

    Ok(())
}

/// Write to a sibling temporary file, then rename over the target
async fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), StorageError> {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| StorageError::InvalidKey(path.display().to_string()))?;
    let tmp_path = path.with_file_name(format!(".{}.tmp", file_name));

    tokio::fs::write(&tmp_path, contents).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600)).await?;
    }

    if let Err(e) = tokio::fs::rename(&tmp_path, path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e.into());
    }

    Ok(())
}
