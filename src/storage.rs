//! Raw document bytes.
//!
//! [`BlobStore`] is the object-storage seam: the ingestion pipeline downloads
//! uploaded PDFs through it and the server hands out time-limited signed URLs
//! for previews. [`FsBlobStore`] keeps objects under a local root directory.
//!
//! Signed URLs have the form
//! `{public_base_url}/{key}?expires={unix}&signature={hex}` where the signature
//! is HMAC-SHA256 over `"{key}\n{expires}"` with the configured secret.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

use crate::config::StorageConfig;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum FetchError {
    /// The key is empty or would resolve outside the storage root.
    #[error("invalid storage key: {0}")]
    InvalidKey(String),
    #[error("object not found: {0}")]
    Missing(String),
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("URL signing failed: {0}")]
    Signing(String),
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), FetchError>;

    async fn download(&self, key: &str) -> Result<Vec<u8>, FetchError>;

    /// Removes the object. Deleting a missing object is not an error.
    async fn delete(&self, key: &str) -> Result<(), FetchError>;

    /// A URL granting read access to `key` until `ttl` from now.
    fn signed_url(&self, key: &str, ttl: Duration) -> Result<String, FetchError>;

    /// Checks a signature produced by [`signed_url`](BlobStore::signed_url)
    /// and that it has not expired.
    fn verify_signed(&self, key: &str, expires: i64, signature: &str) -> bool;
}

/// Filesystem-backed blob store.
pub struct FsBlobStore {
    root: PathBuf,
    public_base_url: String,
    secret: Vec<u8>,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>, public_base_url: &str, secret: &str) -> Self {
        Self {
            root: root.into(),
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
            secret: secret.as_bytes().to_vec(),
        }
    }

    pub fn from_config(config: &StorageConfig) -> Self {
        Self::new(&config.root, &config.public_base_url, &config.signing_secret)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, key: &str) -> Result<PathBuf, FetchError> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), FetchError> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        tracing::debug!("stored {} ({} bytes)", key, bytes.len());
        Ok(())
    }

    async fn download(&self, key: &str) -> Result<Vec<u8>, FetchError> {
        let path = self.resolve(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(FetchError::Missing(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), FetchError> {
        let path = self.resolve(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn signed_url(&self, key: &str, ttl: Duration) -> Result<String, FetchError> {
        validate_key(key)?;
        let expires = i64::try_from(ttl.as_secs())
            .ok()
            .and_then(|secs| chrono::Utc::now().timestamp().checked_add(secs))
            .ok_or_else(|| FetchError::Signing(format!("ttl of {}s is out of range", ttl.as_secs())))?;
        let signature = sign(&self.secret, key, expires)?;
        Ok(format!(
            "{}/{}?expires={}&signature={}",
            self.public_base_url, key, expires, signature
        ))
    }

    fn verify_signed(&self, key: &str, expires: i64, signature: &str) -> bool {
        if expires < chrono::Utc::now().timestamp() {
            return false;
        }
        verify_signature(&self.secret, key, expires, signature)
    }
}

/// Rejects empty keys, absolute paths and any `.`/`..` component.
pub fn validate_key(key: &str) -> Result<(), FetchError> {
    if key.is_empty() {
        return Err(FetchError::InvalidKey(key.to_string()));
    }
    let escapes = Path::new(key)
        .components()
        .any(|c| !matches!(c, Component::Normal(_)));
    if escapes || key.contains('\\') {
        return Err(FetchError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// The object key an upload is stored under:
/// `{user}/{folder}/{unix_millis}-{file_name}`, each segment sanitized.
pub fn storage_key(
    user_id: &str,
    folder_id: &str,
    file_name: &str,
    uploaded_at: chrono::DateTime<chrono::Utc>,
) -> String {
    format!(
        "{}/{}/{}-{}",
        sanitize_segment(user_id),
        sanitize_segment(folder_id),
        uploaded_at.timestamp_millis(),
        sanitize_segment(file_name)
    )
}

/// Keeps ASCII alphanumerics, `.`, `-` and `_`; everything else becomes `_`.
/// A segment made only of dots is replaced so it never forms `.` or `..`.
fn sanitize_segment(segment: &str) -> String {
    let cleaned: String = segment
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        "_".repeat(cleaned.len().max(1))
    } else {
        cleaned
    }
}

fn signing_payload(key: &str, expires: i64) -> String {
    format!("{}\n{}", key, expires)
}

fn sign(secret: &[u8], key: &str, expires: i64) -> Result<String, FetchError> {
    if secret.is_empty() {
        return Err(FetchError::Signing("signing secret is empty".to_string()));
    }
    let mut mac =
        HmacSha256::new_from_slice(secret).map_err(|e| FetchError::Signing(e.to_string()))?;
    mac.update(signing_payload(key, expires).as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time check of a hex signature. Ignores expiry. An empty secret
/// never verifies.
pub fn verify_signature(secret: &[u8], key: &str, expires: i64, signature: &str) -> bool {
    if secret.is_empty() {
        return false;
    }
    let Ok(expected) = hex::decode(signature) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(signing_payload(key, expires).as_bytes());
    mac.verify_slice(&expected).is_ok()
}
