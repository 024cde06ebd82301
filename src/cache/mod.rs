//! Shared dependency cache
//!
//! Entries are keyed by a hash of the environment and lock-file descriptors.
//! Writers never expose a partially written entry: the filesystem store
//! writes to a unique temp file and renames it into place, the in-memory
//! store swaps whole entries. Concurrent writers to one key: last wins.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("invalid cache key '{0}'")]
    InvalidKey(String),

    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Cache store shared by every job
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), CacheError>;
}

/// Compute a cache key from a prefix and named descriptors
///
/// Descriptors are typically the toolchain/OS description and the contents
/// of lock files. Order matters. Characters a key may not contain are
/// replaced in the prefix, so `cargo-feature/x` becomes `cargo-feature-x`.
pub fn cache_key(prefix: &str, descriptors: &[(&str, &[u8])]) -> String {
    let mut hasher = Sha256::new();
    for (name, content) in descriptors {
        hasher.update((name.len() as u64).to_le_bytes());
        hasher.update(name.as_bytes());
        hasher.update((content.len() as u64).to_le_bytes());
        hasher.update(content);
    }
    let prefix: String = prefix
        .trim_start_matches('.')
        .chars()
        .map(|c| if is_key_char(c) { c } else { '-' })
        .collect();
    format!("{}-{:x}", prefix, hasher.finalize())
}

fn is_key_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')
}

fn validate_key(key: &str) -> Result<(), CacheError> {
    let valid = !key.is_empty()
        && !key.starts_with('.')
        && key.chars().all(is_key_char);
    if valid {
        Ok(())
    } else {
        Err(CacheError::InvalidKey(key.to_string()))
    }
}

/// Filesystem-backed cache under a root directory
#[derive(Debug, Clone)]
pub struct FsCacheStore {
    root: PathBuf,
}

impl FsCacheStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create store with default path
    pub fn with_default_path() -> Self {
        let cache_dir = dirs::cache_dir().unwrap_or_else(|| PathBuf::from("."));
        Self::new(cache_dir.join("shipyard"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl CacheStore for FsCacheStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        validate_key(key)?;
        match tokio::fs::read(self.root.join(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), CacheError> {
        validate_key(key)?;
        tokio::fs::create_dir_all(&self.root).await?;

        // Atomic write: write to a unique temp file, then rename
        let tmp_path = self.root.join(format!(".{}.{}.tmp", key, Uuid::new_v4()));
        tokio::fs::write(&tmp_path, bytes).await?;
        if let Err(e) = tokio::fs::rename(&tmp_path, self.root.join(key)).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }

        debug!("Cache entry {} saved ({} bytes)", key, bytes.len());
        Ok(())
    }
}

/// In-memory cache (for testing or ephemeral use)
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    entries: RwLock<HashMap<String, Arc<Vec<u8>>>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        validate_key(key)?;
        let entries = self.entries.read().await;
        Ok(entries.get(key).map(|bytes| bytes.as_ref().clone()))
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), CacheError> {
        validate_key(key)?;
        let entry = Arc::new(bytes.to_vec());
        self.entries.write().await.insert(key.to_string(), entry);
        Ok(())
    }
}
