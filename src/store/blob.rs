//! Blob store contract and local backends.
//!
//! Snapshots past the inline threshold are written once to a blob store
//! under a stable key and never rewritten. The contract is deliberately
//! tiny (`put` and `get`) so object stores slot in without touching the
//! engine.

use async_trait::async_trait;
use miette::Diagnostic;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors from blob storage.
#[derive(Debug, Error, Diagnostic)]
pub enum BlobError {
    /// No object under the requested key.
    #[error("blob not found: {key}")]
    #[diagnostic(code(stepledger::blob::not_found))]
    NotFound { key: String },

    /// Backend failure (I/O, connectivity).
    #[error("blob backend error: {message}")]
    #[diagnostic(code(stepledger::blob::backend))]
    Backend { message: String },
}

pub type Result<T> = std::result::Result<T, BlobError>;

/// Write-once object storage keyed by opaque strings.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Vec<u8>>;
}

/// Process-local blob store for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryBlobStore {
    inner: RwLock<FxHashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        self.inner.write().insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.inner
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| BlobError::NotFound {
                key: key.to_string(),
            })
    }
}

/// Filesystem-backed blob store rooted at a directory.
///
/// Keys map to paths below the root; path traversal segments are rejected.
/// Pairs with the SQLite store for a fully local deployment.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let traverses = relative.components().any(|c| {
            matches!(
                c,
                std::path::Component::ParentDir
                    | std::path::Component::RootDir
                    | std::path::Component::Prefix(_)
            )
        });
        if traverses {
            return Err(BlobError::Backend {
                message: format!("invalid blob key: {key}"),
            });
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| BlobError::Backend {
                    message: format!("create {}: {e}", parent.display()),
                })?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| BlobError::Backend {
                message: format!("write {}: {e}", path.display()),
            })
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(BlobError::NotFound {
                key: key.to_string(),
            }),
            Err(e) => Err(BlobError::Backend {
                message: format!("read {}: {e}", path.display()),
            }),
        }
    }
}
