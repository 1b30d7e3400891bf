//! services/api/src/adapters/blob.rs
//!
//! This module contains the filesystem blob store.
//! It implements the `BlobStore` port from the `core` crate. Keys are relative,
//! slash-separated paths under a root directory; writes go through a temp file and a
//! rename so readers never observe a partial image.

use async_trait::async_trait;
use bedtime_core::ports::{BlobStore, PortError, PortResult};
use bytes::Bytes;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

/// An adapter that implements `BlobStore` on the local filesystem.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    /// Creates the store, creating `root` if it doesn't exist.
    pub fn new(root: impl Into<PathBuf>) -> std::io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Maps a key to a path under the root, rejecting keys that would escape it.
    fn path_for(&self, key: &str) -> PortResult<PathBuf> {
        let relative = Path::new(key);
        let safe = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(PortError::InvalidInput(format!("Invalid blob key '{}'", key)));
        }
        Ok(self.root.join(relative))
    }
}

fn io_error(path: &Path, e: std::io::Error) -> PortError {
    if e.kind() == std::io::ErrorKind::NotFound {
        PortError::NotFound(format!("Blob {} not found", path.display()))
    } else {
        PortError::Unexpected(format!("Blob I/O failed for {}: {}", path.display(), e))
    }
}

/// Reads a text blob, or `None` when nothing is stored under `key`.
pub async fn read_optional_text(blobs: &dyn BlobStore, key: &str) -> PortResult<Option<String>> {
    if !blobs.exists(key).await? {
        return Ok(None);
    }
    let raw = blobs.get(key).await?;
    Ok(Some(String::from_utf8_lossy(&raw).trim().to_string()))
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, key: &str, data: Bytes, content_type: &str) -> PortResult<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(parent, e))?;
        }

        // One temp file per write; concurrent puts to a key never share one.
        let mut temp_name = path.as_os_str().to_owned();
        temp_name.push(format!(".{}.tmp", Uuid::new_v4()));
        let temp_path = PathBuf::from(temp_name);
        tokio::fs::write(&temp_path, &data)
            .await
            .map_err(|e| io_error(&temp_path, e))?;
        if let Err(e) = tokio::fs::rename(&temp_path, &path).await {
            if let Err(cleanup) = tokio::fs::remove_file(&temp_path).await {
                warn!("Could not remove {}: {}", temp_path.display(), cleanup);
            }
            return Err(io_error(&path, e));
        }

        debug!("Stored {} bytes ({}) at {}", data.len(), content_type, key);
        Ok(())
    }

    async fn get(&self, key: &str) -> PortResult<Bytes> {
        let path = self.path_for(key)?;
        let data = tokio::fs::read(&path).await.map_err(|e| io_error(&path, e))?;
        Ok(Bytes::from(data))
    }

    async fn exists(&self, key: &str) -> PortResult<bool> {
        let path = self.path_for(key)?;
        tokio::fs::try_exists(&path)
            .await
            .map_err(|e| io_error(&path, e))
    }
}
