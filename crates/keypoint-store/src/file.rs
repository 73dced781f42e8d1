//! File-backed keypoint store.
//!
//! The whole record set is kept in memory and written through to a single
//! JSON array after every mutation. Writes go to a sibling temp file that is
//! then renamed over the target, so a crash never leaves a half-written file.
//! Mutations are staged on a copy of the index and only become visible once
//! the write succeeds. A missing file loads as an empty store.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::error::{Result, StoreError};
use crate::index::{KeypointFilter, KeypointIndex};
use crate::keypoint::{Keypoint, KeypointPatch};
use crate::store::{KeypointStore, cloned};

/// Keypoint store persisted as a JSON array on disk.
#[derive(Debug)]
pub struct FileKeypointStore {
    path: PathBuf,
    inner: RwLock<KeypointIndex>,
}

impl FileKeypointStore {
    /// Open the store at `path`, loading any existing records.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the file exists but cannot be read, or
    /// [`StoreError::Corrupt`] if it is not a JSON array of keypoints.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let records = load_records(&path).await?;
        tracing::info!(path = %path.display(), count = records.len(), "keypoint file loaded");

        Ok(Self {
            inner: RwLock::new(KeypointIndex::from_records(records)?),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, index: &KeypointIndex) -> Result<()> {
        let records = index.records();
        let body = serde_json::to_vec_pretty(&records)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, &body).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        tracing::trace!(
            path = %self.path.display(),
            count = records.len(),
            "keypoint file written"
        );
        Ok(())
    }
}

async fn load_records(path: &Path) -> Result<Vec<Keypoint>> {
    let body = match tokio::fs::read(path).await {
        Ok(body) => body,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "keypoint file missing, starting empty");
            return Ok(Vec::new());
        }
        Err(e) => return Err(StoreError::Io(e)),
    };

    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }

    serde_json::from_slice(&body).map_err(|e| StoreError::Corrupt {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

#[async_trait]
impl KeypointStore for FileKeypointStore {
    async fn set(&self, keypoint: Keypoint) -> Result<()> {
        let key_id = keypoint.key_id.clone();
        let mut guard = self.inner.write().await;
        let mut staged = guard.clone();
        staged.set(keypoint)?;
        self.persist(&staged).await?;
        *guard = staged;
        tracing::info!(key_id = %key_id, "keypoint stored");
        Ok(())
    }

    async fn get(&self, key_id: &str) -> Result<Option<Keypoint>> {
        Ok(self.inner.read().await.get(key_id).cloned())
    }

    async fn get_by_secret(&self, secret: &str) -> Result<Option<Keypoint>> {
        Ok(self.inner.read().await.get_by_secret(secret).cloned())
    }

    async fn get_by_name(&self, name: &str) -> Result<Vec<Keypoint>> {
        Ok(cloned(self.inner.read().await.get_by_name(name)))
    }

    async fn get_by_scope(&self, scope: &str) -> Result<Vec<Keypoint>> {
        Ok(cloned(self.inner.read().await.get_by_scope(scope)))
    }

    async fn update(&self, key_id: &str, patch: KeypointPatch) -> Result<bool> {
        let mut guard = self.inner.write().await;
        let mut staged = guard.clone();
        if !staged.update(key_id, patch, Utc::now()) {
            return Ok(false);
        }
        self.persist(&staged).await?;
        *guard = staged;
        tracing::info!(key_id = %key_id, "keypoint updated");
        Ok(true)
    }

    async fn delete(&self, key_id: &str) -> Result<bool> {
        let mut guard = self.inner.write().await;
        let mut staged = guard.clone();
        if !staged.delete(key_id) {
            return Ok(false);
        }
        self.persist(&staged).await?;
        *guard = staged;
        tracing::info!(key_id = %key_id, "keypoint deleted");
        Ok(true)
    }

    async fn list(&self, filter: &KeypointFilter) -> Result<Vec<Keypoint>> {
        Ok(cloned(self.inner.read().await.list(filter, Utc::now())))
    }

    async fn cleanup_expired_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut guard = self.inner.write().await;
        let mut staged = guard.clone();
        let removed = staged.remove_expired(now);
        if !removed.is_empty() {
            self.persist(&staged).await?;
            *guard = staged;
            tracing::info!(count = removed.len(), "expired keypoints removed");
        }
        Ok(removed.len())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.inner.read().await.len())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
