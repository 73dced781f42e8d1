//! The keypoint store interface and its in-memory backend.
//!
//! Stores hand out clones, so callers never alias the canonical record.
//! Every backend serializes mutations behind one lock around a
//! [`KeypointIndex`], keeping records and indexes in step under a
//! multi-threaded runtime.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::error::Result;
use crate::index::{KeypointFilter, KeypointIndex};
use crate::keypoint::{Keypoint, KeypointPatch};

/// Repository of keypoint records with secondary lookups.
///
/// All backends share the same read/write contract; only durability differs.
#[async_trait]
pub trait KeypointStore: Send + Sync {
    /// Insert or replace the record with the same `keyId`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StoreError::Validation`] if `keyId` is empty.
    async fn set(&self, keypoint: Keypoint) -> Result<()>;

    async fn get(&self, key_id: &str) -> Result<Option<Keypoint>>;

    async fn get_by_secret(&self, secret: &str) -> Result<Option<Keypoint>>;

    async fn get_by_name(&self, name: &str) -> Result<Vec<Keypoint>>;

    /// Keypoints whose `scopes` literally contain `scope`.
    async fn get_by_scope(&self, scope: &str) -> Result<Vec<Keypoint>>;

    /// Merge `patch` onto an existing record and stamp `updatedAt`.
    ///
    /// Returns `false` if no record has this key id.
    async fn update(&self, key_id: &str, patch: KeypointPatch) -> Result<bool>;

    /// Returns `false` if no record has this key id.
    async fn delete(&self, key_id: &str) -> Result<bool>;

    async fn list(&self, filter: &KeypointFilter) -> Result<Vec<Keypoint>>;

    /// Delete every record expired at `now` and return how many were removed.
    async fn cleanup_expired_at(&self, now: DateTime<Utc>) -> Result<usize>;

    async fn count(&self) -> Result<usize>;

    /// Delete every expired record as of the system clock.
    async fn cleanup_expired(&self) -> Result<usize> {
        self.cleanup_expired_at(Utc::now()).await
    }

    /// Every record, sorted by key id.
    async fn all(&self) -> Result<Vec<Keypoint>> {
        self.list(&KeypointFilter::default()).await
    }
}

// ---------------------------------------------------------------------------
// MemoryKeypointStore
// ---------------------------------------------------------------------------

/// Process-local store with no persistence.
#[derive(Debug, Default)]
pub struct MemoryKeypointStore {
    inner: RwLock<KeypointIndex>,
}

impl MemoryKeypointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a store from existing records.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StoreError::Validation`] if any record lacks a key id.
    pub fn with_records(records: impl IntoIterator<Item = Keypoint>) -> Result<Self> {
        Ok(Self {
            inner: RwLock::new(KeypointIndex::from_records(records)?),
        })
    }
}

#[async_trait]
impl KeypointStore for MemoryKeypointStore {
    async fn set(&self, keypoint: Keypoint) -> Result<()> {
        let key_id = keypoint.key_id.clone();
        self.inner.write().await.set(keypoint)?;
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
        let updated = self.inner.write().await.update(key_id, patch, Utc::now());
        if updated {
            tracing::info!(key_id = %key_id, "keypoint updated");
        }
        Ok(updated)
    }

    async fn delete(&self, key_id: &str) -> Result<bool> {
        let deleted = self.inner.write().await.delete(key_id);
        if deleted {
            tracing::info!(key_id = %key_id, "keypoint deleted");
        }
        Ok(deleted)
    }

    async fn list(&self, filter: &KeypointFilter) -> Result<Vec<Keypoint>> {
        Ok(cloned(self.inner.read().await.list(filter, Utc::now())))
    }

    async fn cleanup_expired_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let removed = self.inner.write().await.remove_expired(now);
        if !removed.is_empty() {
            tracing::info!(count = removed.len(), "expired keypoints removed");
        }
        Ok(removed.len())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.inner.read().await.len())
    }
}

pub(crate) fn cloned(keypoints: Vec<&Keypoint>) -> Vec<Keypoint> {
    keypoints.into_iter().cloned().collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use chrono::Duration;

    #[tokio::test]
    async fn set_get_delete() {
        let store = MemoryKeypointStore::new();
        store
            .set(Keypoint::new("k1", "s1").with_scopes(["read"]))
            .await
            .unwrap();

        let kp = store.get("k1").await.unwrap().unwrap();
        assert!(kp.scopes.contains("read"));
        assert_eq!(store.count().await.unwrap(), 1);

        assert!(store.delete("k1").await.unwrap());
        assert!(store.get("k1").await.unwrap().is_none());
        assert!(!store.delete("k1").await.unwrap());
    }

    #[tokio::test]
    async fn set_rejects_missing_key_id() {
        let store = MemoryKeypointStore::new();
        let result = store.set(Keypoint::new("", "s")).await;
        assert!(matches!(result, Err(StoreError::Validation { .. })));
    }

    #[tokio::test]
    async fn reads_are_copies() {
        let store = MemoryKeypointStore::new();
        store.set(Keypoint::new("k1", "s1")).await.unwrap();

        let mut copy = store.get("k1").await.unwrap().unwrap();
        copy.scopes.insert("admin".into());

        assert!(store.get_by_scope("admin").await.unwrap().is_empty());
        assert!(store.get("k1").await.unwrap().unwrap().scopes.is_empty());
    }

    #[tokio::test]
    async fn cleanup_counts_removed() {
        let store = MemoryKeypointStore::new();
        let now = Utc::now();
        store.set(Keypoint::new("live", "a")).await.unwrap();
        store
            .set(Keypoint::new("old", "b").with_expires_at(now - Duration::days(1)))
            .await
            .unwrap();
        store
            .set(Keypoint::new("soon", "c").with_expires_at(now + Duration::hours(1)))
            .await
            .unwrap();

        assert_eq!(store.cleanup_expired_at(now).await.unwrap(), 1);
        assert_eq!(store.count().await.unwrap(), 2);

        let later = now + Duration::hours(2);
        assert_eq!(store.cleanup_expired_at(later).await.unwrap(), 1);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn seeded_store() {
        let store = MemoryKeypointStore::with_records([
            Keypoint::new("a", "1").with_name("team"),
            Keypoint::new("b", "2").with_name("team"),
        ])
        .unwrap();
        assert_eq!(store.get_by_name("team").await.unwrap().len(), 2);
        assert_eq!(store.get_by_secret("2").await.unwrap().unwrap().key_id, "b");
    }

    #[tokio::test]
    async fn all_is_sorted_by_key_id() {
        let store = MemoryKeypointStore::with_records([
            Keypoint::new("zeta", "1"),
            Keypoint::new("alpha", "2"),
        ])
        .unwrap();
        let ids: Vec<String> = store
            .all()
            .await
            .unwrap()
            .into_iter()
            .map(|kp| kp.key_id)
            .collect();
        assert_eq!(ids, vec!["alpha".to_string(), "zeta".to_string()]);
    }

    #[test]
    fn store_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<MemoryKeypointStore>();
    }
}
