//! Record map plus secondary indexes.
//!
//! [`KeypointIndex`] is the synchronous core shared by every store backend.
//! It owns the canonical records and three secondary indexes (secret, name,
//! scope). Each mutation removes the index entries of the previous record
//! before inserting the new ones, and empty buckets are pruned, so the
//! indexes are always a pure function of the records.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};

use crate::error::{Result, StoreError};
use crate::keypoint::{Keypoint, KeypointPatch};

/// Filter predicates for listing; all present predicates must hold.
#[derive(Debug, Clone, Default)]
pub struct KeypointFilter {
    /// Keypoints whose own grants satisfy this scope (see [`Keypoint::has_scope`]).
    pub scope: Option<String>,
    /// Keypoints listing this protocol.
    pub protocol: Option<String>,
    /// Match against the expiry state.
    pub expired: Option<bool>,
    /// Exact display-name match.
    pub name: Option<String>,
}

impl KeypointFilter {
    pub fn matches(&self, keypoint: &Keypoint, now: DateTime<Utc>) -> bool {
        if let Some(scope) = &self.scope {
            if !keypoint.has_scope(scope) {
                return false;
            }
        }
        if let Some(protocol) = &self.protocol {
            if !keypoint.protocols.contains(protocol) {
                return false;
            }
        }
        if let Some(expired) = self.expired {
            if keypoint.is_expired_at(now) != expired {
                return false;
            }
        }
        if let Some(name) = &self.name {
            if &keypoint.name != name {
                return false;
            }
        }
        true
    }
}

/// In-memory records with secondary indexes.
#[derive(Clone, Default)]
pub struct KeypointIndex {
    records: HashMap<String, Keypoint>,
    by_secret: HashMap<String, String>,
    by_name: HashMap<String, BTreeSet<String>>,
    by_scope: HashMap<String, BTreeSet<String>>,
}

impl KeypointIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an index from a list of records; later duplicates win.
    pub fn from_records(records: impl IntoIterator<Item = Keypoint>) -> Result<Self> {
        let mut index = Self::new();
        for keypoint in records {
            index.set(keypoint)?;
        }
        Ok(index)
    }

    /// Insert or replace a record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Validation`] if `keyId` is empty.
    pub fn set(&mut self, keypoint: Keypoint) -> Result<()> {
        if keypoint.key_id.trim().is_empty() {
            return Err(StoreError::validation("keyId is required"));
        }

        if let Some(previous) = self.records.remove(&keypoint.key_id) {
            self.unindex(&previous);
        }
        self.index(&keypoint);
        self.records.insert(keypoint.key_id.clone(), keypoint);
        Ok(())
    }

    pub fn get(&self, key_id: &str) -> Option<&Keypoint> {
        self.records.get(key_id)
    }

    pub fn get_by_secret(&self, secret: &str) -> Option<&Keypoint> {
        self.by_secret
            .get(secret)
            .and_then(|key_id| self.records.get(key_id))
    }

    pub fn get_by_name(&self, name: &str) -> Vec<&Keypoint> {
        self.lookup(self.by_name.get(name))
    }

    pub fn get_by_scope(&self, scope: &str) -> Vec<&Keypoint> {
        self.lookup(self.by_scope.get(scope))
    }

    /// Merge `patch` onto an existing record. Returns `false` if absent.
    pub fn update(&mut self, key_id: &str, patch: KeypointPatch, now: DateTime<Utc>) -> bool {
        let Some(mut keypoint) = self.records.remove(key_id) else {
            return false;
        };
        self.unindex(&keypoint);
        patch.apply(&mut keypoint, now);
        self.index(&keypoint);
        self.records.insert(keypoint.key_id.clone(), keypoint);
        true
    }

    /// Remove a record and its index entries. Returns `false` if absent.
    pub fn delete(&mut self, key_id: &str) -> bool {
        match self.records.remove(key_id) {
            Some(keypoint) => {
                self.unindex(&keypoint);
                true
            }
            None => false,
        }
    }

    /// Records matching `filter`, sorted by key id.
    pub fn list(&self, filter: &KeypointFilter, now: DateTime<Utc>) -> Vec<&Keypoint> {
        let mut matched: Vec<&Keypoint> = self
            .records
            .values()
            .filter(|kp| filter.matches(kp, now))
            .collect();
        matched.sort_by(|a, b| a.key_id.cmp(&b.key_id));
        matched
    }

    /// Delete every record expired at `now`; returns the removed key ids.
    pub fn remove_expired(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let expired: Vec<String> = self
            .records
            .values()
            .filter(|kp| kp.is_expired_at(now))
            .map(|kp| kp.key_id.clone())
            .collect();

        for key_id in &expired {
            self.delete(key_id);
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// All records, sorted by key id.
    pub fn records(&self) -> Vec<&Keypoint> {
        self.list(&KeypointFilter::default(), Utc::now())
    }

    // -- Index maintenance --------------------------------------------------

    fn lookup(&self, bucket: Option<&BTreeSet<String>>) -> Vec<&Keypoint> {
        bucket
            .map(|ids| ids.iter().filter_map(|id| self.records.get(id)).collect())
            .unwrap_or_default()
    }

    fn index(&mut self, keypoint: &Keypoint) {
        let key_id = &keypoint.key_id;
        self.by_secret
            .insert(keypoint.secret.clone(), key_id.clone());
        self.by_name
            .entry(keypoint.name.clone())
            .or_default()
            .insert(key_id.clone());
        for scope in &keypoint.scopes {
            self.by_scope
                .entry(scope.clone())
                .or_default()
                .insert(key_id.clone());
        }
    }

    fn unindex(&mut self, keypoint: &Keypoint) {
        let key_id = &keypoint.key_id;

        // Secrets are not unique; hand the entry to any remaining holder.
        if self.by_secret.get(&keypoint.secret) == Some(key_id) {
            self.by_secret.remove(&keypoint.secret);
            let heir = self
                .records
                .values()
                .find(|kp| kp.secret == keypoint.secret && kp.key_id != *key_id)
                .map(|kp| kp.key_id.clone());
            if let Some(heir) = heir {
                self.by_secret.insert(keypoint.secret.clone(), heir);
            }
        }
        remove_from_bucket(&mut self.by_name, &keypoint.name, key_id);
        for scope in &keypoint.scopes {
            remove_from_bucket(&mut self.by_scope, scope, key_id);
        }
    }

    #[cfg(test)]
    fn bucket_count(&self) -> (usize, usize, usize) {
        (self.by_secret.len(), self.by_name.len(), self.by_scope.len())
    }
}

// Secrets are index keys, so only sizes are printed.
impl std::fmt::Debug for KeypointIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeypointIndex")
            .field("records", &self.records.len())
            .field("names", &self.by_name.len())
            .field("scopes", &self.by_scope.len())
            .finish()
    }
}

fn remove_from_bucket(index: &mut HashMap<String, BTreeSet<String>>, key: &str, key_id: &str) {
    if let Some(bucket) = index.get_mut(key) {
        bucket.remove(key_id);
        if bucket.is_empty() {
            index.remove(key);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
