//! Per-(cluster, resource) version registry.
//!
//! Two-tier locking: a coarse lock guards the map structure with
//! double-checked lazy insertion; each record carries its own async rw-lock
//! so the token slot can be held across the remote write that produces the
//! token, without serializing unrelated keys.

use std::sync::{Arc, RwLock};

use rustc_hash::FxHashMap;
use tokio::sync::OwnedRwLockWriteGuard;
use tracing::debug;

use flotilla_core::{ResourceKey, VersionToken};

type RecordCell = tokio::sync::RwLock<Option<VersionToken>>;

#[derive(Default)]
pub struct VersionRegistry {
    records: RwLock<FxHashMap<(String, String), Arc<RecordCell>>>,
}

impl VersionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lookup(&self, cluster: &str, key: &ResourceKey) -> Option<Arc<RecordCell>> {
        let records = self.records.read().unwrap();
        records
            .get(&(cluster.to_string(), key.to_string()))
            .cloned()
    }

    fn ensure(&self, cluster: &str, key: &ResourceKey) -> Arc<RecordCell> {
        if let Some(cell) = self.lookup(cluster, key) {
            return cell;
        }
        let mut records = self.records.write().unwrap();
        // double-checked: another writer may have inserted in between
        records
            .entry((cluster.to_string(), key.to_string()))
            .or_insert_with(|| Arc::new(RecordCell::new(None)))
            .clone()
    }

    /// Last token recorded from a write response, if any.
    pub async fn recorded(&self, cluster: &str, key: &ResourceKey) -> Option<VersionToken> {
        let cell = self.lookup(cluster, key)?;
        let guard = cell.read().await;
        guard.clone()
    }

    /// Exclusive hold on the record slot for the duration of a remote write.
    /// The caller stores the token from the write response before releasing.
    pub async fn lock_for_write(
        &self,
        cluster: &str,
        key: &ResourceKey,
    ) -> OwnedRwLockWriteGuard<Option<VersionToken>> {
        let cell = self.ensure(cluster, key);
        cell.write_owned().await
    }

    /// Drop the record after a successful delete.
    pub fn forget(&self, cluster: &str, key: &ResourceKey) {
        let mut records = self.records.write().unwrap();
        if records
            .remove(&(cluster.to_string(), key.to_string()))
            .is_some()
        {
            debug!(cluster = %cluster, key = %key, "version record cleared");
        }
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
