// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Embedded ordered key/value persistence behind a tiny facade. One store
//! may host several chains in one process; all keys are namespaced with a
//! `_<network>` suffix. The only mutation primitive exposed to callers that
//! need consistency is the atomic batch.

use crate::error::{WatchError, WatchResult};
use rocksdb::{Options, WriteBatch, DB};
use std::path::Path;
use tracing::debug;

pub const KEY_REGISTRY_VERSION: &str = "CONDITIONAL_ORDER_REGISTRY_VERSION";
pub const KEY_REGISTRY: &str = "CONDITIONAL_ORDER_REGISTRY";
pub const KEY_LAST_PROCESSED_BLOCK: &str = "LAST_PROCESSED_BLOCK";
pub const KEY_LAST_NOTIFIED_ERROR: &str = "LAST_NOTIFIED_ERROR";

/// Appends the network namespace to a recognised key
pub fn storage_key(base: &str, network: &str) -> String {
    format!("{}_{}", base, network)
}

pub struct RegistryStore {
    db: DB,
}

impl RegistryStore {
    /// Opens (creating if missing) the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> WatchResult<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path.as_ref())
            .map_err(|e| WatchError::Store(format!("open {}: {}", path.as_ref().display(), e)))?;
        debug!("Registry store opened at {}", path.as_ref().display());
        Ok(Self { db })
    }

    pub fn get(&self, key: &str) -> WatchResult<Option<Vec<u8>>> {
        self.db
            .get(key.as_bytes())
            .map_err(|e| WatchError::Store(format!("get {}: {}", key, e)))
    }

    pub fn put(&self, key: &str, value: &[u8]) -> WatchResult<()> {
        self.db
            .put(key.as_bytes(), value)
            .map_err(|e| WatchError::Store(format!("put {}: {}", key, e)))
    }

    pub fn del(&self, key: &str) -> WatchResult<()> {
        self.db
            .delete(key.as_bytes())
            .map_err(|e| WatchError::Store(format!("del {}: {}", key, e)))
    }

    /// Returns a writer whose operations commit atomically
    pub fn batch(&self) -> StoreBatch<'_> {
        StoreBatch {
            store: self,
            inner: WriteBatch::default(),
        }
    }

    /// Flushes memtables to disk. Idempotent; the store is fully released
    /// on drop.
    pub fn close(&self) {
        if let Err(e) = self.db.flush() {
            debug!("Registry store flush on close failed: {}", e);
        }
    }
}

/// Atomic write batch. A torn write is never observable: either every
/// operation in the batch lands or none does.
pub struct StoreBatch<'a> {
    store: &'a RegistryStore,
    inner: WriteBatch,
}

impl StoreBatch<'_> {
    pub fn put(&mut self, key: &str, value: &[u8]) {
        self.inner.put(key.as_bytes(), value);
    }

    pub fn del(&mut self, key: &str) {
        self.inner.delete(key.as_bytes());
    }

    pub fn commit(self) -> WatchResult<()> {
        self.store
            .db
            .write(self.inner)
            .map_err(|e| WatchError::Store(format!("batch commit: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_temp() -> (TempDir, RegistryStore) {
        let dir = TempDir::new().unwrap();
        let store = RegistryStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn test_get_put_del_round_trip() {
        let (_dir, store) = open_temp();
        let key = storage_key(KEY_REGISTRY, "1");

        assert_eq!(store.get(&key).unwrap(), None);
        store.put(&key, b"payload").unwrap();
        assert_eq!(store.get(&key).unwrap(), Some(b"payload".to_vec()));
        store.del(&key).unwrap();
        assert_eq!(store.get(&key).unwrap(), None);
        // Deleting an absent key is fine.
        store.del(&key).unwrap();
    }

    #[test]
    fn test_batch_commits_all_operations() {
        let (_dir, store) = open_temp();
        store.put("doomed_1", b"x").unwrap();

        let mut batch = store.batch();
        batch.put("a_1", b"1");
        batch.put("b_1", b"2");
        batch.del("doomed_1");
        batch.commit().unwrap();

        assert_eq!(store.get("a_1").unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.get("b_1").unwrap(), Some(b"2".to_vec()));
        assert_eq!(store.get("doomed_1").unwrap(), None);
    }

    #[test]
    fn test_dropped_batch_writes_nothing() {
        let (_dir, store) = open_temp();
        {
            let mut batch = store.batch();
            batch.put("never_1", b"1");
            // batch dropped without commit
        }
        assert_eq!(store.get("never_1").unwrap(), None);
    }

    #[test]
    fn test_network_namespacing_isolates_chains() {
        let (_dir, store) = open_temp();
        store
            .put(&storage_key(KEY_REGISTRY_VERSION, "1"), b"1")
            .unwrap();
        assert_eq!(store.get(&storage_key(KEY_REGISTRY_VERSION, "100")).unwrap(), None);
    }

    #[test]
    fn test_close_is_idempotent() {
        let (_dir, store) = open_temp();
        store.close();
        store.close();
    }
}
