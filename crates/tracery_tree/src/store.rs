//! Key-value persistence.
//!
//! The tree is persisted as flat string pairs, one key per node attribute
//! (`node.<id>.<attr>`). Two backends implement the contract: an in-memory
//! map for tests and transient runs, and a redb database file for durable
//! trees that survive a restart.

use redb::{Database, ReadableTable, TableDefinition};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::RwLock;
use tracery_core::{CoreError, CoreResult};

const NODE_TABLE: TableDefinition<&str, &str> = TableDefinition::new("nodes");

/// Flat string key-value store
pub trait KvStore: Send + Sync {
    /// Value under `key`, if present.
    fn get(&self, key: &str) -> CoreResult<Option<String>>;

    /// Set `key` to `value`, overwriting any previous value.
    fn set(&self, key: &str, value: &str) -> CoreResult<()>;

    /// Every key in the store, in lexicographic order.
    fn keys(&self) -> CoreResult<Vec<String>>;
}

/// In-memory store
#[derive(Debug, Default)]
pub struct MemoryKv {
    entries: RwLock<BTreeMap<String, String>>,
}

impl MemoryKv {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryKv {
    fn get(&self, key: &str) -> CoreResult<Option<String>> {
        let entries = self.entries.read().map_err(poisoned)?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> CoreResult<()> {
        let mut entries = self.entries.write().map_err(poisoned)?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn keys(&self) -> CoreResult<Vec<String>> {
        let entries = self.entries.read().map_err(poisoned)?;
        Ok(entries.keys().cloned().collect())
    }
}

impl<S: KvStore + ?Sized> KvStore for std::sync::Arc<S> {
    fn get(&self, key: &str) -> CoreResult<Option<String>> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &str) -> CoreResult<()> {
        (**self).set(key, value)
    }

    fn keys(&self) -> CoreResult<Vec<String>> {
        (**self).keys()
    }
}

fn poisoned<T>(_: std::sync::PoisonError<T>) -> CoreError {
    CoreError::Internal {
        message: "store lock poisoned".to_string(),
    }
}

/// Durable store backed by a redb database file
pub struct RedbKv {
    db: Database,
}

impl RedbKv {
    /// Open or create the database at `path`.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Storage` if the database cannot be opened.
    pub fn open(path: impl AsRef<Path>) -> CoreResult<Self> {
        let db = Database::create(path).map_err(storage)?;
        // Create the table up front so reads on a fresh database succeed.
        let txn = db.begin_write().map_err(storage)?;
        txn.open_table(NODE_TABLE).map_err(storage)?;
        txn.commit().map_err(storage)?;
        Ok(Self { db })
    }
}

impl KvStore for RedbKv {
    fn get(&self, key: &str) -> CoreResult<Option<String>> {
        let txn = self.db.begin_read().map_err(storage)?;
        let table = txn.open_table(NODE_TABLE).map_err(storage)?;
        let value = table.get(key).map_err(storage)?;
        Ok(value.map(|guard| guard.value().to_string()))
    }

    fn set(&self, key: &str, value: &str) -> CoreResult<()> {
        let txn = self.db.begin_write().map_err(storage)?;
        {
            let mut table = txn.open_table(NODE_TABLE).map_err(storage)?;
            table.insert(key, value).map_err(storage)?;
        }
        txn.commit().map_err(storage)
    }

    fn keys(&self) -> CoreResult<Vec<String>> {
        let txn = self.db.begin_read().map_err(storage)?;
        let table = txn.open_table(NODE_TABLE).map_err(storage)?;
        let mut keys = Vec::new();
        for entry in table.iter().map_err(storage)? {
            let (key, _) = entry.map_err(storage)?;
            keys.push(key.value().to_string());
        }
        Ok(keys)
    }
}

fn storage(err: impl std::fmt::Display) -> CoreError {
    CoreError::Storage {
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(store: &dyn KvStore) {
        assert_eq!(store.get("node.0.parent_id").unwrap(), None);
        store.set("node.0.parent_id", "null").unwrap();
        store.set("node.1.parent_id", "0").unwrap();
        store.set("node.0.parent_id", "null").unwrap();
        assert_eq!(store.get("node.1.parent_id").unwrap().as_deref(), Some("0"));
        assert_eq!(
            store.keys().unwrap(),
            vec!["node.0.parent_id".to_string(), "node.1.parent_id".to_string()]
        );
    }

    #[test]
    fn test_memory_store() {
        exercise(&MemoryKv::new());
    }

    #[test]
    fn test_redb_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = RedbKv::open(dir.path().join("tree.redb")).unwrap();
        exercise(&store);
    }

    #[test]
    fn test_redb_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tree.redb");
        {
            let store = RedbKv::open(&path).unwrap();
            store.set("node.0.basic_blocks", "[4096]").unwrap();
        }
        let store = RedbKv::open(&path).unwrap();
        assert_eq!(
            store.get("node.0.basic_blocks").unwrap().as_deref(),
            Some("[4096]")
        );
    }
}
