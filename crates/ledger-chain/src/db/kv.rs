//! Raw key-value stores underneath the typed [`Database`](super::Database).

use crate::{
    constants::IDEAL_BATCH_SIZE,
    db::error::{
        DatabaseError,
        DatabaseResult,
    },
};
use parking_lot::{
    Mutex,
    RwLock,
};
use std::{
    collections::BTreeMap,
    path::Path,
    sync::Arc,
};

/// Storage backend of a key-value store.
enum StoreBackend {
    /// Ephemeral ordered map. Data is lost when the store is dropped.
    InMemory { map: RwLock<BTreeMap<Vec<u8>, Vec<u8>>> },
    /// Persistent sled database. The handle is not `Sync`, so every access
    /// goes through the mutex.
    Sled { db: Mutex<Box<sled::Db>> },
}

/// Cheaply clonable handle to a key-value store.
#[derive(Clone)]
pub struct KeyValueStore {
    backend: Arc<StoreBackend>,
}

impl std::fmt::Debug for KeyValueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let backend = match self.backend.as_ref() {
            StoreBackend::InMemory { .. } => "InMemory",
            StoreBackend::Sled { .. } => "Sled",
        };
        f.debug_struct("KeyValueStore")
            .field("backend", &backend)
            .finish()
    }
}

impl KeyValueStore {
    pub fn new_in_memory() -> Self {
        Self {
            backend: Arc::new(StoreBackend::InMemory {
                map: RwLock::new(BTreeMap::new()),
            }),
        }
    }

    pub fn open_sled(path: impl AsRef<Path>) -> DatabaseResult<Self> {
        let db = sled::Config::new()
            .path(path.as_ref())
            .open()
            .map_err(DatabaseError::SledError)?;
        Ok(Self {
            backend: Arc::new(StoreBackend::Sled {
                db: Mutex::new(Box::new(db)),
            }),
        })
    }

    pub fn is_in_memory(&self) -> bool {
        matches!(self.backend.as_ref(), StoreBackend::InMemory { .. })
    }

    pub fn get(&self, key: &[u8]) -> DatabaseResult<Option<Vec<u8>>> {
        match self.backend.as_ref() {
            StoreBackend::InMemory { map } => Ok(map.read().get(key).cloned()),
            StoreBackend::Sled { db } => {
                db.lock()
                    .get(key)
                    .map(|value| value.map(|value| value.to_vec()))
                    .map_err(DatabaseError::SledError)
            }
        }
    }

    pub fn has(&self, key: &[u8]) -> DatabaseResult<bool> {
        match self.backend.as_ref() {
            StoreBackend::InMemory { map } => Ok(map.read().contains_key(key)),
            StoreBackend::Sled { db } => db.lock().contains_key(key).map_err(DatabaseError::SledError),
        }
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> DatabaseResult {
        match self.backend.as_ref() {
            StoreBackend::InMemory { map } => {
                map.write().insert(key.to_vec(), value.to_vec());
                Ok(())
            }
            StoreBackend::Sled { db } => {
                db.lock()
                    .insert(key.to_vec(), value.to_vec())
                    .map_err(DatabaseError::SledError)?;
                Ok(())
            }
        }
    }

    pub fn delete(&self, key: &[u8]) -> DatabaseResult {
        match self.backend.as_ref() {
            StoreBackend::InMemory { map } => {
                map.write().remove(key);
                Ok(())
            }
            StoreBackend::Sled { db } => {
                db.lock().remove(key).map_err(DatabaseError::SledError)?;
                Ok(())
            }
        }
    }

    /// All entries whose key starts with `prefix`, in key order.
    pub fn iter_prefix(&self, prefix: &[u8]) -> DatabaseResult<Vec<(Vec<u8>, Vec<u8>)>> {
        match self.backend.as_ref() {
            StoreBackend::InMemory { map } => {
                Ok(map
                    .read()
                    .range(prefix.to_vec()..)
                    .take_while(|(key, _)| key.starts_with(prefix))
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect())
            }
            StoreBackend::Sled { db } => {
                db.lock()
                    .scan_prefix(prefix)
                    .map(|entry| {
                        entry
                            .map(|(key, value)| (key.to_vec(), value.to_vec()))
                            .map_err(DatabaseError::SledError)
                    })
                    .collect()
            }
        }
    }

    /// Applies the batch atomically.
    pub fn write(&self, batch: &Batch) -> DatabaseResult {
        match self.backend.as_ref() {
            StoreBackend::InMemory { map } => {
                let mut map = map.write();
                for op in &batch.ops {
                    match op {
                        BatchOp::Put(key, value) => {
                            map.insert(key.clone(), value.clone());
                        }
                        BatchOp::Delete(key) => {
                            map.remove(key);
                        }
                    }
                }
                Ok(())
            }
            StoreBackend::Sled { db } => {
                let mut sled_batch = sled::Batch::default();
                for op in &batch.ops {
                    match op {
                        BatchOp::Put(key, value) => sled_batch.insert(key.clone(), value.clone()),
                        BatchOp::Delete(key) => sled_batch.remove(key.clone()),
                    }
                }
                db.lock().apply_batch(sled_batch).map_err(DatabaseError::SledError)
            }
        }
    }

    pub fn flush(&self) -> DatabaseResult {
        match self.backend.as_ref() {
            StoreBackend::InMemory { .. } => Ok(()),
            StoreBackend::Sled { db } => {
                db.lock().flush().map_err(DatabaseError::SledError)?;
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone)]
enum BatchOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

/// Which store of the [`Database`](super::Database) a batch is written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchTarget {
    /// Headers, bodies, receipts, lookups and metadata.
    Chain,
    /// Trie nodes and contract code. Routed to the migration target while a
    /// state migration is running.
    StateTrie,
}

/// Write-only batch accumulating puts and deletes with their byte size.
#[derive(Debug, Clone)]
pub struct Batch {
    target: BatchTarget,
    ops: Vec<BatchOp>,
    size: usize,
}

impl Batch {
    pub fn new(target: BatchTarget) -> Self {
        Self {
            target,
            ops: Vec::new(),
            size: 0,
        }
    }

    pub fn target(&self) -> BatchTarget {
        self.target
    }

    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.size += key.len() + value.len();
        self.ops.push(BatchOp::Put(key, value));
    }

    pub fn delete(&mut self, key: Vec<u8>) {
        self.size += key.len();
        self.ops.push(BatchOp::Delete(key));
    }

    /// Pending bytes.
    pub fn value_size(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn reset(&mut self) {
        self.ops.clear();
        self.size = 0;
    }

    pub fn over_threshold(&self) -> bool {
        self.size >= IDEAL_BATCH_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(store: &KeyValueStore) {
        store.put(b"a1", b"one").unwrap();
        store.put(b"a2", b"two").unwrap();
        store.put(b"b1", b"three").unwrap();
        assert_eq!(store.get(b"a1").unwrap(), Some(b"one".to_vec()));
        assert!(store.has(b"b1").unwrap());

        let entries = store.iter_prefix(b"a").unwrap();
        assert_eq!(entries.len(), 2, "prefix scan must not leak into other prefixes");

        let mut batch = Batch::new(BatchTarget::Chain);
        batch.put(b"c1".to_vec(), b"four".to_vec());
        batch.delete(b"a1".to_vec());
        assert_eq!(batch.value_size(), 2 + 4 + 2);
        store.write(&batch).unwrap();
        assert_eq!(store.get(b"a1").unwrap(), None);
        assert_eq!(store.get(b"c1").unwrap(), Some(b"four".to_vec()));
    }

    #[test]
    fn in_memory_store() {
        exercise(&KeyValueStore::new_in_memory());
    }

    #[test]
    fn sled_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyValueStore::open_sled(dir.path().join("kv")).unwrap();
        exercise(&store);
        store.flush().unwrap();
    }

    #[test]
    fn sled_store_is_shared_across_threads() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyValueStore::open_sled(dir.path().join("kv")).unwrap();
        let handles: Vec<_> = (0u8..4)
            .map(|writer| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for i in 0u8..16 {
                        store.put(&[writer, i], &[i]).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        for writer in 0u8..4 {
            assert_eq!(store.iter_prefix(&[writer]).unwrap().len(), 16);
        }
    }

    #[test]
    fn batch_threshold() {
        let mut batch = Batch::new(BatchTarget::StateTrie);
        assert!(!batch.over_threshold());
        batch.put(vec![0; 32], vec![0; IDEAL_BATCH_SIZE]);
        assert!(batch.over_threshold());
        batch.reset();
        assert!(batch.is_empty());
    }
}
