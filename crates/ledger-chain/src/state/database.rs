use crate::{
    db::Database,
    state::{
        NodeDatabase,
        SnapshotTree,
        Trie,
        error::{
            StateError,
            StateResult,
            TrieResult,
        },
    },
    types::KECCAK_EMPTY,
};
use alloy_primitives::{
    B256,
    Bytes,
};
use moka::sync::Cache;
use parking_lot::RwLock;
use std::sync::Arc;

/// Weighted capacity of the contract code cache, in bytes.
const CODE_CACHE_SIZE: u64 = 64 * 1024 * 1024;

/// Entry point for opening state tries: the shared node database, a code
/// cache and the optional snapshot tree.
#[derive(Debug)]
pub struct StateDatabase {
    node_db: Arc<NodeDatabase>,
    code_cache: Cache<B256, Bytes>,
    snapshots: RwLock<Option<Arc<SnapshotTree>>>,
}

impl StateDatabase {
    pub fn new(db: Arc<Database>, trie_cache_limit_mib: usize) -> Self {
        Self::with_node_db(Arc::new(NodeDatabase::new(db, trie_cache_limit_mib)))
    }

    pub fn with_node_db(node_db: Arc<NodeDatabase>) -> Self {
        Self {
            node_db,
            code_cache: Cache::builder()
                .weigher(|_, code: &Bytes| u32::try_from(code.len()).unwrap_or(u32::MAX))
                .max_capacity(CODE_CACHE_SIZE)
                .build(),
            snapshots: RwLock::new(None),
        }
    }

    pub fn node_db(&self) -> &Arc<NodeDatabase> {
        &self.node_db
    }

    pub fn disk_db(&self) -> &Arc<Database> {
        self.node_db.disk_db()
    }

    pub fn open_trie(&self, root: B256) -> TrieResult<Trie> {
        Trie::open(root, self.node_db.clone())
    }

    pub fn open_storage_trie(&self, root: B256) -> TrieResult<Trie> {
        Trie::open(root, self.node_db.clone())
    }

    pub fn contract_code(&self, code_hash: B256) -> StateResult<Bytes> {
        if code_hash == KECCAK_EMPTY {
            return Ok(Bytes::new());
        }
        if let Some(code) = self.code_cache.get(&code_hash) {
            return Ok(code);
        }
        let code = Bytes::from(
            self.disk_db()
                .read_code(code_hash)?
                .ok_or(StateError::MissingCode(code_hash))?,
        );
        self.code_cache.insert(code_hash, code.clone());
        Ok(code)
    }

    pub fn contract_code_size(&self, code_hash: B256) -> StateResult<usize> {
        self.contract_code(code_hash).map(|code| code.len())
    }

    pub(crate) fn cache_code(&self, code_hash: B256, code: Bytes) {
        self.code_cache.insert(code_hash, code);
    }

    pub fn snapshots(&self) -> Option<Arc<SnapshotTree>> {
        self.snapshots.read().clone()
    }

    pub fn set_snapshots(&self, snapshots: Option<Arc<SnapshotTree>>) {
        *self.snapshots.write() = snapshots;
    }
}
