//! In-memory trie node cache with reference counting.
//!
//! Freshly committed trie nodes are kept in memory ("dirty") until the state
//! they belong to is either dereferenced by the GC loop, flushed by
//! [`NodeDatabase::cap`], or persisted by [`NodeDatabase::commit`].
//!
//! Dirty nodes form an insertion-ordered flush list. `cap` writes nodes from
//! the oldest end, which keeps children on disk before their parents.

use crate::{
    constants::{
        IDEAL_BATCH_SIZE,
        MIB,
        PREIMAGE_FLUSH_THRESHOLD,
    },
    db::{
        BatchTarget,
        Database,
        DatabaseResult,
    },
    metrics,
    state::node::NodeSet,
};
use alloy_primitives::B256;
use moka::sync::Cache;
use parking_lot::{
    RawRwLock,
    RwLock,
    lock_api::ArcRwLockReadGuard,
};
use std::{
    collections::HashMap,
    sync::Arc,
    time::Instant,
};
use tracing::{
    debug,
    error,
    info,
    instrument,
};

/// Bookkeeping overhead of a dirty node: the two flush-list links.
const FLUSH_LINKS_SIZE: usize = 2 * 32;

/// Read guard preventing the GC loop from dereferencing nodes.
pub type GcReadGuard = ArcRwLockReadGuard<RawRwLock, ()>;

#[derive(Debug, Clone)]
struct DirtyNode {
    blob: Arc<[u8]>,
    /// Hashed nodes referenced by the encoding itself.
    structural: Vec<B256>,
    /// References added through [`NodeDatabase::reference`].
    external: HashMap<B256, u32>,
    parents: u32,
    flush_prev: B256,
    flush_next: B256,
}

impl DirtyNode {
    fn size(&self) -> usize {
        self.blob.len()
    }

    fn children(&self) -> impl Iterator<Item = B256> + '_ {
        self.structural
            .iter()
            .copied()
            .chain(self.external.keys().copied())
    }
}

/// Dirty node set. `B256::ZERO` is the meta-root that anchors every live
/// state root and doubles as the null link of the flush list.
#[derive(Debug)]
struct Dirties {
    nodes: HashMap<B256, DirtyNode>,
    oldest: B256,
    newest: B256,
    nodes_size: usize,
    preimages: HashMap<B256, Vec<u8>>,
    preimages_size: usize,
    gc_nodes: u64,
    gc_size: usize,
    flush_nodes: u64,
    flush_size: usize,
}

impl Dirties {
    fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            B256::ZERO,
            DirtyNode {
                blob: Arc::from(Vec::new()),
                structural: Vec::new(),
                external: HashMap::new(),
                parents: 0,
                flush_prev: B256::ZERO,
                flush_next: B256::ZERO,
            },
        );
        Self {
            nodes,
            oldest: B256::ZERO,
            newest: B256::ZERO,
            nodes_size: 0,
            preimages: HashMap::new(),
            preimages_size: 0,
            gc_nodes: 0,
            gc_size: 0,
            flush_nodes: 0,
            flush_size: 0,
        }
    }

    fn len(&self) -> usize {
        self.nodes.len() - 1
    }

    /// Memory held by dirty nodes including flush-list links.
    fn size(&self) -> usize {
        self.nodes_size + self.len() * FLUSH_LINKS_SIZE
    }

    fn insert(&mut self, hash: B256, blob: &[u8], structural: Vec<B256>) {
        if self.nodes.contains_key(&hash) {
            return;
        }
        for child in &structural {
            if let Some(node) = self.nodes.get_mut(child) {
                node.parents += 1;
            }
        }
        let node = DirtyNode {
            blob: Arc::from(blob),
            structural,
            external: HashMap::new(),
            parents: 0,
            flush_prev: self.newest,
            flush_next: B256::ZERO,
        };
        self.nodes_size += 32 + node.size();
        if self.oldest == B256::ZERO {
            self.oldest = hash;
        } else if let Some(newest) = self.nodes.get_mut(&self.newest) {
            newest.flush_next = hash;
        }
        self.newest = hash;
        self.nodes.insert(hash, node);
    }

    /// Unlinks `hash` from the flush list.
    fn unlink(&mut self, hash: B256, prev: B256, next: B256) {
        if hash == self.oldest {
            self.oldest = next;
        } else if let Some(node) = self.nodes.get_mut(&prev) {
            node.flush_next = next;
        }
        if hash == self.newest {
            self.newest = prev;
        } else if let Some(node) = self.nodes.get_mut(&next) {
            node.flush_prev = prev;
        }
        if let Some(meta) = self.nodes.get_mut(&B256::ZERO) {
            meta.flush_prev = B256::ZERO;
            meta.flush_next = B256::ZERO;
        }
    }

    fn reference(&mut self, child: B256, parent: B256) {
        if child == B256::ZERO || !self.nodes.contains_key(&child) {
            return;
        }
        let Some(parent_node) = self.nodes.get_mut(&parent) else {
            return;
        };
        // Duplicate references are only counted for the meta-root, which
        // anchors the same root once per block that produced it.
        if parent != B256::ZERO && parent_node.external.contains_key(&child) {
            return;
        }
        *parent_node.external.entry(child).or_insert(0) += 1;
        if let Some(child_node) = self.nodes.get_mut(&child) {
            child_node.parents += 1;
        }
    }

    fn dereference(&mut self, child: B256, parent: B256) {
        if let Some(parent_node) = self.nodes.get_mut(&parent) {
            if let Some(count) = parent_node.external.get_mut(&child) {
                *count -= 1;
                if *count == 0 {
                    parent_node.external.remove(&child);
                }
            }
        }
        let Some(node) = self.nodes.get_mut(&child) else {
            return;
        };
        node.parents = node.parents.saturating_sub(1);
        if node.parents > 0 {
            return;
        }
        let Some(node) = self.nodes.remove(&child) else {
            return;
        };
        self.unlink(child, node.flush_prev, node.flush_next);
        self.nodes_size -= 32 + node.size();
        self.gc_nodes += 1;
        self.gc_size += 32 + node.size();
        for grandchild in node.children() {
            self.dereference(grandchild, child);
        }
    }

    /// Removes `hash` and its dirty subtree after they have been persisted.
    fn uncache(&mut self, hash: B256) {
        let Some(node) = self.nodes.remove(&hash) else {
            return;
        };
        self.unlink(hash, node.flush_prev, node.flush_next);
        self.nodes_size -= 32 + node.size();
        for child in node.children() {
            self.uncache(child);
        }
    }
}

/// Trie node store shared by every state trie of the chain.
pub struct NodeDatabase {
    db: Arc<Database>,
    dirties: RwLock<Dirties>,
    /// Held for writing while dereferencing. Readers hold it across an
    /// open-then-read sequence so their nodes cannot vanish midway.
    gc_lock: Arc<RwLock<()>>,
    clean: Option<Cache<B256, Arc<[u8]>>>,
    clean_limit: u64,
}

impl std::fmt::Debug for NodeDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (nodes, preimages) = self.size();
        f.debug_struct("NodeDatabase")
            .field("dirty_size", &nodes)
            .field("preimages_size", &preimages)
            .finish_non_exhaustive()
    }
}

impl NodeDatabase {
    /// `clean_cache_mib` sizes the hot cache in front of the disk; zero
    /// disables it.
    pub fn new(db: Arc<Database>, clean_cache_mib: usize) -> Self {
        let clean_limit = (clean_cache_mib * MIB) as u64;
        let clean = (clean_limit > 0).then(|| {
            Cache::builder()
                .weigher(|_key: &B256, blob: &Arc<[u8]>| {
                    u32::try_from(blob.len() + 32).unwrap_or(u32::MAX)
                })
                .max_capacity(clean_limit)
                .build()
        });
        Self {
            db,
            dirties: RwLock::new(Dirties::new()),
            gc_lock: Arc::new(RwLock::new(())),
            clean,
            clean_limit,
        }
    }

    pub fn disk_db(&self) -> &Arc<Database> {
        &self.db
    }

    /// Blocks dereferencing until the guard is dropped.
    pub fn rlock_gc_cached_node(&self) -> GcReadGuard {
        self.gc_lock.read_arc()
    }

    /// Encoded node by hash: dirty set, then hot cache, then disk.
    pub fn node(&self, hash: B256) -> DatabaseResult<Option<Arc<[u8]>>> {
        if let Some(node) = self.dirties.read().nodes.get(&hash) {
            if hash != B256::ZERO {
                return Ok(Some(node.blob.clone()));
            }
        }
        if let Some(clean) = &self.clean {
            if let Some(blob) = clean.get(&hash) {
                return Ok(Some(blob));
            }
        }
        let Some(blob) = self.db.read_trie_node(hash)? else {
            return Ok(None);
        };
        let blob: Arc<[u8]> = Arc::from(blob);
        if let Some(clean) = &self.clean {
            clean.insert(hash, blob.clone());
        }
        Ok(Some(blob))
    }

    /// Hashes of all dirty nodes.
    pub fn nodes(&self) -> Vec<B256> {
        self.dirties
            .read()
            .nodes
            .keys()
            .filter(|hash| **hash != B256::ZERO)
            .copied()
            .collect()
    }

    /// Children of a dirty node, structural first.
    pub fn node_children(&self, hash: B256) -> Vec<B256> {
        self.dirties
            .read()
            .nodes
            .get(&hash)
            .map(|node| node.children().collect())
            .unwrap_or_default()
    }

    pub fn does_exist_cached_node(&self, hash: B256) -> bool {
        (hash != B256::ZERO && self.dirties.read().nodes.contains_key(&hash)) ||
            self.clean
                .as_ref()
                .is_some_and(|clean| clean.contains_key(&hash))
    }

    pub fn does_exist_node_in_persistent(&self, hash: B256) -> DatabaseResult<bool> {
        self.db.has_trie_node(hash)
    }

    /// Number of parents referencing a dirty node.
    pub fn parents(&self, hash: B256) -> Option<u32> {
        self.dirties.read().nodes.get(&hash).map(|node| node.parents)
    }

    /// Adds the nodes of a trie commit to the dirty set.
    pub fn insert_set(&self, set: &NodeSet) {
        let mut dirties = self.dirties.write();
        for node in &set.nodes {
            dirties.insert(node.hash, &node.blob, node.children.clone());
        }
        metrics::set_trie_dirty_size(dirties.size());
    }

    pub fn insert_preimage(&self, hash: B256, preimage: Vec<u8>) {
        let mut dirties = self.dirties.write();
        if dirties.preimages.contains_key(&hash) {
            return;
        }
        dirties.preimages_size += 32 + preimage.len();
        dirties.preimages.insert(hash, preimage);
    }

    pub fn preimage(&self, hash: B256) -> DatabaseResult<Option<Vec<u8>>> {
        if let Some(preimage) = self.dirties.read().preimages.get(&hash) {
            return Ok(Some(preimage.clone()));
        }
        self.db.read_preimage(hash)
    }

    /// Adds a reference from `parent` to `child`. `B256::ZERO` as parent
    /// anchors a state root.
    pub fn reference(&self, child: B256, parent: B256) {
        self.dirties.write().reference(child, parent);
    }

    /// Drops the meta-root reference of `root` and frees every dirty node
    /// no longer referenced.
    pub fn dereference(&self, root: B256) {
        if root == B256::ZERO {
            error!(target: "ledger-chain::trie", "Attempted to dereference the trie cache meta root");
            return;
        }
        let _gc = self.gc_lock.write();
        let start = Instant::now();
        let mut dirties = self.dirties.write();
        let (nodes, size) = (dirties.len(), dirties.nodes_size);
        dirties.dereference(root, B256::ZERO);
        debug!(
            target: "ledger-chain::trie",
            %root,
            nodes = nodes - dirties.len(),
            size = size - dirties.nodes_size,
            elapsed = ?start.elapsed(),
            live_nodes = dirties.len(),
            live_size = dirties.nodes_size,
            "Dereferenced trie from memory database"
        );
        metrics::set_trie_dirty_size(dirties.size());
    }

    /// Flushes the oldest dirty nodes until the dirty set fits in `limit`
    /// bytes. Preimages are flushed too once they pass their threshold.
    #[instrument(skip(self), level = "debug")]
    pub fn cap(&self, limit: usize) -> DatabaseResult {
        let start = Instant::now();
        let (flush_preimages, flushed, nodes_before, size_before) = {
            let dirties = self.dirties.read();
            let mut size = dirties.size();
            let nodes_before = dirties.len();
            let size_before = dirties.nodes_size;
            let flush_preimages = dirties.preimages_size > PREIMAGE_FLUSH_THRESHOLD;

            if flush_preimages {
                let mut batch = self.db.new_batch(BatchTarget::Chain);
                self.db.write_preimages(&mut batch, &dirties.preimages);
                self.db.flush_batch(&mut batch)?;
            }

            let mut batch = self.db.new_batch(BatchTarget::StateTrie);
            let mut flushed = Vec::new();
            let mut oldest = dirties.oldest;
            while size > limit && oldest != B256::ZERO {
                let Some(node) = dirties.nodes.get(&oldest) else {
                    break;
                };
                self.db.write_trie_node(&mut batch, oldest, node.blob.to_vec());
                if batch.value_size() >= IDEAL_BATCH_SIZE {
                    self.db.flush_batch(&mut batch)?;
                }
                size = size.saturating_sub(3 * 32 + node.size());
                flushed.push(oldest);
                oldest = node.flush_next;
            }
            self.db.flush_batch(&mut batch)?;
            (flush_preimages, flushed, nodes_before, size_before)
        };

        let mut dirties = self.dirties.write();
        if flush_preimages {
            dirties.preimages.clear();
            dirties.preimages_size = 0;
        }
        for hash in &flushed {
            // Nodes may have been dereferenced while the lock was released.
            let Some(node) = dirties.nodes.remove(hash) else {
                continue;
            };
            dirties.unlink(*hash, node.flush_prev, node.flush_next);
            dirties.nodes_size -= 32 + node.size();
            dirties.flush_nodes += 1;
            dirties.flush_size += 32 + node.size();
            if let Some(clean) = &self.clean {
                clean.insert(*hash, node.blob.clone());
            }
        }
        debug!(
            target: "ledger-chain::trie",
            nodes = nodes_before - dirties.len(),
            size = size_before - dirties.nodes_size,
            elapsed = ?start.elapsed(),
            live_nodes = dirties.len(),
            live_size = dirties.nodes_size,
            "Persisted nodes from memory database"
        );
        metrics::record_trie_flush(flushed.len(), start.elapsed());
        metrics::set_trie_dirty_size(dirties.size());
        Ok(())
    }

    /// Writes `root` and its dirty subtree to disk, children first, then
    /// drops them from memory.
    #[instrument(skip(self), level = "debug")]
    pub fn commit(&self, root: B256, report: bool, block_number: u64) -> DatabaseResult {
        let start = Instant::now();
        let mut dirties = self.dirties.write();
        let (nodes_before, size_before) = (dirties.len(), dirties.nodes_size);

        let mut preimage_batch = self.db.new_batch(BatchTarget::Chain);
        self.db
            .write_preimages(&mut preimage_batch, &dirties.preimages);
        self.db.flush_batch(&mut preimage_batch)?;

        let mut batch = self.db.new_batch(BatchTarget::StateTrie);
        let mut written = Vec::new();
        self.commit_node(&dirties, root, &mut batch, &mut written)?;
        self.db.flush_batch(&mut batch)?;

        dirties.preimages.clear();
        dirties.preimages_size = 0;
        if let Some(clean) = &self.clean {
            for hash in &written {
                if let Some(node) = dirties.nodes.get(hash) {
                    clean.insert(*hash, node.blob.clone());
                }
            }
        }
        dirties.uncache(root);

        let nodes = nodes_before - dirties.len();
        let size = size_before - dirties.nodes_size;
        dirties.flush_nodes += nodes as u64;
        dirties.flush_size += size;
        if report {
            info!(
                target: "ledger-chain::trie",
                block_number,
                nodes,
                size,
                elapsed = ?start.elapsed(),
                live_nodes = dirties.len(),
                live_size = dirties.nodes_size,
                "Persisted trie from memory database"
            );
        } else {
            debug!(
                target: "ledger-chain::trie",
                block_number,
                nodes,
                size,
                elapsed = ?start.elapsed(),
                "Persisted trie from memory database"
            );
        }
        metrics::record_trie_flush(nodes, start.elapsed());
        metrics::set_trie_dirty_size(dirties.size());
        Ok(())
    }

    fn commit_node(
        &self,
        dirties: &Dirties,
        hash: B256,
        batch: &mut crate::db::Batch,
        written: &mut Vec<B256>,
    ) -> DatabaseResult {
        if hash == B256::ZERO {
            return Ok(());
        }
        let Some(node) = dirties.nodes.get(&hash) else {
            return Ok(());
        };
        for child in node.children() {
            self.commit_node(dirties, child, batch, written)?;
        }
        self.db.write_trie_node(batch, hash, node.blob.to_vec());
        written.push(hash);
        self.db.write_batch_if_over_threshold(batch)?;
        Ok(())
    }

    /// `(dirty node bytes, preimage bytes)`.
    pub fn size(&self) -> (usize, usize) {
        let dirties = self.dirties.read();
        (dirties.size(), dirties.preimages_size)
    }

    /// `(nodes, bytes)` freed by dereferencing and flushed to disk so far.
    pub fn gc_and_flush_stats(&self) -> ((u64, usize), (u64, usize)) {
        let dirties = self.dirties.read();
        (
            (dirties.gc_nodes, dirties.gc_size),
            (dirties.flush_nodes, dirties.flush_size),
        )
    }

    /// Fill ratio of the hot cache in percent. Zero when it is disabled.
    pub fn clean_cache_usage_percent(&self) -> u64 {
        match &self.clean {
            Some(clean) if self.clean_limit > 0 => {
                clean.run_pending_tasks();
                clean.weighted_size() * 100 / self.clean_limit
            }
            _ => 0,
        }
    }

    pub fn has_clean_cache(&self) -> bool {
        self.clean.is_some()
    }
}

/// Source of encoded trie nodes and contract code.
pub trait NodeReader: Send + Sync {
    fn read_node(&self, hash: B256) -> DatabaseResult<Option<Arc<[u8]>>>;
    fn read_code(&self, code_hash: B256) -> DatabaseResult<Option<Vec<u8>>>;
}

impl NodeReader for NodeDatabase {
    fn read_node(&self, hash: B256) -> DatabaseResult<Option<Arc<[u8]>>> {
        self.node(hash)
    }

    fn read_code(&self, code_hash: B256) -> DatabaseResult<Option<Vec<u8>>> {
        self.db.read_code(code_hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Trie;
    use alloy_primitives::keccak256;

    fn filled_trie(seed: u32, count: u32) -> Trie {
        let mut trie = Trie::new_empty();
        for i in 0..count {
            let key = keccak256((seed * 10_000 + i).to_be_bytes());
            trie.update(key.as_slice(), &[seed as u8 + 1; 40]).unwrap();
        }
        trie
    }

    fn node_db() -> NodeDatabase {
        NodeDatabase::new(Arc::new(Database::new_in_memory()), 1)
    }

    #[test]
    fn reference_and_dereference_frees_unshared_nodes() {
        let db = node_db();
        let (root_a, set_a) = filled_trie(1, 50).commit();
        let (root_b, set_b) = filled_trie(2, 50).commit();
        db.insert_set(&set_a);
        db.insert_set(&set_b);
        db.reference(root_a, B256::ZERO);
        db.reference(root_b, B256::ZERO);
        assert_eq!(db.nodes().len(), set_a.len() + set_b.len());

        db.dereference(root_a);
        assert_eq!(db.nodes().len(), set_b.len(), "only root_b's nodes must stay");
        assert!(db.node(root_a).unwrap().is_none());
        assert!(db.node(root_b).unwrap().is_some());

        db.dereference(root_b);
        assert!(db.nodes().is_empty());
        assert_eq!(db.size().0, 0);
    }

    #[test]
    fn double_meta_reference_needs_double_dereference() {
        let db = node_db();
        let (root, set) = filled_trie(3, 20).commit();
        db.insert_set(&set);
        db.reference(root, B256::ZERO);
        db.reference(root, B256::ZERO);
        db.dereference(root);
        assert!(db.does_exist_cached_node(root));
        db.dereference(root);
        assert!(!db.does_exist_cached_node(root));
    }

    #[test]
    fn commit_persists_subtree_and_uncaches_it() {
        let db = node_db();
        let (root, set) = filled_trie(4, 30).commit();
        db.insert_set(&set);
        db.reference(root, B256::ZERO);
        db.commit(root, false, 1).unwrap();
        assert!(db.nodes().is_empty());
        assert!(db.does_exist_node_in_persistent(root).unwrap());
        for node in &set.nodes {
            assert!(db.does_exist_node_in_persistent(node.hash).unwrap());
        }
        let reopened = Trie::open(root, Arc::new(NodeDatabase::new(db.disk_db().clone(), 0))).unwrap();
        assert_eq!(reopened.entries().unwrap().len(), 30);
    }

    #[test]
    fn cap_flushes_oldest_first() {
        let db = node_db();
        let (root_a, set_a) = filled_trie(5, 40).commit();
        let (root_b, set_b) = filled_trie(6, 40).commit();
        db.insert_set(&set_a);
        db.insert_set(&set_b);
        db.reference(root_a, B256::ZERO);
        db.reference(root_b, B256::ZERO);

        let (size, _) = db.size();
        db.cap(size / 2).unwrap();
        let (after, _) = db.size();
        assert!(after <= size / 2, "cap must shrink below the limit: {after} > {}", size / 2);
        assert!(db.does_exist_node_in_persistent(set_a.nodes[0].hash).unwrap());
        assert!(!db.does_exist_node_in_persistent(root_b).unwrap());
        // Flushed nodes stay readable.
        assert!(db.node(set_a.nodes[0].hash).unwrap().is_some());

        db.cap(0).unwrap();
        assert!(db.nodes().is_empty());
        assert!(db.does_exist_node_in_persistent(root_b).unwrap());
    }

    #[test]
    fn preimages_are_written_on_commit() {
        let db = node_db();
        let hash = keccak256(b"key");
        db.insert_preimage(hash, b"key".to_vec());
        assert_eq!(db.preimage(hash).unwrap(), Some(b"key".to_vec()));
        let (root, set) = filled_trie(7, 3).commit();
        db.insert_set(&set);
        db.commit(root, false, 0).unwrap();
        assert_eq!(db.size().1, 0);
        assert_eq!(db.disk_db().read_preimage(hash).unwrap(), Some(b"key".to_vec()));
    }
}
