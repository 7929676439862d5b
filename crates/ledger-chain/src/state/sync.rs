//! Scheduler for copying a state trie node by node.
//!
//! A node is only handed to [`TrieSync::commit`] once all of its children
//! are committed, so an interrupted copy never leaves a node whose subtree
//! is incomplete.

use crate::{
    db::{
        Batch,
        Database,
    },
    state::{
        error::{
            TrieError,
            TrieResult,
        },
        iterator::NodeKind,
        node::node_children,
    },
    types::{
        Account,
        EMPTY_ROOT_HASH,
        KECCAK_EMPTY,
    },
};
use alloy_primitives::B256;
use alloy_rlp::Decodable;
use std::collections::{
    HashMap,
    HashSet,
    VecDeque,
};

/// Data retrieved for a scheduled hash.
#[derive(Debug, Clone)]
pub struct SyncResult {
    pub hash: B256,
    pub data: Vec<u8>,
}

#[derive(Debug)]
struct Request {
    kind: NodeKind,
    account_trie: bool,
    parents: Vec<B256>,
    /// Children not yet committed.
    deps: usize,
    data: Option<Vec<u8>>,
}

#[derive(Debug, Default)]
pub struct TrieSync {
    requests: HashMap<B256, Request>,
    queue: VecDeque<B256>,
    /// Completed entries waiting for [`TrieSync::commit`].
    membatch: Vec<(B256, NodeKind, Vec<u8>)>,
    membatch_set: HashSet<B256>,
    /// Entries this sync has already written.
    written: HashSet<B256>,
}

impl TrieSync {
    /// Schedules the state trie at `root`, including storage tries and code.
    pub fn new(root: B256) -> Self {
        let mut sync = Self::default();
        if root != EMPTY_ROOT_HASH && root != B256::ZERO {
            sync.schedule(root, NodeKind::Trie, true, None);
        }
        sync
    }

    fn schedule(&mut self, hash: B256, kind: NodeKind, account_trie: bool, parent: Option<B256>) {
        if let Some(existing) = self.requests.get_mut(&hash) {
            if let Some(parent) = parent {
                existing.parents.push(parent);
            }
            return;
        }
        self.requests.insert(
            hash,
            Request {
                kind,
                account_trie,
                parents: parent.into_iter().collect(),
                deps: 0,
                data: None,
            },
        );
        self.queue.push_back(hash);
    }

    /// Up to `max` scheduled hashes that still need to be fetched.
    pub fn missing(&mut self, max: usize) -> Vec<(B256, NodeKind)> {
        let count = self.queue.len().min(max);
        self.queue
            .drain(..count)
            .filter_map(|hash| self.requests.get(&hash).map(|request| (hash, request.kind)))
            .collect()
    }

    /// Feeds fetched data, scheduling the children it references.
    pub fn process(&mut self, results: Vec<SyncResult>) -> TrieResult {
        for result in results {
            let Some(request) = self.requests.get_mut(&result.hash) else {
                return Err(TrieError::UnrequestedSyncResult(result.hash));
            };
            if request.data.is_some() {
                continue;
            }
            let (kind, account_trie) = (request.kind, request.account_trie);
            request.data = Some(result.data.clone());
            if kind == NodeKind::Code {
                self.complete(result.hash);
                continue;
            }

            let (children, leaves) = node_children(&result.data)?;
            let mut scheduled = Vec::new();
            for child in children {
                scheduled.push((child, NodeKind::Trie, account_trie));
            }
            if account_trie {
                for leaf in leaves {
                    let account =
                        Account::decode(&mut leaf.as_slice()).map_err(TrieError::Decode)?;
                    if account.storage_root != EMPTY_ROOT_HASH {
                        scheduled.push((account.storage_root, NodeKind::Trie, false));
                    }
                    if account.code_hash != KECCAK_EMPTY {
                        scheduled.push((account.code_hash, NodeKind::Code, false));
                    }
                }
            }
            let mut unique = HashSet::new();
            scheduled.retain(|(hash, ..)| {
                unique.insert(*hash) && !self.written.contains(hash) && !self.membatch_set.contains(hash)
            });
            if let Some(request) = self.requests.get_mut(&result.hash) {
                request.deps = scheduled.len();
            }
            if scheduled.is_empty() {
                self.complete(result.hash);
                continue;
            }
            for (hash, kind, account_trie) in scheduled {
                self.schedule(hash, kind, account_trie, Some(result.hash));
            }
        }
        Ok(())
    }

    /// Moves a request whose subtree is complete into the write set and
    /// releases its parents.
    fn complete(&mut self, hash: B256) {
        let mut ready = vec![hash];
        while let Some(hash) = ready.pop() {
            let Some(request) = self.requests.remove(&hash) else {
                continue;
            };
            if let Some(data) = request.data {
                self.membatch.push((hash, request.kind, data));
                self.membatch_set.insert(hash);
            }
            for parent in request.parents {
                if let Some(parent_request) = self.requests.get_mut(&parent) {
                    parent_request.deps = parent_request.deps.saturating_sub(1);
                    if parent_request.deps == 0 && parent_request.data.is_some() {
                        ready.push(parent);
                    }
                }
            }
        }
    }

    /// Writes completed entries into `batch` and returns how many were written.
    pub fn commit(&mut self, db: &Database, batch: &mut Batch) -> usize {
        let count = self.membatch.len();
        for (hash, kind, data) in self.membatch.drain(..) {
            match kind {
                NodeKind::Trie => db.write_trie_node(batch, hash, data),
                NodeKind::Code => db.write_code(batch, hash, data),
            }
            self.membatch_set.remove(&hash);
            self.written.insert(hash);
        }
        count
    }

    /// Requests still outstanding, fetched or not.
    pub fn pending(&self) -> usize {
        self.requests.len()
    }

    /// Entries written through this sync.
    pub fn committed(&self) -> usize {
        self.written.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::BatchTarget,
        state::{
            StateDatabase,
            StateDb,
        },
    };
    use alloy_primitives::{
        Address,
        Bytes,
        U256,
    };
    use std::sync::Arc;

    fn source_state() -> (Arc<Database>, B256) {
        let disk = Arc::new(Database::new_in_memory());
        let db = Arc::new(StateDatabase::new(disk.clone(), 0));
        let mut state = StateDb::new(EMPTY_ROOT_HASH, db.clone()).unwrap();
        for n in 1..=40u8 {
            let address = Address::repeat_byte(n);
            state.add_balance(address, U256::from(n));
            if n % 5 == 0 {
                state.set_code(address, Bytes::from(vec![n; 3]));
                state.set_state(address, B256::with_last_byte(n), B256::with_last_byte(1));
            }
        }
        let root = state.commit(true).unwrap();
        db.node_db().commit(root, false, 0).unwrap();
        (disk, root)
    }

    #[test]
    fn copies_a_complete_state() {
        let (source, root) = source_state();
        let target = Database::new_in_memory();
        let mut sync = TrieSync::new(root);
        let mut batch = target.new_batch(BatchTarget::StateTrie);
        let mut rounds = 0;
        while sync.pending() > 0 {
            rounds += 1;
            let results = sync
                .missing(7)
                .into_iter()
                .map(|(hash, kind)| {
                    let data = match kind {
                        NodeKind::Trie => source.read_trie_node(hash),
                        NodeKind::Code => source.read_code(hash),
                    };
                    SyncResult {
                        hash,
                        data: data.unwrap().unwrap(),
                    }
                })
                .collect();
            sync.process(results).unwrap();
            sync.commit(&target, &mut batch);
            assert!(rounds < 10_000, "sync must terminate");
        }
        target.write(&batch).unwrap();

        assert!(target.has_trie_node(root).unwrap(), "root is written last");
        let target_state = StateDatabase::new(Arc::new(target), 0);
        let mut copied = StateDb::new(root, Arc::new(target_state)).unwrap();
        assert_eq!(copied.get_balance(Address::repeat_byte(17)), U256::from(17));
        assert_eq!(copied.get_code(Address::repeat_byte(10)), Bytes::from(vec![10; 3]));
        assert_eq!(
            copied.get_state(Address::repeat_byte(35), B256::with_last_byte(35)),
            B256::with_last_byte(1)
        );
    }

    #[test]
    fn unrequested_results_are_rejected() {
        let mut sync = TrieSync::new(B256::repeat_byte(1));
        let err = sync
            .process(vec![SyncResult {
                hash: B256::repeat_byte(2),
                data: vec![],
            }])
            .unwrap_err();
        assert!(matches!(err, TrieError::UnrequestedSyncResult(_)));
    }
}
