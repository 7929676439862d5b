//! Flat account/storage layers over the state trie.
//!
//! The disk layer lives under the `a`/`o` prefixes of the chain store and
//! matches a single state root. Every committed block stacks a diff layer
//! on top of its parent. [`SnapshotTree::cap`] flattens old layers into the
//! disk layer, and [`SnapshotTree::journal`] persists the rest on shutdown.

use crate::{
    db::{
        BatchTarget,
        Database,
    },
    state::{
        NodeDatabase,
        Trie,
        error::{
            StateError,
            StateResult,
            TrieError,
        },
    },
    types::{
        Account,
        EMPTY_ROOT_HASH,
    },
};
use alloy_primitives::B256;
use alloy_rlp::Decodable;
use parking_lot::RwLock;
use serde::{
    Deserialize,
    Serialize,
};
use std::{
    collections::{
        HashMap,
        HashSet,
    },
    sync::Arc,
};
use tracing::{
    debug,
    info,
    warn,
};

/// Account and storage changes of one block, keyed by hashed address and slot.
/// `None` marks a deletion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotDiff {
    pub destructs: HashSet<B256>,
    pub accounts: HashMap<B256, Option<Vec<u8>>>,
    pub storage: HashMap<B256, HashMap<B256, Option<Vec<u8>>>>,
}

impl SnapshotDiff {
    pub fn is_empty(&self) -> bool {
        self.destructs.is_empty() && self.accounts.is_empty() && self.storage.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DiffLayer {
    root: B256,
    parent: B256,
    diff: SnapshotDiff,
}

#[derive(Debug, Serialize, Deserialize)]
struct JournalData {
    disk_root: B256,
    /// Oldest layer first.
    layers: Vec<DiffLayer>,
}

#[derive(Debug)]
struct Layers {
    disk_root: B256,
    diffs: HashMap<B256, DiffLayer>,
}

impl Layers {
    /// Roots from `root` down to (excluding) the disk layer, newest first.
    fn chain(&self, root: B256) -> Option<Vec<B256>> {
        let mut chain = Vec::new();
        let mut cursor = root;
        while cursor != self.disk_root {
            let layer = self.diffs.get(&cursor)?;
            chain.push(cursor);
            cursor = layer.parent;
        }
        Some(chain)
    }
}

/// Tree of snapshot layers keyed by state root.
#[derive(Debug)]
pub struct SnapshotTree {
    db: Arc<Database>,
    layers: RwLock<Layers>,
}

/// Read handle of the state at a single root.
#[derive(Debug, Clone)]
pub struct Snapshot {
    tree: Arc<SnapshotTree>,
    root: B256,
}

impl Snapshot {
    pub fn root(&self) -> B256 {
        self.root
    }

    /// Account RLP of `account_hash`, `None` if the account does not exist.
    pub fn account(&self, account_hash: B256) -> StateResult<Option<Vec<u8>>> {
        self.tree.account(self.root, account_hash)
    }

    pub fn storage(&self, account_hash: B256, slot_hash: B256) -> StateResult<Option<Vec<u8>>> {
        self.tree.storage(self.root, account_hash, slot_hash)
    }
}

impl SnapshotTree {
    /// A tree whose disk layer is already consistent with `root`.
    pub fn new(db: Arc<Database>, root: B256) -> Self {
        Self {
            db,
            layers: RwLock::new(Layers {
                disk_root: root,
                diffs: HashMap::new(),
            }),
        }
    }

    /// Restores the tree from the persisted disk root and journal. Returns
    /// `None` when no disk layer exists.
    pub fn load(db: Arc<Database>) -> StateResult<Option<Self>> {
        let Some(disk_root) = db.read_snapshot_root()? else {
            return Ok(None);
        };
        let tree = Self::new(db.clone(), disk_root);
        let Some(raw) = db.read_snapshot_journal()? else {
            return Ok(Some(tree));
        };
        let journal: JournalData = match bincode::deserialize(&raw) {
            Ok(journal) => journal,
            Err(err) => {
                warn!(target: "ledger-chain::snapshot", %err, "Discarding unreadable snapshot journal");
                return Ok(Some(tree));
            }
        };
        if journal.disk_root != disk_root {
            warn!(
                target: "ledger-chain::snapshot",
                journaled = %journal.disk_root,
                disk = %disk_root,
                "Snapshot journal does not match the disk layer"
            );
            return Ok(Some(tree));
        }
        let count = journal.layers.len();
        {
            let mut layers = tree.layers.write();
            for layer in journal.layers {
                if layer.parent != layers.disk_root && !layers.diffs.contains_key(&layer.parent) {
                    break;
                }
                layers.diffs.insert(layer.root, layer);
            }
        }
        info!(target: "ledger-chain::snapshot", disk_root = %disk_root, layers = count, "Loaded snapshot journal");
        Ok(Some(tree))
    }

    pub fn disk_root(&self) -> B256 {
        self.layers.read().disk_root
    }

    /// Number of diff layers held in memory.
    pub fn diff_layers(&self) -> usize {
        self.layers.read().diffs.len()
    }

    /// Handle of the state at `root`, if a layer for it exists.
    pub fn snapshot(self: &Arc<Self>, root: B256) -> Option<Snapshot> {
        let layers = self.layers.read();
        (root == layers.disk_root || layers.diffs.contains_key(&root)).then(|| {
            Snapshot {
                tree: self.clone(),
                root,
            }
        })
    }

    /// Stacks the changes of the block producing `root` on top of `parent`.
    pub fn update(&self, root: B256, parent: B256, diff: SnapshotDiff) -> StateResult {
        if root == parent {
            return Ok(());
        }
        let mut layers = self.layers.write();
        if parent != layers.disk_root && !layers.diffs.contains_key(&parent) {
            return Err(StateError::SnapshotUnavailable(parent));
        }
        layers.diffs.insert(root, DiffLayer { root, parent, diff });
        Ok(())
    }

    fn account(&self, root: B256, account_hash: B256) -> StateResult<Option<Vec<u8>>> {
        let layers = self.layers.read();
        let mut cursor = root;
        while cursor != layers.disk_root {
            let layer = layers
                .diffs
                .get(&cursor)
                .ok_or(StateError::SnapshotUnavailable(root))?;
            if let Some(account) = layer.diff.accounts.get(&account_hash) {
                return Ok(account.clone());
            }
            if layer.diff.destructs.contains(&account_hash) {
                return Ok(None);
            }
            cursor = layer.parent;
        }
        Ok(self.db.read_snapshot_account(account_hash)?)
    }

    fn storage(
        &self,
        root: B256,
        account_hash: B256,
        slot_hash: B256,
    ) -> StateResult<Option<Vec<u8>>> {
        let layers = self.layers.read();
        let mut cursor = root;
        while cursor != layers.disk_root {
            let layer = layers
                .diffs
                .get(&cursor)
                .ok_or(StateError::SnapshotUnavailable(root))?;
            if let Some(value) = layer
                .diff
                .storage
                .get(&account_hash)
                .and_then(|slots| slots.get(&slot_hash))
            {
                return Ok(value.clone());
            }
            if layer.diff.destructs.contains(&account_hash) ||
                matches!(layer.diff.accounts.get(&account_hash), Some(None))
            {
                return Ok(None);
            }
            cursor = layer.parent;
        }
        Ok(self.db.read_snapshot_storage(account_hash, slot_hash)?)
    }

    /// Keeps at most `retain` diff layers below `root` and flattens the older
    /// ones into the disk layer. Layers not descending from the new disk root
    /// are dropped.
    pub fn cap(&self, root: B256, retain: usize) -> StateResult {
        let mut layers = self.layers.write();
        let mut chain = layers
            .chain(root)
            .ok_or(StateError::SnapshotUnavailable(root))?;
        if chain.len() <= retain {
            return Ok(());
        }
        let flattened = chain.split_off(retain);
        for layer_root in flattened.iter().rev() {
            let Some(layer) = layers.diffs.remove(layer_root) else {
                continue;
            };
            self.write_to_disk(&layer.diff)?;
        }
        let new_disk_root = flattened[0];
        let mut batch = self.db.new_batch(BatchTarget::Chain);
        self.db.write_snapshot_root(&mut batch, new_disk_root);
        self.db.write(&batch)?;
        layers.disk_root = new_disk_root;

        let reachable = layers
            .diffs
            .keys()
            .filter(|root| layers.chain(**root).is_some())
            .copied()
            .collect::<HashSet<_>>();
        let before = layers.diffs.len();
        layers.diffs.retain(|root, _| reachable.contains(root));
        debug!(
            target: "ledger-chain::snapshot",
            disk_root = %new_disk_root,
            flattened = flattened.len(),
            dropped = before - layers.diffs.len(),
            "Capped snapshot layers"
        );
        Ok(())
    }

    fn write_to_disk(&self, diff: &SnapshotDiff) -> StateResult {
        let mut batch = self.db.new_batch(BatchTarget::Chain);
        for account_hash in &diff.destructs {
            self.db.delete_snapshot_account(&mut batch, *account_hash);
            for slot in self.db.snapshot_storage_slots(*account_hash)? {
                self.db
                    .delete_snapshot_storage(&mut batch, *account_hash, slot);
            }
        }
        for (account_hash, account) in &diff.accounts {
            match account {
                Some(account) => {
                    self.db
                        .write_snapshot_account(&mut batch, *account_hash, account.clone())
                }
                None => self.db.delete_snapshot_account(&mut batch, *account_hash),
            }
        }
        for (account_hash, slots) in &diff.storage {
            for (slot, value) in slots {
                match value {
                    Some(value) => {
                        self.db.write_snapshot_storage(
                            &mut batch,
                            *account_hash,
                            *slot,
                            value.clone(),
                        )
                    }
                    None => {
                        self.db
                            .delete_snapshot_storage(&mut batch, *account_hash, *slot)
                    }
                }
            }
        }
        self.db.flush_batch(&mut batch)?;
        Ok(())
    }

    /// Persists the disk root and the diff layers below `root`.
    pub fn journal(&self, root: B256) -> StateResult<B256> {
        let layers = self.layers.read();
        let chain = layers
            .chain(root)
            .ok_or(StateError::SnapshotUnavailable(root))?;
        let journal = JournalData {
            disk_root: layers.disk_root,
            layers: chain
                .iter()
                .rev()
                .filter_map(|root| layers.diffs.get(root).cloned())
                .collect(),
        };
        let encoded = bincode::serialize(&journal).map_err(StateError::Journal)?;
        let mut batch = self.db.new_batch(BatchTarget::Chain);
        self.db.write_snapshot_root(&mut batch, layers.disk_root);
        self.db.write_snapshot_journal(&mut batch, encoded);
        self.db.write(&batch)?;
        info!(
            target: "ledger-chain::snapshot",
            root = %root,
            layers = journal.layers.len(),
            "Journaled snapshot layers"
        );
        Ok(layers.disk_root)
    }

    /// Regenerates the disk layer from the state trie at `root` and drops
    /// every diff layer.
    pub fn rebuild(&self, root: B256, node_db: &Arc<NodeDatabase>) -> StateResult {
        let mut layers = self.layers.write();
        let mut batch = self.db.new_batch(BatchTarget::Chain);
        for key in self.db.snapshot_keys()? {
            self.db.delete_raw(&mut batch, key);
            self.db.write_batch_if_over_threshold(&mut batch)?;
        }
        self.db.flush_batch(&mut batch)?;

        let trie = Trie::open(root, node_db.clone())?;
        let mut accounts = 0usize;
        for (key, value) in trie.entries()? {
            let account_hash = B256::from_slice(&key);
            let account = Account::decode(&mut value.as_slice()).map_err(TrieError::Decode)?;
            self.db
                .write_snapshot_account(&mut batch, account_hash, value);
            if account.storage_root != EMPTY_ROOT_HASH {
                let storage = Trie::open(account.storage_root, node_db.clone())?;
                for (slot, value) in storage.entries()? {
                    self.db.write_snapshot_storage(
                        &mut batch,
                        account_hash,
                        B256::from_slice(&slot),
                        value,
                    );
                }
            }
            self.db.write_batch_if_over_threshold(&mut batch)?;
            accounts += 1;
        }
        self.db.write_snapshot_root(&mut batch, root);
        self.db.flush_batch(&mut batch)?;

        layers.disk_root = root;
        layers.diffs.clear();
        info!(target: "ledger-chain::snapshot", root = %root, accounts, "Rebuilt snapshot disk layer");
        Ok(())
    }
}
