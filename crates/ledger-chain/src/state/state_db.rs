//! Journaled account state on top of the state trie.
//!
//! Accessors never fail: the first database error is memoized and reported
//! by [`StateDb::error`] and [`StateDb::commit`]. Reads consult the snapshot
//! layer of the opened root when one exists and fall back to the trie.

use crate::{
    constants::TRIES_IN_MEMORY,
    db::BatchTarget,
    state::{
        Snapshot,
        SnapshotDiff,
        StateDatabase,
        Trie,
        error::{
            StateError,
            StateResult,
            TrieError,
        },
        journal::{
            Journal,
            JournalEntry,
        },
        state_object::{
            StateObject,
            decode_storage_value,
            encode_storage_value,
        },
    },
    types::{
        Account,
        EMPTY_ROOT_HASH,
        KECCAK_EMPTY,
        Log,
    },
};
use alloy_primitives::{
    Address,
    B256,
    Bytes,
    U256,
    keccak256,
};
use alloy_rlp::Decodable;
use std::{
    collections::{
        BTreeMap,
        HashMap,
        HashSet,
    },
    mem,
    sync::Arc,
};
use tracing::{
    error,
    warn,
};

#[derive(Debug, Clone, Copy)]
struct Revision {
    id: usize,
    journal_index: usize,
}

/// One account of [`StateDb::dump`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpAccount {
    pub address: Option<Address>,
    pub balance: U256,
    pub nonce: u64,
    pub root: B256,
    pub code_hash: B256,
    pub code: Bytes,
    pub storage: BTreeMap<B256, B256>,
}

/// Mutable view of the state at a root.
#[derive(Debug)]
pub struct StateDb {
    db: Arc<StateDatabase>,
    trie: Trie,
    original_root: B256,

    snap: Option<Snapshot>,
    snap_diff: SnapshotDiff,

    objects: HashMap<Address, StateObject>,
    objects_pending: HashSet<Address>,
    objects_dirty: HashSet<Address>,

    db_err: Option<StateError>,
    refund: u64,

    tx_hash: B256,
    block_hash: B256,
    tx_index: u32,
    logs: HashMap<B256, Vec<Log>>,
    log_size: u32,

    preimages: HashMap<B256, Vec<u8>>,
    /// Preimages of hashed trie keys, handed to the node database on commit.
    key_preimages: HashMap<B256, Vec<u8>>,

    journal: Journal,
    valid_revisions: Vec<Revision>,
    next_revision_id: usize,
}

impl StateDb {
    pub fn new(root: B256, db: Arc<StateDatabase>) -> StateResult<Self> {
        let trie = db.open_trie(root)?;
        let snap = db.snapshots().and_then(|tree| tree.snapshot(root));
        Ok(Self {
            db,
            trie,
            original_root: root,
            snap,
            snap_diff: SnapshotDiff::default(),
            objects: HashMap::new(),
            objects_pending: HashSet::new(),
            objects_dirty: HashSet::new(),
            db_err: None,
            refund: 0,
            tx_hash: B256::ZERO,
            block_hash: B256::ZERO,
            tx_index: 0,
            logs: HashMap::new(),
            log_size: 0,
            preimages: HashMap::new(),
            key_preimages: HashMap::new(),
            journal: Journal::default(),
            valid_revisions: Vec::new(),
            next_revision_id: 0,
        })
    }

    pub fn database(&self) -> &Arc<StateDatabase> {
        &self.db
    }

    /// Root the state was opened at, or the root of the last commit.
    pub fn original_root(&self) -> B256 {
        self.original_root
    }

    /// First database error hit by an accessor.
    pub fn error(&self) -> Option<&StateError> {
        self.db_err.as_ref()
    }

    fn set_error(&mut self, err: impl Into<StateError>) {
        if self.db_err.is_none() {
            self.db_err = Some(err.into());
        }
    }

    /// Drops every cached object and reopens the trie at `root`.
    pub fn reset(&mut self, root: B256) -> StateResult {
        *self = Self::new(root, self.db.clone())?;
        Ok(())
    }

    /// Deep copy sharing only the underlying databases.
    pub fn copy(&self) -> Self {
        Self {
            db: self.db.clone(),
            trie: self.trie.clone(),
            original_root: self.original_root,
            snap: self.snap.clone(),
            snap_diff: self.snap_diff.clone(),
            objects: self.objects.clone(),
            objects_pending: self.objects_pending.clone(),
            objects_dirty: self.objects_dirty.clone(),
            db_err: None,
            refund: self.refund,
            tx_hash: self.tx_hash,
            block_hash: self.block_hash,
            tx_index: self.tx_index,
            logs: self.logs.clone(),
            log_size: self.log_size,
            preimages: self.preimages.clone(),
            key_preimages: self.key_preimages.clone(),
            journal: self.journal.clone(),
            valid_revisions: self.valid_revisions.clone(),
            next_revision_id: self.next_revision_id,
        }
    }

    /// Sets the transaction context used for logs.
    pub fn prepare(&mut self, tx_hash: B256, block_hash: B256, tx_index: u32) {
        self.tx_hash = tx_hash;
        self.block_hash = block_hash;
        self.tx_index = tx_index;
    }

    // Object access

    /// Cached or loaded object, including objects deleted in this block.
    fn load_object(&mut self, address: Address) -> Option<&mut StateObject> {
        if self.objects.contains_key(&address) {
            return self.objects.get_mut(&address);
        }
        let addr_hash = keccak256(address);
        let mut data = None;
        if let Some(snap) = &self.snap {
            if let Ok(account) = snap.account(addr_hash) {
                match account {
                    None => return None,
                    Some(raw) => data = Account::decode(&mut raw.as_slice()).ok(),
                }
            }
        }
        let data = match data {
            Some(data) => data,
            None => {
                match self.trie.get(addr_hash.as_slice()) {
                    Ok(Some(raw)) => {
                        match Account::decode(&mut raw.as_slice()) {
                            Ok(data) => data,
                            Err(source) => {
                                self.set_error(StateError::AccountDecode { address, source });
                                return None;
                            }
                        }
                    }
                    Ok(None) => return None,
                    Err(err) => {
                        self.set_error(err);
                        return None;
                    }
                }
            }
        };
        Some(
            self.objects
                .entry(address)
                .or_insert_with(|| StateObject::new(address, data)),
        )
    }

    fn object(&mut self, address: Address) -> Option<&mut StateObject> {
        match self.load_object(address) {
            Some(object) if !object.deleted => Some(object),
            _ => None,
        }
    }

    fn object_or_new(&mut self, address: Address) -> &mut StateObject {
        if self.object(address).is_none() {
            self.create_object(address);
        }
        self.objects
            .entry(address)
            .or_insert_with(|| StateObject::new(address, Account::default()))
    }

    /// Replaces whatever lives at `address` with a fresh object. Returns the
    /// previous live account.
    fn create_object(&mut self, address: Address) -> Option<Account> {
        let prev = self.load_object(address).cloned();
        match &prev {
            None => self.journal.append(JournalEntry::CreateObject { address }),
            Some(prev) => {
                let prev_destruct =
                    self.snap.is_some() && !self.snap_diff.destructs.insert(prev.addr_hash);
                self.journal.append(JournalEntry::ResetObject {
                    prev: Box::new(prev.clone()),
                    prev_destruct,
                });
            }
        }
        self.objects
            .insert(address, StateObject::new(address, Account::default()));
        prev.filter(|prev| !prev.deleted).map(|prev| prev.data)
    }

    /// Creates a fresh account at `address`, carrying over the balance of the
    /// account it replaces.
    pub fn create_account(&mut self, address: Address) {
        if let Some(prev) = self.create_object(address) {
            self.object_or_new(address).data.balance = prev.balance;
        }
    }

    pub fn exist(&mut self, address: Address) -> bool {
        self.object(address).is_some()
    }

    /// Non-existent or empty per EIP-161.
    pub fn empty(&mut self, address: Address) -> bool {
        self.object(address).is_none_or(|object| object.empty())
    }

    pub fn is_program_account(&mut self, address: Address) -> bool {
        self.object(address)
            .is_some_and(|object| object.has_code())
    }

    // Balance, nonce and code

    pub fn get_balance(&mut self, address: Address) -> U256 {
        self.object(address)
            .map_or(U256::ZERO, |object| object.balance())
    }

    pub fn get_nonce(&mut self, address: Address) -> u64 {
        self.object(address)
            .map_or(0, |object| object.data.nonce)
    }

    pub fn get_code_hash(&mut self, address: Address) -> B256 {
        self.object(address)
            .map_or(B256::ZERO, |object| object.code_hash())
    }

    pub fn get_code(&mut self, address: Address) -> Bytes {
        let (code_hash, cached) = match self.object(address) {
            Some(object) => (object.code_hash(), object.code.clone()),
            None => return Bytes::new(),
        };
        if let Some(code) = cached {
            return code;
        }
        if code_hash == KECCAK_EMPTY {
            return Bytes::new();
        }
        match self.db.contract_code(code_hash) {
            Ok(code) => {
                if let Some(object) = self.objects.get_mut(&address) {
                    object.code = Some(code.clone());
                }
                code
            }
            Err(err) => {
                self.set_error(err);
                Bytes::new()
            }
        }
    }

    pub fn get_code_size(&mut self, address: Address) -> usize {
        self.get_code(address).len()
    }

    pub fn add_balance(&mut self, address: Address, amount: U256) {
        let object = self.object_or_new(address);
        if amount.is_zero() {
            if object.empty() {
                self.journal.append(JournalEntry::Touch { address });
            }
            return;
        }
        let balance = object.balance().saturating_add(amount);
        self.set_balance(address, balance);
    }

    pub fn sub_balance(&mut self, address: Address, amount: U256) {
        if amount.is_zero() {
            return;
        }
        let balance = self
            .object_or_new(address)
            .balance()
            .saturating_sub(amount);
        self.set_balance(address, balance);
    }

    pub fn set_balance(&mut self, address: Address, amount: U256) {
        let object = self.object_or_new(address);
        let prev = mem::replace(&mut object.data.balance, amount);
        self.journal
            .append(JournalEntry::BalanceChange { address, prev });
    }

    pub fn set_nonce(&mut self, address: Address, nonce: u64) {
        let object = self.object_or_new(address);
        let prev = mem::replace(&mut object.data.nonce, nonce);
        self.journal
            .append(JournalEntry::NonceChange { address, prev });
    }

    pub fn increase_nonce(&mut self, address: Address) {
        let nonce = self.get_nonce(address);
        self.set_nonce(address, nonce + 1);
    }

    pub fn set_code(&mut self, address: Address, code: Bytes) {
        let prev_code = self.get_code(address);
        let object = self.object_or_new(address);
        let prev_hash = object.code_hash();
        object.set_code(keccak256(&code), code);
        self.journal.append(JournalEntry::CodeChange {
            address,
            prev_code: Some(prev_code),
            prev_hash,
        });
    }

    // Storage

    pub fn get_state(&mut self, address: Address, key: B256) -> B256 {
        let dirty = match self.object(address) {
            Some(object) => object.dirty_storage.get(&key).copied(),
            None => return B256::ZERO,
        };
        dirty.unwrap_or_else(|| self.get_committed_state(address, key))
    }

    /// Value of `key` before the current transaction.
    pub fn get_committed_state(&mut self, address: Address, key: B256) -> B256 {
        if self.object(address).is_none() {
            return B256::ZERO;
        }
        match self.load_committed_state(address, key) {
            Ok(value) => value,
            Err(err) => {
                self.set_error(err);
                B256::ZERO
            }
        }
    }

    fn load_committed_state(&mut self, address: Address, key: B256) -> StateResult<B256> {
        let Some(object) = self.objects.get_mut(&address) else {
            return Ok(B256::ZERO);
        };
        if let Some(value) = object.pending_storage.get(&key) {
            return Ok(*value);
        }
        if let Some(value) = object.origin_storage.get(&key) {
            return Ok(*value);
        }
        let slot_hash = keccak256(key);
        let mut raw = None;
        let mut from_snapshot = false;
        if let Some(snap) = &self.snap {
            if self.snap_diff.destructs.contains(&object.addr_hash) {
                return Ok(B256::ZERO);
            }
            if let Ok(value) = snap.storage(object.addr_hash, slot_hash) {
                raw = value;
                from_snapshot = true;
            }
        }
        if !from_snapshot {
            raw = storage_trie(&self.db, object)?.get(slot_hash.as_slice())?;
        }
        let value = match raw {
            Some(raw) => {
                decode_storage_value(&raw).map_err(|source| {
                    StateError::StorageDecode {
                        address,
                        slot: key,
                        source,
                    }
                })?
            }
            None => B256::ZERO,
        };
        object.origin_storage.insert(key, value);
        Ok(value)
    }

    pub fn set_state(&mut self, address: Address, key: B256, value: B256) {
        let prev = self.get_state(address, key);
        if prev == value {
            return;
        }
        self.journal
            .append(JournalEntry::StorageChange { address, key, prev });
        self.object_or_new(address)
            .dirty_storage
            .insert(key, value);
    }

    // Self-destruct

    /// Marks the account for deletion at the end of the transaction and
    /// clears its balance.
    pub fn suicide(&mut self, address: Address) -> bool {
        let Some(object) = self.object(address) else {
            return false;
        };
        let prev = object.suicided;
        let prev_balance = mem::take(&mut object.data.balance);
        object.suicided = true;
        self.journal.append(JournalEntry::Suicide {
            address,
            prev,
            prev_balance,
        });
        true
    }

    pub fn has_suicided(&mut self, address: Address) -> bool {
        self.object(address)
            .is_some_and(|object| object.suicided)
    }

    // Refund, logs and preimages

    pub fn add_refund(&mut self, gas: u64) {
        self.journal
            .append(JournalEntry::RefundChange { prev: self.refund });
        self.refund += gas;
    }

    pub fn sub_refund(&mut self, gas: u64) {
        self.journal
            .append(JournalEntry::RefundChange { prev: self.refund });
        if gas > self.refund {
            error!(target: "ledger-chain::state", gas, refund = self.refund, "Refund counter below zero");
        }
        self.refund = self.refund.saturating_sub(gas);
    }

    pub fn get_refund(&self) -> u64 {
        self.refund
    }

    /// Records a log of the prepared transaction.
    pub fn add_log(&mut self, mut log: Log) {
        self.journal.append(JournalEntry::AddLog {
            tx_hash: self.tx_hash,
        });
        log.tx_hash = self.tx_hash;
        log.block_hash = self.block_hash;
        log.tx_index = self.tx_index;
        log.index = self.log_size;
        self.logs.entry(self.tx_hash).or_default().push(log);
        self.log_size += 1;
    }

    pub fn get_logs(&self, tx_hash: B256) -> Vec<Log> {
        self.logs.get(&tx_hash).cloned().unwrap_or_default()
    }

    /// Every log recorded so far, ordered by log index.
    pub fn logs(&self) -> Vec<Log> {
        let mut logs = self.logs.values().flatten().cloned().collect::<Vec<_>>();
        logs.sort_by_key(|log| log.index);
        logs
    }

    pub fn add_preimage(&mut self, hash: B256, preimage: Vec<u8>) {
        if self.preimages.contains_key(&hash) {
            return;
        }
        self.journal.append(JournalEntry::AddPreimage { hash });
        self.preimages.insert(hash, preimage);
    }

    pub fn preimages(&self) -> &HashMap<B256, Vec<u8>> {
        &self.preimages
    }

    // Revisions

    pub fn snapshot(&mut self) -> usize {
        let id = self.next_revision_id;
        self.next_revision_id += 1;
        self.valid_revisions.push(Revision {
            id,
            journal_index: self.journal.len(),
        });
        id
    }

    /// Undoes every change made since `snapshot` returned `id`.
    pub fn revert_to_snapshot(&mut self, id: usize) {
        let position = self
            .valid_revisions
            .partition_point(|revision| revision.id < id);
        let Some(revision) = self
            .valid_revisions
            .get(position)
            .filter(|revision| revision.id == id)
            .copied()
        else {
            error!(target: "ledger-chain::state", id, "Revision id cannot be reverted");
            self.set_error(StateError::InvalidRevision(id));
            return;
        };
        for entry in self.journal.split_off_reversed(revision.journal_index) {
            self.undo(entry);
        }
        self.valid_revisions.truncate(position);
    }

    fn undo(&mut self, entry: JournalEntry) {
        match entry {
            JournalEntry::CreateObject { address } => {
                self.objects.remove(&address);
                self.objects_dirty.remove(&address);
            }
            JournalEntry::ResetObject {
                prev,
                prev_destruct,
            } => {
                if !prev_destruct {
                    self.snap_diff.destructs.remove(&prev.addr_hash);
                }
                self.objects.insert(prev.address, *prev);
            }
            JournalEntry::Suicide {
                address,
                prev,
                prev_balance,
            } => {
                if let Some(object) = self.objects.get_mut(&address) {
                    object.suicided = prev;
                    object.data.balance = prev_balance;
                }
            }
            JournalEntry::BalanceChange { address, prev } => {
                if let Some(object) = self.objects.get_mut(&address) {
                    object.data.balance = prev;
                }
            }
            JournalEntry::NonceChange { address, prev } => {
                if let Some(object) = self.objects.get_mut(&address) {
                    object.data.nonce = prev;
                }
            }
            JournalEntry::StorageChange { address, key, prev } => {
                if let Some(object) = self.objects.get_mut(&address) {
                    object.dirty_storage.insert(key, prev);
                }
            }
            JournalEntry::CodeChange {
                address,
                prev_code,
                prev_hash,
            } => {
                if let Some(object) = self.objects.get_mut(&address) {
                    object.data.code_hash = prev_hash;
                    object.code = prev_code;
                    object.dirty_code = true;
                }
            }
            JournalEntry::RefundChange { prev } => self.refund = prev,
            JournalEntry::AddLog { tx_hash } => {
                if let Some(logs) = self.logs.get_mut(&tx_hash) {
                    logs.pop();
                    if logs.is_empty() {
                        self.logs.remove(&tx_hash);
                    }
                }
                self.log_size -= 1;
            }
            JournalEntry::AddPreimage { hash } => {
                self.preimages.remove(&hash);
            }
            JournalEntry::Touch { .. } => {}
        }
    }

    // Finalisation and commit

    /// Closes the current transaction: deletes self-destructed (and, when
    /// `delete_empty`, empty) touched accounts and clears the journal.
    pub fn finalise(&mut self, delete_empty: bool) {
        let dirty = self.journal.dirty_addresses().collect::<Vec<_>>();
        for address in dirty {
            let Some(object) = self.objects.get_mut(&address) else {
                continue;
            };
            if object.suicided || (delete_empty && object.empty()) {
                object.deleted = true;
                if self.snap.is_some() {
                    self.snap_diff.destructs.insert(object.addr_hash);
                    self.snap_diff.accounts.remove(&object.addr_hash);
                    self.snap_diff.storage.remove(&object.addr_hash);
                }
            } else {
                object.finalise();
            }
            self.objects_pending.insert(address);
            self.objects_dirty.insert(address);
        }
        self.journal.clear();
        self.valid_revisions.clear();
        self.refund = 0;
    }

    /// Current state root. Finalises first.
    pub fn intermediate_root(&mut self, delete_empty: bool) -> B256 {
        self.finalise(delete_empty);
        let pending = self.objects_pending.drain().collect::<Vec<_>>();
        for address in pending {
            if let Err(err) = self.update_object(address) {
                self.set_error(err);
            }
        }
        self.trie.hash()
    }

    fn update_object(&mut self, address: Address) -> StateResult {
        let Some(object) = self.objects.get_mut(&address) else {
            return Ok(());
        };
        let addr_hash = object.addr_hash;
        if object.deleted {
            self.trie.delete(addr_hash.as_slice())?;
            return Ok(());
        }
        if !object.pending_storage.is_empty() {
            let pending = mem::take(&mut object.pending_storage);
            storage_trie(&self.db, object)?;
            let StateObject {
                trie: Some(trie),
                origin_storage,
                data,
                ..
            } = &mut *object
            else {
                return Ok(());
            };
            let mut snap_slots = HashMap::new();
            for (key, value) in pending {
                if origin_storage.get(&key).copied().unwrap_or_default() == value {
                    continue;
                }
                origin_storage.insert(key, value);
                let slot_hash = keccak256(key);
                self.key_preimages.insert(slot_hash, key.to_vec());
                if value.is_zero() {
                    trie.delete(slot_hash.as_slice())?;
                    snap_slots.insert(slot_hash, None);
                } else {
                    let encoded = encode_storage_value(value);
                    trie.update(slot_hash.as_slice(), &encoded)?;
                    snap_slots.insert(slot_hash, Some(encoded));
                }
            }
            data.storage_root = trie.hash();
            if self.snap.is_some() && !snap_slots.is_empty() {
                self.snap_diff
                    .storage
                    .entry(addr_hash)
                    .or_default()
                    .extend(snap_slots);
            }
        }
        let encoded = alloy_rlp::encode(object.data);
        self.trie.update(addr_hash.as_slice(), &encoded)?;
        self.key_preimages.insert(addr_hash, address.to_vec());
        if self.snap.is_some() {
            self.snap_diff.accounts.insert(addr_hash, Some(encoded));
        }
        Ok(())
    }

    /// Writes code, hands every modified trie node to the node database and
    /// returns the new state root. Storage roots are referenced from the
    /// account trie nodes holding them.
    pub fn commit(&mut self, delete_empty: bool) -> StateResult<B256> {
        if let Some(err) = self.db_err.take() {
            return Err(err);
        }
        self.intermediate_root(delete_empty);
        if let Some(err) = self.db_err.take() {
            return Err(err);
        }

        let node_db = self.db.node_db().clone();
        let disk_db = node_db.disk_db().clone();
        let mut code_batch = disk_db.new_batch(BatchTarget::StateTrie);
        for address in self.objects_dirty.drain() {
            let Some(object) = self.objects.get_mut(&address) else {
                continue;
            };
            if object.deleted {
                continue;
            }
            if object.dirty_code {
                if let Some(code) = &object.code {
                    disk_db.write_code(&mut code_batch, object.code_hash(), code.to_vec());
                    self.db.cache_code(object.code_hash(), code.clone());
                }
                object.dirty_code = false;
            }
            if let Some(trie) = object.trie.as_mut() {
                let (root, set) = trie.commit();
                node_db.insert_set(&set);
                object.data.storage_root = root;
            }
            disk_db.write_batch_if_over_threshold(&mut code_batch)?;
        }
        disk_db.flush_batch(&mut code_batch)?;

        let (root, set) = self.trie.commit();
        node_db.insert_set(&set);
        for (leaf, parent) in &set.leaves {
            let account = Account::decode(&mut leaf.as_slice()).map_err(TrieError::Decode)?;
            if account.storage_root != EMPTY_ROOT_HASH {
                node_db.reference(account.storage_root, *parent);
            }
        }
        for (hash, preimage) in self.key_preimages.drain() {
            node_db.insert_preimage(hash, preimage);
        }

        if let Some(snap) = self.snap.take() {
            let diff = mem::take(&mut self.snap_diff);
            if let Some(tree) = self.db.snapshots() {
                let parent = snap.root();
                if parent != root {
                    if let Err(err) = tree.update(root, parent, diff) {
                        warn!(target: "ledger-chain::snapshot", from = %parent, to = %root, %err, "Failed to update snapshot tree");
                    }
                    if let Err(err) = tree.cap(root, TRIES_IN_MEMORY as usize) {
                        warn!(target: "ledger-chain::snapshot", root = %root, %err, "Failed to cap snapshot tree");
                    }
                }
                self.snap = tree.snapshot(root);
            }
        }
        self.original_root = root;
        Ok(root)
    }

    /// Every account of the committed trie, keyed by hashed address.
    pub fn dump(&self) -> StateResult<BTreeMap<B256, DumpAccount>> {
        let node_db = self.db.node_db();
        let mut out = BTreeMap::new();
        for (key, value) in self.trie.entries()? {
            let addr_hash = B256::from_slice(&key);
            let account = Account::decode(&mut value.as_slice()).map_err(TrieError::Decode)?;
            let address = match self.key_preimages.get(&addr_hash) {
                Some(preimage) => Some(preimage.clone()),
                None => node_db.preimage(addr_hash)?,
            }
            .filter(|preimage| preimage.len() == 20)
            .map(|preimage| Address::from_slice(&preimage));

            let mut storage = BTreeMap::new();
            for (slot_hash, raw) in self.db.open_storage_trie(account.storage_root)?.entries()? {
                let slot_hash = B256::from_slice(&slot_hash);
                let slot = node_db
                    .preimage(slot_hash)?
                    .filter(|preimage| preimage.len() == 32)
                    .map_or(slot_hash, |preimage| B256::from_slice(&preimage));
                let value = decode_storage_value(&raw).map_err(TrieError::Decode)?;
                storage.insert(slot, value);
            }
            out.insert(
                addr_hash,
                DumpAccount {
                    address,
                    balance: account.balance,
                    nonce: account.nonce,
                    root: account.storage_root,
                    code_hash: account.code_hash,
                    code: self.db.contract_code(account.code_hash)?,
                    storage,
                },
            );
        }
        Ok(out)
    }
}

/// Storage trie of `object`, opened on first use.
fn storage_trie<'a>(db: &StateDatabase, object: &'a mut StateObject) -> StateResult<&'a mut Trie> {
    if object.trie.is_none() {
        object.trie = Some(db.open_storage_trie(object.data.storage_root)?);
    }
    Ok(object.trie.get_or_insert_with(Trie::new_empty))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::Database,
        state::SnapshotTree,
    };

    fn state_db() -> (Arc<StateDatabase>, StateDb) {
        let db = Arc::new(StateDatabase::new(Arc::new(Database::new_in_memory()), 0));
        let state = StateDb::new(EMPTY_ROOT_HASH, db.clone()).unwrap();
        (db, state)
    }

    fn addr(n: u8) -> Address {
        Address::repeat_byte(n)
    }

    #[test]
    fn revert_restores_every_kind_of_change() {
        let (_, mut state) = state_db();
        state.add_balance(addr(1), U256::from(100));
        state.set_state(addr(1), B256::with_last_byte(1), B256::with_last_byte(9));
        let id = state.snapshot();

        state.sub_balance(addr(1), U256::from(40));
        state.set_nonce(addr(1), 5);
        state.set_state(addr(1), B256::with_last_byte(1), B256::with_last_byte(10));
        state.set_code(addr(1), Bytes::from_static(&[0x60, 0x00]));
        state.add_refund(7);
        state.create_account(addr(2));
        state.add_log(Log::new(addr(1), vec![], Bytes::new()));
        assert!(state.suicide(addr(1)));

        state.revert_to_snapshot(id);
        assert_eq!(state.get_balance(addr(1)), U256::from(100));
        assert_eq!(state.get_nonce(addr(1)), 0);
        assert_eq!(state.get_state(addr(1), B256::with_last_byte(1)), B256::with_last_byte(9));
        assert_eq!(state.get_code_hash(addr(1)), KECCAK_EMPTY);
        assert_eq!(state.get_refund(), 0);
        assert!(!state.exist(addr(2)));
        assert!(!state.has_suicided(addr(1)));
        assert!(state.logs().is_empty());
        assert!(state.error().is_none());
    }

    #[test]
    fn unknown_revision_is_recorded() {
        let (_, mut state) = state_db();
        state.revert_to_snapshot(3);
        assert!(matches!(state.error(), Some(StateError::InvalidRevision(3))));
    }

    #[test]
    fn commit_round_trips_through_the_node_database() {
        let (db, mut state) = state_db();
        state.add_balance(addr(1), U256::from(1_000));
        state.set_nonce(addr(1), 3);
        state.set_code(addr(2), Bytes::from_static(b"code"));
        state.set_state(addr(2), B256::with_last_byte(1), B256::with_last_byte(0x42));
        let intermediate = state.intermediate_root(true);
        let root = state.commit(true).unwrap();
        assert_eq!(intermediate, root);

        let mut reopened = StateDb::new(root, db.clone()).unwrap();
        assert_eq!(reopened.get_balance(addr(1)), U256::from(1_000));
        assert_eq!(reopened.get_nonce(addr(1)), 3);
        assert_eq!(reopened.get_code(addr(2)), Bytes::from_static(b"code"));
        assert_eq!(
            reopened.get_state(addr(2), B256::with_last_byte(1)),
            B256::with_last_byte(0x42)
        );

        let dump = reopened.dump().unwrap();
        let contract = dump
            .values()
            .find(|account| account.address == Some(addr(2)))
            .unwrap();
        assert_eq!(contract.storage.get(&B256::with_last_byte(1)), Some(&B256::with_last_byte(0x42)));

        let storage_root = contract.root;
        assert!(
            db.node_db().parents(storage_root).unwrap_or_default() >= 1,
            "storage root must be referenced by its account node"
        );
    }

    #[test]
    fn empty_touched_accounts_are_deleted() {
        let (_, mut state) = state_db();
        state.add_balance(addr(3), U256::ZERO);
        let root = state.intermediate_root(true);
        assert_eq!(root, EMPTY_ROOT_HASH);
        assert!(!state.exist(addr(3)));

        let (_, mut kept) = state_db();
        kept.add_balance(addr(3), U256::ZERO);
        assert_ne!(kept.intermediate_root(false), EMPTY_ROOT_HASH);
    }

    #[test]
    fn zeroed_slot_is_removed_from_storage() {
        let (db, mut state) = state_db();
        let slot = B256::with_last_byte(2);
        state.set_nonce(addr(4), 1);
        let bare = state.commit(true).unwrap();

        let mut state = StateDb::new(bare, db.clone()).unwrap();
        state.set_state(addr(4), slot, B256::with_last_byte(1));
        let with_slot = state.commit(true).unwrap();
        assert_ne!(bare, with_slot);

        let mut state = StateDb::new(with_slot, db).unwrap();
        state.set_state(addr(4), slot, B256::ZERO);
        assert_eq!(state.commit(true).unwrap(), bare);
    }

    #[test]
    fn copies_are_independent() {
        let (_, mut state) = state_db();
        state.add_balance(addr(5), U256::from(10));
        let mut copy = state.copy();
        copy.add_balance(addr(5), U256::from(5));
        assert_eq!(state.get_balance(addr(5)), U256::from(10));
        assert_eq!(copy.get_balance(addr(5)), U256::from(15));
        assert_ne!(state.intermediate_root(true), copy.intermediate_root(true));

        copy.reset(EMPTY_ROOT_HASH).unwrap();
        assert!(!copy.exist(addr(5)));
    }

    #[test]
    fn logs_carry_the_prepared_context() {
        let (_, mut state) = state_db();
        let (tx_a, tx_b, block) = (B256::with_last_byte(1), B256::with_last_byte(2), B256::with_last_byte(3));
        state.prepare(tx_a, block, 0);
        state.add_log(Log::new(addr(1), vec![], Bytes::new()));
        state.prepare(tx_b, block, 1);
        state.add_log(Log::new(addr(1), vec![], Bytes::new()));
        state.add_log(Log::new(addr(1), vec![], Bytes::new()));

        assert_eq!(state.get_logs(tx_b).len(), 2);
        let logs = state.logs();
        assert_eq!(logs.iter().map(|log| log.index).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(logs[2].tx_index, 1);
        assert_eq!(logs[0].block_hash, block);
    }

    #[test]
    fn snapshot_reads_follow_commits() {
        let db = Arc::new(StateDatabase::new(Arc::new(Database::new_in_memory()), 0));
        let tree = Arc::new(SnapshotTree::new(db.disk_db().clone(), EMPTY_ROOT_HASH));
        db.set_snapshots(Some(tree.clone()));

        let mut state = StateDb::new(EMPTY_ROOT_HASH, db.clone()).unwrap();
        state.add_balance(addr(6), U256::from(77));
        state.set_state(addr(6), B256::with_last_byte(1), B256::with_last_byte(1));
        let root = state.commit(true).unwrap();
        assert_eq!(tree.diff_layers(), 1);

        let snap = tree.snapshot(root).unwrap();
        let raw = snap.account(keccak256(addr(6))).unwrap().unwrap();
        assert_eq!(Account::decode(&mut raw.as_slice()).unwrap().balance, U256::from(77));

        let mut reopened = StateDb::new(root, db).unwrap();
        assert_eq!(reopened.get_balance(addr(6)), U256::from(77));
        assert_eq!(
            reopened.get_state(addr(6), B256::with_last_byte(1)),
            B256::with_last_byte(1)
        );
    }
}
