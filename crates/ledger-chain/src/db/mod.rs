//! Typed access to the chain store.
//!
//! The [`Database`] owns two kinds of stores:
//! - a chain store for headers, bodies, receipts, lookups and metadata;
//! - a state store for trie nodes and contract code.
//!
//! While a state migration runs, a second state store exists. Trie writes go
//! to both stores and reads fall through from the current store to the new
//! one. `finish_state_migration(true)` makes the new store current.

pub mod error;
pub mod kv;
pub mod schema;

pub use error::{
    DatabaseError,
    DatabaseResult,
};
pub use kv::{
    Batch,
    BatchTarget,
    KeyValueStore,
};

use crate::{
    params::ChainConfig,
    types::{
        Block,
        Body,
        Header,
        Receipt,
        Transaction,
        decode_receipts_from_storage,
        encode_receipts_for_storage,
    },
};
use alloy_primitives::{
    B256,
    U256,
};
use alloy_rlp::{
    Decodable,
    RlpDecodable,
    RlpEncodable,
};
use error::decode_err;
use moka::sync::Cache;
use parking_lot::RwLock;
use std::{
    collections::HashMap,
    path::PathBuf,
};
use tracing::{
    debug,
    info,
    warn,
};

const HEADER_CACHE_LIMIT: u64 = 512;
const TD_CACHE_LIMIT: u64 = 1024;
const BODY_CACHE_LIMIT: u64 = 256;
const RECEIPTS_CACHE_LIMIT: u64 = 32;

const DEFAULT_STATE_STORE: &str = "statetrie";

/// Location of a transaction in the canonical chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct TxLookupEntry {
    pub block_hash: B256,
    pub block_number: u64,
    pub index: u64,
}

struct MigrationTarget {
    store: KeyValueStore,
    name: String,
    block_number: u64,
}

struct StateStores {
    current: KeyValueStore,
    current_name: String,
    migration: Option<MigrationTarget>,
}

/// Typed facade over the chain and state stores.
pub struct Database {
    chain: KeyValueStore,
    state: RwLock<StateStores>,
    /// `None` for in-memory databases.
    root: Option<PathBuf>,
    header_cache: Cache<B256, Header>,
    td_cache: Cache<B256, U256>,
    body_cache: Cache<B256, Body>,
    receipts_cache: Cache<B256, Vec<Receipt>>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("root", &self.root)
            .field("in_migration", &self.in_migration())
            .finish_non_exhaustive()
    }
}

impl Database {
    fn with_stores(chain: KeyValueStore, state: StateStores, root: Option<PathBuf>) -> Self {
        Self {
            chain,
            state: RwLock::new(state),
            root,
            header_cache: Cache::new(HEADER_CACHE_LIMIT),
            td_cache: Cache::new(TD_CACHE_LIMIT),
            body_cache: Cache::new(BODY_CACHE_LIMIT),
            receipts_cache: Cache::new(RECEIPTS_CACHE_LIMIT),
        }
    }

    pub fn new_in_memory() -> Self {
        Self::with_stores(
            KeyValueStore::new_in_memory(),
            StateStores {
                current: KeyValueStore::new_in_memory(),
                current_name: DEFAULT_STATE_STORE.to_string(),
                migration: None,
            },
            None,
        )
    }

    /// Opens (or creates) a sled-backed database under `root`.
    ///
    /// An interrupted migration target is reopened so the migration can resume.
    pub fn open(root: impl Into<PathBuf>) -> DatabaseResult<Self> {
        let root = root.into();
        let chain = KeyValueStore::open_sled(root.join("chaindata"))?;
        let current_name = match chain.get(schema::STATE_STORE_NAME_KEY)? {
            Some(name) => String::from_utf8_lossy(&name).into_owned(),
            None => DEFAULT_STATE_STORE.to_string(),
        };
        let current = KeyValueStore::open_sled(root.join(&current_name))?;

        let migration = match chain.get(schema::STATE_MIGRATION_KEY)? {
            Some(raw) => {
                let block_number = u64::decode(&mut raw.as_slice())
                    .map_err(decode_err("migration block number"))?;
                let name = migration_store_name(block_number);
                info!(
                    target: "ledger-chain::db",
                    block_number,
                    store = %name,
                    "Reopening state migration target"
                );
                Some(MigrationTarget {
                    store: KeyValueStore::open_sled(root.join(&name))?,
                    name,
                    block_number,
                })
            }
            None => None,
        };

        Ok(Self::with_stores(
            chain,
            StateStores {
                current,
                current_name,
                migration,
            },
            Some(root),
        ))
    }

    pub fn new_batch(&self, target: BatchTarget) -> Batch {
        Batch::new(target)
    }

    /// Commits a batch to the store selected by its target.
    pub fn write(&self, batch: &Batch) -> DatabaseResult {
        if batch.is_empty() {
            return Ok(());
        }
        match batch.target() {
            BatchTarget::Chain => self.chain.write(batch),
            BatchTarget::StateTrie => {
                let stores = self.state.read();
                stores.current.write(batch)?;
                if let Some(migration) = &stores.migration {
                    migration.store.write(batch)?;
                }
                Ok(())
            }
        }
    }

    /// Commits and resets `batch` once it has grown past the ideal batch size.
    ///
    /// Returns whether a write happened.
    pub fn write_batch_if_over_threshold(&self, batch: &mut Batch) -> DatabaseResult<bool> {
        if !batch.over_threshold() {
            return Ok(false);
        }
        self.write(batch)?;
        batch.reset();
        Ok(true)
    }

    /// Commits the remainder of a batch unconditionally.
    pub fn flush_batch(&self, batch: &mut Batch) -> DatabaseResult {
        self.write(batch)?;
        batch.reset();
        Ok(())
    }

    pub fn flush(&self) -> DatabaseResult {
        self.chain.flush()?;
        let stores = self.state.read();
        stores.current.flush()?;
        if let Some(migration) = &stores.migration {
            migration.store.flush()?;
        }
        Ok(())
    }

    fn get_rlp<T: Decodable>(&self, key: &[u8], what: &'static str) -> DatabaseResult<Option<T>> {
        match self.chain.get(key)? {
            Some(raw) => Ok(Some(T::decode(&mut raw.as_slice()).map_err(decode_err(what))?)),
            None => Ok(None),
        }
    }

    // Canonical index

    pub fn read_canonical_hash(&self, number: u64) -> DatabaseResult<Option<B256>> {
        Ok(self
            .chain
            .get(&schema::header_hash_key(number))?
            .filter(|raw| raw.len() == 32)
            .map(|raw| B256::from_slice(&raw)))
    }

    pub fn write_canonical_hash(&self, batch: &mut Batch, hash: B256, number: u64) {
        batch.put(schema::header_hash_key(number), hash.to_vec());
    }

    pub fn delete_canonical_hash(&self, batch: &mut Batch, number: u64) {
        batch.delete(schema::header_hash_key(number));
    }

    // Head pointers

    fn read_hash(&self, key: &[u8]) -> DatabaseResult<Option<B256>> {
        Ok(self
            .chain
            .get(key)?
            .filter(|raw| raw.len() == 32)
            .map(|raw| B256::from_slice(&raw)))
    }

    pub fn read_head_header_hash(&self) -> DatabaseResult<Option<B256>> {
        self.read_hash(schema::HEAD_HEADER_KEY)
    }

    pub fn write_head_header_hash(&self, batch: &mut Batch, hash: B256) {
        batch.put(schema::HEAD_HEADER_KEY.to_vec(), hash.to_vec());
    }

    pub fn read_head_block_hash(&self) -> DatabaseResult<Option<B256>> {
        self.read_hash(schema::HEAD_BLOCK_KEY)
    }

    pub fn write_head_block_hash(&self, batch: &mut Batch, hash: B256) {
        batch.put(schema::HEAD_BLOCK_KEY.to_vec(), hash.to_vec());
    }

    pub fn read_head_fast_block_hash(&self) -> DatabaseResult<Option<B256>> {
        self.read_hash(schema::HEAD_FAST_BLOCK_KEY)
    }

    pub fn write_head_fast_block_hash(&self, batch: &mut Batch, hash: B256) {
        batch.put(schema::HEAD_FAST_BLOCK_KEY.to_vec(), hash.to_vec());
    }

    // Headers

    pub fn read_header_number(&self, hash: B256) -> DatabaseResult<Option<u64>> {
        Ok(self
            .chain
            .get(&schema::header_number_key(hash))?
            .and_then(|raw| <[u8; 8]>::try_from(raw.as_slice()).ok())
            .map(u64::from_be_bytes))
    }

    pub fn read_header(&self, hash: B256, number: u64) -> DatabaseResult<Option<Header>> {
        if let Some(header) = self.header_cache.get(&hash) {
            return Ok(Some(header));
        }
        let header: Option<Header> = self.get_rlp(&schema::header_key(number, hash), "header")?;
        if let Some(header) = &header {
            self.header_cache.insert(hash, header.clone());
        }
        Ok(header)
    }

    pub fn has_header(&self, hash: B256, number: u64) -> DatabaseResult<bool> {
        if self.header_cache.contains_key(&hash) {
            return Ok(true);
        }
        self.chain.has(&schema::header_key(number, hash))
    }

    /// Stores the header and its hash→number mapping.
    pub fn write_header(&self, batch: &mut Batch, header: &Header) {
        let hash = header.hash();
        batch.put(
            schema::header_number_key(hash),
            header.number.to_be_bytes().to_vec(),
        );
        batch.put(
            schema::header_key(header.number, hash),
            alloy_rlp::encode(header),
        );
    }

    pub fn delete_header(&self, batch: &mut Batch, hash: B256, number: u64) {
        self.header_cache.invalidate(&hash);
        batch.delete(schema::header_key(number, hash));
        batch.delete(schema::header_number_key(hash));
    }

    // Total blockscore

    pub fn read_td(&self, hash: B256, number: u64) -> DatabaseResult<Option<U256>> {
        if let Some(td) = self.td_cache.get(&hash) {
            return Ok(Some(td));
        }
        let td: Option<U256> = self.get_rlp(&schema::header_td_key(number, hash), "total blockscore")?;
        if let Some(td) = td {
            self.td_cache.insert(hash, td);
        }
        Ok(td)
    }

    pub fn write_td(&self, batch: &mut Batch, hash: B256, number: u64, td: U256) {
        batch.put(schema::header_td_key(number, hash), alloy_rlp::encode(td));
    }

    pub fn delete_td(&self, batch: &mut Batch, hash: B256, number: u64) {
        self.td_cache.invalidate(&hash);
        batch.delete(schema::header_td_key(number, hash));
    }

    // Bodies

    pub fn read_body(&self, hash: B256, number: u64) -> DatabaseResult<Option<Body>> {
        if let Some(body) = self.body_cache.get(&hash) {
            return Ok(Some(body));
        }
        let body: Option<Body> = self.get_rlp(&schema::body_key(number, hash), "body")?;
        if let Some(body) = &body {
            self.body_cache.insert(hash, body.clone());
        }
        Ok(body)
    }

    pub fn has_body(&self, hash: B256, number: u64) -> DatabaseResult<bool> {
        if self.body_cache.contains_key(&hash) {
            return Ok(true);
        }
        self.chain.has(&schema::body_key(number, hash))
    }

    pub fn write_body(&self, batch: &mut Batch, hash: B256, number: u64, body: &Body) {
        batch.put(schema::body_key(number, hash), alloy_rlp::encode(body));
    }

    pub fn delete_body(&self, batch: &mut Batch, hash: B256, number: u64) {
        self.body_cache.invalidate(&hash);
        batch.delete(schema::body_key(number, hash));
    }

    // Blocks

    pub fn read_block(&self, hash: B256, number: u64) -> DatabaseResult<Option<Block>> {
        let Some(header) = self.read_header(hash, number)? else {
            return Ok(None);
        };
        let Some(body) = self.read_body(hash, number)? else {
            return Ok(None);
        };
        Ok(Some(Block::from_parts(header, body)))
    }

    pub fn has_block(&self, hash: B256, number: u64) -> DatabaseResult<bool> {
        self.has_body(hash, number)
    }

    pub fn write_block(&self, batch: &mut Batch, block: &Block) {
        self.write_body(batch, block.hash(), block.number(), block.body());
        self.write_header(batch, block.header());
    }

    /// Removes every piece of data associated with a block.
    pub fn delete_block(&self, batch: &mut Batch, hash: B256, number: u64) {
        self.delete_receipts(batch, hash, number);
        self.delete_header(batch, hash, number);
        self.delete_body(batch, hash, number);
        self.delete_td(batch, hash, number);
    }

    // Receipts

    pub fn read_receipts(&self, hash: B256, number: u64) -> DatabaseResult<Option<Vec<Receipt>>> {
        if let Some(receipts) = self.receipts_cache.get(&hash) {
            return Ok(Some(receipts));
        }
        let Some(raw) = self.chain.get(&schema::receipts_key(number, hash))? else {
            return Ok(None);
        };
        let receipts = decode_receipts_from_storage(&raw).map_err(decode_err("receipts"))?;
        self.receipts_cache.insert(hash, receipts.clone());
        Ok(Some(receipts))
    }

    pub fn write_receipts(&self, batch: &mut Batch, hash: B256, number: u64, receipts: &[Receipt]) {
        batch.put(
            schema::receipts_key(number, hash),
            encode_receipts_for_storage(receipts),
        );
    }

    pub fn delete_receipts(&self, batch: &mut Batch, hash: B256, number: u64) {
        self.receipts_cache.invalidate(&hash);
        batch.delete(schema::receipts_key(number, hash));
    }

    // Tx lookups

    pub fn read_tx_lookup_entry(&self, tx_hash: B256) -> DatabaseResult<Option<TxLookupEntry>> {
        self.get_rlp(&schema::tx_lookup_key(tx_hash), "tx lookup entry")
    }

    pub fn write_tx_lookup_entries(&self, batch: &mut Batch, block: &Block) {
        for (index, tx) in block.transactions().iter().enumerate() {
            let entry = TxLookupEntry {
                block_hash: block.hash(),
                block_number: block.number(),
                index: index as u64,
            };
            batch.put(schema::tx_lookup_key(tx.hash()), alloy_rlp::encode(entry));
        }
    }

    pub fn delete_tx_lookup_entry(&self, batch: &mut Batch, tx_hash: B256) {
        batch.delete(schema::tx_lookup_key(tx_hash));
    }

    /// A canonical transaction together with its location.
    pub fn read_tx_and_lookup_info(
        &self,
        tx_hash: B256,
    ) -> DatabaseResult<Option<(Transaction, TxLookupEntry)>> {
        let Some(entry) = self.read_tx_lookup_entry(tx_hash)? else {
            return Ok(None);
        };
        let Some(body) = self.read_body(entry.block_hash, entry.block_number)? else {
            return Ok(None);
        };
        Ok(usize::try_from(entry.index)
            .ok()
            .and_then(|index| body.transactions.get(index).cloned())
            .map(|tx| (tx, entry)))
    }

    pub fn read_receipt(&self, tx_hash: B256) -> DatabaseResult<Option<(Receipt, TxLookupEntry)>> {
        let Some(entry) = self.read_tx_lookup_entry(tx_hash)? else {
            return Ok(None);
        };
        let Some(receipts) = self.read_receipts(entry.block_hash, entry.block_number)? else {
            return Ok(None);
        };
        Ok(usize::try_from(entry.index)
            .ok()
            .and_then(|index| receipts.get(index).cloned())
            .map(|receipt| (receipt, entry)))
    }

    // Preimages

    pub fn write_preimages(&self, batch: &mut Batch, preimages: &HashMap<B256, Vec<u8>>) {
        for (hash, preimage) in preimages {
            batch.put(schema::preimage_key(*hash), preimage.clone());
        }
    }

    pub fn read_preimage(&self, hash: B256) -> DatabaseResult<Option<Vec<u8>>> {
        self.chain.get(&schema::preimage_key(hash))
    }

    // Chain config

    pub fn write_chain_config(
        &self,
        batch: &mut Batch,
        genesis: B256,
        config: &ChainConfig,
    ) -> DatabaseResult {
        let raw = bincode::serialize(config).map_err(DatabaseError::BincodeError)?;
        batch.put(schema::config_key(genesis), raw);
        Ok(())
    }

    pub fn read_chain_config(&self, genesis: B256) -> DatabaseResult<Option<ChainConfig>> {
        match self.chain.get(&schema::config_key(genesis))? {
            Some(raw) => {
                Ok(Some(
                    bincode::deserialize(&raw).map_err(DatabaseError::BincodeError)?,
                ))
            }
            None => Ok(None),
        }
    }

    // Snapshot layer

    pub fn read_snapshot_root(&self) -> DatabaseResult<Option<B256>> {
        self.read_hash(schema::SNAPSHOT_ROOT_KEY)
    }

    pub fn write_snapshot_root(&self, batch: &mut Batch, root: B256) {
        batch.put(schema::SNAPSHOT_ROOT_KEY.to_vec(), root.to_vec());
    }

    pub fn delete_snapshot_root(&self, batch: &mut Batch) {
        batch.delete(schema::SNAPSHOT_ROOT_KEY.to_vec());
    }

    pub fn read_snapshot_recovery_number(&self) -> DatabaseResult<Option<u64>> {
        self.get_rlp(schema::SNAPSHOT_RECOVERY_KEY, "snapshot recovery number")
    }

    pub fn write_snapshot_recovery_number(&self, batch: &mut Batch, number: u64) {
        batch.put(
            schema::SNAPSHOT_RECOVERY_KEY.to_vec(),
            alloy_rlp::encode(number),
        );
    }

    pub fn delete_snapshot_recovery_number(&self, batch: &mut Batch) {
        batch.delete(schema::SNAPSHOT_RECOVERY_KEY.to_vec());
    }

    pub fn read_snapshot_journal(&self) -> DatabaseResult<Option<Vec<u8>>> {
        self.chain.get(schema::SNAPSHOT_JOURNAL_KEY)
    }

    pub fn write_snapshot_journal(&self, batch: &mut Batch, journal: Vec<u8>) {
        batch.put(schema::SNAPSHOT_JOURNAL_KEY.to_vec(), journal);
    }

    pub fn read_snapshot_account(&self, account_hash: B256) -> DatabaseResult<Option<Vec<u8>>> {
        self.chain.get(&schema::snapshot_account_key(account_hash))
    }

    pub fn write_snapshot_account(&self, batch: &mut Batch, account_hash: B256, account: Vec<u8>) {
        batch.put(schema::snapshot_account_key(account_hash), account);
    }

    pub fn delete_snapshot_account(&self, batch: &mut Batch, account_hash: B256) {
        batch.delete(schema::snapshot_account_key(account_hash));
    }

    pub fn read_snapshot_storage(
        &self,
        account_hash: B256,
        slot_hash: B256,
    ) -> DatabaseResult<Option<Vec<u8>>> {
        self.chain
            .get(&schema::snapshot_storage_key(account_hash, slot_hash))
    }

    pub fn write_snapshot_storage(
        &self,
        batch: &mut Batch,
        account_hash: B256,
        slot_hash: B256,
        value: Vec<u8>,
    ) {
        batch.put(schema::snapshot_storage_key(account_hash, slot_hash), value);
    }

    pub fn delete_snapshot_storage(&self, batch: &mut Batch, account_hash: B256, slot_hash: B256) {
        batch.delete(schema::snapshot_storage_key(account_hash, slot_hash));
    }

    /// Every snapshot key of the disk layer: accounts first, then storage.
    pub fn snapshot_keys(&self) -> DatabaseResult<Vec<Vec<u8>>> {
        let mut keys = self
            .chain
            .iter_prefix(schema::SNAPSHOT_ACCOUNT_PREFIX)?
            .into_iter()
            .map(|(key, _)| key)
            .collect::<Vec<_>>();
        keys.extend(
            self.chain
                .iter_prefix(schema::SNAPSHOT_STORAGE_PREFIX)?
                .into_iter()
                .map(|(key, _)| key),
        );
        Ok(keys)
    }

    /// Slot hashes with a snapshot entry for `account_hash`.
    pub fn snapshot_storage_slots(&self, account_hash: B256) -> DatabaseResult<Vec<B256>> {
        let prefix = schema::snapshot_storage_prefix(account_hash);
        Ok(self
            .chain
            .iter_prefix(&prefix)?
            .into_iter()
            .filter_map(|(key, _)| {
                (key.len() == prefix.len() + 32).then(|| B256::from_slice(&key[prefix.len()..]))
            })
            .collect())
    }

    /// Removes a raw chain-store key, as returned by [`Database::snapshot_keys`].
    pub fn delete_raw(&self, batch: &mut Batch, key: Vec<u8>) {
        batch.delete(key);
    }

    // Trie nodes and code

    fn read_state(&self, key: &[u8]) -> DatabaseResult<Option<Vec<u8>>> {
        let stores = self.state.read();
        if let Some(value) = stores.current.get(key)? {
            return Ok(Some(value));
        }
        match &stores.migration {
            Some(migration) => migration.store.get(key),
            None => Ok(None),
        }
    }

    pub fn read_trie_node(&self, hash: B256) -> DatabaseResult<Option<Vec<u8>>> {
        self.read_state(hash.as_slice())
    }

    pub fn has_trie_node(&self, hash: B256) -> DatabaseResult<bool> {
        Ok(self.read_trie_node(hash)?.is_some())
    }

    pub fn write_trie_node(&self, batch: &mut Batch, hash: B256, blob: Vec<u8>) {
        debug_assert_eq!(batch.target(), BatchTarget::StateTrie);
        batch.put(hash.to_vec(), blob);
    }

    pub fn read_code(&self, code_hash: B256) -> DatabaseResult<Option<Vec<u8>>> {
        self.read_state(&schema::code_key(code_hash))
    }

    pub fn has_code(&self, code_hash: B256) -> DatabaseResult<bool> {
        Ok(self.read_code(code_hash)?.is_some())
    }

    pub fn write_code(&self, batch: &mut Batch, code_hash: B256, code: Vec<u8>) {
        debug_assert_eq!(batch.target(), BatchTarget::StateTrie);
        batch.put(schema::code_key(code_hash), code);
    }

    // State migration

    pub fn in_migration(&self) -> bool {
        self.state.read().migration.is_some()
    }

    pub fn migration_block_number(&self) -> Option<u64> {
        self.state
            .read()
            .migration
            .as_ref()
            .map(|migration| migration.block_number)
    }

    /// Creates the migration target and persists the migration number.
    pub fn create_migration_store(&self, block_number: u64) -> DatabaseResult {
        let mut stores = self.state.write();
        if let Some(migration) = &stores.migration {
            return Err(DatabaseError::MigrationActive(migration.block_number));
        }
        let name = migration_store_name(block_number);
        let store = match &self.root {
            Some(root) => KeyValueStore::open_sled(root.join(&name))?,
            None => KeyValueStore::new_in_memory(),
        };
        self.chain
            .put(schema::STATE_MIGRATION_KEY, &alloy_rlp::encode(block_number))?;
        info!(
            target: "ledger-chain::db",
            block_number,
            store = %name,
            "Created state migration target"
        );
        stores.migration = Some(MigrationTarget {
            store,
            name,
            block_number,
        });
        Ok(())
    }

    /// Trie node read that only consults the migration target.
    pub fn read_trie_node_from_migration(&self, hash: B256) -> DatabaseResult<Option<Vec<u8>>> {
        match &self.state.read().migration {
            Some(migration) => migration.store.get(hash.as_slice()),
            None => Err(DatabaseError::NoMigration),
        }
    }

    /// Code read that only consults the migration target.
    pub fn read_code_from_migration(&self, code_hash: B256) -> DatabaseResult<Option<Vec<u8>>> {
        match &self.state.read().migration {
            Some(migration) => migration.store.get(&schema::code_key(code_hash)),
            None => Err(DatabaseError::NoMigration),
        }
    }

    /// Trie node read that only consults the current store.
    pub fn read_trie_node_from_current(&self, hash: B256) -> DatabaseResult<Option<Vec<u8>>> {
        self.state.read().current.get(hash.as_slice())
    }

    /// Code read that only consults the current store.
    pub fn read_code_from_current(&self, code_hash: B256) -> DatabaseResult<Option<Vec<u8>>> {
        self.state.read().current.get(&schema::code_key(code_hash))
    }

    /// Writes a batch to the migration target only.
    pub fn write_to_migration(&self, batch: &Batch) -> DatabaseResult {
        match &self.state.read().migration {
            Some(migration) => migration.store.write(batch),
            None => Err(DatabaseError::NoMigration),
        }
    }

    /// Ends the migration. On success the target becomes the current state
    /// store; otherwise it is discarded.
    pub fn finish_state_migration(&self, success: bool) -> DatabaseResult {
        let mut stores = self.state.write();
        let Some(migration) = stores.migration.take() else {
            return Err(DatabaseError::NoMigration);
        };
        self.chain.delete(schema::STATE_MIGRATION_KEY)?;

        if success {
            self.chain
                .put(schema::STATE_STORE_NAME_KEY, migration.name.as_bytes())?;
            let old_name = std::mem::replace(&mut stores.current_name, migration.name);
            stores.current = migration.store;
            info!(
                target: "ledger-chain::db",
                block_number = migration.block_number,
                store = %stores.current_name,
                "State migration target is now the current state store"
            );
            self.remove_store_dir(&old_name);
        } else {
            warn!(
                target: "ledger-chain::db",
                block_number = migration.block_number,
                "Discarding state migration target"
            );
            drop(migration.store);
            self.remove_store_dir(&migration.name);
        }
        Ok(())
    }

    fn remove_store_dir(&self, name: &str) {
        let Some(root) = &self.root else {
            return;
        };
        if let Err(err) = std::fs::remove_dir_all(root.join(name)) {
            debug!(
                target: "ledger-chain::db",
                error = ?err,
                store = %name,
                "Failed to remove state store directory"
            );
        }
    }
}

fn migration_store_name(block_number: u64) -> String {
    format!("{DEFAULT_STATE_STORE}-{block_number}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        Log,
        ReceiptStatus,
    };
    use alloy_primitives::{
        Address,
        Bytes,
    };

    fn header(number: u64) -> Header {
        Header {
            number,
            time: number * 10,
            block_score: U256::from(1),
            ..Default::default()
        }
    }

    #[test]
    fn header_td_canonical_round_trip() {
        let db = Database::new_in_memory();
        let header = header(3);
        let hash = header.hash();

        let mut batch = db.new_batch(BatchTarget::Chain);
        db.write_header(&mut batch, &header);
        db.write_td(&mut batch, hash, 3, U256::from(4));
        db.write_canonical_hash(&mut batch, hash, 3);
        db.write_head_header_hash(&mut batch, hash);
        db.write(&batch).unwrap();

        assert_eq!(db.read_header(hash, 3).unwrap(), Some(header));
        assert_eq!(db.read_header_number(hash).unwrap(), Some(3));
        assert_eq!(db.read_td(hash, 3).unwrap(), Some(U256::from(4)));
        assert_eq!(db.read_canonical_hash(3).unwrap(), Some(hash));
        assert_eq!(db.read_head_header_hash().unwrap(), Some(hash));

        let mut batch = db.new_batch(BatchTarget::Chain);
        db.delete_header(&mut batch, hash, 3);
        db.delete_td(&mut batch, hash, 3);
        db.write(&batch).unwrap();
        assert_eq!(db.read_header(hash, 3).unwrap(), None, "cache must be invalidated");
        assert_eq!(db.read_td(hash, 3).unwrap(), None);
    }

    #[test]
    fn receipts_and_lookups() {
        let db = Database::new_in_memory();
        let block = Block::new(header(1), Vec::new());
        let mut receipt = Receipt::new(ReceiptStatus::Successful, B256::repeat_byte(7), 21_000);
        receipt.logs.push(Log::new(Address::repeat_byte(1), vec![], Bytes::new()));

        let mut batch = db.new_batch(BatchTarget::Chain);
        db.write_block(&mut batch, &block);
        db.write_receipts(&mut batch, block.hash(), 1, std::slice::from_ref(&receipt));
        db.write(&batch).unwrap();

        assert!(db.has_block(block.hash(), 1).unwrap());
        assert_eq!(db.read_block(block.hash(), 1).unwrap().unwrap().hash(), block.hash());
        assert_eq!(db.read_receipts(block.hash(), 1).unwrap(), Some(vec![receipt]));
        assert_eq!(db.read_tx_lookup_entry(B256::ZERO).unwrap(), None);
    }

    #[test]
    fn chain_config_is_stored_per_genesis() {
        let db = Database::new_in_memory();
        let config = ChainConfig::default().with_chain_id(1001).with_magma_block(Some(5));
        let mut batch = db.new_batch(BatchTarget::Chain);
        db.write_chain_config(&mut batch, B256::repeat_byte(1), &config).unwrap();
        db.write(&batch).unwrap();
        assert_eq!(db.read_chain_config(B256::repeat_byte(1)).unwrap(), Some(config));
        assert_eq!(db.read_chain_config(B256::repeat_byte(2)).unwrap(), None);
    }

    #[test]
    fn migration_routes_trie_writes_to_both_stores() {
        let db = Database::new_in_memory();
        let before = B256::repeat_byte(1);
        let during = B256::repeat_byte(2);

        let mut batch = db.new_batch(BatchTarget::StateTrie);
        db.write_trie_node(&mut batch, before, vec![1]);
        db.write(&batch).unwrap();

        db.create_migration_store(10).unwrap();
        assert!(matches!(
            db.create_migration_store(11),
            Err(DatabaseError::MigrationActive(10))
        ));
        assert_eq!(db.migration_block_number(), Some(10));

        let mut batch = db.new_batch(BatchTarget::StateTrie);
        db.write_trie_node(&mut batch, during, vec![2]);
        db.write(&batch).unwrap();

        assert_eq!(db.read_trie_node_from_migration(before).unwrap(), None);
        assert_eq!(db.read_trie_node_from_migration(during).unwrap(), Some(vec![2]));
        assert_eq!(db.read_trie_node(during).unwrap(), Some(vec![2]));

        let mut batch = db.new_batch(BatchTarget::StateTrie);
        db.write_trie_node(&mut batch, before, vec![1]);
        db.write_to_migration(&batch).unwrap();

        db.finish_state_migration(true).unwrap();
        assert!(!db.in_migration());
        assert_eq!(db.read_trie_node(before).unwrap(), Some(vec![1]));
        assert_eq!(db.read_trie_node(during).unwrap(), Some(vec![2]));
    }

    #[test]
    fn failed_migration_keeps_current_store() {
        let db = Database::new_in_memory();
        db.create_migration_store(3).unwrap();
        let mut batch = db.new_batch(BatchTarget::StateTrie);
        db.write_trie_node(&mut batch, B256::repeat_byte(9), vec![9]);
        db.write(&batch).unwrap();
        db.finish_state_migration(false).unwrap();
        assert_eq!(db.read_trie_node(B256::repeat_byte(9)).unwrap(), Some(vec![9]));
        assert!(matches!(
            db.finish_state_migration(false),
            Err(DatabaseError::NoMigration)
        ));
    }

    #[test]
    fn sled_database_resumes_migration() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = Database::open(dir.path()).unwrap();
            db.create_migration_store(42).unwrap();
            db.flush().unwrap();
        }
        let db = Database::open(dir.path()).unwrap();
        assert_eq!(db.migration_block_number(), Some(42));
    }
}
