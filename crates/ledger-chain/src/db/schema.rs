//! Logical key layout of the chain store.
//!
//! ```text
//! h ‖ num ‖ hash          → header RLP
//! h ‖ num ‖ hash ‖ t      → total blockscore
//! h ‖ num ‖ n             → canonical hash
//! H ‖ hash                → block number
//! b ‖ num ‖ hash          → body RLP
//! r ‖ num ‖ hash          → receipts (storage form)
//! l ‖ tx hash             → (block hash, block number, index)
//! secure-key- ‖ hash      → preimage
//! a ‖ account hash        → snapshot account
//! o ‖ account hash ‖ slot → snapshot storage
//! ```
//!
//! Trie nodes live in the separate state store, keyed by their hash; code is
//! stored there too under `c ‖ code hash`.

use alloy_primitives::B256;

pub const HEAD_HEADER_KEY: &[u8] = b"LastHeader";
pub const HEAD_BLOCK_KEY: &[u8] = b"LastBlock";
pub const HEAD_FAST_BLOCK_KEY: &[u8] = b"LastFast";
pub const SNAPSHOT_ROOT_KEY: &[u8] = b"SnapshotRoot";
pub const SNAPSHOT_RECOVERY_KEY: &[u8] = b"SnapshotRecovery";
pub const SNAPSHOT_JOURNAL_KEY: &[u8] = b"SnapshotJournal";
pub const STATE_MIGRATION_KEY: &[u8] = b"StateMigrationNumber";
pub const STATE_STORE_NAME_KEY: &[u8] = b"StateTrieStoreName";

const HEADER_PREFIX: &[u8] = b"h";
const HEADER_TD_SUFFIX: &[u8] = b"t";
const HEADER_HASH_SUFFIX: &[u8] = b"n";
const HEADER_NUMBER_PREFIX: &[u8] = b"H";
const BODY_PREFIX: &[u8] = b"b";
const RECEIPTS_PREFIX: &[u8] = b"r";
const TX_LOOKUP_PREFIX: &[u8] = b"l";
const PREIMAGE_PREFIX: &[u8] = b"secure-key-";
const CONFIG_PREFIX: &[u8] = b"ethereum-config-";
pub(crate) const SNAPSHOT_ACCOUNT_PREFIX: &[u8] = b"a";
pub(crate) const SNAPSHOT_STORAGE_PREFIX: &[u8] = b"o";
const CODE_PREFIX: &[u8] = b"c";

fn concat(parts: &[&[u8]]) -> Vec<u8> {
    let mut key = Vec::with_capacity(parts.iter().map(|part| part.len()).sum());
    for part in parts {
        key.extend_from_slice(part);
    }
    key
}

pub fn header_key(number: u64, hash: B256) -> Vec<u8> {
    concat(&[HEADER_PREFIX, &number.to_be_bytes(), hash.as_slice()])
}

pub fn header_td_key(number: u64, hash: B256) -> Vec<u8> {
    concat(&[HEADER_PREFIX, &number.to_be_bytes(), hash.as_slice(), HEADER_TD_SUFFIX])
}

pub fn header_hash_key(number: u64) -> Vec<u8> {
    concat(&[HEADER_PREFIX, &number.to_be_bytes(), HEADER_HASH_SUFFIX])
}

pub fn header_number_key(hash: B256) -> Vec<u8> {
    concat(&[HEADER_NUMBER_PREFIX, hash.as_slice()])
}

pub fn body_key(number: u64, hash: B256) -> Vec<u8> {
    concat(&[BODY_PREFIX, &number.to_be_bytes(), hash.as_slice()])
}

pub fn receipts_key(number: u64, hash: B256) -> Vec<u8> {
    concat(&[RECEIPTS_PREFIX, &number.to_be_bytes(), hash.as_slice()])
}

pub fn tx_lookup_key(hash: B256) -> Vec<u8> {
    concat(&[TX_LOOKUP_PREFIX, hash.as_slice()])
}

pub fn preimage_key(hash: B256) -> Vec<u8> {
    concat(&[PREIMAGE_PREFIX, hash.as_slice()])
}

pub fn config_key(genesis: B256) -> Vec<u8> {
    concat(&[CONFIG_PREFIX, genesis.as_slice()])
}

pub fn snapshot_account_key(account_hash: B256) -> Vec<u8> {
    concat(&[SNAPSHOT_ACCOUNT_PREFIX, account_hash.as_slice()])
}

pub fn snapshot_storage_key(account_hash: B256, slot_hash: B256) -> Vec<u8> {
    concat(&[SNAPSHOT_STORAGE_PREFIX, account_hash.as_slice(), slot_hash.as_slice()])
}

pub fn snapshot_storage_prefix(account_hash: B256) -> Vec<u8> {
    concat(&[SNAPSHOT_STORAGE_PREFIX, account_hash.as_slice()])
}

pub fn code_key(code_hash: B256) -> Vec<u8> {
    concat(&[CODE_PREFIX, code_hash.as_slice()])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_sort_by_number() {
        let hash = B256::repeat_byte(0xff);
        assert!(header_key(1, hash) < header_key(2, B256::ZERO));
        assert!(header_hash_key(255) < header_hash_key(256));
    }

    #[test]
    fn td_and_canonical_keys_do_not_collide() {
        let hash = B256::ZERO;
        assert_ne!(header_td_key(1, hash), header_key(1, hash));
        assert_ne!(header_hash_key(1), header_key(1, hash));
        assert_eq!(header_td_key(1, hash).len(), 1 + 8 + 32 + 1);
    }
}
