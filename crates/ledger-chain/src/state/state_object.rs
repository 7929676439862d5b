use crate::{
    state::trie::Trie,
    types::{
        Account,
        KECCAK_EMPTY,
    },
};
use alloy_primitives::{
    Address,
    B256,
    Bytes,
    U256,
    keccak256,
};
use std::collections::HashMap;

pub(crate) type Storage = HashMap<B256, B256>;

/// Cached account plus its storage changes, owned by a [`StateDb`](super::StateDb).
#[derive(Debug, Clone)]
pub(crate) struct StateObject {
    pub(crate) address: Address,
    pub(crate) addr_hash: B256,
    pub(crate) data: Account,
    /// Storage trie, opened on first storage access.
    pub(crate) trie: Option<Trie>,
    pub(crate) code: Option<Bytes>,
    pub(crate) dirty_code: bool,
    /// Values as of the start of the block.
    pub(crate) origin_storage: Storage,
    /// Values finalised by earlier transactions of the block.
    pub(crate) pending_storage: Storage,
    /// Values written by the current transaction.
    pub(crate) dirty_storage: Storage,
    pub(crate) suicided: bool,
    pub(crate) deleted: bool,
}

impl StateObject {
    pub(crate) fn new(address: Address, data: Account) -> Self {
        Self {
            address,
            addr_hash: keccak256(address),
            data,
            trie: None,
            code: None,
            dirty_code: false,
            origin_storage: Storage::new(),
            pending_storage: Storage::new(),
            dirty_storage: Storage::new(),
            suicided: false,
            deleted: false,
        }
    }

    pub(crate) fn empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Moves the current transaction's writes into the pending set.
    pub(crate) fn finalise(&mut self) {
        let dirty = std::mem::take(&mut self.dirty_storage);
        self.pending_storage.extend(dirty);
    }

    pub(crate) fn set_code(&mut self, code_hash: B256, code: Bytes) {
        self.data.code_hash = code_hash;
        self.code = Some(code);
        self.dirty_code = true;
    }

    pub(crate) fn code_hash(&self) -> B256 {
        self.data.code_hash
    }

    pub(crate) fn has_code(&self) -> bool {
        self.data.code_hash != KECCAK_EMPTY
    }

    pub(crate) fn balance(&self) -> U256 {
        self.data.balance
    }
}

/// RLP form of a storage value: big-endian with leading zeros stripped.
pub(crate) fn encode_storage_value(value: B256) -> Vec<u8> {
    let trimmed = value
        .as_slice()
        .iter()
        .position(|byte| *byte != 0)
        .map_or(&[][..], |start| &value.as_slice()[start..]);
    alloy_rlp::encode(trimmed)
}

pub(crate) fn decode_storage_value(mut raw: &[u8]) -> alloy_rlp::Result<B256> {
    let bytes = alloy_rlp::Header::decode_bytes(&mut raw, false)?;
    if bytes.len() > 32 {
        return Err(alloy_rlp::Error::Overflow);
    }
    let mut out = [0u8; 32];
    out[32 - bytes.len()..].copy_from_slice(bytes);
    Ok(B256::from(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_values_are_trimmed() {
        let value = B256::left_padding_from(&[0x01, 0x02]);
        let encoded = encode_storage_value(value);
        assert_eq!(encoded, vec![0x82, 0x01, 0x02]);
        assert_eq!(decode_storage_value(&encoded).unwrap(), value);
        assert_eq!(encode_storage_value(B256::with_last_byte(5)), vec![0x05]);
    }
}
