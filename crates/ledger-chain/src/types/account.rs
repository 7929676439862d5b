use alloy_primitives::{
    B256,
    U256,
    b256,
};
use alloy_rlp::{
    RlpDecodable,
    RlpEncodable,
};

/// Root of an empty trie, `keccak256(rlp(""))`.
pub use alloy_trie::EMPTY_ROOT_HASH;

/// Hash of empty code, `keccak256("")`.
pub const KECCAK_EMPTY: B256 =
    b256!("c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470");

/// Account leaf of the state trie.
#[derive(Debug, Clone, Copy, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct Account {
    pub nonce: u64,
    pub balance: U256,
    pub storage_root: B256,
    pub code_hash: B256,
}

impl Default for Account {
    fn default() -> Self {
        Self {
            nonce: 0,
            balance: U256::ZERO,
            storage_root: EMPTY_ROOT_HASH,
            code_hash: KECCAK_EMPTY,
        }
    }
}

impl Account {
    /// Empty per EIP-161: no nonce, no balance, no code.
    pub fn is_empty(&self) -> bool {
        self.nonce == 0 && self.balance.is_zero() && self.code_hash == KECCAK_EMPTY
    }

    /// Accounts with code are program accounts.
    pub fn is_program_account(&self) -> bool {
        self.code_hash != KECCAK_EMPTY
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::keccak256;

    #[test]
    fn empty_constants_match_keccak() {
        assert_eq!(KECCAK_EMPTY, keccak256([]));
        assert_eq!(EMPTY_ROOT_HASH, keccak256([0x80]));
        assert!(Account::default().is_empty());
    }
}
