//! Chain configuration and gas schedule.

use alloy_primitives::U256;
use serde::{
    Deserialize,
    Serialize,
};

pub const TX_GAS: u64 = 21_000;
pub const TX_GAS_CONTRACT_CREATION: u64 = 53_000;
pub const TX_GAS_FEE_DELEGATED: u64 = 10_000;
pub const TX_GAS_FEE_DELEGATED_WITH_RATIO: u64 = 15_000;
pub const TX_GAS_CANCEL: u64 = 21_000;
pub const TX_GAS_CHAIN_DATA_ANCHORING: u64 = 21_000;
/// Per-byte gas of data carried by Klaytn-style variants.
pub const TX_DATA_GAS: u64 = 100;
pub const TX_DATA_ZERO_GAS: u64 = 4;
pub const TX_DATA_NON_ZERO_GAS: u64 = 16;
pub const TX_ACCESS_LIST_ADDRESS_GAS: u64 = 2_400;
pub const TX_ACCESS_LIST_STORAGE_KEY_GAS: u64 = 1_900;

/// Refunds are capped at `gas_used / REFUND_QUOTIENT`.
pub const REFUND_QUOTIENT: u64 = 2;

/// Default unit price of the network, in peb.
pub const DEFAULT_UNIT_PRICE: u64 = 25_000_000_000;

/// Selects how list roots (`tx_root`, `receipt_root`) are derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DeriveShaImpl {
    /// Merkle-Patricia trie keyed by `rlp(index)`.
    #[default]
    Trie,
    /// `keccak(hash(item_0) || hash(item_1) || ...)`.
    Simple,
    /// `keccak(rlp(item_0) || rlp(item_1) || ...)`.
    Concat,
}

/// Fork schedule and governance parameters of a chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    /// Ethereum typed envelopes are accepted from this block on.
    pub eip2718_block: Option<u64>,
    /// Dynamic-fee transactions are accepted from this block on.
    pub eip1559_block: Option<u64>,
    /// Base-fee semantics apply from this block on.
    pub magma_block: Option<u64>,
    /// When set, transaction fees are paid out by the consensus engine at
    /// finalization instead of during each transfer.
    pub deferred_tx_fee: bool,
    /// The state is committed at multiples of this interval regardless of
    /// the block interval.
    pub staking_update_interval: u64,
    /// Fixed gas price before Magma.
    pub unit_price: u64,
    pub derive_sha_impl: DeriveShaImpl,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            chain_id: 1,
            eip2718_block: Some(0),
            eip1559_block: Some(0),
            magma_block: None,
            deferred_tx_fee: false,
            staking_update_interval: 86_400,
            unit_price: DEFAULT_UNIT_PRICE,
            derive_sha_impl: DeriveShaImpl::Trie,
        }
    }
}

impl ChainConfig {
    pub fn with_chain_id(mut self, chain_id: u64) -> Self {
        self.chain_id = chain_id;
        self
    }

    pub fn with_eip2718_block(mut self, block: Option<u64>) -> Self {
        self.eip2718_block = block;
        self
    }

    pub fn with_eip1559_block(mut self, block: Option<u64>) -> Self {
        self.eip1559_block = block;
        self
    }

    pub fn with_magma_block(mut self, block: Option<u64>) -> Self {
        self.magma_block = block;
        self
    }

    pub fn with_deferred_tx_fee(mut self, deferred: bool) -> Self {
        self.deferred_tx_fee = deferred;
        self
    }

    pub fn with_staking_update_interval(mut self, interval: u64) -> Self {
        self.staking_update_interval = interval;
        self
    }

    pub fn with_unit_price(mut self, unit_price: u64) -> Self {
        self.unit_price = unit_price;
        self
    }

    pub fn with_derive_sha_impl(mut self, derive_sha_impl: DeriveShaImpl) -> Self {
        self.derive_sha_impl = derive_sha_impl;
        self
    }

    fn is_active(fork: Option<u64>, number: u64) -> bool {
        fork.is_some_and(|fork| fork <= number)
    }

    pub fn is_eip2718_active(&self, number: u64) -> bool {
        Self::is_active(self.eip2718_block, number)
    }

    pub fn is_eip1559_active(&self, number: u64) -> bool {
        Self::is_active(self.eip1559_block, number)
    }

    pub fn is_magma_active(&self, number: u64) -> bool {
        Self::is_active(self.magma_block, number)
    }

    pub fn unit_price(&self) -> U256 {
        U256::from(self.unit_price)
    }

    /// Whether the state at `number` must be committed for staking info.
    pub fn is_staking_commit_block(&self, number: u64) -> bool {
        self.staking_update_interval != 0 && number % self.staking_update_interval == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forks_activate_at_their_block() {
        let config = ChainConfig::default().with_magma_block(Some(10));
        assert!(!config.is_magma_active(9));
        assert!(config.is_magma_active(10));
        assert!(!ChainConfig::default().is_magma_active(u64::MAX));
    }

    #[test]
    fn staking_interval_zero_never_commits() {
        let config = ChainConfig::default().with_staking_update_interval(0);
        assert!(!config.is_staking_commit_block(0));
        let config = config.with_staking_update_interval(4);
        assert!(config.is_staking_commit_block(8));
        assert!(!config.is_staking_commit_block(9));
    }
}
