//! Genesis specification and the code that writes block zero.

use crate::{
    chain::error::ChainResult,
    db::{
        BatchTarget,
        Database,
    },
    params::ChainConfig,
    state::{
        StateDatabase,
        StateDb,
    },
    types::{
        Block,
        BlockRef,
        EMPTY_ROOT_HASH,
        Header,
    },
};
use alloy_primitives::{
    Address,
    B256,
    Bytes,
    U256,
};
use std::{
    collections::BTreeMap,
    sync::Arc,
};
use tracing::info;

/// Default gas limit of the genesis block.
pub const GENESIS_GAS_LIMIT: u64 = 4_712_388;

/// Initial content of one account.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenesisAccount {
    pub balance: U256,
    pub nonce: u64,
    pub code: Bytes,
    pub storage: BTreeMap<B256, B256>,
}

impl GenesisAccount {
    pub fn with_balance(balance: U256) -> Self {
        Self {
            balance,
            ..Default::default()
        }
    }
}

/// Everything needed to build block zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Genesis {
    pub config: ChainConfig,
    pub time: u64,
    pub extra: Bytes,
    pub gas_limit: u64,
    pub block_score: U256,
    pub rewardbase: Address,
    pub base_fee: Option<U256>,
    pub alloc: BTreeMap<Address, GenesisAccount>,
}

impl Default for Genesis {
    fn default() -> Self {
        Self {
            config: ChainConfig::default(),
            time: 0,
            extra: Bytes::new(),
            gas_limit: GENESIS_GAS_LIMIT,
            block_score: U256::from(1),
            rewardbase: Address::ZERO,
            base_fee: None,
            alloc: BTreeMap::new(),
        }
    }
}

impl Genesis {
    pub fn new(config: ChainConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    pub fn with_account(mut self, address: Address, account: GenesisAccount) -> Self {
        self.alloc.insert(address, account);
        self
    }

    pub fn with_balance(self, address: Address, balance: U256) -> Self {
        self.with_account(address, GenesisAccount::with_balance(balance))
    }

    pub fn with_gas_limit(mut self, gas_limit: u64) -> Self {
        self.gas_limit = gas_limit;
        self
    }

    pub fn with_time(mut self, time: u64) -> Self {
        self.time = time;
        self
    }

    /// Builds the genesis state on `state_db` and returns the block holding
    /// its root. Trie nodes stay in the node database until committed.
    pub fn to_block(&self, state_db: &Arc<StateDatabase>) -> ChainResult<(Block, StateDb)> {
        let mut state = StateDb::new(EMPTY_ROOT_HASH, state_db.clone())?;
        for (address, account) in &self.alloc {
            state.add_balance(*address, account.balance);
            state.set_nonce(*address, account.nonce);
            if !account.code.is_empty() {
                state.set_code(*address, account.code.clone());
            }
            for (key, value) in &account.storage {
                state.set_state(*address, *key, *value);
            }
        }
        let root = state.intermediate_root(false);
        let header = Header {
            number: 0,
            time: self.time,
            extra: self.extra.clone(),
            gas_limit: self.gas_limit,
            block_score: self.block_score,
            rewardbase: self.rewardbase,
            base_fee: self.base_fee,
            state_root: root,
            tx_root: EMPTY_ROOT_HASH,
            receipt_root: EMPTY_ROOT_HASH,
            ..Default::default()
        };
        Ok((Block::new(header, Vec::new()), state))
    }

    /// Writes the genesis block, its state and the chain config to `db` and
    /// marks it as every head. A database that already holds a genesis is
    /// left untouched and its block is returned.
    pub fn commit(&self, db: &Arc<Database>) -> ChainResult<BlockRef> {
        if let Some(hash) = db.read_canonical_hash(0)? {
            if let Some(block) = db.read_block(hash, 0)? {
                return Ok(Arc::new(block));
            }
        }
        let state_db = Arc::new(StateDatabase::new(db.clone(), 0));
        let (block, mut state) = self.to_block(&state_db)?;
        let root = state.commit(false)?;
        state_db.node_db().commit(root, false, 0)?;

        let hash = block.hash();
        let mut batch = db.new_batch(BatchTarget::Chain);
        db.write_td(&mut batch, hash, 0, block.block_score());
        db.write_block(&mut batch, &block);
        db.write_receipts(&mut batch, hash, 0, &[]);
        db.write_canonical_hash(&mut batch, hash, 0);
        db.write_head_block_hash(&mut batch, hash);
        db.write_head_fast_block_hash(&mut batch, hash);
        db.write_head_header_hash(&mut batch, hash);
        db.write_chain_config(&mut batch, hash, &self.config)?;
        db.write(&batch)?;
        info!(target: "ledger-chain::genesis", %hash, root = %root, accounts = self.alloc.len(), "Wrote genesis block");
        Ok(Arc::new(block))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_writes_heads_and_state() {
        let db = Arc::new(Database::new_in_memory());
        let rich = Address::repeat_byte(0x11);
        let genesis = Genesis::default().with_balance(rich, U256::from(1_000_000));
        let block = genesis.commit(&db).unwrap();

        assert_eq!(db.read_canonical_hash(0).unwrap(), Some(block.hash()));
        assert_eq!(db.read_head_block_hash().unwrap(), Some(block.hash()));
        assert_eq!(db.read_td(block.hash(), 0).unwrap(), Some(U256::from(1)));

        let state_db = Arc::new(StateDatabase::new(db.clone(), 0));
        let mut state = StateDb::new(block.state_root(), state_db).unwrap();
        assert_eq!(state.get_balance(rich), U256::from(1_000_000));
    }

    #[test]
    fn commit_is_idempotent() {
        let db = Arc::new(Database::new_in_memory());
        let first = Genesis::default().commit(&db).unwrap();
        let second = Genesis::default()
            .with_balance(Address::repeat_byte(1), U256::from(1))
            .commit(&db)
            .unwrap();
        assert_eq!(first.hash(), second.hash());
    }
}
