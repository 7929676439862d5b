use crate::{
    chain::{
        error::{
            BlockError,
            ChainResult,
        },
        headerchain::HeaderChain,
    },
    consensus::ConsensusError,
    state::{
        StateDatabase,
        StateDb,
    },
    types::{
        Block,
        Receipt,
        create_bloom,
        receipt_root,
        tx_root,
    },
};
use alloy_primitives::B256;
use std::sync::Arc;

/// Checks blocks against their header before and after execution.
#[derive(Debug, Clone)]
pub struct BlockValidator {
    chain: Arc<HeaderChain>,
    state_db: Arc<StateDatabase>,
}

impl BlockValidator {
    pub fn new(chain: Arc<HeaderChain>, state_db: Arc<StateDatabase>) -> Self {
        Self { chain, state_db }
    }

    pub(crate) fn has_state(&self, root: B256) -> bool {
        self.state_db.open_trie(root).is_ok()
    }

    pub(crate) fn has_block(&self, hash: B256, number: u64) -> bool {
        self.chain.db().has_block(hash, number).unwrap_or(false)
    }

    pub(crate) fn has_block_and_state(&self, hash: B256, number: u64) -> bool {
        let Some(header) = self.chain.get_header(hash, number) else {
            return false;
        };
        self.has_block(hash, number) && self.has_state(header.state_root)
    }

    /// Checks that the body matches the header and that the parent is
    /// available with its state.
    pub fn validate_body(&self, block: &Block) -> ChainResult {
        if self.has_block_and_state(block.hash(), block.number()) {
            return Err(BlockError::KnownBlock {
                number: block.number(),
                hash: block.hash(),
            }
            .into());
        }
        let computed = tx_root(block.transactions());
        if computed != block.header().tx_root {
            return Err(BlockError::TxRootMismatch {
                header: block.header().tx_root,
                computed,
            }
            .into());
        }
        let Some(parent_number) = block.number().checked_sub(1) else {
            return Err(ConsensusError::UnknownAncestor.into());
        };
        if !self.has_block_and_state(block.parent_hash(), parent_number) {
            if !self.has_block(block.parent_hash(), parent_number) {
                return Err(ConsensusError::UnknownAncestor.into());
            }
            return Err(ConsensusError::PrunedAncestor.into());
        }
        Ok(())
    }

    /// Checks the execution results against the header.
    pub fn validate_state(
        &self,
        block: &Block,
        state: &mut StateDb,
        receipts: &[Receipt],
        used_gas: u64,
    ) -> ChainResult {
        let header = block.header();
        if header.gas_used != used_gas {
            return Err(BlockError::GasUsedMismatch {
                header: header.gas_used,
                computed: used_gas,
            }
            .into());
        }
        let bloom = create_bloom(receipts);
        if bloom != header.bloom {
            return Err(BlockError::BloomMismatch {
                header: Box::new(header.bloom),
                computed: Box::new(bloom),
            }
            .into());
        }
        let computed = receipt_root(receipts);
        if computed != header.receipt_root {
            return Err(BlockError::ReceiptRootMismatch {
                header: header.receipt_root,
                computed,
            }
            .into());
        }
        let root = state.intermediate_root(true);
        if root != header.state_root {
            return Err(BlockError::StateRootMismatch {
                header: header.state_root,
                computed: root,
            }
            .into());
        }
        Ok(())
    }
}
