use super::BlockChain;
use crate::{
    chain::error::{
        ChainError,
        ChainResult,
    },
    db::{
        Batch,
        BatchTarget,
    },
    metrics,
    types::{
        BlockRef,
        Header,
    },
};
use alloy_primitives::B256;
use tracing::{
    debug,
    error,
    info,
    trace,
    warn,
};

impl BlockChain {
    /// Rewinds the chain to `head`. Blocks above it lose their bodies and
    /// receipts; the head block moves further back until its state is
    /// available.
    pub fn set_head(&self, head: u64) -> ChainResult {
        self.set_head_beyond_root(head, B256::ZERO).map(|_| ())
    }

    /// Like [`BlockChain::set_head`], but keeps rewinding the head block
    /// until it is at or below the block whose state root is `root`.
    /// Returns the number of that block, or zero when it was not crossed.
    pub fn set_head_beyond_root(&self, head: u64, root: B256) -> ChainResult<u64> {
        let _guard = self.chain_mu.lock();
        let root_number = self.rewind(head, root, false)?;
        self.load_last_state()?;
        Ok(root_number)
    }

    /// Unlocked body of the head rewinds. With `repair` the header chain is
    /// left alone and only the block pointers move back to state.
    pub(super) fn rewind(&self, head: u64, root: B256, repair: bool) -> ChainResult<u64> {
        let mut root_number = 0;
        let mut update = |header: &Header| -> ChainResult {
            let current = self.current_block();
            if header.number <= current.number() {
                let new_head = self.rewind_block(header, root, &mut root_number);
                let mut batch = self.db.new_batch(BatchTarget::Chain);
                self.db.write_head_block_hash(&mut batch, new_head.hash());
                self.db.write(&batch)?;
                metrics::set_head_block(new_head.number());
                *self.current_block.write() = new_head;
            }
            let fast = self.current_fast_block();
            if header.number < fast.number() {
                let new_fast = self
                    .get_block(header.hash(), header.number)
                    .unwrap_or_else(|| self.genesis());
                let mut batch = self.db.new_batch(BatchTarget::Chain);
                self.db.write_head_fast_block_hash(&mut batch, new_fast.hash());
                self.db.write(&batch)?;
                *self.current_fast_block.write() = new_fast;
            }
            Ok(())
        };
        let mut delete = |batch: &mut Batch, hash: B256, number: u64| {
            self.db.delete_body(batch, hash, number);
            self.db.delete_receipts(batch, hash, number);
        };

        if repair {
            let header = self.current_block().header().clone();
            update(&header)?;
        } else {
            warn!(target: "ledger-chain::blockchain", target_number = head, "Rewinding blockchain");
            self.hc.set_head(head, &mut update, &mut delete)?;
        }

        self.block_cache.invalidate_all();
        self.future_blocks.invalidate_all();

        if let Some(snapshots) = self.state_db.snapshots() {
            let head_root = self.current_block().state_root();
            if snapshots.snapshot(head_root).is_none() {
                info!(target: "ledger-chain::blockchain", root = %head_root, "Rebuilding state snapshot after rewind");
                snapshots.rebuild(head_root, self.state_db.node_db())?;
            }
        }
        Ok(root_number)
    }

    /// Walks back from `header` to the first block with available state,
    /// crossing the block with state `root` first when one is given.
    fn rewind_block(&self, header: &Header, root: B256, root_number: &mut u64) -> BlockRef {
        let Some(mut new_head) = self.get_block(header.hash(), header.number) else {
            error!(target: "ledger-chain::blockchain", number = header.number, hash = %header.hash(), "Gap in the chain, rewinding to genesis");
            return self.genesis();
        };
        let mut beyond_root = root == B256::ZERO;
        loop {
            if !beyond_root && new_head.state_root() == root {
                beyond_root = true;
                *root_number = new_head.number();
            }
            let has_state = self.has_state(new_head.state_root());
            if has_state && (beyond_root || new_head.number() == 0) {
                debug!(target: "ledger-chain::blockchain", number = new_head.number(), hash = %new_head.hash(), "Rewound to block with state");
                return new_head;
            }
            if has_state {
                debug!(target: "ledger-chain::blockchain", number = new_head.number(), hash = %new_head.hash(), "Skipping block with threshold state");
            } else {
                trace!(target: "ledger-chain::blockchain", number = new_head.number(), hash = %new_head.hash(), "Block state missing, rewinding further");
            }
            let parent = new_head
                .number()
                .checked_sub(1)
                .and_then(|number| self.get_block(new_head.parent_hash(), number));
            match parent {
                Some(parent) => new_head = parent,
                None => {
                    error!(target: "ledger-chain::blockchain", number = new_head.number(), hash = %new_head.hash(), "Missing block in the middle, aiming genesis");
                    return self.genesis();
                }
            }
        }
    }

    /// Moves every head pointer that sits on one of `chain` back to its
    /// parent. Used to drop blocks imported by an aborted sync.
    pub fn rollback(&self, chain: &[B256]) -> ChainResult {
        let _guard = self.chain_mu.lock();
        for hash in chain.iter().rev() {
            let header = self.hc.current_header();
            if header.hash() == *hash {
                if let Some(parent) = header
                    .number
                    .checked_sub(1)
                    .and_then(|number| self.hc.get_header(header.parent_hash, number))
                {
                    self.hc.set_current_header(parent)?;
                }
            }

            let fast = self.current_fast_block();
            if fast.hash() == *hash {
                if let Some(parent) = self.parent_block(&fast) {
                    let mut batch = self.db.new_batch(BatchTarget::Chain);
                    self.db.write_head_fast_block_hash(&mut batch, parent.hash());
                    self.db.write(&batch)?;
                    *self.current_fast_block.write() = parent;
                }
            }

            let current = self.current_block();
            if current.hash() == *hash {
                if let Some(parent) = self.parent_block(&current) {
                    let mut batch = self.db.new_batch(BatchTarget::Chain);
                    self.db.write_head_block_hash(&mut batch, parent.hash());
                    self.db.write(&batch)?;
                    metrics::set_head_block(parent.number());
                    *self.current_block.write() = parent;
                }
            }
        }
        Ok(())
    }

    /// Makes the fast-synced block `hash` the head block. Its state must be
    /// available.
    pub fn fast_sync_commit_head(&self, hash: B256) -> ChainResult {
        let block = self
            .get_block_by_hash(hash)
            .ok_or(ChainError::MissingBlock { number: 0, hash })?;
        if !self.has_state(block.state_root()) {
            return Err(ChainError::MissingState {
                number: block.number(),
                root: block.state_root(),
            });
        }
        let _guard = self.chain_mu.lock();
        let mut batch = self.db.new_batch(BatchTarget::Chain);
        self.db.write_head_block_hash(&mut batch, hash);
        self.db.write(&batch)?;
        metrics::set_head_block(block.number());
        info!(target: "ledger-chain::blockchain", number = block.number(), %hash, "Committed new head block");
        *self.current_block.write() = block;
        Ok(())
    }

    pub(super) fn parent_block(&self, block: &BlockRef) -> Option<BlockRef> {
        let number = block.number().checked_sub(1)?;
        self.get_block(block.parent_hash(), number)
    }
}
