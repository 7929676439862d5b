use super::BlockChain;
use crate::{
    chain::{
        error::{
            ChainError,
            ChainResult,
        },
        headerchain::{
            WriteStatus,
            coin_flip,
        },
    },
    constants::{
        IDEAL_BATCH_SIZE,
        MIB,
        PREIMAGE_FLUSH_THRESHOLD,
    },
    db::BatchTarget,
    metrics,
    state::StateDb,
    types::{
        BlockRef,
        Receipt,
    },
};
use alloy_primitives::{
    B256,
    U256,
};
use tracing::{
    debug,
    error,
    instrument,
};

impl BlockChain {
    /// Writes a block whose state is not available, e.g. a side block that
    /// is not heavy enough to be executed.
    pub fn write_block_without_state(&self, block: &BlockRef, td: U256) -> ChainResult {
        let mut batch = self.db.new_batch(BatchTarget::Chain);
        self.db.write_td(&mut batch, block.hash(), block.number(), td);
        self.db.write_block(&mut batch, block);
        self.db.write(&batch)?;
        Ok(())
    }

    /// Persists an executed block with its receipts and state, then decides
    /// whether it becomes the new head.
    pub fn write_block_with_state(
        &self,
        block: &BlockRef,
        receipts: &[Receipt],
        state: &mut StateDb,
    ) -> ChainResult<WriteStatus> {
        let _guard = self.chain_mu.lock();
        self.write_block_with_state_locked(block, receipts, state)
    }

    #[instrument(skip(self, block, receipts, state), fields(number = block.number()), level = "debug")]
    pub(super) fn write_block_with_state_locked(
        &self,
        block: &BlockRef,
        receipts: &[Receipt],
        state: &mut StateDb,
    ) -> ChainResult<WriteStatus> {
        let parent_number = block
            .number()
            .checked_sub(1)
            .ok_or(ChainError::MissingTd {
                number: 0,
                hash: block.parent_hash(),
            })?;
        let parent_td = self
            .get_td(block.parent_hash(), parent_number)
            .ok_or(ChainError::MissingTd {
                number: parent_number,
                hash: block.parent_hash(),
            })?;
        let current = self.current_block();
        let local_td = self
            .get_td(current.hash(), current.number())
            .ok_or(ChainError::MissingTd {
                number: current.number(),
                hash: current.hash(),
            })?;
        let extern_td = parent_td + block.block_score();

        let root = state.commit(true)?;
        if self.cache_config.parallel_db_write {
            self.write_parallel(block, receipts, extern_td, root)?;
        } else {
            let mut batch = self.db.new_batch(BatchTarget::Chain);
            self.db
                .write_td(&mut batch, block.hash(), block.number(), extern_td);
            self.db.write_block(&mut batch, block);
            self.db
                .write_receipts(&mut batch, block.hash(), block.number(), receipts);
            self.db.write(&batch)?;
            self.write_state_trie(block, root)?;
        }

        // Equal scores prefer the lower block, then a coin flip.
        let canonical = extern_td > local_td
            || (extern_td == local_td
                && (block.number() < current.number()
                    || (block.number() == current.number() && coin_flip())));
        let status = if canonical {
            if block.parent_hash() != current.hash() {
                self.reorg(current, block.clone())?;
            }
            let mut batch = self.db.new_batch(BatchTarget::Chain);
            self.db.write_tx_lookup_entries(&mut batch, block);
            self.db.write_preimages(&mut batch, state.preimages());
            self.db.write(&batch)?;
            WriteStatus::Canon
        } else {
            WriteStatus::Side
        };
        if status == WriteStatus::Canon {
            self.insert(block)?;
        }
        self.future_blocks.invalidate(&block.hash());
        Ok(status)
    }

    /// Runs the four independent writes of a block on the rayon pool and
    /// returns the first failure.
    fn write_parallel(
        &self,
        block: &BlockRef,
        receipts: &[Receipt],
        td: U256,
        root: B256,
    ) -> ChainResult {
        let (errors, failures) = flume::bounded::<ChainError>(1);
        let report = |result: ChainResult| {
            if let Err(err) = result {
                // Only the first error is kept.
                let _ = errors.try_send(err);
            }
        };
        rayon::scope(|scope| {
            scope.spawn(|_| {
                let mut batch = self.db.new_batch(BatchTarget::Chain);
                self.db.write_td(&mut batch, block.hash(), block.number(), td);
                report(self.db.write(&batch).map_err(Into::into));
            });
            scope.spawn(|_| {
                let mut batch = self.db.new_batch(BatchTarget::Chain);
                self.db.write_block(&mut batch, block);
                report(self.db.write(&batch).map_err(Into::into));
            });
            scope.spawn(|_| report(self.write_state_trie(block, root)));
            scope.spawn(|_| {
                let mut batch = self.db.new_batch(BatchTarget::Chain);
                self.db
                    .write_receipts(&mut batch, block.hash(), block.number(), receipts);
                report(self.db.write(&batch).map_err(Into::into));
            });
        });
        match failures.try_recv() {
            Ok(err) => Err(err),
            Err(_) => Ok(()),
        }
    }

    /// Applies the flush policy to the trie of a freshly committed state.
    ///
    /// Archive nodes write every root through. Otherwise the root is
    /// referenced in memory, the dirty cache is capped when it outgrows its
    /// budget, and the trie is committed on interval and engine-required
    /// blocks. The root is then queued for garbage collection.
    pub(super) fn write_state_trie(&self, block: &BlockRef, root: B256) -> ChainResult {
        let node_db = self.state_db.node_db();
        let number = block.number();
        if self.cache_config.archive_mode {
            node_db.commit(root, false, number)?;
            self.start_prepared_migration(number, root);
            return Ok(());
        }

        node_db.reference(root, B256::ZERO);
        let limit = self.cache_config.cache_size_mib * MIB;
        let (nodes, preimages) = node_db.size();
        metrics::set_trie_dirty_size(nodes);
        if nodes > limit || preimages > PREIMAGE_FLUSH_THRESHOLD {
            debug!(target: "ledger-chain::blockchain", number, nodes, preimages, "Capping dirty trie cache");
            node_db.cap(limit.saturating_sub(IDEAL_BATCH_SIZE))?;
        }

        let interval = self.cache_config.effective_block_interval();
        if number % interval == 0
            || self.engine.state_commit_required(number)
            || self.chain_config.is_staking_commit_block(number)
        {
            node_db.commit(root, true, number)?;
        }
        if let Some(gc) = self.gc.lock().as_ref() {
            gc.push(number, root);
        }
        self.start_prepared_migration(number, root);
        Ok(())
    }

    fn start_prepared_migration(&self, number: u64, root: B256) {
        if !self.migration.take_prepared() {
            return;
        }
        if let Err(err) = self.start_state_migration(number, root) {
            error!(target: "ledger-chain::blockchain", number, error = %err, "Failed to start prepared state migration");
        }
    }

    /// Makes `block` the head block. The caller holds the chain mutex and
    /// has written the block.
    pub(super) fn insert(&self, block: &BlockRef) -> ChainResult {
        let update_heads = self.hc.get_canonical_hash(block.number()) != Some(block.hash());

        let mut batch = self.db.new_batch(BatchTarget::Chain);
        self.db
            .write_canonical_hash(&mut batch, block.hash(), block.number());
        self.db.write_head_block_hash(&mut batch, block.hash());
        if update_heads {
            self.db.write_head_fast_block_hash(&mut batch, block.hash());
        }
        self.db.write(&batch)?;

        *self.current_block.write() = block.clone();
        metrics::set_head_block(block.number());
        if update_heads {
            self.hc.set_current_header(block.header().clone())?;
            metrics::set_head_header(block.number());
            *self.current_fast_block.write() = block.clone();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::BlockChain;
    use crate::{
        chain::{
            CacheConfig,
            Genesis,
        },
        test_utils::{
            ChainMaker,
            TestKey,
            funded_genesis,
            init_tracing,
            new_blockchain,
            transfer_tx,
        },
        types::BlockRef,
    };
    use alloy_primitives::{
        Address,
        U256,
    };

    fn blocks(len: usize) -> (Genesis, Vec<BlockRef>) {
        init_tracing();
        let key = TestKey::from_seed(1);
        let genesis = funded_genesis(&[&key], U256::from(1_000_000_000u64));
        let maker = ChainMaker::new(&genesis);
        let blocks = maker.generate(&maker.genesis(), len, |block| {
            let nonce = block.nonce(key.address());
            block.add_tx(transfer_tx(&key, nonce, Address::repeat_byte(0xee), 1));
        });
        (genesis, blocks)
    }

    fn on_disk(chain: &BlockChain, block: &BlockRef) -> bool {
        chain.db().read_trie_node(block.state_root()).unwrap().is_some()
    }

    #[test]
    fn archive_mode_writes_every_root_through() {
        let (genesis, blocks) = blocks(6);
        let chain = new_blockchain(&genesis, CacheConfig::default().with_archive_mode(true)).unwrap();
        chain.insert_chain(&blocks).unwrap();
        assert!(blocks.iter().all(|block| on_disk(&chain, block)));
        chain.stop();
    }

    #[test]
    fn non_archive_mode_commits_on_the_interval() {
        let (genesis, blocks) = blocks(6);
        let chain = new_blockchain(
            &genesis,
            CacheConfig::default()
                .with_block_interval(4)
                .with_parallel_db_write(false),
        )
        .unwrap();
        chain.insert_chain(&blocks).unwrap();

        assert!(on_disk(&chain, &blocks[3]));
        for block in [&blocks[2], &blocks[4], &blocks[5]] {
            assert!(!on_disk(&chain, block), "block {} flushed early", block.number());
            assert!(chain.has_state(block.state_root()));
        }
        chain.stop();
    }

    #[test]
    fn parallel_and_sequential_writes_store_the_same_block() {
        let (genesis, blocks) = blocks(2);
        for parallel in [true, false] {
            let chain = new_blockchain(
                &genesis,
                CacheConfig::default().with_parallel_db_write(parallel),
            )
            .unwrap();
            chain.insert_chain(&blocks).unwrap();
            for block in &blocks {
                let db = chain.db();
                assert!(db.read_block(block.hash(), block.number()).unwrap().is_some());
                assert_eq!(
                    db.read_receipts(block.hash(), block.number()).unwrap().map(|receipts| receipts.len()),
                    Some(1)
                );
                assert_eq!(
                    chain.get_td(block.hash(), block.number()),
                    Some(U256::from(block.number() + 1))
                );
                let tx = block.transactions()[0].hash();
                assert_eq!(chain.get_tx_and_lookup_info(tx).unwrap().1.block_hash, block.hash());
            }
            chain.stop();
        }
    }
}
