use super::BlockChain;
use crate::{
    chain::{
        error::{
            ChainError,
            ChainResult,
        },
        events::{
            ChainSideEvent,
            RemovedLogsEvent,
        },
    },
    constants::REORG_WARN_DEPTH,
    db::BatchTarget,
    metrics,
    types::{
        BlockRef,
        Log,
    },
};
use alloy_primitives::B256;
use std::collections::HashSet;
use tracing::{
    debug,
    error,
    warn,
};

impl BlockChain {
    /// Replaces the canonical segment ending in `old_block` with the one
    /// ending in `new_block`.
    ///
    /// Every block of the new segment below `new_block` becomes canonical
    /// here; `new_block` itself is inserted by the caller. Transactions that
    /// only lived on the old segment lose their lookup entries, and removed
    /// logs and side events for the dropped blocks are sent from a separate
    /// thread once the database is updated.
    pub(super) fn reorg(&self, old_block: BlockRef, new_block: BlockRef) -> ChainResult {
        let mut old_chain = Vec::new();
        let mut new_chain = Vec::new();
        let mut deleted_txs = Vec::new();
        let mut deleted_logs = Vec::new();

        let mut old = old_block;
        let mut new = new_block;
        if old.number() > new.number() {
            while old.number() > new.number() {
                self.collect_dropped(&old, &mut deleted_txs, &mut deleted_logs);
                old_chain.push(old.clone());
                old = self.parent_block(&old).ok_or(ChainError::InvalidOldChain)?;
            }
        } else {
            while new.number() > old.number() {
                new_chain.push(new.clone());
                new = self.parent_block(&new).ok_or(ChainError::InvalidNewChain)?;
            }
        }
        let common = loop {
            if old.hash() == new.hash() {
                break old;
            }
            self.collect_dropped(&old, &mut deleted_txs, &mut deleted_logs);
            old_chain.push(old.clone());
            new_chain.push(new.clone());
            old = self.parent_block(&old).ok_or(ChainError::InvalidOldChain)?;
            new = self.parent_block(&new).ok_or(ChainError::InvalidNewChain)?;
        };

        if let (Some(dropped), Some(added)) = (old_chain.first(), new_chain.first()) {
            if old_chain.len() > REORG_WARN_DEPTH {
                warn!(
                    target: "ledger-chain::blockchain",
                    number = common.number(),
                    hash = %common.hash(),
                    drop = old_chain.len(),
                    dropfrom = %dropped.hash(),
                    add = new_chain.len(),
                    addfrom = %added.hash(),
                    "Large chain reorg detected"
                );
            } else {
                debug!(
                    target: "ledger-chain::blockchain",
                    number = common.number(),
                    hash = %common.hash(),
                    drop = old_chain.len(),
                    dropfrom = %dropped.hash(),
                    add = new_chain.len(),
                    addfrom = %added.hash(),
                    "Chain split detected"
                );
            }
        } else {
            error!(
                target: "ledger-chain::blockchain",
                old_len = old_chain.len(),
                new_len = new_chain.len(),
                "Impossible reorg, please file an issue"
            );
        }

        let mut added_txs = HashSet::new();
        let mut batch = self.db.new_batch(BatchTarget::Chain);
        for block in new_chain.iter().skip(1).rev() {
            self.insert(block)?;
            self.db.write_tx_lookup_entries(&mut batch, block);
        }
        for block in &new_chain {
            added_txs.extend(block.transactions().iter().map(|tx| tx.hash()));
        }
        for hash in deleted_txs.iter().filter(|hash| !added_txs.contains(*hash)) {
            self.db.delete_tx_lookup_entry(&mut batch, *hash);
        }
        // Canonical entries above the new head belong to the old segment.
        let head_number = new_chain
            .first()
            .map_or(common.number(), |block| block.number());
        let mut stale = head_number + 1;
        while self.hc.get_canonical_hash(stale).is_some() {
            self.db.delete_canonical_hash(&mut batch, stale);
            stale += 1;
        }
        self.db.write(&batch)?;
        metrics::record_reorg(new_chain.len(), old_chain.len());

        let removed_logs = self.removed_logs_feed.clone();
        let side = self.chain_side_feed.clone();
        let spawned = std::thread::Builder::new()
            .name("reorg-events".into())
            .spawn(move || {
                if !deleted_logs.is_empty() {
                    removed_logs.send(RemovedLogsEvent { logs: deleted_logs });
                }
                for block in old_chain {
                    side.send(ChainSideEvent { block });
                }
            });
        if let Err(err) = spawned {
            warn!(target: "ledger-chain::blockchain", error = ?err, "Failed to dispatch reorg events");
        }
        Ok(())
    }

    fn collect_dropped(&self, block: &BlockRef, txs: &mut Vec<B256>, logs: &mut Vec<Log>) {
        txs.extend(block.transactions().iter().map(|tx| tx.hash()));
        let Some(receipts) = self.get_receipts_by_block_hash(block.hash()) else {
            return;
        };
        for receipt in receipts {
            logs.extend(receipt.logs.into_iter().map(|mut log| {
                log.removed = true;
                log
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        chain::CacheConfig,
        test_utils::{
            ChainMaker,
            TestKey,
            funded_genesis,
            init_tracing,
            new_blockchain,
            transfer_tx,
        },
    };
    use alloy_primitives::{
        Address,
        U256,
    };

    #[test]
    fn heavier_shorter_fork_drops_the_stale_tail() {
        init_tracing();
        let key = TestKey::from_seed(1);
        let genesis = funded_genesis(&[&key], U256::from(1_000_000_000u64));
        let maker = ChainMaker::new(&genesis);
        let long = maker.generate(&maker.genesis(), 5, |block| {
            let nonce = block.nonce(key.address());
            block.add_tx(transfer_tx(&key, nonce, Address::repeat_byte(0xaa), 1));
        });
        let heavy = maker.generate(&long[0], 2, |block| {
            block.set_block_score(U256::from(10));
            let nonce = block.nonce(key.address());
            block.add_tx(transfer_tx(&key, nonce, Address::repeat_byte(0xbb), 1));
        });

        let chain = new_blockchain(&genesis, CacheConfig::default()).unwrap();
        chain.insert_chain(&long).unwrap();
        chain.insert_chain(&heavy).unwrap();

        assert_eq!(chain.current_block().hash(), heavy[1].hash());
        assert_eq!(chain.get_canonical_hash(1), Some(long[0].hash()));
        assert_eq!(chain.get_canonical_hash(2), Some(heavy[0].hash()));
        assert_eq!(chain.get_canonical_hash(3), Some(heavy[1].hash()));
        for number in 4..=5 {
            assert_eq!(chain.get_canonical_hash(number), None);
        }
        for block in &long[1..] {
            let tx = block.transactions()[0].hash();
            assert!(chain.get_tx_and_lookup_info(tx).is_none());
        }
        assert!(chain.get_tx_and_lookup_info(long[0].transactions()[0].hash()).is_some());
        let mut state = chain.state().unwrap();
        assert_eq!(state.get_balance(Address::repeat_byte(0xaa)), U256::from(1));
        assert_eq!(state.get_balance(Address::repeat_byte(0xbb)), U256::from(2));
        chain.stop();
    }
}
