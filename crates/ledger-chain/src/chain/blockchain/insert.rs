use super::BlockChain;
use crate::{
    chain::{
        error::{
            ChainError,
            ChainResult,
            InsertError,
        },
        events::{
            ChainEvent,
            ChainHeadEvent,
            ChainSideEvent,
        },
        headerchain::WriteStatus,
        prefetcher::{
            PrefetchTask,
            spawn_followup,
        },
    },
    constants::MAX_TIME_FUTURE_BLOCKS,
    consensus::{
        ChainReader,
        ConsensusError,
    },
    metrics,
    types::{
        BlockRef,
        Header,
        Log,
    },
    utils::{
        cast::lossy_u64_to_f64,
        unix_now,
    },
    vm::VmConfig,
};
use alloy_primitives::B256;
use rayon::prelude::*;
use std::{
    sync::{
        Arc,
        atomic::{
            AtomicBool,
            Ordering,
        },
    },
    time::Instant,
};
use tracing::{
    debug,
    error,
    info,
    instrument,
    warn,
};

/// Counters of one chain insertion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InsertStats {
    /// Blocks executed and written.
    pub processed: usize,
    /// Blocks parked in the future queue.
    pub queued: usize,
    /// Blocks that were already known.
    pub ignored: usize,
    pub txs: usize,
    pub gas: u64,
}

/// Events collected while the chain mutex is held and sent after it is
/// released.
#[derive(Debug, Default)]
struct PendingEvents {
    chain: Vec<ChainEvent>,
    side: Vec<ChainSideEvent>,
    logs: Vec<Log>,
    last_canon: Option<BlockRef>,
}

impl BlockChain {
    pub(super) fn check_contiguous(chain: &[BlockRef]) -> Result<(), InsertError> {
        for index in 1..chain.len() {
            let (prev, block) = (&chain[index - 1], &chain[index]);
            if block.number() != prev.number() + 1 || block.parent_hash() != prev.hash() {
                error!(
                    target: "ledger-chain::blockchain",
                    number = block.number(),
                    hash = %block.hash(),
                    parent = %block.parent_hash(),
                    prev_number = prev.number(),
                    prev_hash = %prev.hash(),
                    "Non contiguous block insert"
                );
                return Err(InsertError::new(
                    index,
                    ChainError::NonContiguousInsert {
                        prev_index: index - 1,
                        prev_number: prev.number(),
                        prev_hash: prev.hash(),
                        index,
                        number: block.number(),
                        hash: block.hash(),
                        parent_hash: block.parent_hash(),
                    },
                ));
            }
        }
        Ok(())
    }

    /// Imports a contiguous run of blocks, executing each one on top of its
    /// parent state. Events are sent once the run is done, also when it
    /// stopped on an error.
    pub fn insert_chain(&self, chain: &[BlockRef]) -> Result<InsertStats, InsertError> {
        if chain.is_empty() {
            return Ok(InsertStats::default());
        }
        Self::check_contiguous(chain)?;

        let start = Instant::now();
        let mut stats = InsertStats::default();
        let mut events = PendingEvents::default();
        let result = {
            let _guard = self.chain_mu.lock();
            self.insert_chain_locked(chain, &mut stats, &mut events)
        };
        self.post_chain_events(events);

        if let Some(last) = chain.last() {
            info!(
                target: "ledger-chain::blockchain",
                blocks = stats.processed,
                txs = stats.txs,
                mgas = lossy_u64_to_f64(stats.gas) / 1_000_000.0,
                elapsed = ?start.elapsed(),
                number = last.number(),
                hash = %last.hash(),
                queued = stats.queued,
                ignored = stats.ignored,
                "Imported new chain segment"
            );
        }
        result.map(|()| stats)
    }

    #[instrument(skip_all, fields(first = chain.first().map(|block| block.number()), len = chain.len()), level = "debug")]
    fn insert_chain_locked(
        &self,
        chain: &[BlockRef],
        stats: &mut InsertStats,
        events: &mut PendingEvents,
    ) -> Result<(), InsertError> {
        let headers = chain
            .iter()
            .map(|block| block.header().clone())
            .collect::<Vec<Header>>();
        let verifier = self.engine.can_verify_headers_concurrently().then(|| {
            let reader: Arc<dyn ChainReader> = self.hc.clone();
            let seals = vec![true; headers.len()];
            self.engine.verify_headers(reader, headers, seals)
        });
        self.recover_senders(chain);
        let vm_config = self.vm_config();

        for (index, block) in chain.iter().enumerate() {
            if self.proc_interrupt.load(Ordering::Relaxed) {
                debug!(target: "ledger-chain::blockchain", "Premature abort during blocks processing");
                break;
            }
            if self.hc.is_bad_hash(&block.hash()) {
                let err = ChainError::BlacklistedHash(block.hash());
                self.report_block(block, &[], &err);
                return Err(InsertError::new(index, err));
            }

            let verified: ChainResult = match &verifier {
                Some((_, results)) => {
                    match results.recv() {
                        Ok(result) => result.map_err(Into::into),
                        Err(_) => Err(ConsensusError::Aborted.into()),
                    }
                }
                None => {
                    self.engine
                        .verify_header(self.hc.as_ref(), block.header(), true)
                        .map_err(Into::into)
                }
            };
            if let Err(err) = verified.and_then(|()| self.validator.validate_body(block)) {
                if err.is_known_block() {
                    if self.current_block().number() >= block.number() {
                        stats.ignored += 1;
                        continue;
                    }
                    // Known but above the head: execute it again.
                } else {
                    match err.consensus() {
                        Some(ConsensusError::FutureBlock) => {
                            let now = unix_now();
                            if block.time() > now + MAX_TIME_FUTURE_BLOCKS {
                                return Err(InsertError::new(
                                    index,
                                    ChainError::FutureBlockTooFar {
                                        number: block.number(),
                                        ahead_secs: block.time() - now,
                                    },
                                ));
                            }
                            self.future_blocks.insert(block.hash(), block.clone());
                            stats.queued += 1;
                            continue;
                        }
                        Some(ConsensusError::UnknownAncestor)
                            if self.future_blocks.contains_key(&block.parent_hash()) =>
                        {
                            self.future_blocks.insert(block.hash(), block.clone());
                            stats.queued += 1;
                            continue;
                        }
                        Some(ConsensusError::PrunedAncestor) => {
                            let executable = self
                                .import_pruned_ancestors(block, stats, events)
                                .map_err(|err| InsertError::new(index, err))?;
                            if !executable {
                                continue;
                            }
                        }
                        _ => {
                            self.report_block(block, &[], &err);
                            return Err(InsertError::new(index, err));
                        }
                    }
                }
            }

            let parent_root = match index {
                0 => {
                    block
                        .number()
                        .checked_sub(1)
                        .and_then(|number| self.hc.get_header(block.parent_hash(), number))
                        .map(|parent| parent.state_root)
                }
                _ => Some(chain[index - 1].state_root()),
            };
            let Some(parent_root) = parent_root else {
                let err = ChainError::MissingHeader(block.parent_hash());
                self.report_block(block, &[], &err);
                return Err(InsertError::new(index, err));
            };

            let followup_interrupt = Arc::new(AtomicBool::new(false));
            self.start_prefetch(
                block,
                chain.get(index + 1),
                parent_root,
                vm_config,
                &followup_interrupt,
            );

            let mut state = match self.state_at(parent_root) {
                Ok(state) => state,
                Err(err) => {
                    followup_interrupt.store(true, Ordering::Relaxed);
                    return Err(InsertError::new(index, err));
                }
            };
            let process_start = Instant::now();
            let result = match self.processor.process(block, &mut state, &vm_config) {
                Ok(result) => result,
                Err(err) => {
                    followup_interrupt.store(true, Ordering::Relaxed);
                    self.report_block(block, &[], &err);
                    return Err(InsertError::new(index, err));
                }
            };
            let execution = process_start.elapsed();
            let validate_start = Instant::now();
            if let Err(err) =
                self.validator
                    .validate_state(block, &mut state, &result.receipts, result.used_gas)
            {
                followup_interrupt.store(true, Ordering::Relaxed);
                self.report_block(block, &result.receipts, &err);
                return Err(InsertError::new(index, err));
            }
            let validation = validate_start.elapsed();
            followup_interrupt.store(true, Ordering::Relaxed);

            let write_start = Instant::now();
            let status = self
                .write_block_with_state_locked(block, &result.receipts, &mut state)
                .map_err(|err| InsertError::new(index, err))?;
            metrics::record_block_insert(execution, validation, write_start.elapsed());

            match status {
                WriteStatus::Canon => {
                    debug!(
                        target: "ledger-chain::blockchain",
                        number = block.number(),
                        hash = %block.hash(),
                        txs = block.transactions().len(),
                        gas = result.used_gas,
                        elapsed = ?process_start.elapsed(),
                        "Inserted new block"
                    );
                    if chain.len() == 1 {
                        if let Some(throttler) = self.spam_throttler.read().as_ref() {
                            throttler.update_throttler_state(block.transactions(), &result.receipts);
                        }
                    }
                    if let Err(err) = self.engine.create_snapshot(
                        self.hc.as_ref(),
                        block.number(),
                        block.hash(),
                        &[],
                    ) {
                        warn!(target: "ledger-chain::blockchain", number = block.number(), error = %err, "Failed to create consensus snapshot");
                    }
                    events.logs.extend(result.logs.iter().cloned());
                    events.chain.push(ChainEvent {
                        block: block.clone(),
                        hash: block.hash(),
                        logs: result.logs,
                        receipts: result.receipts,
                    });
                    events.last_canon = Some(block.clone());
                }
                WriteStatus::Side => {
                    debug!(
                        target: "ledger-chain::blockchain",
                        number = block.number(),
                        hash = %block.hash(),
                        diff = %block.block_score(),
                        elapsed = ?process_start.elapsed(),
                        txs = block.transactions().len(),
                        gas = result.used_gas,
                        "Inserted forked block"
                    );
                    events.side.push(ChainSideEvent {
                        block: block.clone(),
                    });
                }
                WriteStatus::NonStat => {}
            }
            stats.processed += 1;
            stats.txs += block.transactions().len();
            stats.gas += result.used_gas;
        }
        Ok(())
    }

    /// Handles a block whose parent is stored without state. A block that is
    /// not heavier than the head is stored without state as well; otherwise
    /// the missing ancestors are executed first. Returns whether the block
    /// can be executed now.
    fn import_pruned_ancestors(
        &self,
        block: &BlockRef,
        stats: &mut InsertStats,
        events: &mut PendingEvents,
    ) -> ChainResult<bool> {
        let parent_number = block.number().saturating_sub(1);
        let current = self.current_block();
        let local_td = self
            .get_td(current.hash(), current.number())
            .ok_or(ChainError::MissingTd {
                number: current.number(),
                hash: current.hash(),
            })?;
        let parent_td = self
            .get_td(block.parent_hash(), parent_number)
            .ok_or(ChainError::MissingTd {
                number: parent_number,
                hash: block.parent_hash(),
            })?;
        let extern_td = parent_td + block.block_score();
        if local_td > extern_td {
            self.write_block_without_state(block, extern_td)?;
            return Ok(false);
        }

        let mut winner = Vec::new();
        let mut parent = self
            .get_block(block.parent_hash(), parent_number)
            .ok_or(ChainError::MissingBlock {
                number: parent_number,
                hash: block.parent_hash(),
            })?;
        while !self.has_state(parent.state_root()) {
            let next = self
                .parent_block(&parent)
                .ok_or(ChainError::MissingBlock {
                    number: parent.number().saturating_sub(1),
                    hash: parent.parent_hash(),
                })?;
            winner.push(parent);
            parent = next;
        }
        winner.reverse();
        debug!(target: "ledger-chain::blockchain", count = winner.len(), number = block.number(), "Importing pruned ancestors of a heavier side chain");
        self.insert_chain_locked(&winner, stats, events)
            .map_err(|err| err.source)?;
        Ok(true)
    }

    /// Recovers senders and fee payers on the rayon pool so execution finds
    /// them cached.
    fn recover_senders(&self, chain: &[BlockRef]) {
        let chain_id = self.chain_config.chain_id;
        chain
            .par_iter()
            .flat_map(|block| block.transactions().par_iter())
            .for_each(|tx| {
                let _ = tx.sender(chain_id);
                if tx.is_fee_delegated() {
                    let _ = tx.validated_fee_payer(chain_id);
                }
            });
    }

    /// Warms the caches while `block` executes on the state at `root`. The
    /// worker pool replays the transactions of `block` itself; the next
    /// block of the run, if any, is replayed on a throwaway thread.
    fn start_prefetch(
        &self,
        block: &BlockRef,
        next: Option<&BlockRef>,
        root: B256,
        vm_config: VmConfig,
        interrupt: &Arc<AtomicBool>,
    ) {
        if let Some(pool) = self.prefetch_pool.lock().as_ref() {
            if pool.is_enabled() {
                for index in 0..block.transactions().len() {
                    pool.try_submit(PrefetchTask {
                        block: block.clone(),
                        index,
                        root,
                        interrupt: interrupt.clone(),
                    });
                }
            }
        }
        let Some(next) = next.filter(|next| !next.transactions().is_empty()) else {
            return;
        };
        match self.state_at(root) {
            Ok(throwaway) => {
                spawn_followup(
                    self.prefetcher.clone(),
                    next.clone(),
                    throwaway,
                    vm_config,
                    interrupt.clone(),
                )
            }
            Err(err) => {
                debug!(target: "ledger-chain::blockchain", root = %root, error = %err, "No state to prefetch on");
            }
        }
    }

    fn post_chain_events(&self, events: PendingEvents) {
        for event in events.chain {
            self.chain_feed.send(event);
        }
        for event in events.side {
            self.chain_side_feed.send(event);
        }
        if !events.logs.is_empty() {
            self.logs_feed.send(events.logs);
        }
        if let Some(block) = events.last_canon {
            if block.hash() == self.current_block().hash() {
                self.chain_head_feed.send(ChainHeadEvent { block });
            }
        }
    }

    /// Imports headers only, after verifying a random sample of seals.
    pub fn insert_header_chain(
        &self,
        chain: &[Header],
        check_freq: usize,
    ) -> Result<usize, InsertError> {
        let start = Instant::now();
        self.hc
            .validate_header_chain(chain, check_freq)
            .map_err(|(index, err)| InsertError::new(index, err))?;
        let _guard = self.chain_mu.lock();
        self.hc
            .insert_header_chain(chain, start)
            .map_err(|err| InsertError::new(0, err))
    }
}

#[cfg(test)]
mod tests {
    use super::BlockChain;
    use crate::{
        chain::{
            CacheConfig,
            ChainError,
        },
        constants::{
            MAX_BAD_BLOCKS,
            MAX_TIME_FUTURE_BLOCKS,
        },
        test_utils::{
            ChainMaker,
            TestKey,
            funded_genesis,
            init_tracing,
            new_blockchain,
            transfer_tx,
        },
        types::{
            Block,
            BlockRef,
        },
        utils::unix_now,
    };
    use alloy_primitives::{
        Address,
        B256,
        U256,
    };
    use std::sync::Arc;

    const TO: Address = Address::repeat_byte(0xee);

    fn setup(len: usize) -> (Arc<BlockChain>, ChainMaker, Vec<BlockRef>, TestKey) {
        init_tracing();
        let key = TestKey::from_seed(1);
        let genesis = funded_genesis(&[&key], U256::from(1_000_000_000u64));
        let maker = ChainMaker::new(&genesis);
        let blocks = maker.generate(&maker.genesis(), len, |block| {
            let nonce = block.nonce(key.address());
            block.add_tx(transfer_tx(&key, nonce, TO, 1));
        });
        let chain = new_blockchain(&genesis, CacheConfig::default()).unwrap();
        (chain, maker, blocks, key)
    }

    #[test]
    fn reimport_is_ignored() {
        let (chain, _, blocks, _) = setup(3);
        let first = chain.insert_chain(&blocks).unwrap();
        assert_eq!(first.processed, 3);
        assert_eq!(first.txs, 3);

        let again = chain.insert_chain(&blocks).unwrap();
        assert_eq!(again.processed, 0);
        assert_eq!(again.ignored, 3);
        assert_eq!(chain.current_block().hash(), blocks[2].hash());
        chain.stop();
    }

    #[test]
    fn prefetch_workers_warm_without_changing_results() {
        let (chain, _, blocks, key) = setup(4);
        let warmed = new_blockchain(
            &funded_genesis(&[&key], U256::from(1_000_000_000u64)),
            CacheConfig::default().with_prefetch_workers(2),
        )
        .unwrap();
        assert_eq!(warmed.insert_chain(&blocks).unwrap().processed, 4);
        chain.insert_chain(&blocks).unwrap();
        assert_eq!(warmed.current_block().hash(), chain.current_block().hash());
        assert_eq!(
            warmed.state().unwrap().get_balance(TO),
            chain.state().unwrap().get_balance(TO)
        );
        warmed.stop();
        chain.stop();
    }

    #[test]
    fn gapped_segment_is_rejected() {
        let (chain, _, blocks, _) = setup(3);
        let err = chain
            .insert_chain(&[blocks[0].clone(), blocks[2].clone()])
            .unwrap_err();
        assert_eq!(err.index, 1);
        assert!(matches!(err.source, ChainError::NonContiguousInsert { .. }));
        assert_eq!(chain.current_block().number(), 0);
        chain.stop();
    }

    #[test]
    fn future_blocks_are_queued_up_to_thirty_seconds() {
        let (chain, maker, _, key) = setup(0);
        let now = unix_now();
        let at_limit = maker.generate(&maker.genesis(), 1, |block| {
            block.set_time(now + MAX_TIME_FUTURE_BLOCKS);
            block.add_tx(transfer_tx(&key, 0, TO, 1));
        });
        let too_far = maker.generate(&maker.genesis(), 1, |block| {
            block.set_time(now + 3 * MAX_TIME_FUTURE_BLOCKS);
            block.set_extra(vec![1]);
        });

        let stats = chain.insert_chain(&at_limit).unwrap();
        assert_eq!(stats.queued, 1);
        assert_eq!(stats.processed, 0);
        assert!(chain.future_blocks.contains_key(&at_limit[0].hash()));
        assert_eq!(chain.current_block().number(), 0);

        let err = chain.insert_chain(&too_far).unwrap_err();
        assert!(matches!(err.source, ChainError::FutureBlockTooFar { .. }));
        assert!(!chain.future_blocks.contains_key(&too_far[0].hash()));
        chain.stop();
    }

    #[test]
    fn bad_blocks_are_recorded_and_bounded() {
        let (chain, _, blocks, _) = setup(1);
        let bad = (0u8..2 * MAX_BAD_BLOCKS as u8)
            .map(|seed| {
                let mut header = blocks[0].header().clone();
                header.extra = vec![seed].into();
                header.tx_root = B256::repeat_byte(seed.wrapping_add(1));
                Arc::new(Block::new(header, blocks[0].transactions().to_vec()))
            })
            .collect::<Vec<BlockRef>>();

        let err = chain.insert_chain(&bad[..1]).unwrap_err();
        assert!(err.source.to_string().contains("root"), "{}", err.source);
        let recorded = chain.bad_blocks();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].block.hash(), bad[0].hash());
        assert!(!recorded[0].reason.is_empty());

        for block in &bad[1..] {
            assert!(chain.insert_chain(std::slice::from_ref(block)).is_err());
        }
        chain.bad_blocks.run_pending_tasks();
        assert!(chain.bad_blocks().len() as u64 <= MAX_BAD_BLOCKS);
        assert!(chain.bad_blocks.entry_count() <= MAX_BAD_BLOCKS);

        // The good block still imports.
        chain.insert_chain(&blocks).unwrap();
        assert_eq!(chain.current_block().hash(), blocks[0].hash());
        chain.stop();
    }
}
