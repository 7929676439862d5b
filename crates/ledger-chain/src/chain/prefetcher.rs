//! Speculative execution on throwaway state to warm the shared caches.

use crate::{
    chain::{
        headerchain::HeaderChain,
        state_transition::apply_transaction,
    },
    metrics,
    state::{
        StateDatabase,
        StateDb,
    },
    types::{
        Block,
        BlockRef,
    },
    vm::{
        Vm,
        VmConfig,
    },
};
use alloy_primitives::B256;
use std::{
    sync::{
        Arc,
        atomic::{
            AtomicBool,
            Ordering,
        },
    },
    thread::JoinHandle,
    time::Instant,
};
use tracing::{
    debug,
    trace,
};

/// Runs transactions against state that is discarded afterwards. Only the
/// caches behind the state database are affected.
#[derive(Debug, Clone)]
pub struct StatePrefetcher {
    chain: Arc<HeaderChain>,
    vm: Arc<dyn Vm>,
}

impl StatePrefetcher {
    pub fn new(chain: Arc<HeaderChain>, vm: Arc<dyn Vm>) -> Self {
        Self { chain, vm }
    }

    /// Executes the transactions of `block` in order, stopping as soon as
    /// `interrupt` is set.
    pub fn prefetch(
        &self,
        block: &Block,
        state: &mut StateDb,
        vm_config: &VmConfig,
        interrupt: &AtomicBool,
    ) {
        let start = Instant::now();
        for index in 0..block.transactions().len() {
            if interrupt.load(Ordering::Relaxed) {
                trace!(target: "ledger-chain::prefetcher", number = block.number(), index, "Prefetch interrupted");
                return;
            }
            self.prefetch_tx(block, index, state, vm_config);
        }
        metrics::record_prefetch(start.elapsed());
    }

    /// Executes a single transaction. Failures are expected on speculative
    /// state and ignored.
    pub fn prefetch_tx(&self, block: &Block, index: usize, state: &mut StateDb, vm_config: &VmConfig) {
        let Some(tx) = block.transactions().get(index) else {
            return;
        };
        let Ok(author) = self.chain.engine().author(block.header()) else {
            return;
        };
        state.prepare(tx.hash(), block.hash(), u32::try_from(index).unwrap_or(u32::MAX));
        let mut used_gas = 0;
        if let Err(err) = apply_transaction(
            self.chain.config(),
            self.vm.as_ref(),
            author,
            state,
            block.header(),
            tx,
            &mut used_gas,
            vm_config,
        ) {
            trace!(target: "ledger-chain::prefetcher", hash = %tx.hash(), error = %err, "Prefetched transaction failed");
        }
    }
}

/// One transaction to warm up.
#[derive(Debug, Clone)]
pub struct PrefetchTask {
    pub block: BlockRef,
    pub index: usize,
    /// State the transaction runs on.
    pub root: B256,
    pub interrupt: Arc<AtomicBool>,
}

/// Bounded worker pool fed with single-transaction prefetch tasks.
#[derive(Debug)]
pub struct PrefetchPool {
    sender: Option<flume::Sender<PrefetchTask>>,
    workers: Vec<JoinHandle<()>>,
}

impl PrefetchPool {
    pub fn spawn(
        workers: usize,
        capacity: usize,
        prefetcher: StatePrefetcher,
        state_db: Arc<StateDatabase>,
        vm_config: VmConfig,
    ) -> Self {
        let (sender, receiver) = flume::bounded::<PrefetchTask>(capacity.max(1));
        let handles = (0..workers)
            .filter_map(|id| {
                let receiver = receiver.clone();
                let prefetcher = prefetcher.clone();
                let state_db = state_db.clone();
                std::thread::Builder::new()
                    .name(format!("prefetch-worker-{id}"))
                    .spawn(move || {
                        // A closed channel ends the worker.
                        while let Ok(task) = receiver.recv() {
                            if task.interrupt.load(Ordering::Relaxed) {
                                continue;
                            }
                            let Ok(mut state) = StateDb::new(task.root, state_db.clone()) else {
                                continue;
                            };
                            prefetcher.prefetch_tx(&task.block, task.index, &mut state, &vm_config);
                        }
                    })
                    .inspect_err(|err| {
                        debug!(target: "ledger-chain::prefetcher", error = ?err, "Failed to spawn prefetch worker");
                    })
                    .ok()
            })
            .collect::<Vec<_>>();
        Self {
            sender: (!handles.is_empty()).then_some(sender),
            workers: handles,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.sender.is_some()
    }

    /// Queues a task without blocking. Returns false when it was dropped.
    pub fn try_submit(&self, task: PrefetchTask) -> bool {
        self.sender
            .as_ref()
            .is_some_and(|sender| sender.try_send(task).is_ok())
    }

    /// Closes the queue and waits for the workers.
    pub fn stop(&mut self) {
        self.sender = None;
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for PrefetchPool {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Prefetches `block` on a background thread against `state`.
pub(crate) fn spawn_followup(
    prefetcher: StatePrefetcher,
    block: BlockRef,
    state: StateDb,
    vm_config: VmConfig,
    interrupt: Arc<AtomicBool>,
) {
    let spawned = std::thread::Builder::new()
        .name("prefetch-followup".into())
        .spawn(move || {
            let mut state = state;
            prefetcher.prefetch(&block, &mut state, &vm_config, &interrupt);
        });
    if let Err(err) = spawned {
        debug!(target: "ledger-chain::prefetcher", error = ?err, "Failed to spawn followup prefetch");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        chain::{
            BlockChain,
            CacheConfig,
            Genesis,
        },
        params::ChainConfig,
        test_utils::{
            ChainMaker,
            TEST_CHAIN_ID,
            TestKey,
            init_tracing,
            new_blockchain,
        },
        types::{
            LegacyTx,
            TxData,
        },
        vm::ReferenceVm,
    };
    use alloy_primitives::{
        Address,
        Bytes,
        TxKind,
        U256,
    };

    struct Fixture {
        chain: Arc<BlockChain>,
        block: BlockRef,
        sender: Address,
    }

    /// Chain at genesis plus an unimported block with three transfers.
    fn fixture() -> Fixture {
        init_tracing();
        let key = TestKey::from_seed(1);
        let genesis = Genesis::new(
            ChainConfig::default()
                .with_chain_id(TEST_CHAIN_ID)
                .with_unit_price(1),
        )
        .with_balance(key.address(), U256::from(1_000_000_000u64));
        let maker = ChainMaker::new(&genesis);
        let block = maker
            .generate(&maker.genesis(), 1, |block| {
                for nonce in 0..3 {
                    block.add_tx(key.sign(TxData::Legacy(LegacyTx {
                        nonce,
                        gas_price: U256::from(1),
                        gas: 21_000,
                        to: TxKind::Call(Address::repeat_byte(0xee)),
                        value: U256::from(1),
                        input: Bytes::new(),
                    })));
                }
            })
            .remove(0);
        let chain = new_blockchain(&genesis, CacheConfig::default()).unwrap();
        Fixture {
            chain,
            block,
            sender: key.address(),
        }
    }

    fn prefetcher(chain: &BlockChain) -> StatePrefetcher {
        StatePrefetcher::new(chain.header_chain().clone(), Arc::new(ReferenceVm))
    }

    #[test]
    fn prefetch_executes_on_the_copy_only() {
        let Fixture { chain, block, sender } = fixture();
        let mut copy = chain.state().unwrap();
        prefetcher(&chain).prefetch(&block, &mut copy, &VmConfig::default(), &AtomicBool::new(false));

        assert_eq!(copy.get_nonce(sender), 3);
        assert_eq!(chain.state().unwrap().get_nonce(sender), 0);
        assert_eq!(chain.current_block().number(), 0);
        chain.stop();
    }

    #[test]
    fn interrupted_prefetch_abandons_the_block() {
        let Fixture { chain, block, sender } = fixture();
        let mut copy = chain.state().unwrap();
        prefetcher(&chain).prefetch(&block, &mut copy, &VmConfig::default(), &AtomicBool::new(true));

        assert_eq!(copy.get_nonce(sender), 0);
        chain.stop();
    }

    #[test]
    fn pool_drops_tasks_once_stopped() {
        let Fixture { chain, block, .. } = fixture();
        let mut pool = PrefetchPool::spawn(
            2,
            4,
            prefetcher(&chain),
            chain.state_database().clone(),
            VmConfig::default(),
        );
        assert!(pool.is_enabled());
        let task = PrefetchTask {
            block: block.clone(),
            index: 0,
            root: chain.genesis().state_root(),
            interrupt: Arc::new(AtomicBool::new(true)),
        };
        assert!(pool.try_submit(task.clone()));

        pool.stop();
        assert!(!pool.is_enabled());
        assert!(!pool.try_submit(task));
        chain.stop();
    }
}
