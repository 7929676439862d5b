//! The canonical block chain: block import, state flushing, reorgs and
//! head rewinds on top of the [`HeaderChain`].
//!
//! All writers of the canonical chain hold the chain mutex. Readers go
//! through the head pointers and the database and never take it.

mod insert;
mod reorg;
mod receipts;
mod rewind;
mod write;

pub use insert::InsertStats;
pub use receipts::set_receipts_data;

use crate::{
    chain::{
        config::CacheConfig,
        error::{
            ChainError,
            ChainResult,
        },
        events::{
            ChainEvent,
            ChainHeadEvent,
            ChainSideEvent,
            Feed,
            RemovedLogsEvent,
        },
        gc::TrieGc,
        headerchain::{
            HeaderChain,
            or_log,
        },
        migration::MigrationState,
        prefetcher::{
            PrefetchPool,
            StatePrefetcher,
        },
        processor::StateProcessor,
        validator::BlockValidator,
    },
    constants::{
        FUTURE_BLOCK_INTERVAL,
        MAX_BAD_BLOCKS,
        MAX_FUTURE_BLOCKS,
        RECV_TIMEOUT,
        WARM_UP_CACHE_RATIO,
    },
    consensus::Engine,
    db::{
        BatchTarget,
        Database,
        TxLookupEntry,
    },
    metrics,
    params::ChainConfig,
    state::{
        GcReadGuard,
        NodeIterator,
        SnapshotTree,
        StateDatabase,
        StateDb,
    },
    txpool::{
        PoolChain,
        SpamThrottler,
    },
    types::{
        BlockRef,
        Header,
        Log,
        Receipt,
        Transaction,
        init_derive_sha,
    },
    vm::{
        Vm,
        VmConfig,
    },
};
use alloy_primitives::{
    B256,
    U256,
};
use moka::sync::Cache;
use parking_lot::{
    Mutex,
    RwLock,
};
use std::{
    io::Write,
    sync::{
        Arc,
        Weak,
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
    error,
    info,
    warn,
};

const BLOCK_CACHE_LIMIT: u64 = 256;
/// Queued prefetch tasks per worker before submissions are dropped.
const PREFETCH_QUEUE_PER_WORKER: usize = 16;
/// Nodes a warm-up thread visits between cache occupancy checks.
const WARM_UP_CHECK_INTERVAL: usize = 1024;

/// A block that failed import, kept for diagnostics.
#[derive(Debug, Clone)]
pub struct BadBlock {
    pub block: BlockRef,
    pub reason: String,
}

#[derive(Debug)]
struct WarmUp {
    stop: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

/// Full-block chain manager. Shared as `Arc<BlockChain>`; background loops
/// only hold weak references.
pub struct BlockChain {
    chain_config: ChainConfig,
    cache_config: CacheConfig,
    db: Arc<Database>,
    state_db: Arc<StateDatabase>,
    hc: Arc<HeaderChain>,
    engine: Arc<dyn Engine>,
    vm_config: RwLock<VmConfig>,

    genesis: RwLock<BlockRef>,
    current_block: RwLock<BlockRef>,
    current_fast_block: RwLock<BlockRef>,

    /// Serialises every writer of the canonical chain. Shared with the state
    /// migration thread, which swaps state stores under it.
    pub(crate) chain_mu: Arc<Mutex<()>>,
    block_cache: Cache<B256, BlockRef>,
    future_blocks: Cache<B256, BlockRef>,
    bad_blocks: Cache<B256, BadBlock>,

    processor: StateProcessor,
    validator: BlockValidator,
    prefetcher: StatePrefetcher,
    prefetch_pool: Mutex<Option<PrefetchPool>>,
    gc: Mutex<Option<TrieGc>>,

    chain_feed: Feed<ChainEvent>,
    chain_head_feed: Feed<ChainHeadEvent>,
    chain_side_feed: Arc<Feed<ChainSideEvent>>,
    removed_logs_feed: Arc<Feed<RemovedLogsEvent>>,
    logs_feed: Feed<Vec<Log>>,

    spam_throttler: RwLock<Option<Arc<SpamThrottler>>>,

    proc_interrupt: Arc<AtomicBool>,
    quit: Arc<AtomicBool>,
    future_loop: Mutex<Option<JoinHandle<()>>>,
    warm_up: Mutex<Option<WarmUp>>,
    pub(crate) migration: MigrationState,
}

impl std::fmt::Debug for BlockChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let head = self.current_block();
        f.debug_struct("BlockChain")
            .field("head_number", &head.number())
            .field("head_hash", &head.hash())
            .field("archive_mode", &self.cache_config.archive_mode)
            .finish_non_exhaustive()
    }
}

impl BlockChain {
    /// Opens the chain stored in `db`. The genesis block must already be
    /// written, see [`crate::chain::Genesis::commit`].
    pub fn new(
        db: Arc<Database>,
        cache_config: CacheConfig,
        chain_config: ChainConfig,
        engine: Arc<dyn Engine>,
        vm: Arc<dyn Vm>,
    ) -> ChainResult<Arc<Self>> {
        init_derive_sha(chain_config.derive_sha_impl);
        let proc_interrupt = Arc::new(AtomicBool::new(false));
        let hc = Arc::new(HeaderChain::new(
            db.clone(),
            chain_config.clone(),
            engine.clone(),
            proc_interrupt.clone(),
        )?);
        let genesis_header = hc.genesis();
        let genesis = db
            .read_block(genesis_header.hash(), 0)?
            .map(Arc::new)
            .ok_or(ChainError::NoGenesis)?;

        let state_db = Arc::new(StateDatabase::new(
            db.clone(),
            cache_config.trie_cache_limit_mib,
        ));
        let gc = (!cache_config.archive_mode)
            .then(|| TrieGc::spawn(state_db.node_db().clone(), cache_config.tries_in_memory))
            .transpose()?;

        let vm_config = VmConfig::default();
        let prefetcher = StatePrefetcher::new(hc.clone(), vm.clone());
        let workers = match engine.prefetch_workers() {
            0 => cache_config.prefetch_workers,
            workers => workers,
        };
        let prefetch_pool = (workers > 0).then(|| {
            PrefetchPool::spawn(
                workers,
                workers * PREFETCH_QUEUE_PER_WORKER,
                prefetcher.clone(),
                state_db.clone(),
                vm_config,
            )
        });

        let chain = Arc::new(Self {
            processor: StateProcessor::new(hc.clone(), vm),
            validator: BlockValidator::new(hc.clone(), state_db.clone()),
            prefetcher,
            prefetch_pool: Mutex::new(prefetch_pool),
            gc: Mutex::new(gc),
            chain_config,
            cache_config,
            db,
            state_db,
            hc,
            engine,
            vm_config: RwLock::new(vm_config),
            current_block: RwLock::new(genesis.clone()),
            current_fast_block: RwLock::new(genesis.clone()),
            genesis: RwLock::new(genesis),
            chain_mu: Arc::new(Mutex::new(())),
            block_cache: Cache::new(BLOCK_CACHE_LIMIT),
            future_blocks: Cache::new(MAX_FUTURE_BLOCKS),
            bad_blocks: Cache::new(MAX_BAD_BLOCKS),
            chain_feed: Feed::default(),
            chain_head_feed: Feed::default(),
            chain_side_feed: Arc::new(Feed::default()),
            removed_logs_feed: Arc::new(Feed::default()),
            logs_feed: Feed::default(),
            spam_throttler: RwLock::new(None),
            proc_interrupt,
            quit: Arc::new(AtomicBool::new(false)),
            future_loop: Mutex::new(None),
            warm_up: Mutex::new(None),
            migration: MigrationState::default(),
        });
        chain.load_last_state()?;
        chain.init_snapshots()?;
        chain.spawn_future_loop()?;
        if chain.db.in_migration() {
            if let Err(err) = chain.restart_state_migration() {
                error!(target: "ledger-chain::blockchain", error = %err, "Failed to restart state migration");
            }
        }
        Ok(chain)
    }

    /// Restores the head pointers from the database, repairing a head whose
    /// state is missing. Callers hold the chain mutex or own the chain
    /// exclusively.
    pub(crate) fn load_last_state(&self) -> ChainResult {
        let head = self
            .db
            .read_head_block_hash()?
            .and_then(|hash| self.get_block_by_hash(hash));
        let Some(current) = head else {
            warn!(target: "ledger-chain::blockchain", "Head block missing, resetting chain");
            return self.reset_with_genesis_inner(self.genesis());
        };
        *self.current_block.write() = current.clone();

        if !self.has_state(current.state_root()) {
            if current.number() == 0 {
                return Err(ChainError::MissingState {
                    number: 0,
                    root: current.state_root(),
                });
            }
            warn!(
                target: "ledger-chain::blockchain",
                number = current.number(),
                hash = %current.hash(),
                "Head state missing, repairing chain"
            );
            self.rewind(current.number(), B256::ZERO, true)?;
        }
        let current = self.current_block();

        let fast = self
            .db
            .read_head_fast_block_hash()?
            .and_then(|hash| self.get_block_by_hash(hash))
            .unwrap_or_else(|| current.clone());
        *self.current_fast_block.write() = fast.clone();

        let header = self.hc.current_header();
        let header_td = self.get_td(header.hash(), header.number);
        let block_td = self.get_td(current.hash(), current.number());
        let fast_td = self.get_td(fast.hash(), fast.number());
        metrics::set_head_block(current.number());
        metrics::set_head_header(header.number);
        info!(target: "ledger-chain::blockchain", number = header.number, hash = %header.hash(), td = ?header_td, "Loaded most recent local header");
        info!(target: "ledger-chain::blockchain", number = current.number(), hash = %current.hash(), td = ?block_td, "Loaded most recent local full block");
        info!(target: "ledger-chain::blockchain", number = fast.number(), hash = %fast.hash(), td = ?fast_td, "Loaded most recent local fast block");
        Ok(())
    }

    fn init_snapshots(&self) -> ChainResult {
        if self.cache_config.snapshot_cache_mib == 0 {
            return Ok(());
        }
        let head = self.current_block();
        let recovery = self
            .db
            .read_snapshot_recovery_number()?
            .is_some_and(|number| number > head.number());
        let loaded = SnapshotTree::load(self.db.clone())?.map(Arc::new);
        let tree = match loaded {
            Some(tree) if !recovery && tree.snapshot(head.state_root()).is_some() => tree,
            _ => {
                warn!(target: "ledger-chain::blockchain", number = head.number(), root = %head.state_root(), recovery, "Regenerating state snapshot");
                let tree = SnapshotTree::new(self.db.clone(), head.state_root());
                tree.rebuild(head.state_root(), self.state_db.node_db())?;
                Arc::new(tree)
            }
        };
        if recovery {
            let mut batch = self.db.new_batch(BatchTarget::Chain);
            self.db.delete_snapshot_recovery_number(&mut batch);
            self.db.write(&batch)?;
        }
        self.state_db.set_snapshots(Some(tree));
        Ok(())
    }

    fn spawn_future_loop(self: &Arc<Self>) -> ChainResult {
        let chain: Weak<Self> = Arc::downgrade(self);
        let quit = self.quit.clone();
        let handle = std::thread::Builder::new()
            .name("future-blocks".into())
            .spawn(move || {
                let mut last = Instant::now();
                while !quit.load(Ordering::Relaxed) {
                    std::thread::sleep(RECV_TIMEOUT);
                    if last.elapsed() < FUTURE_BLOCK_INTERVAL {
                        continue;
                    }
                    last = Instant::now();
                    let Some(chain) = chain.upgrade() else {
                        return;
                    };
                    chain.proc_future_blocks();
                }
            })?;
        *self.future_loop.lock() = Some(handle);
        Ok(())
    }

    /// Retries queued future blocks in number order.
    pub fn proc_future_blocks(&self) {
        let mut blocks = self
            .future_blocks
            .iter()
            .map(|(_, block)| block)
            .collect::<Vec<_>>();
        if blocks.is_empty() {
            return;
        }
        blocks.sort_by_key(|block| block.number());
        for block in blocks {
            if let Err(err) = self.insert_chain(&[block]) {
                debug!(target: "ledger-chain::blockchain", error = %err, "Future block import failed");
            }
        }
    }

    /// Wipes the chain down to the genesis block.
    pub fn reset(&self) -> ChainResult {
        let _guard = self.chain_mu.lock();
        self.reset_with_genesis_inner(self.genesis())
    }

    /// Wipes the chain and installs `genesis` as block zero.
    pub fn reset_with_genesis_block(&self, genesis: BlockRef) -> ChainResult {
        let _guard = self.chain_mu.lock();
        self.reset_with_genesis_inner(genesis)
    }

    fn reset_with_genesis_inner(&self, genesis: BlockRef) -> ChainResult {
        self.rewind(0, B256::ZERO, false)?;

        let hash = genesis.hash();
        let mut batch = self.db.new_batch(BatchTarget::Chain);
        self.db
            .write_td(&mut batch, hash, 0, genesis.block_score());
        self.db.write_block(&mut batch, &genesis);
        self.db.write_canonical_hash(&mut batch, hash, 0);
        self.db.write_head_block_hash(&mut batch, hash);
        self.db.write_head_fast_block_hash(&mut batch, hash);
        self.db.write(&batch)?;

        *self.genesis.write() = genesis.clone();
        *self.current_block.write() = genesis.clone();
        *self.current_fast_block.write() = genesis.clone();
        self.hc.set_genesis(genesis.header().clone());
        self.hc.set_current_header(genesis.header().clone())?;
        metrics::set_head_block(0);
        Ok(())
    }

    pub fn config(&self) -> &ChainConfig {
        &self.chain_config
    }

    pub fn cache_config(&self) -> &CacheConfig {
        &self.cache_config
    }

    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn state_database(&self) -> &Arc<StateDatabase> {
        &self.state_db
    }

    pub fn header_chain(&self) -> &Arc<HeaderChain> {
        &self.hc
    }

    pub fn processor(&self) -> &StateProcessor {
        &self.processor
    }

    pub fn validator(&self) -> &BlockValidator {
        &self.validator
    }

    pub fn vm_config(&self) -> VmConfig {
        *self.vm_config.read()
    }

    pub fn set_vm_config(&self, config: VmConfig) {
        *self.vm_config.write() = config;
    }

    pub fn genesis(&self) -> BlockRef {
        self.genesis.read().clone()
    }

    pub fn current_block(&self) -> BlockRef {
        self.current_block.read().clone()
    }

    pub fn current_fast_block(&self) -> BlockRef {
        self.current_fast_block.read().clone()
    }

    pub fn current_header(&self) -> Header {
        self.hc.current_header()
    }

    /// Block hashes whose import is refused.
    pub fn set_bad_hashes(&self, hashes: impl IntoIterator<Item = B256>) {
        self.hc.set_bad_hashes(hashes);
    }

    pub fn get_block(&self, hash: B256, number: u64) -> Option<BlockRef> {
        if let Some(block) = self.block_cache.get(&hash) {
            return Some(block);
        }
        let block = Arc::new(or_log(self.db.read_block(hash, number), "block")?);
        self.block_cache.insert(hash, block.clone());
        Some(block)
    }

    pub fn get_block_by_hash(&self, hash: B256) -> Option<BlockRef> {
        let number = self.hc.get_block_number(hash)?;
        self.get_block(hash, number)
    }

    pub fn get_block_by_number(&self, number: u64) -> Option<BlockRef> {
        let hash = self.hc.get_canonical_hash(number)?;
        self.get_block(hash, number)
    }

    /// Up to `n` blocks walking back from `hash`, newest first.
    pub fn get_blocks_from_hash(&self, mut hash: B256, n: usize) -> Vec<BlockRef> {
        let mut blocks = Vec::with_capacity(n);
        let Some(mut number) = self.hc.get_block_number(hash) else {
            return blocks;
        };
        while blocks.len() < n {
            let Some(block) = self.get_block(hash, number) else {
                break;
            };
            hash = block.parent_hash();
            blocks.push(block);
            let Some(parent) = number.checked_sub(1) else {
                break;
            };
            number = parent;
        }
        blocks
    }

    /// Up to `max` ancestor hashes of `hash`, parent first.
    pub fn get_block_hashes_from_hash(&self, hash: B256, max: u64) -> Vec<B256> {
        self.hc.get_block_hashes_from_hash(hash, max)
    }

    pub fn get_header(&self, hash: B256, number: u64) -> Option<Header> {
        self.hc.get_header(hash, number)
    }

    pub fn get_header_by_hash(&self, hash: B256) -> Option<Header> {
        self.hc.get_header_by_hash(hash)
    }

    pub fn get_header_by_number(&self, number: u64) -> Option<Header> {
        self.hc.get_header_by_number(number)
    }

    pub fn get_canonical_hash(&self, number: u64) -> Option<B256> {
        self.hc.get_canonical_hash(number)
    }

    pub fn get_td(&self, hash: B256, number: u64) -> Option<U256> {
        self.hc.get_td(hash, number)
    }

    pub fn get_td_by_hash(&self, hash: B256) -> Option<U256> {
        self.hc.get_td_by_hash(hash)
    }

    pub fn get_body(&self, hash: B256) -> Option<Vec<Transaction>> {
        self.get_block_by_hash(hash)
            .map(|block| block.transactions().to_vec())
    }

    /// Receipts of a stored block with their derived fields filled in.
    pub fn get_receipts_by_block_hash(&self, hash: B256) -> Option<Vec<Receipt>> {
        let block = self.get_block_by_hash(hash)?;
        let mut receipts = or_log(self.db.read_receipts(hash, block.number()), "receipts")?;
        set_receipts_data(&self.chain_config, &block, &mut receipts);
        Some(receipts)
    }

    pub fn get_logs(&self, hash: B256) -> Vec<Vec<Log>> {
        self.get_receipts_by_block_hash(hash)
            .map(|receipts| receipts.into_iter().map(|receipt| receipt.logs).collect())
            .unwrap_or_default()
    }

    pub fn get_tx_and_lookup_info(&self, tx_hash: B256) -> Option<(Transaction, TxLookupEntry)> {
        or_log(self.db.read_tx_and_lookup_info(tx_hash), "transaction")
    }

    pub fn get_receipt_by_tx_hash(&self, tx_hash: B256) -> Option<Receipt> {
        let entry = or_log(self.db.read_tx_lookup_entry(tx_hash), "tx lookup")?;
        let receipts = self.get_receipts_by_block_hash(entry.block_hash)?;
        receipts.into_iter().nth(entry.index as usize)
    }

    pub fn has_header(&self, hash: B256, number: u64) -> bool {
        self.hc.has_header(hash, number)
    }

    pub fn has_block(&self, hash: B256, number: u64) -> bool {
        self.validator.has_block(hash, number)
    }

    pub fn has_state(&self, root: B256) -> bool {
        self.validator.has_state(root)
    }

    pub fn has_block_and_state(&self, hash: B256, number: u64) -> bool {
        self.validator.has_block_and_state(hash, number)
    }

    /// Mutable state at the current head.
    pub fn state(&self) -> ChainResult<StateDb> {
        self.state_at(self.current_block().state_root())
    }

    pub fn state_at(&self, root: B256) -> ChainResult<StateDb> {
        Ok(StateDb::new(root, self.state_db.clone())?)
    }

    /// Opens the state at `root` while holding off trie garbage collection
    /// until the returned guard is dropped.
    pub fn state_at_with_gc_lock(&self, root: B256) -> ChainResult<(StateDb, GcReadGuard)> {
        let guard = self.state_db.node_db().rlock_gc_cached_node();
        let state = self.state_at(root)?;
        Ok((state, guard))
    }

    /// Trie node or contract code by hash.
    pub fn trie_node(&self, hash: B256) -> Option<Vec<u8>> {
        if let Some(node) = or_log(self.state_db.node_db().node(hash), "trie node") {
            return Some(node.to_vec());
        }
        or_log(self.db.read_code(hash), "code")
    }

    pub fn subscribe_chain_event(&self) -> flume::Receiver<ChainEvent> {
        self.chain_feed.subscribe()
    }

    pub fn subscribe_chain_head_event(&self) -> flume::Receiver<ChainHeadEvent> {
        self.chain_head_feed.subscribe()
    }

    pub fn subscribe_chain_side_event(&self) -> flume::Receiver<ChainSideEvent> {
        self.chain_side_feed.subscribe()
    }

    pub fn subscribe_removed_logs_event(&self) -> flume::Receiver<RemovedLogsEvent> {
        self.removed_logs_feed.subscribe()
    }

    pub fn subscribe_logs_event(&self) -> flume::Receiver<Vec<Log>> {
        self.logs_feed.subscribe()
    }

    /// Most recent blocks that failed import.
    pub fn bad_blocks(&self) -> Vec<BadBlock> {
        let mut blocks = self
            .bad_blocks
            .iter()
            .map(|(_, bad)| bad)
            .collect::<Vec<_>>();
        blocks.sort_by_key(|bad| bad.block.number());
        blocks
    }

    fn report_block(&self, block: &BlockRef, receipts: &[Receipt], err: &ChainError) {
        self.bad_blocks.insert(
            block.hash(),
            BadBlock {
                block: block.clone(),
                reason: err.to_string(),
            },
        );
        metrics::record_bad_block();
        let receipt_summary = receipts
            .iter()
            .enumerate()
            .map(|(index, receipt)| format!("{index}: status {:?}, gas {}", receipt.status, receipt.gas_used))
            .collect::<Vec<_>>()
            .join("; ");
        error!(
            target: "ledger-chain::blockchain",
            number = block.number(),
            hash = %block.hash(),
            chain_id = self.chain_config.chain_id,
            receipts = %receipt_summary,
            error = %err,
            "Bad block"
        );
    }

    /// Writes the RLP of every canonical block from `first` to `last`.
    pub fn export_n(&self, out: &mut impl Write, first: u64, last: u64) -> ChainResult {
        if first > last {
            return Ok(());
        }
        info!(target: "ledger-chain::blockchain", count = last - first + 1, "Exporting batch of blocks");
        let start = Instant::now();
        for number in first..=last {
            let block = self.get_block_by_number(number).ok_or(ChainError::MissingBlock {
                number,
                hash: B256::ZERO,
            })?;
            out.write_all(&alloy_rlp::encode(block.as_ref()))?;
        }
        info!(target: "ledger-chain::blockchain", elapsed = ?start.elapsed(), "Exported blocks");
        Ok(())
    }

    /// Exports the whole canonical chain.
    pub fn export(&self, out: &mut impl Write) -> ChainResult {
        self.export_n(out, 0, self.current_block().number())
    }

    /// Fills the trie node cache from the head state on one thread per
    /// top-level subtree. Each thread stops once the cache is
    /// [`WARM_UP_CACHE_RATIO`] percent full.
    pub fn start_cache_warm_up(&self) -> ChainResult {
        let node_db = self.state_db.node_db().clone();
        if !node_db.has_clean_cache() {
            return Err(ChainError::CacheDisabled);
        }
        let mut warm_up = self.warm_up.lock();
        if warm_up.as_ref().is_some_and(|running| {
            running.workers.iter().any(|worker| !worker.is_finished())
        }) {
            return Err(ChainError::WarmUpRunning);
        }
        let root = self.current_block().state_root();
        let stop = Arc::new(AtomicBool::new(false));
        let mut workers = Vec::new();
        for (id, child) in node_db.node_children(root).into_iter().enumerate() {
            let node_db = node_db.clone();
            let stop = stop.clone();
            let handle = std::thread::Builder::new()
                .name(format!("cache-warm-up-{id}"))
                .spawn(move || {
                    let reader = node_db.clone();
                    let mut visited = 0usize;
                    for node in NodeIterator::from_node(reader, child, true) {
                        if let Err(err) = node {
                            warn!(target: "ledger-chain::blockchain", error = %err, "Cache warm-up stopped on error");
                            return;
                        }
                        visited += 1;
                        if visited % WARM_UP_CHECK_INTERVAL == 0
                            && (stop.load(Ordering::Relaxed)
                                || node_db.clean_cache_usage_percent() >= WARM_UP_CACHE_RATIO)
                        {
                            break;
                        }
                    }
                    debug!(target: "ledger-chain::blockchain", visited, usage = node_db.clean_cache_usage_percent(), "Cache warm-up thread finished");
                })?;
            workers.push(handle);
        }
        info!(target: "ledger-chain::blockchain", root = %root, threads = workers.len(), "Started trie cache warm-up");
        *warm_up = Some(WarmUp { stop, workers });
        Ok(())
    }

    /// Stops a running warm-up and waits for its threads.
    pub fn stop_cache_warm_up(&self) {
        if let Some(warm_up) = self.warm_up.lock().take() {
            warm_up.stop.store(true, Ordering::Relaxed);
            for worker in warm_up.workers {
                let _ = worker.join();
            }
        }
    }

    /// Interrupts imports, stops the background loops and flushes recent
    /// state to disk. Later calls are no-ops.
    pub fn stop(&self) {
        if self.quit.swap(true, Ordering::SeqCst) {
            return;
        }
        self.proc_interrupt.store(true, Ordering::SeqCst);
        if let Some(handle) = self.future_loop.lock().take() {
            let _ = handle.join();
        }
        // The migration thread takes the chain mutex to swap stores.
        self.quit_state_migration();
        let _guard = self.chain_mu.lock();
        if let Some(mut pool) = self.prefetch_pool.lock().take() {
            pool.stop();
        }
        self.stop_cache_warm_up();

        let queue = self.gc.lock().take().map(|mut gc| gc.stop());
        if !self.cache_config.archive_mode {
            let node_db = self.state_db.node_db();
            let head = self.current_block();
            for offset in [0, self.cache_config.tries_in_memory.saturating_sub(1)] {
                let Some(number) = head.number().checked_sub(offset) else {
                    continue;
                };
                let Some(recent) = self.get_block_by_number(number) else {
                    continue;
                };
                info!(target: "ledger-chain::blockchain", number, hash = %recent.hash(), root = %recent.state_root(), "Writing cached state to disk");
                if let Err(err) = node_db.commit(recent.state_root(), true, number) {
                    error!(target: "ledger-chain::blockchain", error = %err, "Failed to commit recent state trie");
                }
            }
            if let Some(snapshots) = self.state_db.snapshots() {
                if let Err(err) = snapshots.journal(head.state_root()) {
                    error!(target: "ledger-chain::blockchain", error = %err, "Failed to journal state snapshot");
                }
            }
            if let Some(mut queue) = queue {
                for (_, root) in queue.drain() {
                    node_db.dereference(root);
                }
            }
            let (dirty, _) = node_db.size();
            if dirty != 0 {
                error!(target: "ledger-chain::blockchain", size = dirty, "Dangling trie nodes after full cleanup");
            }
        }
        if let Err(err) = self.db.flush() {
            error!(target: "ledger-chain::blockchain", error = %err, "Failed to flush database");
        }
        info!(target: "ledger-chain::blockchain", "Blockchain stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.quit.load(Ordering::Relaxed)
    }
}

impl PoolChain for BlockChain {
    fn current_block(&self) -> BlockRef {
        BlockChain::current_block(self)
    }

    fn get_block(&self, hash: B256, number: u64) -> Option<BlockRef> {
        BlockChain::get_block(self, hash, number)
    }

    fn state_at(&self, root: B256) -> ChainResult<StateDb> {
        BlockChain::state_at(self, root)
    }

    fn subscribe_chain_head_event(&self) -> flume::Receiver<ChainHeadEvent> {
        BlockChain::subscribe_chain_head_event(self)
    }

    fn set_spam_throttler(&self, throttler: Option<Arc<SpamThrottler>>) {
        *self.spam_throttler.write() = throttler;
    }
}
