//! Online state migration: copies the state trie of one block into a fresh
//! state store while the chain keeps importing.
//!
//! Once the target exists every state write goes to both stores, so only
//! the trie at the migration block has to be copied. A [`TrieSync`] drives
//! the copy and a pool of readers fetches nodes from the current store.
//! After a walk of the copied trie confirms it is complete, the target
//! replaces the current store.

use crate::{
    chain::{
        blockchain::BlockChain,
        error::{
            ChainError,
            ChainResult,
            MigrationError,
            MigrationResult,
        },
    },
    constants::MIGRATION_MISSING_BATCH,
    db::{
        BatchTarget,
        Database,
        DatabaseResult,
    },
    metrics,
    state::{
        NodeIterator,
        NodeKind,
        NodeReader,
        SyncResult,
        TrieError,
        TrieSync,
    },
    utils::cast::lossy_usize_to_f64,
};
use alloy_primitives::B256;
use parking_lot::{
    Mutex,
    RwLock,
};
use std::{
    sync::{
        Arc,
        atomic::{
            AtomicBool,
            Ordering,
        },
    },
    thread::JoinHandle,
    time::{
        Duration,
        Instant,
    },
};
use tracing::{
    debug,
    error,
    info,
    warn,
};

const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(5);

fn migration_readers() -> usize {
    std::thread::available_parallelism().map_or(4, |threads| threads.get())
}

/// Snapshot of the migration progress.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MigrationStatus {
    pub running: bool,
    pub block_number: u64,
    pub root: B256,
    /// Trie nodes and code blobs read from the current store.
    pub read: usize,
    /// Trie nodes and code blobs written to the target.
    pub committed: usize,
    /// Scheduled entries not yet written.
    pub pending: usize,
    /// Rough completion estimate in percent.
    pub progress: f64,
    pub elapsed: Duration,
    /// Failure of the last run, if any.
    pub error: Option<String>,
}

/// Halt flags of a running migration. `quit` marks a node shutdown: the
/// target and the persisted migration number survive it, so the next start
/// resumes the copy.
#[derive(Debug, Clone, Default)]
struct MigrationSignals {
    stop: Arc<AtomicBool>,
    quit: Arc<AtomicBool>,
}

#[derive(Debug)]
struct MigrationWorker {
    signals: MigrationSignals,
    handle: JoinHandle<()>,
}

/// Migration bookkeeping owned by the chain.
#[derive(Debug, Default)]
pub(crate) struct MigrationState {
    status: Arc<RwLock<MigrationStatus>>,
    worker: Mutex<Option<MigrationWorker>>,
    /// Set by [`BlockChain::prepare_state_migration`]; the next written
    /// block starts the migration.
    prepared: AtomicBool,
}

impl MigrationState {
    fn is_running(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .is_some_and(|worker| !worker.handle.is_finished())
    }

    pub(crate) fn take_prepared(&self) -> bool {
        self.prepared.swap(false, Ordering::SeqCst)
    }
}

/// Reads trie nodes and code from the migration target only.
struct MigrationReader(Arc<Database>);

impl NodeReader for MigrationReader {
    fn read_node(&self, hash: B256) -> DatabaseResult<Option<Arc<[u8]>>> {
        Ok(self.0.read_trie_node_from_migration(hash)?.map(Arc::from))
    }

    fn read_code(&self, code_hash: B256) -> DatabaseResult<Option<Vec<u8>>> {
        self.0.read_code_from_migration(code_hash)
    }
}

impl BlockChain {
    /// Arms a migration that starts with the next written block.
    pub fn prepare_state_migration(&self) -> ChainResult {
        if self.db().in_migration() || self.migration.is_running() {
            return Err(MigrationError::AlreadyRunning.into());
        }
        if self.migration.prepared.swap(true, Ordering::SeqCst) {
            return Err(MigrationError::AlreadyRunning.into());
        }
        info!(
            target: "ledger-chain::migration",
            expected_block = self.current_block().number() + 1,
            "State migration is prepared"
        );
        Ok(())
    }

    /// Starts copying the state trie at `root`, the state of block
    /// `block_number`, into a new state store.
    pub fn start_state_migration(&self, block_number: u64, root: B256) -> ChainResult {
        let mut worker = self.migration.worker.lock();
        if worker
            .as_ref()
            .is_some_and(|running| !running.handle.is_finished())
        {
            return Err(MigrationError::AlreadyRunning.into());
        }
        if !self.has_state(root) {
            return Err(MigrationError::MissingRoot(root).into());
        }
        let db = self.db().clone();
        if db.read_trie_node_from_current(root)?.is_none() {
            self.state_database()
                .node_db()
                .commit(root, true, block_number)?;
        }
        if !db.in_migration() {
            db.create_migration_store(block_number)?;
        }

        *self.migration.status.write() = MigrationStatus {
            running: true,
            block_number,
            root,
            ..Default::default()
        };
        let signals = MigrationSignals::default();
        let status = self.migration.status.clone();
        let chain_mu = self.chain_mu.clone();
        let handle = {
            let signals = signals.clone();
            std::thread::Builder::new()
                .name("state-migration".into())
                .spawn(move || run_migration(&db, &chain_mu, block_number, root, &signals, &status))
                .map_err(MigrationError::Spawn)?
        };
        *worker = Some(MigrationWorker { signals, handle });
        info!(target: "ledger-chain::migration", block_number, root = %root, "State migration started");
        Ok(())
    }

    /// Stops a running migration and discards its target.
    pub fn stop_state_migration(&self) -> ChainResult {
        let Some(worker) = self.migration.worker.lock().take() else {
            return Err(MigrationError::NotRunning.into());
        };
        if worker.handle.is_finished() {
            let _ = worker.handle.join();
            return Err(MigrationError::NotRunning.into());
        }
        worker.signals.stop.store(true, Ordering::SeqCst);
        let _ = worker.handle.join();
        info!(target: "ledger-chain::migration", "State migration stopped");
        Ok(())
    }

    /// Ends the copy for a node shutdown. The target and the persisted
    /// migration number are kept, so the next start restarts the migration.
    pub(crate) fn quit_state_migration(&self) {
        let Some(worker) = self.migration.worker.lock().take() else {
            return;
        };
        worker.signals.quit.store(true, Ordering::SeqCst);
        worker.signals.stop.store(true, Ordering::SeqCst);
        let _ = worker.handle.join();
        debug!(target: "ledger-chain::migration", "State migration thread quit");
    }

    /// Resumes a migration that was interrupted by a restart.
    pub fn restart_state_migration(&self) -> ChainResult {
        let Some(block_number) = self.db().migration_block_number() else {
            return Err(MigrationError::NotRunning.into());
        };
        let block = self
            .get_block_by_number(block_number)
            .ok_or(ChainError::MissingBlock {
                number: block_number,
                hash: B256::ZERO,
            })?;
        info!(target: "ledger-chain::migration", block_number, "Restarting state migration");
        self.start_state_migration(block_number, block.state_root())
    }

    pub fn state_migration_status(&self) -> MigrationStatus {
        self.migration.status.read().clone()
    }

    /// Waits for the running migration, if any, to finish.
    pub fn wait_state_migration(&self) {
        if let Some(worker) = self.migration.worker.lock().take() {
            let _ = worker.handle.join();
        }
    }
}

fn run_migration(
    db: &Arc<Database>,
    chain_mu: &Mutex<()>,
    block_number: u64,
    root: B256,
    signals: &MigrationSignals,
    status: &RwLock<MigrationStatus>,
) {
    let start = Instant::now();
    let stop = signals.stop.as_ref();
    let result = copy_state(db, root, stop, status).and_then(|()| check_copied_state(db, root, stop));
    if matches!(result, Err(MigrationError::Stopped)) && signals.quit.load(Ordering::SeqCst) {
        let mut status = status.write();
        status.running = false;
        status.elapsed = start.elapsed();
        info!(
            target: "ledger-chain::migration",
            block_number,
            committed = status.committed,
            "State migration interrupted by shutdown, resuming on next start"
        );
        return;
    }

    {
        let _guard = chain_mu.lock();
        if let Err(err) = db.finish_state_migration(result.is_ok()) {
            error!(target: "ledger-chain::migration", error = %err, "Failed to finish state migration");
        }
    }

    let mut status = status.write();
    status.running = false;
    status.elapsed = start.elapsed();
    match result {
        Ok(()) => {
            status.progress = 100.0;
            status.pending = 0;
            metrics::set_migration_progress(100.0);
            info!(
                target: "ledger-chain::migration",
                block_number,
                root = %root,
                read = status.read,
                committed = status.committed,
                elapsed = ?status.elapsed,
                "State migration completed"
            );
        }
        Err(MigrationError::Stopped) => {
            status.error = Some(MigrationError::Stopped.to_string());
            warn!(target: "ledger-chain::migration", block_number, "State migration stopped before completion");
        }
        Err(err) => {
            error!(target: "ledger-chain::migration", block_number, error = %err, "State migration failed");
            status.error = Some(err.to_string());
        }
    }
}

/// Copies every node reachable from `root` into the migration target.
fn copy_state(
    db: &Arc<Database>,
    root: B256,
    stop: &AtomicBool,
    status: &RwLock<MigrationStatus>,
) -> MigrationResult {
    let (request_tx, request_rx) = flume::unbounded::<(B256, NodeKind)>();
    let (result_tx, result_rx) = flume::unbounded::<MigrationResult<SyncResult>>();
    let reader_count = migration_readers();
    let mut readers = Vec::with_capacity(reader_count);
    for id in 0..reader_count {
        let db = db.clone();
        let requests = request_rx.clone();
        let results = result_tx.clone();
        let reader = std::thread::Builder::new()
            .name(format!("migration-reader-{id}"))
            .spawn(move || {
                while let Ok((hash, kind)) = requests.recv() {
                    let read = match kind {
                        NodeKind::Trie => db.read_trie_node_from_current(hash),
                        NodeKind::Code => db.read_code_from_current(hash),
                    };
                    let result = match read {
                        Ok(Some(data)) => Ok(SyncResult { hash, data }),
                        Ok(None) => Err(MigrationError::ReadFailed {
                            hash,
                            reason: "not found".into(),
                        }),
                        Err(err) => Err(MigrationError::ReadFailed {
                            hash,
                            reason: err.to_string(),
                        }),
                    };
                    if results.send(result).is_err() {
                        return;
                    }
                }
            })
            .map_err(MigrationError::Spawn)?;
        readers.push(reader);
    }
    drop(result_tx);

    let outcome = drive_sync(db, root, stop, status, &request_tx, &result_rx);
    drop(request_tx);
    for reader in readers {
        let _ = reader.join();
    }
    outcome
}

fn drive_sync(
    db: &Database,
    root: B256,
    stop: &AtomicBool,
    status: &RwLock<MigrationStatus>,
    requests: &flume::Sender<(B256, NodeKind)>,
    results: &flume::Receiver<MigrationResult<SyncResult>>,
) -> MigrationResult {
    let mut sync = TrieSync::new(root);
    let mut batch = db.new_batch(BatchTarget::StateTrie);
    let start = Instant::now();
    let mut last_log = Instant::now();
    let mut read = 0usize;
    loop {
        if stop.load(Ordering::Relaxed) {
            return Err(MigrationError::Stopped);
        }
        let missing = sync.missing(MIGRATION_MISSING_BATCH);
        if missing.is_empty() {
            break;
        }
        let count = missing.len();
        for request in missing {
            requests.send(request).map_err(|_| MigrationError::Stopped)?;
        }
        let mut fetched = Vec::with_capacity(count);
        for _ in 0..count {
            fetched.push(results.recv().map_err(|_| MigrationError::Stopped)??);
        }
        read += fetched.len();
        sync.process(fetched)?;
        sync.commit(db, &mut batch);
        if batch.over_threshold() {
            db.write_to_migration(&batch)?;
            batch.reset();
        }

        let committed = sync.committed();
        let pending = sync.pending();
        let progress = 100.0 * lossy_usize_to_f64(committed)
            / lossy_usize_to_f64((committed + pending).max(1));
        metrics::set_migration_progress(progress);
        {
            let mut status = status.write();
            status.read = read;
            status.committed = committed;
            status.pending = pending;
            status.progress = progress;
            status.elapsed = start.elapsed();
        }
        if last_log.elapsed() >= PROGRESS_LOG_INTERVAL {
            last_log = Instant::now();
            info!(target: "ledger-chain::migration", read, committed, pending, progress, elapsed = ?start.elapsed(), "State migration progress");
        }
    }
    sync.commit(db, &mut batch);
    db.write_to_migration(&batch)?;
    if sync.pending() != 0 {
        warn!(target: "ledger-chain::migration", pending = sync.pending(), "State migration ended with unresolved entries");
    }
    Ok(())
}

/// Walks the copied trie and compares every entry with the current store.
fn check_copied_state(db: &Arc<Database>, root: B256, stop: &AtomicBool) -> MigrationResult {
    let start = Instant::now();
    let reader: Arc<dyn NodeReader> = Arc::new(MigrationReader(db.clone()));
    let mut checked = 0usize;
    for node in NodeIterator::new_state(reader, root) {
        if stop.load(Ordering::Relaxed) {
            return Err(MigrationError::Stopped);
        }
        let node = node.map_err(|err| {
            match err {
                TrieError::MissingNode(hash) => MigrationError::MissingNode(hash),
                other => MigrationError::Trie(other),
            }
        })?;
        let current = match node.kind {
            NodeKind::Trie => db.read_trie_node_from_current(node.hash)?,
            NodeKind::Code => db.read_code_from_current(node.hash)?,
        };
        if current.as_deref() != Some(&node.blob[..]) {
            return Err(MigrationError::NodeMismatch(node.hash));
        }
        checked += 1;
    }
    debug!(target: "ledger-chain::migration", checked, elapsed = ?start.elapsed(), "Checked migrated state");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        chain::{
            CacheConfig,
            Genesis,
        },
        params::ChainConfig,
        test_utils::{
            TEST_CHAIN_ID,
            init_tracing,
            new_blockchain,
            new_blockchain_on,
        },
    };
    use alloy_primitives::{
        Address,
        U256,
    };

    fn funded_genesis(accounts: u64) -> Genesis {
        (1..=accounts).fold(
            Genesis::new(ChainConfig::default().with_chain_id(TEST_CHAIN_ID)),
            |genesis, seed| {
                genesis.with_balance(
                    Address::left_padding_from(&seed.to_be_bytes()),
                    U256::from(seed),
                )
            },
        )
    }

    fn assert_balances(chain: &BlockChain, accounts: u64) {
        let mut state = chain.state().unwrap();
        for seed in 1..=accounts {
            let address = Address::left_padding_from(&seed.to_be_bytes());
            assert_eq!(state.get_balance(address), U256::from(seed));
        }
    }

    #[test]
    fn migration_copies_the_state_and_swaps_stores() {
        init_tracing();
        let chain = new_blockchain(&funded_genesis(64), CacheConfig::default()).unwrap();
        let root = chain.genesis().state_root();

        chain.start_state_migration(0, root).unwrap();
        chain.wait_state_migration();

        let status = chain.state_migration_status();
        assert!(!status.running);
        assert_eq!(status.error, None);
        assert_eq!(status.progress, 100.0);
        assert!(status.read > 0);
        assert_eq!(status.read, status.committed);
        assert!(!chain.db().in_migration());
        assert_eq!(chain.db().migration_block_number(), None);
        assert_balances(&chain, 64);
        chain.stop();
    }

    #[test]
    fn second_migration_is_rejected_while_one_is_pending() {
        init_tracing();
        let chain = new_blockchain(&funded_genesis(4), CacheConfig::default()).unwrap();
        chain.db().create_migration_store(0).unwrap();
        assert!(chain.prepare_state_migration().is_err());
        chain.stop();
    }

    #[test]
    fn user_stop_discards_the_target() {
        init_tracing();
        let chain = new_blockchain(&funded_genesis(8), CacheConfig::default()).unwrap();
        let root = chain.genesis().state_root();
        chain.db().create_migration_store(0).unwrap();

        let signals = MigrationSignals::default();
        signals.stop.store(true, Ordering::SeqCst);
        let status = RwLock::new(MigrationStatus::default());
        run_migration(chain.db(), &chain.chain_mu, 0, root, &signals, &status);

        assert!(!chain.db().in_migration());
        assert_eq!(
            status.read().error.as_deref(),
            Some("State migration was stopped")
        );
        assert_balances(&chain, 8);
        chain.stop();
    }

    #[test]
    fn shutdown_keeps_the_migration_for_the_next_start() {
        init_tracing();
        let genesis = funded_genesis(8);
        let db = Arc::new(Database::new_in_memory());
        let chain = new_blockchain_on(db.clone(), &genesis, CacheConfig::default()).unwrap();
        let root = chain.genesis().state_root();
        db.create_migration_store(0).unwrap();

        let signals = MigrationSignals::default();
        signals.quit.store(true, Ordering::SeqCst);
        signals.stop.store(true, Ordering::SeqCst);
        let status = RwLock::new(MigrationStatus::default());
        run_migration(&db, &chain.chain_mu, 0, root, &signals, &status);

        assert_eq!(db.migration_block_number(), Some(0));
        assert_eq!(status.read().error, None);
        chain.stop();
        assert_eq!(db.migration_block_number(), Some(0));

        // Reopening restarts the copy and completes it.
        let reopened = new_blockchain_on(db.clone(), &genesis, CacheConfig::default()).unwrap();
        reopened.wait_state_migration();
        assert!(!db.in_migration());
        assert_eq!(reopened.state_migration_status().error, None);
        assert_balances(&reopened, 8);
        reopened.stop();
    }
}
