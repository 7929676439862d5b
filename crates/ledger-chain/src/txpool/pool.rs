//! Transaction pool: executable (`pending`) and future (`queue`) transactions
//! per account, price-based eviction and a journal of local submissions.

use crate::{
    chain::{
        ChainHeadEvent,
        ChainResult,
        Feed,
        NewTxsEvent,
    },
    constants::{
        DEMOTE_FULL_VALIDATION_LIMIT,
        MAX_REORG_REINJECT_DEPTH,
        MAX_TX_DATA_SIZE,
        RECV_TIMEOUT,
        TX_MSG_CHAN_SIZE,
    },
    metrics,
    params::ChainConfig,
    state::StateDb,
    txpool::{
        config::TxPoolConfig,
        error::{
            ThrottlerError,
            TxPoolError,
            TxPoolResult,
        },
        journal::TxJournal,
        list::{
            AccountSet,
            PricedList,
            TxList,
        },
        noncer::Noncer,
        throttler::{
            SpamThrottler,
            ThrottlerConfig,
        },
    },
    types::{
        BlockRef,
        Header,
        Transaction,
        TxType,
    },
};
use alloy_primitives::{
    Address,
    B256,
    U256,
};
use dashmap::DashMap;
use flume::{
    RecvTimeoutError,
    TrySendError,
};
use parking_lot::{
    Mutex,
    RwLock,
};
use rayon::prelude::*;
use std::{
    collections::{
        BinaryHeap,
        HashMap,
        HashSet,
    },
    fmt,
    sync::{
        Arc,
        Weak,
        atomic::{
            AtomicBool,
            Ordering,
        },
    },
    thread::{
        self,
        JoinHandle,
    },
    time::{
        Duration,
        Instant,
    },
};
use tracing::{
    debug,
    error,
    info,
    instrument,
    trace,
    warn,
};

const STATS_REPORT_INTERVAL: Duration = Duration::from_secs(8);
const EVICTION_INTERVAL: Duration = Duration::from_secs(60);
const THROTTLE_INTERVAL: Duration = Duration::from_secs(1);

/// Chain view the pool validates against.
pub trait PoolChain: Send + Sync {
    fn current_block(&self) -> BlockRef;

    fn get_block(&self, hash: B256, number: u64) -> Option<BlockRef>;

    fn state_at(&self, root: B256) -> ChainResult<StateDb>;

    fn subscribe_chain_head_event(&self) -> flume::Receiver<ChainHeadEvent>;

    /// Hands the running spam throttler to the chain so that it can feed
    /// block results back. `None` detaches it.
    fn set_spam_throttler(&self, _throttler: Option<Arc<SpamThrottler>>) {}
}

/// Where a transaction is in its life cycle.
///
/// The pool itself only reports the first three; `Included` is for callers
/// that also consult the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Unknown,
    Queued,
    Pending,
    Included,
}

fn slots(count: u64) -> usize {
    usize::try_from(count).unwrap_or(usize::MAX)
}

fn recover_senders(txs: &[Transaction], chain_id: u64) {
    txs.par_iter().for_each(|tx| {
        let _ = tx.sender(chain_id);
    });
}

/// Whether the sender, and the fee payer of delegated transactions, can
/// afford their share of `tx`.
fn check_balance(state: &mut StateDb, sender: Address, tx: &Transaction) -> TxPoolResult {
    let balance = state.get_balance(sender);
    let from_err = |want| {
        TxPoolError::InsufficientFundsFrom {
            address: sender,
            have: balance,
            want,
        }
    };
    let fee_payer = tx.fee_payer().unwrap_or(sender);
    if !tx.is_fee_delegated() || fee_payer == sender {
        if balance < tx.cost() {
            return Err(from_err(tx.cost()));
        }
        return Ok(());
    }

    let (payer_part, sender_part) = match tx.fee_ratio() {
        Some(ratio) => ratio.split(tx.fee()),
        None => (tx.fee(), U256::ZERO),
    };
    let sender_want = tx.value() + sender_part;
    if balance < sender_want {
        return Err(from_err(sender_want));
    }
    let payer_balance = state.get_balance(fee_payer);
    if payer_balance < payer_part {
        return Err(TxPoolError::InsufficientFundsFeePayer {
            address: fee_payer,
            have: payer_balance,
            want: payer_part,
        });
    }
    Ok(())
}

/// Everything guarded by the pool lock.
struct PoolInner {
    config: TxPoolConfig,
    chain_config: ChainConfig,
    all: Arc<DashMap<B256, Transaction>>,
    tx_feed: Arc<Feed<NewTxsEvent>>,

    gas_price: U256,
    state: StateDb,
    current_block_number: u64,
    /// Fork flags and base fee of the block after the current head.
    eip2718: bool,
    eip1559: bool,
    magma: bool,
    base_fee: U256,

    noncer: Noncer,
    locals: AccountSet,
    journal: Option<TxJournal>,
    pending: HashMap<Address, TxList>,
    queue: HashMap<Address, TxList>,
    beats: HashMap<Address, Instant>,
    priced: PricedList,
}

impl PoolInner {
    fn validate_tx(&mut self, tx: &Transaction) -> TxPoolResult<Address> {
        let chain_id = self.chain_config.chain_id;
        let tx_type = tx.tx_type();
        let next = self.current_block_number + 1;
        if tx_type.is_ethereum_typed() && !self.eip2718 {
            return Err(TxPoolError::TxTypeNotSupported { number: next });
        }
        if tx_type == TxType::EthereumDynamicFee && !self.eip1559 {
            return Err(TxPoolError::TxTypeNotSupported { number: next });
        }
        if tx.chain_id() != Some(chain_id) {
            return Err(TxPoolError::InvalidChainId {
                expected: chain_id,
                got: tx.chain_id(),
            });
        }
        if tx.size() > MAX_TX_DATA_SIZE {
            return Err(TxPoolError::OversizedData { size: tx.size() });
        }
        tx.validate_stateless().map_err(TxPoolError::InvalidTx)?;
        self.validate_price(tx)?;

        let from = tx.sender(chain_id).map_err(TxPoolError::InvalidSender)?;
        if tx.is_fee_delegated() {
            tx.validated_fee_payer(chain_id)
                .map_err(TxPoolError::InvalidFeePayer)?;
        }
        let state_nonce = self.state.get_nonce(from);
        if state_nonce > tx.nonce() {
            return Err(TxPoolError::NonceTooLow {
                address: from,
                tx: tx.nonce(),
                state: state_nonce,
            });
        }
        check_balance(&mut self.state, from, tx)?;

        let intrinsic = tx.intrinsic_gas().map_err(TxPoolError::InvalidTx)?;
        if tx.gas() < intrinsic {
            return Err(TxPoolError::IntrinsicGas {
                have: tx.gas(),
                want: intrinsic,
            });
        }
        Ok(from)
    }

    /// Before Magma every price must equal the unit price. Afterwards the
    /// price only has to cover the base fee.
    fn validate_price(&self, tx: &Transaction) -> TxPoolResult {
        let dynamic = tx.tx_type() == TxType::EthereumDynamicFee;
        if dynamic && tx.gas_tip_cap() > tx.gas_fee_cap() {
            return Err(TxPoolError::TipAboveFeeCap {
                tip: tx.gas_tip_cap(),
                fee_cap: tx.gas_fee_cap(),
            });
        }
        if self.magma {
            if dynamic && tx.gas_fee_cap() < self.base_fee {
                return Err(TxPoolError::FeeCapBelowBaseFee {
                    fee_cap: tx.gas_fee_cap(),
                    base_fee: self.base_fee,
                });
            }
            if !dynamic && tx.gas_price() < self.base_fee {
                return Err(TxPoolError::GasPriceBelowBaseFee {
                    gas_price: tx.gas_price(),
                    base_fee: self.base_fee,
                });
            }
            return Ok(());
        }
        if dynamic {
            if tx.gas_tip_cap() != self.gas_price {
                return Err(TxPoolError::InvalidGasTipCap {
                    pool: self.gas_price,
                    tx: tx.gas_tip_cap(),
                });
            }
            if tx.gas_fee_cap() != self.gas_price {
                return Err(TxPoolError::InvalidGasFeeCap {
                    pool: self.gas_price,
                    tx: tx.gas_fee_cap(),
                });
            }
        } else if tx.gas_price() != self.gas_price {
            return Err(TxPoolError::InvalidUnitPrice {
                pool: self.gas_price,
                tx: tx.gas_price(),
            });
        }
        Ok(())
    }

    /// Validates `tx` and puts it into the queue, or directly into pending
    /// when it replaces an executable transaction. Returns the sender and
    /// whether an existing transaction was replaced.
    fn add(&mut self, tx: Transaction, local: bool) -> TxPoolResult<(Address, bool)> {
        let hash = tx.hash();
        if self.all.contains_key(&hash) {
            trace!(target: "ledger-chain::txpool", %hash, "Discarding already known transaction");
            return Err(TxPoolError::KnownTransaction(hash));
        }
        let from = self.validate_tx(&tx).inspect_err(|err| {
            trace!(target: "ledger-chain::txpool", %hash, error = %err, "Discarding invalid transaction");
            metrics::record_tx_rejected();
        })?;

        let capacity = self.config.capacity();
        if self.all.len() >= capacity {
            self.make_room(&tx, from, local)?;
        }

        if let Some(list) = self.pending.get_mut(&from) {
            if list.overlaps(&tx) {
                let (inserted, old) = list.add(tx.clone(), self.magma);
                if !inserted {
                    return Err(TxPoolError::AlreadyNonceExistInPool);
                }
                if let Some(old) = &old {
                    self.all.remove(&old.hash());
                    self.priced.removed();
                }
                self.all.insert(hash, tx.clone());
                self.priced.put(tx.clone());
                self.journal_tx(from, &tx);
                trace!(target: "ledger-chain::txpool", %hash, %from, "Pooled new executable transaction");
                self.tx_feed.send(NewTxsEvent { txs: vec![tx] });
                return Ok((from, old.is_some()));
            }
        }

        let replaced = self.enqueue_tx(tx.clone(), from)?;
        if local {
            self.locals.add(from);
        }
        self.journal_tx(from, &tx);
        trace!(target: "ledger-chain::txpool", %hash, %from, "Pooled new future transaction");
        Ok((from, replaced))
    }

    /// Frees a slot for `tx` in a full pool. Only a transaction that fills a
    /// nonce gap of its sender's queue gets in, at the expense of the
    /// highest queued nonce.
    fn make_room(&mut self, tx: &Transaction, from: Address, local: bool) -> TxPoolResult {
        let size = self.all.len();
        let Some(queued) = self.queue.get(&from) else {
            trace!(target: "ledger-chain::txpool", hash = %tx.hash(), account = %from, "Rejecting transaction, pool is full and the account has no queued slot");
            metrics::record_tx_rejected();
            return Err(TxPoolError::PoolFull { size });
        };
        let highest = if queued.get(tx.nonce()).is_some() {
            None
        } else {
            queued
                .last_nonce()
                .filter(|last| *last > tx.nonce())
                .and_then(|last| queued.get(last))
                .map(Transaction::hash)
        };
        let Some(highest) = highest else {
            trace!(target: "ledger-chain::txpool", hash = %tx.hash(), "Rejecting transaction, pool is full and it fills no missing nonce");
            metrics::record_tx_rejected();
            return Err(TxPoolError::PoolFullNoMissingNonce { size });
        };
        self.remove_tx(highest, true);
        trace!(target: "ledger-chain::txpool", account = %from, nonce = tx.nonce(), "Evicted highest queued nonce for a missing one");

        if !local && self.priced.underpriced(tx, &self.locals) {
            trace!(target: "ledger-chain::txpool", hash = %tx.hash(), price = %tx.gas_price(), "Discarding underpriced transaction");
            metrics::record_tx_rejected();
            return Err(TxPoolError::Underpriced);
        }
        let overflow = (self.all.len() + 1).saturating_sub(self.config.capacity());
        for dropped in self.priced.discard(overflow, &self.locals) {
            trace!(target: "ledger-chain::txpool", hash = %dropped.hash(), price = %dropped.gas_price(), "Discarding freshly underpriced transaction");
            self.remove_tx(dropped.hash(), false);
        }
        Ok(())
    }

    fn enqueue_tx(&mut self, tx: Transaction, from: Address) -> TxPoolResult<bool> {
        let hash = tx.hash();
        let list = self
            .queue
            .entry(from)
            .or_insert_with(|| TxList::new(false));
        let (inserted, old) = list.add(tx.clone(), self.magma);
        if !inserted {
            return Err(TxPoolError::AlreadyNonceExistInPool);
        }
        if let Some(old) = &old {
            self.all.remove(&old.hash());
            self.priced.removed();
        }
        if !self.all.contains_key(&hash) {
            self.all.insert(hash, tx.clone());
            self.priced.put(tx);
        }
        self.beats.entry(from).or_insert_with(Instant::now);
        Ok(old.is_some())
    }

    /// Puts transactions that left pending back into the queue. Those the
    /// queue refuses leave the pool.
    fn requeue(&mut self, from: Address, txs: Vec<Transaction>) {
        for tx in txs {
            let hash = tx.hash();
            if let Err(err) = self.enqueue_tx(tx, from) {
                debug!(target: "ledger-chain::txpool", %hash, error = %err, "Dropping transaction that could not be requeued");
                if self.all.remove(&hash).is_some() {
                    self.priced.removed();
                }
            }
        }
    }

    fn journal_tx(&mut self, from: Address, tx: &Transaction) {
        if !self.locals.contains(&from) {
            return;
        }
        let Some(journal) = self.journal.as_mut() else {
            return;
        };
        if let Err(err) = journal.insert(tx) {
            error!(target: "ledger-chain::txpool", error = %err, "Failed to journal local transaction");
        }
    }

    fn promote_tx(&mut self, from: Address, tx: Transaction) -> bool {
        let hash = tx.hash();
        let nonce = tx.nonce();
        let list = self
            .pending
            .entry(from)
            .or_insert_with(|| TxList::new(true));
        let (inserted, old) = list.add(tx.clone(), self.magma);
        if !inserted {
            if self.all.remove(&hash).is_some() {
                self.priced.removed();
            }
            return false;
        }
        if let Some(old) = old {
            self.all.remove(&old.hash());
            self.priced.removed();
        }
        if !self.all.contains_key(&hash) {
            self.all.insert(hash, tx.clone());
            self.priced.put(tx);
        }
        self.beats.insert(from, Instant::now());
        self.noncer.set(from, nonce + 1);
        true
    }

    /// Removes a transaction. Pending transactions above it move back to the
    /// queue. `out_of_bound` is false when the price heap already popped it.
    fn remove_tx(&mut self, hash: B256, out_of_bound: bool) {
        let Some((_, tx)) = self.all.remove(&hash) else {
            return;
        };
        if out_of_bound {
            self.priced.removed();
        }
        let Some(from) = tx.cached_sender() else {
            return;
        };
        let nonce = tx.nonce();

        if let Some(pending) = self.pending.get_mut(&from) {
            if pending.get(nonce).is_some_and(|pooled| pooled.hash() == hash) {
                let (_, invalids) = pending.remove(nonce);
                if pending.is_empty() {
                    self.pending.remove(&from);
                }
                self.requeue(from, invalids);
                self.noncer.set_if_lower(&mut self.state, from, nonce);
                return;
            }
        }
        if let Some(future) = self.queue.get_mut(&from) {
            future.remove(nonce);
            if future.is_empty() {
                self.queue.remove(&from);
            }
        }
    }

    fn drop_from_all(&mut self, txs: &[Transaction], reason: &str) {
        for tx in txs {
            if self.all.remove(&tx.hash()).is_some() {
                self.priced.removed();
            }
            trace!(target: "ledger-chain::txpool", hash = %tx.hash(), reason, "Removed transaction");
        }
    }

    /// Moves transactions that became executable from the queue to pending,
    /// dropping stale and unpayable ones on the way, then enforces the slot
    /// limits. `None` checks every queued account.
    fn promote_executables(&mut self, accounts: Option<Vec<Address>>) {
        let accounts = accounts.unwrap_or_else(|| self.queue.keys().copied().collect());
        let account_limit = slots(self.config.non_exec_slots_account);
        let mut promoted = Vec::new();

        for from in accounts {
            let state_nonce = self.state.get_nonce(from);
            let Some(list) = self.queue.get_mut(&from) else {
                continue;
            };
            let stale = list.forward(state_nonce);
            let state = &mut self.state;
            let (unpayable, _) = list.filter(|tx| check_balance(state, from, tx).is_err());
            let pending_nonce = self.noncer.get(&mut self.state, from);
            let ready = if self.magma {
                list.ready_with_gas_price(pending_nonce, self.base_fee)
            } else {
                list.ready(pending_nonce)
            };
            self.drop_from_all(&stale, "old queued");
            self.drop_from_all(&unpayable, "unpayable queued");

            for tx in ready {
                if self.promote_tx(from, tx.clone()) {
                    trace!(target: "ledger-chain::txpool", hash = %tx.hash(), "Promoting queued transaction");
                    promoted.push(tx);
                }
            }

            let local = self.locals.contains(&from);
            let Some(list) = self.queue.get_mut(&from) else {
                continue;
            };
            let capped = if local {
                Vec::new()
            } else {
                list.cap(account_limit)
            };
            if list.is_empty() {
                self.queue.remove(&from);
            }
            self.drop_from_all(&capped, "cap-exceeding queued");
        }

        if !promoted.is_empty() {
            self.tx_feed.send(NewTxsEvent { txs: promoted });
        }
        self.cap_pending();
        self.cap_queued();
    }

    fn pending_len(&self, from: &Address) -> usize {
        self.pending.get(from).map_or(0, TxList::len)
    }

    /// Drops the highest pending nonce of `from`.
    fn drop_last_pending(&mut self, from: Address) -> bool {
        let Some(list) = self.pending.get_mut(&from) else {
            return false;
        };
        let Some(keep) = list.len().checked_sub(1) else {
            return false;
        };
        let dropped = list.cap(keep);
        for tx in &dropped {
            self.noncer.set_if_lower(&mut self.state, from, tx.nonce());
        }
        self.drop_from_all(&dropped, "fairness-exceeding pending");
        !dropped.is_empty()
    }

    /// Shrinks the largest non-local pending accounts until the pending total
    /// fits `exec_slots_all` or every offender is down to
    /// `exec_slots_account`.
    fn cap_pending(&mut self) {
        let limit = slots(self.config.exec_slots_all);
        let account_limit = slots(self.config.exec_slots_account);
        let mut pending: usize = self.pending.values().map(TxList::len).sum();
        if pending <= limit {
            return;
        }

        let mut spammers: BinaryHeap<(usize, Address)> = self
            .pending
            .iter()
            .filter(|(from, list)| !self.locals.contains(from) && list.len() > account_limit)
            .map(|(from, list)| (list.len(), *from))
            .collect();
        let mut offenders: Vec<Address> = Vec::new();
        while pending > limit {
            let Some((_, offender)) = spammers.pop() else {
                break;
            };
            offenders.push(offender);
            if offenders.len() < 2 {
                continue;
            }
            let threshold = self.pending_len(&offender);
            let previous = offenders[offenders.len() - 2];
            while pending > limit && self.pending_len(&previous) > threshold {
                for &from in &offenders[..offenders.len() - 1] {
                    if self.drop_last_pending(from) {
                        pending -= 1;
                    }
                }
            }
        }

        if let Some(&last) = offenders.last() {
            while pending > limit && self.pending_len(&last) > account_limit {
                for &from in &offenders {
                    if self.drop_last_pending(from) {
                        pending -= 1;
                    }
                }
            }
        }
    }

    /// Drops queued transactions of non-local accounts, oldest heartbeat
    /// first, until the queue fits `non_exec_slots_all`.
    fn cap_queued(&mut self) {
        let limit = slots(self.config.non_exec_slots_all);
        let queued: usize = self.queue.values().map(TxList::len).sum();
        if queued <= limit {
            return;
        }
        let now = Instant::now();
        let mut accounts: Vec<(Instant, Address)> = self
            .queue
            .keys()
            .filter(|from| !self.locals.contains(from))
            .map(|from| (self.beats.get(from).copied().unwrap_or(now), *from))
            .collect();
        accounts.sort();

        let mut overflow = queued - limit;
        for (_, from) in accounts {
            if overflow == 0 {
                break;
            }
            let Some(list) = self.queue.get_mut(&from) else {
                continue;
            };
            let txs = list.flatten();
            let count = txs.len().min(overflow);
            for tx in txs.iter().rev().take(count) {
                self.remove_tx(tx.hash(), true);
            }
            overflow -= count;
        }
    }

    /// Drops pending transactions the new state made stale or unpayable and
    /// moves the ones behind a new nonce gap back to the queue.
    fn demote_unexecutables(&mut self) {
        let mut validated = 0;
        let accounts: Vec<Address> = self.pending.keys().copied().collect();
        for from in accounts {
            let nonce = self.state.get_nonce(from);
            let Some(list) = self.pending.get_mut(&from) else {
                continue;
            };
            let stale = list.forward(nonce);
            let (unpayable, invalids) = if validated < DEMOTE_FULL_VALIDATION_LIMIT {
                validated += list.len();
                let state = &mut self.state;
                list.filter(|tx| check_balance(state, from, tx).is_err())
            } else {
                (Vec::new(), Vec::new())
            };
            let gapped = if !list.is_empty() && list.get(nonce).is_none() {
                list.cap(0)
            } else {
                Vec::new()
            };
            if list.is_empty() {
                self.pending.remove(&from);
            }

            self.drop_from_all(&stale, "old pending");
            self.drop_from_all(&unpayable, "unexecutable pending");
            self.requeue(from, invalids);
            for tx in &gapped {
                error!(target: "ledger-chain::txpool", hash = %tx.hash(), "Demoting invalidated transaction");
            }
            self.requeue(from, gapped);
        }
    }

    fn add_txs(&mut self, txs: Vec<Transaction>, local: bool) -> Vec<TxPoolResult> {
        let mut dirty = HashSet::new();
        let results = txs
            .into_iter()
            .map(|tx| {
                let (from, replaced) = self.add(tx, local)?;
                if !replaced {
                    dirty.insert(from);
                }
                Ok(())
            })
            .collect();
        if !dirty.is_empty() {
            self.promote_executables(Some(dirty.into_iter().collect()));
        }
        results
    }

    /// Re-anchors the pool on `new_head`.
    #[instrument(skip_all, level = "debug", fields(number = new_head.number))]
    fn reset(&mut self, chain: &dyn PoolChain, old_head: Option<&Header>, new_head: &Header) {
        let mut reinject = Vec::new();
        if let Some(old_head) = old_head {
            if old_head.hash() != new_head.parent_hash {
                let depth = old_head.number.abs_diff(new_head.number);
                if depth > MAX_REORG_REINJECT_DEPTH {
                    debug!(target: "ledger-chain::txpool", depth, "Skipping deep transaction reorg");
                } else {
                    match reorged_txs(chain, old_head, new_head) {
                        Some(txs) => reinject = txs,
                        None => return,
                    }
                }
            }
        }

        let state = match chain.state_at(new_head.state_root) {
            Ok(state) => state,
            Err(err) => {
                error!(target: "ledger-chain::txpool", error = %err, "Failed to reset txpool state");
                return;
            }
        };
        self.state = state;
        self.noncer.reset();
        self.current_block_number = new_head.number;
        let next = new_head.number + 1;
        self.eip2718 = self.chain_config.is_eip2718_active(next);
        self.eip1559 = self.chain_config.is_eip1559_active(next);
        self.magma = self.chain_config.is_magma_active(next);
        self.base_fee = new_head.base_fee.unwrap_or(U256::ZERO);

        debug!(target: "ledger-chain::txpool", count = reinject.len(), "Reinjecting stale transactions");
        recover_senders(&reinject, self.chain_config.chain_id);
        self.add_txs(reinject, false);

        self.demote_unexecutables();
        let nonces: Vec<(Address, u64)> = self
            .pending
            .iter()
            .filter_map(|(from, list)| list.last_nonce().map(|nonce| (*from, nonce + 1)))
            .collect();
        for (from, nonce) in nonces {
            self.noncer.set(from, nonce);
        }
        self.promote_executables(None);
    }

    fn stats(&self) -> (usize, usize) {
        (
            self.pending.values().map(TxList::len).sum(),
            self.queue.values().map(TxList::len).sum(),
        )
    }

    fn local_txs(&mut self) -> HashMap<Address, Vec<Transaction>> {
        let mut txs = HashMap::new();
        for from in self.locals.iter() {
            let mut account = Vec::new();
            if let Some(list) = self.pending.get_mut(from) {
                account.extend(list.flatten());
            }
            if let Some(list) = self.queue.get_mut(from) {
                account.extend(list.flatten());
            }
            if !account.is_empty() {
                txs.insert(*from, account);
            }
        }
        txs
    }

    /// Drops the queued transactions of non-local accounts idle for longer
    /// than the configured lifetime.
    fn evict_idle(&mut self) {
        let lifetime = self.config.lifetime;
        let expired: Vec<Address> = self
            .beats
            .iter()
            .filter(|(from, beat)| !self.locals.contains(from) && beat.elapsed() > lifetime)
            .map(|(from, _)| *from)
            .collect();
        for from in expired {
            if let Some(list) = self.queue.get_mut(&from) {
                for tx in list.flatten() {
                    self.remove_tx(tx.hash(), true);
                }
            }
            self.beats.remove(&from);
            debug!(target: "ledger-chain::txpool", account = %from, "Evicted idle account");
        }
    }

    fn rotate_journal(&mut self) {
        if self.journal.is_none() {
            return;
        }
        let locals = self.local_txs();
        if let Some(journal) = self.journal.as_mut() {
            if let Err(err) = journal.rotate(&locals) {
                error!(target: "ledger-chain::txpool", error = %err, "Failed to rotate local tx journal");
            }
        }
    }

    fn clear(&mut self) {
        self.pending.clear();
        self.queue.clear();
        self.beats.clear();
        self.all.clear();
        self.noncer.reset();
        self.locals = AccountSet::default();
        self.priced = PricedList::new(self.all.clone());
    }
}

/// Transactions of the blocks `old_head` had but `new_head` does not.
/// `None` when either side does not connect to a common ancestor.
fn reorged_txs(chain: &dyn PoolChain, old_head: &Header, new_head: &Header) -> Option<Vec<Transaction>> {
    let parent_of = |block: &BlockRef, side: &str| {
        let parent = block
            .number()
            .checked_sub(1)
            .and_then(|number| chain.get_block(block.parent_hash(), number));
        if parent.is_none() {
            error!(target: "ledger-chain::txpool", side, number = block.number(), hash = %block.hash(), "Unrooted chain seen by tx pool");
        }
        parent
    };
    let Some(mut rem) = chain.get_block(old_head.hash(), old_head.number) else {
        error!(target: "ledger-chain::txpool", number = old_head.number, "Old head not found");
        return None;
    };
    let Some(mut add) = chain.get_block(new_head.hash(), new_head.number) else {
        error!(target: "ledger-chain::txpool", number = new_head.number, "New head not found");
        return None;
    };

    let mut discarded = Vec::new();
    let mut included = HashSet::new();
    while rem.number() > add.number() {
        discarded.extend_from_slice(rem.transactions());
        rem = parent_of(&rem, "old")?;
    }
    while add.number() > rem.number() {
        included.extend(add.transactions().iter().map(Transaction::hash));
        add = parent_of(&add, "new")?;
    }
    while rem.hash() != add.hash() {
        discarded.extend_from_slice(rem.transactions());
        rem = parent_of(&rem, "old")?;
        included.extend(add.transactions().iter().map(Transaction::hash));
        add = parent_of(&add, "new")?;
    }
    Some(
        discarded
            .into_iter()
            .filter(|tx| !included.contains(&tx.hash()))
            .collect(),
    )
}

/// Pool of transactions waiting for inclusion.
///
/// Background threads follow the chain head, report stats, evict idle
/// accounts, rotate the journal and feed transactions received from peers
/// into the pool. They stop on [`TxPool::stop`] or once the pool is
/// dropped.
pub struct TxPool {
    config: TxPoolConfig,
    chain_config: ChainConfig,
    chain: Arc<dyn PoolChain>,
    all: Arc<DashMap<B256, Transaction>>,
    inner: Mutex<PoolInner>,
    tx_feed: Arc<Feed<NewTxsEvent>>,
    tx_msg: flume::Sender<Vec<Transaction>>,
    throttler: RwLock<Option<Arc<SpamThrottler>>>,
    throttle_loop: Mutex<Option<(Arc<AtomicBool>, JoinHandle<()>)>>,
    quit: Arc<AtomicBool>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for TxPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxPool")
            .field("config", &self.config)
            .field("transactions", &self.all.len())
            .finish_non_exhaustive()
    }
}

impl TxPool {
    /// Creates the pool on the chain's current head, replays the journal and
    /// starts the background loops.
    pub fn new(
        config: TxPoolConfig,
        chain_config: ChainConfig,
        chain: Arc<dyn PoolChain>,
    ) -> ChainResult<Arc<Self>> {
        let config = config.sanitize();
        let head = chain.current_block();
        let heads = chain.subscribe_chain_head_event();
        let all = Arc::new(DashMap::new());
        let tx_feed = Arc::new(Feed::default());
        let (tx_msg, tx_msg_rx) = flume::bounded(TX_MSG_CHAN_SIZE);

        let mut inner = PoolInner {
            config: config.clone(),
            chain_config: chain_config.clone(),
            all: all.clone(),
            tx_feed: tx_feed.clone(),
            gas_price: chain_config.unit_price(),
            state: chain.state_at(head.state_root())?,
            current_block_number: head.number(),
            eip2718: false,
            eip1559: false,
            magma: false,
            base_fee: U256::ZERO,
            noncer: Noncer::default(),
            locals: AccountSet::default(),
            journal: None,
            pending: HashMap::new(),
            queue: HashMap::new(),
            beats: HashMap::new(),
            priced: PricedList::new(all.clone()),
        };
        inner.reset(chain.as_ref(), None, head.header());

        if !config.no_locals {
            if let Some(path) = &config.journal {
                let mut journal = TxJournal::new(path);
                if let Err(err) = journal.load(|txs| {
                    recover_senders(&txs, chain_config.chain_id);
                    inner.add_txs(txs, true)
                }) {
                    warn!(target: "ledger-chain::txpool", error = %err, "Failed to load transaction journal");
                }
                let locals = inner.local_txs();
                if let Err(err) = journal.rotate(&locals) {
                    warn!(target: "ledger-chain::txpool", error = %err, "Failed to rotate transaction journal");
                }
                inner.journal = Some(journal);
            }
        }

        let pool = Arc::new(Self {
            config,
            chain_config,
            chain,
            all,
            inner: Mutex::new(inner),
            tx_feed,
            tx_msg,
            throttler: RwLock::new(None),
            throttle_loop: Mutex::new(None),
            quit: Arc::new(AtomicBool::new(false)),
            loops: Mutex::new(Vec::new()),
        });
        let head_loop = pool.spawn_head_loop(heads, head)?;
        let msg_loop = pool.spawn_msg_loop(tx_msg_rx)?;
        pool.loops.lock().extend([head_loop, msg_loop]);

        if pool.config.enable_spam_throttler_at_runtime {
            if let Err(err) = pool.start_spam_throttler(None) {
                error!(target: "ledger-chain::txpool", error = %err, "Failed to start spam throttler");
            }
        }
        info!(target: "ledger-chain::txpool", capacity = pool.config.capacity(), "Transaction pool started");
        Ok(pool)
    }

    fn spawn_head_loop(
        self: &Arc<Self>,
        heads: flume::Receiver<ChainHeadEvent>,
        mut head: BlockRef,
    ) -> std::io::Result<JoinHandle<()>> {
        let pool: Weak<Self> = Arc::downgrade(self);
        let quit = self.quit.clone();
        let journal_interval = self.config.journal_interval;
        thread::Builder::new()
            .name("txpool-loop".into())
            .spawn(move || {
                let mut last_report = Instant::now();
                let mut last_evict = Instant::now();
                let mut last_journal = Instant::now();
                let mut reported = (0, 0, 0);
                while !quit.load(Ordering::Relaxed) {
                    let event = heads.recv_timeout(RECV_TIMEOUT);
                    let Some(pool) = pool.upgrade() else {
                        return;
                    };
                    match event {
                        Ok(event) => pool.on_chain_head(&mut head, event.block),
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => {
                            debug!(target: "ledger-chain::txpool", "Chain head feed closed");
                            return;
                        }
                    }
                    if last_report.elapsed() >= STATS_REPORT_INTERVAL {
                        last_report = Instant::now();
                        pool.report_stats(&mut reported);
                    }
                    if last_evict.elapsed() >= EVICTION_INTERVAL {
                        last_evict = Instant::now();
                        pool.evict_idle();
                    }
                    if last_journal.elapsed() >= journal_interval {
                        last_journal = Instant::now();
                        pool.inner.lock().rotate_journal();
                    }
                }
            })
    }

    fn spawn_msg_loop(
        self: &Arc<Self>,
        txs: flume::Receiver<Vec<Transaction>>,
    ) -> std::io::Result<JoinHandle<()>> {
        let pool: Weak<Self> = Arc::downgrade(self);
        let quit = self.quit.clone();
        thread::Builder::new()
            .name("txpool-msg".into())
            .spawn(move || {
                while !quit.load(Ordering::Relaxed) {
                    match txs.recv_timeout(RECV_TIMEOUT) {
                        Ok(batch) => {
                            let Some(pool) = pool.upgrade() else {
                                return;
                            };
                            pool.add_remotes(batch);
                        }
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => return,
                    }
                }
            })
    }

    fn on_chain_head(&self, head: &mut BlockRef, block: BlockRef) {
        let mut inner = self.inner.lock();
        let current = self.chain.current_block();
        if block.state_root() != current.state_root() {
            debug!(
                target: "ledger-chain::txpool",
                received = block.number(),
                current = current.number(),
                "Head event differs from the current block"
            );
            return;
        }
        inner.reset(self.chain.as_ref(), Some(head.header()), block.header());
        *head = block;
    }

    fn report_stats(&self, reported: &mut (usize, usize, usize)) {
        let (pending, queued, stales) = {
            let inner = self.inner.lock();
            let (pending, queued) = inner.stats();
            (pending, queued, inner.priced.stales())
        };
        if (pending, queued, stales) != *reported {
            debug!(target: "ledger-chain::txpool", executable = pending, queued, stales, "Transaction pool status report");
            *reported = (pending, queued, stales);
            metrics::set_txpool_counts(pending, queued);
        }
    }

    pub fn config(&self) -> &TxPoolConfig {
        &self.config
    }

    /// Re-anchors the pool on `new_head`, reinjecting transactions of a
    /// shallow reorg.
    pub fn reset(&self, old_head: Option<&Header>, new_head: &Header) {
        self.inner
            .lock()
            .reset(self.chain.as_ref(), old_head, new_head);
    }

    pub fn evict_idle(&self) {
        self.inner.lock().evict_idle();
    }

    pub fn add_local(&self, tx: Transaction) -> TxPoolResult {
        if tx.tx_type() == TxType::ChainDataAnchoring && !self.config.allow_local_anchor_tx {
            return Err(TxPoolError::AnchoringNotAllowed);
        }
        let size = self.all.len();
        if size >= self.config.capacity() {
            return Err(TxPoolError::PoolFull { size });
        }
        self.add_tx(tx, !self.config.no_locals)
    }

    pub fn add_remote(&self, tx: Transaction) -> TxPoolResult {
        self.add_tx(tx, false)
    }

    pub fn add_locals(&self, txs: Vec<Transaction>) -> Vec<TxPoolResult> {
        self.check_and_add_txs(txs, !self.config.no_locals)
    }

    pub fn add_remotes(&self, txs: Vec<Transaction>) -> Vec<TxPoolResult> {
        self.check_and_add_txs(txs, false)
    }

    fn add_tx(&self, tx: Transaction, local: bool) -> TxPoolResult {
        let _ = tx.sender(self.chain_config.chain_id);
        let mut inner = self.inner.lock();
        let (from, replaced) = inner.add(tx, local)?;
        if !replaced {
            inner.promote_executables(Some(vec![from]));
        }
        Ok(())
    }

    /// Adds as many of `txs` as there are free slots. The rest fail with
    /// [`TxPoolError::PoolFull`].
    fn check_and_add_txs(&self, mut txs: Vec<Transaction>, local: bool) -> Vec<TxPoolResult> {
        let size = self.all.len();
        let free = self.config.capacity().saturating_sub(size);
        let overflow = if txs.len() > free {
            txs.split_off(free)
        } else {
            Vec::new()
        };
        recover_senders(&txs, self.chain_config.chain_id);
        let mut results = self.inner.lock().add_txs(txs, local);
        results.extend(overflow.iter().map(|_| Err(TxPoolError::PoolFull { size })));
        results
    }

    /// Queues a batch received from a peer without waiting for it to be
    /// added. Transactions to throttled addresses are held back by the spam
    /// throttler once the pool is busy. The batch is dropped when the intake
    /// channel is full.
    pub fn handle_tx_msg(&self, txs: Vec<Transaction>) {
        if self.config.deny_remote_tx {
            return;
        }
        let mut txs = txs;
        if let Some(throttler) = self.spam_throttler() {
            if self.all.len() > throttler.config().activate_tx_pool_size {
                let (allowed, throttled) = throttler.classify_txs(txs);
                throttler.hold(throttled);
                txs = allowed;
            }
        }
        recover_senders(&txs, self.chain_config.chain_id);
        match self.tx_msg.try_send(txs) {
            Ok(()) => {}
            Err(TrySendError::Full(txs)) => {
                debug!(target: "ledger-chain::txpool", count = txs.len(), "Dropping transactions, intake channel is full");
            }
            Err(TrySendError::Disconnected(_)) => {
                warn!(target: "ledger-chain::txpool", "Transaction intake loop is gone");
            }
        }
    }

    /// Executable transactions grouped by sender and sorted by nonce.
    pub fn pending(&self) -> HashMap<Address, Vec<Transaction>> {
        let mut inner = self.inner.lock();
        inner
            .pending
            .iter_mut()
            .map(|(from, list)| (*from, list.flatten()))
            .collect()
    }

    /// Future transactions grouped by sender and sorted by nonce.
    pub fn queued(&self) -> HashMap<Address, Vec<Transaction>> {
        let mut inner = self.inner.lock();
        inner
            .queue
            .iter_mut()
            .map(|(from, list)| (*from, list.flatten()))
            .collect()
    }

    #[allow(clippy::type_complexity)]
    pub fn content(
        &self,
    ) -> (
        HashMap<Address, Vec<Transaction>>,
        HashMap<Address, Vec<Transaction>>,
    ) {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        let pending = inner
            .pending
            .iter_mut()
            .map(|(from, list)| (*from, list.flatten()))
            .collect();
        let queued = inner
            .queue
            .iter_mut()
            .map(|(from, list)| (*from, list.flatten()))
            .collect();
        (pending, queued)
    }

    /// Number of pending and queued transactions.
    pub fn stats(&self) -> (usize, usize) {
        self.inner.lock().stats()
    }

    pub fn status(&self, hashes: &[B256]) -> Vec<TxStatus> {
        let inner = self.inner.lock();
        hashes
            .iter()
            .map(|hash| {
                let Some(tx) = self.all.get(hash) else {
                    return TxStatus::Unknown;
                };
                let pending = tx
                    .cached_sender()
                    .and_then(|from| inner.pending.get(&from))
                    .and_then(|list| list.get(tx.nonce()))
                    .is_some_and(|pooled| pooled.hash() == *hash);
                if pending {
                    TxStatus::Pending
                } else {
                    TxStatus::Queued
                }
            })
            .collect()
    }

    pub fn get(&self, hash: &B256) -> Option<Transaction> {
        self.all.get(hash).map(|entry| entry.value().clone())
    }

    pub fn has(&self, hash: &B256) -> bool {
        self.all.contains_key(hash)
    }

    pub fn gas_price(&self) -> U256 {
        self.inner.lock().gas_price
    }

    /// Changes the required unit price. Every pooled transaction is dropped.
    pub fn set_gas_price(&self, price: U256) {
        let mut inner = self.inner.lock();
        if inner.gas_price == price {
            return;
        }
        info!(target: "ledger-chain::txpool", before = %inner.gas_price, after = %price, "Changed txpool gas price");
        inner.gas_price = price;
        inner.clear();
    }

    /// Up to roughly `count` executable transactions, taking at most half of
    /// the remaining budget from each account.
    pub fn cached_pending_txs_by_count(&self, count: usize) -> Vec<Transaction> {
        if count == 0 {
            return Vec::new();
        }
        let mut per_account = (count / 2).max(1);
        let mut txs = Vec::with_capacity(count);
        let mut inner = self.inner.lock();
        for list in inner.pending.values_mut() {
            let account = list.flatten_by_count(per_account);
            let taken = account.len();
            txs.extend(account);
            if txs.len() >= count {
                break;
            }
            if taken >= per_account && per_account > 1 {
                per_account /= 2;
            }
        }
        txs
    }

    /// Next nonce `address` should use, counting its pending transactions.
    pub fn pending_nonce(&self, address: Address) -> u64 {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        inner.noncer.get(&mut inner.state, address)
    }

    pub fn local_txs(&self) -> HashMap<Address, Vec<Transaction>> {
        self.inner.lock().local_txs()
    }

    pub fn subscribe_new_txs_event(&self) -> flume::Receiver<NewTxsEvent> {
        self.tx_feed.subscribe()
    }

    /// Starts the spam throttler with `config`, or the defaults, and hands it
    /// to the chain.
    pub fn start_spam_throttler(
        self: &Arc<Self>,
        config: Option<ThrottlerConfig>,
    ) -> Result<(), ThrottlerError> {
        let mut slot = self.throttler.write();
        if slot.is_some() {
            return Err(ThrottlerError::AlreadyRunning);
        }
        let throttler = Arc::new(SpamThrottler::new(config.unwrap_or_default())?);
        let quit = Arc::new(AtomicBool::new(false));
        let handle = {
            let pool: Weak<Self> = Arc::downgrade(self);
            let throttler = throttler.clone();
            let quit = quit.clone();
            thread::Builder::new()
                .name("spam-throttler".into())
                .spawn(move || {
                    let mut last = Instant::now();
                    while !quit.load(Ordering::Relaxed) {
                        thread::sleep(RECV_TIMEOUT);
                        if last.elapsed() < THROTTLE_INTERVAL {
                            continue;
                        }
                        last = Instant::now();
                        let txs = throttler.release();
                        if txs.is_empty() {
                            continue;
                        }
                        let Some(pool) = pool.upgrade() else {
                            return;
                        };
                        pool.add_remotes(txs);
                    }
                    info!(target: "ledger-chain::throttler", "Stopped spam throttler loop");
                })
                .map_err(|err| ThrottlerError::Spawn(err.to_string()))?
        };
        *slot = Some(throttler.clone());
        *self.throttle_loop.lock() = Some((quit, handle));
        self.chain.set_spam_throttler(Some(throttler.clone()));
        info!(target: "ledger-chain::throttler", config = ?throttler.config(), "Started spam throttler");
        Ok(())
    }

    pub fn stop_spam_throttler(&self) {
        if self.throttler.write().take().is_none() {
            return;
        }
        self.chain.set_spam_throttler(None);
        if let Some((quit, handle)) = self.throttle_loop.lock().take() {
            quit.store(true, Ordering::Relaxed);
            if handle.join().is_err() {
                error!(target: "ledger-chain::throttler", "Spam throttler loop panicked");
            }
        }
        metrics::set_throttler_counts(0, 0);
    }

    pub fn spam_throttler(&self) -> Option<Arc<SpamThrottler>> {
        self.throttler.read().clone()
    }

    /// Stops the background loops and the throttler, then rewrites and
    /// closes the journal.
    pub fn stop(&self) {
        if self.quit.swap(true, Ordering::Relaxed) {
            return;
        }
        let loops = std::mem::take(&mut *self.loops.lock());
        for handle in loops {
            if handle.join().is_err() {
                error!(target: "ledger-chain::txpool", "Transaction pool loop panicked");
            }
        }
        self.stop_spam_throttler();

        let mut inner = self.inner.lock();
        if let Some(mut journal) = inner.journal.take() {
            let locals = inner.local_txs();
            if let Err(err) = journal.rotate(&locals) {
                error!(target: "ledger-chain::txpool", error = %err, "Failed to rotate local tx journal");
            }
            if let Err(err) = journal.close() {
                error!(target: "ledger-chain::txpool", error = %err, "Failed to close local tx journal");
            }
        }
        info!(target: "ledger-chain::txpool", "Transaction pool stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        chain::Genesis,
        test_utils::{
            TEST_CHAIN_ID,
            TestChain,
            TestKey,
        },
        types::{
            CancelTx,
            LegacyTx,
            TxData,
        },
    };
    use alloy_primitives::{
        Bytes,
        TxKind,
    };

    const FUNDS: u64 = 1_000_000_000;

    fn chain_config() -> ChainConfig {
        ChainConfig::default()
            .with_chain_id(TEST_CHAIN_ID)
            .with_unit_price(1)
    }

    fn transfer(key: &TestKey, nonce: u64, price: u64, value: u64) -> Transaction {
        key.sign(TxData::Legacy(LegacyTx {
            nonce,
            gas_price: U256::from(price),
            gas: 21_000,
            to: TxKind::Call(Address::repeat_byte(0xee)),
            value: U256::from(value),
            input: Bytes::new(),
        }))
    }

    fn setup(
        chain_config: ChainConfig,
        config: TxPoolConfig,
        keys: &[&TestKey],
    ) -> (Arc<TestChain>, Arc<TxPool>) {
        let genesis = keys.iter().fold(Genesis::new(chain_config.clone()), |genesis, key| {
            genesis.with_balance(key.address(), U256::from(FUNDS))
        });
        let chain = TestChain::new(genesis);
        let pool = TxPool::new(config.with_journal(None), chain_config, chain.clone()).unwrap();
        (chain, pool)
    }

    #[test]
    fn queued_transactions_promote_once_the_gap_closes() {
        let key = TestKey::from_seed(1);
        let (_chain, pool) = setup(chain_config(), TxPoolConfig::default(), &[&key]);
        let events = pool.subscribe_new_txs_event();

        let late = transfer(&key, 1, 1, 0);
        pool.add_remote(late.clone()).unwrap();
        assert_eq!(pool.stats(), (0, 1));
        assert_eq!(pool.status(&[late.hash()]), vec![TxStatus::Queued]);
        assert!(events.try_recv().is_err(), "nothing is executable yet");

        pool.add_remote(transfer(&key, 0, 1, 0)).unwrap();
        assert_eq!(pool.stats(), (2, 0));
        assert_eq!(pool.status(&[late.hash()]), vec![TxStatus::Pending]);
        assert_eq!(pool.pending_nonce(key.address()), 2);
        assert_eq!(events.try_recv().unwrap().txs.len(), 2);
        pool.stop();
    }

    #[test]
    fn validation_rejects_bad_transactions() {
        let key = TestKey::from_seed(1);
        let poor = TestKey::from_seed(2);
        let (_chain, pool) = setup(chain_config(), TxPoolConfig::default(), &[&key]);

        assert!(matches!(
            pool.add_remote(transfer(&key, 0, 2, 0)),
            Err(TxPoolError::InvalidUnitPrice { .. })
        ));
        assert!(matches!(
            pool.add_remote(transfer(&poor, 0, 1, 0)),
            Err(TxPoolError::InsufficientFundsFrom { .. })
        ));
        assert!(matches!(
            pool.add_remote(transfer(&key, 0, 1, FUNDS)),
            Err(TxPoolError::InsufficientFundsFrom { .. })
        ));

        let tx = transfer(&key, 0, 1, 0);
        pool.add_remote(tx.clone()).unwrap();
        assert_eq!(
            pool.add_remote(tx.clone()),
            Err(TxPoolError::KnownTransaction(tx.hash()))
        );
        assert_eq!(pool.status(&[B256::ZERO]), vec![TxStatus::Unknown]);
        pool.stop();
    }

    #[test]
    fn same_nonce_needs_cancel_before_magma() {
        let key = TestKey::from_seed(1);
        let (_chain, pool) = setup(chain_config(), TxPoolConfig::default(), &[&key]);
        pool.add_remote(transfer(&key, 0, 1, 5)).unwrap();

        assert_eq!(
            pool.add_remote(transfer(&key, 0, 1, 6)),
            Err(TxPoolError::AlreadyNonceExistInPool)
        );

        let cancel = key.sign(TxData::Cancel(CancelTx {
            nonce: 0,
            gas_price: U256::from(1),
            gas: 100_000,
            from: key.address(),
        }));
        pool.add_remote(cancel.clone()).unwrap();
        let pending = pool.pending();
        assert_eq!(pending[&key.address()], vec![cancel]);
        assert_eq!(pool.stats(), (1, 0));
        pool.stop();
    }

    #[test]
    fn reset_drops_included_and_demotes_unpayable() {
        let key = TestKey::from_seed(1);
        let (chain, pool) = setup(chain_config(), TxPoolConfig::default(), &[&key]);
        let genesis = chain.head();
        for nonce in 0..4 {
            let value = if nonce == 1 { FUNDS / 2 } else { 1 };
            pool.add_remote(transfer(&key, nonce, 1, value)).unwrap();
        }
        assert_eq!(pool.stats(), (4, 0));

        // Nonce 0 got included and the balance no longer covers nonce 1.
        let address = key.address();
        let block = chain.advance(Vec::new(), |state| {
            state.set_nonce(address, 1);
            state.sub_balance(address, U256::from(FUNDS / 2));
        });
        pool.reset(Some(genesis.header()), block.header());

        assert_eq!(pool.stats(), (0, 2), "nonces above the unpayable one wait in the queue");
        assert_eq!(pool.pending_nonce(address), 1);
        pool.stop();
    }

    #[test]
    fn shallow_reorg_reinjects_dropped_transactions() {
        let key = TestKey::from_seed(1);
        let (chain, pool) = setup(chain_config(), TxPoolConfig::default(), &[&key]);
        let genesis = chain.head();
        let address = key.address();
        let tx = transfer(&key, 0, 1, 0);

        let included = chain.advance(vec![tx.clone()], |state| state.set_nonce(address, 1));
        pool.reset(Some(genesis.header()), included.header());
        assert!(!pool.has(&tx.hash()));

        let side = chain.fork(&genesis, Vec::new(), |_| {});
        let longer = chain.fork(&side, Vec::new(), |_| {});
        chain.set_head(longer.clone());
        pool.reset(Some(included.header()), longer.header());
        assert_eq!(pool.status(&[tx.hash()]), vec![TxStatus::Pending]);
        pool.stop();
    }

    #[test]
    fn full_pool_only_admits_missing_nonces() {
        let key = TestKey::from_seed(1);
        let other = TestKey::from_seed(2);
        let chain_config = chain_config().with_magma_block(Some(0));
        let config = TxPoolConfig::default()
            .with_exec_slots(16, 2)
            .with_non_exec_slots(64, 2);
        let (_chain, pool) = setup(chain_config, config, &[&key, &other]);

        for nonce in [0, 1, 3, 4] {
            pool.add_remote(transfer(&key, nonce, 1, 0)).unwrap();
        }
        assert_eq!(pool.stats(), (2, 2));

        assert!(matches!(
            pool.add_remote(transfer(&other, 0, 1, 0)),
            Err(TxPoolError::PoolFull { .. })
        ));
        assert!(matches!(
            pool.add_remote(transfer(&key, 5, 2, 0)),
            Err(TxPoolError::PoolFullNoMissingNonce { .. })
        ));

        let highest = pool.queued()[&key.address()][1].hash();
        pool.add_remote(transfer(&key, 2, 2, 0)).unwrap();
        assert!(!pool.has(&highest), "the highest queued nonce made room");
        assert_eq!(pool.stats(), (4, 0));
        pool.stop();
    }

    #[test]
    fn set_gas_price_clears_the_pool() {
        let key = TestKey::from_seed(1);
        let (_chain, pool) = setup(chain_config(), TxPoolConfig::default(), &[&key]);
        pool.add_remote(transfer(&key, 0, 1, 0)).unwrap();

        pool.set_gas_price(U256::from(2));
        assert_eq!(pool.gas_price(), U256::from(2));
        assert_eq!(pool.stats(), (0, 0));
        pool.add_remote(transfer(&key, 0, 2, 0)).unwrap();
        assert_eq!(pool.stats(), (1, 0));
        pool.stop();
    }

    #[test]
    fn local_submission_marks_the_whole_account_local() {
        let key = TestKey::from_seed(1);
        let (_chain, pool) = setup(chain_config(), TxPoolConfig::default(), &[&key]);
        pool.add_local(transfer(&key, 0, 1, 0)).unwrap();
        pool.add_remote(transfer(&key, 1, 1, 0)).unwrap();
        let locals = pool.local_txs();
        assert_eq!(locals[&key.address()].len(), 2);
        pool.stop();
    }

    #[test]
    fn journal_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transactions.rlp");
        let key = TestKey::from_seed(1);
        let genesis = Genesis::new(chain_config()).with_balance(key.address(), U256::from(FUNDS));
        let chain = TestChain::new(genesis);
        let config = TxPoolConfig::default().with_journal(Some(path.clone()));

        let pool = TxPool::new(config.clone(), chain_config(), chain.clone()).unwrap();
        pool.add_local(transfer(&key, 0, 1, 0)).unwrap();
        pool.add_local(transfer(&key, 2, 1, 0)).unwrap();
        pool.stop();

        let restarted = TxPool::new(config, chain_config(), chain).unwrap();
        assert_eq!(restarted.stats(), (1, 1));
        assert_eq!(restarted.local_txs()[&key.address()].len(), 2);
        restarted.stop();
    }

    #[test]
    fn spam_throttler_is_shared_with_the_chain() {
        let (chain, pool) = setup(chain_config(), TxPoolConfig::default(), &[]);
        pool.start_spam_throttler(None).unwrap();
        assert!(chain.spam_throttler().is_some());
        assert_eq!(
            pool.start_spam_throttler(None),
            Err(ThrottlerError::AlreadyRunning)
        );
        pool.stop_spam_throttler();
        assert!(chain.spam_throttler().is_none());
        assert!(pool.spam_throttler().is_none());
        pool.stop();
    }

    #[test]
    fn remote_batches_arrive_through_the_intake_loop() {
        let key = TestKey::from_seed(1);
        let (_chain, pool) = setup(chain_config(), TxPoolConfig::default(), &[&key]);
        let events = pool.subscribe_new_txs_event();
        pool.handle_tx_msg(vec![transfer(&key, 0, 1, 0), transfer(&key, 1, 1, 0)]);
        let event = events.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(event.txs.len(), 2);
        pool.stop();

        let key = TestKey::from_seed(2);
        let config = TxPoolConfig::default().with_deny_remote_tx(true);
        let (_chain, pool) = setup(chain_config(), config, &[&key]);
        pool.handle_tx_msg(vec![transfer(&key, 0, 1, 0)]);
        thread::sleep(RECV_TIMEOUT * 3);
        assert_eq!(pool.stats(), (0, 0));
        pool.stop();
    }

    #[test]
    fn cached_pending_halves_the_per_account_budget() {
        let keys: Vec<_> = (1..=3).map(TestKey::from_seed).collect();
        let refs: Vec<_> = keys.iter().collect();
        let (_chain, pool) = setup(chain_config(), TxPoolConfig::default(), &refs);
        for key in &keys {
            for nonce in 0..4 {
                pool.add_remote(transfer(key, nonce, 1, 0)).unwrap();
            }
        }
        assert!(pool.cached_pending_txs_by_count(0).is_empty());
        // 2 from the first account, then 1 from each of the others.
        assert_eq!(pool.cached_pending_txs_by_count(4).len(), 4);
        pool.stop();
    }
}
