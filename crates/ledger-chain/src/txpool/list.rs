//! Per-account nonce-sorted transaction lists and the pool-wide price heap.

use crate::types::Transaction;
use alloy_primitives::{
    Address,
    B256,
    U256,
};
use dashmap::DashMap;
use std::{
    cmp::Ordering,
    collections::{
        BTreeMap,
        BinaryHeap,
        HashSet,
    },
    sync::Arc,
};
use tracing::{
    error,
    trace,
};

/// Nonce-ordered map of one account's transactions with a lazily built
/// flattened view.
#[derive(Debug, Default)]
pub(crate) struct TxSortedMap {
    items: BTreeMap<u64, Transaction>,
    /// Sorted copy of `items`, dropped whenever the order may have changed.
    cache: Option<Vec<Transaction>>,
}

impl TxSortedMap {
    pub(crate) fn get(&self, nonce: u64) -> Option<&Transaction> {
        self.items.get(&nonce)
    }

    /// Inserts `tx`, overwriting any transaction with the same nonce.
    pub(crate) fn put(&mut self, tx: Transaction) {
        self.items.insert(tx.nonce(), tx);
        self.cache = None;
    }

    /// Removes every transaction with a nonce below `threshold`.
    pub(crate) fn forward(&mut self, threshold: u64) -> Vec<Transaction> {
        let keep = self.items.split_off(&threshold);
        let removed: Vec<_> = std::mem::replace(&mut self.items, keep)
            .into_values()
            .collect();
        if let Some(cache) = &mut self.cache {
            cache.drain(..removed.len().min(cache.len()));
        }
        removed
    }

    /// Removes every transaction matching `filter`.
    pub(crate) fn filter(&mut self, mut filter: impl FnMut(&Transaction) -> bool) -> Vec<Transaction> {
        let mut removed = Vec::new();
        self.items.retain(|_, tx| {
            if filter(tx) {
                removed.push(tx.clone());
                false
            } else {
                true
            }
        });
        if !removed.is_empty() {
            self.cache = None;
        }
        removed
    }

    /// Drops the highest nonces until at most `threshold` transactions are
    /// left.
    pub(crate) fn cap(&mut self, threshold: usize) -> Vec<Transaction> {
        let mut drops = Vec::new();
        while self.items.len() > threshold {
            match self.items.pop_last() {
                Some((_, tx)) => drops.push(tx),
                None => break,
            }
        }
        if let Some(cache) = &mut self.cache {
            cache.truncate(self.items.len());
        }
        drops
    }

    pub(crate) fn remove(&mut self, nonce: u64) -> bool {
        if self.items.remove(&nonce).is_none() {
            return false;
        }
        self.cache = None;
        true
    }

    /// Pops the contiguous run starting at the lowest nonce, provided that
    /// nonce is not above `start`.
    pub(crate) fn ready(&mut self, start: u64) -> Vec<Transaction> {
        self.ready_while(start, |_| true)
    }

    /// Like [`TxSortedMap::ready`] but stops at the first transaction priced
    /// below `base_fee`.
    pub(crate) fn ready_with_gas_price(&mut self, start: u64, base_fee: U256) -> Vec<Transaction> {
        self.ready_while(start, |tx| tx.gas_price() >= base_fee)
    }

    fn ready_while(&mut self, start: u64, accept: impl Fn(&Transaction) -> bool) -> Vec<Transaction> {
        let Some(mut next) = self.items.first_key_value().map(|(nonce, _)| *nonce) else {
            return Vec::new();
        };
        if next > start {
            return Vec::new();
        }
        let mut ready = Vec::new();
        while self.items.get(&next).is_some_and(&accept) {
            if let Some(tx) = self.items.remove(&next) {
                ready.push(tx);
            }
            next += 1;
        }
        if let Some(cache) = &mut self.cache {
            cache.drain(..ready.len().min(cache.len()));
        }
        ready
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    /// Nonce-sorted transactions, at most `count` of them unless `count` is
    /// zero.
    pub(crate) fn flatten_by_count(&mut self, count: usize) -> Vec<Transaction> {
        let cache = self
            .cache
            .get_or_insert_with(|| self.items.values().cloned().collect());
        let len = if count == 0 {
            cache.len()
        } else {
            count.min(cache.len())
        };
        cache[..len].to_vec()
    }

    pub(crate) fn flatten(&mut self) -> Vec<Transaction> {
        self.flatten_by_count(0)
    }

    pub(crate) fn last_nonce(&self) -> Option<u64> {
        self.items.last_key_value().map(|(nonce, _)| *nonce)
    }
}

/// Transactions of one account, either executable (`strict`, nonces must stay
/// contiguous) or queued.
#[derive(Debug)]
pub(crate) struct TxList {
    strict: bool,
    txs: TxSortedMap,
}

impl TxList {
    pub(crate) fn new(strict: bool) -> Self {
        Self {
            strict,
            txs: TxSortedMap::default(),
        }
    }

    pub(crate) fn overlaps(&self, tx: &Transaction) -> bool {
        self.txs.get(tx.nonce()).is_some()
    }

    pub(crate) fn get(&self, nonce: u64) -> Option<&Transaction> {
        self.txs.get(nonce)
    }

    /// Inserts `tx` and returns whether it went in together with the
    /// transaction it replaced.
    ///
    /// A cancel transaction always replaces. Otherwise a same-nonce
    /// replacement needs a strictly higher gas price and is only allowed
    /// once Magma is active.
    pub(crate) fn add(&mut self, tx: Transaction, magma: bool) -> (bool, Option<Transaction>) {
        let old = self.txs.get(tx.nonce()).cloned();
        if let Some(old) = &old {
            if tx.tx_type().is_cancel() {
                trace!(target: "ledger-chain::txpool", old = %old.hash(), new = %tx.hash(), "Replacing transaction with a cancel transaction");
            } else if !magma || old.gas_price() >= tx.gas_price() {
                trace!(
                    target: "ledger-chain::txpool",
                    nonce = tx.nonce(),
                    old_price = %old.gas_price(),
                    new_price = %tx.gas_price(),
                    "Nonce already exists in the pool"
                );
                return (false, None);
            }
        }
        self.txs.put(tx);
        (true, old)
    }

    pub(crate) fn forward(&mut self, threshold: u64) -> Vec<Transaction> {
        self.txs.forward(threshold)
    }

    /// Removes every transaction matching `filter`. Strict lists also give
    /// back everything above the lowest removed nonce as `invalids`.
    pub(crate) fn filter(
        &mut self,
        filter: impl FnMut(&Transaction) -> bool,
    ) -> (Vec<Transaction>, Vec<Transaction>) {
        let removed = self.txs.filter(filter);
        let mut invalids = Vec::new();
        if self.strict {
            if let Some(lowest) = removed.iter().map(Transaction::nonce).min() {
                invalids = self.txs.filter(|tx| tx.nonce() > lowest);
            }
        }
        (removed, invalids)
    }

    pub(crate) fn cap(&mut self, threshold: usize) -> Vec<Transaction> {
        self.txs.cap(threshold)
    }

    /// Removes the transaction with `nonce`. Strict lists also give back the
    /// now unexecutable transactions above it.
    pub(crate) fn remove(&mut self, nonce: u64) -> (bool, Vec<Transaction>) {
        if !self.txs.remove(nonce) {
            return (false, Vec::new());
        }
        if self.strict {
            return (true, self.txs.filter(|tx| tx.nonce() > nonce));
        }
        (true, Vec::new())
    }

    pub(crate) fn ready(&mut self, start: u64) -> Vec<Transaction> {
        self.txs.ready(start)
    }

    pub(crate) fn ready_with_gas_price(&mut self, start: u64, base_fee: U256) -> Vec<Transaction> {
        self.txs.ready_with_gas_price(start, base_fee)
    }

    pub(crate) fn len(&self) -> usize {
        self.txs.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn flatten(&mut self) -> Vec<Transaction> {
        self.txs.flatten()
    }

    pub(crate) fn flatten_by_count(&mut self, count: usize) -> Vec<Transaction> {
        self.txs.flatten_by_count(count)
    }

    pub(crate) fn last_nonce(&self) -> Option<u64> {
        self.txs.last_nonce()
    }
}

/// Accounts whose transactions are exempt from eviction.
#[derive(Debug, Default)]
pub(crate) struct AccountSet {
    accounts: HashSet<Address>,
}

impl AccountSet {
    pub(crate) fn contains(&self, address: &Address) -> bool {
        self.accounts.contains(address)
    }

    /// Only transactions with an already recovered sender can match.
    pub(crate) fn contains_tx(&self, tx: &Transaction) -> bool {
        tx.cached_sender()
            .is_some_and(|sender| self.contains(&sender))
    }

    pub(crate) fn add(&mut self, address: Address) {
        self.accounts.insert(address);
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Address> {
        self.accounts.iter()
    }
}

/// Heap entry ordered so that the cheapest transaction, and among equal
/// prices the highest nonce, is on top.
#[derive(Debug, Clone)]
struct PricedTx(Transaction);

impl Ord for PricedTx {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .0
            .gas_price()
            .cmp(&self.0.gas_price())
            .then_with(|| self.0.nonce().cmp(&other.0.nonce()))
    }
}

impl PartialOrd for PricedTx {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for PricedTx {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PricedTx {}

/// Price-sorted view over every pooled transaction.
///
/// Removals from the pool are not applied to the heap eagerly; they are
/// counted as stale entries and skipped when popped. The heap is rebuilt
/// from the lookup once a quarter of it is stale, so
/// `len() - stales() == all.len()` holds between operations.
#[derive(Debug)]
pub(crate) struct PricedList {
    all: Arc<DashMap<B256, Transaction>>,
    items: BinaryHeap<PricedTx>,
    stales: usize,
}

impl PricedList {
    pub(crate) fn new(all: Arc<DashMap<B256, Transaction>>) -> Self {
        Self {
            all,
            items: BinaryHeap::new(),
            stales: 0,
        }
    }

    pub(crate) fn put(&mut self, tx: Transaction) {
        self.items.push(PricedTx(tx));
    }

    /// Notes that a transaction left the lookup without being popped here.
    pub(crate) fn removed(&mut self) {
        self.stales += 1;
        if self.stales <= self.items.len() / 4 {
            return;
        }
        self.items = self
            .all
            .iter()
            .map(|entry| PricedTx(entry.value().clone()))
            .collect();
        self.stales = 0;
    }

    fn is_stale(&self, tx: &Transaction) -> bool {
        !self.all.contains_key(&tx.hash())
    }

    /// Whether `tx` is not more expensive than the cheapest remote
    /// transaction in the pool.
    pub(crate) fn underpriced(&mut self, tx: &Transaction, locals: &AccountSet) -> bool {
        if locals.contains_tx(tx) {
            return false;
        }
        while let Some(head) = self.items.peek() {
            if !self.is_stale(&head.0) {
                break;
            }
            self.items.pop();
            self.stales = self.stales.saturating_sub(1);
        }
        let Some(cheapest) = self.items.peek() else {
            error!(target: "ledger-chain::txpool", "Pricing query for empty pool");
            return false;
        };
        cheapest.0.gas_price() >= tx.gas_price()
    }

    /// Pops the `count` cheapest remote transactions. Local ones met on the
    /// way are kept.
    pub(crate) fn discard(&mut self, mut count: usize, locals: &AccountSet) -> Vec<Transaction> {
        let mut drop = Vec::with_capacity(count);
        let mut save = Vec::new();
        while count > 0 {
            let Some(PricedTx(tx)) = self.items.pop() else {
                break;
            };
            if self.is_stale(&tx) {
                self.stales = self.stales.saturating_sub(1);
                continue;
            }
            if locals.contains_tx(&tx) {
                save.push(tx);
            } else {
                drop.push(tx);
                count -= 1;
            }
        }
        for tx in save {
            self.put(tx);
        }
        drop
    }

    pub(crate) fn stales(&self) -> usize {
        self.stales
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        test_utils::TestKey,
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

    fn tx(key: &TestKey, nonce: u64, price: u64) -> Transaction {
        key.sign(TxData::Legacy(LegacyTx {
            nonce,
            gas_price: U256::from(price),
            gas: 21_000,
            to: TxKind::Call(Address::repeat_byte(1)),
            value: U256::from(1),
            input: Bytes::new(),
        }))
    }

    #[test]
    fn ready_stops_at_gap() {
        let key = TestKey::from_seed(1);
        let mut list = TxList::new(false);
        for nonce in [0, 1, 3] {
            assert!(list.add(tx(&key, nonce, 1), false).0);
        }
        let ready: Vec<_> = list.ready(0).iter().map(Transaction::nonce).collect();
        assert_eq!(ready, vec![0, 1]);
        assert_eq!(list.len(), 1);
        assert!(list.ready(2).is_empty(), "nonce 3 is not contiguous with 2");
    }

    #[test]
    fn ready_with_gas_price_stops_below_base_fee() {
        let key = TestKey::from_seed(1);
        let mut list = TxList::new(false);
        list.add(tx(&key, 0, 30), false);
        list.add(tx(&key, 1, 20), false);
        list.add(tx(&key, 2, 30), false);
        let ready = list.ready_with_gas_price(0, U256::from(25));
        assert_eq!(ready.len(), 1);
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn replacement_rules() {
        let key = TestKey::from_seed(1);
        let mut list = TxList::new(true);
        list.add(tx(&key, 0, 10), false);
        assert!(!list.add(tx(&key, 0, 20), false).0, "no replacement before Magma");
        assert!(!list.add(tx(&key, 0, 10), true).0, "equal price never replaces");
        let (inserted, old) = list.add(tx(&key, 0, 11), true);
        assert!(inserted);
        assert_eq!(old.map(|old| old.gas_price()), Some(U256::from(10)));

        let cancel = key.sign(TxData::Cancel(CancelTx {
            nonce: 0,
            gas_price: U256::from(1),
            gas: 21_000,
            from: key.address(),
        }));
        assert!(list.add(cancel, false).0, "cancel always replaces");
    }

    #[test]
    fn strict_filter_returns_invalids_above_removed() {
        let key = TestKey::from_seed(1);
        let mut list = TxList::new(true);
        for nonce in 0..4 {
            list.add(tx(&key, nonce, 1), false);
        }
        let (removed, invalids) = list.filter(|tx| tx.nonce() == 1);
        assert_eq!(removed.len(), 1);
        let invalid: Vec<_> = invalids.iter().map(Transaction::nonce).collect();
        assert_eq!(invalid, vec![2, 3]);
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn forward_and_cap_keep_flatten_cache_consistent() {
        let key = TestKey::from_seed(1);
        let mut list = TxList::new(false);
        for nonce in 0..6 {
            list.add(tx(&key, nonce, 1), false);
        }
        assert_eq!(list.flatten().len(), 6);
        assert_eq!(list.forward(2).len(), 2);
        assert_eq!(list.cap(2).len(), 2);
        let nonces: Vec<_> = list.flatten().iter().map(Transaction::nonce).collect();
        assert_eq!(nonces, vec![2, 3]);
        assert_eq!(list.flatten_by_count(1).len(), 1);
    }

    #[test]
    fn priced_list_discards_cheapest_remote_first() {
        let all = Arc::new(DashMap::new());
        let mut priced = PricedList::new(all.clone());
        let remote = TestKey::from_seed(1);
        let local = TestKey::from_seed(2);
        let mut locals = AccountSet::default();
        locals.add(local.address());

        for tx in [tx(&remote, 0, 5), tx(&remote, 1, 3), tx(&local, 0, 1)] {
            tx.sender(crate::test_utils::TEST_CHAIN_ID).unwrap();
            all.insert(tx.hash(), tx.clone());
            priced.put(tx);
        }
        let dropped = priced.discard(1, &locals);
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].gas_price(), U256::from(3), "local tx is protected");
        assert_eq!(priced.items.len(), 2);
        assert!(priced.underpriced(&tx(&remote, 2, 1), &locals));
    }

    #[test]
    fn stale_entries_trigger_reheap() {
        let all = Arc::new(DashMap::new());
        let mut priced = PricedList::new(all.clone());
        let key = TestKey::from_seed(3);
        let txs: Vec<_> = (0..4).map(|nonce| tx(&key, nonce, 1)).collect();
        for tx in &txs {
            all.insert(tx.hash(), tx.clone());
            priced.put(tx.clone());
        }
        all.remove(&txs[0].hash());
        priced.removed();
        assert_eq!(priced.stales(), 1);
        assert_eq!(priced.items.len() - priced.stales(), all.len());

        all.remove(&txs[1].hash());
        priced.removed();
        assert_eq!(priced.stales(), 0, "half the heap went stale, so it was rebuilt");
        assert_eq!(priced.items.len(), all.len());
    }
}
