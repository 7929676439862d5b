//! Chain and pool events and the feeds that fan them out.

use crate::types::{
    BlockRef,
    Log,
    Receipt,
    Transaction,
};
use alloy_primitives::B256;
use parking_lot::Mutex;

/// A block was imported, canonical or not, with its execution results.
#[derive(Debug, Clone)]
pub struct ChainEvent {
    pub block: BlockRef,
    pub hash: B256,
    pub logs: Vec<Log>,
    pub receipts: Vec<Receipt>,
}

/// The canonical head moved.
#[derive(Debug, Clone)]
pub struct ChainHeadEvent {
    pub block: BlockRef,
}

/// A block was imported on a side chain or dropped from the canonical one.
#[derive(Debug, Clone)]
pub struct ChainSideEvent {
    pub block: BlockRef,
}

/// Logs of blocks that left the canonical chain. Every log has `removed`
/// set.
#[derive(Debug, Clone)]
pub struct RemovedLogsEvent {
    pub logs: Vec<Log>,
}

/// Transactions became executable in the pool.
#[derive(Debug, Clone)]
pub struct NewTxsEvent {
    pub txs: Vec<Transaction>,
}

/// One-to-many event channel.
///
/// Every subscriber gets its own unbounded receiver. Subscribers that
/// dropped their receiver are pruned on the next send.
#[derive(Debug)]
pub struct Feed<T> {
    subscribers: Mutex<Vec<flume::Sender<T>>>,
}

impl<T> Default for Feed<T> {
    fn default() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }
}

impl<T: Clone> Feed<T> {
    pub fn subscribe(&self) -> flume::Receiver<T> {
        let (tx, rx) = flume::unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Delivers `value` to every live subscriber and returns how many got it.
    pub fn send(&self, value: T) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|subscriber| subscriber.send(value.clone()).is_ok());
        subscribers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dropped_subscribers_are_pruned() {
        let feed = Feed::<u64>::default();
        let first = feed.subscribe();
        let second = feed.subscribe();
        assert_eq!(feed.send(1), 2);

        drop(second);
        assert_eq!(feed.send(2), 1);
        assert_eq!(first.drain().collect::<Vec<_>>(), vec![1, 2]);
    }
}
