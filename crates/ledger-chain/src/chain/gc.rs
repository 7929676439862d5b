//! Background dereferencing of state tries that fell out of the in-memory
//! retention window.

use crate::{
    constants::RECV_TIMEOUT,
    metrics,
    state::NodeDatabase,
};
use alloy_primitives::B256;
use std::{
    cmp::Reverse,
    collections::BinaryHeap,
    sync::{
        Arc,
        atomic::{
            AtomicBool,
            Ordering,
        },
    },
    thread::JoinHandle,
};
use tracing::{
    debug,
    trace,
};

/// Roots waiting for dereference, lowest block number first.
#[derive(Debug, Default)]
pub struct GcQueue {
    heap: BinaryHeap<Reverse<(u64, B256)>>,
}

impl GcQueue {
    pub fn push(&mut self, block_number: u64, root: B256) {
        self.heap.push(Reverse((block_number, root)));
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Pops every root whose block is at or below `chosen`.
    pub fn pop_until(&mut self, chosen: u64) -> Vec<(u64, B256)> {
        let mut ready = Vec::new();
        while let Some(Reverse((number, _))) = self.heap.peek() {
            if *number > chosen {
                break;
            }
            if let Some(Reverse(entry)) = self.heap.pop() {
                ready.push(entry);
            }
        }
        ready
    }

    /// Empties the queue in block order.
    pub fn drain(&mut self) -> Vec<(u64, B256)> {
        self.pop_until(u64::MAX)
    }
}

/// Handle of the GC loop thread.
///
/// Each committed root is sent with its block number. Once a block is
/// `tries_in_memory` behind the newest arrival its root is dereferenced.
#[derive(Debug)]
pub struct TrieGc {
    sender: Option<flume::Sender<(u64, B256)>>,
    handle: Option<JoinHandle<GcQueue>>,
    shutdown: Arc<AtomicBool>,
}

impl TrieGc {
    pub fn spawn(node_db: Arc<NodeDatabase>, tries_in_memory: u64) -> std::io::Result<Self> {
        let (sender, receiver) = flume::unbounded::<(u64, B256)>();
        let shutdown = Arc::new(AtomicBool::new(false));
        let stop = shutdown.clone();
        let handle = std::thread::Builder::new()
            .name("trie-gc".into())
            .spawn(move || {
                let mut queue = GcQueue::default();
                while !stop.load(Ordering::Relaxed) {
                    let (block_number, root) = match receiver.recv_timeout(RECV_TIMEOUT) {
                        Ok(entry) => entry,
                        Err(flume::RecvTimeoutError::Timeout) => continue,
                        Err(flume::RecvTimeoutError::Disconnected) => break,
                    };
                    queue.push(block_number, root);
                    if block_number > tries_in_memory {
                        let chosen = block_number - tries_in_memory;
                        for (number, root) in queue.pop_until(chosen) {
                            trace!(target: "ledger-chain::gc", number, %root, "Dereferencing state trie");
                            node_db.dereference(root);
                        }
                    }
                    metrics::set_gc_queue(queue.len());
                }
                // Entries sent before the stop request still belong to the queue.
                for (block_number, root) in receiver.try_iter() {
                    queue.push(block_number, root);
                }
                debug!(target: "ledger-chain::gc", pending = queue.len(), "Trie GC loop stopped");
                queue
            })?;
        Ok(Self {
            sender: Some(sender),
            handle: Some(handle),
            shutdown,
        })
    }

    /// Schedules `root` of `block_number` for eventual dereference.
    pub fn push(&self, block_number: u64, root: B256) {
        if let Some(sender) = &self.sender {
            let _ = sender.send((block_number, root));
        }
    }

    /// Stops the loop and hands back the roots it still holds.
    pub fn stop(&mut self) -> GcQueue {
        self.shutdown.store(true, Ordering::Relaxed);
        self.sender = None;
        self.handle
            .take()
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default()
    }
}

impl Drop for TrieGc {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::Database,
        state::Trie,
    };
    use std::time::{
        Duration,
        Instant,
    };

    #[test]
    fn queue_pops_in_block_order_up_to_chosen() {
        let mut queue = GcQueue::default();
        queue.push(5, B256::repeat_byte(5));
        queue.push(1, B256::repeat_byte(1));
        queue.push(3, B256::repeat_byte(3));

        let ready = queue.pop_until(3);
        assert_eq!(ready, [(1, B256::repeat_byte(1)), (3, B256::repeat_byte(3))]);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.drain(), [(5, B256::repeat_byte(5))]);
        assert!(queue.is_empty());
    }

    #[test]
    fn loop_dereferences_roots_behind_the_window() {
        let node_db = Arc::new(NodeDatabase::new(Arc::new(Database::new_in_memory()), 0));
        let mut roots = Vec::new();
        for i in 1..=3u8 {
            let mut trie = Trie::new_empty();
            trie.update(&[i; 32], &[i; 40]).unwrap();
            let (root, set) = trie.commit();
            node_db.insert_set(&set);
            node_db.reference(root, B256::ZERO);
            roots.push(root);
        }

        let mut gc = TrieGc::spawn(node_db.clone(), 1).unwrap();
        for (number, root) in roots.iter().enumerate() {
            gc.push(number as u64 + 1, *root);
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        while node_db.parents(roots[1]).is_some() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(node_db.parents(roots[0]), None, "block 1 is two blocks behind");
        assert_eq!(node_db.parents(roots[1]), None, "block 2 is one block behind");
        assert!(node_db.parents(roots[2]).is_some());

        let left = gc.stop().drain();
        assert_eq!(left, [(3, roots[2])]);
    }
}
