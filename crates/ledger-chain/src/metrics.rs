//! Prometheus metrics for the chain, the state trie and the tx pool.

use crate::utils::cast::{
    lossy_u64_to_f64,
    lossy_usize_to_f64,
    usize_to_u64,
};
use metrics::{
    counter,
    gauge,
    histogram,
};
use std::time::Duration;

/// Record the current canonical head.
///
/// Committed as a `Gauge`: `ledger_chain_head_block`
pub fn set_head_block(number: u64) {
    gauge!("ledger_chain_head_block").set(lossy_u64_to_f64(number));
}

/// Record the current head header.
///
/// Committed as a `Gauge`: `ledger_chain_head_header`
pub fn set_head_header(number: u64) {
    gauge!("ledger_chain_head_header").set(lossy_u64_to_f64(number));
}

/// Record the time spent inserting one block, split by stage.
///
/// Committed as `Histogram`s:
/// - `ledger_chain_block_execution_seconds`
/// - `ledger_chain_block_validation_seconds`
/// - `ledger_chain_block_write_seconds`
pub fn record_block_insert(execution: Duration, validation: Duration, write: Duration) {
    histogram!("ledger_chain_block_execution_seconds").record(execution.as_secs_f64());
    histogram!("ledger_chain_block_validation_seconds").record(validation.as_secs_f64());
    histogram!("ledger_chain_block_write_seconds").record(write.as_secs_f64());
}

/// Record the time the background prefetch of a follow-up block took.
///
/// Committed as a `Histogram`: `ledger_chain_prefetch_seconds`
pub fn record_prefetch(elapsed: Duration) {
    histogram!("ledger_chain_prefetch_seconds").record(elapsed.as_secs_f64());
}

/// Record a chain reorganisation.
///
/// Committed as `Counter`s: `ledger_chain_reorg_add_total`, `ledger_chain_reorg_drop_total`
pub fn record_reorg(added: usize, dropped: usize) {
    counter!("ledger_chain_reorg_add_total").increment(usize_to_u64(added));
    counter!("ledger_chain_reorg_drop_total").increment(usize_to_u64(dropped));
}

/// Record a block rejected into the bad-block cache.
///
/// Committed as a `Counter`: `ledger_chain_bad_blocks_total`
pub fn record_bad_block() {
    counter!("ledger_chain_bad_blocks_total").increment(1);
}

/// Record the size of dirty trie nodes held in memory.
///
/// Committed as a `Gauge`: `ledger_chain_trie_memcache_bytes`
pub fn set_trie_dirty_size(bytes: usize) {
    gauge!("ledger_chain_trie_memcache_bytes").set(lossy_usize_to_f64(bytes));
}

/// Record a trie flush triggered by `cap` or `commit`.
///
/// Committed as a `Counter` and a `Histogram`:
/// `ledger_chain_trie_flushed_nodes_total`, `ledger_chain_trie_flush_seconds`
pub fn record_trie_flush(nodes: usize, elapsed: Duration) {
    counter!("ledger_chain_trie_flushed_nodes_total").increment(usize_to_u64(nodes));
    histogram!("ledger_chain_trie_flush_seconds").record(elapsed.as_secs_f64());
}

/// Record the number of state roots waiting in the GC queue.
///
/// Committed as a `Gauge`: `ledger_chain_trie_gc_queue`
pub fn set_gc_queue(len: usize) {
    gauge!("ledger_chain_trie_gc_queue").set(lossy_usize_to_f64(len));
}

/// Record the migration progress in percent.
///
/// Committed as a `Gauge`: `ledger_chain_migration_progress`
pub fn set_migration_progress(percent: f64) {
    gauge!("ledger_chain_migration_progress").set(percent);
}

/// Record pool occupancy.
///
/// Committed as `Gauge`s: `ledger_chain_txpool_pending`, `ledger_chain_txpool_queued`
pub fn set_txpool_counts(pending: usize, queued: usize) {
    gauge!("ledger_chain_txpool_pending").set(lossy_usize_to_f64(pending));
    gauge!("ledger_chain_txpool_queued").set(lossy_usize_to_f64(queued));
}

/// Record a transaction the pool refused.
///
/// Committed as a `Counter`: `ledger_chain_txpool_rejected_total`
pub fn record_tx_rejected() {
    counter!("ledger_chain_txpool_rejected_total").increment(1);
}

/// Record throttler classification sizes.
///
/// Committed as `Gauge`s: `ledger_chain_throttler_candidates`, `ledger_chain_throttler_throttled`
pub fn set_throttler_counts(candidates: usize, throttled: usize) {
    gauge!("ledger_chain_throttler_candidates").set(lossy_usize_to_f64(candidates));
    gauge!("ledger_chain_throttler_throttled").set(lossy_usize_to_f64(throttled));
}

/// Record transactions dropped because the throttle channel was full.
///
/// Committed as a `Counter`: `ledger_chain_throttler_dropped_total`
pub fn record_throttled_drop(count: usize) {
    if count > 0 {
        counter!("ledger_chain_throttler_dropped_total").increment(usize_to_u64(count));
    }
}
