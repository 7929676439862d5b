//! Chain-wide tuning constants.

use std::time::Duration;

/// Number of recent block states kept referenced in memory before the GC loop
/// dereferences them.
pub const TRIES_IN_MEMORY: u64 = 128;

/// Non-archive nodes flush the head state to disk every this many blocks.
pub const DEFAULT_BLOCK_INTERVAL: u64 = 128;

/// Capacity of the future-block cache.
pub const MAX_FUTURE_BLOCKS: u64 = 256;

/// Blocks further than this ahead of the local clock are rejected outright.
pub const MAX_TIME_FUTURE_BLOCKS: u64 = 30;

/// Capacity of the bad-block cache.
pub const MAX_BAD_BLOCKS: u64 = 10;

/// Target size of a write batch before it is flushed to the backend.
pub const IDEAL_BATCH_SIZE: usize = 100 * 1024;

/// Preimages are written out once the in-memory set grows past this size.
pub const PREIMAGE_FLUSH_THRESHOLD: usize = 4 * 1024 * 1024;

/// Largest encoded transaction accepted by the pool.
pub const MAX_TX_DATA_SIZE: usize = 32 * 1024;

/// Depth of a chain split beyond which a reorg is logged as a warning.
pub const REORG_WARN_DEPTH: usize = 63;

/// Pool resets skip reinjection of dropped transactions above this depth.
pub const MAX_REORG_REINJECT_DEPTH: u64 = 64;

/// Buffer size of chain head subscriptions.
pub const CHAIN_HEAD_CHAN_SIZE: usize = 10;

/// Buffer size of the tx-message intake channel.
pub const TX_MSG_CHAN_SIZE: usize = 100;

/// Upper bound of txs whose balance is re-validated in a single demotion pass.
pub const DEMOTE_FULL_VALIDATION_LIMIT: usize = 1000;

/// How many missing trie entries the migration schedules per round.
pub const MIGRATION_MISSING_BATCH: usize = 1024;

/// Warm-up stops once the hot node cache is this full (percent).
pub const WARM_UP_CACHE_RATIO: u64 = 90;

/// Retry interval of the future-block processor.
pub const FUTURE_BLOCK_INTERVAL: Duration = Duration::from_secs(5);

/// Interval at which a long-running loop re-checks its shutdown flag.
pub const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// Bytes in a mebibyte.
pub const MIB: usize = 1024 * 1024;
