use crate::constants::{
    DEFAULT_BLOCK_INTERVAL,
    TRIES_IN_MEMORY,
};

/// Memory and persistence settings of the blockchain engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Keep every state and commit after each block.
    pub archive_mode: bool,
    /// Dirty trie node budget before `cap` kicks in, in MiB.
    pub cache_size_mib: usize,
    /// States are committed every `block_interval` blocks.
    pub block_interval: u64,
    /// Recent states kept referenced in memory.
    pub tries_in_memory: u64,
    /// Clean trie node cache, in MiB. Zero disables it.
    pub trie_cache_limit_mib: usize,
    /// Enables the snapshot tree when non-zero.
    pub snapshot_cache_mib: usize,
    /// Write the TD, block, state and receipts of a block concurrently.
    pub parallel_db_write: bool,
    /// Workers that warm the caches with transactions of queued blocks.
    pub prefetch_workers: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            archive_mode: false,
            cache_size_mib: 512,
            block_interval: DEFAULT_BLOCK_INTERVAL,
            tries_in_memory: TRIES_IN_MEMORY,
            trie_cache_limit_mib: 64,
            snapshot_cache_mib: 0,
            parallel_db_write: true,
            prefetch_workers: 0,
        }
    }
}

impl CacheConfig {
    pub fn with_archive_mode(mut self, archive_mode: bool) -> Self {
        self.archive_mode = archive_mode;
        self
    }

    pub fn with_cache_size_mib(mut self, cache_size_mib: usize) -> Self {
        self.cache_size_mib = cache_size_mib;
        self
    }

    pub fn with_block_interval(mut self, block_interval: u64) -> Self {
        self.block_interval = block_interval;
        self
    }

    pub fn with_tries_in_memory(mut self, tries_in_memory: u64) -> Self {
        self.tries_in_memory = tries_in_memory;
        self
    }

    pub fn with_trie_cache_limit_mib(mut self, trie_cache_limit_mib: usize) -> Self {
        self.trie_cache_limit_mib = trie_cache_limit_mib;
        self
    }

    pub fn with_snapshot_cache_mib(mut self, snapshot_cache_mib: usize) -> Self {
        self.snapshot_cache_mib = snapshot_cache_mib;
        self
    }

    pub fn with_parallel_db_write(mut self, parallel_db_write: bool) -> Self {
        self.parallel_db_write = parallel_db_write;
        self
    }

    pub fn with_prefetch_workers(mut self, prefetch_workers: usize) -> Self {
        self.prefetch_workers = prefetch_workers;
        self
    }

    /// A zero interval falls back to the default.
    pub(crate) fn effective_block_interval(&self) -> u64 {
        if self.block_interval == 0 {
            DEFAULT_BLOCK_INTERVAL
        } else {
            self.block_interval
        }
    }
}
