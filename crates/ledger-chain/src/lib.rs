//! Execution core of an account-based ledger node.
//!
//! # Overview
//!
//! The crate imports blocks into a canonical chain, executes their
//! transactions on a Merkle Patricia state trie and keeps a pool of
//! transactions waiting for inclusion.
//!
//! - [`db`] is the typed facade over the key-value store.
//! - [`chain`] holds the header chain, the blockchain engine (insertion,
//!   reorgs, rewinds, future and bad blocks), the prefetcher, processor and
//!   validator, trie garbage collection and live state migration.
//! - [`state`] is the state database with its in-memory node cache.
//! - [`txpool`] is the transaction pool with its local journal and spam
//!   throttler.
//! - [`consensus`] and [`vm`] are the seams for the consensus engine and the
//!   execution engine.
//!
//! ## Features
//!
//! - `test` - Exposes [`test_utils`] (deterministic keys, chain builders and
//!   a minimal pool backend) to downstream tests.

pub mod chain;
pub mod consensus;
pub mod constants;
pub mod db;
pub mod metrics;
pub mod params;
pub mod state;
pub mod txpool;
pub mod types;
pub mod utils;
pub mod vm;

#[cfg(any(test, feature = "test"))]
pub mod test_utils;
