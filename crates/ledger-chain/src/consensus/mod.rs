//! Interface of the consensus engine consumed by block import.

mod fake;

pub use fake::FakeEngine;

use crate::{
    params::ChainConfig,
    state::StateDb,
    types::{
        Header,
        Receipt,
        Transaction,
    },
};
use alloy_primitives::{
    Address,
    B256,
};
use std::{
    fmt::Debug,
    sync::Arc,
};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsensusError {
    #[error("Unknown ancestor")]
    UnknownAncestor,
    #[error("Block in the future")]
    FutureBlock,
    #[error("Pruned ancestor")]
    PrunedAncestor,
    #[error("Invalid block number: expected {expected}, got {got}")]
    InvalidNumber { expected: u64, got: u64 },
    #[error("Timestamp {time} is older than the parent's {parent_time}")]
    InvalidTimestamp { time: u64, parent_time: u64 },
    #[error("Invalid seal on block {0}")]
    InvalidSeal(u64),
    #[error("Header verification aborted")]
    Aborted,
}

pub type ConsensusResult<T = ()> = Result<T, ConsensusError>;

/// Read access to the header chain for engines.
pub trait ChainReader: Send + Sync {
    fn config(&self) -> &ChainConfig;

    fn current_header(&self) -> Header;

    fn get_header(&self, hash: B256, number: u64) -> Option<Header>;

    fn get_header_by_hash(&self, hash: B256) -> Option<Header>;

    fn get_header_by_number(&self, number: u64) -> Option<Header>;
}

/// Abort handle and ordered result stream of a batch verification.
///
/// Dropping or sending on the abort handle stops the verifier. Results
/// arrive in header order.
pub type VerifyHeadersHandle = (flume::Sender<()>, flume::Receiver<ConsensusResult>);

/// A consensus engine as seen by the chain.
pub trait Engine: Send + Sync + Debug {
    /// Account that receives the block's fees.
    fn author(&self, header: &Header) -> ConsensusResult<Address>;

    fn verify_header(&self, chain: &dyn ChainReader, header: &Header, seal: bool)
    -> ConsensusResult;

    /// Verifies a contiguous batch in the background.
    fn verify_headers(
        &self,
        chain: Arc<dyn ChainReader>,
        headers: Vec<Header>,
        seals: Vec<bool>,
    ) -> VerifyHeadersHandle;

    fn can_verify_headers_concurrently(&self) -> bool;

    /// Applies block rewards and other end-of-block state changes.
    fn finalize(
        &self,
        chain: &dyn ChainReader,
        header: &Header,
        state: &mut StateDb,
        txs: &[Transaction],
        receipts: &[Receipt],
    ) -> ConsensusResult;

    /// Lets the engine build its voting snapshot at `number`.
    fn create_snapshot(
        &self,
        chain: &dyn ChainReader,
        number: u64,
        hash: B256,
        parents: &[Header],
    ) -> ConsensusResult;

    /// Whether the state at `number` must reach disk, e.g. on staking
    /// update intervals.
    fn state_commit_required(&self, _number: u64) -> bool {
        false
    }

    /// Number of prefetch workers the engine would like. Zero defers to the
    /// cache configuration.
    fn prefetch_workers(&self) -> usize {
        0
    }
}
