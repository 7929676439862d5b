use crate::{
    consensus::ConsensusError,
    db::DatabaseError,
    state::{
        StateError,
        TrieError,
    },
    types::{
        Bloom,
        TxError,
    },
    vm::VmError,
};
use alloy_primitives::{
    Address,
    B256,
    U256,
};

/// Reasons a block fails validation.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BlockError {
    #[error("Block {number} ({hash}) is already known")]
    KnownBlock { number: u64, hash: B256 },
    #[error("Transaction root mismatch: header {header}, computed {computed}")]
    TxRootMismatch { header: B256, computed: B256 },
    #[error("Invalid gas used: header {header}, computed {computed}")]
    GasUsedMismatch { header: u64, computed: u64 },
    #[error("Invalid bloom: header {header}, computed {computed}")]
    BloomMismatch { header: Box<Bloom>, computed: Box<Bloom> },
    #[error("Receipt root mismatch: header {header}, computed {computed}")]
    ReceiptRootMismatch { header: B256, computed: B256 },
    #[error("State root mismatch: header {header}, computed {computed}")]
    StateRootMismatch { header: B256, computed: B256 },
    #[error("Block gas limit reached")]
    GasLimitReached,
}

/// Reasons a transaction cannot be applied to the state.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ApplyError {
    #[error(transparent)]
    Tx(#[from] TxError),
    #[error("Nonce too low: address {address}, tx {tx}, state {state}")]
    NonceTooLow { address: Address, tx: u64, state: u64 },
    #[error("Nonce too high: address {address}, tx {tx}, state {state}")]
    NonceTooHigh { address: Address, tx: u64, state: u64 },
    #[error("Insufficient funds of sender {address}: have {have}, want {want}")]
    InsufficientFundsFrom { address: Address, have: U256, want: U256 },
    #[error("Insufficient funds of fee payer {address}: have {have}, want {want}")]
    InsufficientFundsFeePayer { address: Address, have: U256, want: U256 },
    #[error("Intrinsic gas too low: have {have}, want {want}")]
    IntrinsicGas { have: u64, want: u64 },
    #[error("Gas price {gas_price} is below the base fee {base_fee}")]
    GasPriceBelowBaseFee { gas_price: U256, base_fee: U256 },
    #[error("Gas limit reached")]
    GasLimitReached,
    #[error("Consensus error during execution: {0}")]
    Vm(VmError),
}

/// Failures of the blockchain engine.
#[derive(thiserror::Error, Debug)]
pub enum ChainError {
    #[error("Genesis block not found")]
    NoGenesis,
    #[error("Blacklisted hash {0}")]
    BlacklistedHash(B256),
    #[error(
        "non contiguous insert: item {prev_index} is #{prev_number} [{prev_hash}], item {index} is #{number} [{hash}] (parent [{parent_hash}])"
    )]
    NonContiguousInsert {
        prev_index: usize,
        prev_number: u64,
        prev_hash: B256,
        index: usize,
        number: u64,
        hash: B256,
        parent_hash: B256,
    },
    #[error("Insertion is aborted")]
    InsertAborted,
    #[error("Future block {number} is {ahead_secs}s ahead of the local clock")]
    FutureBlockTooFar { number: u64, ahead_secs: u64 },
    #[error("Block {number} ({hash}) not found")]
    MissingBlock { number: u64, hash: B256 },
    #[error("Missing header {0}")]
    MissingHeader(B256),
    #[error("Missing total block score of {hash} (#{number})")]
    MissingTd { number: u64, hash: B256 },
    #[error("Invalid new chain: no common ancestor")]
    InvalidNewChain,
    #[error("Invalid old chain: no common ancestor")]
    InvalidOldChain,
    #[error("State of block {number} ({root}) is not available")]
    MissingState { number: u64, root: B256 },
    #[error("Block {index} of the receipt chain has {receipts} receipts for {txs} transactions")]
    ReceiptCountMismatch { index: usize, receipts: usize, txs: usize },
    #[error("Chain is stopped")]
    Stopped,
    #[error("Parallel block write task failed")]
    WriteTask,
    #[error("The trie node cache is disabled")]
    CacheDisabled,
    #[error("Cache warm-up is already running")]
    WarmUpRunning,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Block(#[from] BlockError),
    #[error(transparent)]
    Consensus(#[from] ConsensusError),
    #[error("Transaction {index} ({hash}) failed: {source}")]
    Apply {
        index: usize,
        hash: B256,
        #[source]
        source: ApplyError,
    },
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Database(#[from] DatabaseError),
    #[error(transparent)]
    Migration(#[from] MigrationError),
}

impl From<TrieError> for ChainError {
    fn from(err: TrieError) -> Self {
        Self::State(StateError::Trie(err))
    }
}

impl ChainError {
    pub fn is_known_block(&self) -> bool {
        matches!(self, Self::Block(BlockError::KnownBlock { .. }))
    }

    pub fn consensus(&self) -> Option<&ConsensusError> {
        match self {
            Self::Consensus(err) => Some(err),
            _ => None,
        }
    }
}

pub type ChainResult<T = ()> = Result<T, ChainError>;

/// A chain insertion that stopped at the block with position `index`.
#[derive(thiserror::Error, Debug)]
#[error("Block {index} failed to import: {source}")]
pub struct InsertError {
    pub index: usize,
    #[source]
    pub source: ChainError,
}

impl InsertError {
    pub fn new(index: usize, source: impl Into<ChainError>) -> Self {
        Self {
            index,
            source: source.into(),
        }
    }
}

/// Failures of a state migration.
#[derive(thiserror::Error, Debug)]
pub enum MigrationError {
    #[error("State migration is already running")]
    AlreadyRunning,
    #[error("State migration is not running")]
    NotRunning,
    #[error("State migration was stopped")]
    Stopped,
    #[error("State root {0} of the migration block is not available")]
    MissingRoot(B256),
    #[error("Node {0} is missing in the migrated state")]
    MissingNode(B256),
    #[error("Node {0} differs between the old and the migrated state")]
    NodeMismatch(B256),
    #[error("Failed to read node {hash} from the old state: {reason}")]
    ReadFailed { hash: B256, reason: String },
    #[error("Failed to spawn migration worker")]
    Spawn(#[source] std::io::Error),
    #[error(transparent)]
    Trie(#[from] TrieError),
    #[error(transparent)]
    Database(#[from] DatabaseError),
}

pub type MigrationResult<T = ()> = Result<T, MigrationError>;
