use crate::types::TxError;
use alloy_primitives::{
    Address,
    B256,
    U256,
};

/// Reasons the pool refuses a transaction.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TxPoolError {
    #[error("Known transaction: {0}")]
    KnownTransaction(B256),
    #[error("Invalid chain id: expected {expected}, got {got:?}")]
    InvalidChainId { expected: u64, got: Option<u64> },
    #[error("Transaction type not supported at block {number}")]
    TxTypeNotSupported { number: u64 },
    #[error("Oversized data: {size} bytes")]
    OversizedData { size: usize },
    #[error("Invalid unit price: pool {pool}, tx {tx}")]
    InvalidUnitPrice { pool: U256, tx: U256 },
    #[error("Invalid gas fee cap: pool {pool}, tx {tx}")]
    InvalidGasFeeCap { pool: U256, tx: U256 },
    #[error("Invalid gas tip cap: pool {pool}, tx {tx}")]
    InvalidGasTipCap { pool: U256, tx: U256 },
    #[error("Max priority fee per gas {tip} higher than max fee per gas {fee_cap}")]
    TipAboveFeeCap { tip: U256, fee_cap: U256 },
    #[error("Max fee per gas {fee_cap} less than block base fee {base_fee}")]
    FeeCapBelowBaseFee { fee_cap: U256, base_fee: U256 },
    #[error("Gas price {gas_price} less than block base fee {base_fee}")]
    GasPriceBelowBaseFee { gas_price: U256, base_fee: U256 },
    #[error("Nonce too low: address {address}, tx {tx}, state {state}")]
    NonceTooLow { address: Address, tx: u64, state: u64 },
    #[error("Insufficient funds of the sender {address}: have {have}, want {want}")]
    InsufficientFundsFrom { address: Address, have: U256, want: U256 },
    #[error("Insufficient funds of the fee payer {address}: have {have}, want {want}")]
    InsufficientFundsFeePayer { address: Address, have: U256, want: U256 },
    #[error("Intrinsic gas too low: have {have}, want {want}")]
    IntrinsicGas { have: u64, want: u64 },
    #[error("Invalid sender: {0}")]
    InvalidSender(TxError),
    #[error("Invalid fee payer: {0}")]
    InvalidFeePayer(TxError),
    #[error("Invalid transaction: {0}")]
    InvalidTx(TxError),
    #[error("There is another tx which has the same nonce in the tx pool")]
    AlreadyNonceExistInPool,
    #[error("Transaction underpriced")]
    Underpriced,
    #[error("Tx pool is full: {size} transactions")]
    PoolFull { size: usize },
    #[error("Tx pool is full and the new tx does not fill a missing nonce: {size} transactions")]
    PoolFullNoMissingNonce { size: usize },
    #[error("Locally submitted anchoring transactions are not allowed")]
    AnchoringNotAllowed,
}

pub type TxPoolResult<T = ()> = Result<T, TxPoolError>;

/// Failures of the local transaction journal.
#[derive(thiserror::Error, Debug)]
pub enum JournalError {
    #[error("Journal I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Journal entry is malformed: {0}")]
    Decode(#[from] alloy_rlp::Error),
    #[error("No active journal")]
    NoActiveJournal,
}

pub type JournalResult<T = ()> = Result<T, JournalError>;

/// Invalid spam throttler configuration.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ThrottlerError {
    #[error("Target fail ratio must be within 0..=100, got {0}")]
    InvalidTargetFailRatio(u32),
    #[error("Minimum threshold {minimum} is above the initial threshold {initial}")]
    InvalidThresholds { minimum: u32, initial: u32 },
    #[error("Throttle tps must be positive")]
    ZeroThrottleTps,
    #[error("Spam throttler is already running")]
    AlreadyRunning,
    #[error("Failed to spawn the throttler loop: {0}")]
    Spawn(String),
}
