//! Execution seam between the state transition and a virtual machine.
//!
//! Block processing only needs to move value, store contract code and
//! observe logs and failures. It talks to an implementation of [`Vm`], which
//! mutates the [`StateDb`] it is handed and reports an [`ExecutionOutcome`].

mod error;
mod reference;

pub use error::{
    VmError,
    receipt_status,
};
pub use reference::{
    MAX_CODE_SIZE,
    ReferenceVm,
    REVERT_MARKER,
};

use crate::{
    state::StateDb,
    types::Header,
};
use alloy_primitives::{
    Address,
    Bytes,
    U256,
};
use std::fmt::Debug;

/// Knobs that do not change consensus results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VmConfig {
    /// Log every message at `trace` level.
    pub debug: bool,
}

impl VmConfig {
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }
}

/// Block-level values visible to executed code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockContext {
    pub number: u64,
    pub time: u64,
    pub block_score: U256,
    /// Block author as resolved by the consensus engine.
    pub coinbase: Address,
    pub rewardbase: Address,
    pub base_fee: Option<U256>,
    pub gas_limit: u64,
}

impl BlockContext {
    pub fn new(header: &Header, author: Address) -> Self {
        Self {
            number: header.number,
            time: header.time,
            block_score: header.block_score,
            coinbase: author,
            rewardbase: header.rewardbase,
            base_fee: header.base_fee,
            gas_limit: header.gas_limit,
        }
    }
}

/// Transaction-level values visible to executed code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxContext {
    pub origin: Address,
    /// Effective gas price. The block base fee overrides the declared price
    /// once it is set.
    pub gas_price: U256,
}

/// Everything an execution can observe about its environment.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionContext<'a> {
    pub block: &'a BlockContext,
    pub tx: &'a TxContext,
    pub config: &'a VmConfig,
}

/// A message derived from a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub from: Address,
    /// `None` creates a contract.
    pub to: Option<Address>,
    pub value: U256,
    pub input: Bytes,
    /// Sender nonce before the transaction was applied.
    pub nonce: u64,
}

/// Result of running a message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionOutcome {
    pub gas_left: u64,
    pub output: Bytes,
    pub error: Option<VmError>,
    pub contract_address: Option<Address>,
}

impl ExecutionOutcome {
    pub fn failed(&self) -> bool {
        self.error.is_some()
    }
}

/// A virtual machine the state transition can run messages on.
///
/// Implementations must leave `state` untouched by a failed execution, apart
/// from gas accounting done by the caller.
pub trait Vm: Send + Sync + Debug {
    /// Runs a message addressed to `to`.
    fn call(
        &self,
        ctx: &ExecutionContext<'_>,
        state: &mut StateDb,
        msg: &Message,
        to: Address,
        gas: u64,
    ) -> ExecutionOutcome;

    /// Deploys `msg.input` as the code of a new account.
    fn create(
        &self,
        ctx: &ExecutionContext<'_>,
        state: &mut StateDb,
        msg: &Message,
        gas: u64,
    ) -> ExecutionOutcome;
}
