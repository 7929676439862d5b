use crate::{
    chain::{
        error::{
            ChainError,
            ChainResult,
        },
        headerchain::HeaderChain,
        state_transition::apply_transaction,
    },
    consensus::Engine,
    state::StateDb,
    types::{
        Block,
        Log,
        Receipt,
    },
    vm::{
        Vm,
        VmConfig,
    },
};
use std::{
    sync::Arc,
    time::{
        Duration,
        Instant,
    },
};

/// Execution results of one block.
#[derive(Debug, Clone, Default)]
pub struct ProcessResult {
    pub receipts: Vec<Receipt>,
    pub logs: Vec<Log>,
    pub used_gas: u64,
    pub elapsed: Duration,
}

/// Executes the transactions of a block on top of its parent state.
#[derive(Debug, Clone)]
pub struct StateProcessor {
    chain: Arc<HeaderChain>,
    vm: Arc<dyn Vm>,
}

impl StateProcessor {
    pub fn new(chain: Arc<HeaderChain>, vm: Arc<dyn Vm>) -> Self {
        Self { chain, vm }
    }

    fn engine(&self) -> &Arc<dyn Engine> {
        self.chain.engine()
    }

    /// Applies every transaction of `block` in order, then lets the engine
    /// finalise the state. The first failing transaction fails the block.
    pub fn process(
        &self,
        block: &Block,
        state: &mut StateDb,
        vm_config: &VmConfig,
    ) -> ChainResult<ProcessResult> {
        let start = Instant::now();
        let header = block.header();
        let author = self.engine().author(header)?;
        let config = self.chain.config();

        let mut used_gas = 0;
        let mut receipts = Vec::with_capacity(block.transactions().len());
        let mut logs = Vec::new();
        for (index, tx) in block.transactions().iter().enumerate() {
            let tx_index = u32::try_from(index).unwrap_or(u32::MAX);
            state.prepare(tx.hash(), block.hash(), tx_index);
            let receipt = apply_transaction(
                config,
                self.vm.as_ref(),
                author,
                state,
                header,
                tx,
                &mut used_gas,
                vm_config,
            )
            .map_err(|source| {
                ChainError::Apply {
                    index,
                    hash: tx.hash(),
                    source,
                }
            })?;
            logs.extend(receipt.logs.iter().cloned());
            receipts.push(receipt);
        }

        self.engine().finalize(
            self.chain.as_ref(),
            header,
            state,
            block.transactions(),
            &receipts,
        )?;
        Ok(ProcessResult {
            receipts,
            logs,
            used_gas,
            elapsed: start.elapsed(),
        })
    }
}
