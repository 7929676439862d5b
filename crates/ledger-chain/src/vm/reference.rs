use crate::{
    state::StateDb,
    types::{
        KECCAK_EMPTY,
        Log,
        create_address,
    },
    vm::{
        ExecutionContext,
        ExecutionOutcome,
        Message,
        Vm,
        VmError,
    },
};
use alloy_primitives::{
    Address,
    B256,
    U256,
    keccak256,
};
use tracing::trace;

/// First input byte that makes a message revert.
pub const REVERT_MARKER: u8 = 0xfd;
/// Leading byte reserved for future code formats.
const RESERVED_CODE_PREFIX: u8 = 0xef;
/// Largest deployable contract, in bytes.
pub const MAX_CODE_SIZE: usize = 24_576;

const CREATE_DATA_GAS: u64 = 200;
const LOG_GAS: u64 = 375;
const LOG_TOPIC_GAS: u64 = 375;
const LOG_DATA_GAS: u64 = 8;
const SSTORE_GAS: u64 = 5_000;

/// Counter slot bumped by every call to a program account.
const CALL_COUNTER_SLOT: B256 = B256::ZERO;

/// A deterministic VM without an opcode interpreter.
///
/// - Calls move value. A call to a program account also emits one log with
///   topic `keccak(input)` and increments storage slot zero.
/// - Creations store the input as code of `create_address(from, nonce)`.
/// - Input starting with [`REVERT_MARKER`] reverts and returns unused gas.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReferenceVm;

impl ReferenceVm {
    fn fail(err: VmError, gas_left: u64) -> ExecutionOutcome {
        // Only a revert hands back the remaining gas.
        let gas_left = if err == VmError::ExecutionReverted {
            gas_left
        } else {
            0
        };
        ExecutionOutcome {
            gas_left,
            error: Some(err),
            ..Default::default()
        }
    }

    fn transfer(state: &mut StateDb, from: Address, to: Address, value: U256) {
        if value.is_zero() {
            return;
        }
        state.sub_balance(from, value);
        state.add_balance(to, value);
    }

    fn run_program(
        state: &mut StateDb,
        msg: &Message,
        to: Address,
        gas: u64,
    ) -> Result<u64, (VmError, u64)> {
        let log_cost = LOG_GAS + LOG_TOPIC_GAS + LOG_DATA_GAS * msg.input.len() as u64;
        let Some(gas) = gas.checked_sub(log_cost) else {
            return Err((VmError::OutOfGas, 0));
        };
        if msg.input.first() == Some(&REVERT_MARKER) {
            return Err((VmError::ExecutionReverted, gas));
        }
        state.add_log(Log::new(
            to,
            vec![keccak256(&msg.input)],
            msg.input.clone(),
        ));
        let Some(gas) = gas.checked_sub(SSTORE_GAS) else {
            return Err((VmError::OutOfGas, 0));
        };
        let counter = U256::from_be_slice(state.get_state(to, CALL_COUNTER_SLOT).as_slice());
        state.set_state(
            to,
            CALL_COUNTER_SLOT,
            B256::from(counter.wrapping_add(U256::from(1)).to_be_bytes::<32>()),
        );
        Ok(gas)
    }
}

impl Vm for ReferenceVm {
    fn call(
        &self,
        ctx: &ExecutionContext<'_>,
        state: &mut StateDb,
        msg: &Message,
        to: Address,
        gas: u64,
    ) -> ExecutionOutcome {
        if ctx.config.debug {
            trace!(
                target: "ledger-chain::vm",
                from = %msg.from,
                %to,
                value = %msg.value,
                gas,
                "Call"
            );
        }
        if state.get_balance(msg.from) < msg.value {
            return Self::fail(VmError::InsufficientBalance, gas);
        }

        let revision = state.snapshot();
        if !state.exist(to) {
            if msg.value.is_zero() {
                return ExecutionOutcome {
                    gas_left: gas,
                    ..Default::default()
                };
            }
            state.create_account(to);
        }
        Self::transfer(state, msg.from, to, msg.value);

        if !state.is_program_account(to) {
            return ExecutionOutcome {
                gas_left: gas,
                ..Default::default()
            };
        }
        match Self::run_program(state, msg, to, gas) {
            Ok(gas_left) => {
                ExecutionOutcome {
                    gas_left,
                    ..Default::default()
                }
            }
            Err((err, gas_left)) => {
                state.revert_to_snapshot(revision);
                Self::fail(err, gas_left)
            }
        }
    }

    fn create(
        &self,
        ctx: &ExecutionContext<'_>,
        state: &mut StateDb,
        msg: &Message,
        gas: u64,
    ) -> ExecutionOutcome {
        let address = create_address(msg.from, msg.nonce);
        if ctx.config.debug {
            trace!(
                target: "ledger-chain::vm",
                from = %msg.from,
                %address,
                code_len = msg.input.len(),
                gas,
                "Create"
            );
        }
        if state.get_balance(msg.from) < msg.value {
            return Self::fail(VmError::InsufficientBalance, gas);
        }
        let code_hash = state.get_code_hash(address);
        if state.get_nonce(address) != 0 || (code_hash != B256::ZERO && code_hash != KECCAK_EMPTY)
        {
            return Self::fail(VmError::ContractAddressCollision, 0);
        }

        let revision = state.snapshot();
        state.create_account(address);
        state.set_nonce(address, 1);
        Self::transfer(state, msg.from, address, msg.value);

        let result = match msg.input.first() {
            Some(&REVERT_MARKER) => Err((VmError::ExecutionReverted, gas)),
            Some(&RESERVED_CODE_PREFIX) => Err((VmError::InvalidCodeFormat, 0)),
            _ if msg.input.len() > MAX_CODE_SIZE => Err((VmError::MaxCodeSizeExceeded, 0)),
            _ => {
                match gas.checked_sub(CREATE_DATA_GAS * msg.input.len() as u64) {
                    Some(gas_left) => Ok(gas_left),
                    None => Err((VmError::CodeStoreOutOfGas, 0)),
                }
            }
        };
        match result {
            Ok(gas_left) => {
                state.set_code(address, msg.input.clone());
                ExecutionOutcome {
                    gas_left,
                    output: msg.input.clone(),
                    error: None,
                    contract_address: Some(address),
                }
            }
            Err((err, gas_left)) => {
                state.revert_to_snapshot(revision);
                ExecutionOutcome {
                    contract_address: Some(address),
                    ..Self::fail(err, gas_left)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::Database,
        state::StateDatabase,
        types::{
            EMPTY_ROOT_HASH,
            Header,
        },
        vm::{
            BlockContext,
            TxContext,
            VmConfig,
        },
    };
    use alloy_primitives::Bytes;
    use std::sync::Arc;

    const FROM: Address = Address::repeat_byte(0xaa);

    fn state() -> StateDb {
        let db = Arc::new(StateDatabase::new(Arc::new(Database::new_in_memory()), 0));
        let mut state = StateDb::new(EMPTY_ROOT_HASH, db).unwrap();
        state.add_balance(FROM, U256::from(1_000_000));
        state
    }

    fn run<R>(f: impl FnOnce(&ExecutionContext<'_>) -> R) -> R {
        let block = BlockContext::new(&Header::default(), Address::ZERO);
        let tx = TxContext {
            origin: FROM,
            gas_price: U256::from(1),
        };
        let config = VmConfig::default().with_debug(true);
        f(&ExecutionContext {
            block: &block,
            tx: &tx,
            config: &config,
        })
    }

    fn message(to: Option<Address>, value: u64, input: &'static [u8]) -> Message {
        Message {
            from: FROM,
            to,
            value: U256::from(value),
            input: Bytes::from_static(input),
            nonce: 0,
        }
    }

    #[test]
    fn plain_call_moves_value_without_gas() {
        let mut state = state();
        let to = Address::repeat_byte(1);
        let outcome = run(|ctx| ReferenceVm.call(ctx, &mut state, &message(Some(to), 400, b""), to, 1000));
        assert_eq!(outcome.gas_left, 1000);
        assert!(!outcome.failed());
        assert_eq!(state.get_balance(to), U256::from(400));
        assert_eq!(state.get_balance(FROM), U256::from(999_600));
    }

    #[test]
    fn insufficient_balance_is_consensus_fatal() {
        let mut state = state();
        let to = Address::repeat_byte(1);
        let outcome = run(|ctx| {
            ReferenceVm.call(ctx, &mut state, &message(Some(to), 2_000_000, b""), to, 1000)
        });
        assert!(outcome.error.as_ref().is_some_and(VmError::is_consensus_fatal));
        assert!(!state.exist(to), "failed transfer must not create the recipient");
    }

    #[test]
    fn create_then_call_emits_log_and_bumps_counter() {
        let mut state = state();
        let created = run(|ctx| ReferenceVm.create(ctx, &mut state, &message(None, 0, b"\x60\x00"), 10_000));
        let contract = created.contract_address.unwrap();
        assert!(!created.failed());
        assert_eq!(created.gas_left, 10_000 - 2 * CREATE_DATA_GAS);
        assert_eq!(contract, create_address(FROM, 0));
        assert!(state.is_program_account(contract));

        state.prepare(B256::repeat_byte(7), B256::ZERO, 0);
        let outcome = run(|ctx| {
            ReferenceVm.call(ctx, &mut state, &message(Some(contract), 0, b"\x01\x02"), contract, 100_000)
        });
        assert!(!outcome.failed());
        let logs = state.get_logs(B256::repeat_byte(7));
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].topics, vec![keccak256(b"\x01\x02")]);
        assert_eq!(state.get_state(contract, CALL_COUNTER_SLOT), B256::with_last_byte(1));
    }

    #[test]
    fn revert_marker_undoes_transfer_and_keeps_gas() {
        let mut state = state();
        let created = run(|ctx| ReferenceVm.create(ctx, &mut state, &message(None, 0, b"\x60"), 10_000));
        let contract = created.contract_address.unwrap();

        let outcome = run(|ctx| {
            ReferenceVm.call(ctx, &mut state, &message(Some(contract), 10, &[REVERT_MARKER]), contract, 10_000)
        });
        assert_eq!(outcome.error, Some(VmError::ExecutionReverted));
        assert_eq!(outcome.gas_left, 10_000 - LOG_GAS - LOG_TOPIC_GAS - LOG_DATA_GAS);
        assert_eq!(state.get_balance(contract), U256::ZERO);
        assert_eq!(state.get_balance(FROM), U256::from(1_000_000));
    }

    #[test]
    fn create_failures_consume_all_gas() {
        let mut state = state();
        let outcome = run(|ctx| ReferenceVm.create(ctx, &mut state, &message(None, 0, b"\x60\x00"), 100));
        assert_eq!(outcome.error, Some(VmError::CodeStoreOutOfGas));
        assert_eq!(outcome.gas_left, 0);
        assert!(!state.exist(create_address(FROM, 0)));

        let outcome = run(|ctx| ReferenceVm.create(ctx, &mut state, &message(None, 0, &[RESERVED_CODE_PREFIX]), 10_000));
        assert_eq!(outcome.error, Some(VmError::InvalidCodeFormat));
    }
}
