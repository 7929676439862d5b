//! Applying one transaction to the state.
//!
//! The transition buys gas from the fee payer (split with the sender when a
//! fee ratio is set), charges intrinsic gas, runs the message on the VM,
//! refunds unused gas and pays the fee to the block author.

use crate::{
    chain::error::ApplyError,
    params::{
        ChainConfig,
        REFUND_QUOTIENT,
    },
    state::StateDb,
    types::{
        Header,
        Receipt,
        Transaction,
        TxData,
        logs_bloom,
    },
    vm::{
        BlockContext,
        ExecutionContext,
        ExecutionOutcome,
        Message,
        TxContext,
        Vm,
        VmConfig,
        VmError,
        receipt_status,
    },
};
use alloy_primitives::{
    Address,
    TxKind,
    U256,
};
use tracing::trace;

/// Who pays for gas and in which proportion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct GasPayers {
    sender: Address,
    fee_payer: Address,
    /// Percentage paid by `fee_payer`. 100 when the fee payer pays all.
    fee_payer_share: u8,
}

impl GasPayers {
    fn of(tx: &Transaction, sender: Address, fee_payer: Address) -> Self {
        let fee_payer_share = match (tx.is_fee_delegated(), tx.fee_ratio()) {
            (true, Some(ratio)) => ratio.0,
            _ => 100,
        };
        Self {
            sender,
            fee_payer,
            fee_payer_share,
        }
    }

    /// Splits `amount` into `(fee_payer_part, sender_part)`.
    fn split(&self, amount: U256) -> (U256, U256) {
        let fee_payer = amount * U256::from(self.fee_payer_share) / U256::from(100u64);
        (fee_payer, amount - fee_payer)
    }
}

/// Gas price the transaction pays at `header`. The base fee replaces the
/// declared price once present.
pub fn effective_gas_price(header: &Header, tx: &Transaction) -> U256 {
    header.base_fee.unwrap_or_else(|| tx.gas_price())
}

/// Checks that the state can accept `tx`: nonce ordering, base fee and the
/// balances needed to buy gas.
fn pre_check(
    state: &mut StateDb,
    header: &Header,
    tx: &Transaction,
    payers: &GasPayers,
    price: U256,
) -> Result<(), ApplyError> {
    tx.validate_stateless()?;

    let state_nonce = state.get_nonce(payers.sender);
    if tx.nonce() < state_nonce {
        return Err(ApplyError::NonceTooLow {
            address: payers.sender,
            tx: tx.nonce(),
            state: state_nonce,
        });
    }
    if tx.nonce() > state_nonce {
        return Err(ApplyError::NonceTooHigh {
            address: payers.sender,
            tx: tx.nonce(),
            state: state_nonce,
        });
    }
    if let Some(base_fee) = header.base_fee {
        if tx.gas_price() < base_fee {
            return Err(ApplyError::GasPriceBelowBaseFee {
                gas_price: tx.gas_price(),
                base_fee,
            });
        }
    }

    let (fee_payer_part, sender_part) = payers.split(U256::from(tx.gas()) * price);
    if payers.fee_payer == payers.sender {
        let have = state.get_balance(payers.sender);
        if have < fee_payer_part + sender_part {
            return Err(ApplyError::InsufficientFundsFrom {
                address: payers.sender,
                have,
                want: fee_payer_part + sender_part,
            });
        }
        return Ok(());
    }
    let have = state.get_balance(payers.sender);
    if have < sender_part {
        return Err(ApplyError::InsufficientFundsFrom {
            address: payers.sender,
            have,
            want: sender_part,
        });
    }
    let have = state.get_balance(payers.fee_payer);
    if have < fee_payer_part {
        return Err(ApplyError::InsufficientFundsFeePayer {
            address: payers.fee_payer,
            have,
            want: fee_payer_part,
        });
    }
    Ok(())
}

fn execute(
    vm: &dyn Vm,
    ctx: &ExecutionContext<'_>,
    state: &mut StateDb,
    tx: &Transaction,
    sender: Address,
    gas: u64,
) -> ExecutionOutcome {
    let msg = Message {
        from: sender,
        to: tx.to().to().copied(),
        value: tx.value(),
        input: tx.input().clone(),
        nonce: tx.nonce(),
    };
    // Nonces move before execution so creations see the pre-transaction one.
    state.set_nonce(sender, tx.nonce() + 1);
    match tx.data() {
        TxData::Cancel(_) | TxData::ChainDataAnchoring(_) => {
            ExecutionOutcome {
                gas_left: gas,
                ..Default::default()
            }
        }
        _ => {
            match tx.to() {
                TxKind::Create => vm.create(ctx, state, &msg, gas),
                TxKind::Call(to) => vm.call(ctx, state, &msg, to, gas),
            }
        }
    }
}

/// Applies `tx` on top of `state` and returns its receipt.
///
/// Errors leave the block invalid. Failed executions are not errors: they
/// produce a receipt with a failure status.
#[allow(clippy::too_many_arguments)]
pub fn apply_transaction(
    config: &ChainConfig,
    vm: &dyn Vm,
    author: Address,
    state: &mut StateDb,
    header: &Header,
    tx: &Transaction,
    used_gas: &mut u64,
    vm_config: &VmConfig,
) -> Result<Receipt, ApplyError> {
    let sender = tx.sender(config.chain_id)?;
    let fee_payer = tx.validated_fee_payer(config.chain_id)?;
    let payers = GasPayers::of(tx, sender, fee_payer);
    let price = effective_gas_price(header, tx);

    if header.gas_limit != 0 && used_gas.saturating_add(tx.gas()) > header.gas_limit {
        return Err(ApplyError::GasLimitReached);
    }
    pre_check(state, header, tx, &payers, price)?;

    // Buy gas.
    let (fee_payer_part, sender_part) = payers.split(U256::from(tx.gas()) * price);
    state.sub_balance(payers.fee_payer, fee_payer_part);
    state.sub_balance(payers.sender, sender_part);

    let intrinsic = tx.intrinsic_gas()?;
    let Some(gas) = tx.gas().checked_sub(intrinsic) else {
        return Err(ApplyError::Vm(VmError::OutOfGas));
    };

    let block_ctx = BlockContext::new(header, author);
    let tx_ctx = TxContext {
        origin: sender,
        gas_price: price,
    };
    let ctx = ExecutionContext {
        block: &block_ctx,
        tx: &tx_ctx,
        config: vm_config,
    };
    let outcome = execute(vm, &ctx, state, tx, sender, gas);
    if let Some(err) = outcome.error.as_ref().filter(|err| err.is_consensus_fatal()) {
        return Err(ApplyError::Vm(err.clone()));
    }

    // Refund unused gas, capped as a share of what was used.
    let mut gas_left = outcome.gas_left;
    let spent = tx.gas() - gas_left;
    let refund = state.get_refund().min(spent / REFUND_QUOTIENT);
    gas_left += refund;
    let gas_used = tx.gas() - gas_left;
    let (fee_payer_refund, sender_refund) = payers.split(U256::from(gas_left) * price);
    state.add_balance(payers.fee_payer, fee_payer_refund);
    state.add_balance(payers.sender, sender_refund);

    if !config.deferred_tx_fee {
        state.add_balance(author, U256::from(gas_used) * price);
    }

    let mut receipt = Receipt::new(receipt_status(outcome.error.as_ref()), tx.hash(), gas_used);
    receipt.logs = state.get_logs(tx.hash());
    for log in &mut receipt.logs {
        log.block_number = header.number;
    }
    receipt.bloom = logs_bloom(&receipt.logs);
    if matches!(tx.to(), TxKind::Create) {
        receipt.contract_address = outcome.contract_address;
    }
    trace!(
        target: "ledger-chain::state_transition",
        hash = %tx.hash(),
        gas_used,
        status = ?receipt.status,
        "Applied transaction"
    );

    state.finalise(true);
    *used_gas += gas_used;
    Ok(receipt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::Database,
        params::TX_GAS,
        state::StateDatabase,
        test_utils::{
            TEST_CHAIN_ID,
            TestKey,
        },
        types::{
            EMPTY_ROOT_HASH,
            FeeDelegatedTx,
            FeeRatio,
            LegacyTx,
            ReceiptStatus,
        },
        vm::{
            REVERT_MARKER,
            ReferenceVm,
        },
    };
    use alloy_primitives::Bytes;
    use std::sync::Arc;

    const AUTHOR: Address = Address::repeat_byte(0xcc);

    fn config() -> ChainConfig {
        ChainConfig::default()
            .with_chain_id(TEST_CHAIN_ID)
            .with_unit_price(1)
    }

    fn state() -> StateDb {
        let db = Arc::new(StateDatabase::new(Arc::new(Database::new_in_memory()), 0));
        StateDb::new(EMPTY_ROOT_HASH, db).unwrap()
    }

    fn apply(state: &mut StateDb, tx: &Transaction) -> Result<Receipt, ApplyError> {
        let mut used_gas = 0;
        apply_transaction(
            &config(),
            &ReferenceVm,
            AUTHOR,
            state,
            &Header::default(),
            tx,
            &mut used_gas,
            &VmConfig::default(),
        )
    }

    fn legacy(nonce: u64, to: TxKind, value: u64, gas: u64, input: Bytes) -> TxData {
        TxData::Legacy(LegacyTx {
            nonce,
            gas_price: U256::from(1),
            gas,
            to,
            value: U256::from(value),
            input,
        })
    }

    #[test]
    fn value_transfer_pays_author_and_bumps_nonce() {
        let key = TestKey::from_seed(1);
        let mut state = state();
        state.add_balance(key.address(), U256::from(100_000));
        let to = Address::repeat_byte(9);

        let tx = key.sign(legacy(0, TxKind::Call(to), 1_000, TX_GAS, Bytes::new()));
        let receipt = apply(&mut state, &tx).unwrap();

        assert_eq!(receipt.status, ReceiptStatus::Successful);
        assert_eq!(receipt.gas_used, TX_GAS);
        assert_eq!(state.get_balance(to), U256::from(1_000));
        assert_eq!(state.get_balance(AUTHOR), U256::from(TX_GAS));
        assert_eq!(
            state.get_balance(key.address()),
            U256::from(100_000 - 1_000 - TX_GAS)
        );
        assert_eq!(state.get_nonce(key.address()), 1);
    }

    #[test]
    fn stale_and_future_nonces_are_rejected() {
        let key = TestKey::from_seed(1);
        let mut state = state();
        state.add_balance(key.address(), U256::from(100_000));
        state.set_nonce(key.address(), 3);
        let to = TxKind::Call(Address::repeat_byte(9));

        let err = apply(&mut state, &key.sign(legacy(2, to, 0, TX_GAS, Bytes::new()))).unwrap_err();
        assert!(matches!(err, ApplyError::NonceTooLow { tx: 2, state: 3, .. }));
        let err = apply(&mut state, &key.sign(legacy(4, to, 0, TX_GAS, Bytes::new()))).unwrap_err();
        assert!(matches!(err, ApplyError::NonceTooHigh { tx: 4, state: 3, .. }));
    }

    #[test]
    fn failed_execution_yields_receipt_status() {
        let key = TestKey::from_seed(1);
        let mut state = state();
        state.add_balance(key.address(), U256::from(1_000_000));

        let deploy = key.sign(legacy(0, TxKind::Create, 0, 100_000, Bytes::from_static(b"\x60")));
        let receipt = apply(&mut state, &deploy).unwrap();
        let contract = receipt.contract_address.unwrap();
        assert_eq!(receipt.status, ReceiptStatus::Successful);

        let call = key.sign(legacy(
            1,
            TxKind::Call(contract),
            0,
            100_000,
            Bytes::from_static(&[REVERT_MARKER]),
        ));
        let receipt = apply(&mut state, &call).unwrap();
        assert_eq!(receipt.status, ReceiptStatus::ErrExecutionReverted);
        assert!(receipt.logs.is_empty());
        assert_eq!(state.get_nonce(key.address()), 2, "failed calls still consume the nonce");
    }

    #[test]
    fn fee_ratio_splits_gas_between_sender_and_fee_payer() {
        let sender = TestKey::from_seed(1);
        let payer = TestKey::from_seed(2);
        let mut state = state();
        state.add_balance(sender.address(), U256::from(100_000));
        state.add_balance(payer.address(), U256::from(100_000));

        let gas = TX_GAS + crate::params::TX_GAS_FEE_DELEGATED_WITH_RATIO;
        let data = TxData::FeeDelegatedWithRatio(
            FeeDelegatedTx {
                nonce: 0,
                gas_price: U256::from(1),
                gas,
                to: Address::repeat_byte(9),
                value: U256::from(10),
                from: sender.address(),
            },
            FeeRatio(30),
        );
        let tx = sender.sign_fee_delegated(data, &payer);
        let receipt = apply(&mut state, &tx).unwrap();
        assert_eq!(receipt.gas_used, gas);

        let payer_part = U256::from(gas) * U256::from(30) / U256::from(100);
        let sender_part = U256::from(gas) - payer_part;
        assert_eq!(
            state.get_balance(payer.address()),
            U256::from(100_000) - payer_part
        );
        assert_eq!(
            state.get_balance(sender.address()),
            U256::from(100_000 - 10) - sender_part
        );
    }

    #[test]
    fn unpayable_fee_payer_is_rejected() {
        let sender = TestKey::from_seed(1);
        let payer = TestKey::from_seed(2);
        let mut state = state();
        state.add_balance(sender.address(), U256::from(100_000));

        let data = TxData::FeeDelegated(FeeDelegatedTx {
            nonce: 0,
            gas_price: U256::from(1),
            gas: 40_000,
            to: Address::repeat_byte(9),
            value: U256::from(10),
            from: sender.address(),
        });
        let tx = sender.sign_fee_delegated(data, &payer);
        let err = apply(&mut state, &tx).unwrap_err();
        assert!(matches!(err, ApplyError::InsufficientFundsFeePayer { .. }));
    }
}
