#![allow(dead_code)]

use alloy_primitives::{
    Address,
    Bytes,
    TxKind,
    U256,
};
use ledger_chain::{
    chain::{
        Genesis,
        GenesisAccount,
    },
    params::ChainConfig,
    test_utils::{
        TEST_CHAIN_ID,
        TestKey,
    },
    types::{
        LegacyTx,
        Transaction,
        TxData,
    },
};
use std::time::Duration;

pub const FUNDS: u64 = 1_000_000_000;
pub const RECIPIENT: Address = Address::repeat_byte(0xee);
/// Account holding code, so calls to it emit a log.
pub const PROGRAM: Address = Address::repeat_byte(0xc0);
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

pub fn chain_config() -> ChainConfig {
    ChainConfig::default()
        .with_chain_id(TEST_CHAIN_ID)
        .with_unit_price(1)
}

/// Genesis funding every key, plus the program account.
pub fn genesis(config: ChainConfig, keys: &[&TestKey]) -> Genesis {
    let program = GenesisAccount {
        code: Bytes::from_static(&[0x60, 0x00]),
        ..Default::default()
    };
    keys.iter().fold(
        Genesis::new(config).with_account(PROGRAM, program),
        |genesis, key| genesis.with_balance(key.address(), U256::from(FUNDS)),
    )
}

pub fn transfer(key: &TestKey, nonce: u64, price: u64, value: u64) -> Transaction {
    key.sign(TxData::Legacy(LegacyTx {
        nonce,
        gas_price: U256::from(price),
        gas: 21_000,
        to: TxKind::Call(RECIPIENT),
        value: U256::from(value),
        input: Bytes::new(),
    }))
}

/// Call to [`PROGRAM`] whose log carries `input`.
pub fn program_call(key: &TestKey, nonce: u64, input: &'static [u8]) -> Transaction {
    key.sign(TxData::Legacy(LegacyTx {
        nonce,
        gas_price: U256::from(1),
        gas: 100_000,
        to: TxKind::Call(PROGRAM),
        value: U256::ZERO,
        input: Bytes::from_static(input),
    }))
}
