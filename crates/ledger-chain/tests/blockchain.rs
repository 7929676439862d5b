mod common;

use alloy_primitives::{
    Address,
    B256,
    U256,
};
use common::{
    EVENT_TIMEOUT,
    chain_config,
    genesis,
    program_call,
    transfer,
};
use ledger_chain::{
    chain::{
        BlockChain,
        CacheConfig,
        ChainError,
        Genesis,
    },
    db::Database,
    test_utils::{
        ChainMaker,
        TestKey,
        init_tracing,
        new_blockchain,
        new_blockchain_on,
    },
    types::BlockRef,
};
use std::{
    collections::HashSet,
    sync::Arc,
};

/// Non-archive chain flushing state every fourth block.
fn cache_config() -> CacheConfig {
    CacheConfig::default()
        .with_block_interval(4)
        .with_parallel_db_write(false)
}

/// Canonical chain of `len` blocks, one transfer each.
fn build(maker: &ChainMaker, key: &TestKey, len: usize) -> Vec<BlockRef> {
    maker.generate(&maker.genesis(), len, |block| {
        let nonce = block.nonce(key.address());
        block.add_tx(transfer(key, nonce, 1, 1));
    })
}

fn assert_head(chain: &BlockChain, number: u64) {
    assert_eq!(chain.current_header().number, number, "head header");
    assert_eq!(chain.current_fast_block().number(), number, "head fast block");
    assert_eq!(chain.current_block().number(), number, "head block");
}

fn assert_deleted_above(chain: &BlockChain, blocks: &[BlockRef], number: u64) {
    for block in blocks.iter().filter(|block| block.number() > number) {
        assert!(chain.get_canonical_hash(block.number()).is_none());
        assert!(chain.db().read_block(block.hash(), block.number()).unwrap().is_none());
        assert!(chain.db().read_receipts(block.hash(), block.number()).unwrap().is_none());
    }
}

fn assert_present_up_to(chain: &BlockChain, blocks: &[BlockRef], number: u64) {
    for block in blocks.iter().filter(|block| block.number() <= number) {
        assert_eq!(chain.get_canonical_hash(block.number()), Some(block.hash()));
        assert_eq!(chain.get_body(block.hash()).unwrap().len(), 1);
        assert_eq!(chain.get_receipts_by_block_hash(block.hash()).unwrap().len(), 1);
    }
}

#[test]
fn short_rewind_keeps_the_lower_blocks() {
    init_tracing();
    let key = TestKey::from_seed(1);
    let genesis = genesis(chain_config(), &[&key]);
    let maker = ChainMaker::new(&genesis);
    let blocks = build(&maker, &key, 8);

    let chain = new_blockchain(&genesis, cache_config()).unwrap();
    chain.insert_chain(&blocks).unwrap();
    assert_head(&chain, 8);

    chain.set_head(7).unwrap();
    assert_head(&chain, 7);
    assert_eq!(chain.current_block().hash(), blocks[6].hash());
    assert_deleted_above(&chain, &blocks, 7);
    assert_present_up_to(&chain, &blocks, 7);
    assert!(chain.has_state(chain.current_block().state_root()));
    chain.stop();
}

#[test]
fn deep_rewind_survives_a_restart() {
    init_tracing();
    let key = TestKey::from_seed(1);
    let genesis = genesis(chain_config(), &[&key]);
    let maker = ChainMaker::new(&genesis);
    let blocks = build(&maker, &key, 24);

    let db = Arc::new(Database::new_in_memory());
    let chain = new_blockchain_on(db.clone(), &genesis, cache_config()).unwrap();
    chain.insert_chain(&blocks).unwrap();
    assert_head(&chain, 24);

    chain.set_head(6).unwrap();
    assert_head(&chain, 6);
    assert_deleted_above(&chain, &blocks, 6);
    assert_present_up_to(&chain, &blocks, 6);
    let mut state = chain.state().unwrap();
    assert_eq!(state.get_nonce(key.address()), 6);
    chain.stop();

    let reopened = new_blockchain_on(db, &genesis, cache_config()).unwrap();
    assert_head(&reopened, 6);
    assert_eq!(reopened.current_block().hash(), blocks[5].hash());
    assert!(reopened.has_state(blocks[5].state_root()));

    // The rewound chain accepts the dropped blocks again.
    reopened.insert_chain(&blocks[6..]).unwrap();
    assert_head(&reopened, 24);
    reopened.stop();
}

#[test]
fn heavier_fork_replaces_the_canonical_chain() {
    init_tracing();
    let key = TestKey::from_seed(1);
    let genesis = genesis(chain_config(), &[&key]);
    let maker = ChainMaker::new(&genesis);

    let inputs: [&'static [u8]; 3] = [b"a1", b"a2", b"a3"];
    let side = maker.generate(&maker.genesis(), 3, |block| {
        let nonce = block.nonce(key.address());
        block.add_tx(program_call(&key, nonce, inputs[block.index()]));
    });
    // The first fork block mines the same transaction as the first side
    // block. The rest only transfer.
    let first = side[0].transactions()[0].clone();
    let fork = maker.generate(&maker.genesis(), 4, |block| {
        block.set_extra(vec![0xbb]);
        if block.index() == 0 {
            block.add_tx(first.clone());
        } else {
            let nonce = block.nonce(key.address());
            block.add_tx(transfer(&key, nonce, 1, 1));
        }
    });

    let chain = new_blockchain(&genesis, cache_config()).unwrap();
    chain.insert_chain(&side).unwrap();
    assert_eq!(chain.current_block().hash(), side[2].hash());
    assert_eq!(chain.get_logs(side[1].hash())[0].len(), 1);

    let heads = chain.subscribe_chain_head_event();
    let sides = chain.subscribe_chain_side_event();
    let removed = chain.subscribe_removed_logs_event();
    chain.insert_chain(&fork).unwrap();

    assert_eq!(chain.current_block().hash(), fork[3].hash());
    assert!(chain.get_td(fork[3].hash(), 4).unwrap() > chain.get_td(side[2].hash(), 3).unwrap());
    loop {
        let event = heads.recv_timeout(EVENT_TIMEOUT).unwrap();
        if event.block.hash() == fork[3].hash() {
            break;
        }
    }

    let mut dropped: HashSet<B256> = side.iter().map(|block| block.hash()).collect();
    while !dropped.is_empty() {
        let event = sides.recv_timeout(EVENT_TIMEOUT).unwrap();
        dropped.remove(&event.block.hash());
    }

    let logs = removed.recv_timeout(EVENT_TIMEOUT).unwrap().logs;
    assert_eq!(logs.len(), 3);
    assert!(logs.iter().all(|log| log.removed));

    let (_, entry) = chain.get_tx_and_lookup_info(first.hash()).unwrap();
    assert_eq!(entry.block_hash, fork[0].hash());
    for block in &side[1..] {
        let hash = block.transactions()[0].hash();
        assert!(chain.get_tx_and_lookup_info(hash).is_none());
    }
    for (number, block) in fork.iter().enumerate() {
        assert_eq!(chain.get_canonical_hash(number as u64 + 1), Some(block.hash()));
    }
    let mut state = chain.state().unwrap();
    assert_eq!(state.get_nonce(key.address()), 4);
    assert_eq!(state.get_balance(common::RECIPIENT), U256::from(3));
    chain.stop();
}

#[test]
fn receipt_chain_fills_bodies_without_execution() {
    init_tracing();
    let key = TestKey::from_seed(1);
    let genesis = genesis(chain_config(), &[&key]);
    let maker = ChainMaker::new(&genesis);
    let blocks = build(&maker, &key, 4);

    let source = new_blockchain(&genesis, cache_config()).unwrap();
    source.insert_chain(&blocks).unwrap();
    let receipts: Vec<_> = blocks
        .iter()
        .map(|block| source.get_receipts_by_block_hash(block.hash()).unwrap())
        .collect();

    let chain = new_blockchain(&genesis, cache_config()).unwrap();
    let headers: Vec<_> = blocks.iter().map(|block| block.header().clone()).collect();
    chain.insert_header_chain(&headers, 1).unwrap();

    let mut short = receipts.clone();
    short[1].clear();
    let err = chain.insert_receipt_chain(&blocks, short).unwrap_err();
    assert_eq!(err.index, 1);
    assert!(matches!(err.source, ChainError::ReceiptCountMismatch { .. }));

    let stats = chain.insert_receipt_chain(&blocks, receipts.clone()).unwrap();
    assert_eq!(stats.processed, 4);
    assert_eq!(chain.current_fast_block().hash(), blocks[3].hash());
    assert_eq!(chain.current_block().number(), 0, "receipt import must not execute");
    for block in &blocks {
        assert_eq!(chain.get_body(block.hash()).unwrap().len(), 1);
        assert_eq!(chain.get_receipts_by_block_hash(block.hash()).unwrap().len(), 1);
        let tx = block.transactions()[0].hash();
        assert_eq!(chain.get_tx_and_lookup_info(tx).unwrap().1.block_hash, block.hash());
    }

    let again = chain.insert_receipt_chain(&blocks, receipts).unwrap();
    assert_eq!(again.processed, 0);
    assert_eq!(again.ignored, 4);
    source.stop();
    chain.stop();
}

#[test]
fn stopped_migration_resumes_after_restart() {
    const ACCOUNTS: u64 = 2_000;
    init_tracing();
    let account = |seed: u64| Address::left_padding_from(&seed.to_be_bytes());
    let genesis = (1..=ACCOUNTS).fold(Genesis::new(chain_config()), |genesis, seed| {
        genesis.with_balance(account(seed), U256::from(seed))
    });

    let db = Arc::new(Database::new_in_memory());
    let chain = new_blockchain_on(db.clone(), &genesis, cache_config()).unwrap();
    chain
        .start_state_migration(0, chain.genesis().state_root())
        .unwrap();
    chain.stop();
    if db.in_migration() {
        // Shutdown keeps the pending migration for the next start.
        assert_eq!(db.migration_block_number(), Some(0));
    }

    let reopened = new_blockchain_on(db.clone(), &genesis, cache_config()).unwrap();
    reopened.wait_state_migration();
    assert!(!db.in_migration());
    assert_eq!(reopened.state_migration_status().error, None);
    let mut state = reopened.state().unwrap();
    for seed in [1, ACCOUNTS / 2, ACCOUNTS] {
        assert_eq!(state.get_balance(account(seed)), U256::from(seed));
    }
    reopened.stop();
}
