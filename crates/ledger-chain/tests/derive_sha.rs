//! Runs in its own test binary: the derive-sha selector is process-wide.

mod common;

use common::{
    chain_config,
    genesis,
    transfer,
};
use ledger_chain::{
    chain::CacheConfig,
    params::DeriveShaImpl,
    test_utils::{
        ChainMaker,
        TestKey,
        init_tracing,
        new_blockchain,
    },
    types::{
        Block,
        Transaction,
        derive_sha_by,
    },
};
use std::sync::Arc;

fn root_of(implementation: DeriveShaImpl, txs: &[Transaction]) -> alloy_primitives::B256 {
    derive_sha_by(implementation, txs, |tx, out| tx.encode_envelope(out))
}

#[test]
fn configured_derive_sha_roots_blocks() {
    init_tracing();
    let key = TestKey::from_seed(1);
    let genesis = genesis(
        chain_config().with_derive_sha_impl(DeriveShaImpl::Simple),
        &[&key],
    );
    let maker = ChainMaker::new(&genesis);
    let blocks = maker.generate(&maker.genesis(), 3, |block| {
        let nonce = block.nonce(key.address());
        block.add_tx(transfer(&key, nonce, 1, 1));
        block.add_tx(transfer(&key, nonce + 1, 1, 1));
    });
    for block in &blocks {
        let txs = block.transactions();
        assert_eq!(block.header().tx_root, root_of(DeriveShaImpl::Simple, txs));
        assert_ne!(block.header().tx_root, root_of(DeriveShaImpl::Trie, txs));
    }

    let chain = new_blockchain(&genesis, CacheConfig::default()).unwrap();
    chain.insert_chain(&blocks[..2]).unwrap();
    assert_eq!(chain.current_block().hash(), blocks[1].hash());

    // A trie-rooted body no longer matches its header.
    let mut header = blocks[2].header().clone();
    header.tx_root = root_of(DeriveShaImpl::Trie, blocks[2].transactions());
    let trie_rooted = Arc::new(Block::new(header, blocks[2].transactions().to_vec()));
    assert!(chain.insert_chain(&[trie_rooted]).is_err());
    assert_eq!(chain.current_block().hash(), blocks[1].hash());

    chain.insert_chain(&blocks[2..]).unwrap();
    assert_eq!(chain.current_block().number(), 3);
    chain.stop();
}
