//! Keys, chains and block builders shared by unit and integration tests.

use crate::{
    chain::{
        ApplyError,
        BlockChain,
        CacheConfig,
        ChainHeadEvent,
        ChainResult,
        Feed,
        Genesis,
        apply_transaction,
    },
    consensus::{
        ChainReader,
        Engine,
        FakeEngine,
    },
    db::Database,
    params::{
        ChainConfig,
        TX_GAS,
    },
    state::{
        StateDatabase,
        StateDb,
    },
    txpool::{
        PoolChain,
        SpamThrottler,
    },
    types::{
        Block,
        BlockRef,
        FeePayerSig,
        Header,
        LegacyTx,
        Receipt,
        Transaction,
        TxData,
        TxSignature,
        create_bloom,
        init_derive_sha,
        receipt_root,
        tx_root,
    },
    vm::{
        ReferenceVm,
        Vm,
        VmConfig,
    },
};
use alloy_primitives::{
    Address,
    B256,
    Bytes,
    TxKind,
    U256,
    keccak256,
};
use alloy_signer::SignerSync;
use alloy_signer_local::PrivateKeySigner;
use parking_lot::RwLock;
use std::{
    collections::HashMap,
    sync::Arc,
};

/// Chain id every test transaction is signed for.
pub const TEST_CHAIN_ID: u64 = 1001;

/// Installs a fmt subscriber when `TEST_TRACE` is set. Safe to call from
/// every test.
pub fn init_tracing() {
    use tracing_subscriber::{
        filter::filter_fn,
        prelude::*,
    };
    let Ok(value) = std::env::var("TEST_TRACE") else {
        return;
    };
    let level = match value.as_str() {
        "true" | "debug" | "on" => tracing::Level::DEBUG,
        "trace" => tracing::Level::TRACE,
        "info" => tracing::Level::INFO,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => return,
    };
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .with(filter_fn(move |metadata| {
            metadata.level() <= &level && !metadata.target().starts_with("sled")
        }))
        .try_init();
}

/// Deterministic secp256k1 key.
#[derive(Debug, Clone)]
pub struct TestKey {
    signer: PrivateKeySigner,
}

impl TestKey {
    pub fn from_seed(seed: u64) -> Self {
        let secret = keccak256(seed.to_be_bytes());
        let signer = PrivateKeySigner::from_bytes(&secret).expect("Failed to create test key");
        Self { signer }
    }

    pub fn address(&self) -> Address {
        self.signer.address()
    }

    fn signature(&self, hash: B256, chain_id: Option<u64>) -> TxSignature {
        let signature = self
            .signer
            .sign_hash_sync(&hash)
            .expect("Failed to sign test hash");
        TxSignature::from_parity(&signature, chain_id)
    }

    /// Signs `data` for [`TEST_CHAIN_ID`].
    pub fn sign(&self, data: TxData) -> Transaction {
        self.sign_for(data, TEST_CHAIN_ID)
    }

    pub fn sign_for(&self, data: TxData, chain_id: u64) -> Transaction {
        let hash = data.signing_hash(chain_id);
        let eip155 = (!data.tx_type().is_ethereum_typed()).then_some(chain_id);
        Transaction::new(data, self.signature(hash, eip155), None)
    }

    /// Signs `data` as sender and `fee_payer` as payer.
    pub fn sign_fee_delegated(&self, data: TxData, fee_payer: &TestKey) -> Transaction {
        let hash = data.signing_hash(TEST_CHAIN_ID);
        let signature = self.signature(hash, Some(TEST_CHAIN_ID));
        let payer_hash = data.fee_payer_signing_hash(fee_payer.address(), TEST_CHAIN_ID);
        let payer = FeePayerSig {
            address: fee_payer.address(),
            signature: fee_payer.signature(payer_hash, Some(TEST_CHAIN_ID)),
        };
        Transaction::new(data, signature, Some(payer))
    }
}

/// Header reader with no headers, enough for engines that only touch the
/// state on finalisation.
struct NoHeaders(ChainConfig);

impl ChainReader for NoHeaders {
    fn config(&self) -> &ChainConfig {
        &self.0
    }

    fn current_header(&self) -> Header {
        Header::default()
    }

    fn get_header(&self, _hash: B256, _number: u64) -> Option<Header> {
        None
    }

    fn get_header_by_hash(&self, _hash: B256) -> Option<Header> {
        None
    }

    fn get_header_by_number(&self, _number: u64) -> Option<Header> {
        None
    }
}

/// A block under construction in [`ChainMaker::generate`].
pub struct BlockGen<'a> {
    index: usize,
    header: Header,
    state: &'a mut StateDb,
    config: &'a ChainConfig,
    vm: &'a dyn Vm,
    txs: Vec<Transaction>,
    receipts: Vec<Receipt>,
    used_gas: u64,
}

impl BlockGen<'_> {
    /// Position of the block in the generated batch.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn number(&self) -> u64 {
        self.header.number
    }

    pub fn set_rewardbase(&mut self, rewardbase: Address) {
        self.header.rewardbase = rewardbase;
    }

    /// Changes the block hash without touching its contents.
    pub fn set_extra(&mut self, extra: impl Into<Bytes>) {
        self.header.extra = extra.into();
    }

    pub fn set_block_score(&mut self, score: U256) {
        self.header.block_score = score;
    }

    pub fn set_time(&mut self, time: u64) {
        self.header.time = time;
    }

    pub fn nonce(&mut self, address: Address) -> u64 {
        self.state.get_nonce(address)
    }

    pub fn balance(&mut self, address: Address) -> U256 {
        self.state.get_balance(address)
    }

    /// Executes `tx` on the block state and appends it.
    pub fn try_add_tx(&mut self, tx: Transaction) -> Result<(), ApplyError> {
        let index = u32::try_from(self.txs.len()).unwrap_or(u32::MAX);
        self.state.prepare(tx.hash(), B256::ZERO, index);
        let receipt = apply_transaction(
            self.config,
            self.vm,
            self.header.rewardbase,
            self.state,
            &self.header,
            &tx,
            &mut self.used_gas,
            &VmConfig::default(),
        )?;
        self.txs.push(tx);
        self.receipts.push(receipt);
        Ok(())
    }

    pub fn add_tx(&mut self, tx: Transaction) {
        self.try_add_tx(tx).expect("Failed to apply generated transaction");
    }
}

/// Builds valid blocks on a scratch copy of the genesis state, for import
/// into a separately opened chain.
pub struct ChainMaker {
    config: ChainConfig,
    engine: Arc<dyn Engine>,
    vm: Arc<dyn Vm>,
    state_db: Arc<StateDatabase>,
    genesis: BlockRef,
}

impl ChainMaker {
    /// Builder for chains of `genesis`. Selects the genesis derive-sha
    /// implementation, like opening a chain does.
    pub fn new(genesis: &Genesis) -> Self {
        init_derive_sha(genesis.config.derive_sha_impl);
        let db = Arc::new(Database::new_in_memory());
        let block = genesis.commit(&db).expect("Failed to commit scratch genesis");
        Self {
            config: genesis.config.clone(),
            engine: Arc::new(FakeEngine::new()),
            vm: Arc::new(ReferenceVm),
            state_db: Arc::new(StateDatabase::new(db, 0)),
            genesis: block,
        }
    }

    /// Engine that finalises generated blocks. It must match the engine of
    /// the importing chain.
    pub fn with_engine(mut self, engine: Arc<dyn Engine>) -> Self {
        self.engine = engine;
        self
    }

    pub fn genesis(&self) -> BlockRef {
        self.genesis.clone()
    }

    /// Generates `count` blocks on top of `parent`, letting `build` fill each
    /// one.
    pub fn generate(
        &self,
        parent: &BlockRef,
        count: usize,
        mut build: impl FnMut(&mut BlockGen<'_>),
    ) -> Vec<BlockRef> {
        let reader = NoHeaders(self.config.clone());
        let mut parent = parent.clone();
        let mut blocks = Vec::with_capacity(count);
        for index in 0..count {
            let mut state = StateDb::new(parent.state_root(), self.state_db.clone())
                .expect("Parent state of generated block is missing");
            let parent_header = parent.header();
            let header = Header {
                parent_hash: parent.hash(),
                number: parent_header.number + 1,
                time: parent_header.time + 10,
                gas_limit: parent_header.gas_limit,
                block_score: U256::from(1),
                rewardbase: parent_header.rewardbase,
                base_fee: parent_header.base_fee,
                ..Default::default()
            };
            let mut block_gen = BlockGen {
                index,
                header,
                state: &mut state,
                config: &self.config,
                vm: self.vm.as_ref(),
                txs: Vec::new(),
                receipts: Vec::new(),
                used_gas: 0,
            };
            build(&mut block_gen);
            let BlockGen {
                mut header,
                txs,
                receipts,
                used_gas,
                ..
            } = block_gen;

            self.engine
                .finalize(&reader, &header, &mut state, &txs, &receipts)
                .expect("Failed to finalize generated block");
            header.gas_used = used_gas;
            header.bloom = create_bloom(&receipts);
            header.receipt_root = receipt_root(&receipts);
            header.tx_root = tx_root(&txs);
            header.state_root = state.commit(true).expect("Failed to commit generated state");
            self.state_db
                .node_db()
                .commit(header.state_root, false, header.number)
                .expect("Failed to flush generated state");

            let block = Arc::new(Block::new(header, txs));
            blocks.push(block.clone());
            parent = block;
        }
        blocks
    }
}

/// Opens a chain over a fresh in-memory database holding `genesis`.
/// Genesis on [`TEST_CHAIN_ID`] at unit price 1, funding every key with
/// `balance`.
pub fn funded_genesis(keys: &[&TestKey], balance: U256) -> Genesis {
    let config = ChainConfig::default()
        .with_chain_id(TEST_CHAIN_ID)
        .with_unit_price(1);
    keys.iter().fold(Genesis::new(config), |genesis, key| {
        genesis.with_balance(key.address(), balance)
    })
}

/// Plain value transfer priced for [`funded_genesis`] chains.
pub fn transfer_tx(key: &TestKey, nonce: u64, to: Address, value: u64) -> Transaction {
    key.sign(TxData::Legacy(LegacyTx {
        nonce,
        gas_price: U256::from(1),
        gas: TX_GAS,
        to: TxKind::Call(to),
        value: U256::from(value),
        input: Bytes::new(),
    }))
}

pub fn new_blockchain(genesis: &Genesis, cache_config: CacheConfig) -> ChainResult<Arc<BlockChain>> {
    new_blockchain_on(Arc::new(Database::new_in_memory()), genesis, cache_config)
}

pub fn new_blockchain_on(
    db: Arc<Database>,
    genesis: &Genesis,
    cache_config: CacheConfig,
) -> ChainResult<Arc<BlockChain>> {
    genesis.commit(&db)?;
    BlockChain::new(
        db,
        cache_config,
        genesis.config.clone(),
        Arc::new(FakeEngine::new()),
        Arc::new(ReferenceVm),
    )
}

/// Minimal [`PoolChain`] whose blocks are assembled by hand, without
/// execution.
pub struct TestChain {
    state_db: Arc<StateDatabase>,
    head: RwLock<BlockRef>,
    blocks: RwLock<HashMap<B256, BlockRef>>,
    head_feed: Feed<ChainHeadEvent>,
    throttler: RwLock<Option<Arc<SpamThrottler>>>,
}

impl TestChain {
    pub fn new(genesis: Genesis) -> Arc<Self> {
        let db = Arc::new(Database::new_in_memory());
        let block = genesis.commit(&db).expect("Failed to commit test genesis");
        let mut blocks = HashMap::new();
        blocks.insert(block.hash(), block.clone());
        Arc::new(Self {
            state_db: Arc::new(StateDatabase::new(db, 0)),
            head: RwLock::new(block),
            blocks: RwLock::new(blocks),
            head_feed: Feed::default(),
            throttler: RwLock::new(None),
        })
    }

    pub fn head(&self) -> BlockRef {
        self.head.read().clone()
    }

    /// Builds a child of `parent` holding `txs`, whose state is the parent
    /// state changed by `update`. The head does not move.
    pub fn fork(
        &self,
        parent: &BlockRef,
        txs: Vec<Transaction>,
        update: impl FnOnce(&mut StateDb),
    ) -> BlockRef {
        let mut state = StateDb::new(parent.state_root(), self.state_db.clone())
            .expect("Parent state of test block is missing");
        update(&mut state);
        let root = state.commit(true).expect("Failed to commit test state");
        let number = parent.number() + 1;
        self.state_db
            .node_db()
            .commit(root, false, number)
            .expect("Failed to flush test state");
        let header = Header {
            parent_hash: parent.hash(),
            number,
            time: parent.time() + 1,
            state_root: root,
            tx_root: tx_root(&txs),
            gas_limit: parent.header().gas_limit,
            base_fee: parent.header().base_fee,
            block_score: U256::from(1),
            ..Default::default()
        };
        let block = Arc::new(Block::new(header, txs));
        self.blocks.write().insert(block.hash(), block.clone());
        block
    }

    /// Moves the head to `block` and announces it.
    pub fn set_head(&self, block: BlockRef) {
        *self.head.write() = block.clone();
        self.head_feed.send(ChainHeadEvent { block });
    }

    /// [`TestChain::fork`] on the head, then [`TestChain::set_head`].
    pub fn advance(&self, txs: Vec<Transaction>, update: impl FnOnce(&mut StateDb)) -> BlockRef {
        let head = self.head();
        let block = self.fork(&head, txs, update);
        self.set_head(block.clone());
        block
    }

    pub fn spam_throttler(&self) -> Option<Arc<SpamThrottler>> {
        self.throttler.read().clone()
    }
}

impl PoolChain for TestChain {
    fn current_block(&self) -> BlockRef {
        self.head()
    }

    fn get_block(&self, hash: B256, number: u64) -> Option<BlockRef> {
        self.blocks
            .read()
            .get(&hash)
            .filter(|block| block.number() == number)
            .cloned()
    }

    fn state_at(&self, root: B256) -> ChainResult<StateDb> {
        Ok(StateDb::new(root, self.state_db.clone())?)
    }

    fn subscribe_chain_head_event(&self) -> flume::Receiver<ChainHeadEvent> {
        self.head_feed.subscribe()
    }

    fn set_spam_throttler(&self, throttler: Option<Arc<SpamThrottler>>) {
        *self.throttler.write() = throttler;
    }
}
