//! Block import, validation and the canonical chain.

pub mod blockchain;
pub mod config;
pub mod error;
pub mod events;
pub mod gc;
pub mod genesis;
pub mod headerchain;
pub mod migration;
pub mod prefetcher;
pub mod processor;
pub mod state_transition;
pub mod validator;

pub use blockchain::{
    BadBlock,
    BlockChain,
    InsertStats,
    set_receipts_data,
};
pub use config::CacheConfig;
pub use error::{
    ApplyError,
    BlockError,
    ChainError,
    ChainResult,
    InsertError,
    MigrationError,
    MigrationResult,
};
pub use events::{
    ChainEvent,
    ChainHeadEvent,
    ChainSideEvent,
    Feed,
    NewTxsEvent,
    RemovedLogsEvent,
};
pub use gc::{
    GcQueue,
    TrieGc,
};
pub use genesis::{
    Genesis,
    GenesisAccount,
};
pub use headerchain::{
    HeaderChain,
    WriteStatus,
};
pub use migration::MigrationStatus;
pub use prefetcher::{
    PrefetchPool,
    PrefetchTask,
    StatePrefetcher,
};
pub use processor::{
    ProcessResult,
    StateProcessor,
};
pub use state_transition::{
    apply_transaction,
    effective_gas_price,
};
pub use validator::BlockValidator;
