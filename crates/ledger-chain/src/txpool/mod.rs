//! Transaction pool and the spam throttler that guards its intake.

mod config;
mod error;
mod journal;
mod list;
mod noncer;
mod pool;
mod throttler;

pub use config::{
    DEFAULT_JOURNAL,
    TxPoolConfig,
};
pub use error::{
    JournalError,
    ThrottlerError,
    TxPoolError,
    TxPoolResult,
};
pub use pool::{
    PoolChain,
    TxPool,
    TxStatus,
};
pub use throttler::{
    SpamThrottler,
    ThrottlerConfig,
};
