use std::{
    path::PathBuf,
    time::Duration,
};
use tracing::warn;

/// Default journal file name of local transactions.
pub const DEFAULT_JOURNAL: &str = "transactions.rlp";

const MIN_JOURNAL_INTERVAL: Duration = Duration::from_secs(1);

/// Transaction pool limits and behaviour switches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxPoolConfig {
    /// Treat every submission as remote.
    pub no_locals: bool,
    /// Accept locally submitted chain data anchoring transactions.
    pub allow_local_anchor_tx: bool,
    /// Drop transactions received from peers.
    pub deny_remote_tx: bool,
    /// Journal of local transactions. `None` disables journaling.
    pub journal: Option<PathBuf>,
    pub journal_interval: Duration,
    pub price_limit: u64,
    pub price_bump: u64,
    /// Executable slots guaranteed per account.
    pub exec_slots_account: u64,
    /// Executable slots for all accounts.
    pub exec_slots_all: u64,
    /// Non-executable slots permitted per account.
    pub non_exec_slots_account: u64,
    /// Non-executable slots for all accounts.
    pub non_exec_slots_all: u64,
    /// How long an idle account keeps its queued transactions.
    pub lifetime: Duration,
    /// Start the spam throttler together with the pool.
    pub enable_spam_throttler_at_runtime: bool,
}

impl Default for TxPoolConfig {
    fn default() -> Self {
        Self {
            no_locals: false,
            allow_local_anchor_tx: false,
            deny_remote_tx: false,
            journal: Some(PathBuf::from(DEFAULT_JOURNAL)),
            journal_interval: Duration::from_secs(60 * 60),
            price_limit: 1,
            price_bump: 10,
            exec_slots_account: 16,
            exec_slots_all: 4096,
            non_exec_slots_account: 64,
            non_exec_slots_all: 1024,
            lifetime: Duration::from_secs(5 * 60),
            enable_spam_throttler_at_runtime: false,
        }
    }
}

impl TxPoolConfig {
    pub fn with_no_locals(mut self, no_locals: bool) -> Self {
        self.no_locals = no_locals;
        self
    }

    pub fn with_allow_local_anchor_tx(mut self, allow: bool) -> Self {
        self.allow_local_anchor_tx = allow;
        self
    }

    pub fn with_deny_remote_tx(mut self, deny: bool) -> Self {
        self.deny_remote_tx = deny;
        self
    }

    pub fn with_journal(mut self, journal: Option<PathBuf>) -> Self {
        self.journal = journal;
        self
    }

    pub fn with_journal_interval(mut self, interval: Duration) -> Self {
        self.journal_interval = interval;
        self
    }

    pub fn with_exec_slots(mut self, account: u64, all: u64) -> Self {
        self.exec_slots_account = account;
        self.exec_slots_all = all;
        self
    }

    pub fn with_non_exec_slots(mut self, account: u64, all: u64) -> Self {
        self.non_exec_slots_account = account;
        self.non_exec_slots_all = all;
        self
    }

    pub fn with_lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = lifetime;
        self
    }

    pub fn with_spam_throttler_at_runtime(mut self, enable: bool) -> Self {
        self.enable_spam_throttler_at_runtime = enable;
        self
    }

    /// Total slots of the pool.
    pub fn capacity(&self) -> usize {
        usize::try_from(self.exec_slots_all.saturating_add(self.non_exec_slots_all))
            .unwrap_or(usize::MAX)
    }

    /// Returns a copy with out-of-range values replaced by their minimums or
    /// defaults.
    pub fn sanitize(&self) -> Self {
        let mut config = self.clone();
        if config.journal_interval < MIN_JOURNAL_INTERVAL {
            warn!(
                target: "ledger-chain::txpool",
                provided = ?config.journal_interval,
                updated = ?MIN_JOURNAL_INTERVAL,
                "Sanitizing invalid txpool journal time"
            );
            config.journal_interval = MIN_JOURNAL_INTERVAL;
        }
        let defaults = Self::default();
        if config.price_limit < 1 {
            warn!(
                target: "ledger-chain::txpool",
                provided = config.price_limit,
                updated = defaults.price_limit,
                "Sanitizing invalid txpool price limit"
            );
            config.price_limit = defaults.price_limit;
        }
        if config.price_bump < 1 {
            warn!(
                target: "ledger-chain::txpool",
                provided = config.price_bump,
                updated = defaults.price_bump,
                "Sanitizing invalid txpool price bump"
            );
            config.price_bump = defaults.price_bump;
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_raises_minimums() {
        let config = TxPoolConfig {
            journal_interval: Duration::from_millis(10),
            price_limit: 0,
            price_bump: 0,
            ..Default::default()
        }
        .sanitize();
        assert_eq!(config.journal_interval, Duration::from_secs(1));
        assert_eq!(config.price_limit, 1);
        assert_eq!(config.price_bump, 10);
    }

    #[test]
    fn capacity_sums_both_slot_kinds() {
        let config = TxPoolConfig::default().with_exec_slots(1, 3).with_non_exec_slots(1, 2);
        assert_eq!(config.capacity(), 5);
    }
}
