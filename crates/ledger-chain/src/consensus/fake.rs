use crate::{
    consensus::{
        ChainReader,
        ConsensusError,
        ConsensusResult,
        Engine,
        VerifyHeadersHandle,
    },
    state::StateDb,
    types::{
        Header,
        Receipt,
        Transaction,
    },
    utils::unix_now,
};
use alloy_primitives::{
    Address,
    B256,
    U256,
};
use std::sync::Arc;
use tracing::{
    debug,
    trace,
};

/// Deterministic engine used by tests and tools.
///
/// Checks ancestry, numbering and timestamps. Seals are accepted unless the
/// header number equals the configured failing block.
#[derive(Debug, Clone, Default)]
pub struct FakeEngine {
    fail_block: Option<u64>,
    block_reward: U256,
    staking_interval: Option<u64>,
    concurrent: bool,
    prefetch_workers: usize,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self {
            concurrent: true,
            ..Default::default()
        }
    }

    pub fn with_fail_block(mut self, number: u64) -> Self {
        self.fail_block = Some(number);
        self
    }

    /// Credited to the header's rewardbase on finalisation.
    pub fn with_block_reward(mut self, reward: U256) -> Self {
        self.block_reward = reward;
        self
    }

    pub fn with_staking_interval(mut self, interval: u64) -> Self {
        self.staking_interval = Some(interval);
        self
    }

    pub fn with_concurrent_verification(mut self, concurrent: bool) -> Self {
        self.concurrent = concurrent;
        self
    }

    pub fn with_prefetch_workers(mut self, workers: usize) -> Self {
        self.prefetch_workers = workers;
        self
    }

    fn verify_with_parent(
        &self,
        header: &Header,
        parent: Option<&Header>,
        seal: bool,
    ) -> ConsensusResult {
        if header.time > unix_now() {
            return Err(ConsensusError::FutureBlock);
        }
        let Some(parent) = parent else {
            return Err(ConsensusError::UnknownAncestor);
        };
        if header.number != parent.number + 1 {
            return Err(ConsensusError::InvalidNumber {
                expected: parent.number + 1,
                got: header.number,
            });
        }
        if header.time < parent.time {
            return Err(ConsensusError::InvalidTimestamp {
                time: header.time,
                parent_time: parent.time,
            });
        }
        if seal && self.fail_block == Some(header.number) {
            return Err(ConsensusError::InvalidSeal(header.number));
        }
        Ok(())
    }
}

fn parent_of(chain: &dyn ChainReader, header: &Header) -> Option<Header> {
    header
        .number
        .checked_sub(1)
        .and_then(|number| chain.get_header(header.parent_hash, number))
}

impl Engine for FakeEngine {
    fn author(&self, header: &Header) -> ConsensusResult<Address> {
        Ok(header.rewardbase)
    }

    fn verify_header(
        &self,
        chain: &dyn ChainReader,
        header: &Header,
        seal: bool,
    ) -> ConsensusResult {
        if chain.get_header(header.hash(), header.number).is_some() {
            return Ok(());
        }
        let parent = parent_of(chain, header);
        self.verify_with_parent(header, parent.as_ref(), seal)
    }

    fn verify_headers(
        &self,
        chain: Arc<dyn ChainReader>,
        headers: Vec<Header>,
        seals: Vec<bool>,
    ) -> VerifyHeadersHandle {
        let (abort_tx, abort_rx) = flume::bounded::<()>(1);
        let (results_tx, results_rx) = flume::bounded(headers.len().max(1));
        let engine = self.clone();

        let spawned = std::thread::Builder::new()
            .name("header-verifier".into())
            .spawn(move || {
                for (index, header) in headers.iter().enumerate() {
                    match abort_rx.try_recv() {
                        Err(flume::TryRecvError::Empty) => {}
                        _ => {
                            trace!(target: "ledger-chain::consensus", index, "Header verification aborted");
                            return;
                        }
                    }
                    let parent = match index.checked_sub(1).map(|prev| &headers[prev]) {
                        Some(prev) if prev.hash() == header.parent_hash => Some(prev.clone()),
                        _ => parent_of(chain.as_ref(), header),
                    };
                    let seal = seals.get(index).copied().unwrap_or(true);
                    let result = if chain.get_header(header.hash(), header.number).is_some() {
                        Ok(())
                    } else {
                        engine.verify_with_parent(header, parent.as_ref(), seal)
                    };
                    if results_tx.send(result).is_err() {
                        return;
                    }
                }
            });
        if let Err(err) = spawned {
            debug!(target: "ledger-chain::consensus", error = ?err, "Failed to spawn header verifier");
        }
        (abort_tx, results_rx)
    }

    fn can_verify_headers_concurrently(&self) -> bool {
        self.concurrent
    }

    fn finalize(
        &self,
        _chain: &dyn ChainReader,
        header: &Header,
        state: &mut StateDb,
        _txs: &[Transaction],
        _receipts: &[Receipt],
    ) -> ConsensusResult {
        if !self.block_reward.is_zero() {
            state.add_balance(header.rewardbase, self.block_reward);
        }
        Ok(())
    }

    fn create_snapshot(
        &self,
        _chain: &dyn ChainReader,
        number: u64,
        hash: B256,
        _parents: &[Header],
    ) -> ConsensusResult {
        trace!(target: "ledger-chain::consensus", number, %hash, "Created voting snapshot");
        Ok(())
    }

    fn state_commit_required(&self, number: u64) -> bool {
        self.staking_interval
            .is_some_and(|interval| interval != 0 && number % interval == 0)
    }

    fn prefetch_workers(&self) -> usize {
        self.prefetch_workers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ChainConfig;
    use std::collections::HashMap;

    #[derive(Default)]
    struct Headers {
        config: ChainConfig,
        headers: HashMap<B256, Header>,
    }

    impl ChainReader for Headers {
        fn config(&self) -> &ChainConfig {
            &self.config
        }

        fn current_header(&self) -> Header {
            self.headers
                .values()
                .max_by_key(|header| header.number)
                .cloned()
                .unwrap_or_default()
        }

        fn get_header(&self, hash: B256, number: u64) -> Option<Header> {
            self.headers
                .get(&hash)
                .filter(|header| header.number == number)
                .cloned()
        }

        fn get_header_by_hash(&self, hash: B256) -> Option<Header> {
            self.headers.get(&hash).cloned()
        }

        fn get_header_by_number(&self, number: u64) -> Option<Header> {
            self.headers
                .values()
                .find(|header| header.number == number)
                .cloned()
        }
    }

    fn child(parent: &Header) -> Header {
        Header {
            parent_hash: parent.hash(),
            number: parent.number + 1,
            time: parent.time + 1,
            ..Default::default()
        }
    }

    #[test]
    fn batch_verification_uses_in_batch_parents() {
        let genesis = Header::default();
        let mut chain = Headers::default();
        chain.headers.insert(genesis.hash(), genesis.clone());

        let h1 = child(&genesis);
        let h2 = child(&h1);
        let h3 = child(&h2);
        let engine = FakeEngine::new().with_fail_block(3);
        let (_abort, results) =
            engine.verify_headers(Arc::new(chain), vec![h1, h2, h3], vec![true; 3]);

        let results = results.iter().collect::<Vec<_>>();
        assert_eq!(results[..2], [Ok(()), Ok(())]);
        assert_eq!(results[2], Err(ConsensusError::InvalidSeal(3)));
    }

    #[test]
    fn unknown_parent_and_future_time_are_reported() {
        let chain = Headers::default();
        let orphan = Header {
            number: 5,
            parent_hash: B256::repeat_byte(1),
            ..Default::default()
        };
        let engine = FakeEngine::new();
        assert_eq!(
            engine.verify_header(&chain, &orphan, true),
            Err(ConsensusError::UnknownAncestor)
        );

        let future = Header {
            time: u64::MAX,
            ..orphan
        };
        assert_eq!(
            engine.verify_header(&chain, &future, true),
            Err(ConsensusError::FutureBlock)
        );
    }

    #[test]
    fn staking_interval_requires_commits() {
        let engine = FakeEngine::new().with_staking_interval(86_400);
        assert!(engine.state_commit_required(86_400 * 2));
        assert!(!engine.state_commit_required(86_401));
        assert!(!FakeEngine::new().state_commit_required(0));
    }
}
