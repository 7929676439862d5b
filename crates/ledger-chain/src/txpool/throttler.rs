//! Adaptive throttling of transactions sent to addresses that keep failing.
//!
//! Every committed block bumps a spam weight for the recipients of its failed
//! transactions and decays all weights by a fixed step. Recipients whose
//! weight crosses the threshold are throttled for a number of blocks;
//! transactions to them bypass the pool and trickle in through a rate
//! limited channel instead. The threshold itself drifts down while blocks
//! fail more often than the target ratio and back up otherwise.

use crate::{
    metrics,
    txpool::error::ThrottlerError,
    types::{
        Receipt,
        Transaction,
        TxKind,
    },
};
use alloy_primitives::Address;
use parking_lot::{
    Mutex,
    RwLock,
};
use std::{
    collections::{
        HashMap,
        HashSet,
    },
    time::Instant,
};
use tracing::{
    debug,
    trace,
    warn,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThrottlerConfig {
    /// Classification only runs while the pool holds more transactions.
    pub activate_tx_pool_size: usize,
    /// Failure percentage of a block above which the threshold drops.
    pub target_fail_ratio: u32,
    /// Throttled transactions released per second.
    pub throttle_tps: usize,
    pub max_candidates: usize,
    pub increase_weight: u32,
    pub decrease_weight: u32,
    pub initial_threshold: u32,
    pub minimum_threshold: u32,
    pub threshold_adjustment: u32,
    /// Blocks an address stays throttled.
    pub throttle_seconds: u32,
}

impl Default for ThrottlerConfig {
    fn default() -> Self {
        Self {
            activate_tx_pool_size: 1000,
            target_fail_ratio: 10,
            throttle_tps: 100,
            max_candidates: 10_000,
            increase_weight: 5,
            decrease_weight: 1,
            initial_threshold: 500,
            minimum_threshold: 100,
            threshold_adjustment: 5,
            throttle_seconds: 300,
        }
    }
}

impl ThrottlerConfig {
    pub fn validate(&self) -> Result<(), ThrottlerError> {
        let err = if self.target_fail_ratio > 100 {
            ThrottlerError::InvalidTargetFailRatio(self.target_fail_ratio)
        } else if self.initial_threshold < self.minimum_threshold {
            ThrottlerError::InvalidThresholds {
                minimum: self.minimum_threshold,
                initial: self.initial_threshold,
            }
        } else if self.throttle_tps == 0 {
            ThrottlerError::ZeroThrottleTps
        } else {
            return Ok(());
        };
        warn!(target: "ledger-chain::throttler", error = %err, "Rejecting spam throttler config");
        Err(err)
    }

    /// Capacity of the throttled transaction channel.
    pub fn channel_capacity(&self) -> usize {
        self.throttle_tps.saturating_mul(5)
    }
}

#[derive(Debug)]
struct Candidates {
    weights: HashMap<Address, u32>,
    threshold: u32,
}

#[derive(Debug)]
pub struct SpamThrottler {
    config: ThrottlerConfig,
    /// Only touched by block import.
    candidates: Mutex<Candidates>,
    /// Remaining throttled blocks per address.
    throttled: RwLock<HashMap<Address, u32>>,
    allowed: RwLock<HashSet<Address>>,
    throttle_tx: flume::Sender<Transaction>,
    throttle_rx: flume::Receiver<Transaction>,
}

impl SpamThrottler {
    pub fn new(config: ThrottlerConfig) -> Result<Self, ThrottlerError> {
        config.validate()?;
        let (throttle_tx, throttle_rx) = flume::bounded(config.channel_capacity());
        Ok(Self {
            candidates: Mutex::new(Candidates {
                weights: HashMap::new(),
                threshold: config.initial_threshold,
            }),
            throttled: RwLock::new(HashMap::new()),
            allowed: RwLock::new(HashSet::new()),
            throttle_tx,
            throttle_rx,
            config,
        })
    }

    pub fn config(&self) -> &ThrottlerConfig {
        &self.config
    }

    pub fn threshold(&self) -> u32 {
        self.candidates.lock().threshold
    }

    /// Folds the execution results of a committed block into the spam
    /// weights and refreshes the throttled set.
    pub fn update_throttler_state(&self, txs: &[Transaction], receipts: &[Receipt]) {
        let started = Instant::now();
        let mut candidates = self.candidates.lock();
        let threshold = candidates.threshold;
        let mut failed = 0usize;

        for (receipt, tx) in receipts.iter().zip(txs) {
            if receipt.status.is_successful() {
                continue;
            }
            failed += 1;
            let TxKind::Call(to) = tx.to() else {
                continue;
            };
            let weights = &mut candidates.weights;
            if let Some(weight) = weights.get_mut(&to) {
                *weight = weight.saturating_add(self.config.increase_weight);
            } else if weights.len() < self.config.max_candidates {
                weights.insert(to, self.config.increase_weight);
            }
        }

        let mut newly_throttled = Vec::new();
        candidates.weights.retain(|address, weight| {
            let decayed = weight.saturating_sub(self.config.decrease_weight);
            if decayed == 0 {
                return false;
            }
            if decayed > threshold {
                newly_throttled.push(*address);
                return false;
            }
            *weight = decayed;
            true
        });

        let fail_ratio = if receipts.is_empty() {
            0
        } else {
            u32::try_from(100 * failed / receipts.len()).unwrap_or(100)
        };
        self.update_throttled(&newly_throttled);
        candidates.threshold = self.adjusted_threshold(threshold, fail_ratio);

        let throttled = self.throttled.read().len();
        metrics::set_throttler_counts(candidates.weights.len(), throttled);
        debug!(
            target: "ledger-chain::throttler",
            failed,
            fail_ratio,
            threshold = candidates.threshold,
            candidates = candidates.weights.len(),
            throttled,
            elapsed = ?started.elapsed(),
            "Updated spam throttler state"
        );
    }

    fn update_throttled(&self, newly_throttled: &[Address]) {
        let mut throttled = self.throttled.write();
        throttled.retain(|_, remaining| match remaining.checked_sub(1) {
            Some(left) => {
                *remaining = left;
                true
            }
            None => false,
        });
        for address in newly_throttled {
            throttled.insert(*address, self.config.throttle_seconds);
        }
    }

    fn adjusted_threshold(&self, threshold: u32, fail_ratio: u32) -> u32 {
        let step = self.config.threshold_adjustment;
        if fail_ratio > self.config.target_fail_ratio {
            threshold
                .saturating_sub(step)
                .max(self.config.minimum_threshold)
        } else {
            threshold
                .saturating_add(step)
                .min(self.config.initial_threshold)
        }
    }

    /// Splits `txs` into those that may enter the pool and those addressed
    /// to throttled, non-allowed recipients.
    pub fn classify_txs(&self, txs: Vec<Transaction>) -> (Vec<Transaction>, Vec<Transaction>) {
        let throttled = self.throttled.read();
        let allowed = self.allowed.read();
        txs.into_iter().partition(|tx| match tx.to() {
            TxKind::Call(to) => {
                throttled.get(&to).is_none_or(|remaining| *remaining == 0) || allowed.contains(&to)
            }
            TxKind::Create => true,
        })
    }

    /// Queues throttled transactions for delayed admission. Returns how
    /// many were dropped because the channel is full.
    pub(crate) fn hold(&self, txs: Vec<Transaction>) -> usize {
        let mut dropped = 0;
        for tx in txs {
            let hash = tx.hash();
            if self.throttle_tx.try_send(tx).is_err() {
                trace!(target: "ledger-chain::throttler", %hash, "Dropping throttled tx, channel is full");
                dropped += 1;
            }
        }
        metrics::record_throttled_drop(dropped);
        dropped
    }

    /// Takes at most one second's worth of held transactions.
    pub(crate) fn release(&self) -> Vec<Transaction> {
        self.throttle_rx
            .try_iter()
            .take(self.config.throttle_tps)
            .collect()
    }

    /// Replaces the allow list.
    pub fn set_allowed(&self, addresses: impl IntoIterator<Item = Address>) {
        *self.allowed.write() = addresses.into_iter().collect();
    }

    pub fn get_allowed(&self) -> Vec<Address> {
        self.allowed.read().iter().copied().collect()
    }

    pub fn get_throttled(&self) -> Vec<Address> {
        self.throttled.read().keys().copied().collect()
    }

    pub fn get_candidates(&self) -> HashMap<Address, u32> {
        self.candidates.lock().weights.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        test_utils::TestKey,
        types::{
            LegacyTx,
            ReceiptStatus,
            TxData,
        },
    };
    use alloy_primitives::{
        B256,
        Bytes,
        U256,
    };

    const SPAMMED: Address = Address::repeat_byte(0x55);

    fn config() -> ThrottlerConfig {
        ThrottlerConfig {
            initial_threshold: 12,
            minimum_threshold: 4,
            threshold_adjustment: 2,
            throttle_seconds: 2,
            ..Default::default()
        }
    }

    fn call(key: &TestKey, nonce: u64, to: Address) -> Transaction {
        key.sign(TxData::Legacy(LegacyTx {
            nonce,
            gas_price: U256::from(1),
            gas: 21_000,
            to: TxKind::Call(to),
            value: U256::ZERO,
            input: Bytes::new(),
        }))
    }

    fn failed_block(key: &TestKey, count: u64) -> (Vec<Transaction>, Vec<Receipt>) {
        let txs: Vec<_> = (0..count).map(|nonce| call(key, nonce, SPAMMED)).collect();
        let receipts = txs
            .iter()
            .map(|_| Receipt::new(ReceiptStatus::ErrDefault, B256::ZERO, 21_000))
            .collect();
        (txs, receipts)
    }

    #[test]
    fn validate_rejects_out_of_range_values() {
        assert!(ThrottlerConfig::default().validate().is_ok());
        let bad_ratio = ThrottlerConfig {
            target_fail_ratio: 101,
            ..Default::default()
        };
        assert_eq!(
            bad_ratio.validate(),
            Err(ThrottlerError::InvalidTargetFailRatio(101))
        );
        let bad_thresholds = ThrottlerConfig {
            initial_threshold: 10,
            minimum_threshold: 11,
            ..Default::default()
        };
        assert!(matches!(
            bad_thresholds.validate(),
            Err(ThrottlerError::InvalidThresholds { .. })
        ));
    }

    #[test]
    fn failing_recipient_gets_throttled_then_expires() {
        let throttler = SpamThrottler::new(config()).unwrap();
        let key = TestKey::from_seed(1);
        let (txs, receipts) = failed_block(&key, 3);

        // 3 failures add 15, decay takes 1: 14 > 12.
        throttler.update_throttler_state(&txs, &receipts);
        assert_eq!(throttler.get_throttled(), vec![SPAMMED]);
        assert!(throttler.get_candidates().is_empty());
        assert_eq!(throttler.threshold(), 10, "every tx failed, the threshold drops");

        let (allowed, held) = throttler.classify_txs(vec![
            call(&key, 10, SPAMMED),
            call(&key, 11, Address::repeat_byte(1)),
        ]);
        assert_eq!(allowed.len(), 1);
        assert_eq!(held.len(), 1);

        throttler.set_allowed([SPAMMED]);
        let (allowed, held) = throttler.classify_txs(vec![call(&key, 12, SPAMMED)]);
        assert_eq!((allowed.len(), held.len()), (1, 0), "allow list wins");
        throttler.set_allowed([]);

        for _ in 0..3 {
            throttler.update_throttler_state(&[], &[]);
        }
        assert!(throttler.get_throttled().is_empty());
        assert_eq!(throttler.threshold(), 12, "threshold recovers up to the initial value");
    }

    #[test]
    fn candidates_decay_away() {
        let throttler = SpamThrottler::new(config()).unwrap();
        let key = TestKey::from_seed(1);
        let (txs, receipts) = failed_block(&key, 1);
        throttler.update_throttler_state(&txs, &receipts);
        assert_eq!(throttler.get_candidates().get(&SPAMMED), Some(&4));
        for _ in 0..4 {
            throttler.update_throttler_state(&[], &[]);
        }
        assert!(throttler.get_candidates().is_empty());
    }

    #[test]
    fn held_transactions_are_released_at_the_configured_rate() {
        let throttler = SpamThrottler::new(ThrottlerConfig {
            throttle_tps: 2,
            ..Default::default()
        })
        .unwrap();
        let key = TestKey::from_seed(1);
        let txs: Vec<_> = (0..12).map(|nonce| call(&key, nonce, SPAMMED)).collect();
        assert_eq!(throttler.hold(txs), 2, "the channel holds five seconds of traffic");
        assert_eq!(throttler.release().len(), 2);
        assert_eq!(throttler.release().len(), 2);
    }
}
