//! Append-only file of local transactions that survives restarts.

use crate::{
    txpool::error::{
        JournalError,
        JournalResult,
        TxPoolResult,
    },
    types::Transaction,
};
use alloy_primitives::Address;
use alloy_rlp::{
    Decodable,
    Encodable,
};
use std::{
    collections::HashMap,
    ffi::OsString,
    fs::{
        self,
        File,
        OpenOptions,
    },
    io::Write,
    path::PathBuf,
};
use tracing::{
    info,
    warn,
};

/// Transactions are re-added in batches of this size while loading.
const LOAD_BATCH: usize = 1024;

#[derive(Debug)]
pub(crate) struct TxJournal {
    path: PathBuf,
    writer: Option<File>,
}

impl TxJournal {
    pub(crate) fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: None,
        }
    }

    /// Replays the journal through `add`. Returns the number of decoded
    /// transactions and how many of them `add` refused.
    ///
    /// A truncated or corrupt tail stops the replay; everything before it is
    /// still added.
    pub(crate) fn load(
        &self,
        mut add: impl FnMut(Vec<Transaction>) -> Vec<TxPoolResult>,
    ) -> JournalResult<(usize, usize)> {
        if !self.path.exists() {
            return Ok((0, 0));
        }
        let data = fs::read(&self.path)?;
        let mut buf = data.as_slice();
        let mut batch = Vec::with_capacity(LOAD_BATCH);
        let (mut total, mut dropped) = (0, 0);
        let mut flush = |batch: &mut Vec<Transaction>| {
            add(std::mem::take(batch))
                .into_iter()
                .filter(Result::is_err)
                .count()
        };

        let mut failure = None;
        while !buf.is_empty() {
            match Transaction::decode(&mut buf) {
                Ok(tx) => {
                    total += 1;
                    batch.push(tx);
                    if batch.len() >= LOAD_BATCH {
                        dropped += flush(&mut batch);
                    }
                }
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }
        if !batch.is_empty() {
            dropped += flush(&mut batch);
        }
        info!(
            target: "ledger-chain::txpool",
            transactions = total,
            dropped,
            "Loaded local transaction journal"
        );
        match failure {
            Some(err) => Err(JournalError::Decode(err)),
            None => Ok((total, dropped)),
        }
    }

    /// Appends `tx` to the open journal.
    pub(crate) fn insert(&mut self, tx: &Transaction) -> JournalResult {
        let writer = self.writer.as_mut().ok_or(JournalError::NoActiveJournal)?;
        let mut out = Vec::with_capacity(tx.length());
        tx.encode(&mut out);
        writer.write_all(&out)?;
        Ok(())
    }

    /// Rewrites the journal so it holds exactly `all`, then reopens it for
    /// appending. The replacement is atomic.
    pub(crate) fn rotate(&mut self, all: &HashMap<Address, Vec<Transaction>>) -> JournalResult {
        if let Some(writer) = self.writer.take() {
            writer.sync_all()?;
        }
        let mut tmp = OsString::from(self.path.as_os_str());
        tmp.push(".new");
        let tmp = PathBuf::from(tmp);

        let mut out = Vec::new();
        let mut journaled = 0;
        for txs in all.values() {
            for tx in txs {
                tx.encode(&mut out);
            }
            journaled += txs.len();
        }
        let mut replacement = File::create(&tmp)?;
        replacement.write_all(&out)?;
        replacement.sync_all()?;
        drop(replacement);
        fs::rename(&tmp, &self.path)?;

        self.writer = Some(
            OpenOptions::new()
                .append(true)
                .create(true)
                .open(&self.path)?,
        );
        info!(
            target: "ledger-chain::txpool",
            transactions = journaled,
            accounts = all.len(),
            "Regenerated local transaction journal"
        );
        Ok(())
    }

    pub(crate) fn close(&mut self) -> JournalResult {
        if let Some(writer) = self.writer.take() {
            writer.sync_all()?;
        } else {
            warn!(target: "ledger-chain::txpool", path = %self.path.display(), "Closing inactive transaction journal");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        test_utils::TestKey,
        types::{
            LegacyTx,
            TxData,
        },
    };
    use alloy_primitives::{
        Bytes,
        TxKind,
        U256,
    };

    fn tx(key: &TestKey, nonce: u64) -> Transaction {
        key.sign(TxData::Legacy(LegacyTx {
            nonce,
            gas_price: U256::from(1),
            gas: 21_000,
            to: TxKind::Call(Address::repeat_byte(2)),
            value: U256::from(nonce),
            input: Bytes::new(),
        }))
    }

    #[test]
    fn insert_requires_rotation_first() {
        let dir = tempfile::tempdir().unwrap();
        let mut journal = TxJournal::new(dir.path().join("transactions.rlp"));
        let key = TestKey::from_seed(1);
        assert!(matches!(
            journal.insert(&tx(&key, 0)),
            Err(JournalError::NoActiveJournal)
        ));
    }

    #[test]
    fn rotate_then_append_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transactions.rlp");
        let key = TestKey::from_seed(1);

        let mut journal = TxJournal::new(&path);
        let mut all = HashMap::new();
        all.insert(key.address(), vec![tx(&key, 0), tx(&key, 1)]);
        journal.rotate(&all).unwrap();
        journal.insert(&tx(&key, 2)).unwrap();
        journal.close().unwrap();

        let mut loaded = Vec::new();
        let (total, dropped) = TxJournal::new(&path)
            .load(|batch| {
                let results = batch.iter().map(|_| Ok(())).collect();
                loaded.extend(batch);
                results
            })
            .unwrap();
        assert_eq!((total, dropped), (3, 0));
        let nonces: Vec<_> = loaded.iter().map(Transaction::nonce).collect();
        assert_eq!(nonces, vec![0, 1, 2]);
    }

    #[test]
    fn corrupt_tail_keeps_the_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transactions.rlp");
        let key = TestKey::from_seed(1);
        let mut data = alloy_rlp::encode(tx(&key, 0));
        data.extend_from_slice(&[0xf8, 0xff, 0x01]);
        fs::write(&path, data).unwrap();

        let mut count = 0;
        let result = TxJournal::new(&path).load(|batch| {
            count += batch.len();
            batch.iter().map(|_| Ok(())).collect()
        });
        assert!(matches!(result, Err(JournalError::Decode(_))));
        assert_eq!(count, 1);
    }

    #[test]
    fn missing_file_loads_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let journal = TxJournal::new(dir.path().join("absent.rlp"));
        assert_eq!(journal.load(|_| Vec::new()).unwrap(), (0, 0));
    }
}
