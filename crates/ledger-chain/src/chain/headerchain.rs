//! Linked header storage, canonical index maintenance and total block score
//! accounting.

use crate::{
    chain::error::{
        ChainError,
        ChainResult,
    },
    consensus::{
        ChainReader,
        ConsensusError,
        Engine,
    },
    db::{
        Batch,
        BatchTarget,
        Database,
        DatabaseResult,
    },
    params::ChainConfig,
    types::Header,
};
use alloy_primitives::{
    B256,
    U256,
};
use moka::sync::Cache;
use parking_lot::RwLock;
use std::{
    collections::HashSet,
    sync::{
        Arc,
        atomic::{
            AtomicBool,
            Ordering,
        },
    },
    time::Instant,
};
use tracing::{
    debug,
    error,
    info,
};

const NUMBER_CACHE_LIMIT: u64 = 2048;

/// Outcome of writing a header or block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    /// Nothing was written.
    NonStat,
    /// The written item became the canonical head.
    Canon,
    /// The written item lives on a side chain.
    Side,
}

/// Logs a read failure and degrades it to a miss.
pub(crate) fn or_log<T>(result: DatabaseResult<Option<T>>, what: &'static str) -> Option<T> {
    match result {
        Ok(value) => value,
        Err(err) => {
            error!(target: "ledger-chain::headerchain", error = ?err, what, "Database read failed");
            None
        }
    }
}

/// Breaks total block score ties between two heads.
pub(crate) fn coin_flip() -> bool {
    rand::random_bool(0.5)
}

#[derive(Debug)]
pub struct HeaderChain {
    config: ChainConfig,
    db: Arc<Database>,
    engine: Arc<dyn Engine>,
    genesis: RwLock<Header>,
    /// Head header and its hash.
    current: RwLock<(Header, B256)>,
    number_cache: Cache<B256, u64>,
    bad_hashes: RwLock<HashSet<B256>>,
    proc_interrupt: Arc<AtomicBool>,
}

impl HeaderChain {
    /// Opens the header chain stored in `db`. The canonical genesis must
    /// already be present.
    pub fn new(
        db: Arc<Database>,
        config: ChainConfig,
        engine: Arc<dyn Engine>,
        proc_interrupt: Arc<AtomicBool>,
    ) -> ChainResult<Self> {
        let genesis_hash = db.read_canonical_hash(0)?.ok_or(ChainError::NoGenesis)?;
        let genesis = db
            .read_header(genesis_hash, 0)?
            .ok_or(ChainError::NoGenesis)?;

        let mut current = (genesis.clone(), genesis_hash);
        if let Some(head_hash) = db.read_head_header_hash()? {
            if let Some(number) = db.read_header_number(head_hash)? {
                if let Some(header) = db.read_header(head_hash, number)? {
                    current = (header, head_hash);
                }
            }
        }

        Ok(Self {
            config,
            db,
            engine,
            genesis: RwLock::new(genesis),
            current: RwLock::new(current),
            number_cache: Cache::new(NUMBER_CACHE_LIMIT),
            bad_hashes: RwLock::new(HashSet::new()),
            proc_interrupt,
        })
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    pub fn genesis(&self) -> Header {
        self.genesis.read().clone()
    }

    pub fn set_genesis(&self, header: Header) {
        *self.genesis.write() = header;
    }

    pub fn current_header(&self) -> Header {
        self.current.read().0.clone()
    }

    pub fn current_header_hash(&self) -> B256 {
        self.current.read().1
    }

    /// Moves the head header pointer, persisting it.
    pub fn set_current_header(&self, header: Header) -> ChainResult {
        let hash = header.hash();
        let mut batch = self.db.new_batch(BatchTarget::Chain);
        self.db.write_head_header_hash(&mut batch, hash);
        self.db.write(&batch)?;
        *self.current.write() = (header, hash);
        Ok(())
    }

    /// Replaces the process-wide set of rejected hashes.
    pub fn set_bad_hashes(&self, hashes: impl IntoIterator<Item = B256>) {
        *self.bad_hashes.write() = hashes.into_iter().collect();
    }

    pub fn is_bad_hash(&self, hash: &B256) -> bool {
        self.bad_hashes.read().contains(hash)
    }

    pub fn get_block_number(&self, hash: B256) -> Option<u64> {
        if let Some(number) = self.number_cache.get(&hash) {
            return Some(number);
        }
        let number = or_log(self.db.read_header_number(hash), "header number")?;
        self.number_cache.insert(hash, number);
        Some(number)
    }

    pub fn get_header(&self, hash: B256, number: u64) -> Option<Header> {
        or_log(self.db.read_header(hash, number), "header")
    }

    pub fn get_header_by_hash(&self, hash: B256) -> Option<Header> {
        self.get_header(hash, self.get_block_number(hash)?)
    }

    pub fn get_header_by_number(&self, number: u64) -> Option<Header> {
        let hash = self.get_canonical_hash(number)?;
        self.get_header(hash, number)
    }

    pub fn get_canonical_hash(&self, number: u64) -> Option<B256> {
        or_log(self.db.read_canonical_hash(number), "canonical hash")
    }

    pub fn has_header(&self, hash: B256, number: u64) -> bool {
        self.db.has_header(hash, number).unwrap_or_else(|err| {
            error!(target: "ledger-chain::headerchain", error = ?err, "Database read failed");
            false
        })
    }

    pub fn get_td(&self, hash: B256, number: u64) -> Option<U256> {
        or_log(self.db.read_td(hash, number), "total block score")
    }

    pub fn get_td_by_hash(&self, hash: B256) -> Option<U256> {
        self.get_td(hash, self.get_block_number(hash)?)
    }

    /// Hashes of up to `max` ancestors of `hash`, nearest first.
    pub fn get_block_hashes_from_hash(&self, hash: B256, max: u64) -> Vec<B256> {
        let mut hashes = Vec::new();
        let Some(mut header) = self.get_header_by_hash(hash) else {
            return hashes;
        };
        while (hashes.len() as u64) < max && header.number > 0 {
            let parent_hash = header.parent_hash;
            let Some(parent) = self.get_header(parent_hash, header.number - 1) else {
                break;
            };
            hashes.push(parent_hash);
            header = parent;
        }
        hashes
    }

    /// The `ancestor`-th ancestor of `(hash, number)`.
    ///
    /// Canonical ancestors resolve in one lookup. Every non-canonical step
    /// spends one unit of `max_non_canonical`. Returns `None` when the budget
    /// runs out or a header is missing.
    pub fn get_ancestor(
        &self,
        mut hash: B256,
        mut number: u64,
        mut ancestor: u64,
        max_non_canonical: &mut u64,
    ) -> Option<(B256, u64)> {
        if ancestor > number {
            return None;
        }
        if ancestor == 1 {
            let header = self.get_header(hash, number)?;
            return Some((header.parent_hash, number - 1));
        }
        while ancestor != 0 {
            if self.get_canonical_hash(number) == Some(hash) {
                let ancestor_hash = self.get_canonical_hash(number - ancestor)?;
                // The canonical chain may have moved while reading.
                if self.get_canonical_hash(number) == Some(hash) {
                    return Some((ancestor_hash, number - ancestor));
                }
            }
            if *max_non_canonical == 0 {
                return None;
            }
            *max_non_canonical -= 1;
            ancestor -= 1;
            let header = self.get_header(hash, number)?;
            hash = header.parent_hash;
            number -= 1;
        }
        Some((hash, number))
    }

    /// Stores `header` with its total block score and, when it outweighs
    /// the current head, makes it canonical.
    pub fn write_header(&self, header: &Header) -> ChainResult<WriteStatus> {
        let hash = header.hash();
        let number = header.number;
        let parent_td = number
            .checked_sub(1)
            .and_then(|parent| self.get_td(header.parent_hash, parent))
            .ok_or(ConsensusError::UnknownAncestor)?;
        let (head_hash, head_number) = {
            let current = self.current.read();
            (current.1, current.0.number)
        };
        let local_td = self
            .get_td(head_hash, head_number)
            .ok_or(ChainError::MissingTd {
                number: head_number,
                hash: head_hash,
            })?;
        let extern_td = parent_td + header.block_score;

        let mut batch = self.db.new_batch(BatchTarget::Chain);
        self.db.write_td(&mut batch, hash, number, extern_td);
        self.db.write_header(&mut batch, header);

        let canonical = extern_td > local_td || (extern_td == local_td && coin_flip());
        let status = if canonical {
            self.write_canonical_path(&mut batch, header, hash)?;
            self.db.write_head_header_hash(&mut batch, hash);
            WriteStatus::Canon
        } else {
            WriteStatus::Side
        };
        self.db.write(&batch)?;
        self.number_cache.insert(hash, number);
        if status == WriteStatus::Canon {
            *self.current.write() = (header.clone(), hash);
        }
        Ok(status)
    }

    /// Rewrites the canonical index so that it ends at `header`.
    fn write_canonical_path(&self, batch: &mut Batch, header: &Header, hash: B256) -> ChainResult {
        let mut stale = header.number + 1;
        while self.get_canonical_hash(stale).is_some() {
            self.db.delete_canonical_hash(batch, stale);
            stale += 1;
        }
        self.db.write_canonical_hash(batch, hash, header.number);

        let mut head_hash = header.parent_hash;
        let mut head_number = header.number;
        while head_number > 0 {
            head_number -= 1;
            if self.get_canonical_hash(head_number) == Some(head_hash) {
                break;
            }
            self.db.write_canonical_hash(batch, head_hash, head_number);
            let parent = self
                .get_header(head_hash, head_number)
                .ok_or(ChainError::MissingHeader(head_hash))?;
            head_hash = parent.parent_hash;
        }
        Ok(())
    }

    /// Checks that `chain` is contiguous and lets the engine verify it.
    ///
    /// Seals are verified for a random `1 / check_freq` sample plus the last
    /// header. On failure returns the index of the offending header.
    pub fn validate_header_chain(
        self: &Arc<Self>,
        chain: &[Header],
        check_freq: usize,
    ) -> Result<(), (usize, ChainError)> {
        for index in 1..chain.len() {
            let prev = &chain[index - 1];
            let header = &chain[index];
            let prev_hash = prev.hash();
            if header.number != prev.number + 1 || header.parent_hash != prev_hash {
                error!(
                    target: "ledger-chain::headerchain",
                    number = header.number,
                    hash = %header.hash(),
                    parent = %header.parent_hash,
                    prev_number = prev.number,
                    prev_hash = %prev_hash,
                    "Non contiguous header insert"
                );
                return Err((
                    index,
                    ChainError::NonContiguousInsert {
                        prev_index: index - 1,
                        prev_number: prev.number,
                        prev_hash,
                        index,
                        number: header.number,
                        hash: header.hash(),
                        parent_hash: header.parent_hash,
                    },
                ));
            }
        }

        let mut seals = vec![false; chain.len()];
        if check_freq > 0 {
            for seal in &mut seals {
                *seal = rand::random_range(0..check_freq) == 0;
            }
        }
        if let Some(last) = seals.last_mut() {
            *last = true;
        }

        let reader: Arc<dyn ChainReader> = self.clone();
        let (abort, results) = self
            .engine
            .verify_headers(reader, chain.to_vec(), seals);

        for (index, header) in chain.iter().enumerate() {
            if self.proc_interrupt.load(Ordering::Relaxed) {
                debug!(target: "ledger-chain::headerchain", "Premature abort during headers verification");
                let _ = abort.send(());
                return Err((index, ChainError::InsertAborted));
            }
            let hash = header.hash();
            if self.is_bad_hash(&hash) {
                let _ = abort.send(());
                return Err((index, ChainError::BlacklistedHash(hash)));
            }
            match results.recv() {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    let _ = abort.send(());
                    return Err((index, err.into()));
                }
                Err(_) => return Err((index, ConsensusError::Aborted.into())),
            }
        }
        Ok(())
    }

    /// Writes a validated header chain. Returns the number of headers
    /// processed before an error or interrupt.
    pub fn insert_header_chain(&self, chain: &[Header], start: Instant) -> ChainResult<usize> {
        let mut written = 0;
        let mut ignored = 0;
        for header in chain {
            if self.proc_interrupt.load(Ordering::Relaxed) {
                debug!(target: "ledger-chain::headerchain", "Premature abort during headers import");
                return Err(ChainError::InsertAborted);
            }
            let hash = header.hash();
            if self.has_header(hash, header.number) {
                ignored += 1;
                continue;
            }
            self.write_header(header)?;
            written += 1;
        }
        if let Some(last) = chain.last() {
            info!(
                target: "ledger-chain::headerchain",
                count = written,
                elapsed = ?start.elapsed(),
                number = last.number,
                hash = %last.hash(),
                ignored,
                "Imported new block headers"
            );
        }
        Ok(written + ignored)
    }

    /// Rewinds the header chain to `head`.
    ///
    /// For every header above `head`, `update` sees its parent before the
    /// header pointer moves and `delete` may stage extra deletions.
    pub fn set_head(
        &self,
        head: u64,
        update: &mut dyn FnMut(&Header) -> ChainResult,
        delete: &mut dyn FnMut(&mut Batch, B256, u64),
    ) -> ChainResult {
        let mut batch = self.db.new_batch(BatchTarget::Chain);
        loop {
            let (current, hash) = self.current.read().clone();
            if current.number <= head {
                break;
            }
            let number = current.number;
            let parent = self
                .get_header(current.parent_hash, number - 1)
                .unwrap_or_else(|| self.genesis());
            let parent_hash = parent.hash();

            let mut marker = self.db.new_batch(BatchTarget::Chain);
            self.db.write_head_header_hash(&mut marker, parent_hash);
            self.db.write(&marker)?;
            update(&parent)?;
            *self.current.write() = (parent, parent_hash);

            delete(&mut batch, hash, number);
            self.db.delete_header(&mut batch, hash, number);
            self.db.delete_td(&mut batch, hash, number);
            self.db.delete_canonical_hash(&mut batch, number);
            self.number_cache.invalidate(&hash);
        }
        let mut stale = head + 1;
        while self.get_canonical_hash(stale).is_some() {
            self.db.delete_canonical_hash(&mut batch, stale);
            stale += 1;
        }
        self.db.write(&batch)?;
        Ok(())
    }
}

impl ChainReader for HeaderChain {
    fn config(&self) -> &ChainConfig {
        &self.config
    }

    fn current_header(&self) -> Header {
        HeaderChain::current_header(self)
    }

    fn get_header(&self, hash: B256, number: u64) -> Option<Header> {
        HeaderChain::get_header(self, hash, number)
    }

    fn get_header_by_hash(&self, hash: B256) -> Option<Header> {
        HeaderChain::get_header_by_hash(self, hash)
    }

    fn get_header_by_number(&self, number: u64) -> Option<Header> {
        HeaderChain::get_header_by_number(self, number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::FakeEngine;

    fn genesis() -> Header {
        Header {
            block_score: U256::from(1),
            ..Default::default()
        }
    }

    fn setup() -> Arc<HeaderChain> {
        let db = Arc::new(Database::new_in_memory());
        let genesis = genesis();
        let hash = genesis.hash();
        let mut batch = db.new_batch(BatchTarget::Chain);
        db.write_header(&mut batch, &genesis);
        db.write_td(&mut batch, hash, 0, genesis.block_score);
        db.write_canonical_hash(&mut batch, hash, 0);
        db.write_head_header_hash(&mut batch, hash);
        db.write(&batch).unwrap();
        Arc::new(
            HeaderChain::new(
                db,
                ChainConfig::default(),
                Arc::new(FakeEngine::new()),
                Arc::new(AtomicBool::new(false)),
            )
            .unwrap(),
        )
    }

    fn make_chain(parent: &Header, len: usize, score: u64, seed: u8) -> Vec<Header> {
        let mut parent = parent.clone();
        (0..len)
            .map(|_| {
                let header = Header {
                    parent_hash: parent.hash(),
                    number: parent.number + 1,
                    time: parent.time + 1,
                    block_score: U256::from(score),
                    extra: vec![seed].into(),
                    ..Default::default()
                };
                parent = header.clone();
                header
            })
            .collect()
    }

    #[test]
    fn heavier_side_chain_takes_over_the_canonical_index() {
        let hc = setup();
        let genesis = hc.genesis();
        let light = make_chain(&genesis, 4, 1, 1);
        let heavy = make_chain(&genesis, 3, 3, 2);

        hc.validate_header_chain(&light, 1).unwrap();
        for header in &light {
            assert_eq!(hc.write_header(header).unwrap(), WriteStatus::Canon);
        }
        assert_eq!(hc.current_header(), light[3]);

        let statuses = heavy
            .iter()
            .map(|header| hc.write_header(header).unwrap())
            .collect::<Vec<_>>();
        assert_eq!(statuses, [WriteStatus::Side, WriteStatus::Canon, WriteStatus::Canon]);
        assert_eq!(hc.current_header_hash(), heavy[2].hash());
        for header in &heavy {
            assert_eq!(hc.get_canonical_hash(header.number), Some(header.hash()));
        }
        assert_eq!(hc.get_canonical_hash(4), None, "stale canonical entries must be removed");
        assert_eq!(hc.get_td(heavy[2].hash(), 3), Some(U256::from(10)));
    }

    #[test]
    fn non_contiguous_chains_are_rejected() {
        let hc = setup();
        let mut chain = make_chain(&hc.genesis(), 3, 1, 1);
        chain.remove(1);
        let (index, err) = hc.validate_header_chain(&chain, 0).unwrap_err();
        assert_eq!(index, 1);
        assert!(matches!(err, ChainError::NonContiguousInsert { prev_number: 1, number: 3, .. }));
    }

    #[test]
    fn bad_hashes_are_blacklisted() {
        let hc = setup();
        let chain = make_chain(&hc.genesis(), 2, 1, 1);
        hc.set_bad_hashes([chain[1].hash()]);
        let (index, err) = hc.validate_header_chain(&chain, 0).unwrap_err();
        assert_eq!(index, 1);
        assert!(matches!(err, ChainError::BlacklistedHash(hash) if hash == chain[1].hash()));
    }

    #[test]
    fn set_head_deletes_headers_above_target() {
        let hc = setup();
        let chain = make_chain(&hc.genesis(), 5, 1, 1);
        hc.insert_header_chain(&chain, Instant::now()).unwrap();

        let mut updates = Vec::new();
        let mut deleted = Vec::new();
        hc.set_head(
            2,
            &mut |parent| {
                updates.push(parent.number);
                Ok(())
            },
            &mut |_, _, number| deleted.push(number),
        )
        .unwrap();

        assert_eq!(updates, [4, 3, 2]);
        assert_eq!(deleted, [5, 4, 3]);
        assert_eq!(hc.current_header(), chain[1]);
        assert!(hc.get_header(chain[2].hash(), 3).is_none());
        assert_eq!(hc.get_canonical_hash(3), None);
    }

    #[test]
    fn ancestors_resolve_across_side_chains() {
        let hc = setup();
        let genesis = hc.genesis();
        let canonical = make_chain(&genesis, 6, 2, 1);
        hc.insert_header_chain(&canonical, Instant::now()).unwrap();
        let side = make_chain(&canonical[1], 3, 1, 2);
        hc.insert_header_chain(&side, Instant::now()).unwrap();

        let mut budget = 0;
        assert_eq!(
            hc.get_ancestor(canonical[5].hash(), 6, 4, &mut budget),
            Some((canonical[1].hash(), 2))
        );
        assert_eq!(hc.get_ancestor(side[2].hash(), 5, 2, &mut budget), None);

        let mut budget = 10;
        assert_eq!(
            hc.get_ancestor(side[2].hash(), 5, 3, &mut budget),
            Some((canonical[1].hash(), 2))
        );
        assert_eq!(hc.get_block_hashes_from_hash(canonical[2].hash(), 10).len(), 3);
    }
}
