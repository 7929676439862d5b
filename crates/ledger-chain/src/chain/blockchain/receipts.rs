use super::{
    BlockChain,
    InsertStats,
};
use crate::{
    chain::error::{
        ChainError,
        InsertError,
    },
    db::BatchTarget,
    params::ChainConfig,
    types::{
        Block,
        BlockRef,
        Receipt,
        TxKind,
        create_address,
    },
};
use std::{
    sync::atomic::Ordering,
    time::Instant,
};
use tracing::{
    debug,
    info,
};

/// Fills the fields of stored receipts that are derived from their block:
/// transaction hashes, created contract addresses and log positions.
pub fn set_receipts_data(config: &ChainConfig, block: &Block, receipts: &mut [Receipt]) {
    let mut log_index = 0u32;
    for (index, (receipt, tx)) in receipts
        .iter_mut()
        .zip(block.transactions())
        .enumerate()
    {
        receipt.tx_hash = tx.hash();
        if tx.to() == TxKind::Create {
            if let Ok(sender) = tx.sender(config.chain_id) {
                receipt.contract_address = Some(create_address(sender, tx.nonce()));
            }
        }
        for log in &mut receipt.logs {
            log.block_number = block.number();
            log.block_hash = block.hash();
            log.tx_hash = receipt.tx_hash;
            log.tx_index = u32::try_from(index).unwrap_or(u32::MAX);
            log.index = log_index;
            log_index += 1;
        }
    }
}

impl BlockChain {
    /// Imports bodies and receipts of blocks whose headers are already
    /// known, without executing them. The fast head moves forward when the
    /// last block is heavier.
    pub fn insert_receipt_chain(
        &self,
        blocks: &[BlockRef],
        receipts: Vec<Vec<Receipt>>,
    ) -> Result<InsertStats, InsertError> {
        Self::check_contiguous(blocks)?;
        let start = Instant::now();
        let mut stats = InsertStats::default();
        let mut batch = self.db.new_batch(BatchTarget::Chain);

        for (index, (block, mut block_receipts)) in blocks.iter().zip(receipts).enumerate() {
            if self.proc_interrupt.load(Ordering::Relaxed) {
                debug!(target: "ledger-chain::blockchain", "Premature abort during receipts processing");
                return Err(InsertError::new(index, ChainError::InsertAborted));
            }
            if block.transactions().len() != block_receipts.len() {
                return Err(InsertError::new(
                    index,
                    ChainError::ReceiptCountMismatch {
                        index,
                        receipts: block_receipts.len(),
                        txs: block.transactions().len(),
                    },
                ));
            }
            if !self.has_header(block.hash(), block.number()) {
                return Err(InsertError::new(
                    index,
                    ChainError::MissingHeader(block.hash()),
                ));
            }
            if self.has_block(block.hash(), block.number()) {
                stats.ignored += 1;
                continue;
            }
            set_receipts_data(&self.chain_config, block, &mut block_receipts);
            self.db
                .write_body(&mut batch, block.hash(), block.number(), block.body());
            self.db
                .write_receipts(&mut batch, block.hash(), block.number(), &block_receipts);
            self.db.write_tx_lookup_entries(&mut batch, block);
            stats.processed += 1;
            stats.txs += block.transactions().len();
            self.db
                .write_batch_if_over_threshold(&mut batch)
                .map_err(|err| InsertError::new(index, err))?;
        }
        self.db
            .flush_batch(&mut batch)
            .map_err(|err| InsertError::new(blocks.len().saturating_sub(1), err))?;

        if let Some(head) = blocks.last() {
            let _guard = self.chain_mu.lock();
            let fast = self.current_fast_block();
            let head_td = self.get_td(head.hash(), head.number());
            let fast_td = self.get_td(fast.hash(), fast.number());
            if head_td > fast_td {
                let mut batch = self.db.new_batch(BatchTarget::Chain);
                self.db.write_head_fast_block_hash(&mut batch, head.hash());
                self.db
                    .write(&batch)
                    .map_err(|err| InsertError::new(blocks.len() - 1, err))?;
                *self.current_fast_block.write() = head.clone();
            }
            info!(
                target: "ledger-chain::blockchain",
                count = stats.processed,
                elapsed = ?start.elapsed(),
                number = head.number(),
                hash = %head.hash(),
                ignored = stats.ignored,
                "Imported new block receipts"
            );
        }
        Ok(stats)
    }
}
