//! Chain data types and their canonical encodings.

mod account;
mod block;
mod derive_sha;
mod header;
pub(crate) mod macros;
mod receipt;
mod transaction;

pub use account::{
    Account,
    EMPTY_ROOT_HASH,
    KECCAK_EMPTY,
};
pub use block::{
    Block,
    BlockRef,
    Body,
};
pub use derive_sha::{
    current_derive_sha,
    derive_sha,
    derive_sha_by,
    derive_sha_with,
    init_derive_sha,
};
pub use header::Header;
pub use receipt::{
    Log,
    Receipt,
    ReceiptStatus,
    create_bloom,
    decode_receipts_from_storage,
    encode_receipts_for_storage,
    logs_bloom,
};
pub use transaction::{
    AccessList,
    AccessListTx,
    AccessTuple,
    AnchoringTx,
    CancelTx,
    DynamicFeeTx,
    ETH_TX_TYPE_ENVELOPE,
    FeeDelegatedTx,
    FeePayerSig,
    FeeRatio,
    LegacyTx,
    Transaction,
    TxData,
    TxError,
    TxSignature,
    TxType,
};

pub use alloy_primitives::{
    Address,
    B256,
    Bloom,
    Bytes,
    TxKind,
    U256,
    keccak256,
};

use alloy_primitives::BloomInput;

/// Transaction root of a block body.
pub fn tx_root(transactions: &[Transaction]) -> B256 {
    derive_sha_with(transactions, |tx, out| tx.encode_envelope(out))
}

/// Receipt root of a block.
pub fn receipt_root(receipts: &[Receipt]) -> B256 {
    derive_sha(receipts)
}

/// Contract address derived from the creator and its nonce.
pub fn create_address(creator: Address, nonce: u64) -> Address {
    creator.create(nonce)
}

/// True when `bloom` may contain `address`.
pub fn bloom_may_contain(bloom: &Bloom, address: &Address) -> bool {
    bloom.contains_input(BloomInput::Raw(address.as_slice()))
}
