use crate::db::DatabaseError;
use alloy_primitives::B256;

#[derive(thiserror::Error, Debug)]
pub enum TrieError {
    #[error("Missing trie node {0}")]
    MissingNode(B256),
    #[error("Failed to decode trie node")]
    Decode(#[source] alloy_rlp::Error),
    #[error("Database error")]
    Database(#[from] DatabaseError),
    #[error("Received sync data for unrequested hash {0}")]
    UnrequestedSyncResult(B256),
}

pub type TrieResult<T = ()> = Result<T, TrieError>;

#[derive(thiserror::Error, Debug)]
pub enum StateError {
    #[error("Trie error")]
    Trie(#[from] TrieError),
    #[error("Database error")]
    Database(#[from] DatabaseError),
    #[error("Failed to decode account {address}")]
    AccountDecode {
        address: alloy_primitives::Address,
        #[source]
        source: alloy_rlp::Error,
    },
    #[error("Failed to decode storage slot {slot} of {address}")]
    StorageDecode {
        address: alloy_primitives::Address,
        slot: B256,
        #[source]
        source: alloy_rlp::Error,
    },
    #[error("Missing contract code {0}")]
    MissingCode(B256),
    #[error("Revision id {0} cannot be reverted")]
    InvalidRevision(usize),
    #[error("Snapshot for root {0} is unavailable")]
    SnapshotUnavailable(B256),
    #[error("Failed to encode the snapshot journal")]
    Journal(#[source] bincode::Error),
}

pub type StateResult<T = ()> = Result<T, StateError>;
