//! Authenticated account state: the Merkle-Patricia trie, the reference
//! counted node cache in front of the state store, and the journaled
//! [`StateDb`] executing transactions on top of them.

mod database;
mod error;
mod iterator;
mod journal;
mod node;
mod node_db;
mod snapshot;
mod state_db;
mod state_object;
mod sync;
mod trie;

pub use database::StateDatabase;
pub use error::{
    StateError,
    StateResult,
    TrieError,
    TrieResult,
};
pub use iterator::{
    IteratedNode,
    NodeIterator,
    NodeKind,
};
pub use node::{
    CommittedNode,
    Node,
    NodeRef,
    NodeSet,
    node_children,
};
pub use node_db::{
    GcReadGuard,
    NodeDatabase,
    NodeReader,
};
pub use snapshot::{
    Snapshot,
    SnapshotDiff,
    SnapshotTree,
};
pub use state_db::{
    DumpAccount,
    StateDb,
};
pub use sync::{
    SyncResult,
    TrieSync,
};
pub use trie::Trie;
