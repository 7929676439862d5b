use crate::{
    state::{
        error::{
            TrieError,
            TrieResult,
        },
        node::node_children,
        node_db::NodeReader,
    },
    types::{
        Account,
        EMPTY_ROOT_HASH,
        KECCAK_EMPTY,
    },
};
use alloy_primitives::B256;
use alloy_rlp::Decodable;
use std::{
    collections::HashSet,
    sync::Arc,
};

/// What an iterated blob is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Trie,
    Code,
}

/// A hashed trie node or a contract code blob.
#[derive(Debug, Clone)]
pub struct IteratedNode {
    pub hash: B256,
    pub kind: NodeKind,
    pub blob: Arc<[u8]>,
}

#[derive(Debug, Clone, Copy)]
enum Pending {
    Node { hash: B256, account_trie: bool },
    Code(B256),
}

/// Depth-first walk over every hashed node below a root. Started on a state
/// root it descends into storage tries and yields contract code. Shared
/// subtrees and code are yielded once.
pub struct NodeIterator {
    reader: Arc<dyn NodeReader>,
    stack: Vec<Pending>,
    seen: HashSet<B256>,
}

impl NodeIterator {
    /// Walks the state trie at `root`, its storage tries and code.
    pub fn new_state(reader: Arc<dyn NodeReader>, root: B256) -> Self {
        Self::from_node(reader, root, true)
    }

    /// Walks a plain trie.
    pub fn new_trie(reader: Arc<dyn NodeReader>, root: B256) -> Self {
        Self::from_node(reader, root, false)
    }

    /// Walks the subtree under `hash`. `account_trie` tells whether its
    /// leaves are accounts.
    pub fn from_node(reader: Arc<dyn NodeReader>, hash: B256, account_trie: bool) -> Self {
        let mut stack = Vec::new();
        if hash != EMPTY_ROOT_HASH && hash != B256::ZERO {
            stack.push(Pending::Node { hash, account_trie });
        }
        Self {
            reader,
            stack,
            seen: HashSet::new(),
        }
    }

    fn visit(&mut self, pending: Pending) -> TrieResult<IteratedNode> {
        match pending {
            Pending::Code(hash) => {
                let code = self
                    .reader
                    .read_code(hash)?
                    .ok_or(TrieError::MissingNode(hash))?;
                Ok(IteratedNode {
                    hash,
                    kind: NodeKind::Code,
                    blob: code.into(),
                })
            }
            Pending::Node { hash, account_trie } => {
                let blob = self
                    .reader
                    .read_node(hash)?
                    .ok_or(TrieError::MissingNode(hash))?;
                let (children, leaves) = node_children(&blob)?;
                let mut next = Vec::with_capacity(children.len());
                for child in children {
                    next.push(Pending::Node {
                        hash: child,
                        account_trie,
                    });
                }
                if account_trie {
                    for leaf in leaves {
                        let account =
                            Account::decode(&mut leaf.as_slice()).map_err(TrieError::Decode)?;
                        if account.storage_root != EMPTY_ROOT_HASH {
                            next.push(Pending::Node {
                                hash: account.storage_root,
                                account_trie: false,
                            });
                        }
                        if account.code_hash != KECCAK_EMPTY {
                            next.push(Pending::Code(account.code_hash));
                        }
                    }
                }
                self.stack.extend(next.into_iter().rev());
                Ok(IteratedNode {
                    hash,
                    kind: NodeKind::Trie,
                    blob,
                })
            }
        }
    }
}

impl Iterator for NodeIterator {
    type Item = TrieResult<IteratedNode>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let pending = self.stack.pop()?;
            let hash = match pending {
                Pending::Node { hash, .. } | Pending::Code(hash) => hash,
            };
            if !self.seen.insert(hash) {
                continue;
            }
            return Some(self.visit(pending));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::Database,
        state::{
            StateDatabase,
            StateDb,
        },
    };
    use alloy_primitives::{
        Address,
        Bytes,
        U256,
    };

    #[test]
    fn walks_storage_and_code_once() {
        let db = Arc::new(StateDatabase::new(Arc::new(Database::new_in_memory()), 0));
        let mut state = StateDb::new(EMPTY_ROOT_HASH, db.clone()).unwrap();
        for n in 1..=3u8 {
            let address = Address::repeat_byte(n);
            state.add_balance(address, U256::from(n));
            state.set_code(address, Bytes::from_static(b"shared"));
            state.set_state(address, B256::ZERO, B256::with_last_byte(1));
        }
        let root = state.commit(true).unwrap();

        let nodes = NodeIterator::new_state(db.node_db().clone(), root)
            .collect::<TrieResult<Vec<_>>>()
            .unwrap();
        assert_eq!(nodes[0].hash, root);
        let code = nodes
            .iter()
            .filter(|node| node.kind == NodeKind::Code)
            .count();
        assert_eq!(code, 1, "identical code must be yielded once");
        let unique = nodes.iter().map(|node| node.hash).collect::<HashSet<_>>();
        assert_eq!(unique.len(), nodes.len());
        for node in nodes.iter().filter(|node| node.kind == NodeKind::Trie) {
            assert_eq!(alloy_primitives::keccak256(&node.blob), node.hash);
        }
    }

    #[test]
    fn missing_nodes_are_reported() {
        let db = Arc::new(StateDatabase::new(Arc::new(Database::new_in_memory()), 0));
        let mut iter = NodeIterator::new_trie(db.node_db().clone(), B256::repeat_byte(1));
        assert!(matches!(iter.next(), Some(Err(TrieError::MissingNode(_)))));
        assert!(iter.next().is_none());
    }
}
