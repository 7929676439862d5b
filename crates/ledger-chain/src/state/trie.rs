use crate::{
    state::{
        error::{
            TrieError,
            TrieResult,
        },
        node::{
            Hasher,
            Node,
            NodeRef,
            NodeSet,
            key_to_nibbles,
            nibbles_to_key,
        },
        node_db::NodeDatabase,
    },
    types::EMPTY_ROOT_HASH,
};
use alloy_primitives::B256;
use std::sync::Arc;

/// Merkle-Patricia trie over raw keys.
///
/// Unmodified subtrees stay as hash references and are loaded from the
/// [`NodeDatabase`] on demand. Modified nodes live in memory until
/// [`Trie::commit`] hands them out as a [`NodeSet`].
#[derive(Debug, Clone)]
pub struct Trie {
    root: NodeRef,
    db: Option<Arc<NodeDatabase>>,
}

fn common_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

fn concat(prefix: &[u8], rest: &[u8]) -> Vec<u8> {
    let mut path = Vec::with_capacity(prefix.len() + rest.len());
    path.extend_from_slice(prefix);
    path.extend_from_slice(rest);
    path
}

fn leaf(path: &[u8], value: Vec<u8>) -> NodeRef {
    NodeRef::node(Node::Leaf {
        path: path.to_vec(),
        value,
    })
}

impl Trie {
    /// An empty trie without backing storage.
    pub fn new_empty() -> Self {
        Self {
            root: NodeRef::Empty,
            db: None,
        }
    }

    /// Opens the trie rooted at `root`. The root node must be resolvable.
    pub fn open(root: B256, db: Arc<NodeDatabase>) -> TrieResult<Self> {
        if root == EMPTY_ROOT_HASH || root == B256::ZERO {
            return Ok(Self {
                root: NodeRef::Empty,
                db: Some(db),
            });
        }
        if db.node(root)?.is_none() {
            return Err(TrieError::MissingNode(root));
        }
        Ok(Self {
            root: NodeRef::Hash(root),
            db: Some(db),
        })
    }

    pub fn node_db(&self) -> Option<&Arc<NodeDatabase>> {
        self.db.as_ref()
    }

    fn resolve(&self, hash: B256) -> TrieResult<Node> {
        let Some(db) = &self.db else {
            return Err(TrieError::MissingNode(hash));
        };
        match db.node(hash)? {
            Some(blob) => Node::decode(&blob),
            None => Err(TrieError::MissingNode(hash)),
        }
    }

    pub fn get(&self, key: &[u8]) -> TrieResult<Option<Vec<u8>>> {
        let path = key_to_nibbles(key);
        match &self.root {
            NodeRef::Empty => Ok(None),
            NodeRef::Hash(hash) => self.lookup(&self.resolve(*hash)?, &path),
            NodeRef::Node(node) => self.lookup(node, &path),
        }
    }

    fn lookup(&self, node: &Node, path: &[u8]) -> TrieResult<Option<Vec<u8>>> {
        let (child, rest) = match node {
            Node::Leaf { path: leaf_path, value } => {
                return Ok((leaf_path.as_slice() == path).then(|| value.clone()));
            }
            Node::Extension {
                path: ext_path,
                child,
            } => {
                if !path.starts_with(ext_path) {
                    return Ok(None);
                }
                (child, &path[ext_path.len()..])
            }
            Node::Branch { children, value } => {
                let Some((first, rest)) = path.split_first() else {
                    return Ok(value.clone());
                };
                (&children[usize::from(*first)], rest)
            }
        };
        match child {
            NodeRef::Empty => Ok(None),
            NodeRef::Hash(hash) => self.lookup(&self.resolve(*hash)?, rest),
            NodeRef::Node(node) => self.lookup(node, rest),
        }
    }

    /// Sets `key` to `value`. An empty value deletes the key.
    pub fn update(&mut self, key: &[u8], value: &[u8]) -> TrieResult {
        if value.is_empty() {
            return self.delete(key);
        }
        let path = key_to_nibbles(key);
        let root = std::mem::take(&mut self.root);
        self.root = self.insert(root, &path, value.to_vec())?;
        Ok(())
    }

    pub fn delete(&mut self, key: &[u8]) -> TrieResult {
        let path = key_to_nibbles(key);
        let root = std::mem::take(&mut self.root);
        let (_, root) = self.remove(root, &path)?;
        self.root = root;
        Ok(())
    }

    fn insert(&self, node: NodeRef, path: &[u8], value: Vec<u8>) -> TrieResult<NodeRef> {
        let node = match node {
            NodeRef::Empty => return Ok(leaf(path, value)),
            NodeRef::Hash(hash) => self.resolve(hash)?,
            NodeRef::Node(node) => *node,
        };
        match node {
            Node::Leaf {
                path: leaf_path,
                value: leaf_value,
            } => {
                let common = common_prefix(&leaf_path, path);
                if common == leaf_path.len() && common == path.len() {
                    return Ok(leaf(path, value));
                }
                let mut children = Node::empty_branch();
                let mut branch_value = None;
                if common == leaf_path.len() {
                    branch_value = Some(leaf_value);
                } else {
                    children[usize::from(leaf_path[common])] =
                        leaf(&leaf_path[common + 1..], leaf_value);
                }
                if common == path.len() {
                    branch_value = Some(value);
                } else {
                    children[usize::from(path[common])] = leaf(&path[common + 1..], value);
                }
                Ok(wrap_in_extension(
                    &path[..common],
                    Node::Branch {
                        children,
                        value: branch_value,
                    },
                ))
            }
            Node::Extension {
                path: ext_path,
                child,
            } => {
                let common = common_prefix(&ext_path, path);
                if common == ext_path.len() {
                    let child = self.insert(child, &path[common..], value)?;
                    return Ok(NodeRef::node(Node::Extension {
                        path: ext_path,
                        child,
                    }));
                }
                let mut children = Node::empty_branch();
                let mut branch_value = None;
                let ext_rest = &ext_path[common + 1..];
                children[usize::from(ext_path[common])] = if ext_rest.is_empty() {
                    child
                } else {
                    NodeRef::node(Node::Extension {
                        path: ext_rest.to_vec(),
                        child,
                    })
                };
                if common == path.len() {
                    branch_value = Some(value);
                } else {
                    children[usize::from(path[common])] = leaf(&path[common + 1..], value);
                }
                Ok(wrap_in_extension(
                    &path[..common],
                    Node::Branch {
                        children,
                        value: branch_value,
                    },
                ))
            }
            Node::Branch {
                mut children,
                value: branch_value,
            } => {
                let Some((first, rest)) = path.split_first() else {
                    return Ok(NodeRef::node(Node::Branch {
                        children,
                        value: Some(value),
                    }));
                };
                let slot = usize::from(*first);
                let child = std::mem::take(&mut children[slot]);
                children[slot] = self.insert(child, rest, value)?;
                Ok(NodeRef::node(Node::Branch {
                    children,
                    value: branch_value,
                }))
            }
        }
    }

    /// Removes `path` below `node`. Returns whether anything changed.
    fn remove(&self, node: NodeRef, path: &[u8]) -> TrieResult<(bool, NodeRef)> {
        let (node, original_hash) = match node {
            NodeRef::Empty => return Ok((false, NodeRef::Empty)),
            NodeRef::Hash(hash) => (self.resolve(hash)?, Some(hash)),
            NodeRef::Node(node) => (*node, None),
        };
        let unchanged = |node: Node| -> NodeRef {
            match original_hash {
                Some(hash) => NodeRef::Hash(hash),
                None => NodeRef::node(node),
            }
        };

        match node {
            Node::Leaf {
                path: leaf_path,
                value,
            } => {
                if leaf_path.as_slice() == path {
                    Ok((true, NodeRef::Empty))
                } else {
                    Ok((
                        false,
                        unchanged(Node::Leaf {
                            path: leaf_path,
                            value,
                        }),
                    ))
                }
            }
            Node::Extension {
                path: ext_path,
                child,
            } => {
                if !path.starts_with(&ext_path) {
                    return Ok((
                        false,
                        unchanged(Node::Extension {
                            path: ext_path,
                            child,
                        }),
                    ));
                }
                let (changed, child) = self.remove(child, &path[ext_path.len()..])?;
                if !changed {
                    return Ok((
                        false,
                        unchanged(Node::Extension {
                            path: ext_path,
                            child,
                        }),
                    ));
                }
                let merged = match child {
                    NodeRef::Empty => NodeRef::Empty,
                    NodeRef::Node(inner) => {
                        match *inner {
                            Node::Leaf {
                                path: child_path,
                                value,
                            } => leaf(&concat(&ext_path, &child_path), value),
                            Node::Extension {
                                path: child_path,
                                child,
                            } => {
                                NodeRef::node(Node::Extension {
                                    path: concat(&ext_path, &child_path),
                                    child,
                                })
                            }
                            branch @ Node::Branch { .. } => {
                                NodeRef::node(Node::Extension {
                                    path: ext_path,
                                    child: NodeRef::node(branch),
                                })
                            }
                        }
                    }
                    hash @ NodeRef::Hash(_) => {
                        NodeRef::node(Node::Extension {
                            path: ext_path,
                            child: hash,
                        })
                    }
                };
                Ok((true, merged))
            }
            Node::Branch {
                mut children,
                mut value,
            } => {
                match path.split_first() {
                    None => {
                        if value.is_none() {
                            return Ok((false, unchanged(Node::Branch { children, value })));
                        }
                        value = None;
                    }
                    Some((first, rest)) => {
                        let slot = usize::from(*first);
                        let child = std::mem::take(&mut children[slot]);
                        let (changed, child) = self.remove(child, rest)?;
                        children[slot] = child;
                        if !changed {
                            return Ok((false, unchanged(Node::Branch { children, value })));
                        }
                    }
                }
                Ok((true, self.collapse_branch(children, value)?))
            }
        }
    }

    /// Reduces a branch with fewer than two entries to a leaf or extension.
    fn collapse_branch(
        &self,
        mut children: Box<[NodeRef; 16]>,
        value: Option<Vec<u8>>,
    ) -> TrieResult<NodeRef> {
        let occupied = children
            .iter()
            .enumerate()
            .filter(|(_, child)| !child.is_empty())
            .map(|(slot, _)| slot)
            .collect::<Vec<_>>();
        let entries = occupied.len() + usize::from(value.is_some());
        if entries >= 2 {
            return Ok(NodeRef::node(Node::Branch { children, value }));
        }
        if let Some(value) = value {
            return Ok(leaf(&[], value));
        }
        let Some(&slot) = occupied.first() else {
            return Ok(NodeRef::Empty);
        };
        let nibble = u8::try_from(slot).unwrap_or_default();
        let child = std::mem::take(&mut children[slot]);
        let (resolved, child_hash) = match child {
            NodeRef::Hash(hash) => (self.resolve(hash)?, Some(hash)),
            NodeRef::Node(node) => (*node, None),
            NodeRef::Empty => return Ok(NodeRef::Empty),
        };
        Ok(match resolved {
            Node::Leaf { path, value } => leaf(&concat(&[nibble], &path), value),
            Node::Extension { path, child } => {
                NodeRef::node(Node::Extension {
                    path: concat(&[nibble], &path),
                    child,
                })
            }
            branch @ Node::Branch { .. } => {
                let child = match child_hash {
                    Some(hash) => NodeRef::Hash(hash),
                    None => NodeRef::node(branch),
                };
                NodeRef::node(Node::Extension {
                    path: vec![nibble],
                    child,
                })
            }
        })
    }

    /// Root hash without persisting anything.
    pub fn hash(&self) -> B256 {
        Hasher::new(false).hash_root(&self.root)
    }

    /// Hashes the trie and collects every in-memory node for the node
    /// database. Afterwards the trie only holds a reference to its root.
    pub fn commit(&mut self) -> (B256, NodeSet) {
        let mut hasher = Hasher::new(true);
        let root = hasher.hash_root(&self.root);
        if !self.root.is_empty() {
            self.root = NodeRef::Hash(root);
        }
        (root, hasher.into_set())
    }

    /// Every `(key, value)` pair in key order.
    pub fn entries(&self) -> TrieResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut out = Vec::new();
        let mut prefix = Vec::new();
        self.collect_entries(&self.root, &mut prefix, &mut out)?;
        Ok(out)
    }

    fn collect_entries(
        &self,
        node: &NodeRef,
        prefix: &mut Vec<u8>,
        out: &mut Vec<(Vec<u8>, Vec<u8>)>,
    ) -> TrieResult {
        let resolved;
        let node = match node {
            NodeRef::Empty => return Ok(()),
            NodeRef::Hash(hash) => {
                resolved = self.resolve(*hash)?;
                &resolved
            }
            NodeRef::Node(node) => node.as_ref(),
        };
        match node {
            Node::Leaf { path, value } => {
                out.push((nibbles_to_key(&concat(prefix, path)), value.clone()));
            }
            Node::Extension { path, child } => {
                let len = prefix.len();
                prefix.extend_from_slice(path);
                self.collect_entries(child, prefix, out)?;
                prefix.truncate(len);
            }
            Node::Branch { children, value } => {
                if let Some(value) = value {
                    out.push((nibbles_to_key(prefix), value.clone()));
                }
                for (nibble, child) in (0u8..).zip(children.iter()) {
                    prefix.push(nibble);
                    self.collect_entries(child, prefix, out)?;
                    prefix.pop();
                }
            }
        }
        Ok(())
    }
}

fn wrap_in_extension(prefix: &[u8], branch: Node) -> NodeRef {
    if prefix.is_empty() {
        NodeRef::node(branch)
    } else {
        NodeRef::node(Node::Extension {
            path: prefix.to_vec(),
            child: NodeRef::node(branch),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use alloy_primitives::keccak256;

    fn node_db() -> Arc<NodeDatabase> {
        Arc::new(NodeDatabase::new(Arc::new(Database::new_in_memory()), 0))
    }

    #[test]
    fn insert_get_delete() {
        let mut trie = Trie::new_empty();
        trie.update(b"doe", b"reindeer").unwrap();
        trie.update(b"dog", b"puppy").unwrap();
        trie.update(b"dogglesworth", b"cat").unwrap();
        assert_eq!(trie.get(b"dog").unwrap(), Some(b"puppy".to_vec()));
        assert_eq!(trie.get(b"do").unwrap(), None);
        // Well-known root of the classic "doe/dog/dogglesworth" trie.
        assert_eq!(
            trie.hash(),
            "0x8aad789dff2f538bca5d8ea56e8abe10f4c7ba3a5dea95fea4cd6e7c3a1168d3"
                .parse::<B256>()
                .unwrap()
        );

        trie.delete(b"dogglesworth").unwrap();
        trie.delete(b"doe").unwrap();
        trie.delete(b"dog").unwrap();
        assert_eq!(trie.hash(), EMPTY_ROOT_HASH);
    }

    #[test]
    fn delete_restores_previous_root() {
        let mut trie = Trie::new_empty();
        for i in 0u32..64 {
            trie.update(keccak256(i.to_be_bytes()).as_slice(), &i.to_be_bytes()).unwrap();
        }
        let before = trie.hash();
        trie.update(b"extra", b"value").unwrap();
        assert_ne!(trie.hash(), before);
        trie.delete(b"extra").unwrap();
        assert_eq!(trie.hash(), before, "delete must collapse back to the canonical shape");
    }

    #[test]
    fn committed_trie_reopens_from_node_db() {
        let db = node_db();
        let mut trie = Trie::open(EMPTY_ROOT_HASH, db.clone()).unwrap();
        for i in 0u32..100 {
            trie.update(keccak256(i.to_be_bytes()).as_slice(), &[1; 40]).unwrap();
        }
        let (root, set) = trie.commit();
        assert!(!set.is_empty());
        db.insert_set(&set);

        let reopened = Trie::open(root, db.clone()).unwrap();
        assert_eq!(reopened.hash(), root);
        assert_eq!(
            reopened.get(keccak256(7u32.to_be_bytes()).as_slice()).unwrap(),
            Some(vec![1; 40])
        );
        assert_eq!(reopened.entries().unwrap().len(), 100);

        let mut modified = reopened.clone();
        modified.delete(keccak256(7u32.to_be_bytes()).as_slice()).unwrap();
        assert_ne!(modified.hash(), root);
        assert!(matches!(
            Trie::open(B256::repeat_byte(1), db),
            Err(TrieError::MissingNode(_))
        ));
    }

    #[test]
    fn entries_come_out_sorted() {
        let mut trie = Trie::new_empty();
        for key in [b"b".as_slice(), b"a", b"ab", b"c"] {
            trie.update(key, b"v").unwrap();
        }
        let keys = trie
            .entries()
            .unwrap()
            .into_iter()
            .map(|(key, _)| key)
            .collect::<Vec<_>>();
        assert_eq!(keys, vec![b"a".to_vec(), b"ab".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }
}
