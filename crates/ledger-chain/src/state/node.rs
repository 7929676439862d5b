//! Merkle-Patricia trie nodes and their RLP form.
//!
//! Nodes whose encoding is shorter than 32 bytes are embedded in their parent;
//! everything else is referenced by `keccak256(encoding)`.

use crate::state::error::{
    TrieError,
    TrieResult,
};
use alloy_primitives::{
    B256,
    keccak256,
};
use alloy_rlp::{
    BufMut,
    Encodable,
    Header as RlpHeader,
};

/// Reference from a parent to a child node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum NodeRef {
    #[default]
    Empty,
    /// Stored node not yet loaded.
    Hash(B256),
    /// Loaded or freshly written node.
    Node(Box<Node>),
}

impl NodeRef {
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    pub(crate) fn node(node: Node) -> Self {
        Self::Node(Box::new(node))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    /// Terminal node holding the remaining key nibbles and the value.
    Leaf { path: Vec<u8>, value: Vec<u8> },
    /// Shared key prefix in front of a branch.
    Extension { path: Vec<u8>, child: NodeRef },
    /// Sixteen-way fork, optionally terminating a key.
    Branch {
        children: Box<[NodeRef; 16]>,
        value: Option<Vec<u8>>,
    },
}

impl Node {
    pub(crate) fn empty_branch() -> Box<[NodeRef; 16]> {
        Box::new(std::array::from_fn(|_| NodeRef::Empty))
    }

    /// Decodes a node from its stored form.
    pub fn decode(blob: &[u8]) -> TrieResult<Self> {
        let mut buf = blob;
        let node = decode_node(&mut buf)?;
        if !buf.is_empty() {
            return Err(TrieError::Decode(alloy_rlp::Error::UnexpectedLength));
        }
        Ok(node)
    }
}

/// Splits a key into nibbles.
pub fn key_to_nibbles(key: &[u8]) -> Vec<u8> {
    let mut nibbles = Vec::with_capacity(key.len() * 2);
    for byte in key {
        nibbles.push(byte >> 4);
        nibbles.push(byte & 0x0f);
    }
    nibbles
}

/// Packs an even number of nibbles back into bytes.
pub fn nibbles_to_key(nibbles: &[u8]) -> Vec<u8> {
    nibbles
        .chunks(2)
        .map(|pair| (pair[0] << 4) | pair.get(1).copied().unwrap_or(0))
        .collect()
}

/// Hex-prefix ("compact") encoding of a path.
fn compact_encode(path: &[u8], leaf: bool) -> Vec<u8> {
    let odd = path.len() % 2 == 1;
    let flag = (u8::from(leaf) << 1) | u8::from(odd);
    let mut out = Vec::with_capacity(path.len() / 2 + 1);
    let rest = if odd {
        out.push((flag << 4) | path[0]);
        &path[1..]
    } else {
        out.push(flag << 4);
        path
    };
    for pair in rest.chunks(2) {
        out.push((pair[0] << 4) | pair[1]);
    }
    out
}

fn compact_decode(compact: &[u8]) -> TrieResult<(Vec<u8>, bool)> {
    let Some(first) = compact.first() else {
        return Err(TrieError::Decode(alloy_rlp::Error::InputTooShort));
    };
    let flag = first >> 4;
    if flag > 3 {
        return Err(TrieError::Decode(alloy_rlp::Error::Custom("invalid compact flag")));
    }
    let leaf = flag & 2 != 0;
    let mut path = Vec::with_capacity(compact.len() * 2);
    if flag & 1 != 0 {
        path.push(first & 0x0f);
    }
    path.extend(key_to_nibbles(&compact[1..]));
    Ok((path, leaf))
}

/// Returns the next complete RLP item (header included) and advances `buf`.
fn take_item<'a>(buf: &mut &'a [u8]) -> TrieResult<(&'a [u8], RlpHeader, &'a [u8])> {
    let start = *buf;
    let header = RlpHeader::decode(buf).map_err(TrieError::Decode)?;
    if buf.len() < header.payload_length {
        return Err(TrieError::Decode(alloy_rlp::Error::InputTooShort));
    }
    let payload = &buf[..header.payload_length];
    *buf = &buf[header.payload_length..];
    let raw = &start[..start.len() - buf.len()];
    Ok((raw, header, payload))
}

fn decode_ref(buf: &mut &[u8]) -> TrieResult<NodeRef> {
    let (_, header, payload) = take_item(buf)?;
    if header.list {
        let mut inner = payload;
        let node = decode_list(&mut inner)?;
        return Ok(NodeRef::node(node));
    }
    match payload.len() {
        0 => Ok(NodeRef::Empty),
        32 => Ok(NodeRef::Hash(B256::from_slice(payload))),
        _ => Err(TrieError::Decode(alloy_rlp::Error::UnexpectedLength)),
    }
}

fn decode_node(buf: &mut &[u8]) -> TrieResult<Node> {
    let (_, header, payload) = take_item(buf)?;
    if !header.list {
        return Err(TrieError::Decode(alloy_rlp::Error::UnexpectedString));
    }
    let mut payload = payload;
    decode_list(&mut payload)
}

/// Decodes the payload of a node list.
fn decode_list(payload: &mut &[u8]) -> TrieResult<Node> {
    let mut items = Vec::with_capacity(17);
    let mut cursor = *payload;
    while !cursor.is_empty() {
        let (raw, _, _) = take_item(&mut cursor)?;
        items.push(raw);
    }
    *payload = cursor;

    match items.len() {
        2 => {
            let mut key_buf = items[0];
            let (_, key_header, compact) = take_item(&mut key_buf)?;
            if key_header.list {
                return Err(TrieError::Decode(alloy_rlp::Error::UnexpectedList));
            }
            let (path, leaf) = compact_decode(compact)?;
            let mut value_buf = items[1];
            if leaf {
                let (_, value_header, value) = take_item(&mut value_buf)?;
                if value_header.list {
                    return Err(TrieError::Decode(alloy_rlp::Error::UnexpectedList));
                }
                Ok(Node::Leaf {
                    path,
                    value: value.to_vec(),
                })
            } else {
                Ok(Node::Extension {
                    path,
                    child: decode_ref(&mut value_buf)?,
                })
            }
        }
        17 => {
            let mut children = Node::empty_branch();
            for (slot, raw) in children.iter_mut().zip(items.iter()) {
                let mut raw = *raw;
                *slot = decode_ref(&mut raw)?;
            }
            let mut value_buf = items[16];
            let (_, value_header, value) = take_item(&mut value_buf)?;
            if value_header.list {
                return Err(TrieError::Decode(alloy_rlp::Error::UnexpectedList));
            }
            Ok(Node::Branch {
                children,
                value: (!value.is_empty()).then(|| value.to_vec()),
            })
        }
        _ => Err(TrieError::Decode(alloy_rlp::Error::Custom("invalid node item count"))),
    }
}

/// A hashed node produced by [`Hasher`] in commit mode.
#[derive(Debug, Clone)]
pub struct CommittedNode {
    pub hash: B256,
    pub blob: Vec<u8>,
    /// Hashed nodes referenced from this node, including through embedded children.
    pub children: Vec<B256>,
}

/// Nodes and leaves collected while committing a trie.
#[derive(Debug, Clone, Default)]
pub struct NodeSet {
    /// Hashed nodes, children before parents.
    pub nodes: Vec<CommittedNode>,
    /// Leaf values with the hash of the closest hashed node containing them.
    pub leaves: Vec<(Vec<u8>, B256)>,
}

impl NodeSet {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }
}

/// Result of hashing a subtree: the bytes the parent embeds, plus hashes and
/// leaves that are not yet attributed to a hashed ancestor.
struct Encoded {
    reference: Vec<u8>,
    children: Vec<B256>,
    leaves: Vec<Vec<u8>>,
}

/// Computes node encodings and hashes, optionally collecting a [`NodeSet`].
pub(crate) struct Hasher {
    collect: Option<NodeSet>,
}

impl Hasher {
    pub(crate) fn new(collect: bool) -> Self {
        Self {
            collect: collect.then(NodeSet::default),
        }
    }

    pub(crate) fn into_set(self) -> NodeSet {
        self.collect.unwrap_or_default()
    }

    /// Root hash of `root`. The root is always hashed, whatever its size.
    pub(crate) fn hash_root(&mut self, root: &NodeRef) -> B256 {
        match root {
            NodeRef::Empty => crate::types::EMPTY_ROOT_HASH,
            NodeRef::Hash(hash) => *hash,
            NodeRef::Node(node) => {
                let encoded = self.encode_node(node);
                self.seal(encoded.reference, encoded.children, encoded.leaves)
            }
        }
    }

    fn encode_ref(&mut self, node_ref: &NodeRef) -> Encoded {
        match node_ref {
            NodeRef::Empty => {
                Encoded {
                    reference: vec![alloy_rlp::EMPTY_STRING_CODE],
                    children: Vec::new(),
                    leaves: Vec::new(),
                }
            }
            NodeRef::Hash(hash) => {
                Encoded {
                    reference: alloy_rlp::encode(*hash),
                    children: vec![*hash],
                    leaves: Vec::new(),
                }
            }
            NodeRef::Node(node) => {
                let encoded = self.encode_node(node);
                if encoded.reference.len() < 32 {
                    return encoded;
                }
                let hash = self.seal(encoded.reference, encoded.children, encoded.leaves);
                Encoded {
                    reference: alloy_rlp::encode(hash),
                    children: vec![hash],
                    leaves: Vec::new(),
                }
            }
        }
    }

    fn seal(&mut self, blob: Vec<u8>, children: Vec<B256>, leaves: Vec<Vec<u8>>) -> B256 {
        let hash = keccak256(&blob);
        if let Some(set) = &mut self.collect {
            set.nodes.push(CommittedNode {
                hash,
                blob,
                children,
            });
            set.leaves
                .extend(leaves.into_iter().map(|leaf| (leaf, hash)));
        }
        hash
    }

    fn encode_node(&mut self, node: &Node) -> Encoded {
        let mut payload = Vec::new();
        let mut children = Vec::new();
        let mut leaves = Vec::new();
        match node {
            Node::Leaf { path, value } => {
                compact_encode(path, true).as_slice().encode(&mut payload);
                value.as_slice().encode(&mut payload);
                leaves.push(value.clone());
            }
            Node::Extension { path, child } => {
                compact_encode(path, false).as_slice().encode(&mut payload);
                let child = self.encode_ref(child);
                payload.put_slice(&child.reference);
                children.extend(child.children);
                leaves.extend(child.leaves);
            }
            Node::Branch {
                children: slots,
                value,
            } => {
                for slot in slots.iter() {
                    let child = self.encode_ref(slot);
                    payload.put_slice(&child.reference);
                    children.extend(child.children);
                    leaves.extend(child.leaves);
                }
                match value {
                    Some(value) => {
                        value.as_slice().encode(&mut payload);
                        leaves.push(value.clone());
                    }
                    None => payload.put_u8(alloy_rlp::EMPTY_STRING_CODE),
                }
            }
        }
        let mut reference = Vec::with_capacity(payload.len() + 4);
        RlpHeader {
            list: true,
            payload_length: payload.len(),
        }
        .encode(&mut reference);
        reference.extend_from_slice(&payload);
        Encoded {
            reference,
            children,
            leaves,
        }
    }
}

/// Hashed children and leaf values referenced by a stored node.
pub fn node_children(blob: &[u8]) -> TrieResult<(Vec<B256>, Vec<Vec<u8>>)> {
    let node = Node::decode(blob)?;
    let mut hashes = Vec::new();
    let mut leaves = Vec::new();
    collect_refs(&node, &mut hashes, &mut leaves);
    Ok((hashes, leaves))
}

fn collect_refs(node: &Node, hashes: &mut Vec<B256>, leaves: &mut Vec<Vec<u8>>) {
    fn visit(child: &NodeRef, hashes: &mut Vec<B256>, leaves: &mut Vec<Vec<u8>>) {
        match child {
            NodeRef::Empty => {}
            NodeRef::Hash(hash) => hashes.push(*hash),
            NodeRef::Node(inner) => collect_refs(inner, hashes, leaves),
        }
    }
    match node {
        Node::Leaf { value, .. } => leaves.push(value.clone()),
        Node::Extension { child, .. } => visit(child, hashes, leaves),
        Node::Branch { children, value } => {
            for child in children.iter() {
                visit(child, hashes, leaves);
            }
            if let Some(value) = value {
                leaves.push(value.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_encoding_vectors() {
        assert_eq!(compact_encode(&[1, 2, 3, 4, 5], false), vec![0x11, 0x23, 0x45]);
        assert_eq!(compact_encode(&[0, 1, 2, 3, 4, 5], false), vec![0x00, 0x01, 0x23, 0x45]);
        assert_eq!(compact_encode(&[0, 15, 1, 12, 11, 8], true), vec![0x20, 0x0f, 0x1c, 0xb8]);
        assert_eq!(compact_encode(&[15, 1, 12, 11, 8], true), vec![0x3f, 0x1c, 0xb8]);
        for (path, leaf) in [(vec![1, 2, 3], true), (vec![], false), (vec![4, 5], true)] {
            assert_eq!(compact_decode(&compact_encode(&path, leaf)).unwrap(), (path, leaf));
        }
    }

    #[test]
    fn branch_with_embedded_and_hashed_children_decodes() {
        let mut children = Node::empty_branch();
        children[1] = NodeRef::node(Node::Leaf {
            path: vec![2],
            value: vec![7],
        });
        children[9] = NodeRef::Hash(B256::repeat_byte(3));
        let branch = Node::Branch {
            children,
            value: Some(vec![1, 2, 3]),
        };

        let mut hasher = Hasher::new(true);
        hasher.hash_root(&NodeRef::node(branch.clone()));
        let set = hasher.into_set();
        assert_eq!(set.len(), 1, "the embedded leaf must not be stored separately");
        let stored = &set.nodes[0];
        assert_eq!(stored.children, vec![B256::repeat_byte(3)]);
        assert_eq!(set.leaves.len(), 2);

        assert_eq!(Node::decode(&stored.blob).unwrap(), branch);
        let (hashes, leaves) = node_children(&stored.blob).unwrap();
        assert_eq!(hashes, vec![B256::repeat_byte(3)]);
        assert_eq!(leaves, vec![vec![7], vec![1, 2, 3]]);
    }

    #[test]
    fn nibble_round_trip() {
        let key = [0xab, 0x01, 0xf0];
        assert_eq!(key_to_nibbles(&key), vec![0xa, 0xb, 0x0, 0x1, 0xf, 0x0]);
        assert_eq!(nibbles_to_key(&key_to_nibbles(&key)), key.to_vec());
    }
}
