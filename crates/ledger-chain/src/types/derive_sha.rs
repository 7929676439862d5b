//! List roots for transactions and receipts.
//!
//! The implementation is process-wide and chosen once by [`init_derive_sha`]
//! when the chain is opened; it defaults to the trie form.

use crate::params::DeriveShaImpl;
use alloy_primitives::{
    B256,
    keccak256,
};
use alloy_rlp::Encodable;
use alloy_trie::{
    EMPTY_ROOT_HASH,
    HashBuilder,
    Nibbles,
};
use std::sync::atomic::{
    AtomicU8,
    Ordering,
};

static DERIVE_SHA_IMPL: AtomicU8 = AtomicU8::new(0);

/// Selects the process-wide derive-sha implementation.
pub fn init_derive_sha(implementation: DeriveShaImpl) {
    let tag = match implementation {
        DeriveShaImpl::Trie => 0,
        DeriveShaImpl::Simple => 1,
        DeriveShaImpl::Concat => 2,
    };
    DERIVE_SHA_IMPL.store(tag, Ordering::Release);
}

pub fn current_derive_sha() -> DeriveShaImpl {
    match DERIVE_SHA_IMPL.load(Ordering::Acquire) {
        1 => DeriveShaImpl::Simple,
        2 => DeriveShaImpl::Concat,
        _ => DeriveShaImpl::Trie,
    }
}

/// Root over `items` using their RLP encoding.
pub fn derive_sha<T: Encodable>(items: &[T]) -> B256 {
    derive_sha_with(items, |item, out| item.encode(out))
}

/// Root over `items` using a caller-provided encoder.
pub fn derive_sha_with<T>(items: &[T], encode: impl Fn(&T, &mut Vec<u8>)) -> B256 {
    derive_sha_by(current_derive_sha(), items, encode)
}

pub fn derive_sha_by<T>(
    implementation: DeriveShaImpl,
    items: &[T],
    encode: impl Fn(&T, &mut Vec<u8>),
) -> B256 {
    match implementation {
        DeriveShaImpl::Trie => trie_root(items, encode),
        DeriveShaImpl::Simple => {
            let mut buf = Vec::with_capacity(items.len() * 32);
            for item in items {
                let mut encoded = Vec::new();
                encode(item, &mut encoded);
                buf.extend_from_slice(keccak256(&encoded).as_slice());
            }
            keccak256(buf)
        }
        DeriveShaImpl::Concat => {
            let mut buf = Vec::new();
            for item in items {
                encode(item, &mut buf);
            }
            keccak256(buf)
        }
    }
}

fn trie_root<T>(items: &[T], encode: impl Fn(&T, &mut Vec<u8>)) -> B256 {
    if items.is_empty() {
        return EMPTY_ROOT_HASH;
    }
    let mut entries = items
        .iter()
        .enumerate()
        .map(|(index, item)| {
            let key = alloy_rlp::encode(index);
            let mut value = Vec::new();
            encode(item, &mut value);
            (key, value)
        })
        .collect::<Vec<_>>();
    entries.sort_unstable_by(|a, b| a.0.cmp(&b.0));

    let mut hash_builder = HashBuilder::default();
    for (key, value) in entries {
        hash_builder.add_leaf(Nibbles::unpack(&key), &value);
    }
    hash_builder.root()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_list_is_empty_root() {
        assert_eq!(derive_sha_by(DeriveShaImpl::Trie, &Vec::<u64>::new(), |v, out| v.encode(out)), EMPTY_ROOT_HASH);
    }

    #[test]
    fn trie_root_depends_on_order() {
        let forward = [1u64, 2, 3];
        let backward = [3u64, 2, 1];
        let encode = |v: &u64, out: &mut Vec<u8>| v.encode(out);
        assert_ne!(
            derive_sha_by(DeriveShaImpl::Trie, &forward, encode),
            derive_sha_by(DeriveShaImpl::Trie, &backward, encode)
        );
    }

    #[test]
    fn trie_root_matches_in_house_trie() {
        // 200 items crosses the single-byte rlp(index) boundary at 128.
        let items = (0..200u64).map(|i| i * 7).collect::<Vec<_>>();
        let mut trie = crate::state::Trie::new_empty();
        for (index, item) in items.iter().enumerate() {
            trie.update(&alloy_rlp::encode(index), &alloy_rlp::encode(item)).unwrap();
        }
        assert_eq!(
            derive_sha_by(DeriveShaImpl::Trie, &items, |v, out| v.encode(out)),
            trie.hash()
        );
    }

    #[test]
    fn implementations_disagree() {
        let items = [10u64, 20];
        let encode = |v: &u64, out: &mut Vec<u8>| v.encode(out);
        let trie = derive_sha_by(DeriveShaImpl::Trie, &items, encode);
        let simple = derive_sha_by(DeriveShaImpl::Simple, &items, encode);
        let concat = derive_sha_by(DeriveShaImpl::Concat, &items, encode);
        assert_ne!(trie, simple);
        assert_ne!(simple, concat);
    }
}
