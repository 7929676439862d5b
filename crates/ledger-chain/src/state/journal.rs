use crate::state::state_object::StateObject;
use alloy_primitives::{
    Address,
    B256,
    Bytes,
    U256,
};
use std::collections::HashMap;

/// A reversible state change.
#[derive(Debug, Clone)]
pub(crate) enum JournalEntry {
    CreateObject {
        address: Address,
    },
    ResetObject {
        prev: Box<StateObject>,
        prev_destruct: bool,
    },
    Suicide {
        address: Address,
        prev: bool,
        prev_balance: U256,
    },
    BalanceChange {
        address: Address,
        prev: U256,
    },
    NonceChange {
        address: Address,
        prev: u64,
    },
    StorageChange {
        address: Address,
        key: B256,
        prev: B256,
    },
    CodeChange {
        address: Address,
        prev_code: Option<Bytes>,
        prev_hash: B256,
    },
    RefundChange {
        prev: u64,
    },
    AddLog {
        tx_hash: B256,
    },
    AddPreimage {
        hash: B256,
    },
    Touch {
        address: Address,
    },
}

impl JournalEntry {
    /// Account modified by the entry, if any.
    pub(crate) fn dirtied(&self) -> Option<Address> {
        match self {
            Self::CreateObject { address } |
            Self::Suicide { address, .. } |
            Self::BalanceChange { address, .. } |
            Self::NonceChange { address, .. } |
            Self::StorageChange { address, .. } |
            Self::CodeChange { address, .. } |
            Self::Touch { address } => Some(*address),
            Self::ResetObject { .. } |
            Self::RefundChange { .. } |
            Self::AddLog { .. } |
            Self::AddPreimage { .. } => None,
        }
    }
}

/// Ordered list of state changes since the last finalisation.
#[derive(Debug, Clone, Default)]
pub(crate) struct Journal {
    entries: Vec<JournalEntry>,
    /// Number of entries touching each account.
    dirties: HashMap<Address, usize>,
}

impl Journal {
    pub(crate) fn append(&mut self, entry: JournalEntry) {
        if let Some(address) = entry.dirtied() {
            *self.dirties.entry(address).or_insert(0) += 1;
        }
        self.entries.push(entry);
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Removes and returns every entry from `index` on, newest first.
    pub(crate) fn split_off_reversed(&mut self, index: usize) -> Vec<JournalEntry> {
        let mut tail = self.entries.split_off(index);
        for entry in &tail {
            if let Some(address) = entry.dirtied() {
                if let Some(count) = self.dirties.get_mut(&address) {
                    *count -= 1;
                    if *count == 0 {
                        self.dirties.remove(&address);
                    }
                }
            }
        }
        tail.reverse();
        tail
    }

    pub(crate) fn dirty_addresses(&self) -> impl Iterator<Item = Address> + '_ {
        self.dirties.keys().copied()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
        self.dirties.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dirty_counts_follow_reverts() {
        let address = Address::repeat_byte(1);
        let mut journal = Journal::default();
        journal.append(JournalEntry::BalanceChange {
            address,
            prev: U256::ZERO,
        });
        journal.append(JournalEntry::RefundChange { prev: 0 });
        journal.append(JournalEntry::NonceChange { address, prev: 0 });
        assert_eq!(journal.dirty_addresses().count(), 1);

        let undone = journal.split_off_reversed(1);
        assert_eq!(undone.len(), 2);
        assert!(matches!(undone[0], JournalEntry::NonceChange { .. }));
        assert_eq!(journal.dirty_addresses().count(), 1, "balance change is still journaled");

        journal.split_off_reversed(0);
        assert_eq!(journal.dirty_addresses().count(), 0);
        assert_eq!(journal.len(), 0);
    }
}
