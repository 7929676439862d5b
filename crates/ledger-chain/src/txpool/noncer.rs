use crate::state::StateDb;
use alloy_primitives::Address;
use std::collections::HashMap;

/// Virtual nonces of accounts with executable transactions, layered over the
/// nonces of the pool's current state.
#[derive(Debug, Default)]
pub(crate) struct Noncer {
    nonces: HashMap<Address, u64>,
}

impl Noncer {
    /// Next nonce after the account's pending transactions. Never below the
    /// state nonce.
    pub(crate) fn get(&mut self, state: &mut StateDb, address: Address) -> u64 {
        let state_nonce = state.get_nonce(address);
        let nonce = self.nonces.entry(address).or_insert(state_nonce);
        if *nonce < state_nonce {
            *nonce = state_nonce;
        }
        *nonce
    }

    pub(crate) fn set(&mut self, address: Address, nonce: u64) {
        self.nonces.insert(address, nonce);
    }

    /// Lowers the virtual nonce to `nonce` after a pending transaction left.
    pub(crate) fn set_if_lower(&mut self, state: &mut StateDb, address: Address, nonce: u64) {
        if self.get(state, address) > nonce {
            self.set(address, nonce);
        }
    }

    pub(crate) fn reset(&mut self) {
        self.nonces.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::Database,
        state::StateDatabase,
        types::EMPTY_ROOT_HASH,
    };
    use std::sync::Arc;

    #[test]
    fn virtual_nonce_never_drops_below_state() {
        let db = Arc::new(StateDatabase::new(Arc::new(Database::new_in_memory()), 0));
        let mut state = StateDb::new(EMPTY_ROOT_HASH, db).unwrap();
        let address = Address::repeat_byte(1);
        state.set_nonce(address, 3);

        let mut noncer = Noncer::default();
        assert_eq!(noncer.get(&mut state, address), 3);
        noncer.set(address, 6);
        assert_eq!(noncer.get(&mut state, address), 6);
        noncer.set_if_lower(&mut state, address, 4);
        assert_eq!(noncer.get(&mut state, address), 4);
        noncer.set_if_lower(&mut state, address, 5);
        assert_eq!(noncer.get(&mut state, address), 4, "only lowers");

        state.set_nonce(address, 8);
        assert_eq!(noncer.get(&mut state, address), 8);
        noncer.reset();
        assert_eq!(noncer.get(&mut state, address), 8);
    }
}
