// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Testing utilities for consensus-core.
//!
//! Mock collaborators, deterministic validator keys, a certificate builder
//! and a [`SimulatedNetwork`] running several replicas in one thread.

mod mock_ledger;
mod mock_network;
mod mock_storage;
mod qc_builder;
mod simulation;

pub use mock_ledger::{MockCommandExecutor, MockMempool};
pub use mock_network::{MockNetwork, MockTimers, SentMessage};
pub use mock_storage::MockPersistence;
pub use qc_builder::QcBuilder;
pub use simulation::{MessageFilter, SimulatedNetwork, SimulationConfig};

use consensus_traits::{HashValue, LedgerHeader, ValidatorInfo};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::crypto::ValidatorSigner;
use crate::epoch_manager::EpochState;
use crate::types::Epoch;
use crate::validator_set::ValidatorSet;

/// Lock a mock's shared state, ignoring poisoning from a panicked test.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// `n` signers with fixed keys, so authors are stable across runs.
pub fn make_signers(n: usize) -> Vec<Arc<ValidatorSigner>> {
    (0..n)
        .map(|i| Arc::new(ValidatorSigner::from_seed([i as u8 + 1; 32])))
        .collect()
}

/// Validator set giving each signer one unit of voting power.
///
/// # Panics
///
/// Panics if `signers` is empty.
pub fn make_validator_set(signers: &[Arc<ValidatorSigner>]) -> ValidatorSet {
    let infos = signers
        .iter()
        .map(|s| ValidatorInfo::new(s.author(), 1))
        .collect();
    ValidatorSet::new(infos).expect("at least one signer")
}

/// Epoch state whose genesis matches [`QcBuilder::new`] for the same epoch.
pub fn make_epoch_state(epoch: Epoch, signers: &[Arc<ValidatorSigner>]) -> EpochState {
    EpochState::new(
        make_validator_set(signers),
        LedgerHeader::genesis(epoch, 0, HashValue::zero()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_make_validator_set() {
        let signers = make_signers(4);
        let validators = make_validator_set(&signers);
        assert_eq!(validators.len(), 4);
        assert_eq!(validators.total_voting_power(), 4);
        assert_eq!(validators.quorum_voting_power(), 3);
        assert!(signers.iter().all(|s| validators.contains(&s.author())));
    }

    #[test]
    fn test_signers_are_deterministic() {
        let a = make_signers(3);
        let b = make_signers(3);
        assert!(a.iter().zip(&b).all(|(x, y)| x.author() == y.author()));
        assert_ne!(a[0].author(), a[1].author());
    }
}
