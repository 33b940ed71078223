// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Signature aggregation for quorum certificate formation.
//!
//! This module collects signatures from multiple validators, tracks their
//! voting power to determine when a quorum is reached, and produces the
//! validator-keyed aggregate carried by certificates.

use consensus_traits::{Author, HashValue, VerifyError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::signer::{verify_signature, ConsensusSignature};
use crate::validator_set::ValidatorSet;

/// Signatures of a certificate, keyed by validator.
///
/// Keying by validator identity makes the aggregate independent of the
/// order in which the individual signatures arrived.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AggregateSignature {
    signatures: BTreeMap<Author, ConsensusSignature>,
}

impl AggregateSignature {
    /// An aggregate without any signature (used by genesis certificates).
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }

    pub fn signers(&self) -> impl Iterator<Item = &Author> {
        self.signatures.keys()
    }

    pub fn get(&self, author: &Author) -> Option<&ConsensusSignature> {
        self.signatures.get(author)
    }

    /// Verify every signature over `digest` and check the signers reach a
    /// quorum of `validators`.
    ///
    /// Membership and voting power are checked before any signature is
    /// verified.
    ///
    /// # Returns
    ///
    /// * The voting power of the signers
    /// * `Err(VerifyError)` on the first failing check
    pub fn verify(
        &self,
        digest: &HashValue,
        validators: &ValidatorSet,
    ) -> Result<u128, VerifyError> {
        let voting_power = validators.check_voting_power(self.signers())?;

        for (author, signature) in &self.signatures {
            verify_signature(author, digest, signature)?;
        }

        Ok(voting_power)
    }
}

/// Aggregates signatures and tracks voting power for quorum formation.
///
/// # Example
///
/// ```ignore
/// use consensus_core::crypto::SignatureAggregator;
///
/// let mut aggregator = SignatureAggregator::new();
///
/// for vote in votes {
///     let voting_power = validators.voting_power(&vote.author).unwrap_or(0);
///     aggregator.add_signature(vote.author, vote.signature.clone(), voting_power);
/// }
///
/// if aggregator.check_quorum(&validators).is_ok() {
///     let signatures = aggregator.aggregate();
///     // Create quorum certificate
/// }
/// ```
#[derive(Clone, Debug, Default)]
pub struct SignatureAggregator {
    /// Map from validator ID to their signature
    signatures: BTreeMap<Author, ConsensusSignature>,

    /// Accumulated voting power from all signers
    voting_power: u128,
}

impl SignatureAggregator {
    /// Create a new empty signature aggregator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a signature from a validator with their voting power.
    ///
    /// Only the first signature of a validator is kept, so a duplicate
    /// never counts twice.
    ///
    /// # Returns
    ///
    /// `true` if the signature was added.
    pub fn add_signature(
        &mut self,
        validator: Author,
        signature: ConsensusSignature,
        voting_power: u64,
    ) -> bool {
        if self.signatures.contains_key(&validator) {
            return false;
        }
        self.voting_power += voting_power as u128;
        self.signatures.insert(validator, signature);
        true
    }

    /// Get the current accumulated voting power.
    pub fn voting_power(&self) -> u128 {
        self.voting_power
    }

    /// Get the number of unique signers.
    pub fn signer_count(&self) -> usize {
        self.signatures.len()
    }

    pub fn signers(&self) -> impl Iterator<Item = &Author> {
        self.signatures.keys()
    }

    /// Check if a specific validator has signed.
    pub fn has_signed(&self, validator: &Author) -> bool {
        self.signatures.contains_key(validator)
    }

    /// Check if the current signers meet the quorum threshold.
    ///
    /// # Returns
    ///
    /// * `Ok(())` if quorum is met
    /// * `Err(VerifyError::TooLittleVotingPower)` if insufficient voting power
    pub fn check_quorum(&self, validators: &ValidatorSet) -> Result<(), VerifyError> {
        let expected_voting_power = validators.quorum_voting_power();
        if self.voting_power < expected_voting_power {
            return Err(VerifyError::TooLittleVotingPower {
                voting_power: self.voting_power,
                expected_voting_power,
            });
        }
        Ok(())
    }

    /// Combine the collected signatures.
    pub fn aggregate(&self) -> AggregateSignature {
        AggregateSignature {
            signatures: self.signatures.clone(),
        }
    }
}
