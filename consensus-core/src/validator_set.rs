// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! The validator set of an epoch.
//!
//! Voting power is weighted. With total power `N`, the set tolerates
//! `f = floor((N - 1) / 3)` faulty power and a certificate needs `N - f`
//! (which is `2f + 1` whenever `N = 3f + 1`).

use consensus_traits::{Author, ValidatorInfo, VerifyError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Ordered mapping of validator identity to voting power, fixed for an epoch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorSet {
    /// Validator -> voting power, ordered by author
    validators: BTreeMap<Author, u64>,

    /// Sum of all voting power
    total_voting_power: u128,
}

impl ValidatorSet {
    /// Create a validator set.
    ///
    /// Validators with zero voting power are dropped. Duplicate authors keep
    /// the last declared power.
    ///
    /// # Errors
    ///
    /// Returns an error if the resulting set has no voting power.
    pub fn new(validators: Vec<ValidatorInfo>) -> anyhow::Result<Self> {
        let validators: BTreeMap<Author, u64> = validators
            .into_iter()
            .filter(|v| v.voting_power > 0)
            .map(|v| (v.author, v.voting_power))
            .collect();

        let total_voting_power = validators.values().map(|p| *p as u128).sum::<u128>();
        anyhow::ensure!(
            total_voting_power > 0,
            "Validator set must have positive total voting power"
        );

        Ok(Self {
            validators,
            total_voting_power,
        })
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    pub fn total_voting_power(&self) -> u128 {
        self.total_voting_power
    }

    /// Faulty voting power tolerated, `floor((N - 1) / 3)`.
    pub fn max_faulty_voting_power(&self) -> u128 {
        (self.total_voting_power - 1) / 3
    }

    /// Voting power required for a quorum or timeout certificate.
    pub fn quorum_voting_power(&self) -> u128 {
        self.total_voting_power - self.max_faulty_voting_power()
    }

    pub fn voting_power(&self, author: &Author) -> Option<u64> {
        self.validators.get(author).copied()
    }

    pub fn contains(&self, author: &Author) -> bool {
        self.validators.contains_key(author)
    }

    /// Authors in ascending order.
    pub fn authors(&self) -> impl Iterator<Item = &Author> {
        self.validators.keys()
    }

    /// Validators with their voting power, in ascending author order.
    pub fn iter(&self) -> impl Iterator<Item = (&Author, &u64)> {
        self.validators.iter()
    }

    pub fn to_infos(&self) -> Vec<ValidatorInfo> {
        self.validators
            .iter()
            .map(|(author, power)| ValidatorInfo::new(*author, *power))
            .collect()
    }

    /// Sum the voting power of `signers` and check it reaches the quorum.
    ///
    /// # Errors
    ///
    /// * `VerifyError::UnknownAuthor` if a signer is not in the set
    /// * `VerifyError::TooLittleVotingPower` if the quorum is not reached
    pub fn check_voting_power<'a>(
        &self,
        signers: impl Iterator<Item = &'a Author>,
    ) -> Result<u128, VerifyError> {
        let mut voting_power = 0u128;
        for author in signers {
            let power = self
                .voting_power(author)
                .ok_or(VerifyError::UnknownAuthor(*author))?;
            voting_power += power as u128;
        }

        let expected_voting_power = self.quorum_voting_power();
        if voting_power < expected_voting_power {
            return Err(VerifyError::TooLittleVotingPower {
                voting_power,
                expected_voting_power,
            });
        }
        Ok(voting_power)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn author(i: u8) -> Author {
        Author([i; 32])
    }

    fn make_set(powers: &[u64]) -> ValidatorSet {
        let infos = powers
            .iter()
            .enumerate()
            .map(|(i, p)| ValidatorInfo::new(author(i as u8), *p))
            .collect();
        ValidatorSet::new(infos).unwrap()
    }

    #[test]
    fn test_quorum_four_equal_validators() {
        let set = make_set(&[1, 1, 1, 1]);
        assert_eq!(set.total_voting_power(), 4);
        assert_eq!(set.max_faulty_voting_power(), 1);
        assert_eq!(set.quorum_voting_power(), 3);
    }

    #[test]
    fn test_quorum_weighted() {
        let set = make_set(&[100, 100, 100, 100]);
        assert_eq!(set.max_faulty_voting_power(), 133);
        assert_eq!(set.quorum_voting_power(), 267);

        // total not of the form 3f + 1
        let set = make_set(&[1, 1, 1, 1, 1]);
        assert_eq!(set.max_faulty_voting_power(), 1);
        assert_eq!(set.quorum_voting_power(), 4);
    }

    #[test]
    fn test_single_validator() {
        let set = make_set(&[10]);
        assert_eq!(set.max_faulty_voting_power(), 3);
        assert_eq!(set.quorum_voting_power(), 7);
    }

    #[test]
    fn test_empty_set_rejected() {
        assert!(ValidatorSet::new(vec![]).is_err());
        assert!(ValidatorSet::new(vec![ValidatorInfo::new(author(1), 0)]).is_err());
    }

    #[test]
    fn test_zero_power_validators_dropped() {
        let set = ValidatorSet::new(vec![
            ValidatorInfo::new(author(1), 5),
            ValidatorInfo::new(author(2), 0),
        ])
        .unwrap();
        assert_eq!(set.len(), 1);
        assert!(!set.contains(&author(2)));
    }

    #[test]
    fn test_check_voting_power() {
        let set = make_set(&[1, 1, 1, 1]);

        let signers = [author(0), author(1), author(2)];
        assert_eq!(set.check_voting_power(signers.iter()), Ok(3));

        let signers = [author(0), author(1)];
        assert_eq!(
            set.check_voting_power(signers.iter()),
            Err(VerifyError::TooLittleVotingPower {
                voting_power: 2,
                expected_voting_power: 3
            })
        );

        let signers = [author(0), author(1), author(9)];
        assert_eq!(
            set.check_voting_power(signers.iter()),
            Err(VerifyError::UnknownAuthor(author(9)))
        );
    }

    #[test]
    fn test_authors_are_ordered() {
        let set = ValidatorSet::new(vec![
            ValidatorInfo::new(author(3), 1),
            ValidatorInfo::new(author(1), 1),
            ValidatorInfo::new(author(2), 1),
        ])
        .unwrap();
        let authors: Vec<_> = set.authors().copied().collect();
        assert_eq!(authors, vec![author(1), author(2), author(3)]);
        assert_eq!(set.to_infos().len(), 3);
    }
}
