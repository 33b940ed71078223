// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Proposer election implementations.
//!
//! Leaders rotate in a smooth weighted round-robin over the validator set:
//! over any window of `total_voting_power` views every validator leads a
//! number of views equal to its voting power, and its turns are spread
//! evenly rather than bunched together. After such a window the running
//! weights are back at zero, so the rotation repeats with that period and
//! a lookup never replays more than one period.

use consensus_traits::{Author, ProposerElection};
use std::collections::{BTreeMap, VecDeque};

use crate::types::View;
use crate::validator_set::ValidatorSet;

/// Number of recently computed leaders kept for lookups.
const DEFAULT_CACHE_SIZE: usize = 64;

/// Weighted round-robin proposer election keyed on the view.
///
/// Selection is a pure function of the validator set and the view, so every
/// replica agrees on the leader without communication.
#[derive(Clone, Debug)]
pub struct WeightedRotatingLeaders {
    /// Validators in ascending author order with their voting power
    validators: Vec<(Author, u64)>,
    total_voting_power: i128,

    /// Running weights of the smooth round-robin
    current_weights: Vec<i128>,
    /// View whose leader is computed next
    next_view: View,

    cache: VecDeque<(View, Author)>,
    cache_size: usize,
}

impl WeightedRotatingLeaders {
    pub fn new(validators: &ValidatorSet) -> Self {
        Self::with_cache_size(validators, DEFAULT_CACHE_SIZE)
    }

    pub fn with_cache_size(validators: &ValidatorSet, cache_size: usize) -> Self {
        let validators: Vec<(Author, u64)> =
            validators.iter().map(|(author, power)| (*author, *power)).collect();
        let total_voting_power = validators.iter().map(|(_, p)| *p as i128).sum();
        let current_weights = vec![0; validators.len()];
        Self {
            validators,
            total_voting_power,
            current_weights,
            next_view: 0,
            cache: VecDeque::with_capacity(cache_size),
            cache_size: cache_size.max(1),
        }
    }

    fn reset(&mut self) {
        self.current_weights.iter_mut().for_each(|w| *w = 0);
        self.next_view = 0;
        self.cache.clear();
    }

    /// Run one round-robin step, producing the leader of `next_view`.
    fn step(&mut self) -> Author {
        let mut best = 0;
        for (i, (_, power)) in self.validators.iter().enumerate() {
            self.current_weights[i] += *power as i128;
            if self.current_weights[i] > self.current_weights[best] {
                best = i;
            }
        }
        self.current_weights[best] -= self.total_voting_power;

        let leader = self.validators[best].0;
        if self.cache.len() == self.cache_size {
            self.cache.pop_front();
        }
        self.cache.push_back((self.next_view, leader));
        self.next_view = self.next_view.saturating_add(1);
        leader
    }

    /// Position of `view` within the rotation period.
    fn position(&self, view: View) -> View {
        match u64::try_from(self.total_voting_power) {
            Ok(period) if period > 0 => view % period,
            _ => view,
        }
    }

    fn cached(&self, view: View) -> Option<Author> {
        let (first, _) = self.cache.front()?;
        let index = view.checked_sub(*first)? as usize;
        self.cache.get(index).map(|(_, author)| *author)
    }

    /// Leader counts for the views `[0, count)`.
    pub fn distribution(&mut self, count: View) -> BTreeMap<Author, u64> {
        let mut counts = BTreeMap::new();
        for view in 0..count {
            *counts.entry(self.leader(view)).or_insert(0) += 1;
        }
        counts
    }
}

impl ProposerElection for WeightedRotatingLeaders {
    fn leader(&mut self, view: View) -> Author {
        let view = self.position(view);
        if let Some(author) = self.cached(view) {
            return author;
        }
        if view < self.next_view {
            // fell out of the cache; replay from the start
            self.reset();
        }
        let mut leader = self.step();
        while self.next_view <= view {
            leader = self.step();
        }
        leader
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use consensus_traits::ValidatorInfo;

    fn author(i: u8) -> Author {
        Author([i; 32])
    }

    fn make_set(powers: &[u64]) -> ValidatorSet {
        ValidatorSet::new(
            powers
                .iter()
                .enumerate()
                .map(|(i, p)| ValidatorInfo::new(author(i as u8 + 1), *p))
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_equal_weights_rotate() {
        let mut election = WeightedRotatingLeaders::new(&make_set(&[1, 1, 1, 1]));
        let leaders: Vec<_> = (0..8).map(|v| election.leader(v)).collect();

        assert_eq!(leaders[0..4], leaders[4..8]);
        let mut distinct = leaders[0..4].to_vec();
        distinct.sort();
        distinct.dedup();
        assert_eq!(distinct.len(), 4);
    }

    #[test]
    fn test_weighted_distribution() {
        let mut election = WeightedRotatingLeaders::new(&make_set(&[3, 1]));
        let counts = election.distribution(400);

        assert_eq!(counts[&author(1)], 300);
        assert_eq!(counts[&author(2)], 100);
    }

    #[test]
    fn test_turns_spread_evenly() {
        let mut election = WeightedRotatingLeaders::new(&make_set(&[2, 1, 1]));
        let leaders: Vec<_> = (0..4).map(|v| election.leader(v)).collect();

        // the heavy validator leads twice per window, never back to back
        assert_eq!(leaders.iter().filter(|a| **a == author(1)).count(), 2);
        for pair in leaders.windows(2) {
            assert!(!(pair[0] == author(1) && pair[1] == author(1)));
        }
    }

    #[test]
    fn test_deterministic_across_instances_and_order() {
        let set = make_set(&[5, 3, 2, 7]);
        let mut a = WeightedRotatingLeaders::with_cache_size(&set, 4);
        let mut b = WeightedRotatingLeaders::new(&set);

        let forward: Vec<_> = (0..50).map(|v| a.leader(v)).collect();
        // out of order and below the cache window
        let backward: Vec<_> = (0..50).rev().map(|v| a.leader(v)).collect();
        let fresh: Vec<_> = (0..50).map(|v| b.leader(v)).collect();

        assert_eq!(forward, fresh);
        assert_eq!(forward, backward.into_iter().rev().collect::<Vec<_>>());
    }

    #[test]
    fn test_rotation_repeats_every_total_power_views() {
        let set = make_set(&[5, 3, 2, 7]);
        let mut raw = WeightedRotatingLeaders::new(&set);
        let stepped: Vec<_> = (0..3 * 17).map(|_| raw.step()).collect();
        assert_eq!(stepped[..17], stepped[17..34]);

        let mut election = WeightedRotatingLeaders::with_cache_size(&set, 4);
        for (view, expected) in stepped.iter().enumerate() {
            assert_eq!(election.leader(view as View), *expected);
        }
        // far views cost one period at most
        assert_eq!(election.leader(View::MAX), stepped[(View::MAX % 17) as usize]);
        assert_eq!(election.leader(1 << 40), stepped[((1u64 << 40) % 17) as usize]);
    }

    #[test]
    fn test_is_valid_proposer() {
        let mut election = WeightedRotatingLeaders::new(&make_set(&[1, 1, 1, 1]));
        let leader = election.leader(9);

        assert!(election.is_valid_proposer(&leader, 9));
        let other = if leader == author(1) { author(2) } else { author(1) };
        assert!(!election.is_valid_proposer(&other, 9));
    }
}
