// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use consensus_traits::{Author, HashValue};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::certificates::{QuorumCertificate, TimeoutCertificate};
use crate::crypto::SignatureAggregator;
use crate::network::{TimeoutVote, Vote};
use crate::types::{Epoch, View, VoteData};
use crate::validator_set::ValidatorSet;

/// Configuration for vote aggregation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingVotesConfig {
    /// Views below `current_view - retained_views` are garbage-collected
    pub retained_views: u64,
    /// Votes and timeouts more than this many views ahead are not aggregated
    pub max_future_views: u64,
    /// Evidence kept until taken; later evidence is only logged
    pub max_equivocation_evidence: usize,
}

impl Default for PendingVotesConfig {
    fn default() -> Self {
        Self {
            retained_views: 1,
            max_future_views: 100,
            max_equivocation_evidence: 1000,
        }
    }
}

/// Proof that a validator signed two different votes in the same view.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EquivocationEvidence {
    pub author: Author,
    pub view: View,
    pub first: Vote,
    pub second: Vote,
}

/// Result of adding a vote or a timeout to pending votes
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VoteReceptionResult {
    /// The vote was counted, no certificate yet
    VoteAdded { voting_power: u128 },

    /// The timeout was counted, no certificate yet
    TimeoutAdded { voting_power: u128 },

    /// Same vote seen before from this validator
    DuplicateVote,

    /// A different vote from this validator in the same view; not counted
    EquivocateVote(Box<EquivocationEvidence>),

    /// The vote completed a quorum certificate
    NewQuorumCertificate(QuorumCertificate),

    /// The timeout completed a timeout certificate
    NewTimeoutCertificate(TimeoutCertificate),

    /// Sender is not in the validator set
    UnknownAuthor(Author),

    /// Vote for a view that was already garbage-collected
    StaleView(View),

    /// Vote for a view too far past the current one
    FutureView(View),
}

struct VoteAggregation {
    vote_data: VoteData,
    aggregator: SignatureAggregator,
}

/// Collects votes and timeouts of one epoch until certificates form.
///
/// Signature checks happen before votes get here; this only counts voting
/// power, one vote per validator per view.
pub struct PendingVotes {
    config: PendingVotesConfig,
    epoch: Epoch,

    /// Vote data digest -> aggregation in progress
    votes: HashMap<HashValue, VoteAggregation>,

    /// First vote of each validator in each view
    votes_by_author: BTreeMap<(View, Author), Vote>,

    /// View -> timeout aggregation in progress
    timeouts: BTreeMap<View, SignatureAggregator>,

    /// Certificates already formed, so late votes do not form them twice
    completed_votes: BTreeMap<View, BTreeSet<HashValue>>,
    completed_timeouts: BTreeSet<View>,

    equivocations: Vec<EquivocationEvidence>,
    /// Validators already caught equivocating in a view
    equivocators: BTreeSet<(View, Author)>,

    /// Lowest view still accepted
    lowest_view: View,
    current_view: View,
}

impl PendingVotes {
    pub fn new(epoch: Epoch, config: PendingVotesConfig) -> Self {
        Self {
            config,
            epoch,
            votes: HashMap::new(),
            votes_by_author: BTreeMap::new(),
            timeouts: BTreeMap::new(),
            completed_votes: BTreeMap::new(),
            completed_timeouts: BTreeSet::new(),
            equivocations: Vec::new(),
            equivocators: BTreeSet::new(),
            lowest_view: 0,
            current_view: 0,
        }
    }

    fn check_view(&self, view: View) -> Option<VoteReceptionResult> {
        if view < self.lowest_view {
            return Some(VoteReceptionResult::StaleView(view));
        }
        if view > self.current_view.saturating_add(self.config.max_future_views) {
            return Some(VoteReceptionResult::FutureView(view));
        }
        None
    }

    /// Count a vote.
    pub fn add_vote(&mut self, vote: &Vote, validators: &ValidatorSet) -> VoteReceptionResult {
        let view = vote.view();
        if let Some(result) = self.check_view(view) {
            return result;
        }
        let voting_power = match validators.voting_power(&vote.sender) {
            Some(power) => power,
            None => return VoteReceptionResult::UnknownAuthor(vote.sender),
        };

        let digest = vote.vote_data.digest();
        let key = (view, vote.sender);
        if let Some(first) = self.votes_by_author.get(&key) {
            if first.vote_data == vote.vote_data {
                return VoteReceptionResult::DuplicateVote;
            }
            let evidence = EquivocationEvidence {
                author: vote.sender,
                view,
                first: first.clone(),
                second: vote.clone(),
            };
            log::warn!(
                "Equivocation by {} in view {}: {} and {}",
                vote.sender,
                view,
                first.vote_data.proposed.vertex_id.short_str(),
                vote.vote_data.proposed.vertex_id.short_str()
            );
            if self.equivocators.insert(key) {
                if self.equivocations.len() < self.config.max_equivocation_evidence {
                    self.equivocations.push(evidence.clone());
                } else {
                    log::debug!(
                        "Equivocation evidence full, not keeping {} in view {}",
                        vote.sender,
                        view
                    );
                }
            }
            return VoteReceptionResult::EquivocateVote(Box::new(evidence));
        }
        self.votes_by_author.insert(key, vote.clone());

        if self
            .completed_votes
            .get(&view)
            .map(|done| done.contains(&digest))
            .unwrap_or(false)
        {
            return VoteReceptionResult::DuplicateVote;
        }

        let aggregation = self.votes.entry(digest).or_insert_with(|| VoteAggregation {
            vote_data: vote.vote_data.clone(),
            aggregator: SignatureAggregator::new(),
        });
        aggregation
            .aggregator
            .add_signature(vote.sender, vote.signature.clone(), voting_power);

        if aggregation.aggregator.check_quorum(validators).is_ok() {
            let qc = QuorumCertificate::new(
                aggregation.vote_data.clone(),
                aggregation.aggregator.aggregate(),
            );
            self.votes.remove(&digest);
            self.completed_votes.entry(view).or_default().insert(digest);
            log::debug!("Formed {}", qc);
            return VoteReceptionResult::NewQuorumCertificate(qc);
        }

        VoteReceptionResult::VoteAdded {
            voting_power: aggregation.aggregator.voting_power(),
        }
    }

    /// Count a timeout.
    pub fn add_timeout(
        &mut self,
        timeout: &TimeoutVote,
        validators: &ValidatorSet,
    ) -> VoteReceptionResult {
        let view = timeout.view;
        if let Some(result) = self.check_view(view) {
            return result;
        }
        let voting_power = match validators.voting_power(&timeout.sender) {
            Some(power) => power,
            None => return VoteReceptionResult::UnknownAuthor(timeout.sender),
        };
        if self.completed_timeouts.contains(&view) {
            return VoteReceptionResult::DuplicateVote;
        }

        let aggregator = self.timeouts.entry(view).or_default();
        if !aggregator.add_signature(timeout.sender, timeout.signature.clone(), voting_power) {
            return VoteReceptionResult::DuplicateVote;
        }

        if aggregator.check_quorum(validators).is_ok() {
            let tc = TimeoutCertificate::new(self.epoch, view, aggregator.aggregate());
            self.timeouts.remove(&view);
            self.completed_timeouts.insert(view);
            log::debug!("Formed {}", tc);
            return VoteReceptionResult::NewTimeoutCertificate(tc);
        }

        VoteReceptionResult::TimeoutAdded {
            voting_power: aggregator.voting_power(),
        }
    }

    /// Drop everything for views that can no longer produce a useful
    /// certificate.
    pub fn garbage_collect(&mut self, current_view: View) {
        self.current_view = self.current_view.max(current_view);
        let lowest_view = current_view.saturating_sub(self.config.retained_views);
        if lowest_view <= self.lowest_view {
            return;
        }
        self.lowest_view = lowest_view;

        self.votes
            .retain(|_, aggregation| aggregation.vote_data.view() >= lowest_view);
        self.votes_by_author = self.votes_by_author.split_off(&(lowest_view, Author([0u8; 32])));
        self.equivocators = self.equivocators.split_off(&(lowest_view, Author([0u8; 32])));
        self.timeouts = self.timeouts.split_off(&lowest_view);
        self.completed_votes = self.completed_votes.split_off(&lowest_view);
        self.completed_timeouts = self.completed_timeouts.split_off(&lowest_view);
    }

    /// Evidence collected since the last call, at most one per validator
    /// and view.
    pub fn take_equivocation_evidence(&mut self) -> Vec<EquivocationEvidence> {
        std::mem::take(&mut self.equivocations)
    }

    /// Number of vote-data keys still aggregating.
    pub fn pending_vote_keys(&self) -> usize {
        self.votes.len()
    }

    /// Number of views with timeouts still aggregating.
    pub fn pending_timeout_views(&self) -> usize {
        self.timeouts.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{make_signers, make_validator_set, QcBuilder};

    #[test]
    fn test_quorum_forms_at_threshold() {
        let signers = make_signers(4);
        let validators = make_validator_set(&signers);
        let builder = QcBuilder::new(&signers, &validators, 0);
        let mut pending = PendingVotes::new(0, PendingVotesConfig::default());

        let v1 = builder.extend_genesis(1);
        let high_qc = builder.genesis_high_qc();
        let votes: Vec<_> = signers
            .iter()
            .map(|s| Vote::new(v1.vote_data(), high_qc.clone(), s))
            .collect();

        assert_eq!(
            pending.add_vote(&votes[0], &validators),
            VoteReceptionResult::VoteAdded { voting_power: 1 }
        );
        assert_eq!(
            pending.add_vote(&votes[1], &validators),
            VoteReceptionResult::VoteAdded { voting_power: 2 }
        );
        let qc = match pending.add_vote(&votes[2], &validators) {
            VoteReceptionResult::NewQuorumCertificate(qc) => qc,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(qc.certified_vertex_id(), v1.id());
        assert_eq!(qc.signatures().len(), 3);

        // a late fourth vote does not form a second certificate
        assert_eq!(
            pending.add_vote(&votes[3], &validators),
            VoteReceptionResult::DuplicateVote
        );
        assert_eq!(pending.pending_vote_keys(), 0);
    }

    #[test]
    fn test_duplicate_vote_not_counted_twice() {
        let signers = make_signers(4);
        let validators = make_validator_set(&signers);
        let builder = QcBuilder::new(&signers, &validators, 0);
        let mut pending = PendingVotes::new(0, PendingVotesConfig::default());

        let v1 = builder.extend_genesis(1);
        let vote = Vote::new(v1.vote_data(), builder.genesis_high_qc(), &signers[0]);

        pending.add_vote(&vote, &validators);
        assert_eq!(
            pending.add_vote(&vote, &validators),
            VoteReceptionResult::DuplicateVote
        );
    }

    #[test]
    fn test_equivocation_recorded_and_not_counted() {
        let signers = make_signers(4);
        let validators = make_validator_set(&signers);
        let builder = QcBuilder::new(&signers, &validators, 0);
        let mut pending = PendingVotes::new(0, PendingVotesConfig::default());
        let high_qc = builder.genesis_high_qc();

        let a = builder.extend_genesis(1);
        let b = builder.extend_genesis_with_command(1, vec![7]);

        pending.add_vote(&Vote::new(a.vote_data(), high_qc.clone(), &signers[3]), &validators);
        let result =
            pending.add_vote(&Vote::new(b.vote_data(), high_qc.clone(), &signers[3]), &validators);
        assert!(matches!(result, VoteReceptionResult::EquivocateVote(ref e) if e.author == signers[3].author()));

        // honest votes for b still need a full quorum without the equivocator
        pending.add_vote(&Vote::new(b.vote_data(), high_qc.clone(), &signers[0]), &validators);
        let result =
            pending.add_vote(&Vote::new(b.vote_data(), high_qc.clone(), &signers[1]), &validators);
        assert_eq!(result, VoteReceptionResult::VoteAdded { voting_power: 2 });

        let evidence = pending.take_equivocation_evidence();
        assert_eq!(evidence.len(), 1);
        assert_eq!(evidence[0].view, 1);
        assert!(pending.take_equivocation_evidence().is_empty());
    }

    #[test]
    fn test_repeated_equivocation_kept_once() {
        let signers = make_signers(4);
        let validators = make_validator_set(&signers);
        let builder = QcBuilder::new(&signers, &validators, 0);
        let config = PendingVotesConfig {
            max_equivocation_evidence: 2,
            ..PendingVotesConfig::default()
        };
        let mut pending = PendingVotes::new(0, config);
        let high_qc = builder.genesis_high_qc();
        pending.garbage_collect(1);

        let vote_in = |view: View, command: u8| {
            let vertex = builder.extend_genesis_with_command(view, vec![command]);
            Vote::new(vertex.vote_data(), high_qc.clone(), &signers[3])
        };
        for command in 0..50 {
            let result = pending.add_vote(&vote_in(1, command), &validators);
            if command > 0 {
                assert!(matches!(result, VoteReceptionResult::EquivocateVote(_)));
            }
        }
        assert_eq!(pending.pending_vote_keys(), 1);
        assert_eq!(pending.take_equivocation_evidence().len(), 1);

        // a full store drops further evidence
        for view in 2..6 {
            pending.add_vote(&vote_in(view, 0), &validators);
            pending.add_vote(&vote_in(view, 1), &validators);
        }
        assert_eq!(pending.take_equivocation_evidence().len(), 2);
    }

    #[test]
    fn test_far_future_views_not_aggregated() {
        let signers = make_signers(4);
        let validators = make_validator_set(&signers);
        let builder = QcBuilder::new(&signers, &validators, 0);
        let config = PendingVotesConfig {
            max_future_views: 10,
            ..PendingVotesConfig::default()
        };
        let mut pending = PendingVotes::new(0, config);
        let high_qc = builder.genesis_high_qc();
        pending.garbage_collect(1);

        for view in 2..500 {
            let vertex = builder.extend_genesis(view);
            pending.add_vote(&Vote::new(vertex.vote_data(), high_qc.clone(), &signers[0]), &validators);
            pending.add_timeout(&TimeoutVote::new(0, view, high_qc.clone(), &signers[0]), &validators);
        }
        assert_eq!(pending.pending_vote_keys(), 10);
        assert_eq!(pending.pending_timeout_views(), 10);

        let far = TimeoutVote::new(0, 12, high_qc.clone(), &signers[1]);
        assert_eq!(
            pending.add_timeout(&far, &validators),
            VoteReceptionResult::FutureView(12)
        );

        // the window moves with the current view
        pending.garbage_collect(5);
        assert!(matches!(
            pending.add_timeout(&far, &validators),
            VoteReceptionResult::TimeoutAdded { .. }
        ));
        // views 2 and 3 were collected
        assert_eq!(pending.pending_timeout_views(), 9);
        assert_eq!(pending.pending_vote_keys(), 8);
    }

    #[test]
    fn test_aggregate_independent_of_arrival_order() {
        let signers = make_signers(4);
        let validators = make_validator_set(&signers);
        let builder = QcBuilder::new(&signers, &validators, 0);
        let v1 = builder.extend_genesis(1);
        let high_qc = builder.genesis_high_qc();

        let form = |order: &[usize]| {
            let mut pending = PendingVotes::new(0, PendingVotesConfig::default());
            let mut formed = None;
            for i in order {
                let vote = Vote::new(v1.vote_data(), high_qc.clone(), &signers[*i]);
                if let VoteReceptionResult::NewQuorumCertificate(qc) =
                    pending.add_vote(&vote, &validators)
                {
                    formed = Some(qc);
                }
            }
            formed
        };

        let forward = form(&[0, 1, 2]);
        let backward = form(&[2, 1, 0]);
        assert!(forward.is_some());
        assert_eq!(forward, backward);
    }

    #[test]
    fn test_timeout_certificate_forms() {
        let signers = make_signers(4);
        let validators = make_validator_set(&signers);
        let builder = QcBuilder::new(&signers, &validators, 0);
        let mut pending = PendingVotes::new(0, PendingVotesConfig::default());
        let high_qc = builder.genesis_high_qc();

        for signer in signers.iter().take(2) {
            let timeout = TimeoutVote::new(0, 4, high_qc.clone(), signer);
            assert!(matches!(
                pending.add_timeout(&timeout, &validators),
                VoteReceptionResult::TimeoutAdded { .. }
            ));
        }
        let dup = TimeoutVote::new(0, 4, high_qc.clone(), &signers[1]);
        assert_eq!(
            pending.add_timeout(&dup, &validators),
            VoteReceptionResult::DuplicateVote
        );

        let timeout = TimeoutVote::new(0, 4, high_qc, &signers[2]);
        match pending.add_timeout(&timeout, &validators) {
            VoteReceptionResult::NewTimeoutCertificate(tc) => {
                assert_eq!(tc.view(), 4);
                assert_eq!(tc.signatures().len(), 3);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_author() {
        let signers = make_signers(5);
        let validators = make_validator_set(&signers[..4]);
        let builder = QcBuilder::new(&signers[..4], &validators, 0);
        let mut pending = PendingVotes::new(0, PendingVotesConfig::default());

        let timeout = TimeoutVote::new(0, 1, builder.genesis_high_qc(), &signers[4]);
        assert_eq!(
            pending.add_timeout(&timeout, &validators),
            VoteReceptionResult::UnknownAuthor(signers[4].author())
        );
    }

    #[test]
    fn test_garbage_collect_old_views() {
        let signers = make_signers(4);
        let validators = make_validator_set(&signers);
        let builder = QcBuilder::new(&signers, &validators, 0);
        let mut pending = PendingVotes::new(0, PendingVotesConfig::default());
        let high_qc = builder.genesis_high_qc();

        let v1 = builder.extend_genesis(1);
        pending.add_vote(&Vote::new(v1.vote_data(), high_qc.clone(), &signers[0]), &validators);
        pending.add_timeout(&TimeoutVote::new(0, 1, high_qc.clone(), &signers[0]), &validators);
        assert_eq!(pending.pending_vote_keys(), 1);
        assert_eq!(pending.pending_timeout_views(), 1);

        pending.garbage_collect(5);
        assert_eq!(pending.pending_vote_keys(), 0);
        assert_eq!(pending.pending_timeout_views(), 0);
        assert_eq!(
            pending.add_vote(&Vote::new(v1.vote_data(), high_qc, &signers[1]), &validators),
            VoteReceptionResult::StaleView(1)
        );
    }
}
