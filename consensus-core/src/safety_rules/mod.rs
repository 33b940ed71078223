// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Safety rules for Byzantine fault-tolerant consensus.
//!
//! # Voting rules
//!
//! > A vote for vertex V in view v is safe if ALL of:
//! > 1. `V.qc.view + 1 == v`, or V carries a TC with `tc.view + 1 == v`
//! > 2. `v > last_voted_view`
//! > 3. `V.qc.view >= locked_view`
//!
//! After voting, `locked_view = max(locked_view, V.qc.view)`.
//!
//! # Timeout rule
//!
//! > A timeout in view v is safe if `v >= last_voted_view`. It raises
//! > `last_voted_view` to v so no vote for v can follow it.
//!
//! Every decision is persisted before its signature leaves this module. A
//! persistence failure halts the rules for good.

mod recovery;
mod state;

pub use recovery::{load_safety_state, persist_safety_state, validate_safety_state, RecoveryError};
pub use state::SafetyState;

use consensus_traits::Persistence;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;

use crate::certificates::HighQC;
use crate::crypto::ValidatorSigner;
use crate::network::{TimeoutVote, Vote};
use crate::types::{Epoch, ExecutedVertex, View};

/// Why the safety rules refused to sign.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RejectReason {
    /// Neither the QC nor a TC is for the view right below the proposal
    ViewGap { view: View, justify_view: View },
    /// Already voted or timed out in this view or a later one
    AlreadyVoted { view: View, last_voted_view: View },
    /// The proposal does not extend the locked view
    Locked { qc_view: View, locked_view: View },
    /// The message belongs to another epoch
    WrongEpoch { expected: Epoch, actual: Epoch },
    /// Timeout requested for a view below the last vote
    StaleTimeout { view: View, last_voted_view: View },
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::ViewGap { view, justify_view } => write!(
                f,
                "view {} is not justified by certificate of view {}",
                view, justify_view
            ),
            RejectReason::AlreadyVoted {
                view,
                last_voted_view,
            } => write!(f, "view {} not above last voted view {}", view, last_voted_view),
            RejectReason::Locked {
                qc_view,
                locked_view,
            } => write!(f, "qc view {} below locked view {}", qc_view, locked_view),
            RejectReason::WrongEpoch { expected, actual } => {
                write!(f, "epoch {} while in epoch {}", actual, expected)
            }
            RejectReason::StaleTimeout {
                view,
                last_voted_view,
            } => write!(
                f,
                "timeout for view {} below last voted view {}",
                view, last_voted_view
            ),
        }
    }
}

/// Outcome of a safety check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SafetyDecision<T> {
    Approved(T),
    Rejected(RejectReason),
}

/// Unrecoverable safety failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SafetyError {
    #[error("Failed to persist safety state: {0}")]
    Persistence(String),

    #[error("Safety rules halted after an earlier persistence failure")]
    Halted,
}

/// Voting and timeout rules for the local validator.
///
/// # Example
///
/// ```ignore
/// let mut safety_rules = SafetyRules::new(state, signer);
///
/// match safety_rules.process_proposal(&vertex, &high_qc, storage)? {
///     SafetyDecision::Approved(vote) => network.send(&next_leader, vote),
///     SafetyDecision::Rejected(reason) => log::debug!("not voting: {}", reason),
/// }
/// ```
pub struct SafetyRules {
    state: SafetyState,
    signer: Arc<ValidatorSigner>,
    halted: bool,
}

impl SafetyRules {
    pub fn new(state: SafetyState, signer: Arc<ValidatorSigner>) -> Self {
        Self {
            state,
            signer,
            halted: false,
        }
    }

    pub fn state(&self) -> &SafetyState {
        &self.state
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Decide whether to vote for `vertex`, returning the signed vote.
    ///
    /// The vote carries `high_qc` so its recipient can catch up.
    pub fn process_proposal<P, C>(
        &mut self,
        vertex: &ExecutedVertex,
        high_qc: &HighQC,
        storage: &mut P,
    ) -> Result<SafetyDecision<Vote>, SafetyError>
    where
        P: Persistence<SafetyState, C> + ?Sized,
        C: Serialize + DeserializeOwned,
    {
        if self.halted {
            return Err(SafetyError::Halted);
        }

        let view = vertex.view();
        if vertex.epoch() != self.state.epoch {
            return Ok(SafetyDecision::Rejected(RejectReason::WrongEpoch {
                expected: self.state.epoch,
                actual: vertex.epoch(),
            }));
        }

        let qc_view = vertex.qc().view();
        let tc_justifies = vertex
            .vertex()
            .tc
            .as_ref()
            .map(|tc| tc.view() + 1 == view)
            .unwrap_or(false);
        if qc_view + 1 != view && !tc_justifies {
            return Ok(SafetyDecision::Rejected(RejectReason::ViewGap {
                view,
                justify_view: vertex.vertex().justify_view(),
            }));
        }

        if !self.state.can_vote_in_view(view) {
            return Ok(SafetyDecision::Rejected(RejectReason::AlreadyVoted {
                view,
                last_voted_view: self.state.last_voted_view,
            }));
        }

        if qc_view < self.state.locked_view {
            return Ok(SafetyDecision::Rejected(RejectReason::Locked {
                qc_view,
                locked_view: self.state.locked_view,
            }));
        }

        let vote = Vote::new(vertex.vote_data(), high_qc.clone(), &self.signer);

        let mut next = self.state.clone();
        next.locked_view = next.locked_view.max(qc_view);
        next.last_voted_view = view;
        next.last_vote = Some(vote.clone());
        self.commit_state(next, storage)?;

        log::debug!(
            "Voting for vertex {} at view {} (locked_view={})",
            vertex.id().short_str(),
            view,
            self.state.locked_view
        );
        Ok(SafetyDecision::Approved(vote))
    }

    /// Sign a timeout for `view`.
    ///
    /// Asking again for the same view returns the statement already signed.
    pub fn process_timeout<P, C>(
        &mut self,
        epoch: Epoch,
        view: View,
        high_qc: &HighQC,
        storage: &mut P,
    ) -> Result<SafetyDecision<TimeoutVote>, SafetyError>
    where
        P: Persistence<SafetyState, C> + ?Sized,
        C: Serialize + DeserializeOwned,
    {
        if self.halted {
            return Err(SafetyError::Halted);
        }
        if epoch != self.state.epoch {
            return Ok(SafetyDecision::Rejected(RejectReason::WrongEpoch {
                expected: self.state.epoch,
                actual: epoch,
            }));
        }

        if let Some(timeout) = self.state.last_timeout_for(view) {
            return Ok(SafetyDecision::Approved(timeout.clone()));
        }

        if view < self.state.last_voted_view {
            return Ok(SafetyDecision::Rejected(RejectReason::StaleTimeout {
                view,
                last_voted_view: self.state.last_voted_view,
            }));
        }

        let timeout = TimeoutVote::new(epoch, view, high_qc.clone(), &self.signer);

        let mut next = self.state.clone();
        next.last_voted_view = view;
        next.last_timeout = Some(timeout.clone());
        self.commit_state(next, storage)?;

        log::debug!("Timing out view {}", view);
        Ok(SafetyDecision::Approved(timeout))
    }

    fn commit_state<P, C>(&mut self, next: SafetyState, storage: &mut P) -> Result<(), SafetyError>
    where
        P: Persistence<SafetyState, C> + ?Sized,
        C: Serialize + DeserializeOwned,
    {
        if let Err(e) = persist_safety_state(storage, &next) {
            self.halted = true;
            log::error!("Halting safety rules: {}", e);
            return Err(SafetyError::Persistence(e.to_string()));
        }
        self.state = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{make_signers, make_validator_set, MockPersistence, QcBuilder};

    fn setup() -> (Vec<Arc<ValidatorSigner>>, QcBuilder, SafetyRules, MockPersistence) {
        let signers = make_signers(4);
        let validators = make_validator_set(&signers);
        let builder = QcBuilder::new(&signers, &validators, 0);
        let rules = SafetyRules::new(SafetyState::new(0), signers[0].clone());
        (signers, builder, rules, MockPersistence::new())
    }

    fn approved<T: std::fmt::Debug>(decision: SafetyDecision<T>) -> T {
        match decision {
            SafetyDecision::Approved(t) => t,
            SafetyDecision::Rejected(reason) => panic!("rejected: {}", reason),
        }
    }

    #[test]
    fn test_vote_then_no_second_vote_in_view() {
        let (_, builder, mut rules, mut storage) = setup();
        let high_qc = builder.genesis_high_qc();

        let a = builder.extend_genesis(1);
        let b = builder.extend_genesis_with_command(1, vec![9]);

        let vote = approved(rules.process_proposal(&a, &high_qc, &mut storage).unwrap());
        assert_eq!(vote.vote_data.proposed.vertex_id, a.id());

        let decision = rules.process_proposal(&b, &high_qc, &mut storage).unwrap();
        assert_eq!(
            decision,
            SafetyDecision::Rejected(RejectReason::AlreadyVoted {
                view: 1,
                last_voted_view: 1
            })
        );
    }

    #[test]
    fn test_view_gap_rejected() {
        let (_, builder, mut rules, mut storage) = setup();
        let high_qc = builder.genesis_high_qc();

        let v3 = builder.extend_genesis(3);
        let decision = rules.process_proposal(&v3, &high_qc, &mut storage).unwrap();
        assert!(matches!(
            decision,
            SafetyDecision::Rejected(RejectReason::ViewGap { view: 3, .. })
        ));
    }

    #[test]
    fn test_tc_justifies_gap() {
        let (_, builder, mut rules, mut storage) = setup();
        let high_qc = builder.genesis_high_qc();

        let v1 = builder.extend_genesis(1);
        let v3 = builder.extend_with_tc(&v1, 3);
        approved(rules.process_proposal(&v3, &high_qc, &mut storage).unwrap());
        assert_eq!(rules.state().last_voted_view, 3);
        assert_eq!(rules.state().locked_view, 1);
    }

    #[test]
    fn test_lock_prevents_voting_below() {
        let (_, builder, mut rules, mut storage) = setup();
        let high_qc = builder.genesis_high_qc();

        let v1 = builder.extend_genesis(1);
        let v2 = builder.extend(&v1, 2);
        let v3 = builder.extend(&v2, 3);
        approved(rules.process_proposal(&v3, &high_qc, &mut storage).unwrap());
        assert_eq!(rules.state().locked_view, 2);

        // a fork extending v1 after a timeout of view 4
        let fork = builder.extend_with_tc(&v1, 5);
        let decision = rules.process_proposal(&fork, &high_qc, &mut storage).unwrap();
        assert_eq!(
            decision,
            SafetyDecision::Rejected(RejectReason::Locked {
                qc_view: 1,
                locked_view: 2
            })
        );
    }

    #[test]
    fn test_wrong_epoch_rejected() {
        let signers = make_signers(4);
        let validators = make_validator_set(&signers);
        let builder = QcBuilder::new(&signers, &validators, 1);
        let mut rules = SafetyRules::new(SafetyState::new(0), signers[0].clone());
        let mut storage = MockPersistence::new();

        let v1 = builder.extend_genesis(1);
        let decision = rules
            .process_proposal(&v1, &builder.genesis_high_qc(), &mut storage)
            .unwrap();
        assert!(matches!(
            decision,
            SafetyDecision::Rejected(RejectReason::WrongEpoch { .. })
        ));
    }

    #[test]
    fn test_timeout_blocks_later_vote_in_same_view() {
        let (_, builder, mut rules, mut storage) = setup();
        let high_qc = builder.genesis_high_qc();

        approved(rules.process_timeout(0, 1, &high_qc, &mut storage).unwrap());
        let v1 = builder.extend_genesis(1);
        let decision = rules.process_proposal(&v1, &high_qc, &mut storage).unwrap();
        assert!(matches!(
            decision,
            SafetyDecision::Rejected(RejectReason::AlreadyVoted { .. })
        ));
    }

    #[test]
    fn test_timeout_is_stable_for_same_view() {
        let (_, builder, mut rules, mut storage) = setup();
        let high_qc = builder.genesis_high_qc();

        let first = approved(rules.process_timeout(0, 2, &high_qc, &mut storage).unwrap());
        let second = approved(rules.process_timeout(0, 2, &high_qc, &mut storage).unwrap());
        assert_eq!(first, second);
        assert_eq!(storage.safety_writes(), 1);
    }

    #[test]
    fn test_timeout_after_vote_in_same_view_allowed() {
        let (_, builder, mut rules, mut storage) = setup();
        let high_qc = builder.genesis_high_qc();

        let v1 = builder.extend_genesis(1);
        approved(rules.process_proposal(&v1, &high_qc, &mut storage).unwrap());
        approved(rules.process_timeout(0, 1, &high_qc, &mut storage).unwrap());

        let decision = rules.process_timeout(0, 0, &high_qc, &mut storage).unwrap();
        assert!(matches!(
            decision,
            SafetyDecision::Rejected(RejectReason::StaleTimeout { .. })
        ));
    }

    #[test]
    fn test_persistence_failure_halts() {
        let (_, builder, mut rules, mut storage) = setup();
        let high_qc = builder.genesis_high_qc();
        storage.set_fail(true);

        let v1 = builder.extend_genesis(1);
        let result = rules.process_proposal(&v1, &high_qc, &mut storage);
        assert!(matches!(result, Err(SafetyError::Persistence(_))));
        // nothing applied
        assert_eq!(rules.state().last_voted_view, 0);
        assert!(rules.is_halted());

        storage.set_fail(false);
        let result = rules.process_timeout(0, 1, &high_qc, &mut storage);
        assert_eq!(result, Err(SafetyError::Halted));
    }

    #[test]
    fn test_state_persisted_before_vote_returned() {
        let (_, builder, mut rules, mut storage) = setup();
        let high_qc = builder.genesis_high_qc();

        let v1 = builder.extend_genesis(1);
        let vote = approved(rules.process_proposal(&v1, &high_qc, &mut storage).unwrap());

        let persisted = storage.stored_safety_state().unwrap();
        assert_eq!(persisted.last_voted_view, 1);
        assert_eq!(persisted.last_vote, Some(vote));
    }
}
