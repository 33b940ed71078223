// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Safety state for consensus rules.
//!
//! This module provides the persistent safety state that tracks the critical
//! information needed to never double-vote and never abandon a lock.

use serde::{Deserialize, Serialize};

use crate::network::{TimeoutVote, Vote};
use crate::types::{Epoch, View};

/// Safety state data for enforcing consensus safety rules.
///
/// It must be persisted across restarts to prevent safety violations.
///
/// # Safety Invariants
///
/// 1. `last_voted_view` is monotonically increasing within an epoch
/// 2. `locked_view <= last_voted_view`
/// 3. `last_vote` and `last_timeout` are never above `last_voted_view`
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct SafetyState {
    /// The epoch this state belongs to
    pub epoch: Epoch,

    /// The highest view this validator voted or timed out in
    pub last_voted_view: View,

    /// View of the highest QC this validator has built upon
    ///
    /// A proposal whose QC is below this view is never voted for.
    pub locked_view: View,

    /// The last vote sent
    pub last_vote: Option<Vote>,

    /// The last timeout statement sent, re-sent on retries
    pub last_timeout: Option<TimeoutVote>,
}

impl SafetyState {
    /// Fresh state at the start of an epoch.
    pub fn new(epoch: Epoch) -> Self {
        Self {
            epoch,
            ..Default::default()
        }
    }

    /// Check if a vertex of `view` may still be voted for.
    pub fn can_vote_in_view(&self, view: View) -> bool {
        view > self.last_voted_view
    }

    /// The vote already sent for `view`, if any.
    pub fn last_vote_for(&self, view: View) -> Option<&Vote> {
        self.last_vote.as_ref().filter(|vote| vote.view() == view)
    }

    /// The timeout already sent for `view`, if any.
    pub fn last_timeout_for(&self, view: View) -> Option<&TimeoutVote> {
        self.last_timeout
            .as_ref()
            .filter(|timeout| timeout.view == view && timeout.epoch == self.epoch)
    }
}

impl std::fmt::Display for SafetyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "SafetyState: [\n\
             \tepoch = {},\n\
             \tlast_voted_view = {},\n\
             \tlocked_view = {},\n\
             \tlast_vote = {:?},\n\
             \tlast_timeout = {:?}\n\
             ]",
            self.epoch,
            self.last_voted_view,
            self.locked_view,
            self.last_vote.as_ref().map(|v| v.view()),
            self.last_timeout.as_ref().map(|t| t.view)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_state() {
        let state = SafetyState::new(3);
        assert_eq!(state.epoch, 3);
        assert_eq!(state.last_voted_view, 0);
        assert_eq!(state.locked_view, 0);
        assert!(state.last_vote.is_none());
    }

    #[test]
    fn test_can_vote_in_view() {
        let state = SafetyState {
            last_voted_view: 5,
            ..SafetyState::new(0)
        };
        assert!(!state.can_vote_in_view(4));
        assert!(!state.can_vote_in_view(5));
        assert!(state.can_vote_in_view(6));
    }

    #[test]
    fn test_display() {
        let state = SafetyState {
            last_voted_view: 5,
            locked_view: 3,
            ..SafetyState::new(1)
        };
        let display = format!("{}", state);
        assert!(display.contains("epoch = 1"));
        assert!(display.contains("last_voted_view = 5"));
        assert!(display.contains("locked_view = 3"));
    }
}
