// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Proposer election trait for consensus.
//!
//! Every correct replica must derive the same leader for a view from the
//! same validator set, so implementations are pure functions of the view.

use crate::core::Author;

/// Proposer election strategy.
pub trait ProposerElection: Send {
    /// Get the leader for a given view.
    fn leader(&mut self, view: u64) -> Author;

    /// Check if a given author is the valid proposer for the view.
    fn is_valid_proposer(&mut self, author: &Author, view: u64) -> bool {
        self.leader(view) == *author
    }
}
