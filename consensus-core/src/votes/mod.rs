// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Vote aggregation and pending vote tracking
//!
//! This module collects votes and timeouts and detects when a quorum or
//! timeout certificate has formed.

mod pending_votes;

pub use pending_votes::{EquivocationEvidence, PendingVotes, PendingVotesConfig, VoteReceptionResult};
