// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Ledger-facing types and the command executor interface.
//!
//! The consensus core never interprets commands. It asks the executor for
//! the ledger header that results from applying a command on top of a
//! parent header (so that a QC certifies both the vertex and the ledger
//! state), and hands committed commands back once the three-chain rule
//! finalizes them.

use crate::core::{Author, HashValue};
use serde::{Deserialize, Serialize};

/// Opaque command payload supplied by the mempool.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Command(pub Vec<u8>);

impl Command {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Command(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Command({} bytes)", self.0.len())
    }
}

/// A validator identity together with its voting power.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValidatorInfo {
    pub author: Author,
    pub voting_power: u64,
}

impl ValidatorInfo {
    pub fn new(author: Author, voting_power: u64) -> Self {
        Self {
            author,
            voting_power,
        }
    }
}

/// Ledger-state commitment bound to a vertex.
///
/// `next_validators` is set on the header that ends an epoch. Once such a
/// header is committed the command executor has produced an epoch change.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LedgerHeader {
    /// Epoch this header belongs to
    pub epoch: u64,
    /// View of the vertex which produced this header
    pub view: u64,
    /// Number of commands applied so far
    pub version: u64,
    /// Accumulator over every applied command
    pub accumulator: HashValue,
    /// Validator set of the next epoch, present only on end-of-epoch headers
    pub next_validators: Option<Vec<ValidatorInfo>>,
}

impl LedgerHeader {
    /// Header of the ledger at the start of an epoch.
    pub fn genesis(epoch: u64, version: u64, accumulator: HashValue) -> Self {
        Self {
            epoch,
            view: 0,
            version,
            accumulator,
            next_validators: None,
        }
    }

    pub fn is_end_of_epoch(&self) -> bool {
        self.next_validators.is_some()
    }
}

/// A finalized command handed to the executor, in commit order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommittedCommand {
    /// Id of the vertex that carried the command
    pub vertex_id: HashValue,
    /// View of that vertex
    pub view: u64,
    /// The command itself (`None` for empty vertices)
    pub command: Option<Command>,
    /// Ledger header the vertex was certified with
    pub header: LedgerHeader,
}

/// The ledger/state-execution collaborator.
///
/// # Requirements
///
/// `prepare` must be deterministic: every correct replica computes the same
/// header for the same `(parent, command, view)` triple, otherwise votes for
/// the same vertex will not aggregate.
pub trait CommandExecutor: Send {
    /// Compute the ledger header that results from applying `command` on top
    /// of `parent` in `view`.
    ///
    /// # Errors
    ///
    /// Returns an error if the command cannot be executed; the vertex is then
    /// not voted on.
    fn prepare(
        &mut self,
        parent: &LedgerHeader,
        command: Option<&Command>,
        view: u64,
    ) -> Result<LedgerHeader, crate::core::Error>;

    /// Apply finalized commands. `proof` is the header certified by the QC
    /// that committed them.
    ///
    /// # Errors
    ///
    /// An error here is an irrecoverable divergence between consensus and
    /// the ledger and stops the replica.
    fn commit(
        &mut self,
        committed: &[CommittedCommand],
        proof: &LedgerHeader,
    ) -> Result<(), crate::core::Error>;
}
