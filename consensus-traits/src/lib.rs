// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! # HotStuff Consensus Traits
//!
//! Interfaces between the consensus core and the components it treats as
//! external collaborators, plus the small primitives those interfaces share.
//!
//! ## Collaborators
//!
//! - **Ledger**: [`CommandExecutor`] prepares ledger headers for proposed
//!   vertices and applies committed commands
//! - **Mempool**: [`Mempool`] supplies commands to the proposing leader
//! - **Network**: [`Network`] sends and broadcasts consensus messages
//! - **Storage**: [`Persistence`] keeps the safety state and a vertex store
//!   checkpoint across restarts
//! - **Leader election**: [`ProposerElection`]
//!
//! ## Primitives
//!
//! [`HashValue`], [`Author`], [`Command`], [`LedgerHeader`],
//! [`ValidatorInfo`] and the [`VerifyError`] taxonomy.
//!
//! ## License
//!
//! Licensed under the Apache License, Version 2.0 (LICENSE or http://www.apache.org/licenses/LICENSE-2.0)

pub mod core;
pub mod ledger;
pub mod mempool;
pub mod network;
pub mod proposer;
pub mod storage;

// Re-export commonly used items at the crate root
pub use core::{Author, HashValue, VerifyError};
pub use ledger::{Command, CommandExecutor, CommittedCommand, LedgerHeader, ValidatorInfo};
pub use mempool::Mempool;
pub use network::Network;
pub use proposer::ProposerElection;
pub use storage::Persistence;

/// Result type alias for collaborator operations.
pub type Result<T> = std::result::Result<T, core::Error>;
