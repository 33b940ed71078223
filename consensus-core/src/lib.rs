// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! # HotStuff-style BFT Consensus Core
//!
//! A chained, leader-based BFT consensus engine. Replicas vote on vertices
//! of a tree keyed by content hash; a quorum of votes forms a quorum
//! certificate (QC), and three certified vertices with consecutive views
//! commit the oldest of them. Collaborators (execution, mempool, network,
//! storage) are the traits of `consensus-traits`.
//!
//! ## Architecture
//!
//! - [`types`] - Vertices, ledger headers, vote data
//! - [`certificates`] - Quorum and timeout certificates, `HighQC`
//! - [`crypto`] - Validator keys and signature aggregation
//! - [`validator_set`] - Voting power and quorum thresholds
//! - [`safety_rules`] - Voting constraints and their persisted state
//! - [`votes`] - Vote and timeout aggregation, equivocation evidence
//! - [`vertex_store`] - The vertex tree, commit rule and pruning
//! - [`liveness`] - Pacemaker and leader election
//! - [`network`] - Wire messages
//! - [`consensus`] - The per-epoch instance, vertex sync and async runtime
//! - [`epoch_manager`] - Epoch filtering and validator set changes
//! - [`counters`] - Operational counters
//! - [`testing`] - Mocks and a deterministic multi-replica simulation
//!
//! ## Usage
//!
//! ```rust,no_run,ignore
//! use consensus_core::consensus::{ConsensusContext, ConsensusRuntime, RuntimeConfig};
//! use consensus_core::epoch_manager::{EpochManager, EpochManagerConfig};
//!
//! let (handle, events) = ConsensusRuntime::channel(&RuntimeConfig::default());
//! let ctx = ConsensusContext { timers: Box::new(handle.timers()), /* node collaborators */ };
//! let manager = EpochManager::new(EpochManagerConfig::default(), signer, epoch_state, ctx)?;
//! tokio::spawn(ConsensusRuntime::new(manager, events, &handle).run());
//! // feed network messages with handle.send(ConsensusEvent::message(sender, msg))
//! ```

pub mod certificates;
pub mod consensus;
pub mod counters;
pub mod crypto;
pub mod epoch_manager;
pub mod liveness;
pub mod network;
pub mod safety_rules;
pub mod testing;
pub mod types;
pub mod validator_set;
pub mod vertex_store;
pub mod votes;

// Re-export commonly used types
pub use certificates::{HighQC, QuorumCertificate, TimeoutCertificate};
pub use consensus::{ConsensusConfig, ConsensusError, ConsensusEvent, ConsensusInstance};
pub use epoch_manager::{EpochChange, EpochManager, EpochState};
pub use types::{Epoch, ExecutedVertex, Vertex, View};

/// Error type for collaborator operations
pub use consensus_traits::core::Error;
