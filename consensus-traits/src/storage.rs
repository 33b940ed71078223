// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Persistence interface for consensus.
//!
//! Two things survive a restart: the safety state (the guard against
//! double-voting) and a checkpoint of the vertex store. The storage engine
//! itself is not part of the consensus core.

use serde::{de::DeserializeOwned, Serialize};

/// Durable storage for consensus state.
///
/// # Type Parameters
///
/// * `S` - Safety state type
/// * `C` - Vertex store checkpoint type
///
/// # Safety
///
/// `persist_safety_state` MUST be durable when it returns `Ok`. The core
/// releases a vote or timeout signature only after this call succeeds, and
/// treats an error as fatal.
///
/// # Example
///
/// ```text
/// use consensus_traits::storage::Persistence;
///
/// struct FileStorage { dir: PathBuf }
///
/// impl<S, C> Persistence<S, C> for FileStorage
/// where
///     S: Serialize + DeserializeOwned + Send,
///     C: Serialize + DeserializeOwned + Send,
/// {
///     fn persist_safety_state(&mut self, state: &S) -> Result<(), anyhow::Error> {
///         let bytes = bincode::serialize(state)?;
///         write_atomically(self.dir.join("safety"), &bytes)
///     }
///     // ...
/// }
/// ```
pub trait Persistence<S, C>: Send
where
    S: Serialize + DeserializeOwned,
    C: Serialize + DeserializeOwned,
{
    /// Durably store the safety state.
    ///
    /// # Errors
    ///
    /// Returns an error if the state could not be made durable.
    fn persist_safety_state(&mut self, state: &S) -> Result<(), crate::core::Error>;

    /// Load the last persisted safety state.
    ///
    /// Returns `None` on first startup.
    fn load_safety_state(&self) -> Result<Option<S>, crate::core::Error>;

    /// Store a checkpoint of the vertex store.
    fn save_checkpoint(&mut self, checkpoint: &C) -> Result<(), crate::core::Error>;

    /// Load the last stored vertex store checkpoint.
    fn load_checkpoint(&self) -> Result<Option<C>, crate::core::Error>;
}
