// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Safety state recovery utilities.
//!
//! This module loads the safety state from persistent storage on startup
//! and at epoch changes. This is critical for preventing double-voting
//! after validator restarts.

use consensus_traits::Persistence;
use serde::{de::DeserializeOwned, Serialize};

use super::state::SafetyState;
use crate::types::Epoch;

/// Recovery error types.
#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    /// No safety state found in storage (first startup)
    #[error("No safety state found in storage")]
    NoState,

    /// Storage error during recovery
    #[error("Storage error: {0}")]
    Storage(String),

    /// Deserialization error
    #[error("Failed to deserialize persisted state: {0}")]
    Deserialization(String),

    /// Validation error
    #[error("Safety state validation failed: {0}")]
    Validation(String),
}

/// Load the safety state for `epoch` from storage.
///
/// A state stored for an earlier epoch is superseded by a fresh state for
/// `epoch`. A state from a later epoch means the replica is behind its own
/// storage and is rejected.
///
/// # Returns
///
/// * `Ok(SafetyState)` - The recovered or new safety state
/// * `Err(RecoveryError)` - If recovery fails
pub fn load_safety_state<P, C>(storage: &P, epoch: Epoch) -> Result<SafetyState, RecoveryError>
where
    P: Persistence<SafetyState, C> + ?Sized,
    C: Serialize + DeserializeOwned,
{
    match storage.load_safety_state() {
        Ok(Some(state)) if state.epoch == epoch => {
            validate_safety_state(&state)?;

            log::info!(
                "Recovered safety state from storage: epoch={}, last_voted_view={}, locked_view={}",
                state.epoch,
                state.last_voted_view,
                state.locked_view
            );
            Ok(state)
        }
        Ok(Some(state)) if state.epoch > epoch => Err(RecoveryError::Validation(format!(
            "stored safety state is for epoch {} but starting epoch {}",
            state.epoch, epoch
        ))),
        Ok(Some(state)) => {
            log::info!(
                "Stored safety state is for old epoch {}, starting fresh for epoch {}",
                state.epoch,
                epoch
            );
            Ok(SafetyState::new(epoch))
        }
        Ok(None) => {
            log::info!(
                "No safety state found in storage, creating new state for epoch {}",
                epoch
            );
            Ok(SafetyState::new(epoch))
        }
        Err(e) => Err(RecoveryError::Storage(e.to_string())),
    }
}

/// Validate the safety state for consistency.
///
/// This ensures the loaded state doesn't violate safety invariants.
pub fn validate_safety_state(state: &SafetyState) -> Result<(), RecoveryError> {
    if state.locked_view > state.last_voted_view {
        return Err(RecoveryError::Validation(format!(
            "Invalid state: locked_view ({}) > last_voted_view ({})",
            state.locked_view, state.last_voted_view
        )));
    }

    if let Some(vote) = &state.last_vote {
        if vote.view() > state.last_voted_view || vote.epoch() != state.epoch {
            return Err(RecoveryError::Validation(format!(
                "Invalid state: last vote at epoch {} view {} beyond epoch {} view {}",
                vote.epoch(),
                vote.view(),
                state.epoch,
                state.last_voted_view
            )));
        }
    }

    if let Some(timeout) = &state.last_timeout {
        if timeout.view > state.last_voted_view {
            return Err(RecoveryError::Validation(format!(
                "Invalid state: last timeout view ({}) > last_voted_view ({})",
                timeout.view, state.last_voted_view
            )));
        }
    }

    Ok(())
}

/// Persist the safety state to storage.
///
/// # Safety
///
/// **CRITICAL**: This MUST succeed BEFORE any vote or timeout signed under
/// this state is sent to the network.
pub fn persist_safety_state<P, C>(storage: &mut P, state: &SafetyState) -> Result<(), RecoveryError>
where
    P: Persistence<SafetyState, C> + ?Sized,
    C: Serialize + DeserializeOwned,
{
    storage
        .persist_safety_state(state)
        .map_err(|e| RecoveryError::Storage(e.to_string()))?;

    log::debug!(
        "Persisted safety state: epoch={}, last_voted_view={}, locked_view={}",
        state.epoch,
        state.last_voted_view,
        state.locked_view
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockPersistence;

    #[test]
    fn test_load_no_state() {
        let storage = MockPersistence::new();
        let state = load_safety_state(&storage, 2).unwrap();
        assert_eq!(state, SafetyState::new(2));
    }

    #[test]
    fn test_load_existing_state() {
        let mut storage = MockPersistence::new();
        let stored = SafetyState {
            last_voted_view: 10,
            locked_view: 8,
            ..SafetyState::new(5)
        };
        persist_safety_state(&mut storage, &stored).unwrap();

        let state = load_safety_state(&storage, 5).unwrap();
        assert_eq!(state, stored);
    }

    #[test]
    fn test_load_old_epoch_state_starts_fresh() {
        let mut storage = MockPersistence::new();
        let stored = SafetyState {
            last_voted_view: 10,
            ..SafetyState::new(1)
        };
        persist_safety_state(&mut storage, &stored).unwrap();

        let state = load_safety_state(&storage, 2).unwrap();
        assert_eq!(state, SafetyState::new(2));
    }

    #[test]
    fn test_load_future_epoch_state_rejected() {
        let mut storage = MockPersistence::new();
        persist_safety_state(&mut storage, &SafetyState::new(4)).unwrap();

        let result = load_safety_state(&storage, 3);
        assert!(matches!(result, Err(RecoveryError::Validation(_))));
    }

    #[test]
    fn test_load_storage_error() {
        let storage = MockPersistence::new();
        storage.set_fail(true);

        let result = load_safety_state(&storage, 0);
        assert!(result.unwrap_err().to_string().contains("Storage error"));
    }

    #[test]
    fn test_persist_error() {
        let mut storage = MockPersistence::new();
        storage.set_fail(true);

        let result = persist_safety_state(&mut storage, &SafetyState::new(0));
        assert!(matches!(result, Err(RecoveryError::Storage(_))));
    }

    #[test]
    fn test_invalid_lock_rejected() {
        let state = SafetyState {
            last_voted_view: 3,
            locked_view: 4,
            ..SafetyState::new(0)
        };
        assert!(validate_safety_state(&state).is_err());
    }

    #[test]
    fn test_state_survives_encoding() {
        let state = SafetyState {
            last_voted_view: 20,
            locked_view: 19,
            ..SafetyState::new(10)
        };

        let bytes = bincode::serialize(&state).unwrap();
        let decoded: SafetyState = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, state);
    }
}
