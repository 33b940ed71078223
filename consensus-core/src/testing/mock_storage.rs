// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use consensus_traits::Persistence;
use std::sync::{Arc, Mutex};

use super::lock;
use crate::safety_rules::SafetyState;
use crate::vertex_store::VertexStoreCheckpoint;

#[derive(Debug, Default)]
struct StoredBytes {
    safety_state: Option<Vec<u8>>,
    checkpoint: Option<Vec<u8>>,
    safety_writes: usize,
    checkpoint_writes: usize,
    fail: bool,
}

/// In-memory persistence with failure injection.
///
/// Values are kept bincode-encoded, the way a disk store would hold them,
/// and clones share the same bytes so a "restarted" replica can reload
/// what its predecessor wrote.
#[derive(Clone, Debug, Default)]
pub struct MockPersistence {
    inner: Arc<Mutex<StoredBytes>>,
}

impl MockPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following read and write fail.
    pub fn set_fail(&self, fail: bool) {
        lock(&self.inner).fail = fail;
    }

    pub fn safety_writes(&self) -> usize {
        lock(&self.inner).safety_writes
    }

    pub fn checkpoint_writes(&self) -> usize {
        lock(&self.inner).checkpoint_writes
    }

    pub fn stored_safety_state(&self) -> Option<SafetyState> {
        let inner = lock(&self.inner);
        let bytes = inner.safety_state.as_ref()?;
        bincode::deserialize(bytes).ok()
    }

    pub fn stored_checkpoint(&self) -> Option<VertexStoreCheckpoint> {
        let inner = lock(&self.inner);
        let bytes = inner.checkpoint.as_ref()?;
        bincode::deserialize(bytes).ok()
    }
}

impl Persistence<SafetyState, VertexStoreCheckpoint> for MockPersistence {
    fn persist_safety_state(&mut self, state: &SafetyState) -> consensus_traits::Result<()> {
        let mut inner = lock(&self.inner);
        if inner.fail {
            anyhow::bail!("injected storage failure");
        }
        inner.safety_state = Some(bincode::serialize(state)?);
        inner.safety_writes += 1;
        Ok(())
    }

    fn load_safety_state(&self) -> consensus_traits::Result<Option<SafetyState>> {
        let inner = lock(&self.inner);
        if inner.fail {
            anyhow::bail!("injected storage failure");
        }
        match &inner.safety_state {
            Some(bytes) => Ok(Some(bincode::deserialize(bytes)?)),
            None => Ok(None),
        }
    }

    fn save_checkpoint(&mut self, checkpoint: &VertexStoreCheckpoint) -> consensus_traits::Result<()> {
        let mut inner = lock(&self.inner);
        if inner.fail {
            anyhow::bail!("injected storage failure");
        }
        inner.checkpoint = Some(bincode::serialize(checkpoint)?);
        inner.checkpoint_writes += 1;
        Ok(())
    }

    fn load_checkpoint(&self) -> consensus_traits::Result<Option<VertexStoreCheckpoint>> {
        let inner = lock(&self.inner);
        if inner.fail {
            anyhow::bail!("injected storage failure");
        }
        match &inner.checkpoint {
            Some(bytes) => Ok(Some(bincode::deserialize(bytes)?)),
            None => Ok(None),
        }
    }
}
