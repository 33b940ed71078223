// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Epoch management for consensus.
//!
//! The [`EpochManager`] owns exactly one [`ConsensusInstance`] at a time.
//! It filters events by epoch before the instance sees them: messages from
//! older epochs are dropped, messages from future epochs are buffered up to
//! a bound and replayed once the replica reaches that epoch. When the
//! instance commits an end-of-epoch ledger header the manager swaps in a
//! fresh instance for the next validator set.

use consensus_traits::{Author, LedgerHeader, Persistence, ValidatorInfo};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;

use crate::certificates::QuorumCertificate;
use crate::consensus::{
    ConsensusConfig, ConsensusContext, ConsensusError, ConsensusEvent, ConsensusInstance,
};
use crate::counters::ConsensusCounters;
use crate::crypto::ValidatorSigner;
use crate::network::ConsensusMessage;
use crate::safety_rules::{self, RecoveryError, SafetyState};
use crate::types::{Epoch, ExecutedVertex};
use crate::validator_set::ValidatorSet;
use crate::votes::EquivocationEvidence;
use crate::vertex_store::{VertexStore, VertexStoreCheckpoint, VertexStoreError};

/// Validator set of an epoch and the genesis it starts from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EpochState {
    epoch: Epoch,
    validators: ValidatorSet,
    genesis_header: LedgerHeader,
    genesis_qc: QuorumCertificate,
}

impl EpochState {
    /// The epoch is the one `genesis_header` starts.
    pub fn new(validators: ValidatorSet, genesis_header: LedgerHeader) -> Self {
        let genesis_qc = QuorumCertificate::genesis(&ExecutedVertex::genesis(genesis_header.clone()));
        Self {
            epoch: genesis_header.epoch,
            validators,
            genesis_header,
            genesis_qc,
        }
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn validators(&self) -> &ValidatorSet {
        &self.validators
    }

    /// Ledger header the genesis vertex executes to.
    pub fn genesis_header(&self) -> &LedgerHeader {
        &self.genesis_header
    }

    /// The only view 0 certificate valid in this epoch.
    pub fn genesis_qc(&self) -> &QuorumCertificate {
        &self.genesis_qc
    }
}

/// The commit that ends an epoch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EpochChange {
    /// Committed ledger header announcing the next validator set
    pub header: LedgerHeader,
    /// QC whose commit includes `header`
    pub proof: QuorumCertificate,
}

impl EpochChange {
    pub fn new(header: LedgerHeader, proof: QuorumCertificate) -> Self {
        Self { header, proof }
    }

    pub fn next_epoch(&self) -> Epoch {
        self.header.epoch + 1
    }

    pub fn next_validators(&self) -> Result<ValidatorSet, EpochTransitionError> {
        let infos: Vec<ValidatorInfo> = self
            .header
            .next_validators
            .clone()
            .ok_or(EpochTransitionError::NotEndOfEpoch)?;
        ValidatorSet::new(infos).map_err(|e| EpochTransitionError::InvalidValidatorSet(e.to_string()))
    }

    /// Check that `proof` is a valid QC of the ending epoch and commits
    /// exactly `header`.
    pub fn verify(&self, epoch_state: &EpochState) -> Result<(), EpochTransitionError> {
        if self.header.epoch != epoch_state.epoch() {
            return Err(EpochTransitionError::InvalidProof(format!(
                "header of epoch {} cannot end epoch {}",
                self.header.epoch,
                epoch_state.epoch()
            )));
        }
        self.proof
            .verify(epoch_state)
            .map_err(|e| EpochTransitionError::InvalidProof(e.to_string()))?;
        match self.proof.committed() {
            Some(committed) if committed.ledger_header == self.header => Ok(()),
            _ => Err(EpochTransitionError::InvalidProof(format!(
                "{} does not commit version {}",
                self.proof, self.header.version
            ))),
        }
    }

    /// Ledger header the next epoch's genesis vertex executes to.
    pub fn genesis_header(&self) -> LedgerHeader {
        LedgerHeader::genesis(self.next_epoch(), self.header.version, self.header.accumulator)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EpochTransitionError {
    #[error("Failed to recover safety state: {0}")]
    Recovery(#[from] RecoveryError),

    #[error("Invalid validator set: {0}")]
    InvalidValidatorSet(String),

    #[error("Failed to restore vertex store: {0}")]
    Checkpoint(#[from] VertexStoreError),

    #[error("Ledger header does not end the epoch")]
    NotEndOfEpoch,

    #[error("Invalid epoch change proof: {0}")]
    InvalidProof(String),
}

/// Configuration for epoch management
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EpochManagerConfig {
    /// Future-epoch messages kept for replay; later arrivals are dropped
    pub max_buffered_messages: usize,
    pub consensus: ConsensusConfig,
}

impl Default for EpochManagerConfig {
    fn default() -> Self {
        Self {
            max_buffered_messages: 1000,
            consensus: ConsensusConfig::default(),
        }
    }
}

impl EpochManagerConfig {
    pub fn new(max_buffered_messages: usize, consensus: ConsensusConfig) -> Self {
        Self {
            max_buffered_messages,
            consensus,
        }
    }
}

/// Runs consensus across epochs.
pub struct EpochManager {
    config: EpochManagerConfig,
    signer: Arc<ValidatorSigner>,
    ctx: ConsensusContext,
    instance: ConsensusInstance,
    /// Messages of future epochs, in arrival order
    buffered: VecDeque<(Author, ConsensusMessage)>,
}

impl EpochManager {
    /// Create the manager for `epoch_state`, recovering safety state and the
    /// vertex store from `ctx.storage` when they belong to this epoch.
    ///
    /// # Errors
    ///
    /// Fails if the persisted state is unreadable or inconsistent.
    pub fn new(
        config: EpochManagerConfig,
        signer: Arc<ValidatorSigner>,
        epoch_state: EpochState,
        ctx: ConsensusContext,
    ) -> Result<Self, EpochTransitionError> {
        let instance = build_instance(
            &config,
            &signer,
            epoch_state,
            ctx.storage.as_ref(),
            ctx.counters.clone(),
        )?;
        Ok(Self {
            config,
            signer,
            ctx,
            instance,
            buffered: VecDeque::new(),
        })
    }

    pub fn epoch(&self) -> Epoch {
        self.instance.epoch()
    }

    pub fn instance(&self) -> &ConsensusInstance {
        &self.instance
    }

    pub fn counters(&self) -> &Arc<ConsensusCounters> {
        &self.ctx.counters
    }

    pub fn buffered_messages(&self) -> usize {
        self.buffered.len()
    }

    /// Equivocations seen in the current epoch since the last call.
    pub fn take_equivocation_evidence(&mut self) -> Vec<EquivocationEvidence> {
        self.instance.take_equivocation_evidence()
    }

    pub fn start(&mut self) -> Result<(), ConsensusError> {
        self.instance.start(&mut self.ctx)
    }

    pub fn handle(&mut self, event: ConsensusEvent) -> Result<(), ConsensusError> {
        let epoch = self.epoch();
        let event_epoch = event.epoch();

        if event_epoch < epoch {
            log::trace!("Dropping {} from old epoch {}", event, event_epoch);
            ConsensusCounters::inc(&self.ctx.counters.stale_epoch_messages);
            return Ok(());
        }

        if event_epoch > epoch {
            match event {
                ConsensusEvent::Message {
                    sender,
                    message: ConsensusMessage::LedgerStatus(update),
                } => {
                    log::warn!(
                        "{} committed up to epoch {} version {}, ahead of epoch {}: ledger sync required",
                        sender,
                        update.header.epoch,
                        update.header.version,
                        epoch
                    );
                    ConsensusCounters::inc(&self.ctx.counters.ledger_sync_required);
                }
                ConsensusEvent::Message { sender, message } => self.buffer(sender, message),
                ConsensusEvent::Timer(timer) => {
                    log::debug!("Dropping timer {} of a future epoch", timer);
                }
            }
            return Ok(());
        }

        if let Some(change) = self.instance.handle(&mut self.ctx, event)? {
            self.on_ledger_update(change)?;
        }
        Ok(())
    }

    fn buffer(&mut self, sender: Author, message: ConsensusMessage) {
        if self.buffered.len() >= self.config.max_buffered_messages {
            log::debug!(
                "Future epoch buffer full, dropping {} from {}",
                message,
                sender
            );
            ConsensusCounters::inc(&self.ctx.counters.dropped_epoch_messages);
            return;
        }
        ConsensusCounters::inc(&self.ctx.counters.buffered_epoch_messages);
        self.buffered.push_back((sender, message));
    }

    /// Replace the instance with one for the epoch `change` starts, then
    /// replay buffered messages of that epoch.
    pub fn on_ledger_update(&mut self, change: EpochChange) -> Result<(), ConsensusError> {
        change.verify(self.instance.epoch_state())?;
        let next_epoch = change.next_epoch();
        let epoch_state = EpochState::new(change.next_validators()?, change.genesis_header());
        log::info!(
            "Epoch change {} -> {} at version {} with {} validators",
            self.epoch(),
            next_epoch,
            change.header.version,
            epoch_state.validators().len()
        );

        self.instance = build_instance(
            &self.config,
            &self.signer,
            epoch_state,
            self.ctx.storage.as_ref(),
            self.ctx.counters.clone(),
        )?;
        ConsensusCounters::inc(&self.ctx.counters.epoch_changes);
        self.instance.start(&mut self.ctx)?;

        let buffered = std::mem::take(&mut self.buffered);
        for (sender, message) in buffered {
            self.handle(ConsensusEvent::message(sender, message))?;
        }
        Ok(())
    }
}

fn build_instance(
    config: &EpochManagerConfig,
    signer: &Arc<ValidatorSigner>,
    epoch_state: EpochState,
    storage: &dyn Persistence<SafetyState, VertexStoreCheckpoint>,
    counters: Arc<ConsensusCounters>,
) -> Result<ConsensusInstance, EpochTransitionError> {
    let epoch = epoch_state.epoch();
    let safety_state = safety_rules::load_safety_state(storage, epoch)?;

    let checkpoint = storage
        .load_checkpoint()
        .map_err(|e| RecoveryError::Storage(e.to_string()))?;
    let store = match checkpoint {
        Some(checkpoint) if checkpoint.root.epoch == epoch => {
            let store = VertexStore::from_checkpoint(checkpoint)?;
            log::info!(
                "Restored {} vertices of epoch {} rooted at {}",
                store.len(),
                epoch,
                store.root()
            );
            store
        }
        _ => VertexStore::genesis(epoch_state.genesis_header().clone()),
    };

    Ok(ConsensusInstance::new(
        Arc::new(epoch_state),
        store,
        safety_state,
        signer.clone(),
        config.consensus.clone(),
        counters,
    ))
}
