// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Consensus integration layer.
//!
//! A [`ConsensusInstance`] runs the protocol for one epoch. It owns the
//! vertex store, safety rules, vote aggregation, pacemaker, leader election
//! and vertex sync of that epoch and is driven by a single
//! [`handle`](ConsensusInstance::handle) call per [`ConsensusEvent`].
//! Collaborators (network, timers, mempool, executor, storage) are passed
//! in through a [`ConsensusContext`] so the instance itself holds no locks.
//!
//! # Flow of a view
//!
//! ```text
//!   leader(v): HighQC + mempool command -> Proposal ---broadcast--->
//!   replicas:  verify -> sync HighQC -> insert vertex -> SafetyRules -> Vote
//!   leader(v+1): PendingVotes -> QC(v) -> advance to v+1 -> propose (fast path)
//!   on deadline: TimeoutVote ---broadcast---> TC(v) -> advance to v+1
//! ```
//!
//! A QC whose vote data carries a committed header finalizes vertices,
//! which are handed to the executor. Committing an end-of-epoch header
//! produces an [`EpochChange`] for the epoch manager.

pub mod event;
pub mod runtime;
pub mod state_sync;

pub use event::{ConsensusEvent, LocalTimer, TimerScheduler};
pub use runtime::{ConsensusRuntime, RuntimeConfig, RuntimeHandle, TokioTimers};
pub use state_sync::{serve_request, BftSync, ResolvedSync, StateSyncConfig, SyncResult};

use consensus_traits::{
    Author, CommandExecutor, CommittedCommand, Mempool, Network, Persistence, ProposerElection,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::certificates::{HighQC, QuorumCertificate};
use crate::counters::ConsensusCounters;
use crate::crypto::ValidatorSigner;
use crate::epoch_manager::{EpochChange, EpochState, EpochTransitionError};
use crate::liveness::{
    ExponentialIntervalStrategy, NewViewEvent, Pacemaker, PacemakerBuilder, PacemakerConfig,
    PacemakerState, WeightedRotatingLeaders,
};
use crate::network::{
    ConsensusMessage, GetVerticesErrorResponse, GetVerticesRequest, GetVerticesResponse,
    LedgerStatusUpdate, Proposal, TimeoutVote, Vote,
};
use crate::safety_rules::{SafetyDecision, SafetyError, SafetyRules, SafetyState};
use crate::types::{Epoch, ExecutedVertex, Vertex, View};
use crate::vertex_store::{
    InsertResult, QcInsertResult, VertexStore, VertexStoreCheckpoint, VertexStoreError,
};
use crate::votes::{EquivocationEvidence, PendingVotes, PendingVotesConfig, VoteReceptionResult};

/// Proposals further ahead of the current view only contribute their
/// certificates.
pub const DEFAULT_MAX_FUTURE_PROPOSAL_VIEWS: u64 = 100;

/// Top-level consensus configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConsensusConfig {
    pub pacemaker: PacemakerConfig,
    pub sync: StateSyncConfig,
    pub pending_votes: PendingVotesConfig,
    pub max_future_proposal_views: u64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            pacemaker: PacemakerConfig::default(),
            sync: StateSyncConfig::default(),
            pending_votes: PendingVotesConfig::default(),
            max_future_proposal_views: DEFAULT_MAX_FUTURE_PROPOSAL_VIEWS,
        }
    }
}

impl ConsensusConfig {
    pub fn new(
        pacemaker: PacemakerConfig,
        sync: StateSyncConfig,
        pending_votes: PendingVotesConfig,
    ) -> Self {
        Self {
            pacemaker,
            sync,
            pending_votes,
            max_future_proposal_views: DEFAULT_MAX_FUTURE_PROPOSAL_VIEWS,
        }
    }

    /// Parse a configuration from JSON. Missing sections take their defaults.
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let value: serde_json::Value = serde_json::from_str(json)?;
        let mut config = Self::default();
        if let Some(pacemaker) = value.get("pacemaker") {
            config.pacemaker = serde_json::from_value(pacemaker.clone())?;
        }
        if let Some(sync) = value.get("sync") {
            config.sync = serde_json::from_value(sync.clone())?;
        }
        if let Some(pending_votes) = value.get("pending_votes") {
            config.pending_votes = serde_json::from_value(pending_votes.clone())?;
        }
        if let Some(views) = value.get("max_future_proposal_views") {
            config.max_future_proposal_views = serde_json::from_value(views.clone())?;
        }
        Ok(config)
    }
}

/// Fatal errors. The event loop stops on any of them.
#[derive(Debug, thiserror::Error)]
pub enum ConsensusError {
    #[error("Persistence failure: {0}")]
    Persistence(String),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Executor failure: {0}")]
    Executor(String),

    #[error(transparent)]
    EpochTransition(#[from] EpochTransitionError),
}

impl From<SafetyError> for ConsensusError {
    fn from(e: SafetyError) -> Self {
        ConsensusError::Persistence(e.to_string())
    }
}

impl From<VertexStoreError> for ConsensusError {
    fn from(e: VertexStoreError) -> Self {
        ConsensusError::InvariantViolation(e.to_string())
    }
}

/// Collaborators of a consensus replica, shared by every epoch's instance.
pub struct ConsensusContext {
    pub network: Arc<dyn Network<ConsensusMessage>>,
    pub timers: Box<dyn TimerScheduler>,
    pub mempool: Box<dyn Mempool>,
    pub executor: Box<dyn CommandExecutor>,
    pub storage: Box<dyn Persistence<SafetyState, VertexStoreCheckpoint>>,
    pub counters: Arc<ConsensusCounters>,
}

/// The consensus protocol for a single epoch.
pub struct ConsensusInstance {
    epoch_state: Arc<EpochState>,
    signer: Arc<ValidatorSigner>,
    /// Whether we hold voting power this epoch; otherwise we only follow
    is_validator: bool,
    config: ConsensusConfig,

    store: VertexStore,
    safety_rules: SafetyRules,
    pending_votes: PendingVotes,
    pacemaker: Pacemaker<ExponentialIntervalStrategy>,
    election: Box<dyn ProposerElection>,
    sync: BftSync,

    last_proposed_view: View,
    epoch_change: Option<EpochChange>,
    counters: Arc<ConsensusCounters>,
}

impl ConsensusInstance {
    pub fn new(
        epoch_state: Arc<EpochState>,
        store: VertexStore,
        safety_state: SafetyState,
        signer: Arc<ValidatorSigner>,
        config: ConsensusConfig,
        counters: Arc<ConsensusCounters>,
    ) -> Self {
        let epoch = epoch_state.epoch();
        let author = signer.author();
        let is_validator = epoch_state.validators().contains(&author);
        let pacemaker = PacemakerBuilder::from_config(config.pacemaker.clone()).build_exponential();
        let election = Box::new(WeightedRotatingLeaders::new(epoch_state.validators()));
        let sync = BftSync::new(epoch, author, config.sync.clone(), counters.clone());

        Self {
            epoch_state,
            safety_rules: SafetyRules::new(safety_state, signer.clone()),
            signer,
            is_validator,
            pending_votes: PendingVotes::new(epoch, config.pending_votes.clone()),
            config,
            store,
            pacemaker,
            election,
            sync,
            last_proposed_view: 0,
            epoch_change: None,
            counters,
        }
    }

    /// Replace the default weighted round-robin leader election.
    pub fn with_proposer_election(mut self, election: Box<dyn ProposerElection>) -> Self {
        self.election = election;
        self
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch_state.epoch()
    }

    pub fn epoch_state(&self) -> &EpochState {
        &self.epoch_state
    }

    pub fn author(&self) -> Author {
        self.signer.author()
    }

    pub fn is_validator(&self) -> bool {
        self.is_validator
    }

    pub fn current_view(&self) -> View {
        self.pacemaker.current_view()
    }

    pub fn pacemaker_state(&self) -> PacemakerState {
        self.pacemaker.state()
    }

    pub fn store(&self) -> &VertexStore {
        &self.store
    }

    pub fn high_qc(&self) -> HighQC {
        self.store.high_qc()
    }

    pub fn safety_state(&self) -> &SafetyState {
        self.safety_rules.state()
    }

    /// Equivocations seen since the last call, for reporting outside
    /// consensus.
    pub fn take_equivocation_evidence(&mut self) -> Vec<EquivocationEvidence> {
        self.pending_votes.take_equivocation_evidence()
    }

    pub fn sync(&self) -> &BftSync {
        &self.sync
    }

    pub fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    /// Enter the first view justified by the store's certificates.
    pub fn start(&mut self, ctx: &mut ConsensusContext) -> Result<(), ConsensusError> {
        log::info!(
            "Starting consensus for epoch {} as {} (validator={}, root={})",
            self.epoch(),
            self.author(),
            self.is_validator,
            self.store.root()
        );
        self.advance_pacemaker(ctx)
    }

    /// Process one event.
    ///
    /// # Returns
    ///
    /// The epoch change, once a committed vertex ends this epoch.
    ///
    /// # Errors
    ///
    /// Only fatal conditions are errors; protocol violations by peers are
    /// logged and dropped.
    pub fn handle(
        &mut self,
        ctx: &mut ConsensusContext,
        event: ConsensusEvent,
    ) -> Result<Option<EpochChange>, ConsensusError> {
        if event.epoch() != self.epoch() {
            log::debug!("Ignoring {} in epoch {}", event, self.epoch());
            return Ok(None);
        }
        log::trace!("Handling {}", event);

        match event {
            ConsensusEvent::Message { sender, message } => match message {
                ConsensusMessage::Proposal(proposal) => self.process_proposal(ctx, sender, *proposal)?,
                ConsensusMessage::Vote(vote) => self.process_vote(ctx, sender, *vote)?,
                ConsensusMessage::Timeout(timeout) => self.process_timeout_vote(ctx, sender, *timeout)?,
                ConsensusMessage::GetVerticesRequest(request) => {
                    self.process_vertices_request(ctx, sender, &request)
                }
                ConsensusMessage::GetVerticesResponse(response) => {
                    self.process_vertices_response(ctx, sender, response)?
                }
                ConsensusMessage::GetVerticesError(response) => {
                    self.process_vertices_error(ctx, sender, *response)?
                }
                ConsensusMessage::LedgerStatus(update) => self.process_ledger_status(sender, &update),
            },
            ConsensusEvent::Timer(LocalTimer::ViewTimeout { view, .. }) => {
                self.process_local_timeout(ctx, view)?
            }
            ConsensusEvent::Timer(LocalTimer::SyncTimeout { target, attempt, .. }) => {
                self.sync
                    .on_timeout(target, attempt, ctx.network.as_ref(), ctx.timers.as_mut())
            }
        }

        Ok(self.epoch_change.take())
    }

    fn reject(&self, what: &str, sender: &Author, reason: impl std::fmt::Display) {
        log::warn!("Rejecting {} from {}: {}", what, sender, reason);
        ConsensusCounters::inc(&self.counters.rejected_messages);
    }

    fn process_proposal(
        &mut self,
        ctx: &mut ConsensusContext,
        sender: Author,
        proposal: Proposal,
    ) -> Result<(), ConsensusError> {
        ConsensusCounters::inc(&self.counters.proposals_received);
        let view = proposal.view();

        if proposal.sender != sender {
            self.reject("proposal", &sender, "sender is not the signer");
            return Ok(());
        }
        if view < self.pacemaker.current_view()
            || proposal.vertex.qc.view() < self.store.root().view()
        {
            log::debug!(
                "Ignoring stale proposal for view {} (current view {})",
                view,
                self.pacemaker.current_view()
            );
            return Ok(());
        }
        let horizon = self
            .pacemaker
            .current_view()
            .saturating_add(self.config.max_future_proposal_views);
        if view > horizon {
            return self.process_far_proposal(ctx, sender, proposal);
        }
        if !self.election.is_valid_proposer(&proposal.sender, view) {
            self.reject("proposal", &sender, format!("not the leader of view {}", view));
            return Ok(());
        }
        if let Err(e) = proposal.verify(&self.epoch_state) {
            self.reject("proposal", &sender, e);
            return Ok(());
        }

        self.process_high_qc(ctx, &proposal.high_qc, sender)?;
        if let Some(tc) = &proposal.vertex.tc {
            self.store.insert_timeout_certificate(tc);
        }

        let parent_id = proposal.vertex.parent_id();
        if !self.store.contains(&parent_id) {
            let qc = proposal.vertex.qc.clone();
            let result = self.sync.sync_to(
                &qc,
                &proposal.high_qc,
                sender,
                &self.epoch_state,
                ctx.network.as_ref(),
                ctx.timers.as_mut(),
            );
            if result == SyncResult::InProgress {
                log::debug!(
                    "Proposal for view {} waits for parent {}",
                    view,
                    parent_id.short_str()
                );
                self.sync.queue_proposal(&parent_id, proposal);
            }
            return Ok(());
        }

        let qc = proposal.vertex.qc.clone();
        self.insert_qc(ctx, &qc)?;
        self.advance_pacemaker(ctx)?;

        if view != self.pacemaker.current_view() {
            log::debug!(
                "Proposal for view {} is not for the current view {}",
                view,
                self.pacemaker.current_view()
            );
            return Ok(());
        }

        let executed = match self.store.insert_vertex(proposal.vertex, ctx.executor.as_mut()) {
            InsertResult::Inserted(executed) | InsertResult::AlreadyPresent(executed) => executed,
            InsertResult::MissingParent { parent_id } => {
                return Err(ConsensusError::InvariantViolation(format!(
                    "parent {} vanished from the store",
                    parent_id.short_str()
                )))
            }
            InsertResult::Rejected(reason) => {
                self.reject("proposal", &sender, reason);
                return Ok(());
            }
        };

        self.vote_for(ctx, &executed)
    }

    /// A proposal too far ahead to vote on. Its HighQC may still let a
    /// lagging replica catch up.
    fn process_far_proposal(
        &mut self,
        ctx: &mut ConsensusContext,
        sender: Author,
        proposal: Proposal,
    ) -> Result<(), ConsensusError> {
        if !self.epoch_state.validators().contains(&sender) {
            self.reject("proposal", &sender, "not a validator");
            return Ok(());
        }
        if let Err(e) = proposal.high_qc.verify(&self.epoch_state) {
            self.reject("proposal", &sender, e);
            return Ok(());
        }
        log::debug!(
            "Proposal for view {} is far ahead of view {}, taking its certificates only",
            proposal.view(),
            self.pacemaker.current_view()
        );
        self.process_high_qc(ctx, &proposal.high_qc, sender)?;
        Ok(())
    }

    fn vote_for(
        &mut self,
        ctx: &mut ConsensusContext,
        executed: &ExecutedVertex,
    ) -> Result<(), ConsensusError> {
        if !self.is_validator {
            return Ok(());
        }
        let high_qc = self.store.high_qc();
        match self
            .safety_rules
            .process_proposal(executed, &high_qc, ctx.storage.as_mut())?
        {
            SafetyDecision::Approved(vote) => {
                let next_leader = self.election.leader(executed.view() + 1);
                log::debug!(
                    "Voting for {} and sending to {}",
                    executed,
                    next_leader
                );
                ctx.network
                    .send(&next_leader, ConsensusMessage::Vote(Box::new(vote)));
                ConsensusCounters::inc(&self.counters.votes_sent);
            }
            SafetyDecision::Rejected(reason) => {
                log::debug!("Not voting for {}: {}", executed, reason);
            }
        }
        Ok(())
    }

    fn process_vote(
        &mut self,
        ctx: &mut ConsensusContext,
        sender: Author,
        vote: Vote,
    ) -> Result<(), ConsensusError> {
        ConsensusCounters::inc(&self.counters.votes_received);
        if vote.sender != sender {
            self.reject("vote", &sender, "sender is not the signer");
            return Ok(());
        }
        if vote.view() + 1 < self.pacemaker.current_view() {
            log::trace!("Ignoring stale vote for view {}", vote.view());
            return Ok(());
        }
        if let Err(e) = vote.verify(&self.epoch_state) {
            self.reject("vote", &sender, e);
            return Ok(());
        }

        self.process_high_qc(ctx, &vote.high_qc, sender)?;

        match self
            .pending_votes
            .add_vote(&vote, self.epoch_state.validators())
        {
            VoteReceptionResult::NewQuorumCertificate(qc) => {
                ConsensusCounters::inc(&self.counters.quorum_certificates);
                log::info!("Formed {}", qc);
                let high_qc = HighQC::new(
                    qc,
                    self.store.high_qc().highest_committed_qc().clone(),
                    None,
                );
                self.process_high_qc(ctx, &high_qc, sender)?;
            }
            VoteReceptionResult::EquivocateVote(evidence) => {
                ConsensusCounters::inc(&self.counters.equivocations);
                log::warn!(
                    "Equivocation by {} in view {}",
                    evidence.author,
                    evidence.view
                );
            }
            VoteReceptionResult::UnknownAuthor(author) => {
                self.reject("vote", &author, "not a validator");
            }
            other => log::trace!("Vote from {}: {:?}", sender, other),
        }
        Ok(())
    }

    fn process_timeout_vote(
        &mut self,
        ctx: &mut ConsensusContext,
        sender: Author,
        timeout: TimeoutVote,
    ) -> Result<(), ConsensusError> {
        ConsensusCounters::inc(&self.counters.timeouts_received);
        if timeout.sender != sender {
            self.reject("timeout", &sender, "sender is not the signer");
            return Ok(());
        }
        if timeout.view < self.pacemaker.current_view() {
            log::trace!("Ignoring stale timeout for view {}", timeout.view);
            return Ok(());
        }
        if let Err(e) = timeout.verify(&self.epoch_state) {
            self.reject("timeout", &sender, e);
            return Ok(());
        }

        self.process_high_qc(ctx, &timeout.high_qc, sender)?;

        match self
            .pending_votes
            .add_timeout(&timeout, self.epoch_state.validators())
        {
            VoteReceptionResult::NewTimeoutCertificate(tc) => {
                ConsensusCounters::inc(&self.counters.timeout_certificates);
                log::info!("Formed {}", tc);
                self.store.insert_timeout_certificate(&tc);
                self.advance_pacemaker(ctx)?;
            }
            VoteReceptionResult::UnknownAuthor(author) => {
                self.reject("timeout", &author, "not a validator");
            }
            other => log::trace!("Timeout from {}: {:?}", sender, other),
        }
        Ok(())
    }

    fn process_local_timeout(
        &mut self,
        ctx: &mut ConsensusContext,
        view: View,
    ) -> Result<(), ConsensusError> {
        let attempts = match self.pacemaker.process_local_timeout(view) {
            Some(attempts) => attempts,
            None => {
                log::trace!("Ignoring timer of view {}", view);
                return Ok(());
            }
        };
        ConsensusCounters::inc(&self.counters.local_timeouts);

        if self.is_validator {
            let high_qc = self.store.high_qc();
            match self.safety_rules.process_timeout(
                self.epoch(),
                view,
                &high_qc,
                ctx.storage.as_mut(),
            )? {
                SafetyDecision::Approved(timeout) => {
                    // the leader of this view may be the one that went silent,
                    // so let everyone aggregate the vote it should have collected
                    if let Some(vote) = self.safety_rules.state().last_vote_for(view - 1) {
                        ctx.network
                            .broadcast(ConsensusMessage::Vote(Box::new(vote.clone())));
                    }
                    log::debug!("Broadcasting timeout for view {} (attempt {})", view, attempts);
                    ctx.network
                        .broadcast(ConsensusMessage::Timeout(Box::new(timeout)));
                    ConsensusCounters::inc(&self.counters.timeouts_sent);
                }
                SafetyDecision::Rejected(reason) => {
                    log::debug!("Not timing out view {}: {}", view, reason);
                }
            }
        }

        ctx.timers.schedule(
            LocalTimer::ViewTimeout {
                epoch: self.epoch(),
                view,
            },
            self.pacemaker.config().timeout_retry(),
        );
        Ok(())
    }

    fn process_vertices_request(
        &mut self,
        ctx: &mut ConsensusContext,
        sender: Author,
        request: &GetVerticesRequest,
    ) {
        let response = serve_request(&self.store, request, self.config.sync.max_request_count);
        log::debug!("Answering {} with {}", sender, response);
        ctx.network.send(&sender, response);
    }

    fn process_vertices_response(
        &mut self,
        ctx: &mut ConsensusContext,
        sender: Author,
        response: GetVerticesResponse,
    ) -> Result<(), ConsensusError> {
        let resolved = self.sync.on_response(
            sender,
            response,
            &self.store,
            &self.epoch_state,
            ctx.network.as_ref(),
            ctx.timers.as_mut(),
        );
        match resolved {
            Some(resolved) => self.apply_resolved(ctx, resolved),
            None => Ok(()),
        }
    }

    /// Insert a synced chain, oldest first, and replay what waited for it.
    fn apply_resolved(
        &mut self,
        ctx: &mut ConsensusContext,
        resolved: ResolvedSync,
    ) -> Result<(), ConsensusError> {
        // each vertex is certified by the QC of its child, the newest by the target
        let certifying: Vec<QuorumCertificate> = resolved
            .vertices
            .iter()
            .skip(1)
            .map(|v| v.qc.clone())
            .chain(std::iter::once(resolved.target_qc.clone()))
            .collect();

        for (vertex, qc) in resolved.vertices.into_iter().zip(certifying) {
            let executed = match self.store.insert_vertex(vertex, ctx.executor.as_mut()) {
                InsertResult::Inserted(executed) | InsertResult::AlreadyPresent(executed) => executed,
                other => {
                    log::warn!("Dropping synced chain: {:?}", other);
                    return Ok(());
                }
            };
            if executed.ledger_header() != &qc.proposed().ledger_header {
                return Err(ConsensusError::InvariantViolation(format!(
                    "executed ledger header of {} differs from the certified one",
                    executed
                )));
            }
        }

        self.insert_qc(ctx, &resolved.target_qc)?;
        self.process_high_qc(ctx, &resolved.high_qc, resolved.author)?;

        for proposal in resolved.proposals {
            let sender = proposal.sender;
            self.process_proposal(ctx, sender, proposal)?;
        }
        Ok(())
    }

    fn process_vertices_error(
        &mut self,
        ctx: &mut ConsensusContext,
        sender: Author,
        response: GetVerticesErrorResponse,
    ) -> Result<(), ConsensusError> {
        let answered =
            self.sync
                .on_error_response(sender, &response, ctx.network.as_ref(), ctx.timers.as_mut());

        if response.high_qc.highest_qc().view() > self.store.highest_qc().view() {
            if let Err(e) = response.high_qc.verify(&self.epoch_state) {
                self.reject("vertices error", &sender, e);
                return Ok(());
            }
            log::debug!("{} is ahead with {}, syncing to it", sender, response.high_qc);
            self.process_high_qc(ctx, &response.high_qc, sender)?;
        } else if !answered {
            log::debug!("Ignoring unsolicited vertices error from {}", sender);
        }
        Ok(())
    }

    fn process_ledger_status(&self, sender: Author, update: &LedgerStatusUpdate) {
        log::trace!(
            "{} committed up to version {} in epoch {}",
            sender,
            update.header.version,
            update.header.epoch
        );
    }

    /// Bring a verified HighQC into the store, syncing its vertex if missing,
    /// and advance the pacemaker on whatever became known.
    fn process_high_qc(
        &mut self,
        ctx: &mut ConsensusContext,
        high_qc: &HighQC,
        sender: Author,
    ) -> Result<SyncResult, ConsensusError> {
        if let Some(tc) = high_qc.highest_tc() {
            self.store.insert_timeout_certificate(tc);
        }

        let committed_qc = high_qc.highest_committed_qc();
        if self.store.contains(&committed_qc.certified_vertex_id()) {
            self.insert_qc(ctx, committed_qc)?;
        }

        let qc = high_qc.highest_qc();
        let result = if self.store.contains(&qc.certified_vertex_id()) {
            self.insert_qc(ctx, qc)?;
            SyncResult::Synced
        } else if qc.view() <= self.store.root().view() {
            // below our root: either committed already or on a pruned fork
            SyncResult::Synced
        } else {
            self.sync.sync_to(
                qc,
                high_qc,
                sender,
                &self.epoch_state,
                ctx.network.as_ref(),
                ctx.timers.as_mut(),
            )
        };

        self.advance_pacemaker(ctx)?;
        Ok(result)
    }

    /// Add a QC whose vertex is in the store, committing and checkpointing.
    fn insert_qc(
        &mut self,
        ctx: &mut ConsensusContext,
        qc: &QuorumCertificate,
    ) -> Result<(), ConsensusError> {
        match self.store.add_qc(qc)? {
            QcInsertResult::MissingVertex => Ok(()),
            QcInsertResult::ConflictingCommit { view, committed } => {
                log::warn!(
                    "Ignoring {}: commits {} at view {} but the root is {}",
                    qc,
                    committed.short_str(),
                    view,
                    self.store.root()
                );
                ConsensusCounters::inc(&self.counters.rejected_messages);
                Ok(())
            }
            QcInsertResult::Added {
                new_high_qc,
                committed,
            } => {
                let committed_any = !committed.is_empty();
                if committed_any {
                    self.apply_commits(ctx, committed)?;
                }
                if new_high_qc || committed_any {
                    self.save_checkpoint(ctx)?;
                }
                Ok(())
            }
        }
    }

    fn apply_commits(
        &mut self,
        ctx: &mut ConsensusContext,
        committed: Vec<ExecutedVertex>,
    ) -> Result<(), ConsensusError> {
        let commands: Vec<CommittedCommand> = committed
            .iter()
            .map(|v| CommittedCommand {
                vertex_id: v.id(),
                view: v.view(),
                command: v.command().cloned(),
                header: v.ledger_header().clone(),
            })
            .collect();
        let proof = match committed.last() {
            Some(last) => last.ledger_header().clone(),
            None => return Ok(()),
        };

        ctx.executor
            .commit(&commands, &proof)
            .map_err(|e| ConsensusError::Executor(e.to_string()))?;
        ConsensusCounters::add(&self.counters.vertices_committed, commands.len() as u64);
        log::info!(
            "Committed {} vertices up to view {} (version {})",
            commands.len(),
            proof.view,
            proof.version
        );

        self.sync.on_commit(self.store.root().view());
        ctx.network.broadcast(ConsensusMessage::LedgerStatus(LedgerStatusUpdate {
            header: proof,
        }));

        if self.epoch_change.is_none() {
            if let Some(last) = committed.iter().find(|v| v.ledger_header().is_end_of_epoch()) {
                log::info!("Epoch {} ends at {}", self.epoch(), last);
                self.epoch_change = Some(EpochChange::new(
                    last.ledger_header().clone(),
                    self.store.high_qc().highest_committed_qc().clone(),
                ));
            }
        }
        Ok(())
    }

    fn save_checkpoint(&mut self, ctx: &mut ConsensusContext) -> Result<(), ConsensusError> {
        ctx.storage
            .save_checkpoint(&self.store.checkpoint())
            .map_err(|e| ConsensusError::Persistence(e.to_string()))
    }

    fn advance_pacemaker(&mut self, ctx: &mut ConsensusContext) -> Result<(), ConsensusError> {
        let qc_view = self.store.highest_qc().view();
        let tc_view = self.store.highest_tc().map(|tc| tc.view());
        match self.pacemaker.process_certificates(qc_view, tc_view) {
            Some(event) => self.on_new_view(ctx, event),
            None => Ok(()),
        }
    }

    fn on_new_view(
        &mut self,
        ctx: &mut ConsensusContext,
        event: NewViewEvent,
    ) -> Result<(), ConsensusError> {
        self.pending_votes.garbage_collect(event.view);
        ctx.timers.schedule(
            LocalTimer::ViewTimeout {
                epoch: self.epoch(),
                view: event.view,
            },
            event.timeout_duration,
        );

        if self.is_validator && self.election.leader(event.view) == self.author() {
            self.propose(ctx, event.view)?;
        }
        Ok(())
    }

    fn propose(&mut self, ctx: &mut ConsensusContext, view: View) -> Result<(), ConsensusError> {
        if view <= self.last_proposed_view {
            return Ok(());
        }

        let high_qc = self.store.high_qc();
        let qc = high_qc.highest_qc().clone();
        let tc = if qc.view() + 1 == view {
            None
        } else {
            match self.store.highest_tc() {
                Some(tc) if tc.view() + 1 == view => Some(tc.clone()),
                _ => {
                    log::debug!("No certificate justifies proposing in view {}", view);
                    return Ok(());
                }
            }
        };

        let parent = self.store.get(&qc.certified_vertex_id()).ok_or_else(|| {
            ConsensusError::InvariantViolation(format!(
                "highest qc certifies unknown vertex {}",
                qc.certified_vertex_id().short_str()
            ))
        })?;
        let command = if parent.ledger_header().is_end_of_epoch() {
            None
        } else {
            ctx.mempool.take_next_command()
        };

        let vertex = Vertex::new_proposal(qc, tc, view, self.author(), command);
        let proposal = Proposal::new(vertex, high_qc, &self.signer);
        log::info!(
            "Proposing vertex {} in view {}",
            proposal.vertex.id().short_str(),
            view
        );
        self.last_proposed_view = view;
        ctx.network
            .broadcast(ConsensusMessage::Proposal(Box::new(proposal)));
        ConsensusCounters::inc(&self.counters.proposals_sent);
        Ok(())
    }
}
