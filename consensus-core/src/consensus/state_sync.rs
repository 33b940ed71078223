// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Vertex synchronization.
//!
//! When a certificate or a proposal references a vertex this replica does
//! not have, [`BftSync`] fetches the missing ancestors from peers with
//! `GetVerticesRequest`s until the fetched chain connects to the local
//! vertex store.
//!
//! # Lifecycle of a sync
//!
//! ```text
//! Idle -> RequestSent(peer, attempt) -> Resolved
//!              |      ^
//!              v      |
//!            Retry (random other candidate) -> GaveUp
//! ```
//!
//! A sync is keyed by the id of the vertex it targets. The first request
//! goes to whoever sent us the certificate, later ones to a random
//! candidate among the certificate's signers and the rest of the validator
//! set. Requests in flight to a single peer and concurrent syncs are both
//! bounded, and triggers for a target already being synced are coalesced.

use consensus_traits::{Author, HashValue, Network};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use super::event::{LocalTimer, TimerScheduler};
use crate::certificates::{HighQC, QuorumCertificate};
use crate::counters::ConsensusCounters;
use crate::epoch_manager::EpochState;
use crate::network::{
    ConsensusMessage, GetVerticesErrorResponse, GetVerticesRequest, GetVerticesResponse, Proposal,
};
use crate::types::{Epoch, Vertex, View};
use crate::vertex_store::VertexStore;

/// Proposals parked per sync while their parent is fetched.
const MAX_QUEUED_PROPOSALS: usize = 4;

/// Configuration for vertex synchronization.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StateSyncConfig {
    /// Vertices asked for per request
    pub request_count: u64,

    /// Largest request this replica serves
    pub max_request_count: u64,

    /// Timeout for a single request (in milliseconds)
    pub request_timeout_ms: u64,

    /// Failed attempts tolerated before a sync is abandoned
    pub max_retries: u32,

    /// Requests outstanding to one peer at a time
    pub max_in_flight_per_peer: usize,

    /// Syncs running at the same time
    pub max_pending_syncs: usize,

    /// Longest chain fetched before giving up; a replica further behind
    /// needs ledger sync instead
    pub max_sync_depth: usize,

    /// Seed of the peer selection, mixed with the local author
    pub seed: u64,
}

impl Default for StateSyncConfig {
    fn default() -> Self {
        Self {
            request_count: 10,
            max_request_count: 100,
            request_timeout_ms: 2000,
            max_retries: 3,
            max_in_flight_per_peer: 2,
            max_pending_syncs: 16,
            max_sync_depth: 1000,
            seed: 0,
        }
    }
}

impl StateSyncConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Outcome of asking for a certificate's vertex to be present.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncResult {
    /// The vertex is in the store
    Synced,
    /// A sync is fetching it
    InProgress,
    /// The certificate can never be synced (e.g. an unknown genesis)
    Invalid,
    /// Backpressure refused to start a sync; a later trigger will retry
    Deferred,
}

/// A sync whose fetched chain now connects to the store.
#[derive(Clone, Debug)]
pub struct ResolvedSync {
    pub target_qc: QuorumCertificate,
    pub high_qc: HighQC,
    /// Peer whose certificate started the sync
    pub author: Author,
    /// Fetched vertices, oldest first. The parent of the first is in the store.
    pub vertices: Vec<Vertex>,
    /// Proposals that were waiting for the target
    pub proposals: Vec<Proposal>,
}

struct PendingSync {
    target_qc: QuorumCertificate,
    high_qc: HighQC,
    author: Author,
    candidates: Vec<Author>,
    peer: Author,
    /// Id of the vertex currently requested
    requested: HashValue,
    /// Incremented on every request sent; matches the request's timer
    attempt: u64,
    /// Failures since the last useful response
    retries: u32,
    /// Newest first
    fetched: Vec<Vertex>,
    proposals: Vec<Proposal>,
}

/// Fetches missing vertices for one epoch.
pub struct BftSync {
    config: StateSyncConfig,
    epoch: Epoch,
    self_author: Author,
    rng: ChaCha8Rng,
    syncs: BTreeMap<HashValue, PendingSync>,
    in_flight: HashMap<Author, usize>,
    counters: Arc<ConsensusCounters>,
}

impl BftSync {
    pub fn new(
        epoch: Epoch,
        self_author: Author,
        config: StateSyncConfig,
        counters: Arc<ConsensusCounters>,
    ) -> Self {
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&self_author.0[..8]);
        let rng = ChaCha8Rng::seed_from_u64(config.seed.wrapping_add(u64::from_le_bytes(prefix)));
        Self {
            config,
            epoch,
            self_author,
            rng,
            syncs: BTreeMap::new(),
            in_flight: HashMap::new(),
            counters,
        }
    }

    pub fn config(&self) -> &StateSyncConfig {
        &self.config
    }

    pub fn is_syncing(&self, target: &HashValue) -> bool {
        self.syncs.contains_key(target)
    }

    pub fn pending_syncs(&self) -> usize {
        self.syncs.len()
    }

    /// Requests currently outstanding to `peer`.
    pub fn in_flight(&self, peer: &Author) -> usize {
        self.in_flight.get(peer).copied().unwrap_or(0)
    }

    /// Start fetching the vertex certified by `target_qc`, which the caller
    /// found missing from the store. `high_qc` is applied once the sync
    /// resolves.
    pub fn sync_to(
        &mut self,
        target_qc: &QuorumCertificate,
        high_qc: &HighQC,
        author: Author,
        epoch_state: &EpochState,
        network: &dyn Network<ConsensusMessage>,
        timers: &mut dyn TimerScheduler,
    ) -> SyncResult {
        let target = target_qc.certified_vertex_id();
        if self.syncs.contains_key(&target) {
            ConsensusCounters::inc(&self.counters.syncs_deferred);
            return SyncResult::InProgress;
        }
        if target_qc.is_genesis() {
            log::warn!(
                "Genesis certificate {} does not match the local genesis",
                target.short_str()
            );
            return SyncResult::Invalid;
        }
        if self.syncs.len() >= self.config.max_pending_syncs {
            log::debug!(
                "Deferring sync to {}: {} syncs pending",
                target.short_str(),
                self.syncs.len()
            );
            ConsensusCounters::inc(&self.counters.syncs_deferred);
            return SyncResult::Deferred;
        }

        let candidates = self.candidates(author, target_qc, epoch_state);
        let peer = match candidates.iter().find(|c| self.has_capacity(c)) {
            Some(peer) => *peer,
            None => {
                log::debug!(
                    "Deferring sync to {}: no peer with free request slots",
                    target.short_str()
                );
                ConsensusCounters::inc(&self.counters.syncs_deferred);
                return SyncResult::Deferred;
            }
        };

        log::info!(
            "Syncing to {} at view {} from {}",
            target.short_str(),
            target_qc.view(),
            peer
        );
        self.syncs.insert(
            target,
            PendingSync {
                target_qc: target_qc.clone(),
                high_qc: high_qc.clone(),
                author,
                candidates,
                peer,
                requested: target,
                attempt: 0,
                retries: 0,
                fetched: Vec::new(),
                proposals: Vec::new(),
            },
        );
        self.dispatch(target, network, timers);
        SyncResult::InProgress
    }

    /// Park a proposal until the sync to `target` resolves.
    pub fn queue_proposal(&mut self, target: &HashValue, proposal: Proposal) -> bool {
        match self.syncs.get_mut(target) {
            Some(sync) if sync.proposals.len() < MAX_QUEUED_PROPOSALS => {
                if !sync.proposals.contains(&proposal) {
                    sync.proposals.push(proposal);
                }
                true
            }
            _ => false,
        }
    }

    /// Handle vertices sent by `sender`.
    ///
    /// # Returns
    ///
    /// The resolved sync once the fetched chain connects to the store.
    pub fn on_response(
        &mut self,
        sender: Author,
        response: GetVerticesResponse,
        store: &VertexStore,
        epoch_state: &EpochState,
        network: &dyn Network<ConsensusMessage>,
        timers: &mut dyn TimerScheduler,
    ) -> Option<ResolvedSync> {
        let first_id = match response.vertices.first() {
            Some(first) => first.id(),
            None => {
                log::debug!("Ignoring empty vertices response from {}", sender);
                return None;
            }
        };
        let target = self
            .syncs
            .iter()
            .find(|(_, sync)| sync.peer == sender && sync.requested == first_id)
            .map(|(target, _)| *target);
        let target = match target {
            Some(target) => target,
            None => {
                log::debug!(
                    "Ignoring unsolicited vertices {} from {}",
                    first_id.short_str(),
                    sender
                );
                return None;
            }
        };
        self.release(&sender);

        let chain = match validate_chain(response.vertices, store, epoch_state) {
            Ok(chain) => chain,
            Err(reason) => {
                log::warn!("Invalid vertices response from {}: {}", sender, reason);
                ConsensusCounters::inc(&self.counters.rejected_messages);
                self.retry(target, network, timers);
                return None;
            }
        };

        let sync = self.syncs.get_mut(&target)?;
        sync.retries = 0;
        sync.fetched.extend(chain);

        if sync.fetched.len() > self.config.max_sync_depth {
            log::warn!(
                "Abandoning sync to {}: more than {} vertices behind, ledger sync required",
                target.short_str(),
                self.config.max_sync_depth
            );
            self.abandon(&target);
            return None;
        }

        let next = sync.fetched.last().map(|oldest| oldest.parent_id());
        match next {
            Some(parent_id) if !store.contains(&parent_id) => {
                log::debug!(
                    "Sync to {} fetched {} vertices, continuing at {}",
                    target.short_str(),
                    sync.fetched.len(),
                    parent_id.short_str()
                );
                sync.requested = parent_id;
                if !self.has_capacity(&sender) {
                    self.retry(target, network, timers);
                } else {
                    self.dispatch(target, network, timers);
                }
                None
            }
            _ => {
                let sync = self.syncs.remove(&target)?;
                ConsensusCounters::inc(&self.counters.syncs_completed);
                log::info!(
                    "Sync to {} resolved with {} vertices",
                    target.short_str(),
                    sync.fetched.len()
                );
                let mut vertices = sync.fetched;
                vertices.reverse();
                Some(ResolvedSync {
                    target_qc: sync.target_qc,
                    high_qc: sync.high_qc,
                    author: sync.author,
                    vertices,
                    proposals: sync.proposals,
                })
            }
        }
    }

    /// Handle a peer telling us it lacks the requested vertex.
    ///
    /// # Returns
    ///
    /// `true` if the response answered one of our requests.
    pub fn on_error_response(
        &mut self,
        sender: Author,
        response: &GetVerticesErrorResponse,
        network: &dyn Network<ConsensusMessage>,
        timers: &mut dyn TimerScheduler,
    ) -> bool {
        let target = self
            .syncs
            .iter()
            .find(|(_, sync)| sync.peer == sender && sync.requested == response.vertex_id)
            .map(|(target, _)| *target);
        match target {
            Some(target) => {
                log::debug!(
                    "{} does not have {}, trying another peer",
                    sender,
                    response.vertex_id.short_str()
                );
                self.release(&sender);
                self.retry(target, network, timers);
                true
            }
            None => false,
        }
    }

    /// Handle a request timer firing. Timers of earlier attempts are ignored.
    pub fn on_timeout(
        &mut self,
        target: HashValue,
        attempt: u64,
        network: &dyn Network<ConsensusMessage>,
        timers: &mut dyn TimerScheduler,
    ) {
        let peer = match self.syncs.get(&target) {
            Some(sync) if sync.attempt == attempt => sync.peer,
            _ => return,
        };
        log::debug!(
            "Vertex request for sync {} to {} timed out",
            target.short_str(),
            peer
        );
        ConsensusCounters::inc(&self.counters.sync_timeouts);
        self.release(&peer);
        self.retry(target, network, timers);
    }

    /// Drop syncs whose target can no longer be attached after a commit.
    pub fn on_commit(&mut self, root_view: View) {
        let stale: Vec<HashValue> = self
            .syncs
            .iter()
            .filter(|(_, sync)| sync.target_qc.view() <= root_view)
            .map(|(target, _)| *target)
            .collect();
        for target in stale {
            if let Some(sync) = self.syncs.remove(&target) {
                log::debug!(
                    "Dropping sync to {} at view {}: committed past it",
                    target.short_str(),
                    sync.target_qc.view()
                );
                self.release(&sync.peer);
            }
        }
    }

    /// Sender first, then the certificate's signers, then every other
    /// validator. Never ourselves.
    fn candidates(
        &self,
        author: Author,
        target_qc: &QuorumCertificate,
        epoch_state: &EpochState,
    ) -> Vec<Author> {
        let mut candidates = Vec::new();
        let ordered = std::iter::once(&author)
            .chain(target_qc.signatures().signers())
            .chain(epoch_state.validators().authors());
        for candidate in ordered {
            if *candidate != self.self_author && !candidates.contains(candidate) {
                candidates.push(*candidate);
            }
        }
        candidates
    }

    fn has_capacity(&self, peer: &Author) -> bool {
        self.in_flight(peer) < self.config.max_in_flight_per_peer
    }

    fn release(&mut self, peer: &Author) {
        if let Some(count) = self.in_flight.get_mut(peer) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.in_flight.remove(peer);
            }
        }
    }

    /// Send the current request of the sync to `target` to its peer.
    fn dispatch(
        &mut self,
        target: HashValue,
        network: &dyn Network<ConsensusMessage>,
        timers: &mut dyn TimerScheduler,
    ) {
        let Some(sync) = self.syncs.get_mut(&target) else {
            return;
        };
        sync.attempt += 1;
        *self.in_flight.entry(sync.peer).or_default() += 1;

        network.send(
            &sync.peer,
            ConsensusMessage::GetVerticesRequest(GetVerticesRequest {
                epoch: self.epoch,
                vertex_id: sync.requested,
                count: self.config.request_count,
            }),
        );
        timers.schedule(
            LocalTimer::SyncTimeout {
                epoch: self.epoch,
                target,
                attempt: sync.attempt,
            },
            self.config.request_timeout(),
        );
        ConsensusCounters::inc(&self.counters.sync_requests);
    }

    /// Move the sync to `target` to a random other candidate, or abandon it
    /// once it exhausted its retries.
    fn retry(
        &mut self,
        target: HashValue,
        network: &dyn Network<ConsensusMessage>,
        timers: &mut dyn TimerScheduler,
    ) {
        let (current, candidates) = match self.syncs.get_mut(&target) {
            Some(sync) => {
                sync.retries += 1;
                if sync.retries > self.config.max_retries {
                    log::warn!(
                        "Abandoning sync to {} after {} attempts",
                        target.short_str(),
                        sync.retries
                    );
                    self.abandon(&target);
                    return;
                }
                (sync.peer, sync.candidates.clone())
            }
            None => return,
        };

        let available: Vec<Author> = candidates
            .iter()
            .filter(|c| self.has_capacity(c))
            .copied()
            .collect();
        let others: Vec<Author> = available.iter().filter(|c| **c != current).copied().collect();
        let pool = if others.is_empty() { available } else { others };
        if pool.is_empty() {
            log::warn!(
                "Abandoning sync to {}: no peer with free request slots",
                target.short_str()
            );
            self.abandon(&target);
            return;
        }

        let peer = pool[self.rng.gen_range(0..pool.len())];
        if let Some(sync) = self.syncs.get_mut(&target) {
            sync.peer = peer;
        }
        self.dispatch(target, network, timers);
    }

    fn abandon(&mut self, target: &HashValue) {
        if self.syncs.remove(target).is_some() {
            ConsensusCounters::inc(&self.counters.syncs_abandoned);
        }
    }
}

/// Check a response chains parent to child and carries valid certificates.
///
/// # Returns
///
/// The vertices up to (excluding) the first one already in the store,
/// newest first.
fn validate_chain(
    vertices: Vec<Vertex>,
    store: &VertexStore,
    epoch_state: &EpochState,
) -> Result<Vec<Vertex>, String> {
    let mut chain: Vec<Vertex> = Vec::with_capacity(vertices.len());
    for vertex in vertices {
        if let Some(child) = chain.last() {
            if child.parent_id() != vertex.id() {
                return Err(format!(
                    "vertex {} is not the parent of {}",
                    vertex.id().short_str(),
                    child.id().short_str()
                ));
            }
        }
        if vertex.epoch != epoch_state.epoch() {
            return Err(format!("vertex from epoch {}", vertex.epoch));
        }
        if store.contains(&vertex.id()) {
            break;
        }
        if vertex.is_genesis() {
            return Err("unknown genesis vertex".to_string());
        }
        if vertex.qc.view() >= vertex.view {
            return Err(format!(
                "vertex view {} not above its certificate view {}",
                vertex.view,
                vertex.qc.view()
            ));
        }
        vertex.qc.verify(epoch_state).map_err(|e| e.to_string())?;
        if let Some(tc) = &vertex.tc {
            if tc.view() >= vertex.view {
                return Err(format!("timeout certificate for view {}", tc.view()));
            }
            tc.verify(epoch_state).map_err(|e| e.to_string())?;
        }
        chain.push(vertex);
    }
    Ok(chain)
}

/// Answer a vertices request from the local store.
///
/// Unknown vertices are answered with an error carrying our HighQC so the
/// requester learns where this replica stands.
pub fn serve_request(
    store: &VertexStore,
    request: &GetVerticesRequest,
    max_request_count: u64,
) -> ConsensusMessage {
    let count = request.count.clamp(1, max_request_count.max(1)) as usize;
    match store.get_vertices(&request.vertex_id, count) {
        Some(vertices) => ConsensusMessage::GetVerticesResponse(GetVerticesResponse {
            epoch: store.epoch(),
            vertices,
        }),
        None => ConsensusMessage::GetVerticesError(Box::new(GetVerticesErrorResponse {
            epoch: store.epoch(),
            vertex_id: request.vertex_id,
            high_qc: store.high_qc(),
        })),
    }
}
