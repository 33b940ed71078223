// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Deterministic in-memory network of replicas.
//!
//! Every replica is a full [`EpochManager`] wired to mocks. Messages and
//! timers become entries of one global queue ordered by virtual time and a
//! sequence number, so a run is a pure function of its inputs.

use consensus_traits::{Author, CommittedCommand, HashValue, LedgerHeader, ValidatorInfo};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use super::{
    make_signers, make_validator_set, MockCommandExecutor, MockMempool, MockNetwork,
    MockPersistence, MockTimers, SentMessage,
};
use crate::consensus::{ConsensusContext, ConsensusEvent, LocalTimer};
use crate::counters::{ConsensusCounters, CountersSnapshot};
use crate::crypto::ValidatorSigner;
use crate::epoch_manager::{EpochManager, EpochManagerConfig, EpochState};
use crate::network::{ConsensusMessage, Proposal, Vote};
use crate::types::View;

/// Decides whether a message from replica `from` to replica `to` is delivered.
pub type MessageFilter = Box<dyn FnMut(usize, usize, &ConsensusMessage) -> bool>;

/// Parameters of a simulated run.
#[derive(Clone, Debug)]
pub struct SimulationConfig {
    pub validators: usize,
    pub epoch_manager: EpochManagerConfig,
    /// Delivery delay of every message
    pub message_delay: Duration,
    /// Commands preloaded into each replica's mempool
    pub commands_per_node: usize,
    /// End every epoch at this view, keeping the same validators
    pub epoch_length: Option<View>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            validators: 4,
            epoch_manager: EpochManagerConfig::default(),
            message_delay: Duration::from_millis(10),
            commands_per_node: 100,
            epoch_length: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct EventKey {
    at: Duration,
    seq: u64,
}

#[derive(Debug)]
enum SimEvent {
    Message {
        from: usize,
        to: usize,
        message: ConsensusMessage,
    },
    Timer {
        node: usize,
        generation: u64,
        timer: LocalTimer,
    },
}

struct SimNode {
    signer: Arc<ValidatorSigner>,
    manager: Option<EpochManager>,
    /// Bumped on crash so timers of the previous incarnation are dropped
    generation: u64,
    network: MockNetwork,
    timers: MockTimers,
    mempool: MockMempool,
    executor: MockCommandExecutor,
    storage: MockPersistence,
    counters: Arc<ConsensusCounters>,
    /// Epoch to restart into
    epoch_state: EpochState,
}

impl SimNode {
    fn context(&self) -> ConsensusContext {
        ConsensusContext {
            network: Arc::new(self.network.clone()),
            timers: Box::new(self.timers.clone()),
            mempool: Box::new(self.mempool.clone()),
            executor: Box::new(self.executor.clone()),
            storage: Box::new(self.storage.clone()),
            counters: self.counters.clone(),
        }
    }
}

/// A network of replicas driven step by step.
pub struct SimulatedNetwork {
    config: SimulationConfig,
    nodes: Vec<SimNode>,
    queue: BTreeMap<EventKey, SimEvent>,
    seq: u64,
    now: Duration,
    /// Directed links that drop everything
    partitions: HashSet<(usize, usize)>,
    filter: Option<MessageFilter>,
    errors: Vec<(usize, String)>,
    dropped_messages: u64,
    /// Every vote sent, with its sender's index
    votes: Vec<(usize, Vote)>,
    proposals: Vec<Proposal>,
}

impl SimulatedNetwork {
    /// `validators` replicas with default settings.
    pub fn new(validators: usize) -> Self {
        Self::with_config(SimulationConfig {
            validators,
            ..SimulationConfig::default()
        })
    }

    pub fn with_config(config: SimulationConfig) -> Self {
        let signers = make_signers(config.validators);
        let validators = make_validator_set(&signers);
        let infos: Vec<ValidatorInfo> = validators.to_infos();
        let genesis_header = LedgerHeader::genesis(1, 0, HashValue::zero());

        let nodes = signers
            .iter()
            .enumerate()
            .map(|(i, signer)| {
                let executor = match config.epoch_length {
                    Some(length) => MockCommandExecutor::new().with_epoch_change(length, infos.clone()),
                    None => MockCommandExecutor::new(),
                };
                let commands = (0..config.commands_per_node)
                    .map(|c| format!("node{}-cmd{}", i, c).into_bytes());
                SimNode {
                    signer: signer.clone(),
                    manager: None,
                    generation: 0,
                    network: MockNetwork::new(),
                    timers: MockTimers::new(),
                    mempool: MockMempool::with_commands(commands),
                    executor,
                    storage: MockPersistence::new(),
                    counters: Arc::new(ConsensusCounters::new()),
                    epoch_state: EpochState::new(validators.clone(), genesis_header.clone()),
                }
            })
            .collect();

        Self {
            config,
            nodes,
            queue: BTreeMap::new(),
            seq: 0,
            now: Duration::ZERO,
            partitions: HashSet::new(),
            filter: None,
            errors: Vec::new(),
            dropped_messages: 0,
            votes: Vec::new(),
            proposals: Vec::new(),
        }
    }

    /// Build and start every replica.
    pub fn start(&mut self) {
        for i in 0..self.nodes.len() {
            self.boot(i);
        }
    }

    fn boot(&mut self, i: usize) {
        let node = &self.nodes[i];
        let manager = EpochManager::new(
            self.config.epoch_manager.clone(),
            node.signer.clone(),
            node.epoch_state.clone(),
            node.context(),
        );
        let mut manager = match manager {
            Ok(manager) => manager,
            Err(e) => {
                log::error!("Replica {} failed to boot: {}", i, e);
                self.errors.push((i, e.to_string()));
                return;
            }
        };
        if let Err(e) = manager.start() {
            log::error!("Replica {} failed to start: {}", i, e);
            self.errors.push((i, e.to_string()));
            return;
        }
        self.nodes[i].manager = Some(manager);
        self.collect_outputs(i);
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn now(&self) -> Duration {
        self.now
    }

    pub fn author(&self, i: usize) -> Author {
        self.nodes[i].signer.author()
    }

    pub fn signer(&self, i: usize) -> &Arc<ValidatorSigner> {
        &self.nodes[i].signer
    }

    pub fn manager(&self, i: usize) -> Option<&EpochManager> {
        self.nodes[i].manager.as_ref()
    }

    pub fn manager_mut(&mut self, i: usize) -> Option<&mut EpochManager> {
        self.nodes[i].manager.as_mut()
    }

    pub fn executor(&self, i: usize) -> &MockCommandExecutor {
        &self.nodes[i].executor
    }

    pub fn storage(&self, i: usize) -> &MockPersistence {
        &self.nodes[i].storage
    }

    pub fn counters(&self, i: usize) -> CountersSnapshot {
        self.nodes[i].counters.snapshot()
    }

    pub fn committed(&self, i: usize) -> Vec<CommittedCommand> {
        self.nodes[i].executor.committed()
    }

    pub fn committed_ids(&self, i: usize) -> Vec<HashValue> {
        self.nodes[i].executor.committed_ids()
    }

    /// Fatal errors raised by replicas, which stop those replicas.
    pub fn errors(&self) -> &[(usize, String)] {
        &self.errors
    }

    pub fn dropped_messages(&self) -> u64 {
        self.dropped_messages
    }

    /// Votes sent so far, with the index of their sender.
    pub fn votes(&self) -> &[(usize, Vote)] {
        &self.votes
    }

    /// Proposals broadcast so far.
    pub fn proposals(&self) -> &[Proposal] {
        &self.proposals
    }

    /// Whether some replica sent two different votes for one view of an epoch.
    pub fn has_double_vote(&self) -> bool {
        self.votes.iter().enumerate().any(|(i, (a, va))| {
            self.votes[i + 1..]
                .iter()
                .any(|(b, vb)| {
                    a == b
                        && va.epoch() == vb.epoch()
                        && va.view() == vb.view()
                        && va.vote_data != vb.vote_data
                })
        })
    }

    pub fn is_running(&self, i: usize) -> bool {
        self.nodes[i].manager.is_some()
    }

    /// Drop everything `node` sends.
    pub fn mute(&mut self, node: usize) {
        for other in 0..self.nodes.len() {
            if other != node {
                self.partitions.insert((node, other));
            }
        }
    }

    /// Drop everything `node` sends or receives.
    pub fn isolate(&mut self, node: usize) {
        for other in 0..self.nodes.len() {
            if other != node {
                self.partitions.insert((node, other));
                self.partitions.insert((other, node));
            }
        }
    }

    /// Drop everything sent to `node`.
    pub fn deafen(&mut self, node: usize) {
        for other in 0..self.nodes.len() {
            if other != node {
                self.partitions.insert((other, node));
            }
        }
    }

    /// Install a filter consulted for every message delivery.
    pub fn set_filter(&mut self, filter: MessageFilter) {
        self.filter = Some(filter);
    }

    pub fn clear_filter(&mut self) {
        self.filter = None;
    }

    pub fn heal(&mut self, node: usize) {
        self.partitions.retain(|(from, to)| *from != node && *to != node);
    }

    /// Stop a replica. Its persisted state survives.
    pub fn crash(&mut self, i: usize) {
        let node = &mut self.nodes[i];
        if let Some(manager) = node.manager.take() {
            node.epoch_state = manager.instance().epoch_state().clone();
        }
        node.generation += 1;
        node.network.take_sent();
        node.timers.take_scheduled();
        log::info!("Replica {} crashed at {:?}", i, self.now);
    }

    /// Boot a crashed replica from its storage.
    pub fn restart(&mut self, i: usize) {
        if self.nodes[i].manager.is_some() {
            return;
        }
        log::info!("Replica {} restarting at {:?}", i, self.now);
        self.boot(i);
    }

    /// Queue `message` from replica `from` to replica `to`, bypassing
    /// the sender's consensus state.
    pub fn inject(&mut self, from: usize, to: usize, message: ConsensusMessage) {
        let at = self.now + self.config.message_delay;
        self.push(at, SimEvent::Message { from, to, message });
    }

    fn push(&mut self, at: Duration, event: SimEvent) {
        let key = EventKey { at, seq: self.seq };
        self.seq += 1;
        self.queue.insert(key, event);
    }

    /// Move what replica `i` sent and scheduled into the queue.
    fn collect_outputs(&mut self, i: usize) {
        let sent = self.nodes[i].network.take_sent();
        let at = self.now + self.config.message_delay;
        for SentMessage { to, message } in sent {
            match &message {
                ConsensusMessage::Vote(vote) => self.votes.push((i, (**vote).clone())),
                ConsensusMessage::Proposal(proposal) => self.proposals.push((**proposal).clone()),
                _ => {}
            }
            match to {
                Some(author) => match self.index_of(&author) {
                    Some(to) => self.push(at, SimEvent::Message { from: i, to, message }),
                    None => log::warn!("Replica {} sent {} to unknown {}", i, message, author),
                },
                None => {
                    for to in 0..self.nodes.len() {
                        let message = message.clone();
                        self.push(at, SimEvent::Message { from: i, to, message });
                    }
                }
            }
        }

        let generation = self.nodes[i].generation;
        for (timer, after) in self.nodes[i].timers.take_scheduled() {
            let at = self.now + after;
            self.push(
                at,
                SimEvent::Timer {
                    node: i,
                    generation,
                    timer,
                },
            );
        }
    }

    fn index_of(&self, author: &Author) -> Option<usize> {
        self.nodes.iter().position(|n| n.signer.author() == *author)
    }

    /// Process the next queued event. Returns false when nothing is left.
    pub fn step(&mut self) -> bool {
        let Some((key, event)) = self.queue.pop_first() else {
            return false;
        };
        self.now = key.at;

        let (node, event) = match event {
            SimEvent::Message { from, to, message } => {
                let delivered = !self.partitions.contains(&(from, to))
                    && self.filter.as_mut().map_or(true, |f| f(from, to, &message));
                if !delivered {
                    self.dropped_messages += 1;
                    return true;
                }
                let sender = self.nodes[from].signer.author();
                (to, ConsensusEvent::message(sender, message))
            }
            SimEvent::Timer {
                node,
                generation,
                timer,
            } => {
                if generation != self.nodes[node].generation {
                    return true;
                }
                (node, ConsensusEvent::Timer(timer))
            }
        };

        let Some(manager) = self.nodes[node].manager.as_mut() else {
            return true;
        };
        if let Err(e) = manager.handle(event) {
            log::error!("Replica {} stopped: {}", node, e);
            self.errors.push((node, e.to_string()));
            self.crash(node);
            return true;
        }
        self.collect_outputs(node);
        true
    }

    /// Step until `condition` holds. Returns false if the queue drained or
    /// `max_steps` ran out first.
    pub fn run_until<F>(&mut self, max_steps: usize, mut condition: F) -> bool
    where
        F: FnMut(&SimulatedNetwork) -> bool,
    {
        for _ in 0..max_steps {
            if condition(self) {
                return true;
            }
            if !self.step() {
                return condition(self);
            }
        }
        condition(self)
    }

    /// Step until virtual time passes `duration` from now.
    pub fn run_for(&mut self, duration: Duration) {
        let until = self.now + duration;
        while let Some((key, _)) = self.queue.first_key_value() {
            if key.at > until {
                break;
            }
            self.step();
        }
        self.now = self.now.max(until);
    }

    /// Whether every pair of replicas committed the same vertex ids up to
    /// the shorter of their logs.
    pub fn commits_consistent(&self) -> bool {
        let logs: Vec<Vec<HashValue>> = (0..self.nodes.len()).map(|i| self.committed_ids(i)).collect();
        logs.iter().all(|a| {
            logs.iter().all(|b| {
                let n = a.len().min(b.len());
                a[..n] == b[..n]
            })
        })
    }

    /// Smallest number of committed vertices over the running replicas.
    pub fn min_committed(&self) -> usize {
        (0..self.nodes.len())
            .filter(|i| self.is_running(*i))
            .map(|i| self.nodes[i].executor.committed().len())
            .min()
            .unwrap_or(0)
    }
}
