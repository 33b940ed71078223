// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use consensus_traits::{Author, Network};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::lock;
use crate::consensus::{LocalTimer, TimerScheduler};
use crate::network::ConsensusMessage;

/// A message handed to the network. `to` is `None` for a broadcast.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SentMessage {
    pub to: Option<Author>,
    pub message: ConsensusMessage,
}

/// Network that records outbound messages. Clones share the record.
#[derive(Clone, Debug, Default)]
pub struct MockNetwork {
    sent: Arc<Mutex<Vec<SentMessage>>>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        lock(&self.sent).clone()
    }

    /// Drain the recorded messages.
    pub fn take_sent(&self) -> Vec<SentMessage> {
        std::mem::take(&mut *lock(&self.sent))
    }

    pub fn broadcasts(&self) -> Vec<ConsensusMessage> {
        lock(&self.sent)
            .iter()
            .filter(|m| m.to.is_none())
            .map(|m| m.message.clone())
            .collect()
    }
}

impl Network<ConsensusMessage> for MockNetwork {
    fn send(&self, peer: &Author, message: ConsensusMessage) {
        lock(&self.sent).push(SentMessage {
            to: Some(*peer),
            message,
        });
    }

    fn broadcast(&self, message: ConsensusMessage) {
        lock(&self.sent).push(SentMessage { to: None, message });
    }
}

/// Timer scheduler that records requested timers. Clones share the record.
#[derive(Clone, Debug, Default)]
pub struct MockTimers {
    scheduled: Arc<Mutex<Vec<(LocalTimer, Duration)>>>,
}

impl MockTimers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scheduled(&self) -> Vec<(LocalTimer, Duration)> {
        lock(&self.scheduled).clone()
    }

    /// Drain the recorded timers.
    pub fn take_scheduled(&self) -> Vec<(LocalTimer, Duration)> {
        std::mem::take(&mut *lock(&self.scheduled))
    }
}

impl TimerScheduler for MockTimers {
    fn schedule(&mut self, timer: LocalTimer, after: Duration) {
        lock(&self.scheduled).push((timer, after));
    }
}
