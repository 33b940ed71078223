// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Event counters for a consensus replica.
//!
//! Counters are plain atomics shared through an `Arc` so that an embedding
//! node can export them however it likes. Liveness stalls (no commits, many
//! local timeouts, abandoned syncs) show up here rather than as errors.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters updated by the consensus instance and epoch manager.
#[derive(Debug, Default)]
pub struct ConsensusCounters {
    pub proposals_sent: AtomicU64,
    pub proposals_received: AtomicU64,
    pub votes_sent: AtomicU64,
    pub votes_received: AtomicU64,
    pub timeouts_sent: AtomicU64,
    pub timeouts_received: AtomicU64,
    pub quorum_certificates: AtomicU64,
    pub timeout_certificates: AtomicU64,
    /// Local view timers that fired
    pub local_timeouts: AtomicU64,
    pub vertices_committed: AtomicU64,
    pub sync_requests: AtomicU64,
    pub sync_timeouts: AtomicU64,
    pub syncs_completed: AtomicU64,
    pub syncs_abandoned: AtomicU64,
    /// Sync triggers folded into an existing sync or refused by backpressure
    pub syncs_deferred: AtomicU64,
    pub rejected_messages: AtomicU64,
    pub equivocations: AtomicU64,
    pub stale_epoch_messages: AtomicU64,
    pub buffered_epoch_messages: AtomicU64,
    pub dropped_epoch_messages: AtomicU64,
    /// Committed headers from a later epoch seen while behind
    pub ledger_sync_required: AtomicU64,
    pub epoch_changes: AtomicU64,
}

/// Point-in-time copy of [`ConsensusCounters`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountersSnapshot {
    pub proposals_sent: u64,
    pub proposals_received: u64,
    pub votes_sent: u64,
    pub votes_received: u64,
    pub timeouts_sent: u64,
    pub timeouts_received: u64,
    pub quorum_certificates: u64,
    pub timeout_certificates: u64,
    pub local_timeouts: u64,
    pub vertices_committed: u64,
    pub sync_requests: u64,
    pub sync_timeouts: u64,
    pub syncs_completed: u64,
    pub syncs_abandoned: u64,
    pub syncs_deferred: u64,
    pub rejected_messages: u64,
    pub equivocations: u64,
    pub stale_epoch_messages: u64,
    pub buffered_epoch_messages: u64,
    pub dropped_epoch_messages: u64,
    pub ledger_sync_required: u64,
    pub epoch_changes: u64,
}

impl ConsensusCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a counter by one.
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment a counter by `n`.
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        let read = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CountersSnapshot {
            proposals_sent: read(&self.proposals_sent),
            proposals_received: read(&self.proposals_received),
            votes_sent: read(&self.votes_sent),
            votes_received: read(&self.votes_received),
            timeouts_sent: read(&self.timeouts_sent),
            timeouts_received: read(&self.timeouts_received),
            quorum_certificates: read(&self.quorum_certificates),
            timeout_certificates: read(&self.timeout_certificates),
            local_timeouts: read(&self.local_timeouts),
            vertices_committed: read(&self.vertices_committed),
            sync_requests: read(&self.sync_requests),
            sync_timeouts: read(&self.sync_timeouts),
            syncs_completed: read(&self.syncs_completed),
            syncs_abandoned: read(&self.syncs_abandoned),
            syncs_deferred: read(&self.syncs_deferred),
            rejected_messages: read(&self.rejected_messages),
            equivocations: read(&self.equivocations),
            stale_epoch_messages: read(&self.stale_epoch_messages),
            buffered_epoch_messages: read(&self.buffered_epoch_messages),
            dropped_epoch_messages: read(&self.dropped_epoch_messages),
            ledger_sync_required: read(&self.ledger_sync_required),
            epoch_changes: read(&self.epoch_changes),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_counters_start_at_zero() {
        let counters = ConsensusCounters::new();
        assert_eq!(counters.snapshot(), CountersSnapshot::default());
    }

    #[test]
    fn test_shared_increments() {
        let counters = Arc::new(ConsensusCounters::new());
        let other = counters.clone();

        ConsensusCounters::inc(&counters.votes_sent);
        ConsensusCounters::inc(&other.votes_sent);
        ConsensusCounters::add(&other.vertices_committed, 3);

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.votes_sent, 2);
        assert_eq!(snapshot.vertices_committed, 3);
        assert_eq!(snapshot.votes_received, 0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let counters = ConsensusCounters::new();
        ConsensusCounters::inc(&counters.epoch_changes);
        let json = serde_json::to_string(&counters.snapshot()).unwrap();
        assert!(json.contains("\"epoch_changes\":1"));
    }
}
