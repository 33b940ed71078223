// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use consensus_traits::{
    Command, CommandExecutor, CommittedCommand, HashValue, LedgerHeader, Mempool, ValidatorInfo,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use super::lock;
use crate::types::View;

/// Deterministic ledger execution shared by the mock executor and the
/// certificate builder.
///
/// The accumulator chains blake3 over the parent accumulator and the
/// command; the version counts commands. With an epoch length set, every
/// header at or past that view announces `next_validators`.
pub(crate) fn mock_prepare(
    parent: &LedgerHeader,
    command: Option<&Command>,
    view: View,
    epoch_change: Option<&(View, Vec<ValidatorInfo>)>,
) -> LedgerHeader {
    let mut hasher = blake3::Hasher::new();
    hasher.update(parent.accumulator.as_bytes());
    hasher.update(&view.to_le_bytes());
    if let Some(command) = command {
        hasher.update(command.as_bytes());
    }
    let accumulator = HashValue(*hasher.finalize().as_bytes());

    let next_validators = match epoch_change {
        Some((epoch_length, validators)) if view >= *epoch_length => Some(validators.clone()),
        _ => None,
    };

    LedgerHeader {
        epoch: parent.epoch,
        view,
        version: parent.version + u64::from(command.is_some()),
        accumulator,
        next_validators,
    }
}

#[derive(Debug, Default)]
struct ExecutorLog {
    committed: Vec<CommittedCommand>,
    proofs: Vec<LedgerHeader>,
    prepared: usize,
    fail_commit: bool,
}

/// In-memory command executor recording everything committed.
///
/// Clones share the commit log, so a test can keep a handle while the
/// consensus instance owns another.
#[derive(Clone, Debug, Default)]
pub struct MockCommandExecutor {
    log: Arc<Mutex<ExecutorLog>>,
    epoch_change: Option<(View, Vec<ValidatorInfo>)>,
}

impl MockCommandExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// End every epoch at `epoch_length` views, handing over to `validators`.
    pub fn with_epoch_change(mut self, epoch_length: View, validators: Vec<ValidatorInfo>) -> Self {
        self.epoch_change = Some((epoch_length, validators));
        self
    }

    /// Make every following commit fail.
    pub fn set_fail_commit(&self, fail: bool) {
        lock(&self.log).fail_commit = fail;
    }

    pub fn committed(&self) -> Vec<CommittedCommand> {
        lock(&self.log).committed.clone()
    }

    /// Ids of committed vertices, in commit order.
    pub fn committed_ids(&self) -> Vec<HashValue> {
        lock(&self.log).committed.iter().map(|c| c.vertex_id).collect()
    }

    /// Ledger headers passed as commit proofs.
    pub fn proofs(&self) -> Vec<LedgerHeader> {
        lock(&self.log).proofs.clone()
    }

    pub fn prepared_count(&self) -> usize {
        lock(&self.log).prepared
    }
}

impl CommandExecutor for MockCommandExecutor {
    fn prepare(
        &mut self,
        parent: &LedgerHeader,
        command: Option<&Command>,
        view: View,
    ) -> consensus_traits::Result<LedgerHeader> {
        lock(&self.log).prepared += 1;
        Ok(mock_prepare(parent, command, view, self.epoch_change.as_ref()))
    }

    fn commit(
        &mut self,
        committed: &[CommittedCommand],
        proof: &LedgerHeader,
    ) -> consensus_traits::Result<()> {
        let mut log = lock(&self.log);
        if log.fail_commit {
            anyhow::bail!("injected commit failure");
        }
        log.committed.extend(committed.iter().cloned());
        log.proofs.push(proof.clone());
        Ok(())
    }
}

/// FIFO mempool. Clones share the queue.
#[derive(Clone, Debug, Default)]
pub struct MockMempool {
    commands: Arc<Mutex<VecDeque<Command>>>,
}

impl MockMempool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_commands(commands: impl IntoIterator<Item = Vec<u8>>) -> Self {
        let mempool = Self::new();
        for command in commands {
            mempool.push(command);
        }
        mempool
    }

    pub fn push(&self, command: Vec<u8>) {
        lock(&self.commands).push_back(Command::new(command));
    }

    pub fn len(&self) -> usize {
        lock(&self.commands).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Mempool for MockMempool {
    fn take_next_command(&mut self) -> Option<Command> {
        lock(&self.commands).pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use consensus_traits::Author;

    #[test]
    fn test_prepare_is_deterministic() {
        let parent = LedgerHeader::genesis(0, 0, HashValue::zero());
        let command = Command::new(vec![1, 2]);

        let mut a = MockCommandExecutor::new();
        let mut b = MockCommandExecutor::new();
        let ha = a.prepare(&parent, Some(&command), 1).unwrap();
        let hb = b.prepare(&parent, Some(&command), 1).unwrap();
        assert_eq!(ha, hb);
        assert_eq!(ha.version, 1);

        let empty = a.prepare(&parent, None, 1).unwrap();
        assert_ne!(empty.accumulator, ha.accumulator);
        assert_eq!(empty.version, 0);
        assert_eq!(a.prepared_count(), 2);
    }

    #[test]
    fn test_epoch_change_marks_header() {
        let parent = LedgerHeader::genesis(0, 0, HashValue::zero());
        let next = vec![ValidatorInfo::new(Author([1u8; 32]), 1)];
        let mut executor = MockCommandExecutor::new().with_epoch_change(3, next.clone());

        assert!(!executor.prepare(&parent, None, 2).unwrap().is_end_of_epoch());
        let header = executor.prepare(&parent, None, 3).unwrap();
        assert_eq!(header.next_validators, Some(next));
    }

    #[test]
    fn test_commit_log_is_shared() {
        let executor = MockCommandExecutor::new();
        let mut handle = executor.clone();
        let header = LedgerHeader::genesis(0, 0, HashValue::zero());
        let committed = CommittedCommand {
            vertex_id: HashValue([1u8; 32]),
            view: 1,
            command: None,
            header: header.clone(),
        };

        handle.commit(&[committed], &header).unwrap();
        assert_eq!(executor.committed_ids(), vec![HashValue([1u8; 32])]);

        executor.set_fail_commit(true);
        assert!(handle.commit(&[], &header).is_err());
    }

    #[test]
    fn test_mempool_fifo() {
        let mut mempool = MockMempool::with_commands(vec![vec![1], vec![2]]);
        assert_eq!(mempool.len(), 2);
        assert_eq!(mempool.take_next_command(), Some(Command::new(vec![1])));
        assert_eq!(mempool.take_next_command(), Some(Command::new(vec![2])));
        assert_eq!(mempool.take_next_command(), None);
        assert!(mempool.is_empty());
    }
}
