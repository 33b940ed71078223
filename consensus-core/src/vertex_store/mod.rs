// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! In-memory tree of uncommitted vertices.
//!
//! The store is rooted at the last committed vertex. Every other vertex
//! descends from it. Vertices are keyed by their content hash and linked to
//! their children so a commit can prune every branch that no longer
//! descends from the new root.
//!
//! # Commit rule
//!
//! A QC whose vote data carries a `committed` header (proposed, parent and
//! grandparent at consecutive views) finalizes that header's vertex and
//! every uncommitted ancestor, in view order.

use consensus_traits::{CommandExecutor, HashValue, LedgerHeader};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};

use crate::certificates::{HighQC, QuorumCertificate, TimeoutCertificate};
use crate::types::{Epoch, ExecutedVertex, Vertex, View};

/// Invariant breaks detected by the store. All of them are fatal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VertexStoreError {
    #[error("Committed vertex {0} is not in the store")]
    MissingCommittedVertex(HashValue),

    #[error("Invalid checkpoint: {0}")]
    InvalidCheckpoint(String),
}

/// Outcome of inserting a vertex.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InsertResult {
    Inserted(ExecutedVertex),
    AlreadyPresent(ExecutedVertex),
    MissingParent { parent_id: HashValue },
    Rejected(String),
}

/// Outcome of adding a QC.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QcInsertResult {
    /// The certified vertex is not in the store
    MissingVertex,
    /// The QC commits a vertex other than the root at the root's view.
    /// Nothing was changed.
    ConflictingCommit { view: View, committed: HashValue },
    Added {
        /// The QC raised the highest QC
        new_high_qc: bool,
        /// Vertices finalized by this QC, oldest first
        committed: Vec<ExecutedVertex>,
    },
}

/// Everything needed to rebuild the store after a restart.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VertexStoreCheckpoint {
    pub root: Vertex,
    pub root_header: LedgerHeader,
    /// Uncommitted vertices, parents before children
    pub vertices: Vec<(Vertex, LedgerHeader)>,
    pub high_qc: HighQC,
}

pub struct VertexStore {
    root: ExecutedVertex,
    vertices: HashMap<HashValue, ExecutedVertex>,
    children: HashMap<HashValue, HashSet<HashValue>>,
    highest_qc: QuorumCertificate,
    highest_committed_qc: QuorumCertificate,
    highest_tc: Option<TimeoutCertificate>,
}

impl VertexStore {
    /// Create a store rooted at `root`, the vertex committed by
    /// `high_qc.highest_committed_qc()`.
    pub fn new(root: ExecutedVertex, high_qc: HighQC) -> Self {
        let mut children = HashMap::new();
        children.insert(root.id(), HashSet::new());
        Self {
            root,
            vertices: HashMap::new(),
            children,
            highest_qc: high_qc.highest_qc().clone(),
            highest_committed_qc: high_qc.highest_committed_qc().clone(),
            highest_tc: high_qc.highest_tc().cloned(),
        }
    }

    /// Store of a fresh epoch rooted at its genesis vertex.
    pub fn genesis(genesis_header: LedgerHeader) -> Self {
        let root = ExecutedVertex::genesis(genesis_header);
        let genesis_qc = QuorumCertificate::genesis(&root);
        Self::new(root, HighQC::genesis(genesis_qc))
    }

    pub fn root(&self) -> &ExecutedVertex {
        &self.root
    }

    pub fn epoch(&self) -> Epoch {
        self.root.epoch()
    }

    /// Number of uncommitted vertices.
    pub fn len(&self) -> usize {
        self.vertices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    pub fn contains(&self, id: &HashValue) -> bool {
        self.root.id() == *id || self.vertices.contains_key(id)
    }

    pub fn get(&self, id: &HashValue) -> Option<&ExecutedVertex> {
        if self.root.id() == *id {
            Some(&self.root)
        } else {
            self.vertices.get(id)
        }
    }

    pub fn high_qc(&self) -> HighQC {
        HighQC::new(
            self.highest_qc.clone(),
            self.highest_committed_qc.clone(),
            self.highest_tc.clone(),
        )
    }

    pub fn highest_qc(&self) -> &QuorumCertificate {
        &self.highest_qc
    }

    pub fn highest_tc(&self) -> Option<&TimeoutCertificate> {
        self.highest_tc.as_ref()
    }

    /// Execute and insert a vertex whose parent is in the store.
    pub fn insert_vertex<E>(&mut self, vertex: Vertex, executor: &mut E) -> InsertResult
    where
        E: CommandExecutor + ?Sized,
    {
        let id = vertex.id();
        if let Some(existing) = self.get(&id) {
            return InsertResult::AlreadyPresent(existing.clone());
        }
        if vertex.epoch != self.epoch() {
            return InsertResult::Rejected(format!(
                "vertex epoch {} in store of epoch {}",
                vertex.epoch,
                self.epoch()
            ));
        }
        if vertex.is_genesis() {
            return InsertResult::Rejected("genesis vertex cannot be inserted".to_string());
        }
        if vertex.view <= self.root.view() {
            return InsertResult::Rejected(format!(
                "vertex view {} not above root view {}",
                vertex.view,
                self.root.view()
            ));
        }

        let parent_id = vertex.parent_id();
        let parent = match self.get(&parent_id) {
            Some(parent) => parent,
            None => return InsertResult::MissingParent { parent_id },
        };
        if parent.view() >= vertex.view {
            return InsertResult::Rejected(format!(
                "vertex view {} not above parent view {}",
                vertex.view,
                parent.view()
            ));
        }

        let ledger_header = if parent.ledger_header().is_end_of_epoch() {
            if vertex.command.is_some() {
                return InsertResult::Rejected(
                    "vertex after end of epoch must not carry a command".to_string(),
                );
            }
            parent.ledger_header().clone()
        } else {
            match executor.prepare(parent.ledger_header(), vertex.command.as_ref(), vertex.view) {
                Ok(header) => header,
                Err(e) => return InsertResult::Rejected(format!("execution failed: {}", e)),
            }
        };

        let executed = ExecutedVertex::new(vertex, ledger_header);
        self.insert_executed(executed.clone());
        log::debug!("Inserted {}", executed);
        InsertResult::Inserted(executed)
    }

    fn insert_executed(&mut self, executed: ExecutedVertex) {
        let id = executed.id();
        self.children
            .entry(executed.parent_id())
            .or_default()
            .insert(id);
        self.children.entry(id).or_default();
        self.vertices.insert(id, executed);
    }

    /// Add a QC, raising the highest QC and committing when it carries a
    /// commit proof.
    pub fn add_qc(&mut self, qc: &QuorumCertificate) -> Result<QcInsertResult, VertexStoreError> {
        if !self.contains(&qc.certified_vertex_id()) {
            return Ok(QcInsertResult::MissingVertex);
        }
        if let Some(header) = qc.committed() {
            if header.view == self.root.view() && header.vertex_id != self.root.id() {
                return Ok(QcInsertResult::ConflictingCommit {
                    view: header.view,
                    committed: header.vertex_id,
                });
            }
        }

        let new_high_qc = qc.view() > self.highest_qc.view();
        if new_high_qc {
            self.highest_qc = qc.clone();
        }

        let committed = match qc.committed() {
            Some(header) => self.commit(header.view, header.vertex_id, qc)?,
            None => Vec::new(),
        };

        Ok(QcInsertResult::Added {
            new_high_qc,
            committed,
        })
    }

    fn commit(
        &mut self,
        view: View,
        vertex_id: HashValue,
        commit_qc: &QuorumCertificate,
    ) -> Result<Vec<ExecutedVertex>, VertexStoreError> {
        if view <= self.root.view() {
            return Ok(Vec::new());
        }

        let path = self.path_from_root(&vertex_id);
        let new_root = match path.last() {
            Some(last) if last.id() == vertex_id => last.clone(),
            _ => return Err(VertexStoreError::MissingCommittedVertex(vertex_id)),
        };

        self.root = new_root;
        self.highest_committed_qc = commit_qc.clone();
        if self.highest_committed_qc.view() > self.highest_qc.view() {
            self.highest_qc = self.highest_committed_qc.clone();
        }
        self.prune();

        log::info!(
            "Committed {} vertices up to {} (store size {})",
            path.len(),
            self.root,
            self.vertices.len()
        );
        Ok(path)
    }

    /// Keep only the root's descendants.
    fn prune(&mut self) {
        let root_id = self.root.id();
        let mut keep = HashSet::new();
        let mut queue = VecDeque::from([root_id]);
        while let Some(id) = queue.pop_front() {
            if let Some(children) = self.children.get(&id) {
                queue.extend(children.iter().copied());
            }
            keep.insert(id);
        }

        self.vertices.retain(|id, _| *id != root_id && keep.contains(id));
        self.children.retain(|id, _| keep.contains(id));
    }

    /// Uncommitted ancestors of `id` (inclusive), oldest first. Empty when
    /// `id` does not lead back to the root.
    pub fn path_from_root(&self, id: &HashValue) -> Vec<ExecutedVertex> {
        let mut path = Vec::new();
        let mut next = *id;
        while let Some(vertex) = self.vertices.get(&next) {
            path.push(vertex.clone());
            next = vertex.parent_id();
        }
        if next != self.root.id() {
            return Vec::new();
        }
        path.reverse();
        path
    }

    pub fn insert_timeout_certificate(&mut self, tc: &TimeoutCertificate) -> bool {
        let higher = self
            .highest_tc
            .as_ref()
            .map(|current| tc.view() > current.view())
            .unwrap_or(true);
        if higher {
            self.highest_tc = Some(tc.clone());
        }
        higher
    }

    /// Up to `count` vertices ending at `id`, newest first, walking parents
    /// down to the root. `None` if `id` is unknown.
    pub fn get_vertices(&self, id: &HashValue, count: usize) -> Option<Vec<Vertex>> {
        let first = self.get(id)?;
        let mut vertices = vec![first.vertex().clone()];
        let mut next = first.parent_id();
        while vertices.len() < count {
            match self.get(&next) {
                Some(vertex) if !vertex.vertex().is_genesis() => {
                    vertices.push(vertex.vertex().clone());
                    next = vertex.parent_id();
                }
                _ => break,
            }
        }
        Some(vertices)
    }

    pub fn checkpoint(&self) -> VertexStoreCheckpoint {
        let mut vertices = Vec::with_capacity(self.vertices.len());
        let mut queue = VecDeque::from([self.root.id()]);
        while let Some(id) = queue.pop_front() {
            let Some(children) = self.children.get(&id) else {
                continue;
            };
            let mut children: Vec<_> = children.iter().filter_map(|c| self.vertices.get(c)).collect();
            children.sort_by_key(|c| (c.view(), c.id()));
            for child in children {
                vertices.push((child.vertex().clone(), child.ledger_header().clone()));
                queue.push_back(child.id());
            }
        }

        VertexStoreCheckpoint {
            root: self.root.vertex().clone(),
            root_header: self.root.ledger_header().clone(),
            vertices,
            high_qc: self.high_qc(),
        }
    }

    /// Rebuild a store from a checkpoint.
    pub fn from_checkpoint(checkpoint: VertexStoreCheckpoint) -> Result<Self, VertexStoreError> {
        let root = ExecutedVertex::new(checkpoint.root, checkpoint.root_header);
        if let Some(committed) = checkpoint.high_qc.highest_committed_qc().committed() {
            if committed.vertex_id != root.id() {
                return Err(VertexStoreError::InvalidCheckpoint(format!(
                    "root {} is not the committed vertex {}",
                    root.id().short_str(),
                    committed.vertex_id.short_str()
                )));
            }
        }

        let mut store = Self::new(root, checkpoint.high_qc);
        for (vertex, header) in checkpoint.vertices {
            let executed = ExecutedVertex::new(vertex, header);
            if !store.contains(&executed.parent_id()) || executed.epoch() != store.epoch() {
                return Err(VertexStoreError::InvalidCheckpoint(format!(
                    "vertex {} does not extend the stored tree",
                    executed
                )));
            }
            store.insert_executed(executed);
        }

        if !store.contains(&store.highest_qc.certified_vertex_id()) {
            return Err(VertexStoreError::InvalidCheckpoint(
                "highest qc certifies an unknown vertex".to_string(),
            ));
        }
        Ok(store)
    }
}
