// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Common types used throughout the consensus algorithm

use consensus_traits::{Author, Command, HashValue, LedgerHeader};
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc};

use crate::certificates::{QuorumCertificate, TimeoutCertificate};
use crate::crypto::{domain, hash_of};

/// A view number in the consensus protocol
///
/// Views increment monotonically within an epoch. Each view has a designated leader
/// who is responsible for creating a vertex proposal for that view.
pub type View = u64;

/// An epoch number in the consensus protocol
///
/// Epochs represent reconfiguration boundaries. Validator set changes happen
/// only at epoch boundaries, through a committed epoch-change command.
pub type Epoch = u64;

/// The genesis view number (always 0)
pub const GENESIS_VIEW: View = 0;

/// The genesis epoch number (always 0)
pub const GENESIS_EPOCH: Epoch = 0;

/// A vertex as certified by a vote: its view, id and the ledger state it
/// produces.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BftHeader {
    pub view: View,
    pub vertex_id: HashValue,
    pub ledger_header: LedgerHeader,
}

impl BftHeader {
    pub fn new(view: View, vertex_id: HashValue, ledger_header: LedgerHeader) -> Self {
        Self {
            view,
            vertex_id,
            ledger_header,
        }
    }

    pub fn epoch(&self) -> Epoch {
        self.ledger_header.epoch
    }
}

impl fmt::Display for BftHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.vertex_id.short_str(), self.view)
    }
}

/// Exactly what a vote certifies.
///
/// `committed` is present when proposed, parent and grandparent have
/// consecutive views. A quorum certificate over such vote data is proof that
/// the grandparent (and everything below it) is committed.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VoteData {
    pub proposed: BftHeader,
    pub parent: BftHeader,
    pub committed: Option<BftHeader>,
}

impl VoteData {
    pub fn new(proposed: BftHeader, parent: BftHeader, committed: Option<BftHeader>) -> Self {
        Self {
            proposed,
            parent,
            committed,
        }
    }

    pub fn epoch(&self) -> Epoch {
        self.proposed.epoch()
    }

    pub fn view(&self) -> View {
        self.proposed.view
    }

    /// Digest signed by voters.
    pub fn digest(&self) -> HashValue {
        hash_of(domain::VOTE_DATA, self)
    }
}

/// A proposal for a view: a command extending the vertex certified by `qc`.
///
/// A vertex either directly follows its QC (`qc.view + 1 == view`) or
/// carries the timeout certificate of the previous view.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Vertex {
    pub epoch: Epoch,
    pub view: View,
    /// Certificate of the parent vertex
    pub qc: QuorumCertificate,
    /// Timeout certificate for `view - 1` when the parent is not at `view - 1`
    pub tc: Option<TimeoutCertificate>,
    /// Leader who proposed the vertex; `None` only for genesis
    pub proposer: Option<Author>,
    pub command: Option<Command>,
}

impl Vertex {
    /// The root vertex of an epoch.
    pub fn genesis(ledger_header: &LedgerHeader) -> Self {
        let pre_genesis = BftHeader::new(GENESIS_VIEW, HashValue::zero(), ledger_header.clone());
        Self {
            epoch: ledger_header.epoch,
            view: GENESIS_VIEW,
            qc: QuorumCertificate::pre_genesis(pre_genesis),
            tc: None,
            proposer: None,
            command: None,
        }
    }

    pub fn new_proposal(
        qc: QuorumCertificate,
        tc: Option<TimeoutCertificate>,
        view: View,
        proposer: Author,
        command: Option<Command>,
    ) -> Self {
        Self {
            epoch: qc.epoch(),
            view,
            qc,
            tc,
            proposer: Some(proposer),
            command,
        }
    }

    /// Content hash identifying this vertex.
    pub fn id(&self) -> HashValue {
        hash_of(domain::VERTEX, self)
    }

    pub fn parent_id(&self) -> HashValue {
        self.qc.certified_vertex_id()
    }

    pub fn parent_view(&self) -> View {
        self.qc.view()
    }

    pub fn is_genesis(&self) -> bool {
        self.view == GENESIS_VIEW
    }

    /// View of the certificate justifying this vertex's view.
    pub fn justify_view(&self) -> View {
        match &self.tc {
            Some(tc) => tc.view().max(self.qc.view()),
            None => self.qc.view(),
        }
    }
}

/// A vertex together with the ledger header produced by executing it.
///
/// The header is computed locally by every replica so that a vote certifies
/// both the vertex and the resulting ledger state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutedVertex {
    id: HashValue,
    vertex: Arc<Vertex>,
    ledger_header: LedgerHeader,
}

impl ExecutedVertex {
    pub fn new(vertex: Vertex, ledger_header: LedgerHeader) -> Self {
        let id = vertex.id();
        Self {
            id,
            vertex: Arc::new(vertex),
            ledger_header,
        }
    }

    /// The executed root of an epoch.
    pub fn genesis(ledger_header: LedgerHeader) -> Self {
        Self::new(Vertex::genesis(&ledger_header), ledger_header)
    }

    pub fn id(&self) -> HashValue {
        self.id
    }

    pub fn vertex(&self) -> &Vertex {
        &self.vertex
    }

    pub fn view(&self) -> View {
        self.vertex.view
    }

    pub fn epoch(&self) -> Epoch {
        self.vertex.epoch
    }

    pub fn parent_id(&self) -> HashValue {
        self.vertex.parent_id()
    }

    pub fn qc(&self) -> &QuorumCertificate {
        &self.vertex.qc
    }

    pub fn command(&self) -> Option<&Command> {
        self.vertex.command.as_ref()
    }

    pub fn ledger_header(&self) -> &LedgerHeader {
        &self.ledger_header
    }

    pub fn header(&self) -> BftHeader {
        BftHeader::new(self.view(), self.id, self.ledger_header.clone())
    }

    /// The vote data a replica signs when voting for this vertex.
    pub fn vote_data(&self) -> VoteData {
        let proposed = self.header();
        let parent = self.qc().proposed().clone();
        let grandparent = self.qc().parent();

        let direct = parent.view + 1 == proposed.view && grandparent.view + 1 == parent.view;
        let committed = if direct {
            Some(grandparent.clone())
        } else {
            None
        };

        VoteData::new(proposed, parent, committed)
    }
}

impl fmt::Display for ExecutedVertex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Vertex(id={}, epoch={}, view={}, parent={}@{})",
            self.id.short_str(),
            self.epoch(),
            self.view(),
            self.parent_id().short_str(),
            self.qc().view()
        )
    }
}
