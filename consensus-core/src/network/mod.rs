// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Consensus wire messages.
//!
//! Every message carries the epoch it belongs to so the epoch manager can
//! route it (or drop/buffer it) before any signature is checked. Messages are
//! encoded with bincode.

use consensus_traits::{Author, HashValue, LedgerHeader, VerifyError};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::certificates::{timeout_digest, HighQC};
use crate::crypto::{domain, hash_of, verify_signature, ConsensusSignature, ValidatorSigner};
use crate::epoch_manager::EpochState;
use crate::types::{Epoch, Vertex, View, VoteData};

/// Digest a leader signs when proposing a vertex.
pub fn proposal_digest(vertex_id: &HashValue) -> HashValue {
    hash_of(domain::PROPOSAL, vertex_id)
}

fn check_member(epoch_state: &EpochState, author: &Author) -> Result<(), VerifyError> {
    if epoch_state.validators().contains(author) {
        Ok(())
    } else {
        Err(VerifyError::UnknownAuthor(*author))
    }
}

fn check_epoch(epoch_state: &EpochState, epoch: Epoch) -> Result<(), VerifyError> {
    if epoch == epoch_state.epoch() {
        Ok(())
    } else {
        Err(VerifyError::EpochMismatch {
            expected: epoch_state.epoch(),
            actual: epoch,
        })
    }
}

/// A leader's proposal for a view.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub vertex: Vertex,
    /// Leader's view of the highest certificates
    pub high_qc: HighQC,
    pub sender: Author,
    pub signature: ConsensusSignature,
}

impl Proposal {
    pub fn new(vertex: Vertex, high_qc: HighQC, signer: &ValidatorSigner) -> Self {
        let signature = signer.sign(&proposal_digest(&vertex.id()));
        Self {
            vertex,
            high_qc,
            sender: signer.author(),
            signature,
        }
    }

    pub fn epoch(&self) -> Epoch {
        self.vertex.epoch
    }

    pub fn view(&self) -> View {
        self.vertex.view
    }

    /// Verify the proposal and the certificates it carries.
    ///
    /// Whether the sender is the leader of the view is checked by the caller,
    /// which owns the proposer election.
    pub fn verify(&self, epoch_state: &EpochState) -> Result<(), VerifyError> {
        check_epoch(epoch_state, self.vertex.epoch)?;
        check_member(epoch_state, &self.sender)?;
        if self.vertex.proposer != Some(self.sender) {
            return Err(VerifyError::MalformedCertificate(
                "proposal sender is not the vertex proposer".to_string(),
            ));
        }
        if self.vertex.is_genesis() || self.vertex.view <= self.vertex.qc.view() {
            return Err(VerifyError::MalformedCertificate(format!(
                "vertex view {} does not extend its qc view {}",
                self.vertex.view,
                self.vertex.qc.view()
            )));
        }
        if let Some(tc) = &self.vertex.tc {
            if tc.view() >= self.vertex.view {
                return Err(VerifyError::MalformedCertificate(format!(
                    "tc view {} not below vertex view {}",
                    tc.view(),
                    self.vertex.view
                )));
            }
        }

        verify_signature(
            &self.sender,
            &proposal_digest(&self.vertex.id()),
            &self.signature,
        )?;
        self.vertex.qc.verify(epoch_state)?;
        if let Some(tc) = &self.vertex.tc {
            tc.verify(epoch_state)?;
        }
        self.high_qc.verify(epoch_state)
    }
}

/// A validator's vote for a vertex.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Vote {
    pub vote_data: VoteData,
    pub sender: Author,
    pub signature: ConsensusSignature,
    pub high_qc: HighQC,
}

impl Vote {
    pub fn new(vote_data: VoteData, high_qc: HighQC, signer: &ValidatorSigner) -> Self {
        let signature = signer.sign(&vote_data.digest());
        Self {
            vote_data,
            sender: signer.author(),
            signature,
            high_qc,
        }
    }

    pub fn epoch(&self) -> Epoch {
        self.vote_data.epoch()
    }

    pub fn view(&self) -> View {
        self.vote_data.view()
    }

    pub fn verify(&self, epoch_state: &EpochState) -> Result<(), VerifyError> {
        check_epoch(epoch_state, self.epoch())?;
        check_member(epoch_state, &self.sender)?;
        verify_signature(&self.sender, &self.vote_data.digest(), &self.signature)?;
        self.high_qc.verify(epoch_state)
    }
}

/// A validator's signed statement that it gave up on a view.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeoutVote {
    pub epoch: Epoch,
    pub view: View,
    pub sender: Author,
    pub signature: ConsensusSignature,
    pub high_qc: HighQC,
}

impl TimeoutVote {
    pub fn new(epoch: Epoch, view: View, high_qc: HighQC, signer: &ValidatorSigner) -> Self {
        Self {
            epoch,
            view,
            sender: signer.author(),
            signature: signer.sign(&timeout_digest(epoch, view)),
            high_qc,
        }
    }

    pub fn verify(&self, epoch_state: &EpochState) -> Result<(), VerifyError> {
        check_epoch(epoch_state, self.epoch)?;
        check_member(epoch_state, &self.sender)?;
        verify_signature(
            &self.sender,
            &timeout_digest(self.epoch, self.view),
            &self.signature,
        )?;
        self.high_qc.verify(epoch_state)
    }
}

/// Ask a peer for `count` vertices ending at `vertex_id`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetVerticesRequest {
    pub epoch: Epoch,
    pub vertex_id: HashValue,
    pub count: u64,
}

/// Vertices ending at the requested id, newest first.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetVerticesResponse {
    pub epoch: Epoch,
    pub vertices: Vec<Vertex>,
}

/// The responder does not have the requested vertices.
///
/// It still tells the requester where its own chain is.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetVerticesErrorResponse {
    pub epoch: Epoch,
    pub vertex_id: HashValue,
    pub high_qc: HighQC,
}

/// Announces the latest committed ledger header, sent on epoch change.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerStatusUpdate {
    pub header: LedgerHeader,
}

/// Every message exchanged between replicas.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsensusMessage {
    Proposal(Box<Proposal>),
    Vote(Box<Vote>),
    Timeout(Box<TimeoutVote>),
    GetVerticesRequest(GetVerticesRequest),
    GetVerticesResponse(GetVerticesResponse),
    GetVerticesError(Box<GetVerticesErrorResponse>),
    LedgerStatus(LedgerStatusUpdate),
}

impl ConsensusMessage {
    pub fn epoch(&self) -> Epoch {
        match self {
            ConsensusMessage::Proposal(p) => p.epoch(),
            ConsensusMessage::Vote(v) => v.epoch(),
            ConsensusMessage::Timeout(t) => t.epoch,
            ConsensusMessage::GetVerticesRequest(r) => r.epoch,
            ConsensusMessage::GetVerticesResponse(r) => r.epoch,
            ConsensusMessage::GetVerticesError(r) => r.epoch,
            ConsensusMessage::LedgerStatus(u) => u.header.epoch,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ConsensusMessage::Proposal(_) => "proposal",
            ConsensusMessage::Vote(_) => "vote",
            ConsensusMessage::Timeout(_) => "timeout",
            ConsensusMessage::GetVerticesRequest(_) => "get_vertices_request",
            ConsensusMessage::GetVerticesResponse(_) => "get_vertices_response",
            ConsensusMessage::GetVerticesError(_) => "get_vertices_error",
            ConsensusMessage::LedgerStatus(_) => "ledger_status",
        }
    }

    pub fn to_bytes(&self) -> anyhow::Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

impl fmt::Display for ConsensusMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsensusMessage::Proposal(p) => write!(
                f,
                "Proposal(view={}, vertex={}, from={})",
                p.view(),
                p.vertex.id().short_str(),
                p.sender
            ),
            ConsensusMessage::Vote(v) => write!(
                f,
                "Vote(view={}, vertex={}, from={})",
                v.view(),
                v.vote_data.proposed.vertex_id.short_str(),
                v.sender
            ),
            ConsensusMessage::Timeout(t) => {
                write!(f, "Timeout(view={}, from={})", t.view, t.sender)
            }
            ConsensusMessage::GetVerticesRequest(r) => write!(
                f,
                "GetVertices(vertex={}, count={})",
                r.vertex_id.short_str(),
                r.count
            ),
            ConsensusMessage::GetVerticesResponse(r) => {
                write!(f, "GetVerticesResponse(count={})", r.vertices.len())
            }
            ConsensusMessage::GetVerticesError(r) => {
                write!(f, "GetVerticesError(vertex={})", r.vertex_id.short_str())
            }
            ConsensusMessage::LedgerStatus(u) => write!(
                f,
                "LedgerStatus(epoch={}, version={})",
                u.header.epoch, u.header.version
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certificates::QuorumCertificate;
    use crate::testing::{make_epoch_state, make_signers, QcBuilder};
    use consensus_traits::Command;

    #[test]
    fn test_proposal_verify() {
        let signers = make_signers(4);
        let epoch_state = make_epoch_state(0, &signers);
        let builder = QcBuilder::new(&signers, epoch_state.validators(), 0);
        let v1 = builder.extend_genesis(1);
        let qc1 = builder.certify(&v1);
        let high_qc = HighQC::new(qc1.clone(), builder.genesis_qc(), None);

        let vertex = Vertex::new_proposal(qc1, None, 2, signers[1].author(), None);
        let proposal = Proposal::new(vertex, high_qc, &signers[1]);
        assert!(proposal.verify(&epoch_state).is_ok());
    }

    #[test]
    fn test_proposal_from_non_proposer_rejected() {
        let signers = make_signers(4);
        let epoch_state = make_epoch_state(0, &signers);
        let builder = QcBuilder::new(&signers, epoch_state.validators(), 0);
        let genesis_qc = builder.genesis_qc();

        let vertex = Vertex::new_proposal(genesis_qc.clone(), None, 1, signers[1].author(), None);
        let proposal = Proposal::new(vertex, HighQC::genesis(genesis_qc), &signers[2]);
        assert!(matches!(
            proposal.verify(&epoch_state),
            Err(VerifyError::MalformedCertificate(_))
        ));
    }

    #[test]
    fn test_tampered_proposal_rejected() {
        let signers = make_signers(4);
        let epoch_state = make_epoch_state(0, &signers);
        let builder = QcBuilder::new(&signers, epoch_state.validators(), 0);
        let genesis_qc = builder.genesis_qc();

        let vertex = Vertex::new_proposal(
            genesis_qc.clone(),
            None,
            1,
            signers[1].author(),
            Some(Command::new(vec![1])),
        );
        let mut proposal = Proposal::new(vertex, HighQC::genesis(genesis_qc), &signers[1]);
        proposal.vertex.command = Some(Command::new(vec![2]));

        assert_eq!(
            proposal.verify(&epoch_state),
            Err(VerifyError::InvalidSignature(signers[1].author()))
        );
    }

    #[test]
    fn test_vote_verify() {
        let signers = make_signers(4);
        let epoch_state = make_epoch_state(0, &signers);
        let builder = QcBuilder::new(&signers, epoch_state.validators(), 0);
        let v1 = builder.extend_genesis(1);

        let vote = Vote::new(v1.vote_data(), builder.genesis_high_qc(), &signers[0]);
        assert!(vote.verify(&epoch_state).is_ok());

        let outsider = make_signers(5).pop().unwrap();
        let vote = Vote::new(v1.vote_data(), builder.genesis_high_qc(), &outsider);
        assert_eq!(
            vote.verify(&epoch_state),
            Err(VerifyError::UnknownAuthor(outsider.author()))
        );
    }

    #[test]
    fn test_timeout_vote_verify() {
        let signers = make_signers(4);
        let epoch_state = make_epoch_state(0, &signers);
        let builder = QcBuilder::new(&signers, epoch_state.validators(), 0);

        let mut timeout = TimeoutVote::new(0, 3, builder.genesis_high_qc(), &signers[2]);
        assert!(timeout.verify(&epoch_state).is_ok());

        timeout.view = 4;
        assert!(timeout.verify(&epoch_state).is_err());
    }

    #[test]
    fn test_message_epoch_and_encoding() {
        let signers = make_signers(4);
        let epoch_state = make_epoch_state(0, &signers);
        let builder = QcBuilder::new(&signers, epoch_state.validators(), 0);
        let qc: QuorumCertificate = builder.genesis_qc();

        let message = ConsensusMessage::GetVerticesError(Box::new(GetVerticesErrorResponse {
            epoch: 0,
            vertex_id: HashValue([3u8; 32]),
            high_qc: HighQC::genesis(qc),
        }));
        assert_eq!(message.epoch(), 0);
        assert_eq!(message.name(), "get_vertices_error");

        let bytes = message.to_bytes().unwrap();
        assert_eq!(ConsensusMessage::from_bytes(&bytes).unwrap(), message);
    }
}
