// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use consensus_traits::{Command, HashValue, LedgerHeader};
use std::sync::Arc;

use super::mock_ledger::mock_prepare;
use crate::certificates::{timeout_digest, HighQC, QuorumCertificate, TimeoutCertificate};
use crate::crypto::{SignatureAggregator, ValidatorSigner};
use crate::types::{Epoch, ExecutedVertex, Vertex, View};
use crate::validator_set::ValidatorSet;

/// Builds executed vertices and signed certificates for tests.
///
/// Vertices are executed with the same deterministic ledger as
/// [`MockCommandExecutor`](super::MockCommandExecutor), so a vertex built
/// here and one inserted into a store through the mock executor carry the
/// same ledger header.
pub struct QcBuilder {
    signers: Vec<Arc<ValidatorSigner>>,
    validators: ValidatorSet,
    epoch: Epoch,
    genesis: ExecutedVertex,
}

impl QcBuilder {
    pub fn new(signers: &[Arc<ValidatorSigner>], validators: &ValidatorSet, epoch: Epoch) -> Self {
        let genesis = ExecutedVertex::genesis(LedgerHeader::genesis(epoch, 0, HashValue::zero()));
        Self {
            signers: signers.to_vec(),
            validators: validators.clone(),
            epoch,
            genesis,
        }
    }

    pub fn genesis(&self) -> &ExecutedVertex {
        &self.genesis
    }

    pub fn genesis_qc(&self) -> QuorumCertificate {
        QuorumCertificate::genesis(&self.genesis)
    }

    pub fn genesis_high_qc(&self) -> HighQC {
        HighQC::genesis(self.genesis_qc())
    }

    pub fn signers(&self) -> &[Arc<ValidatorSigner>] {
        &self.signers
    }

    pub fn validators(&self) -> &ValidatorSet {
        &self.validators
    }

    pub fn extend_genesis(&self, view: View) -> ExecutedVertex {
        self.build(&self.genesis, view, None, None)
    }

    pub fn extend_genesis_with_command(&self, view: View, command: Vec<u8>) -> ExecutedVertex {
        self.build(&self.genesis, view, None, Some(Command::new(command)))
    }

    /// A child of `parent` justified by the parent's QC.
    pub fn extend(&self, parent: &ExecutedVertex, view: View) -> ExecutedVertex {
        self.build(parent, view, None, None)
    }

    pub fn extend_with_command(
        &self,
        parent: &ExecutedVertex,
        view: View,
        command: Vec<u8>,
    ) -> ExecutedVertex {
        self.build(parent, view, None, Some(Command::new(command)))
    }

    /// A child of `parent` that also carries a TC for `view - 1`.
    pub fn extend_with_tc(&self, parent: &ExecutedVertex, view: View) -> ExecutedVertex {
        let tc = self.timeout_certificate(view - 1);
        self.build(parent, view, Some(tc), None)
    }

    /// The leader used for vertices built at `view`.
    pub fn proposer(&self, view: View) -> &Arc<ValidatorSigner> {
        &self.signers[(view as usize) % self.signers.len()]
    }

    fn build(
        &self,
        parent: &ExecutedVertex,
        view: View,
        tc: Option<TimeoutCertificate>,
        command: Option<Command>,
    ) -> ExecutedVertex {
        let qc = self.certify(parent);
        let proposer = self.proposer(view).author();
        let vertex = Vertex::new_proposal(qc, tc, view, proposer, command);

        let ledger_header = if parent.ledger_header().is_end_of_epoch() {
            parent.ledger_header().clone()
        } else {
            mock_prepare(parent.ledger_header(), vertex.command.as_ref(), view, None)
        };
        ExecutedVertex::new(vertex, ledger_header)
    }

    /// QC for `vertex` signed by the smallest prefix of signers holding a
    /// quorum. The genesis vertex gets the genesis QC.
    pub fn certify(&self, vertex: &ExecutedVertex) -> QuorumCertificate {
        if vertex.id() == self.genesis.id() {
            return self.genesis_qc();
        }
        self.certify_by(vertex, &self.quorum_prefix())
    }

    /// QC for `vertex` signed by exactly `signers`, quorum or not.
    pub fn certify_by(
        &self,
        vertex: &ExecutedVertex,
        signers: &[Arc<ValidatorSigner>],
    ) -> QuorumCertificate {
        let vote_data = vertex.vote_data();
        let digest = vote_data.digest();
        let mut aggregator = SignatureAggregator::new();
        for signer in signers {
            let power = self.validators.voting_power(&signer.author()).unwrap_or(0);
            aggregator.add_signature(signer.author(), signer.sign(&digest), power);
        }
        QuorumCertificate::new(vote_data, aggregator.aggregate())
    }

    pub fn timeout_certificate(&self, view: View) -> TimeoutCertificate {
        let digest = timeout_digest(self.epoch, view);
        let mut aggregator = SignatureAggregator::new();
        for signer in self.quorum_prefix() {
            let power = self.validators.voting_power(&signer.author()).unwrap_or(0);
            aggregator.add_signature(signer.author(), signer.sign(&digest), power);
        }
        TimeoutCertificate::new(self.epoch, view, aggregator.aggregate())
    }

    fn quorum_prefix(&self) -> Vec<Arc<ValidatorSigner>> {
        let quorum = self.validators.quorum_voting_power();
        let mut power = 0u128;
        let mut prefix = Vec::new();
        for signer in &self.signers {
            if power >= quorum {
                break;
            }
            power += self.validators.voting_power(&signer.author()).unwrap_or(0) as u128;
            prefix.push(signer.clone());
        }
        prefix
    }
}
