// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Quorum and timeout certificates, and the HighQC a replica trusts.
//!
//! # Certificates
//!
//! - [`QuorumCertificate`]: quorum voting power signed the same [`VoteData`]
//! - [`TimeoutCertificate`]: quorum voting power gave up on a view
//! - [`HighQC`]: highest QC, highest committed QC and highest TC known
//!
//! Certificates are built by the vote aggregator and verified against the
//! [`EpochState`] of the epoch they belong to.

use consensus_traits::{HashValue, VerifyError};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::crypto::{domain, hash_of, AggregateSignature};
use crate::epoch_manager::EpochState;
use crate::types::{BftHeader, Epoch, ExecutedVertex, View, VoteData, GENESIS_VIEW};

/// Aggregated proof that a quorum certified a vertex.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QuorumCertificate {
    vote_data: VoteData,
    signatures: AggregateSignature,
}

impl QuorumCertificate {
    pub fn new(vote_data: VoteData, signatures: AggregateSignature) -> Self {
        Self {
            vote_data,
            signatures,
        }
    }

    /// Certificate of the genesis vertex of an epoch.
    ///
    /// It carries no signatures: every replica derives the same genesis
    /// vertex from the ledger header that starts the epoch.
    pub fn genesis(genesis: &ExecutedVertex) -> Self {
        let header = genesis.header();
        Self {
            vote_data: VoteData::new(header.clone(), header.clone(), Some(header)),
            signatures: AggregateSignature::empty(),
        }
    }

    /// Placeholder certificate embedded in the genesis vertex itself.
    pub(crate) fn pre_genesis(header: BftHeader) -> Self {
        Self {
            vote_data: VoteData::new(header.clone(), header.clone(), Some(header)),
            signatures: AggregateSignature::empty(),
        }
    }

    pub fn vote_data(&self) -> &VoteData {
        &self.vote_data
    }

    pub fn signatures(&self) -> &AggregateSignature {
        &self.signatures
    }

    /// Header of the certified vertex.
    pub fn proposed(&self) -> &BftHeader {
        &self.vote_data.proposed
    }

    /// Header of the certified vertex's parent.
    pub fn parent(&self) -> &BftHeader {
        &self.vote_data.parent
    }

    /// Header committed by this certificate, if any.
    pub fn committed(&self) -> Option<&BftHeader> {
        self.vote_data.committed.as_ref()
    }

    pub fn certified_vertex_id(&self) -> HashValue {
        self.vote_data.proposed.vertex_id
    }

    pub fn view(&self) -> View {
        self.vote_data.proposed.view
    }

    pub fn epoch(&self) -> Epoch {
        self.vote_data.epoch()
    }

    pub fn is_genesis(&self) -> bool {
        self.view() == GENESIS_VIEW
    }

    /// Verify the certificate against the epoch's validator set.
    ///
    /// Cheap structural checks run before any signature is verified.
    pub fn verify(&self, epoch_state: &EpochState) -> Result<(), VerifyError> {
        if self.epoch() != epoch_state.epoch() {
            return Err(VerifyError::EpochMismatch {
                expected: epoch_state.epoch(),
                actual: self.epoch(),
            });
        }

        let vote_data = &self.vote_data;
        if self.is_genesis() {
            // unsigned, so it must be exactly the one every replica derives
            if self != epoch_state.genesis_qc() {
                return Err(VerifyError::MalformedCertificate(format!(
                    "view 0 certificate for {} is not the epoch's genesis certificate",
                    self.certified_vertex_id().short_str()
                )));
            }
            return Ok(());
        }

        if vote_data.parent.view >= vote_data.proposed.view {
            return Err(VerifyError::MalformedCertificate(format!(
                "parent view {} not below proposed view {}",
                vote_data.parent.view, vote_data.proposed.view
            )));
        }
        if let Some(committed) = &vote_data.committed {
            if committed.view + 2 != vote_data.proposed.view {
                return Err(VerifyError::MalformedCertificate(format!(
                    "committed view {} is not the direct grandparent of view {}",
                    committed.view, vote_data.proposed.view
                )));
            }
        }

        self.signatures
            .verify(&vote_data.digest(), epoch_state.validators())
            .map(|_| ())
    }
}

impl fmt::Display for QuorumCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "QC(epoch={}, view={}, vertex={}, signers={})",
            self.epoch(),
            self.view(),
            self.certified_vertex_id().short_str(),
            self.signatures.len()
        )
    }
}

/// Digest a validator signs to time out `view` of `epoch`.
pub fn timeout_digest(epoch: Epoch, view: View) -> HashValue {
    hash_of(domain::TIMEOUT, &(epoch, view))
}

/// Aggregated proof that a quorum gave up on a view.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeoutCertificate {
    epoch: Epoch,
    view: View,
    signatures: AggregateSignature,
}

impl TimeoutCertificate {
    pub fn new(epoch: Epoch, view: View, signatures: AggregateSignature) -> Self {
        Self {
            epoch,
            view,
            signatures,
        }
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn view(&self) -> View {
        self.view
    }

    pub fn signatures(&self) -> &AggregateSignature {
        &self.signatures
    }

    pub fn verify(&self, epoch_state: &EpochState) -> Result<(), VerifyError> {
        if self.epoch != epoch_state.epoch() {
            return Err(VerifyError::EpochMismatch {
                expected: epoch_state.epoch(),
                actual: self.epoch,
            });
        }
        self.signatures
            .verify(&timeout_digest(self.epoch, self.view), epoch_state.validators())
            .map(|_| ())
    }
}

impl fmt::Display for TimeoutCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TC(epoch={}, view={}, signers={})",
            self.epoch,
            self.view,
            self.signatures.len()
        )
    }
}

/// The certificates a replica currently trusts.
///
/// `highest_committed_qc` never has a higher view than `highest_qc`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HighQC {
    highest_qc: QuorumCertificate,
    highest_committed_qc: QuorumCertificate,
    highest_tc: Option<TimeoutCertificate>,
}

impl HighQC {
    /// Create a HighQC. If the committed QC is higher than `highest_qc` it
    /// is used for both.
    pub fn new(
        highest_qc: QuorumCertificate,
        highest_committed_qc: QuorumCertificate,
        highest_tc: Option<TimeoutCertificate>,
    ) -> Self {
        let highest_qc = if highest_committed_qc.view() > highest_qc.view() {
            highest_committed_qc.clone()
        } else {
            highest_qc
        };
        Self {
            highest_qc,
            highest_committed_qc,
            highest_tc,
        }
    }

    /// HighQC at the start of an epoch.
    pub fn genesis(genesis_qc: QuorumCertificate) -> Self {
        Self {
            highest_qc: genesis_qc.clone(),
            highest_committed_qc: genesis_qc,
            highest_tc: None,
        }
    }

    pub fn highest_qc(&self) -> &QuorumCertificate {
        &self.highest_qc
    }

    pub fn highest_committed_qc(&self) -> &QuorumCertificate {
        &self.highest_committed_qc
    }

    pub fn highest_tc(&self) -> Option<&TimeoutCertificate> {
        self.highest_tc.as_ref()
    }

    pub fn epoch(&self) -> Epoch {
        self.highest_qc.epoch()
    }

    /// Highest view certified by either a QC or a TC.
    pub fn highest_view(&self) -> View {
        let tc_view = self.highest_tc.as_ref().map(|tc| tc.view()).unwrap_or(0);
        self.highest_qc.view().max(tc_view)
    }

    pub fn verify(&self, epoch_state: &EpochState) -> Result<(), VerifyError> {
        self.highest_qc.verify(epoch_state)?;
        if self.highest_committed_qc != self.highest_qc {
            self.highest_committed_qc.verify(epoch_state)?;
        }
        if let Some(tc) = &self.highest_tc {
            tc.verify(epoch_state)?;
        }
        Ok(())
    }
}

impl fmt::Display for HighQC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "HighQC(qc_view={}, committed_view={}, tc_view={:?})",
            self.highest_qc.view(),
            self.highest_committed_qc.view(),
            self.highest_tc.as_ref().map(|tc| tc.view())
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{make_epoch_state, make_signers, QcBuilder};

    #[test]
    fn test_genesis_qc_verifies() {
        let signers = make_signers(4);
        let epoch_state = make_epoch_state(0, &signers);
        let builder = QcBuilder::new(&signers, epoch_state.validators(), 0);

        let qc = QuorumCertificate::genesis(builder.genesis());
        assert!(qc.is_genesis());
        assert!(qc.verify(&epoch_state).is_ok());
    }

    #[test]
    fn test_qc_verifies_with_quorum() {
        let signers = make_signers(4);
        let epoch_state = make_epoch_state(0, &signers);
        let builder = QcBuilder::new(&signers, epoch_state.validators(), 0);

        let v1 = builder.extend_genesis(1);
        let qc = builder.certify(&v1);

        assert_eq!(qc.signatures().len(), 3);
        assert!(qc.verify(&epoch_state).is_ok());
    }

    #[test]
    fn test_qc_rejected_without_quorum() {
        let signers = make_signers(4);
        let epoch_state = make_epoch_state(0, &signers);
        let builder = QcBuilder::new(&signers, epoch_state.validators(), 0);

        let v1 = builder.extend_genesis(1);
        let qc = builder.certify_by(&v1, &signers[..2]);

        assert!(matches!(
            qc.verify(&epoch_state),
            Err(VerifyError::TooLittleVotingPower { .. })
        ));
    }

    #[test]
    fn test_qc_rejected_for_other_epoch() {
        let signers = make_signers(4);
        let epoch_state = make_epoch_state(1, &signers);
        let builder = QcBuilder::new(&signers, epoch_state.validators(), 0);

        let v1 = builder.extend_genesis(1);
        let qc = builder.certify(&v1);

        assert_eq!(
            qc.verify(&epoch_state),
            Err(VerifyError::EpochMismatch {
                expected: 1,
                actual: 0
            })
        );
    }

    #[test]
    fn test_forged_genesis_qc_rejected() {
        let signers = make_signers(4);
        let epoch_state = make_epoch_state(0, &signers);
        let builder = QcBuilder::new(&signers, epoch_state.validators(), 0);

        let v1 = builder.extend_genesis(1);
        let v2 = builder.extend(&v1, 2);
        let real = builder.certify(&v2);
        // view 0 but pointing at a non-genesis parent
        let mut vote_data = real.vote_data().clone();
        vote_data.proposed.view = 0;
        let forged = QuorumCertificate::new(vote_data, AggregateSignature::empty());

        assert!(matches!(
            forged.verify(&epoch_state),
            Err(VerifyError::MalformedCertificate(_))
        ));
    }

    #[test]
    fn test_view_zero_qc_for_other_vertex_rejected() {
        let signers = make_signers(4);
        let epoch_state = make_epoch_state(0, &signers);
        let builder = QcBuilder::new(&signers, epoch_state.validators(), 0);
        let v1 = builder.extend_genesis(1);

        // unsigned and self-referential, but not this epoch's genesis
        let header = BftHeader::new(GENESIS_VIEW, v1.id(), v1.ledger_header().clone());
        let forged = QuorumCertificate::pre_genesis(header);
        assert!(matches!(
            forged.verify(&epoch_state),
            Err(VerifyError::MalformedCertificate(_))
        ));

        // another epoch's genesis at the same epoch number is refused too
        let other = ExecutedVertex::genesis(consensus_traits::LedgerHeader::genesis(
            0,
            7,
            HashValue::zero(),
        ));
        assert!(QuorumCertificate::genesis(&other).verify(&epoch_state).is_err());
        assert_eq!(epoch_state.genesis_qc(), &builder.genesis_qc());
    }

    #[test]
    fn test_tc_verifies() {
        let signers = make_signers(4);
        let epoch_state = make_epoch_state(0, &signers);
        let builder = QcBuilder::new(&signers, epoch_state.validators(), 0);

        let tc = builder.timeout_certificate(5);
        assert_eq!(tc.view(), 5);
        assert!(tc.verify(&epoch_state).is_ok());

        let forged = TimeoutCertificate::new(0, 6, tc.signatures().clone());
        assert!(forged.verify(&epoch_state).is_err());
    }

    #[test]
    fn test_high_qc_committed_never_above_highest() {
        let signers = make_signers(4);
        let epoch_state = make_epoch_state(0, &signers);
        let builder = QcBuilder::new(&signers, epoch_state.validators(), 0);

        let v1 = builder.extend_genesis(1);
        let v2 = builder.extend(&v1, 2);
        let qc1 = builder.certify(&v1);
        let qc2 = builder.certify(&v2);

        let high_qc = HighQC::new(qc1.clone(), qc2.clone(), None);
        assert_eq!(high_qc.highest_qc(), &qc2);
        assert_eq!(high_qc.highest_committed_qc(), &qc2);
    }

    #[test]
    fn test_high_qc_highest_view_includes_tc() {
        let signers = make_signers(4);
        let epoch_state = make_epoch_state(0, &signers);
        let builder = QcBuilder::new(&signers, epoch_state.validators(), 0);

        let v1 = builder.extend_genesis(1);
        let qc1 = builder.certify(&v1);
        let tc = builder.timeout_certificate(4);

        let high_qc = HighQC::new(qc1.clone(), qc1, Some(tc));
        assert_eq!(high_qc.highest_view(), 4);
        assert!(high_qc.verify(&epoch_state).is_ok());
    }
}
