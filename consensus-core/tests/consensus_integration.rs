// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! End-to-end scenarios on a simulated network of replicas.

use consensus_core::certificates::HighQC;
use consensus_core::liveness::WeightedRotatingLeaders;
use consensus_core::network::{ConsensusMessage, Vote};
use consensus_core::testing::{make_signers, make_validator_set, SimulatedNetwork, SimulationConfig};
use consensus_core::types::{ExecutedVertex, Vertex};
use consensus_traits::{Command, LedgerHeader, ProposerElection};

const MAX_STEPS: usize = 200_000;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn highest_qc_view(sim: &SimulatedNetwork, i: usize) -> u64 {
    sim.manager(i)
        .map(|m| m.instance().store().highest_qc().view())
        .unwrap_or(0)
}

/// Four honest validators: the vertex of view 1 is committed once view 3
/// is certified, identically everywhere.
#[test]
fn test_four_validators_commit_at_view_three() {
    init_logger();
    let mut sim = SimulatedNetwork::new(4);
    sim.start();

    assert!(sim.run_until(MAX_STEPS, |s| s.min_committed() >= 1));

    for i in 0..4 {
        let committed = sim.committed(i);
        assert_eq!(committed[0].view, 1, "replica {} committed {:?}", i, committed[0]);
        assert!(highest_qc_view(&sim, i) >= 3);
    }
    assert!(sim.commits_consistent());
    assert!(!sim.has_double_vote());
    assert!(sim.errors().is_empty());
}

#[test]
fn test_commands_reach_every_executor_in_order() {
    init_logger();
    let mut sim = SimulatedNetwork::new(4);
    sim.start();
    assert!(sim.run_until(MAX_STEPS, |s| s.min_committed() >= 10));

    let reference: Vec<Option<Command>> = sim.committed(0).into_iter().map(|c| c.command).collect();
    for i in 1..4 {
        let commands: Vec<Option<Command>> = sim.committed(i).into_iter().map(|c| c.command).collect();
        let n = commands.len().min(reference.len());
        assert_eq!(commands[..n], reference[..n]);
    }
    assert!(reference.iter().any(|c| c.is_some()));

    // versions grow by one per command along the committed chain
    let headers: Vec<LedgerHeader> = sim.committed(0).into_iter().map(|c| c.header).collect();
    for pair in headers.windows(2) {
        assert!(pair[1].version >= pair[0].version);
        assert!(pair[1].view > pair[0].view);
    }
}

/// A replica that misses a proposal fetches it when the next one arrives.
#[test]
fn test_missing_parent_resolved_by_sync() {
    init_logger();
    let mut sim = SimulatedNetwork::new(4);
    let mut election = WeightedRotatingLeaders::new(&make_validator_set(&make_signers(4)));
    let leader_of_two = election.leader(2);
    let victim = (0..4).find(|i| sim.author(*i) != leader_of_two).unwrap();

    sim.set_filter(Box::new(move |_from, to, message| {
        !(to == victim && matches!(message, ConsensusMessage::Proposal(p) if p.view() == 2))
    }));
    sim.start();

    assert!(sim.run_until(MAX_STEPS, |s| s.committed(victim).len() >= 3));
    let counters = sim.counters(victim);
    assert!(counters.sync_requests >= 1);
    assert!(counters.syncs_completed >= 1);
    assert!(sim.commits_consistent());
}

/// Conflicting votes from one validator are detected, not counted, and
/// do not stop progress.
#[test]
fn test_equivocating_validator() {
    init_logger();
    let mut sim = SimulatedNetwork::new(4);
    sim.start();
    sim.crash(3);
    assert!(sim.run_until(MAX_STEPS, |s| s.min_committed() >= 2));
    let before = sim.min_committed();

    let byzantine = sim.signer(3).clone();
    let manager = sim.manager(0).unwrap();
    let view = manager.instance().current_view();
    let high_qc: HighQC = manager.instance().high_qc();
    let parent_qc = high_qc.highest_qc().clone();
    let header = manager.instance().store().root().ledger_header().clone();

    let votes: Vec<Vote> = [b"left".to_vec(), b"right".to_vec()]
        .into_iter()
        .map(|payload| {
            let vertex = Vertex::new_proposal(
                parent_qc.clone(),
                None,
                view,
                byzantine.author(),
                Some(Command::new(payload)),
            );
            let executed = ExecutedVertex::new(vertex, header.clone());
            Vote::new(executed.vote_data(), high_qc.clone(), &byzantine)
        })
        .collect();
    for to in 0..3 {
        for vote in &votes {
            sim.inject(3, to, ConsensusMessage::Vote(Box::new(vote.clone())));
        }
    }

    assert!(sim.run_until(MAX_STEPS, |s| s.min_committed() >= before + 3));
    let detected: u64 = (0..3).map(|i| sim.counters(i).equivocations).sum();
    assert!(detected >= 1);
    let evidence: Vec<_> = (0..3)
        .flat_map(|i| sim.manager_mut(i).unwrap().take_equivocation_evidence())
        .collect();
    assert!(!evidence.is_empty());
    assert!(evidence.iter().all(|e| e.author == byzantine.author() && e.view == view));
    assert!(sim.commits_consistent());
}

/// Reaching the configured epoch length swaps every replica into epoch 2
/// over the same validators.
#[test]
fn test_epoch_change_swaps_instances() {
    init_logger();
    let mut sim = SimulatedNetwork::with_config(SimulationConfig {
        epoch_length: Some(5),
        ..SimulationConfig::default()
    });
    sim.start();

    let in_epoch_two = |s: &SimulatedNetwork| {
        (0..4).all(|i| {
            s.committed(i)
                .iter()
                .any(|c| c.header.epoch == 2 && c.command.is_some())
        })
    };
    assert!(sim.run_until(MAX_STEPS, in_epoch_two));

    for i in 0..4 {
        assert!(sim.manager(i).unwrap().epoch() >= 2);
        assert!(sim.counters(i).epoch_changes >= 1);
        let committed = sim.committed(i);
        let end = committed
            .iter()
            .position(|c| c.header.is_end_of_epoch())
            .unwrap();
        // nothing after the end of epoch 1 carries a command in epoch 1
        assert!(committed[end + 1..]
            .iter()
            .filter(|c| c.header.epoch == 1)
            .all(|c| c.command.is_none()));
    }
    assert!(sim.commits_consistent());
    assert!(!sim.has_double_vote());
}

#[test]
fn test_new_epoch_genesis_continues_ledger() {
    init_logger();
    let mut sim = SimulatedNetwork::with_config(SimulationConfig {
        epoch_length: Some(4),
        ..SimulationConfig::default()
    });
    sim.start();
    assert!(sim.run_until(MAX_STEPS, |s| {
        s.committed(0).iter().any(|c| c.header.epoch == 2)
    }));

    let committed = sim.committed(0);
    let last_of_one = committed.iter().filter(|c| c.header.epoch == 1).last().unwrap();
    let first_of_two = committed.iter().find(|c| c.header.epoch == 2).unwrap();
    assert!(last_of_one.header.is_end_of_epoch());
    assert_eq!(first_of_two.view, 1);
    assert_eq!(
        first_of_two.header.version,
        last_of_one.header.version + u64::from(first_of_two.command.is_some())
    );
}
