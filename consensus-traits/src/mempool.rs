// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Mempool interface consumed by the proposing leader.

use crate::ledger::Command;

/// Source of candidate commands.
pub trait Mempool: Send {
    /// Take the next command to propose, or `None` if the mempool is empty.
    /// An empty proposal still advances the chain.
    fn take_next_command(&mut self) -> Option<Command>;
}
