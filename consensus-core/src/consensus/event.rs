// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Events driving a consensus instance.
//!
//! Everything that can change consensus state arrives as a
//! [`ConsensusEvent`]: a message from a peer, or one of our own timers
//! firing. Timers are scheduled through a [`TimerScheduler`] and come back
//! into the same event stream, so stale firings are recognized by the
//! epoch, view or attempt they carry.

use consensus_traits::{Author, HashValue};
use std::fmt;
use std::time::Duration;

use crate::network::ConsensusMessage;
use crate::types::{Epoch, View};

/// A timer set by the consensus instance.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum LocalTimer {
    /// The deadline of `view`, or a timeout re-broadcast while still in it
    ViewTimeout { epoch: Epoch, view: View },
    /// The deadline of a vertex request made on behalf of the sync to `target`
    SyncTimeout {
        epoch: Epoch,
        target: HashValue,
        attempt: u64,
    },
}

impl LocalTimer {
    pub fn epoch(&self) -> Epoch {
        match self {
            LocalTimer::ViewTimeout { epoch, .. } | LocalTimer::SyncTimeout { epoch, .. } => *epoch,
        }
    }
}

impl fmt::Display for LocalTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocalTimer::ViewTimeout { epoch, view } => {
                write!(f, "ViewTimeout(epoch={}, view={})", epoch, view)
            }
            LocalTimer::SyncTimeout {
                epoch,
                target,
                attempt,
            } => write!(
                f,
                "SyncTimeout(epoch={}, target={}, attempt={})",
                epoch,
                target.short_str(),
                attempt
            ),
        }
    }
}

/// Schedules a [`LocalTimer`] to be delivered back as an event.
pub trait TimerScheduler: Send {
    fn schedule(&mut self, timer: LocalTimer, after: Duration);
}

/// Input to the consensus event loop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConsensusEvent {
    /// A message received from `sender`. The transport authenticates the
    /// sender; message signatures are still checked.
    Message {
        sender: Author,
        message: ConsensusMessage,
    },
    Timer(LocalTimer),
}

impl ConsensusEvent {
    pub fn message(sender: Author, message: ConsensusMessage) -> Self {
        ConsensusEvent::Message { sender, message }
    }

    pub fn epoch(&self) -> Epoch {
        match self {
            ConsensusEvent::Message { message, .. } => message.epoch(),
            ConsensusEvent::Timer(timer) => timer.epoch(),
        }
    }
}

impl fmt::Display for ConsensusEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsensusEvent::Message { sender, message } => {
                write!(f, "{} from {}", message, sender)
            }
            ConsensusEvent::Timer(timer) => write!(f, "{}", timer),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::GetVerticesRequest;

    #[test]
    fn test_event_epoch() {
        let timer = ConsensusEvent::Timer(LocalTimer::ViewTimeout { epoch: 3, view: 7 });
        assert_eq!(timer.epoch(), 3);

        let request = ConsensusEvent::message(
            Author([1u8; 32]),
            ConsensusMessage::GetVerticesRequest(GetVerticesRequest {
                epoch: 5,
                vertex_id: HashValue::zero(),
                count: 1,
            }),
        );
        assert_eq!(request.epoch(), 5);
    }

    #[test]
    fn test_timer_display() {
        let timer = LocalTimer::SyncTimeout {
            epoch: 1,
            target: HashValue([0xab; 32]),
            attempt: 2,
        };
        assert_eq!(
            timer.to_string(),
            "SyncTimeout(epoch=1, target=abababab, attempt=2)"
        );
    }
}
