// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Async driver for the consensus event loop.
//!
//! Network receivers, timers and the embedding node all push
//! [`ConsensusEvent`]s into one bounded channel; [`ConsensusRuntime::run`]
//! pops them one at a time and hands them to the [`EpochManager`]. Timers
//! are spawned tasks that sleep and then send their event back into the
//! channel, so the consensus state itself is only touched by the loop.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::event::{ConsensusEvent, LocalTimer, TimerScheduler};
use super::ConsensusError;
use crate::epoch_manager::EpochManager;

/// Configuration for the consensus runtime.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Bound of the event channel
    pub channel_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
        }
    }
}

impl RuntimeConfig {
    pub fn new(channel_capacity: usize) -> Self {
        Self { channel_capacity }
    }
}

/// Cloneable entry point into a running event loop.
#[derive(Clone, Debug)]
pub struct RuntimeHandle {
    events: mpsc::Sender<ConsensusEvent>,
    cancel: CancellationToken,
}

impl RuntimeHandle {
    /// Queue an event, waiting for channel capacity.
    ///
    /// Returns false once the loop has stopped.
    pub async fn send(&self, event: ConsensusEvent) -> bool {
        self.events.send(event).await.is_ok()
    }

    /// Queue an event without waiting. A full channel drops it, which the
    /// protocol tolerates like any lost message.
    pub fn try_send(&self, event: ConsensusEvent) -> bool {
        match self.events.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                log::warn!("Event channel full, dropping {}", event);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Timer scheduler feeding this loop.
    pub fn timers(&self) -> TokioTimers {
        TokioTimers {
            events: self.events.clone(),
            cancel: self.cancel.clone(),
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Schedules [`LocalTimer`]s as sleeping tokio tasks.
pub struct TokioTimers {
    events: mpsc::Sender<ConsensusEvent>,
    cancel: CancellationToken,
}

impl TimerScheduler for TokioTimers {
    fn schedule(&mut self, timer: LocalTimer, after: Duration) {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                log::error!("Cannot schedule {} outside a tokio runtime: {}", timer, e);
                return;
            }
        };
        let events = self.events.clone();
        let cancel = self.cancel.clone();
        runtime.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(after) => {
                    if events.send(ConsensusEvent::Timer(timer)).await.is_err() {
                        log::trace!("Event loop gone, timer discarded");
                    }
                }
            }
        });
    }
}

/// The event loop of one replica.
pub struct ConsensusRuntime {
    manager: EpochManager,
    events: mpsc::Receiver<ConsensusEvent>,
    cancel: CancellationToken,
}

impl ConsensusRuntime {
    /// Create the event channel. The handle's [`timers`](RuntimeHandle::timers)
    /// go into the manager's context before the runtime is built.
    pub fn channel(config: &RuntimeConfig) -> (RuntimeHandle, mpsc::Receiver<ConsensusEvent>) {
        let (sender, receiver) = mpsc::channel(config.channel_capacity);
        let handle = RuntimeHandle {
            events: sender,
            cancel: CancellationToken::new(),
        };
        (handle, receiver)
    }

    pub fn new(
        manager: EpochManager,
        events: mpsc::Receiver<ConsensusEvent>,
        handle: &RuntimeHandle,
    ) -> Self {
        Self {
            manager,
            events,
            cancel: handle.cancellation_token(),
        }
    }

    /// Run until shutdown, returning the manager for inspection.
    ///
    /// # Errors
    ///
    /// A fatal consensus error stops the loop and cancels every timer.
    pub async fn run(mut self) -> Result<EpochManager, ConsensusError> {
        if let Err(e) = self.manager.start() {
            log::error!("Consensus failed to start: {}", e);
            self.cancel.cancel();
            return Err(e);
        }
        log::info!("Consensus event loop running in epoch {}", self.manager.epoch());

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    log::info!("Consensus event loop received shutdown signal");
                    break;
                }
                event = self.events.recv() => {
                    let Some(event) = event else {
                        log::info!("Event channel closed");
                        break;
                    };
                    if let Err(e) = self.manager.handle(event) {
                        log::error!("Fatal consensus error: {}", e);
                        self.cancel.cancel();
                        return Err(e);
                    }
                }
            }
        }

        log::info!("Consensus event loop shut down");
        Ok(self.manager)
    }
}
