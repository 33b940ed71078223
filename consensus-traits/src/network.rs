// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Network interface for consensus.
//!
//! The consensus core only ever enqueues outbound messages. Delivery is
//! asynchronous, may reorder or duplicate messages, and inbound traffic is
//! injected back into the core's event loop by the embedding node.

use crate::core::Author;

/// Outbound message sink.
///
/// # Requirements
///
/// Implementations must not block: `send` and `broadcast` are called from
/// inside the single-threaded consensus loop. A message to the local
/// replica's own author must be delivered back to it like any other.
///
/// # Example
///
/// ```text
/// use consensus_traits::{network::Network, core::Author};
/// use tokio::sync::mpsc::UnboundedSender;
///
/// struct ChannelNetwork<M> {
///     outbound: UnboundedSender<(Option<Author>, M)>,
/// }
///
/// impl<M: Clone + Send + 'static> Network<M> for ChannelNetwork<M> {
///     fn send(&self, peer: &Author, message: M) {
///         let _ = self.outbound.send((Some(*peer), message));
///     }
///
///     fn broadcast(&self, message: M) {
///         let _ = self.outbound.send((None, message));
///     }
/// }
/// ```
pub trait Network<M>: Send + Sync {
    /// Send a message to a single peer.
    fn send(&self, peer: &Author, message: M);

    /// Send a message to every validator of the current epoch, including
    /// the local replica.
    fn broadcast(&self, message: M);
}
