// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Cryptographic utilities for consensus.
//!
//! This module provides content hashing, validator signing and signature
//! aggregation used in forming quorum and timeout certificates.

mod signature_aggregator;
mod signer;

pub use signature_aggregator::{AggregateSignature, SignatureAggregator};
pub use signer::{verify_signature, ConsensusSignature, ValidatorSigner};

use consensus_traits::HashValue;
use serde::Serialize;

/// Domain separators for the hashes used by the protocol.
pub mod domain {
    pub const VERTEX: &str = "hotstuff-consensus 2024 vertex";
    pub const VOTE_DATA: &str = "hotstuff-consensus 2024 vote-data";
    pub const TIMEOUT: &str = "hotstuff-consensus 2024 timeout";
    pub const PROPOSAL: &str = "hotstuff-consensus 2024 proposal";
}

/// Hash the canonical (bincode) encoding of `value` under a domain separator.
pub fn hash_of<T: Serialize + ?Sized>(domain: &str, value: &T) -> HashValue {
    let mut hasher = blake3::Hasher::new_derive_key(domain);
    // Encoding derived types into an in-memory sink does not fail.
    if let Err(e) = bincode::serialize_into(&mut hasher, value) {
        log::error!("Failed to encode value for hashing under {}: {}", domain, e);
    }
    HashValue(*hasher.finalize().as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_deterministic() {
        let a = hash_of(domain::VERTEX, &(1u64, 2u64));
        let b = hash_of(domain::VERTEX, &(1u64, 2u64));
        assert_eq!(a, b);
    }

    #[test]
    fn test_hash_domain_separation() {
        let a = hash_of(domain::VERTEX, &7u64);
        let b = hash_of(domain::TIMEOUT, &7u64);
        assert_ne!(a, b);
    }
}
