// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Core primitives shared by the consensus core and its collaborators.
//!
//! These are deliberately small value types: a 32-byte content hash, a
//! validator identity (the validator's ed25519 public key bytes) and the
//! verification error taxonomy.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error type for collaborator operations.
pub type Error = anyhow::Error;

/// Errors possible during signature and voting power verification.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerifyError {
    #[error("Author {0} is not a member of the validator set")]
    UnknownAuthor(Author),

    #[error(
        "The voting power ({voting_power}) is less than expected ({expected_voting_power})"
    )]
    TooLittleVotingPower {
        voting_power: u128,
        expected_voting_power: u128,
    },

    #[error("Signature verification failed for {0}")]
    InvalidSignature(Author),

    #[error("Certificate is malformed: {0}")]
    MalformedCertificate(String),

    #[error("Epoch mismatch: expected {expected}, got {actual}")]
    EpochMismatch { expected: u64, actual: u64 },
}

/// 32-byte content hash.
///
/// Vertex ids, ledger accumulators and signing digests are all `HashValue`s.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct HashValue(pub [u8; 32]);

impl HashValue {
    /// Length of a hash in bytes.
    pub const LENGTH: usize = 32;

    /// The all-zero hash.
    pub const fn zero() -> Self {
        HashValue([0u8; 32])
    }

    /// Create a hash from a byte slice.
    ///
    /// # Errors
    ///
    /// Returns an error if the slice is not exactly 32 bytes long.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() != Self::LENGTH {
            return Err(anyhow::anyhow!("Invalid hash length: {}", bytes.len()));
        }
        let mut hash = [0u8; 32];
        hash.copy_from_slice(bytes);
        Ok(HashValue(hash))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Short hex prefix used in log lines.
    pub fn short_str(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Debug for HashValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HashValue({})", self.short_str())
    }
}

impl fmt::Display for HashValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Identity of a validator: the bytes of its ed25519 verifying key.
///
/// Ordering is byte-wise, which gives validator-keyed collections a
/// deterministic iteration order.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Author(pub [u8; 32]);

impl Author {
    /// Create an author from a byte slice.
    ///
    /// # Errors
    ///
    /// Returns an error if the slice is not exactly 32 bytes long.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() != 32 {
            return Err(anyhow::anyhow!("Invalid author length: {}", bytes.len()));
        }
        let mut id = [0u8; 32];
        id.copy_from_slice(bytes);
        Ok(Author(id))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn short_str(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Debug for Author {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Author({})", self.short_str())
    }
}

impl fmt::Display for Author {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_zero() {
        let hash = HashValue::zero();
        assert_eq!(hash.as_bytes(), &[0u8; 32]);
    }

    #[test]
    fn test_hash_from_slice() {
        let bytes = [42u8; 32];
        let hash = HashValue::from_slice(&bytes).unwrap();
        assert_eq!(hash.as_bytes(), &bytes);

        assert!(HashValue::from_slice(&[1u8; 31]).is_err());
    }

    #[test]
    fn test_author_ordering_is_bytewise() {
        let a = Author([1u8; 32]);
        let b = Author([2u8; 32]);
        assert!(a < b);
        assert_eq!(Author::from_slice(&[1u8; 32]).unwrap(), a);
        assert!(Author::from_slice(&[]).is_err());
    }

    #[test]
    fn test_short_str() {
        let author = Author([0xab; 32]);
        assert_eq!(author.short_str(), "abababab");
        assert_eq!(format!("{}", author), "abababab");
    }

    #[test]
    fn test_verify_error_display() {
        let err = VerifyError::TooLittleVotingPower {
            voting_power: 2,
            expected_voting_power: 3,
        };
        assert_eq!(
            err.to_string(),
            "The voting power (2) is less than expected (3)"
        );
    }
}
