// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Ed25519 validator signatures.

use consensus_traits::{Author, HashValue, VerifyError};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Length of an ed25519 signature in bytes.
const SIGNATURE_LENGTH: usize = 64;

/// A validator's signature over a 32-byte digest.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConsensusSignature {
    /// The signature bytes
    bytes: Vec<u8>,
}

impl ConsensusSignature {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Debug for ConsensusSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = &self.bytes[..self.bytes.len().min(4)];
        write!(f, "ConsensusSignature({})", hex::encode(prefix))
    }
}

/// Signs consensus digests on behalf of the local validator.
pub struct ValidatorSigner {
    author: Author,
    signing_key: SigningKey,
}

impl ValidatorSigner {
    pub fn new(signing_key: SigningKey) -> Self {
        let author = Author(signing_key.verifying_key().to_bytes());
        Self {
            author,
            signing_key,
        }
    }

    /// Deterministic signer derived from a 32-byte seed.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self::new(SigningKey::from_bytes(&seed))
    }

    pub fn author(&self) -> Author {
        self.author
    }

    pub fn sign(&self, digest: &HashValue) -> ConsensusSignature {
        let signature = self.signing_key.sign(digest.as_bytes());
        ConsensusSignature::from_bytes(signature.to_bytes().to_vec())
    }
}

impl fmt::Debug for ValidatorSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ValidatorSigner({})", self.author)
    }
}

/// Verify `signature` over `digest` against the key of `author`.
pub fn verify_signature(
    author: &Author,
    digest: &HashValue,
    signature: &ConsensusSignature,
) -> Result<(), VerifyError> {
    let sig_bytes: [u8; SIGNATURE_LENGTH] = signature
        .as_bytes()
        .try_into()
        .map_err(|_| VerifyError::InvalidSignature(*author))?;
    let signature = Signature::from_bytes(&sig_bytes);

    let verifying_key =
        VerifyingKey::from_bytes(&author.0).map_err(|_| VerifyError::InvalidSignature(*author))?;

    verifying_key
        .verify(digest.as_bytes(), &signature)
        .map_err(|_| VerifyError::InvalidSignature(*author))
}
