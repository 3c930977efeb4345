// Shared Hashlock Primitives
// Secret and Merkle commitments shared between the coordinator and resolver

//! # Hashlock
//!
//! Hashlock material for cross-chain escrows: SHA-256 leaf hashing,
//! sorted-pair Merkle roots and proofs for partial fills, and secret
//! minting. The sorted-pair rule matches the on-chain verifiers on both
//! escrow chains, so proofs produced here are position-agnostic and
//! verify identically off-chain and on-chain.

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub mod merkle;

pub use merkle::{build_tree, hash_pair, verify, MerkleTree, MAX_LEAVES};

/// A 32-byte value: secret, leaf hash, or Merkle root.
pub type Bytes32 = [u8; 32];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HashlockError {
    #[error("invalid leaf count: expected 1..={max}, got {actual}")]
    InvalidLeafCount { max: usize, actual: usize },
    #[error("invalid byte length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("invalid hex encoding: {0}")]
    InvalidHex(String),
}

/// Hash a 32-byte secret into its public leaf commitment.
pub fn hash_leaf(secret: &Bytes32) -> Bytes32 {
    let mut hasher = Sha256::new();
    hasher.update(secret);
    let digest = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

/// Mint a fresh 32-byte secret from the OS RNG.
pub fn mint_secret() -> Bytes32 {
    let mut secret = [0u8; 32];
    OsRng.fill_bytes(&mut secret);
    secret
}

/// Mint a secret together with its hashlock for a single-fill order.
pub fn mint_single() -> (Bytes32, Bytes32) {
    let secret = mint_secret();
    let hash = hash_leaf(&secret);
    (secret, hash)
}

/// Secret material for a segmented order: one secret per segment, the
/// public leaf set, the Merkle root used as the order hashlock, and a
/// proof per leaf.
#[derive(Debug, Clone)]
pub struct SegmentedSecrets {
    pub secrets: Vec<Bytes32>,
    pub leaves: Vec<Bytes32>,
    pub root: Bytes32,
    pub proofs: Vec<Vec<Bytes32>>,
}

/// Mint per-segment secrets and derive the shared Merkle commitment.
pub fn mint_segmented(segments: usize) -> Result<SegmentedSecrets, HashlockError> {
    let secrets: Vec<Bytes32> = (0..segments).map(|_| mint_secret()).collect();
    let leaves: Vec<Bytes32> = secrets.iter().map(hash_leaf).collect();
    let tree = build_tree(&leaves)?;
    Ok(SegmentedSecrets {
        secrets,
        leaves,
        root: tree.root,
        proofs: tree.proofs,
    })
}

/// Hex-encode a 32-byte value.
pub fn to_hex(value: &Bytes32) -> String {
    hex::encode(value)
}

/// Decode a 32-byte value from hex, accepting an optional 0x prefix.
pub fn from_hex(input: &str) -> Result<Bytes32, HashlockError> {
    let trimmed = input.strip_prefix("0x").unwrap_or(input);
    let bytes = hex::decode(trimmed).map_err(|e| HashlockError::InvalidHex(e.to_string()))?;
    if bytes.len() != 32 {
        return Err(HashlockError::InvalidLength {
            expected: 32,
            actual: bytes.len(),
        });
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}

/// A hex-serializable wrapper for 32-byte values on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HexBytes32(pub Bytes32);

impl Serialize for HexBytes32 {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&to_hex(&self.0))
    }
}

impl<'de> Deserialize<'de> for HexBytes32 {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        from_hex(&raw).map(HexBytes32).map_err(serde::de::Error::custom)
    }
}

impl From<Bytes32> for HexBytes32 {
    fn from(value: Bytes32) -> Self {
        HexBytes32(value)
    }
}

impl std::fmt::Display for HexBytes32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", to_hex(&self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_leaf_deterministic() {
        let secret = [7u8; 32];
        assert_eq!(hash_leaf(&secret), hash_leaf(&secret));

        let mut other = secret;
        other[0] ^= 1;
        assert_ne!(hash_leaf(&secret), hash_leaf(&other));
    }

    #[test]
    fn test_mint_single() {
        let (secret, hash) = mint_single();
        assert_eq!(hash, hash_leaf(&secret));
    }

    #[test]
    fn test_mint_segmented() {
        let minted = mint_segmented(4).unwrap();
        assert_eq!(minted.secrets.len(), 4);
        assert_eq!(minted.leaves.len(), 4);
        assert_eq!(minted.proofs.len(), 4);

        for (leaf, proof) in minted.leaves.iter().zip(&minted.proofs) {
            assert!(verify(leaf, proof, &minted.root));
        }
    }

    #[test]
    fn test_hex_round_trip() {
        let value = hash_leaf(&[3u8; 32]);
        let encoded = to_hex(&value);
        assert_eq!(from_hex(&encoded).unwrap(), value);
        assert_eq!(from_hex(&format!("0x{}", encoded)).unwrap(), value);
    }

    #[test]
    fn test_from_hex_rejects_bad_input() {
        assert!(matches!(
            from_hex("abcd"),
            Err(HashlockError::InvalidLength { expected: 32, actual: 2 })
        ));
        assert!(matches!(from_hex("zz"), Err(HashlockError::InvalidHex(_))));
    }
}
