//! Ordered-pair Merkle trees for partial-fill hashlocks.
//!
//! Children are sorted lexicographically before concatenation and
//! hashing, which makes proofs position-agnostic: verification folds
//! the proof without needing left/right direction bits. The on-chain
//! escrow verifiers use the same rule, so a root computed here gates
//! withdrawals on both chains.

use sha2::{Digest, Sha256};

use crate::{Bytes32, HashlockError};

/// Upper bound on leaves per tree. Orders in this system use at most
/// four segments; eight leaves keeps headroom without unbounded trees.
pub const MAX_LEAVES: usize = 8;

/// A built tree: the root commitment and one proof per input leaf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleTree {
    pub root: Bytes32,
    pub proofs: Vec<Vec<Bytes32>>,
}

/// Hash an ordered pair: SHA-256 over the lexicographically smaller
/// child followed by the larger.
pub fn hash_pair(a: &Bytes32, b: &Bytes32) -> Bytes32 {
    let mut hasher = Sha256::new();
    if a <= b {
        hasher.update(a);
        hasher.update(b);
    } else {
        hasher.update(b);
        hasher.update(a);
    }
    let digest = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

/// Build the tree over `leaves` and derive a proof for every leaf.
///
/// A single leaf is its own root with an empty proof. Odd nodes at any
/// level are promoted unhashed, so three leaves produce
/// `hash(hash(l0, l1), l2)`.
pub fn build_tree(leaves: &[Bytes32]) -> Result<MerkleTree, HashlockError> {
    if leaves.is_empty() || leaves.len() > MAX_LEAVES {
        return Err(HashlockError::InvalidLeafCount {
            max: MAX_LEAVES,
            actual: leaves.len(),
        });
    }

    let mut levels: Vec<Vec<Bytes32>> = vec![leaves.to_vec()];
    while levels.last().expect("at least one level").len() > 1 {
        let prev = levels.last().expect("at least one level");
        let mut next = Vec::with_capacity((prev.len() + 1) / 2);
        for pair in prev.chunks(2) {
            match pair {
                [left, right] => next.push(hash_pair(left, right)),
                [odd] => next.push(*odd),
                _ => unreachable!(),
            }
        }
        levels.push(next);
    }

    let root = levels.last().expect("at least one level")[0];

    let mut proofs = Vec::with_capacity(leaves.len());
    for leaf_index in 0..leaves.len() {
        let mut proof = Vec::new();
        let mut index = leaf_index;
        for level in &levels[..levels.len() - 1] {
            let sibling = index ^ 1;
            if sibling < level.len() {
                proof.push(level[sibling]);
            }
            index /= 2;
        }
        proofs.push(proof);
    }

    Ok(MerkleTree { root, proofs })
}

/// Fold `proof` over `leaf` with sorted-pair hashing and compare the
/// result to `root`.
pub fn verify(leaf: &Bytes32, proof: &[Bytes32], root: &Bytes32) -> bool {
    let mut computed = *leaf;
    for element in proof {
        computed = hash_pair(&computed, element);
    }
    computed == *root
}
