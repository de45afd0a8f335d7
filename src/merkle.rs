// src/merkle.rs
// Binary Merkle tree over ordered leaf hashes with positional inclusion proofs.

use crate::crypto::{CanonicalBytes, Hash};
use crate::errors::{ChainError, Result};
use serde::{Deserialize, Serialize};

/// Tree height cap; 2^20 leaves covers about a million chunks per session.
pub const MAX_TREE_HEIGHT: usize = 20;
pub const MAX_LEAVES: usize = 1 << MAX_TREE_HEIGHT;

/// Internal node domain separation prefix.
const INTERNAL_PREFIX: u8 = 0x01;

fn hash_internal(left: &Hash, right: &Hash) -> Hash {
    CanonicalBytes::tagged(&[INTERNAL_PREFIX])
        .digest(left)
        .digest(right)
        .hash()
}

/// Merkle inclusion proof. The side of each sibling is taken from the bits of
/// `leaf_index`, so a proof only verifies at the position it was generated for.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    pub leaf_hash: Hash,
    pub leaf_index: usize,
    /// Siblings from leaf level up to (excluding) the root.
    pub sibling_hashes: Vec<Hash>,
    pub root: Hash,
}

impl MerkleProof {
    pub fn verify(&self) -> bool {
        verify_merkle_proof(self)
    }
}

/// Immutable tree stored level by level; `levels[0]` are the leaves, the last
/// level holds only the root.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MerkleTree {
    levels: Vec<Vec<Hash>>,
}

impl MerkleTree {
    pub fn from_leaves(leaves: &[Hash]) -> Result<Self> {
        if leaves.is_empty() {
            return Err(ChainError::EmptyInput);
        }
        if leaves.len() > MAX_LEAVES {
            return Err(ChainError::TooManyLeaves {
                count: leaves.len(),
                max: MAX_LEAVES,
            });
        }

        let mut levels = vec![leaves.to_vec()];
        while let Some(prev) = levels.last().filter(|l| l.len() > 1) {
            let next: Vec<Hash> = prev
                .chunks(2)
                .map(|pair| match pair {
                    [left, right] => hash_internal(left, right),
                    // odd count: duplicate the last node
                    [last] => hash_internal(last, last),
                    _ => unreachable!("chunks(2) yields one or two items"),
                })
                .collect();
            levels.push(next);
        }
        Ok(MerkleTree { levels })
    }

    pub fn root(&self) -> Hash {
        // from_leaves guarantees a non-empty top level
        self.levels[self.levels.len() - 1][0]
    }

    pub fn leaves(&self) -> &[Hash] {
        &self.levels[0]
    }

    pub fn leaf_count(&self) -> usize {
        self.levels[0].len()
    }

    pub fn height(&self) -> usize {
        self.levels.len() - 1
    }

    pub fn proof(&self, leaf_index: usize) -> Result<MerkleProof> {
        let len = self.leaf_count();
        if leaf_index >= len {
            return Err(ChainError::IndexOutOfRange {
                index: leaf_index,
                len,
            });
        }

        let mut siblings = Vec::with_capacity(self.height());
        let mut idx = leaf_index;
        for level in &self.levels[..self.levels.len() - 1] {
            let sibling = idx ^ 1;
            // past the end means this node was paired with itself
            siblings.push(*level.get(sibling).unwrap_or(&level[idx]));
            idx >>= 1;
        }

        Ok(MerkleProof {
            leaf_hash: self.levels[0][leaf_index],
            leaf_index,
            sibling_hashes: siblings,
            root: self.root(),
        })
    }
}

pub fn build_merkle_tree(ordered_leaf_hashes: &[Hash]) -> Result<MerkleTree> {
    MerkleTree::from_leaves(ordered_leaf_hashes)
}

pub fn generate_merkle_proof(tree: &MerkleTree, leaf_index: usize) -> Result<MerkleProof> {
    tree.proof(leaf_index)
}

/// Recompute the root from the proof path. An invalid proof is `false`, not an error.
///
/// The proof does not carry the leaf count. Where a level was padded by
/// duplicating its last node, the last real leaf also verifies at the padded
/// position: in a 3-leaf tree the proof for index 2 verifies as index 3 too.
/// Callers that know the tree size should use [`verify_merkle_proof_in`].
pub fn verify_merkle_proof(proof: &MerkleProof) -> bool {
    let depth = proof.sibling_hashes.len();
    if depth > MAX_TREE_HEIGHT {
        return false;
    }
    // index must fit in the path, otherwise two indexes would share one proof
    if proof.leaf_index >> depth != 0 {
        return false;
    }

    let mut current = proof.leaf_hash;
    let mut idx = proof.leaf_index;
    for sibling in &proof.sibling_hashes {
        current = if idx & 1 == 0 {
            hash_internal(&current, sibling)
        } else {
            hash_internal(sibling, &current)
        };
        idx >>= 1;
    }
    current.ct_eq(&proof.root)
}

/// [`verify_merkle_proof`] for a tree of `leaf_count` leaves; padded positions
/// past the last leaf are rejected.
pub fn verify_merkle_proof_in(proof: &MerkleProof, leaf_count: usize) -> bool {
    proof.leaf_index < leaf_count && verify_merkle_proof(proof)
}

/// Root over transaction hashes for a block; the zero sentinel for an empty block.
pub fn merkle_root_or_zero(hashes: &[Hash]) -> Result<Hash> {
    if hashes.is_empty() {
        return Ok(Hash::ZERO);
    }
    Ok(MerkleTree::from_leaves(hashes)?.root())
}
