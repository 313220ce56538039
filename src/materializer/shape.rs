// File: src/materializer/shape.rs

//! Node numbering and Merkle proofs for fixed-depth binary trees
//!
//! Nodes are numbered heap-style: the root is node 1, the children of node
//! `n` are `2n` and `2n + 1`, and leaf `i` of a depth-`d` tree is node
//! `2^d + i`. Levels count up from the leaves (leaves are level 0, the root
//! is level `d`).

use sha2::{Digest, Sha256};

use crate::error::{ReplicaError, ReplicaResult};
use crate::types::NodeHash;

/// Largest depth whose node numbers fit in a u64
pub const MAX_DEPTH: u32 = 62;

/// Parent hash: `SHA-256(left || right)`
pub fn hash_children(left: &NodeHash, right: &NodeHash) -> NodeHash {
    let mut hasher = Sha256::new();
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// Hash of an all-empty subtree of the given level (empty leaf is zeroes)
pub fn empty_node(level: u32) -> NodeHash {
    let mut hash = [0u8; 32];
    for _ in 0..level {
        hash = hash_children(&hash, &hash);
    }
    hash
}

/// Geometry of one tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeShape {
    max_depth: u32,
}

impl TreeShape {
    pub fn new(max_depth: u32) -> ReplicaResult<Self> {
        if max_depth == 0 || max_depth > MAX_DEPTH {
            return Err(ReplicaError::InvalidEvent(format!(
                "unsupported tree depth {}",
                max_depth
            )));
        }
        Ok(Self { max_depth })
    }

    pub fn max_depth(&self) -> u32 {
        self.max_depth
    }

    /// Number of leaves
    pub fn capacity(&self) -> u64 {
        1u64 << self.max_depth
    }

    pub fn leaf_node_idx(&self, leaf_idx: u64) -> ReplicaResult<u64> {
        if leaf_idx >= self.capacity() {
            return Err(ReplicaError::LeafIndexOutOfBounds {
                index: leaf_idx,
                max_depth: self.max_depth,
            });
        }
        Ok(self.capacity() + leaf_idx)
    }

    /// Leaf index of a leaf node, `None` for inner nodes
    pub fn leaf_idx_of(&self, node_idx: u64) -> Option<u64> {
        let cap = self.capacity();
        (node_idx >= cap && node_idx < cap * 2).then(|| node_idx - cap)
    }

    /// Level of a node (0 for leaves), `None` if outside the tree
    pub fn level_of(&self, node_idx: u64) -> Option<u32> {
        if node_idx == 0 || node_idx >= self.capacity() * 2 {
            return None;
        }
        let depth_from_root = 63 - node_idx.leading_zeros();
        Some(self.max_depth - depth_from_root)
    }

    /// Node indexes from the leaf up to and including the root
    pub fn path_to_root(&self, leaf_idx: u64) -> ReplicaResult<Vec<u64>> {
        let mut node = self.leaf_node_idx(leaf_idx)?;
        let mut path = Vec::with_capacity(self.max_depth as usize + 1);
        while node >= 1 {
            path.push(node);
            node >>= 1;
        }
        Ok(path)
    }

    /// Sibling node indexes needed to prove `leaf_idx`, leaf level first
    pub fn proof_node_indexes(&self, leaf_idx: u64) -> ReplicaResult<Vec<u64>> {
        let path = self.path_to_root(leaf_idx)?;
        Ok(path
            .iter()
            .take(self.max_depth as usize)
            .map(|n| n ^ 1)
            .collect())
    }
}

/// Inclusion proof for one leaf
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleProof {
    pub leaf_idx: u64,
    pub node_idx: u64,
    pub leaf: NodeHash,
    /// Sibling hashes, leaf level first
    pub proof: Vec<NodeHash>,
    pub root: NodeHash,
}

impl MerkleProof {
    /// Recompute the root from the leaf and siblings
    pub fn computed_root(&self) -> NodeHash {
        let mut hash = self.leaf;
        let mut idx = self.leaf_idx;
        for sibling in &self.proof {
            hash = if idx & 1 == 0 {
                hash_children(&hash, sibling)
            } else {
                hash_children(sibling, &hash)
            };
            idx >>= 1;
        }
        hash
    }

    pub fn verify(&self) -> bool {
        self.computed_root() == self.root
    }

    /// Drop the top `canopy_depth` siblings, which are cached on chain
    pub fn without_canopy(mut self, canopy_depth: u32) -> Self {
        let keep = self.proof.len().saturating_sub(canopy_depth as usize);
        self.proof.truncate(keep);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_numbering() {
        let shape = TreeShape::new(3).unwrap();
        assert_eq!(shape.capacity(), 8);
        assert_eq!(shape.leaf_node_idx(0).unwrap(), 8);
        assert_eq!(shape.leaf_node_idx(7).unwrap(), 15);
        assert!(matches!(
            shape.leaf_node_idx(8),
            Err(ReplicaError::LeafIndexOutOfBounds { index: 8, .. })
        ));
        assert_eq!(shape.path_to_root(5).unwrap(), vec![13, 6, 3, 1]);
        assert_eq!(shape.proof_node_indexes(5).unwrap(), vec![12, 7, 2]);
        assert_eq!(shape.leaf_idx_of(13), Some(5));
        assert_eq!(shape.leaf_idx_of(6), None);
    }

    #[test]
    fn test_levels() {
        let shape = TreeShape::new(3).unwrap();
        assert_eq!(shape.level_of(1), Some(3));
        assert_eq!(shape.level_of(3), Some(2));
        assert_eq!(shape.level_of(6), Some(1));
        assert_eq!(shape.level_of(13), Some(0));
        assert_eq!(shape.level_of(16), None);
        assert_eq!(shape.level_of(0), None);
    }

    #[test]
    fn test_rejects_bad_depth() {
        assert!(TreeShape::new(0).is_err());
        assert!(TreeShape::new(MAX_DEPTH + 1).is_err());
    }

    #[test]
    fn test_empty_nodes() {
        assert_eq!(empty_node(0), [0u8; 32]);
        assert_eq!(empty_node(1), hash_children(&[0u8; 32], &[0u8; 32]));
        assert_eq!(empty_node(2), hash_children(&empty_node(1), &empty_node(1)));
    }

    #[test]
    fn test_proof_over_empty_tree() {
        let leaf = [5u8; 32];
        // depth 2, leaf 1 set
        let parent = hash_children(&[0u8; 32], &leaf);
        let root = hash_children(&parent, &empty_node(1));
        let proof = MerkleProof {
            leaf_idx: 1,
            node_idx: 5,
            leaf,
            proof: vec![[0u8; 32], empty_node(1)],
            root,
        };
        assert!(proof.verify());

        let mut wrong = proof.clone();
        wrong.leaf_idx = 0;
        assert!(!wrong.verify());

        assert_eq!(proof.without_canopy(1).proof.len(), 1);
    }
}
