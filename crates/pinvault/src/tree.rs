//! hash tree geometry and node hashing
//!
//! a complete `fan_out`-ary tree over `2^label_bits` leaves. nodes are kept
//! in one flat array, leaf level first and the root last:
//!
//! ```text
//! level depth:            [root]
//! level 1:        [n0]     [n1]    [n2]    [n3]
//! level 0:   [l0 l1 l2 l3][l4 .. ]  ...
//! ```
//!
//! an empty leaf hashes to 32 zero bytes; an inner node is
//! sha256(child_0 || .. || child_{fan_out-1}).

use serde::{Deserialize, Serialize};

use crate::crypto::{sha256, Hash};
use crate::error::{HashTreeError, HashTreeResult};

/// hash of a free leaf
pub const EMPTY_HASH: Hash = [0u8; 32];

const MAX_LABEL_BITS: u32 = 20;
const MAX_BITS_PER_LEVEL: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeGeometry {
    label_bits: u32,
    bits_per_level: u32,
}

impl Default for TreeGeometry {
    fn default() -> Self {
        // 16384 leaves, fan-out 4
        Self { label_bits: 14, bits_per_level: 2 }
    }
}

impl TreeGeometry {
    pub fn new(label_bits: u32, bits_per_level: u32) -> HashTreeResult<Self> {
        if bits_per_level == 0 || bits_per_level > MAX_BITS_PER_LEVEL {
            return Err(HashTreeError::InvalidGeometry(format!(
                "bits_per_level must be in 1..={}",
                MAX_BITS_PER_LEVEL
            )));
        }
        if label_bits == 0 || label_bits > MAX_LABEL_BITS {
            return Err(HashTreeError::InvalidGeometry(format!(
                "label_bits must be in 1..={}",
                MAX_LABEL_BITS
            )));
        }
        if label_bits % bits_per_level != 0 {
            return Err(HashTreeError::InvalidGeometry(
                "label_bits must be a multiple of bits_per_level".into(),
            ));
        }
        Ok(Self { label_bits, bits_per_level })
    }

    pub fn label_bits(&self) -> u32 {
        self.label_bits
    }

    pub fn bits_per_level(&self) -> u32 {
        self.bits_per_level
    }

    pub fn fan_out(&self) -> usize {
        1 << self.bits_per_level
    }

    /// number of edges between a leaf and the root
    pub fn depth(&self) -> usize {
        (self.label_bits / self.bits_per_level) as usize
    }

    pub fn num_leaves(&self) -> u64 {
        1 << self.label_bits
    }

    pub fn contains(&self, label: u64) -> bool {
        label < self.num_leaves()
    }

    /// number of nodes on `level` (0 = leaves)
    pub fn level_len(&self, level: usize) -> usize {
        1 << (self.bits_per_level as usize * (self.depth() - level))
    }

    /// flat index of the first node on `level`
    pub fn level_offset(&self, level: usize) -> usize {
        (0..level).map(|l| self.level_len(l)).sum()
    }

    pub fn total_nodes(&self) -> usize {
        self.level_offset(self.depth() + 1)
    }

    pub fn root_index(&self) -> usize {
        self.total_nodes() - 1
    }
}

/// sibling hashes along the path from one leaf to the root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InclusionProof {
    pub label: u64,
    pub fan_out: usize,
    /// one entry per level, bottom-up; `fan_out - 1` siblings each,
    /// ordered by child position with the path node left out
    pub siblings: Vec<Vec<Hash>>,
}

impl InclusionProof {
    /// recompute the root implied by `leaf_hash` and this path
    pub fn compute_root(&self, leaf_hash: &Hash) -> Hash {
        let mut current = *leaf_hash;
        let mut index = self.label as usize;
        for level in &self.siblings {
            let position = index % self.fan_out;
            let mut children: Vec<&[u8]> = Vec::with_capacity(self.fan_out);
            let mut rest = level.iter();
            for slot in 0..self.fan_out {
                if slot == position {
                    children.push(&current);
                } else if let Some(sibling) = rest.next() {
                    children.push(sibling);
                }
            }
            current = sha256(&children);
            index /= self.fan_out;
        }
        current
    }

    pub fn verify(&self, leaf_hash: &Hash, root: &Hash) -> bool {
        self.compute_root(leaf_hash) == *root
    }
}

/// in-memory node hashes for a whole tree
#[derive(Debug, Clone)]
pub struct HashTree {
    geometry: TreeGeometry,
    nodes: Vec<Hash>,
}

impl HashTree {
    /// tree with every leaf free
    pub fn empty(geometry: TreeGeometry) -> Self {
        let leaves = vec![EMPTY_HASH; geometry.level_len(0)];
        Self::from_leaf_hashes(geometry, &leaves)
    }

    /// build all inner nodes from the leaf level
    pub fn from_leaf_hashes(geometry: TreeGeometry, leaves: &[Hash]) -> Self {
        let mut nodes = vec![EMPTY_HASH; geometry.total_nodes()];
        let n = leaves.len().min(geometry.level_len(0));
        nodes[..n].copy_from_slice(&leaves[..n]);
        let mut tree = Self { geometry, nodes };
        tree.rebuild();
        tree
    }

    pub fn geometry(&self) -> &TreeGeometry {
        &self.geometry
    }

    pub fn nodes(&self) -> &[Hash] {
        &self.nodes
    }

    pub fn leaf_hashes(&self) -> &[Hash] {
        &self.nodes[..self.geometry.level_len(0)]
    }

    pub fn root(&self) -> Hash {
        self.nodes[self.geometry.root_index()]
    }

    pub fn leaf_hash(&self, label: u64) -> Hash {
        self.nodes[label as usize]
    }

    /// recompute every inner node from the leaf level
    pub fn rebuild(&mut self) {
        let f = self.geometry.fan_out();
        for level in 1..=self.geometry.depth() {
            let child_off = self.geometry.level_offset(level - 1);
            let off = self.geometry.level_offset(level);
            for i in 0..self.geometry.level_len(level) {
                let start = child_off + i * f;
                let h = hash_children(&self.nodes[start..start + f]);
                self.nodes[off + i] = h;
            }
        }
    }

    /// set one leaf hash and update its path to the root
    ///
    /// returns the flat indices touched, leaf first and root last.
    pub fn set_leaf(&mut self, label: u64, leaf_hash: Hash) -> Vec<usize> {
        let f = self.geometry.fan_out();
        let mut touched = Vec::with_capacity(self.geometry.depth() + 1);
        let mut index = label as usize;
        self.nodes[index] = leaf_hash;
        touched.push(index);

        for level in 1..=self.geometry.depth() {
            let parent = index / f;
            let child_off = self.geometry.level_offset(level - 1);
            let start = child_off + parent * f;
            let h = hash_children(&self.nodes[start..start + f]);
            let flat = self.geometry.level_offset(level) + parent;
            self.nodes[flat] = h;
            touched.push(flat);
            index = parent;
        }
        touched
    }

    /// siblings of every node on the path from `label` to the root
    pub fn proof(&self, label: u64) -> InclusionProof {
        let f = self.geometry.fan_out();
        let mut siblings = Vec::with_capacity(self.geometry.depth());
        let mut index = label as usize;
        for level in 0..self.geometry.depth() {
            let off = self.geometry.level_offset(level);
            let first = index - index % f;
            let level_siblings = (first..first + f)
                .filter(|&i| i != index)
                .map(|i| self.nodes[off + i])
                .collect();
            siblings.push(level_siblings);
            index /= f;
        }
        InclusionProof { label, fan_out: f, siblings }
    }
}

fn hash_children(children: &[Hash]) -> Hash {
    let parts: Vec<&[u8]> = children.iter().map(|c| c.as_slice()).collect();
    sha256(&parts)
}
