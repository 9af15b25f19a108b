use quorum_crypto::{leaf_hash, node_hash, seal_hash};
use quorum_types::H256;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Proofs deeper than this cannot come from a tree we would build.
const MAX_DEPTH: usize = 48;

/// Sealed Merkle root binding a party to some content.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Commitment(pub H256);

impl Commitment {
    pub fn as_h256(&self) -> &H256 {
        &self.0
    }
}

impl fmt::Display for Commitment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

impl fmt::Debug for Commitment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Commitment({:x})", self.0)
    }
}

/// Inclusion proof of one leaf; siblings run from the leaf up to the root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    pub leaf_index: u64,
    pub siblings: Vec<H256>,
}

/// Binary Merkle tree in heap layout.
///
/// Node `1` is the root, node `i` has children `2i` and `2i + 1`, leaves
/// occupy `width..2 * width`. The leaf count is padded to a power of two
/// with a caller-chosen padding leaf.
#[derive(Debug, Clone)]
pub struct MerkleTree {
    nodes: Vec<H256>,
    width: usize,
    leaves: usize,
    sealed_len: u64,
}

impl MerkleTree {
    /// Builds the tree over precomputed leaf hashes.
    pub fn from_leaf_hashes(mut leaves: Vec<H256>, padding: H256, sealed_len: u64) -> Self {
        let count = leaves.len();
        let width = count.max(1).next_power_of_two();
        leaves.resize(width, padding);

        let mut nodes = vec![H256::zero(); width];
        nodes.extend(leaves);
        for i in (1..width).rev() {
            nodes[i] = node_hash(&nodes[2 * i], &nodes[2 * i + 1]);
        }

        Self {
            nodes,
            width,
            leaves: count,
            sealed_len,
        }
    }

    /// Tree over the fixed-size chunks of an object.
    pub fn over_object(object: &[u8], unit_size: usize) -> Self {
        let mut hashes: Vec<H256> = object.par_chunks(unit_size).map(chunk_leaf(unit_size)).collect();
        if hashes.is_empty() {
            hashes.push(zero_leaf(unit_size));
        }
        Self::from_leaf_hashes(hashes, zero_leaf(unit_size), object.len() as u64)
    }

    /// Tree over a share sequence, sealed with the share count.
    pub fn over_shares(shares: &[Vec<u8>]) -> Self {
        let hashes: Vec<H256> = shares.par_iter().map(|share| leaf_hash(share)).collect();
        Self::from_leaf_hashes(hashes, leaf_hash(&[]), shares.len() as u64)
    }

    pub fn root(&self) -> H256 {
        self.nodes[1]
    }

    pub fn commitment(&self) -> Commitment {
        Commitment(seal_hash(self.sealed_len, &self.root()))
    }

    pub fn sealed_len(&self) -> u64 {
        self.sealed_len
    }

    /// Leaf slots, padding included.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Leaves supplied before padding.
    pub fn leaf_count(&self) -> usize {
        self.leaves
    }

    pub fn depth(&self) -> usize {
        self.width.trailing_zeros() as usize
    }

    /// Hash stored at a heap index.
    pub fn node(&self, heap_index: usize) -> Option<H256> {
        if heap_index == 0 {
            return None;
        }
        self.nodes.get(heap_index).copied()
    }

    pub fn prove(&self, leaf_index: usize) -> Option<MerkleProof> {
        if leaf_index >= self.width {
            return None;
        }
        Some(MerkleProof {
            leaf_index: leaf_index as u64,
            siblings: self.path(self.width + leaf_index),
        })
    }

    /// Siblings from `heap_index` up to, but excluding, the root.
    pub fn path(&self, heap_index: usize) -> Vec<H256> {
        let mut siblings = Vec::with_capacity(self.depth());
        let mut index = heap_index;
        while index > 1 {
            siblings.push(self.nodes[index ^ 1]);
            index /= 2;
        }
        siblings
    }
}

fn chunk_leaf(unit_size: usize) -> impl Fn(&[u8]) -> H256 + Sync + Send {
    move |chunk: &[u8]| {
        if chunk.len() == unit_size {
            leaf_hash(chunk)
        } else {
            let mut padded = chunk.to_vec();
            padded.resize(unit_size, 0);
            leaf_hash(&padded)
        }
    }
}

/// Hash of an all-zero leaf chunk.
pub fn zero_leaf(unit_size: usize) -> H256 {
    leaf_hash(&vec![0u8; unit_size])
}

/// Commitment of an object cut into `unit_size` leaves.
pub fn commit(object: &[u8], unit_size: usize) -> Commitment {
    MerkleTree::over_object(object, unit_size).commitment()
}

/// Commitment of a share sequence.
pub fn commit_shares(shares: &[Vec<u8>]) -> Commitment {
    MerkleTree::over_shares(shares).commitment()
}

/// Hashes `node` at `heap_index` up the authentication path.
///
/// Returns `None` when the path length does not bring the index to the
/// root.
pub fn fold_path(heap_index: u64, node: H256, siblings: &[H256]) -> Option<H256> {
    if heap_index == 0 || siblings.len() > MAX_DEPTH {
        return None;
    }
    let mut index = heap_index;
    let mut acc = node;
    for sibling in siblings {
        acc = if index % 2 == 0 {
            node_hash(&acc, sibling)
        } else {
            node_hash(sibling, &acc)
        };
        index /= 2;
    }
    (index == 1).then_some(acc)
}

/// Checks that `node` sits at `heap_index` under `commitment`.
pub fn verify_node(
    commitment: &Commitment,
    sealed_len: u64,
    heap_index: u64,
    node: H256,
    siblings: &[H256],
) -> bool {
    fold_path(heap_index, node, siblings)
        .map(|root| seal_hash(sealed_len, &root) == commitment.0)
        .unwrap_or(false)
}

/// Checks a leaf inclusion proof in O(log n) hashes.
pub fn verify_leaf(
    commitment: &Commitment,
    sealed_len: u64,
    index: u64,
    leaf: &[u8],
    proof: &MerkleProof,
) -> bool {
    let depth = proof.siblings.len();
    if proof.leaf_index != index || depth > MAX_DEPTH {
        return false;
    }
    let width = 1u64 << depth;
    if index >= width {
        return false;
    }
    verify_node(commitment, sealed_len, width + index, leaf_hash(leaf), &proof.siblings)
}
