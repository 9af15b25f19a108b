use quorum_crypto::{keccak256, keccak256_concat, recover_signer, Keypair, Signature, SHARE_TAG};
use quorum_types::{Epoch, LedgerTime, NodeId, H256};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::codec::ErasureCodec;
use crate::commitment::{verify_leaf, zero_leaf, Commitment, MerkleProof, MerkleTree};
use crate::config::{CommitmentStrategy, DasConfig};
use crate::{DasError, Result};

/// Size of a node hash in a node-tree slot.
const HASH_LEN: usize = 32;

/// Shape of an epoch's encoding, posted next to the commitment so any
/// observer can check shares and proofs without the object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecLayout {
    pub strategy: CommitmentStrategy,
    pub unit_size: u64,
    pub redundancy_factor: u64,
    pub object_len: u64,
    pub data_units: u64,
    pub shard_len: u64,
}

impl CodecLayout {
    /// Layout the sharer uses for an object of `object_len` bytes.
    pub fn for_object(config: &DasConfig, object_len: u64) -> Result<Self> {
        let leaves = leaf_count(object_len, config.unit_size as u64);
        let codec_unit = codec_unit(config.strategy, config.unit_size);
        let codec = ErasureCodec::new(codec_unit, config.redundancy_factor)?;
        let data_units = match config.strategy {
            CommitmentStrategy::RawObject => leaves,
            CommitmentStrategy::NodeTree => 2 * leaves.next_power_of_two() - 1,
        };
        let shard_len = codec.shard_len_for(data_units as usize)?;
        Ok(Self {
            strategy: config.strategy,
            unit_size: config.unit_size as u64,
            redundancy_factor: config.redundancy_factor as u64,
            object_len,
            data_units,
            shard_len: shard_len as u64,
        })
    }

    /// Rejects layouts that could not come from `for_object`.
    pub fn validate(&self) -> Result<()> {
        if self.unit_size == 0 || self.redundancy_factor < 2 {
            return Err(DasError::InvalidConfig(format!("degenerate layout {:?}", self)));
        }
        let leaves = leaf_count(self.object_len, self.unit_size);
        let expected_units = match self.strategy {
            CommitmentStrategy::RawObject => leaves,
            CommitmentStrategy::NodeTree => 2 * leaves.next_power_of_two() - 1,
        };
        if self.data_units != expected_units {
            return Err(DasError::InvalidConfig(format!(
                "{} data units for a {} byte object, expected {}",
                self.data_units, self.object_len, expected_units
            )));
        }
        let shard_len = self.codec()?.shard_len_for(self.data_units as usize)?;
        if self.shard_len != shard_len as u64 {
            return Err(DasError::InvalidConfig(format!(
                "shard length {}, expected {}",
                self.shard_len, shard_len
            )));
        }
        Ok(())
    }

    pub fn codec(&self) -> Result<ErasureCodec> {
        ErasureCodec::new(
            codec_unit(self.strategy, self.unit_size as usize),
            self.redundancy_factor as usize,
        )
    }

    pub fn total_shares(&self) -> usize {
        (self.data_units * self.redundancy_factor) as usize
    }

    /// Distinct shares needed to reconstruct.
    pub fn threshold(&self) -> usize {
        self.data_units as usize
    }

    /// Bytes of a data unit before codec padding.
    pub fn node_size(&self) -> usize {
        codec_unit(self.strategy, self.unit_size as usize)
    }

    /// Leaf slots of the object tree, padding included.
    pub fn tree_width(&self) -> usize {
        leaf_count(self.object_len, self.unit_size).next_power_of_two() as usize
    }

    /// Length of the encoded payload.
    pub fn payload_len(&self) -> u64 {
        match self.strategy {
            CommitmentStrategy::RawObject => self.object_len,
            CommitmentStrategy::NodeTree => self.data_units * self.node_size() as u64,
        }
    }
}

fn leaf_count(object_len: u64, unit_size: u64) -> u64 {
    object_len.div_ceil(unit_size.max(1)).max(1)
}

fn codec_unit(strategy: CommitmentStrategy, unit_size: usize) -> usize {
    match strategy {
        CommitmentStrategy::RawObject => unit_size,
        CommitmentStrategy::NodeTree => unit_size.max(HASH_LEN),
    }
}

/// Ledger record of one sharer epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostedCommitment {
    pub sharer: NodeId,
    pub epoch: Epoch,
    pub commitment: Commitment,
    pub share_root: Commitment,
    pub layout: CodecLayout,
    pub posted_at: LedgerTime,
    pub deadline: LedgerTime,
}

impl PostedCommitment {
    pub fn is_expired(&self, now: LedgerTime) -> bool {
        now > self.deadline
    }
}

/// One erasure coded fragment, signed by its sharer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Share {
    pub sharer: NodeId,
    pub epoch: Epoch,
    pub index: u32,
    pub commitment: Commitment,
    pub share_root: Commitment,
    pub data: Vec<u8>,
    pub proof: MerkleProof,
    pub signature: Signature,
}

impl Share {
    /// Digest the sharer signs.
    pub fn signing_digest(
        epoch: Epoch,
        commitment: &Commitment,
        share_root: &Commitment,
        index: u32,
        data: &[u8],
    ) -> H256 {
        keccak256_concat(&[
            &[SHARE_TAG],
            &epoch.to_be_bytes(),
            commitment.0.as_bytes(),
            share_root.0.as_bytes(),
            &index.to_be_bytes(),
            keccak256(data).as_bytes(),
        ])
    }

    pub fn digest(&self) -> H256 {
        Self::signing_digest(self.epoch, &self.commitment, &self.share_root, self.index, &self.data)
    }

    /// Checks the share against the posted record of its epoch: binding
    /// fields, shape, sharer signature and inclusion under the share root.
    pub fn verify(&self, record: &PostedCommitment) -> Result<()> {
        if self.sharer != record.sharer || self.epoch != record.epoch {
            return Err(DasError::InvalidShare(format!(
                "share {} belongs to {}/{}, not {}/{}",
                self.index, self.sharer, self.epoch, record.sharer, record.epoch
            )));
        }
        if self.commitment != record.commitment || self.share_root != record.share_root {
            return Err(DasError::InvalidShare(format!(
                "share {} is bound to a different commitment",
                self.index
            )));
        }
        let total = record.layout.total_shares();
        if self.index as usize >= total {
            return Err(DasError::InvalidShare(format!(
                "index {} out of range for {} shares",
                self.index, total
            )));
        }
        if self.data.len() as u64 != record.layout.shard_len {
            return Err(DasError::InvalidShare(format!(
                "share {} has {} bytes, expected {}",
                self.index,
                self.data.len(),
                record.layout.shard_len
            )));
        }

        let signer = recover_signer(&self.digest(), &self.signature)
            .map_err(|e| DasError::InvalidShare(format!("share {}: {}", self.index, e)))?;
        if signer != record.sharer {
            return Err(DasError::InvalidShare(format!(
                "share {} signed by {} instead of {}",
                self.index, signer, record.sharer
            )));
        }

        if !verify_leaf(&record.share_root, total as u64, self.index as u64, &self.data, &self.proof) {
            return Err(DasError::InvalidShare(format!(
                "share {} is not included under the share root",
                self.index
            )));
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| DasError::Transport(format!("share encoding: {}", e)))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| DasError::InvalidShare(format!("undecodable frame: {}", e)))
    }
}

/// Output of the sharer side of an epoch. The record's `posted_at` and
/// `deadline` are stamped by the ledger.
#[derive(Debug, Clone)]
pub struct PreparedEpoch {
    pub record: PostedCommitment,
    pub shares: Vec<Share>,
}

impl PreparedEpoch {
    pub fn share(&self, index: u32) -> Option<&Share> {
        self.shares.get(index as usize)
    }
}

/// Encode, commit and sign an object for one epoch.
pub fn prepare_shares(
    keypair: &Keypair,
    config: &DasConfig,
    epoch: Epoch,
    object: &[u8],
) -> Result<PreparedEpoch> {
    config.validate()?;
    let layout = CodecLayout::for_object(config, object.len() as u64)?;
    let tree = MerkleTree::over_object(object, config.unit_size);
    let commitment = tree.commitment();

    let payload = match config.strategy {
        CommitmentStrategy::RawObject => object.to_vec(),
        CommitmentStrategy::NodeTree => node_tree_payload(&tree, object, config.unit_size),
    };

    info!(
        "Prepared epoch {} for {}: {} bytes, commitment {}",
        epoch,
        keypair.id(),
        object.len(),
        commitment
    );
    seal_payload(keypair, epoch, commitment, layout, &payload)
}

/// Encode an arbitrary payload and sign its shares as bound to
/// `commitment`. Honest sharers reach this through `prepare_shares`.
pub fn seal_payload(
    keypair: &Keypair,
    epoch: Epoch,
    commitment: Commitment,
    layout: CodecLayout,
    payload: &[u8],
) -> Result<PreparedEpoch> {
    let codec = layout.codec()?;
    let encoded = codec.encode(payload)?;
    if encoded.data_units as u64 != layout.data_units {
        return Err(DasError::Codec(format!(
            "payload encodes to {} data units, layout expects {}",
            encoded.data_units, layout.data_units
        )));
    }
    seal_shards(keypair, epoch, commitment, layout, encoded.shards)
}

/// Sign already encoded shards.
pub fn seal_shards(
    keypair: &Keypair,
    epoch: Epoch,
    commitment: Commitment,
    layout: CodecLayout,
    shards: Vec<Vec<u8>>,
) -> Result<PreparedEpoch> {
    let share_tree = MerkleTree::over_shares(&shards);
    let share_root = share_tree.commitment();
    let sharer = keypair.id();

    let shares = shards
        .into_par_iter()
        .enumerate()
        .map(|(i, data)| {
            let index = i as u32;
            let digest = Share::signing_digest(epoch, &commitment, &share_root, index, &data);
            let proof = share_tree
                .prove(i)
                .ok_or_else(|| DasError::Codec(format!("no proof for share {}", i)))?;
            Ok(Share {
                sharer,
                epoch,
                index,
                commitment,
                share_root,
                data,
                proof,
                signature: keypair.sign(&digest)?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    debug!("Signed {} shares under share root {}", shares.len(), share_root);

    Ok(PreparedEpoch {
        record: PostedCommitment {
            sharer,
            epoch,
            commitment,
            share_root,
            layout,
            posted_at: LedgerTime::ZERO,
            deadline: LedgerTime::ZERO,
        },
        shares,
    })
}

/// Heap-ordered node slots of the object tree: slot `u` holds node
/// `u + 1`, internal nodes as their hash, leaves as their chunk.
pub fn node_tree_payload(tree: &MerkleTree, object: &[u8], unit_size: usize) -> Vec<u8> {
    let node_size = unit_size.max(HASH_LEN);
    let width = tree.width();
    let mut payload = vec![0u8; (2 * width - 1) * node_size];

    payload
        .par_chunks_mut(node_size)
        .enumerate()
        .for_each(|(slot, out)| {
            let heap = slot + 1;
            if heap < width {
                if let Some(hash) = tree.node(heap) {
                    out[..HASH_LEN].copy_from_slice(hash.as_bytes());
                }
            } else {
                let start = ((heap - width) * unit_size).min(object.len());
                let end = (start + unit_size).min(object.len());
                out[..end - start].copy_from_slice(&object[start..end]);
            }
        });
    payload
}

/// Decoded node slots viewed as the claimed tree.
pub(crate) struct NodeTreeView<'a> {
    units: &'a [Vec<u8>],
    width: usize,
    unit_size: usize,
}

impl<'a> NodeTreeView<'a> {
    pub(crate) fn new(units: &'a [Vec<u8>], layout: &CodecLayout) -> Result<Self> {
        let width = layout.tree_width();
        if units.len() != 2 * width - 1 {
            return Err(DasError::Codec(format!(
                "{} node slots for a tree of width {}",
                units.len(),
                width
            )));
        }
        Ok(Self {
            units,
            width,
            unit_size: layout.unit_size as usize,
        })
    }

    pub(crate) fn width(&self) -> usize {
        self.width
    }

    pub(crate) fn slot(&self, heap: usize) -> &[u8] {
        &self.units[heap - 1]
    }

    /// Hash the slot stands for: the stored hash of an internal node or
    /// the leaf hash of a leaf chunk.
    pub(crate) fn distributed(&self, heap: usize) -> H256 {
        slot_hash(self.slot(heap), heap, self.width, self.unit_size)
    }

    pub(crate) fn leaf_chunk(&self, leaf: usize) -> &[u8] {
        &self.slot(self.width + leaf)[..self.unit_size]
    }

    /// Tree recomputed from the distributed leaves only.
    pub(crate) fn recomputed(&self, object_len: u64) -> MerkleTree {
        let hashes = (0..self.width)
            .into_par_iter()
            .map(|leaf| quorum_crypto::leaf_hash(self.leaf_chunk(leaf)))
            .collect();
        MerkleTree::from_leaf_hashes(hashes, zero_leaf(self.unit_size), object_len)
    }

    pub(crate) fn object(&self, object_len: u64) -> Vec<u8> {
        let mut object = Vec::with_capacity(self.width * self.unit_size);
        for leaf in 0..self.width {
            object.extend_from_slice(self.leaf_chunk(leaf));
        }
        object.truncate(object_len as usize);
        object
    }
}

/// Hash represented by a node slot at `heap` in a tree of `width` leaves.
pub(crate) fn slot_hash(slot: &[u8], heap: usize, width: usize, unit_size: usize) -> H256 {
    if heap >= width {
        quorum_crypto::leaf_hash(&slot[..unit_size])
    } else {
        H256::from_slice(&slot[..HASH_LEN])
    }
}
