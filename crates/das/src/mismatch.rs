//! Mismatch proofs.
//!
//! With the raw strategy the only evidence is the decoded object itself.
//! With the node-tree strategy the prover walks the distributed tree from
//! the root and stops at the first node whose distributed children do not
//! hash to it. Two child slots, their share proofs and the node's path to
//! the commitment are then enough to convince anyone holding the posted
//! record.

use quorum_crypto::{keccak256, node_hash, seal_hash};
use quorum_types::{Epoch, NodeId, H256};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::commitment::{verify_leaf, verify_node, Commitment, MerkleProof, MerkleTree};
use crate::config::CommitmentStrategy;
use crate::reconstruction::{object_from_units, Reconstruction};
use crate::share::{slot_hash, CodecLayout, NodeTreeView, PostedCommitment};
use crate::{DasError, Result};

/// A distributed node slot together with its inclusion proof under the
/// share root. Slot `heap_index - 1` is data share `heap_index - 1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvenNode {
    pub heap_index: u64,
    pub slot: Vec<u8>,
    pub share_proof: MerkleProof,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MismatchEvidence {
    /// Every decoded data unit.
    FullObject { units: Vec<Vec<u8>> },
    /// Node `heap_index` is committed to `expected`, but its distributed
    /// children hash to something else.
    NodeDivergence {
        heap_index: u64,
        expected: H256,
        path: Vec<H256>,
        left: ProvenNode,
        right: ProvenNode,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MismatchProof {
    pub sharer: NodeId,
    pub epoch: Epoch,
    pub claimed: Commitment,
    pub reconstructed: Commitment,
    pub evidence: MismatchEvidence,
}

impl MismatchProof {
    /// Hashes carried by node-divergence evidence; `None` for full-object
    /// evidence.
    pub fn hash_count(&self) -> Option<usize> {
        match &self.evidence {
            MismatchEvidence::FullObject { .. } => None,
            MismatchEvidence::NodeDivergence { path, left, right, .. } => {
                Some(1 + path.len() + left.share_proof.siblings.len() + right.share_proof.siblings.len())
            }
        }
    }

    /// Identifier used to deduplicate posts.
    pub fn id(&self) -> Result<H256> {
        let bytes = bincode::serialize(self)
            .map_err(|e| DasError::MalformedProof(format!("unserializable proof: {}", e)))?;
        Ok(keccak256(&bytes))
    }
}

/// Build the smallest proof that `reconstruction` contradicts the posted
/// commitment.
///
/// The decoded units are re-encoded first. If they do not reproduce the
/// posted share root the pooled shares were not a codeword and
/// `InconsistentShares` is returned instead of a proof.
pub fn build_mismatch_proof(record: &PostedCommitment, reconstruction: &Reconstruction) -> Result<MismatchProof> {
    if reconstruction.sharer != record.sharer || reconstruction.epoch != record.epoch {
        return Err(DasError::MalformedProof("reconstruction belongs to another epoch".into()));
    }
    if reconstruction.reconstructed == record.commitment {
        return Err(DasError::MalformedProof("reconstruction matches the posted commitment".into()));
    }

    let layout = &record.layout;
    let encoded = layout
        .codec()?
        .encode_units(reconstruction.units.clone(), layout.payload_len())?;
    let share_tree = MerkleTree::over_shares(&encoded.shards);
    if share_tree.commitment() != record.share_root {
        return Err(DasError::InconsistentShares(
            "decoded units do not re-encode to the posted share root".into(),
        ));
    }

    let evidence = match layout.strategy {
        CommitmentStrategy::RawObject => full_object(reconstruction),
        CommitmentStrategy::NodeTree => {
            let view = NodeTreeView::new(&reconstruction.units, layout)?;
            if view.width() < 2 {
                full_object(reconstruction)
            } else {
                node_divergence(record, &view, &share_tree)?
            }
        }
    };

    let proof = MismatchProof {
        sharer: record.sharer,
        epoch: record.epoch,
        claimed: record.commitment,
        reconstructed: reconstruction.reconstructed,
        evidence,
    };
    info!(
        "Built mismatch proof for {}@{} ({} hashes)",
        record.sharer.short(),
        record.epoch,
        proof
            .hash_count()
            .map(|n| n.to_string())
            .unwrap_or_else(|| "full object".into())
    );
    Ok(proof)
}

fn full_object(reconstruction: &Reconstruction) -> MismatchEvidence {
    MismatchEvidence::FullObject {
        units: reconstruction.units.clone(),
    }
}

fn node_divergence(record: &PostedCommitment, view: &NodeTreeView<'_>, share_tree: &MerkleTree) -> Result<MismatchEvidence> {
    let layout = &record.layout;
    let width = view.width();
    let recomputed = view.recomputed(layout.object_len);

    let mut node = 1usize;
    loop {
        let combined = node_hash(&view.distributed(2 * node), &view.distributed(2 * node + 1));
        let diverges = if node == 1 {
            seal_hash(layout.object_len, &combined) != record.commitment.0
        } else {
            combined != view.distributed(node)
        };
        if diverges {
            break;
        }

        // Leaves always agree with themselves, so only internal children
        // can hide the divergence.
        let next = [2 * node, 2 * node + 1]
            .into_iter()
            .find(|&child| child < width && recomputed.node(child) != Some(view.distributed(child)));
        match next {
            Some(child) => node = child,
            None => {
                return Err(DasError::MalformedProof(format!(
                    "no divergent child under node {}",
                    node
                )))
            }
        }
    }

    let expected = if node == 1 {
        record.commitment.0
    } else {
        view.distributed(node)
    };
    let mut path = Vec::new();
    let mut index = node;
    while index > 1 {
        path.push(view.distributed(index ^ 1));
        index /= 2;
    }

    let prove = |heap: usize| -> Result<ProvenNode> {
        let share_proof = share_tree
            .prove(heap - 1)
            .ok_or_else(|| DasError::MalformedProof(format!("no share proof for node {}", heap)))?;
        Ok(ProvenNode {
            heap_index: heap as u64,
            slot: view.slot(heap).to_vec(),
            share_proof,
        })
    };

    debug!("Divergence at node {} of a tree of width {}", node, width);
    Ok(MismatchEvidence::NodeDivergence {
        heap_index: node as u64,
        expected,
        path,
        left: prove(2 * node)?,
        right: prove(2 * node + 1)?,
    })
}

/// Re-check a proof against the posted record before it is forwarded or
/// acted on. Any failure is `MalformedProof`.
pub fn verify_mismatch_proof(record: &PostedCommitment, proof: &MismatchProof) -> Result<()> {
    if proof.sharer != record.sharer || proof.epoch != record.epoch {
        return Err(malformed("proof names another epoch"));
    }
    if proof.claimed != record.commitment {
        return Err(malformed("claimed commitment differs from the posted one"));
    }
    if proof.reconstructed == proof.claimed {
        return Err(malformed("reconstructed commitment equals the claimed one"));
    }
    let layout = &record.layout;
    layout.validate().map_err(|e| malformed(&e.to_string()))?;

    match &proof.evidence {
        MismatchEvidence::FullObject { units } => verify_full_object(record, proof, units),
        MismatchEvidence::NodeDivergence {
            heap_index,
            expected,
            path,
            left,
            right,
        } => {
            if layout.strategy != CommitmentStrategy::NodeTree {
                return Err(malformed("node evidence for a raw object epoch"));
            }
            verify_divergence(record, *heap_index, *expected, path, left, right)
        }
    }
}

fn malformed(reason: &str) -> DasError {
    DasError::MalformedProof(reason.to_string())
}

fn verify_full_object(record: &PostedCommitment, proof: &MismatchProof, units: &[Vec<u8>]) -> Result<()> {
    let layout = &record.layout;
    if units.len() as u64 != layout.data_units {
        return Err(malformed("wrong number of data units"));
    }
    if units.iter().any(|unit| unit.len() as u64 != layout.shard_len) {
        return Err(malformed("data unit of the wrong length"));
    }

    let encoded = layout
        .codec()?
        .encode_units(units.to_vec(), layout.payload_len())
        .map_err(|e| malformed(&e.to_string()))?;
    if MerkleTree::over_shares(&encoded.shards).commitment() != record.share_root {
        return Err(malformed("units do not encode to the posted share root"));
    }

    let (_, reconstructed) = object_from_units(layout, units).map_err(|e| malformed(&e.to_string()))?;
    if reconstructed != proof.reconstructed {
        return Err(malformed("units do not yield the stated reconstruction"));
    }
    Ok(())
}

fn verify_divergence(
    record: &PostedCommitment,
    heap_index: u64,
    expected: H256,
    path: &[H256],
    left: &ProvenNode,
    right: &ProvenNode,
) -> Result<()> {
    let layout: &CodecLayout = &record.layout;
    let width = layout.tree_width() as u64;
    if heap_index == 0 || heap_index >= width {
        return Err(malformed("divergent node is not an internal node"));
    }
    let depth = (u64::BITS - 1 - heap_index.leading_zeros()) as usize;
    if path.len() != depth {
        return Err(malformed("authentication path has the wrong length"));
    }
    if left.heap_index != 2 * heap_index || right.heap_index != 2 * heap_index + 1 {
        return Err(malformed("proven nodes are not the children of the divergent node"));
    }

    let total = layout.total_shares() as u64;
    let mut children = [H256::zero(); 2];
    for (child, proven) in children.iter_mut().zip([left, right]) {
        if proven.slot.len() as u64 != layout.shard_len {
            return Err(malformed("node slot of the wrong length"));
        }
        let share_index = proven.heap_index - 1;
        if proven.share_proof.leaf_index != share_index
            || !verify_leaf(&record.share_root, total, share_index, &proven.slot, &proven.share_proof)
        {
            return Err(malformed("node slot is not included under the share root"));
        }
        *child = slot_hash(
            &proven.slot,
            proven.heap_index as usize,
            width as usize,
            layout.unit_size as usize,
        );
    }
    let combined = node_hash(&children[0], &children[1]);

    if heap_index == 1 {
        if expected != record.commitment.0 {
            return Err(malformed("root divergence must expect the posted commitment"));
        }
        if seal_hash(layout.object_len, &combined) == record.commitment.0 {
            return Err(malformed("children hash to the posted commitment"));
        }
    } else {
        if !verify_node(&record.commitment, layout.object_len, heap_index, expected, path) {
            return Err(malformed("divergent node is not under the posted commitment"));
        }
        if combined == expected {
            return Err(malformed("children hash to the committed node"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commitment::commit;
    use crate::config::DasConfig;
    use crate::reconstruction::{ReconstructionOutcome, Reconstructor};
    use crate::share::{node_tree_payload, prepare_shares, seal_payload, PreparedEpoch};
    use quorum_crypto::Keypair;
    use std::sync::Arc;

    const UNIT: usize = 32;

    fn config(strategy: CommitmentStrategy) -> DasConfig {
        DasConfig {
            unit_size: UNIT,
            strategy,
            ..Default::default()
        }
    }

    fn object(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    fn reconstruct(prepared: &PreparedEpoch) -> Arc<Reconstruction> {
        let reconstructor = Reconstructor::new();
        let need = prepared.record.layout.threshold();
        let shares = prepared.shares[need..2 * need].to_vec();
        match reconstructor.try_reconstruct(&prepared.record, shares).unwrap() {
            ReconstructionOutcome::Success(done) => done,
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    /// Node-tree epoch whose internal nodes are honest but whose leaf
    /// `leaf` carries different bytes.
    fn corrupt_leaf_epoch(keypair: &Keypair, len: usize, leaf: usize) -> PreparedEpoch {
        let cfg = config(CommitmentStrategy::NodeTree);
        let honest = object(len);
        let tree = MerkleTree::over_object(&honest, UNIT);
        let mut payload = node_tree_payload(&tree, &honest, UNIT);
        let slot = tree.width() - 1 + leaf;
        payload[slot * UNIT] ^= 0x55;

        let layout = CodecLayout::for_object(&cfg, len as u64).unwrap();
        seal_payload(keypair, 5, tree.commitment(), layout, &payload).unwrap()
    }

    #[test]
    fn test_node_divergence_proof_is_logarithmic() {
        let keypair = Keypair::from_seed(31);
        let prepared = corrupt_leaf_epoch(&keypair, 64 * UNIT, 37);
        let reconstruction = reconstruct(&prepared);
        assert!(!reconstruction.matches());

        let proof = build_mismatch_proof(&prepared.record, &reconstruction).unwrap();
        match &proof.evidence {
            MismatchEvidence::NodeDivergence { heap_index, path, .. } => {
                // Parent of leaf 37 in a tree of width 64
                assert_eq!(*heap_index, (64 + 37) / 2);
                assert_eq!(path.len(), 5);
            }
            other => panic!("unexpected evidence {:?}", other),
        }
        // 64 leaves, 127 data units, 381 shares: log-sized either way
        assert!(proof.hash_count().unwrap() <= 1 + 6 + 2 * 9);
        verify_mismatch_proof(&prepared.record, &proof).unwrap();
    }

    #[test]
    fn test_root_divergence() {
        let keypair = Keypair::from_seed(32);
        let cfg = config(CommitmentStrategy::NodeTree);
        let served = object(4 * UNIT);
        let mut claimed_object = served.clone();
        claimed_object[0] ^= 1;

        let tree = MerkleTree::over_object(&served, UNIT);
        let payload = node_tree_payload(&tree, &served, UNIT);
        let layout = CodecLayout::for_object(&cfg, served.len() as u64).unwrap();
        let prepared = seal_payload(&keypair, 1, commit(&claimed_object, UNIT), layout, &payload).unwrap();

        let reconstruction = reconstruct(&prepared);
        let proof = build_mismatch_proof(&prepared.record, &reconstruction).unwrap();
        assert!(matches!(
            proof.evidence,
            MismatchEvidence::NodeDivergence { heap_index: 1, ref path, .. } if path.is_empty()
        ));
        verify_mismatch_proof(&prepared.record, &proof).unwrap();
    }

    #[test]
    fn test_raw_object_proof() {
        let keypair = Keypair::from_seed(33);
        let cfg = config(CommitmentStrategy::RawObject);
        let served = object(100);
        let layout = CodecLayout::for_object(&cfg, 100).unwrap();
        let prepared = seal_payload(&keypair, 2, commit(&object(99), UNIT), layout, &served).unwrap();

        let reconstruction = reconstruct(&prepared);
        let proof = build_mismatch_proof(&prepared.record, &reconstruction).unwrap();
        assert!(proof.hash_count().is_none());
        verify_mismatch_proof(&prepared.record, &proof).unwrap();
    }

    #[test]
    fn test_tampered_proofs_are_malformed() {
        let keypair = Keypair::from_seed(34);
        let prepared = corrupt_leaf_epoch(&keypair, 16 * UNIT, 3);
        let reconstruction = reconstruct(&prepared);
        let proof = build_mismatch_proof(&prepared.record, &reconstruction).unwrap();

        let mut bad = proof.clone();
        if let MismatchEvidence::NodeDivergence { expected, .. } = &mut bad.evidence {
            *expected = H256::repeat_byte(9);
        }
        assert!(matches!(
            verify_mismatch_proof(&prepared.record, &bad),
            Err(DasError::MalformedProof(_))
        ));

        let mut bad = proof.clone();
        if let MismatchEvidence::NodeDivergence { left, .. } = &mut bad.evidence {
            left.slot[0] ^= 1;
        }
        assert!(verify_mismatch_proof(&prepared.record, &bad).is_err());

        let mut bad = proof.clone();
        if let MismatchEvidence::NodeDivergence { path, .. } = &mut bad.evidence {
            path.pop();
        }
        assert!(verify_mismatch_proof(&prepared.record, &bad).is_err());

        let mut bad = proof;
        bad.epoch += 1;
        assert!(verify_mismatch_proof(&prepared.record, &bad).is_err());
    }

    #[test]
    fn test_honest_epoch_has_no_proof() {
        let keypair = Keypair::from_seed(35);
        let prepared = prepare_shares(&keypair, &config(CommitmentStrategy::NodeTree), 1, &object(300)).unwrap();
        let reconstruction = reconstruct(&prepared);
        assert!(reconstruction.matches());
        assert!(build_mismatch_proof(&prepared.record, &reconstruction).is_err());
    }

    #[test]
    fn test_non_codeword_is_inconsistent() {
        let keypair = Keypair::from_seed(36);
        let prepared = corrupt_leaf_epoch(&keypair, 8 * UNIT, 1);
        let mut reconstruction = (*reconstruct(&prepared)).clone();
        reconstruction.units[2][0] ^= 1;

        assert!(matches!(
            build_mismatch_proof(&prepared.record, &reconstruction),
            Err(DasError::InconsistentShares(_))
        ));
    }

    #[test]
    fn test_full_object_evidence_must_match_share_root() {
        let keypair = Keypair::from_seed(37);
        let cfg = config(CommitmentStrategy::RawObject);
        let layout = CodecLayout::for_object(&cfg, 64).unwrap();
        let prepared = seal_payload(&keypair, 1, commit(&[0u8; 64], UNIT), layout, &object(64)).unwrap();
        let reconstruction = reconstruct(&prepared);
        let mut proof = build_mismatch_proof(&prepared.record, &reconstruction).unwrap();

        if let MismatchEvidence::FullObject { units } = &mut proof.evidence {
            units[0][0] ^= 1;
        }
        assert!(verify_mismatch_proof(&prepared.record, &proof).is_err());
    }
}
