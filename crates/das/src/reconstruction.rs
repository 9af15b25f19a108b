use dashmap::DashMap;
use parking_lot::Mutex;
use quorum_types::{Epoch, EpochKey, NodeId};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::commitment::{commit, Commitment};
use crate::config::CommitmentStrategy;
use crate::share::{CodecLayout, NodeTreeView, PostedCommitment, Share};
use crate::{DasError, Result};

/// Emitted once per epoch when a reconstruction completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconstructionEvent {
    CommitmentMatch {
        sharer: NodeId,
        epoch: Epoch,
        commitment: Commitment,
    },
    CommitmentMismatch {
        sharer: NodeId,
        epoch: Epoch,
        claimed: Commitment,
        reconstructed: Commitment,
    },
}

/// A decoded epoch. On a mismatch it is the candidate handed to the
/// mismatch prover.
#[derive(Debug, Clone)]
pub struct Reconstruction {
    pub sharer: NodeId,
    pub epoch: Epoch,
    pub object: Vec<u8>,
    /// Decoded data units, codec padding included
    pub units: Vec<Vec<u8>>,
    pub claimed: Commitment,
    pub reconstructed: Commitment,
    pub shares_used: usize,
}

impl Reconstruction {
    pub fn matches(&self) -> bool {
        self.claimed == self.reconstructed
    }

    pub fn event(&self) -> ReconstructionEvent {
        if self.matches() {
            ReconstructionEvent::CommitmentMatch {
                sharer: self.sharer,
                epoch: self.epoch,
                commitment: self.claimed,
            }
        } else {
            ReconstructionEvent::CommitmentMismatch {
                sharer: self.sharer,
                epoch: self.epoch,
                claimed: self.claimed,
                reconstructed: self.reconstructed,
            }
        }
    }
}

#[derive(Debug, Clone)]
pub enum ReconstructionOutcome {
    Success(Arc<Reconstruction>),
    Pending { have: usize, need: usize },
    Failed(String),
}

enum AccumulatorState {
    Collecting,
    Reconstructed(Arc<Reconstruction>),
    Inert(String),
}

struct Accumulator {
    shares: BTreeMap<u32, Vec<u8>>,
    state: AccumulatorState,
}

impl Accumulator {
    fn new() -> Self {
        Self {
            shares: BTreeMap::new(),
            state: AccumulatorState::Collecting,
        }
    }

    /// Adds a batch of shares, or none of them if any conflicts with the
    /// pool or with another share of the batch.
    fn merge(&mut self, shares: Vec<Share>) -> Result<()> {
        let mut staged: BTreeMap<u32, Vec<u8>> = BTreeMap::new();
        for share in shares {
            let known = staged.get(&share.index).or_else(|| self.shares.get(&share.index));
            match known {
                Some(existing) if *existing != share.data => {
                    return Err(DasError::InconsistentShares(format!(
                        "two signed contents for share {}",
                        share.index
                    )))
                }
                Some(_) => continue,
                None => {}
            }
            staged.insert(share.index, share.data);
        }
        self.shares.extend(staged);
        Ok(())
    }
}

struct ReconstructionMetrics {
    attempts: AtomicU64,
    matches: AtomicU64,
    mismatches: AtomicU64,
}

#[derive(Debug, Clone, Default)]
pub struct ReconstructionMetricsSnapshot {
    pub attempts: u64,
    pub matches: u64,
    pub mismatches: u64,
}

/// Pools shares per (sharer, epoch) and decodes once the threshold is
/// reached.
pub struct Reconstructor {
    accumulators: DashMap<EpochKey, Arc<Mutex<Accumulator>>>,
    events: Option<mpsc::UnboundedSender<ReconstructionEvent>>,
    metrics: ReconstructionMetrics,
}

impl Default for Reconstructor {
    fn default() -> Self {
        Self::new()
    }
}

impl Reconstructor {
    pub fn new() -> Self {
        Self {
            accumulators: DashMap::new(),
            events: None,
            metrics: ReconstructionMetrics {
                attempts: AtomicU64::new(0),
                matches: AtomicU64::new(0),
                mismatches: AtomicU64::new(0),
            },
        }
    }

    /// Reconstructor publishing match and mismatch events on a channel.
    pub fn with_events() -> (Self, mpsc::UnboundedReceiver<ReconstructionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut reconstructor = Self::new();
        reconstructor.events = Some(tx);
        (reconstructor, rx)
    }

    fn accumulator(&self, key: EpochKey) -> Arc<Mutex<Accumulator>> {
        self.accumulators
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(Accumulator::new())))
            .clone()
    }

    /// Merge `shares` into the epoch's pool and reconstruct if enough are
    /// present.
    ///
    /// Every share is verified against the posted record first. Invalid
    /// or conflicting shares are returned as errors, never dropped.
    pub fn try_reconstruct<I>(&self, record: &PostedCommitment, shares: I) -> Result<ReconstructionOutcome>
    where
        I: IntoIterator<Item = Share>,
    {
        record.layout.validate()?;
        let shares: Vec<Share> = shares.into_iter().collect();
        shares.par_iter().try_for_each(|share| share.verify(record))?;

        let key = EpochKey::new(record.sharer, record.epoch);
        let accumulator = self.accumulator(key);
        let mut acc = accumulator.lock();

        if let AccumulatorState::Inert(reason) = &acc.state {
            return Ok(ReconstructionOutcome::Failed(reason.clone()));
        }
        acc.merge(shares)?;
        if let AccumulatorState::Reconstructed(done) = &acc.state {
            return Ok(ReconstructionOutcome::Success(done.clone()));
        }

        let have = acc.shares.len();
        let need = record.layout.threshold();
        if have < need {
            debug!("Epoch {} holds {}/{} shares", key, have, need);
            return Ok(ReconstructionOutcome::Pending { have, need });
        }

        self.metrics.attempts.fetch_add(1, Ordering::Relaxed);
        let reconstruction = Arc::new(decode(record, &acc.shares)?);
        if reconstruction.matches() {
            self.metrics.matches.fetch_add(1, Ordering::Relaxed);
            info!("Epoch {} reconstructed, commitment matches", key);
        } else {
            self.metrics.mismatches.fetch_add(1, Ordering::Relaxed);
            warn!(
                "Epoch {} reconstructed to {} but {} was posted",
                key, reconstruction.reconstructed, reconstruction.claimed
            );
        }

        if let Some(events) = &self.events {
            if events.send(reconstruction.event()).is_err() {
                debug!("Reconstruction event receiver dropped");
            }
        }
        acc.state = AccumulatorState::Reconstructed(reconstruction.clone());
        Ok(ReconstructionOutcome::Success(reconstruction))
    }

    /// Stop reconstructing an epoch that was finalized or expired. Shares
    /// already pooled are kept.
    pub fn close(&self, sharer: NodeId, epoch: Epoch, reason: &str) {
        let accumulator = self.accumulator(EpochKey::new(sharer, epoch));
        let mut acc = accumulator.lock();
        if matches!(acc.state, AccumulatorState::Collecting) {
            debug!("Closing epoch {}@{}: {}", sharer.short(), epoch, reason);
            acc.state = AccumulatorState::Inert(reason.to_string());
        }
    }

    pub fn collected(&self, sharer: NodeId, epoch: Epoch) -> usize {
        self.accumulators
            .get(&EpochKey::new(sharer, epoch))
            .map(|acc| acc.lock().shares.len())
            .unwrap_or(0)
    }

    pub fn has_share(&self, sharer: NodeId, epoch: Epoch, index: u32) -> bool {
        self.accumulators
            .get(&EpochKey::new(sharer, epoch))
            .map(|acc| acc.lock().shares.contains_key(&index))
            .unwrap_or(false)
    }

    pub fn metrics(&self) -> ReconstructionMetricsSnapshot {
        ReconstructionMetricsSnapshot {
            attempts: self.metrics.attempts.load(Ordering::Relaxed),
            matches: self.metrics.matches.load(Ordering::Relaxed),
            mismatches: self.metrics.mismatches.load(Ordering::Relaxed),
        }
    }
}

fn decode(record: &PostedCommitment, shares: &BTreeMap<u32, Vec<u8>>) -> Result<Reconstruction> {
    let layout = &record.layout;
    let codec = layout.codec()?;
    let pooled = shares.iter().map(|(index, data)| (*index, data.clone()));
    let units = codec.decode_units(pooled, layout.threshold())?;
    let (object, reconstructed) = object_from_units(layout, &units)?;

    Ok(Reconstruction {
        sharer: record.sharer,
        epoch: record.epoch,
        object,
        units,
        claimed: record.commitment,
        reconstructed,
        shares_used: shares.len(),
    })
}

/// Object carried by decoded data units and the commitment it yields.
pub(crate) fn object_from_units(layout: &CodecLayout, units: &[Vec<u8>]) -> Result<(Vec<u8>, Commitment)> {
    match layout.strategy {
        CommitmentStrategy::RawObject => {
            let mut object = Vec::with_capacity(layout.object_len as usize);
            for unit in units {
                object.extend_from_slice(&unit[..layout.node_size()]);
            }
            object.truncate(layout.object_len as usize);
            let reconstructed = commit(&object, layout.unit_size as usize);
            Ok((object, reconstructed))
        }
        CommitmentStrategy::NodeTree => {
            let view = NodeTreeView::new(units, layout)?;
            let reconstructed = view.recomputed(layout.object_len).commitment();
            Ok((view.object(layout.object_len), reconstructed))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DasConfig;
    use crate::share::{prepare_shares, seal_payload};
    use quorum_crypto::Keypair;

    fn config(strategy: CommitmentStrategy) -> DasConfig {
        DasConfig {
            unit_size: 16,
            strategy,
            ..Default::default()
        }
    }

    #[test]
    fn test_pending_then_success() {
        let (reconstructor, mut events) = Reconstructor::with_events();
        let keypair = Keypair::from_seed(21);
        let object: Vec<u8> = (0..50u8).collect();
        let prepared = prepare_shares(&keypair, &config(CommitmentStrategy::RawObject), 1, &object).unwrap();
        let record = &prepared.record;

        let outcome = reconstructor.try_reconstruct(record, prepared.shares[5..7].to_vec()).unwrap();
        assert!(matches!(outcome, ReconstructionOutcome::Pending { have: 2, need: 4 }));

        let outcome = reconstructor.try_reconstruct(record, prepared.shares[9..11].to_vec()).unwrap();
        match outcome {
            ReconstructionOutcome::Success(done) => {
                assert!(done.matches());
                assert_eq!(done.object, object);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(matches!(
            events.try_recv().unwrap(),
            ReconstructionEvent::CommitmentMatch { epoch: 1, .. }
        ));

        // Later shares return the cached result without a second event
        let outcome = reconstructor.try_reconstruct(record, prepared.shares[..1].to_vec()).unwrap();
        assert!(matches!(outcome, ReconstructionOutcome::Success(_)));
        assert!(events.try_recv().is_err());
        assert_eq!(reconstructor.metrics().attempts, 1);
    }

    #[test]
    fn test_node_tree_reconstruction() {
        let reconstructor = Reconstructor::new();
        let keypair = Keypair::from_seed(22);
        let object = b"node tree strategy object bytes, longer than one unit".to_vec();
        let prepared = prepare_shares(&keypair, &config(CommitmentStrategy::NodeTree), 3, &object).unwrap();
        let need = prepared.record.layout.threshold();

        let parity = prepared.shares[need..2 * need].to_vec();
        match reconstructor.try_reconstruct(&prepared.record, parity).unwrap() {
            ReconstructionOutcome::Success(done) => {
                assert!(done.matches());
                assert_eq!(done.object, object);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_mismatch_is_reported() {
        let (reconstructor, mut events) = Reconstructor::with_events();
        let keypair = Keypair::from_seed(23);
        let cfg = config(CommitmentStrategy::RawObject);
        let honest = vec![7u8; 40];
        let served = vec![8u8; 40];
        let layout = CodecLayout::for_object(&cfg, 40).unwrap();
        let prepared = seal_payload(&keypair, 1, commit(&honest, 16), layout, &served).unwrap();

        match reconstructor.try_reconstruct(&prepared.record, prepared.shares.clone()).unwrap() {
            ReconstructionOutcome::Success(done) => {
                assert!(!done.matches());
                assert_eq!(done.object, served);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(matches!(
            events.try_recv().unwrap(),
            ReconstructionEvent::CommitmentMismatch { .. }
        ));
    }

    #[test]
    fn test_invalid_share_surfaces() {
        let reconstructor = Reconstructor::new();
        let keypair = Keypair::from_seed(24);
        let prepared =
            prepare_shares(&keypair, &config(CommitmentStrategy::RawObject), 1, b"short object").unwrap();

        let mut forged = prepared.shares[0].clone();
        forged.data[3] ^= 0xff;
        let result = reconstructor.try_reconstruct(&prepared.record, vec![forged]);
        assert!(matches!(result, Err(DasError::InvalidShare(_))));
        assert_eq!(reconstructor.collected(prepared.record.sharer, 1), 0);
    }

    #[test]
    fn test_conflicting_batch_leaves_pool_untouched() {
        let keypair = Keypair::from_seed(25);
        let prepared =
            prepare_shares(&keypair, &config(CommitmentStrategy::RawObject), 1, &[5u8; 64]).unwrap();
        let mut acc = Accumulator::new();
        acc.merge(vec![prepared.shares[0].clone()]).unwrap();

        let mut conflicting = prepared.shares[0].clone();
        conflicting.data[0] ^= 1;
        let batch = vec![prepared.shares[1].clone(), prepared.shares[2].clone(), conflicting];
        assert!(matches!(acc.merge(batch), Err(DasError::InconsistentShares(_))));
        assert_eq!(acc.shares.keys().copied().collect::<Vec<_>>(), vec![0]);

        // Same index twice within one batch
        let mut twin = prepared.shares[3].clone();
        twin.data[0] ^= 1;
        assert!(acc.merge(vec![prepared.shares[3].clone(), twin]).is_err());
        assert_eq!(acc.shares.len(), 1);

        acc.merge(prepared.shares[..3].to_vec()).unwrap();
        assert_eq!(acc.shares.len(), 3);
    }

    #[test]
    fn test_closed_epoch_is_inert() {
        let reconstructor = Reconstructor::new();
        let keypair = Keypair::from_seed(26);
        let prepared = prepare_shares(&keypair, &config(CommitmentStrategy::RawObject), 2, b"late").unwrap();

        reconstructor.close(keypair.id(), 2, "deadline passed");
        let outcome = reconstructor.try_reconstruct(&prepared.record, prepared.shares.clone()).unwrap();
        assert!(matches!(outcome, ReconstructionOutcome::Failed(reason) if reason == "deadline passed"));
    }
}
