use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::Mutex;
use quorum_crypto::Keypair;
use quorum_types::{Epoch, EpochKey, NodeId};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::allocation::Allocation;
use crate::ledger::{AvailabilityClaim, Ledger};
use crate::mismatch::{build_mismatch_proof, verify_mismatch_proof};
use crate::reconstruction::{ReconstructionOutcome, Reconstructor};
use crate::share::{PostedCommitment, Share};
use crate::transport::Transport;
use crate::{DasError, Result};

/// A recipient of shares that also acts as a validator: it keeps the
/// shares addressed to it, complains when its assignment is missing and
/// reconstructs epochs from pooled shares.
pub struct Validator {
    keypair: Keypair,
    ledger: Arc<dyn Ledger>,
    transport: Arc<dyn Transport>,
    reconstructor: Arc<Reconstructor>,
    cursor: Mutex<u64>,
    inbox: DashMap<EpochKey, BTreeMap<u32, Share>>,
    records: DashMap<EpochKey, PostedCommitment>,
}

impl Validator {
    pub fn new(keypair: Keypair, ledger: Arc<dyn Ledger>, transport: Arc<dyn Transport>) -> Self {
        Self {
            keypair,
            ledger,
            transport,
            reconstructor: Arc::new(Reconstructor::new()),
            cursor: Mutex::new(0),
            inbox: DashMap::new(),
            records: DashMap::new(),
        }
    }

    /// Share a reconstructor, and its event channel, with other components.
    pub fn with_reconstructor(mut self, reconstructor: Arc<Reconstructor>) -> Self {
        self.reconstructor = reconstructor;
        self
    }

    pub fn id(&self) -> NodeId {
        self.keypair.id()
    }

    async fn record(&self, sharer: NodeId, epoch: Epoch) -> Result<PostedCommitment> {
        let key = EpochKey::new(sharer, epoch);
        if let Some(record) = self.records.get(&key) {
            return Ok(record.clone());
        }
        let record = self
            .ledger
            .read_commitment(sharer, epoch)
            .await?
            .ok_or(DasError::UnknownEpoch)?;
        self.records.insert(key, record.clone());
        Ok(record)
    }

    /// Verify and keep one share addressed to this validator.
    pub async fn ingest_share(&self, share: Share) -> Result<()> {
        let record = self.record(share.sharer, share.epoch).await?;
        share.verify(&record)?;

        let key = EpochKey::new(share.sharer, share.epoch);
        let mut inbox = self.inbox.entry(key).or_default();
        if let Some(existing) = inbox.get(&share.index) {
            if existing.data != share.data {
                return Err(DasError::InconsistentShares(format!(
                    "share {} of {} arrived with two contents",
                    share.index, key
                )));
            }
            return Ok(());
        }
        inbox.insert(share.index, share);
        Ok(())
    }

    /// Read every share delivered before the call.
    ///
    /// Returns the number accepted. An undecodable, forged or conflicting
    /// share aborts the sync with its error and the cursor moves past it,
    /// so the next sync continues with the following share. Any other
    /// error leaves the cursor on the share for a later sync to retry.
    pub async fn sync(&self) -> Result<usize> {
        let id = self.id();
        let start = *self.cursor.lock();
        let end = self.transport.delivered_to(&id);
        let mut stream = self.transport.receive_shares(id, start);
        let mut position = start;
        let mut accepted = 0;

        while position < end {
            let Some((next, frame)) = stream.next().await else {
                break;
            };
            let ingested = match frame {
                Ok(share) => self.ingest_share(share).await,
                Err(e) => Err(e),
            };
            match ingested {
                Ok(()) => accepted += 1,
                Err(e) if e.is_adversarial() => {
                    *self.cursor.lock() = next;
                    warn!("{} rejected frame {}: {}", id.short(), position, e);
                    return Err(e);
                }
                Err(e) => {
                    debug!("{} will retry frame {}: {}", id.short(), position, e);
                    return Err(e);
                }
            }
            position = next;
            *self.cursor.lock() = next;
        }

        debug!("{} synced {} shares", id.short(), accepted);
        Ok(accepted)
    }

    /// Shares of the epoch this validator holds, by index.
    pub fn received(&self, sharer: NodeId, epoch: Epoch) -> Vec<Share> {
        self.inbox
            .get(&EpochKey::new(sharer, epoch))
            .map(|shares| shares.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Complain if any share assigned to this validator is missing.
    /// Returns whether a complaint was recorded.
    pub async fn audit_receipt(&self, sharer: NodeId, epoch: Epoch, allocation: &Allocation) -> Result<bool> {
        let assigned = allocation.shares_for(&self.id());
        let held = self.inbox.get(&EpochKey::new(sharer, epoch));
        let missing = assigned
            .iter()
            .filter(|index| !held.as_ref().is_some_and(|held| held.contains_key(*index)))
            .count();
        drop(held);

        if missing == 0 {
            return Ok(false);
        }
        info!(
            "{} is missing {} of {} assigned shares from {}@{}",
            self.id().short(),
            missing,
            assigned.len(),
            sharer.short(),
            epoch
        );
        self.complain(sharer, epoch).await
    }

    /// Post a complaint for the epoch regardless of what was received.
    pub async fn complain(&self, sharer: NodeId, epoch: Epoch) -> Result<bool> {
        self.ledger.post_complaint(sharer, epoch, self.id()).await
    }

    /// Reconstruct the epoch from this validator's shares plus `pooled`
    /// shares from peers, then post the result: availability on a match,
    /// a verified mismatch proof otherwise.
    pub async fn attempt_reconstruction(
        &self,
        sharer: NodeId,
        epoch: Epoch,
        pooled: Vec<Share>,
    ) -> Result<ReconstructionOutcome> {
        let record = self.record(sharer, epoch).await?;
        if self.ledger.read_verdict(sharer, epoch).await?.is_some() {
            self.reconstructor.close(sharer, epoch, "verdict already final");
        } else if self.ledger.now().await > record.deadline {
            self.reconstructor.close(sharer, epoch, "epoch deadline passed");
        }

        let mut shares = self.received(sharer, epoch);
        shares.extend(pooled);

        let reconstructor = self.reconstructor.clone();
        let pending_record = record.clone();
        let outcome = tokio::task::spawn_blocking(move || reconstructor.try_reconstruct(&pending_record, shares))
            .await
            .map_err(|e| DasError::Codec(format!("reconstruction task: {}", e)))??;

        if let ReconstructionOutcome::Success(done) = &outcome {
            let posted = if done.matches() {
                let claim = AvailabilityClaim::sign(&self.keypair, sharer, epoch, done.reconstructed)?;
                self.ledger.post_availability(claim).await
            } else {
                let proof = build_mismatch_proof(&record, done)?;
                verify_mismatch_proof(&record, &proof)?;
                self.ledger
                    .post_mismatch_proof(sharer, epoch, proof)
                    .await
                    .map(|verdict| info!("{}@{} verdict: {}", sharer.short(), epoch, verdict))
            };
            match posted {
                Ok(()) | Err(DasError::AlreadyFinalized) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(outcome)
    }
}
