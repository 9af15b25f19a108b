use dashmap::DashMap;
use quorum_crypto::Keypair;
use quorum_types::{Epoch, NodeId, StakeWeights};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use crate::allocation::{allocate, Allocation};
use crate::config::DasConfig;
use crate::distribution::{DeliveryReport, Disperser};
use crate::ledger::Ledger;
use crate::penalty::PenaltyVerdict;
use crate::share::{prepare_shares, PostedCommitment, PreparedEpoch};
use crate::transport::Transport;
use crate::{DasError, Result};

/// Names one attestation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EpochHandle {
    pub sharer: NodeId,
    pub epoch: Epoch,
}

impl fmt::Display for EpochHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.sharer.short(), self.epoch)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttestationStatus {
    /// The epoch is still open.
    Pending,
    /// The epoch closed clean.
    Attested,
    Failed(String),
}

impl AttestationStatus {
    pub fn is_settled(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

struct Tracked {
    record: PostedCommitment,
    allocation: Allocation,
    report: DeliveryReport,
}

/// Rollup-facing entry point: turns an object into a committed,
/// dispersed epoch and reports how the ledger judged it.
pub struct AvailabilityService {
    keypair: Keypair,
    config: DasConfig,
    ledger: Arc<dyn Ledger>,
    disperser: Disperser,
    next_epoch: AtomicU64,
    epochs: DashMap<Epoch, Tracked>,
}

impl AvailabilityService {
    pub fn new(
        keypair: Keypair,
        config: DasConfig,
        ledger: Arc<dyn Ledger>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        config.validate()?;
        let disperser = Disperser::new(transport, ledger.clone(), config.delivery.clone());
        Ok(Self {
            keypair,
            config,
            ledger,
            disperser,
            next_epoch: AtomicU64::new(1),
            epochs: DashMap::new(),
        })
    }

    /// Number the next request from `epoch` on.
    pub fn starting_at(self, epoch: Epoch) -> Self {
        self.next_epoch.store(epoch, Ordering::SeqCst);
        self
    }

    pub fn sharer(&self) -> NodeId {
        self.keypair.id()
    }

    pub fn config(&self) -> &DasConfig {
        &self.config
    }

    pub fn disperser(&self) -> &Disperser {
        &self.disperser
    }

    /// Take the next epoch number for an epoch sealed outside the service.
    pub fn reserve_epoch(&self) -> Epoch {
        self.next_epoch.fetch_add(1, Ordering::SeqCst)
    }

    /// Encode, commit, post and disperse `object` under a fresh epoch.
    pub async fn request_availability_attestation(
        &self,
        object: &[u8],
        weights: &StakeWeights,
    ) -> Result<EpochHandle> {
        let epoch = self.reserve_epoch();
        let keypair = self.keypair.clone();
        let config = self.config.clone();
        let object = object.to_vec();
        let prepared = tokio::task::spawn_blocking(move || prepare_shares(&keypair, &config, epoch, &object))
            .await
            .map_err(|e| DasError::Codec(format!("encoding task: {}", e)))??;
        self.publish(prepared, weights).await
    }

    /// Post and disperse an already sealed epoch.
    pub async fn publish(&self, prepared: PreparedEpoch, weights: &StakeWeights) -> Result<EpochHandle> {
        if prepared.record.sharer != self.sharer() {
            return Err(DasError::InvalidShare(format!(
                "epoch sealed by {} published by {}",
                prepared.record.sharer,
                self.sharer()
            )));
        }
        let allocation = allocate(prepared.shares.len(), weights)?;
        let record = self.ledger.post_commitment(prepared.record).await?;
        let handle = EpochHandle {
            sharer: record.sharer,
            epoch: record.epoch,
        };
        info!(
            "Epoch {} committed to {} with {} shares, deadline {}",
            handle,
            record.commitment,
            prepared.shares.len(),
            record.deadline
        );

        let report = self.disperser.disperse(&record, &prepared.shares, &allocation).await?;
        if !report.is_complete() {
            warn!("Epoch {} reached {} of its recipients", handle, report.delivered.len());
        }
        self.epochs.insert(
            record.epoch,
            Tracked {
                record,
                allocation,
                report,
            },
        );
        Ok(handle)
    }

    pub async fn attestation_status(&self, handle: &EpochHandle) -> Result<AttestationStatus> {
        if handle.sharer != self.sharer() {
            return Err(DasError::UnknownEpoch);
        }
        let delivered = self
            .epochs
            .get(&handle.epoch)
            .map(|tracked| tracked.report.shares_delivered())
            .ok_or(DasError::UnknownEpoch)?;

        Ok(match self.ledger.read_verdict(handle.sharer, handle.epoch).await? {
            Some(PenaltyVerdict::Clean) => AttestationStatus::Attested,
            Some(verdict) => AttestationStatus::Failed(verdict.to_string()),
            None if delivered == 0 => AttestationStatus::Failed("no share was delivered".to_string()),
            None => AttestationStatus::Pending,
        })
    }

    pub fn record(&self, handle: &EpochHandle) -> Option<PostedCommitment> {
        self.epochs.get(&handle.epoch).map(|tracked| tracked.record.clone())
    }

    pub fn allocation(&self, handle: &EpochHandle) -> Option<Allocation> {
        self.epochs.get(&handle.epoch).map(|tracked| tracked.allocation.clone())
    }

    pub fn delivery_report(&self, handle: &EpochHandle) -> Option<DeliveryReport> {
        self.epochs.get(&handle.epoch).map(|tracked| tracked.report.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;
    use crate::transport::{DropRule, MemoryTransport};

    fn service(ledger: Arc<MemoryLedger>, transport: Arc<MemoryTransport>) -> AvailabilityService {
        let config = DasConfig {
            unit_size: 64,
            epoch_duration: 100,
            ..Default::default()
        };
        AvailabilityService::new(Keypair::from_seed(81), config, ledger, transport).unwrap()
    }

    fn setup(n: u64) -> (Arc<MemoryLedger>, Arc<MemoryTransport>, StakeWeights) {
        let ledger = Arc::new(MemoryLedger::new(DasConfig {
            epoch_duration: 100,
            ..Default::default()
        }));
        let weights = StakeWeights::uniform((1..=n).map(NodeId::from_index), 1).unwrap();
        ledger.register_stake_weights(0, weights.clone());
        (ledger, Arc::new(MemoryTransport::new()), weights)
    }

    #[tokio::test]
    async fn test_request_is_pending_then_attested() {
        let (ledger, transport, weights) = setup(5);
        let service = service(ledger.clone(), transport.clone());

        let handle = service
            .request_availability_attestation(&[7u8; 1000], &weights)
            .await
            .unwrap();
        assert_eq!(handle.epoch, 1);
        assert_eq!(service.attestation_status(&handle).await.unwrap(), AttestationStatus::Pending);

        let allocation = service.allocation(&handle).unwrap();
        for id in weights.ids() {
            assert_eq!(transport.delivered_to(id) as usize, allocation.shares_for(id).len());
        }

        ledger.advance_by(100);
        assert_eq!(service.attestation_status(&handle).await.unwrap(), AttestationStatus::Attested);
    }

    #[tokio::test]
    async fn test_epochs_are_numbered_per_request() {
        let (ledger, transport, weights) = setup(3);
        let service = service(ledger, transport).starting_at(10);

        let first = service.request_availability_attestation(b"a", &weights).await.unwrap();
        let second = service.request_availability_attestation(b"b", &weights).await.unwrap();
        assert_eq!((first.epoch, second.epoch), (10, 11));
        assert_ne!(service.record(&first).unwrap().commitment, service.record(&second).unwrap().commitment);
    }

    #[tokio::test]
    async fn test_withheld_epoch_fails() {
        let (ledger, transport, weights) = setup(3);
        let service = service(ledger.clone(), transport.clone());
        let ids: Vec<NodeId> = weights.ids().copied().collect();
        transport.add_rule(DropRule::Blackhole(ids[0]));
        transport.add_rule(DropRule::Blackhole(ids[1]));

        let handle = service.request_availability_attestation(&[1u8; 500], &weights).await.unwrap();
        ledger.advance_by(10);
        for id in &ids[..2] {
            ledger.post_complaint(handle.sharer, handle.epoch, *id).await.unwrap();
        }
        ledger.advance_by(90);

        assert_eq!(
            service.attestation_status(&handle).await.unwrap(),
            AttestationStatus::Failed(PenaltyVerdict::PenalizedForWithholding.to_string())
        );
    }

    #[tokio::test]
    async fn test_unknown_handle() {
        let (ledger, transport, _) = setup(1);
        let service = service(ledger, transport);
        let handle = EpochHandle {
            sharer: service.sharer(),
            epoch: 42,
        };
        assert!(matches!(service.attestation_status(&handle).await, Err(DasError::UnknownEpoch)));
    }
}
