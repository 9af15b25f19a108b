use anyhow::{Context, Result};
use quorum_crypto::Keypair;
use quorum_das::{
    commit, node_tree_payload, seal_payload, AttestationStatus, AvailabilityService, CodecLayout, Commitment,
    CommitmentStrategy, DasConfig, DropRule, EpochHandle, Ledger, MemoryLedger, MemoryTransport, MerkleTree,
    PenaltyVerdict, ReconstructionOutcome, Share, Validator,
};
use quorum_types::{Fraction, NodeId, StakeWeights};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::Config;

/// Misbehaviour injected into one simulated epoch.
#[derive(Debug, Clone, Default)]
pub struct EpochPlan {
    /// Validators whose shares never arrive
    pub withheld: BTreeSet<NodeId>,
    /// Validators that complain although their shares arrived
    pub false_complaints: BTreeSet<NodeId>,
    /// Encode a different object than the one committed to
    pub corrupt: bool,
}

/// What happened to one epoch, as printed by `simulate`.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub sharer: NodeId,
    pub epoch: u64,
    pub commitment: Commitment,
    pub object_len: u64,
    pub total_shares: usize,
    pub threshold: usize,
    pub shares_delivered: usize,
    pub complaints: usize,
    pub complaint_ratio: String,
    pub reconstructed: bool,
    pub commitment_matches: Option<bool>,
    pub proof_hashes: Option<usize>,
    pub verdict: Option<PenaltyVerdict>,
    pub status: AttestationStatus,
}

/// One sharer and a set of validators sharing an in-memory ledger and
/// transport.
pub struct LocalNetwork {
    config: DasConfig,
    keypair: Keypair,
    ledger: Arc<MemoryLedger>,
    transport: Arc<MemoryTransport>,
    service: AvailabilityService,
    validators: Vec<Validator>,
    weights: StakeWeights,
}

impl LocalNetwork {
    /// Build a network with one validator per entry of `stakes`.
    pub fn new(config: DasConfig, stakes: &[u64], seed: u64) -> Result<Self> {
        config.validate().context("Invalid protocol configuration")?;
        if stakes.is_empty() {
            anyhow::bail!("a network needs at least one validator");
        }

        let keypair = Keypair::from_seed(seed);
        let ledger = Arc::new(MemoryLedger::new(config.clone()));
        let transport = Arc::new(MemoryTransport::new());

        let keys: Vec<Keypair> = (0..stakes.len() as u64)
            .map(|i| Keypair::from_seed(seed.wrapping_add(1 + i)))
            .collect();
        let weights = StakeWeights::try_from_iter(keys.iter().map(Keypair::id).zip(stakes.iter().copied()))
            .context("Invalid stake table")?;
        ledger.register_stake_weights(0, weights.clone());

        let validators = keys
            .into_iter()
            .map(|keypair| Validator::new(keypair, ledger.clone(), transport.clone()))
            .collect();
        let service = AvailabilityService::new(keypair.clone(), config.clone(), ledger.clone(), transport.clone())
            .context("Failed to start availability service")?;

        info!(
            "Local network: sharer {}, {} validators, total stake {}",
            keypair.id(),
            stakes.len(),
            weights.total()
        );

        Ok(Self {
            config,
            keypair,
            ledger,
            transport,
            service,
            validators,
            weights,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;
        let sim = &config.simulation;
        let stakes = if sim.stakes.is_empty() {
            vec![1; sim.validators]
        } else {
            sim.stakes.clone()
        };
        Self::new(config.das_config(), &stakes, sim.seed)
    }

    pub fn ledger(&self) -> &Arc<MemoryLedger> {
        &self.ledger
    }

    pub fn transport(&self) -> &Arc<MemoryTransport> {
        &self.transport
    }

    pub fn service(&self) -> &AvailabilityService {
        &self.service
    }

    pub fn validators(&self) -> &[Validator] {
        &self.validators
    }

    pub fn weights(&self) -> &StakeWeights {
        &self.weights
    }

    /// Plan derived from the `[simulation]` section: the first validators
    /// by id are withheld from, the next ones complain falsely.
    pub fn plan(&self, config: &Config) -> EpochPlan {
        let sim = &config.simulation;
        let ids: Vec<NodeId> = self.weights.ids().copied().collect();
        EpochPlan {
            withheld: ids.iter().take(sim.withheld).copied().collect(),
            false_complaints: ids
                .iter()
                .skip(sim.withheld)
                .take(sim.false_complaints)
                .copied()
                .collect(),
            corrupt: sim.corrupt,
        }
    }

    /// Run one epoch end to end: commit and disperse, let validators
    /// sync, audit and reconstruct, then close the epoch on the ledger.
    pub async fn run_epoch(&self, object: &[u8], plan: &EpochPlan) -> Result<SimulationReport> {
        self.transport.clear_rules();
        for id in &plan.withheld {
            self.transport.add_rule(DropRule::Blackhole(*id));
        }

        let handle = if plan.corrupt {
            let prepared = self.corrupt_epoch(object)?;
            self.service.publish(prepared, &self.weights).await?
        } else {
            self.service
                .request_availability_attestation(object, &self.weights)
                .await?
        };
        let record = self
            .service
            .record(&handle)
            .context("Published epoch has no record")?;
        let allocation = self
            .service
            .allocation(&handle)
            .context("Published epoch has no allocation")?;
        self.ledger.advance_by(1);

        for validator in &self.validators {
            validator
                .sync()
                .await
                .with_context(|| format!("Validator {} failed to sync", validator.id()))?;
            validator.audit_receipt(handle.sharer, handle.epoch, &allocation).await?;
            if plan.false_complaints.contains(&validator.id()) {
                validator.complain(handle.sharer, handle.epoch).await?;
            }
        }

        let (reconstructed, commitment_matches) = self.reconstruct(&handle).await?;
        let complaints = self.ledger.complaint_records(handle.sharer, handle.epoch).len();
        let ratio = self
            .ledger
            .complaint_ratio(handle.sharer, handle.epoch)
            .unwrap_or(Fraction::ZERO);

        self.ledger.advance_to(record.deadline);
        let verdict = self.ledger.read_verdict(handle.sharer, handle.epoch).await?;
        let status = self.service.attestation_status(&handle).await?;
        let proof_hashes = self
            .ledger
            .mismatch_proofs(handle.sharer, handle.epoch)
            .first()
            .and_then(|proof| proof.hash_count());

        Ok(SimulationReport {
            sharer: handle.sharer,
            epoch: handle.epoch,
            commitment: record.commitment,
            object_len: record.layout.object_len,
            total_shares: record.layout.total_shares(),
            threshold: record.layout.threshold(),
            shares_delivered: self
                .service
                .delivery_report(&handle)
                .map(|report| report.shares_delivered())
                .unwrap_or(0),
            complaints,
            complaint_ratio: format!("{} ({:.3})", ratio, ratio.as_f64()),
            reconstructed,
            commitment_matches,
            proof_hashes,
            verdict,
            status,
        })
    }

    /// The first validator holding shares reconstructs from everyone's
    /// pooled shares.
    async fn reconstruct(&self, handle: &EpochHandle) -> Result<(bool, Option<bool>)> {
        let holders: Vec<&Validator> = self
            .validators
            .iter()
            .filter(|v| !v.received(handle.sharer, handle.epoch).is_empty())
            .collect();
        let Some((first, rest)) = holders.split_first() else {
            warn!("No validator holds a share of {}", handle);
            return Ok((false, None));
        };

        let pooled: Vec<Share> = rest
            .iter()
            .flat_map(|v| v.received(handle.sharer, handle.epoch))
            .collect();
        match first.attempt_reconstruction(handle.sharer, handle.epoch, pooled).await? {
            ReconstructionOutcome::Success(done) => Ok((true, Some(done.matches()))),
            ReconstructionOutcome::Pending { have, need } => {
                warn!("Epoch {} unrecoverable: {} of {} shares", handle, have, need);
                Ok((false, None))
            }
            ReconstructionOutcome::Failed(reason) => {
                warn!("Reconstruction of {} failed: {}", handle, reason);
                Ok((false, None))
            }
        }
    }

    /// Shares that encode `object` with its last chunk altered, bound to
    /// the commitment of the unaltered object.
    fn corrupt_epoch(&self, object: &[u8]) -> Result<quorum_das::PreparedEpoch> {
        if object.is_empty() {
            anyhow::bail!("cannot corrupt an empty object");
        }
        let epoch = self.service.reserve_epoch();
        let unit_size = self.config.unit_size;
        let layout = CodecLayout::for_object(&self.config, object.len() as u64)?;
        let commitment = commit(object, unit_size);

        let payload = match self.config.strategy {
            CommitmentStrategy::RawObject => {
                let mut payload = object.to_vec();
                let last = payload.len() - 1;
                payload[last] ^= 0xff;
                payload
            }
            CommitmentStrategy::NodeTree => {
                let tree = MerkleTree::over_object(object, unit_size);
                let mut payload = node_tree_payload(&tree, object, unit_size);
                let slot = tree.width() - 1 + tree.leaf_count() - 1;
                payload[slot * layout.node_size()] ^= 0xff;
                payload
            }
        };

        warn!("Sealing corrupted epoch {} for {}", epoch, self.keypair.id());
        Ok(seal_payload(&self.keypair, epoch, commitment, layout, &payload)?)
    }
}

/// Deterministic object contents for simulations and benches.
pub fn random_object(len: usize, seed: u64) -> Vec<u8> {
    let mut object = vec![0u8; len];
    StdRng::seed_from_u64(seed).fill_bytes(&mut object);
    object
}
