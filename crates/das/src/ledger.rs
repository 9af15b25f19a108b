use async_trait::async_trait;
use parking_lot::RwLock;
use quorum_crypto::{keccak256_concat, recover_signer, Keypair, Signature, AVAILABILITY_TAG};
use quorum_types::{Epoch, EpochKey, Fraction, LedgerTime, NodeId, StakeWeights, H256};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, info, warn};

use crate::commitment::Commitment;
use crate::complaints::{ComplaintBook, ComplaintRecord};
use crate::config::DasConfig;
use crate::mismatch::{verify_mismatch_proof, MismatchProof};
use crate::penalty::{PenaltyEvaluator, PenaltyEvent, PenaltyVerdict};
use crate::share::PostedCommitment;
use crate::{DasError, Result};

/// The ledger as seen by sharers and validators.
///
/// Posts are deduplicated: repeating an identical post is harmless.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Record an epoch's commitment. The ledger stamps `posted_at` and
    /// `deadline` and returns the stored record.
    async fn post_commitment(&self, record: PostedCommitment) -> Result<PostedCommitment>;

    /// Returns whether a new complaint was recorded.
    async fn post_complaint(&self, sharer: NodeId, epoch: Epoch, recipient: NodeId) -> Result<bool>;

    async fn post_mismatch_proof(&self, sharer: NodeId, epoch: Epoch, proof: MismatchProof) -> Result<PenaltyVerdict>;

    /// Countervailing evidence: a staked validator other than the sharer
    /// reconstructed the epoch and it matched the posted commitment.
    async fn post_availability(&self, claim: AvailabilityClaim) -> Result<()>;

    /// `None` while the epoch is still open.
    async fn read_verdict(&self, sharer: NodeId, epoch: Epoch) -> Result<Option<PenaltyVerdict>>;

    async fn read_stake_weights(&self, epoch: Epoch) -> Result<StakeWeights>;

    async fn read_commitment(&self, sharer: NodeId, epoch: Epoch) -> Result<Option<PostedCommitment>>;

    async fn now(&self) -> LedgerTime;
}

/// A validator's signed statement that an epoch reconstructed to its
/// posted commitment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityClaim {
    pub sharer: NodeId,
    pub epoch: Epoch,
    pub commitment: Commitment,
    pub validator: NodeId,
    pub signature: Signature,
}

impl AvailabilityClaim {
    pub fn signing_digest(sharer: &NodeId, epoch: Epoch, commitment: &Commitment) -> H256 {
        keccak256_concat(&[
            &[AVAILABILITY_TAG],
            sharer.as_bytes(),
            &epoch.to_be_bytes(),
            commitment.0.as_bytes(),
        ])
    }

    pub fn sign(keypair: &Keypair, sharer: NodeId, epoch: Epoch, commitment: Commitment) -> Result<Self> {
        let signature = keypair.sign(&Self::signing_digest(&sharer, epoch, &commitment))?;
        Ok(Self {
            sharer,
            epoch,
            commitment,
            validator: keypair.id(),
            signature,
        })
    }

    pub fn digest(&self) -> H256 {
        Self::signing_digest(&self.sharer, self.epoch, &self.commitment)
    }

    /// Checks the claim against the epoch's record and stake table: the
    /// claimant must hold stake, must not be the sharer and must have
    /// signed the claim.
    pub fn verify(&self, record: &PostedCommitment, weights: &StakeWeights) -> Result<()> {
        if self.sharer != record.sharer || self.epoch != record.epoch {
            return Err(DasError::InvalidClaim("claim names another epoch".into()));
        }
        if self.commitment != record.commitment {
            return Err(DasError::CommitmentMismatch {
                claimed: record.commitment,
                reconstructed: self.commitment,
            });
        }
        if self.validator == record.sharer {
            return Err(DasError::InvalidClaim("a sharer cannot vouch for itself".into()));
        }
        if weights.weight_of(&self.validator).unwrap_or(0) == 0 {
            return Err(DasError::UnknownRecipient);
        }
        let signer = recover_signer(&self.digest(), &self.signature)
            .map_err(|e| DasError::InvalidClaim(format!("unreadable signature: {}", e)))?;
        if signer != self.validator {
            return Err(DasError::InvalidClaim(format!(
                "signed by {} instead of {}",
                signer, self.validator
            )));
        }
        Ok(())
    }
}

#[derive(Default)]
struct LedgerState {
    clock: LedgerTime,
    commitments: HashMap<EpochKey, PostedCommitment>,
    stakes: BTreeMap<Epoch, StakeWeights>,
    availability: HashMap<EpochKey, Vec<NodeId>>,
    proof_ids: HashSet<H256>,
    proofs: HashMap<EpochKey, Vec<MismatchProof>>,
}

/// In-process ledger with a logical clock that only moves when told to.
///
/// Epochs close when the clock reaches their deadline; the complaint ratio
/// is evaluated at the deadline itself so the verdict does not depend on
/// how far a single `advance_to` jumps.
pub struct MemoryLedger {
    config: DasConfig,
    state: RwLock<LedgerState>,
    complaints: ComplaintBook,
    evaluator: PenaltyEvaluator,
}

impl MemoryLedger {
    pub fn new(config: DasConfig) -> Self {
        Self {
            complaints: ComplaintBook::new(config.recency_window),
            config,
            state: RwLock::new(LedgerState::default()),
            evaluator: PenaltyEvaluator::new(),
        }
    }

    /// Stake table in force from `epoch` until the next registered one.
    pub fn register_stake_weights(&self, epoch: Epoch, weights: StakeWeights) {
        debug!("Registered {} stake weights from epoch {}", weights.len(), epoch);
        self.state.write().stakes.insert(epoch, weights);
    }

    fn stake_for(&self, epoch: Epoch) -> Result<StakeWeights> {
        self.state
            .read()
            .stakes
            .range(..=epoch)
            .next_back()
            .map(|(_, weights)| weights.clone())
            .filter(|weights| weights.total() > 0)
            .ok_or(DasError::StakeWeightUnavailable)
    }

    fn record(&self, key: &EpochKey) -> Result<PostedCommitment> {
        self.state
            .read()
            .commitments
            .get(key)
            .cloned()
            .ok_or(DasError::UnknownEpoch)
    }

    pub fn clock(&self) -> LedgerTime {
        self.state.read().clock
    }

    /// Move the clock forward and close every epoch whose deadline has
    /// passed. Returns the verdicts reached.
    pub fn advance_to(&self, time: LedgerTime) -> Vec<(EpochKey, PenaltyVerdict)> {
        let due: Vec<PostedCommitment> = {
            let mut state = self.state.write();
            if time > state.clock {
                state.clock = time;
            }
            let now = state.clock;
            let mut due: Vec<_> = state
                .commitments
                .values()
                .filter(|record| record.deadline <= now)
                .cloned()
                .collect();
            due.sort_by_key(|record| (record.deadline, EpochKey::new(record.sharer, record.epoch)));
            due
        };

        let mut closed = Vec::new();
        for record in due {
            let key = EpochKey::new(record.sharer, record.epoch);
            if self.evaluator.state(record.sharer, record.epoch).is_final() {
                continue;
            }
            let ratio = match self.stake_for(record.epoch).and_then(|weights| {
                self.complaints
                    .complaint_ratio(record.sharer, record.epoch, &weights, record.deadline)
            }) {
                Ok(ratio) => ratio,
                Err(e) => {
                    warn!("Closing {} without a complaint ratio: {}", key, e);
                    Fraction::ZERO
                }
            };
            let event = PenaltyEvent::Close {
                ratio,
                threshold: self.config.complaint_threshold,
            };
            if let Ok(state) = self.evaluator.apply(record.sharer, record.epoch, event) {
                if let Some(verdict) = state.verdict() {
                    closed.push((key, verdict));
                }
            }
        }
        closed
    }

    pub fn advance_by(&self, ticks: u64) -> Vec<(EpochKey, PenaltyVerdict)> {
        let target = self.clock().saturating_add(ticks);
        self.advance_to(target)
    }

    pub fn complaint_records(&self, sharer: NodeId, epoch: Epoch) -> Vec<ComplaintRecord> {
        self.complaints.records(sharer, epoch)
    }

    pub fn mismatch_proofs(&self, sharer: NodeId, epoch: Epoch) -> Vec<MismatchProof> {
        self.state
            .read()
            .proofs
            .get(&EpochKey::new(sharer, epoch))
            .cloned()
            .unwrap_or_default()
    }

    pub fn complaint_ratio(&self, sharer: NodeId, epoch: Epoch) -> Result<Fraction> {
        let weights = self.stake_for(epoch)?;
        self.complaints.complaint_ratio(sharer, epoch, &weights, self.clock())
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn post_commitment(&self, mut record: PostedCommitment) -> Result<PostedCommitment> {
        record.layout.validate()?;
        let key = EpochKey::new(record.sharer, record.epoch);
        let mut state = self.state.write();

        if let Some(existing) = state.commitments.get(&key) {
            if existing.commitment == record.commitment
                && existing.share_root == record.share_root
                && existing.layout == record.layout
            {
                return Ok(existing.clone());
            }
            return Err(DasError::InconsistentShares(format!(
                "conflicting commitment reposted for {}",
                key
            )));
        }

        record.posted_at = state.clock;
        record.deadline = state.clock.saturating_add(self.config.epoch_duration);
        info!(
            "Commitment {} posted for {}, deadline {}",
            record.commitment, key, record.deadline
        );
        state.commitments.insert(key, record.clone());
        Ok(record)
    }

    async fn post_complaint(&self, sharer: NodeId, epoch: Epoch, recipient: NodeId) -> Result<bool> {
        let record = self.record(&EpochKey::new(sharer, epoch))?;
        if self.evaluator.state(sharer, epoch).is_final() {
            return Err(DasError::AlreadyFinalized);
        }
        let weights = self.stake_for(epoch)?;
        let now = self.clock();
        if now > record.deadline {
            return Err(DasError::DeadlineExceeded);
        }

        let appended = self
            .complaints
            .record_complaint(sharer, epoch, recipient, &weights, now)?;
        if appended {
            let ratio = self.complaints.complaint_ratio(sharer, epoch, &weights, now)?;
            self.evaluator.apply(
                sharer,
                epoch,
                PenaltyEvent::ComplaintsObserved {
                    ratio,
                    threshold: self.config.complaint_threshold,
                },
            )?;
        }
        Ok(appended)
    }

    async fn post_mismatch_proof(&self, sharer: NodeId, epoch: Epoch, proof: MismatchProof) -> Result<PenaltyVerdict> {
        let key = EpochKey::new(sharer, epoch);
        let record = self.record(&key)?;
        if proof.sharer != sharer || proof.epoch != epoch {
            return Err(DasError::MalformedProof("proof names another epoch".into()));
        }

        let id = proof.id()?;
        if self.state.read().proof_ids.contains(&id) {
            if let Some(verdict) = self.evaluator.verdict(sharer, epoch) {
                return Ok(verdict);
            }
        }

        verify_mismatch_proof(&record, &proof)?;
        let state = self.evaluator.apply(sharer, epoch, PenaltyEvent::MismatchProven)?;

        let mut ledger = self.state.write();
        ledger.proof_ids.insert(id);
        ledger.proofs.entry(key).or_default().push(proof);
        state
            .verdict()
            .ok_or_else(|| DasError::MalformedProof("proof did not finalize the epoch".into()))
    }

    async fn post_availability(&self, claim: AvailabilityClaim) -> Result<()> {
        let key = EpochKey::new(claim.sharer, claim.epoch);
        let record = self.record(&key)?;
        let weights = self.stake_for(claim.epoch)?;
        claim.verify(&record, &weights)?;
        if self
            .state
            .read()
            .availability
            .get(&key)
            .is_some_and(|claimants| claimants.contains(&claim.validator))
        {
            return Ok(());
        }

        self.evaluator
            .apply(claim.sharer, claim.epoch, PenaltyEvent::AvailabilityProven)?;
        self.state
            .write()
            .availability
            .entry(key)
            .or_default()
            .push(claim.validator);
        debug!("Availability of {} vouched for by {}", key, claim.validator.short());
        Ok(())
    }

    async fn read_verdict(&self, sharer: NodeId, epoch: Epoch) -> Result<Option<PenaltyVerdict>> {
        self.record(&EpochKey::new(sharer, epoch))?;
        Ok(self.evaluator.verdict(sharer, epoch))
    }

    async fn read_stake_weights(&self, epoch: Epoch) -> Result<StakeWeights> {
        self.stake_for(epoch)
    }

    async fn read_commitment(&self, sharer: NodeId, epoch: Epoch) -> Result<Option<PostedCommitment>> {
        Ok(self.state.read().commitments.get(&EpochKey::new(sharer, epoch)).cloned())
    }

    async fn now(&self) -> LedgerTime {
        self.clock()
    }
}
