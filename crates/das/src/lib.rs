//! Data availability sampling core.
//!
//! A sharer erasure-codes an object, commits to it with a Merkle root,
//! and hands stake-proportional slices of the shares to recipients.
//! Recipients complain when their slice never arrives, validators pool
//! shares to reconstruct and check the commitment, and mismatches are
//! turned into succinct proofs that the ledger's penalty evaluator
//! consumes.

pub mod allocation;
pub mod availability;
pub mod codec;
pub mod commitment;
pub mod complaints;
pub mod config;
pub mod distribution;
pub mod ledger;
pub mod mismatch;
pub mod penalty;
pub mod reconstruction;
pub mod share;
pub mod transport;
pub mod validator;

pub use allocation::{allocate, Allocation};
pub use availability::{AttestationStatus, AvailabilityService, EpochHandle};
pub use codec::{EncodedPayload, ErasureCodec, FieldWidth};
pub use commitment::{commit, commit_shares, verify_leaf, verify_node, Commitment, MerkleProof, MerkleTree};
pub use complaints::{ComplaintBook, ComplaintRecord};
pub use config::{CommitmentStrategy, DasConfig, DeliveryConfig};
pub use distribution::{DeliveryMetricsSnapshot, DeliveryReport, Disperser};
pub use ledger::{AvailabilityClaim, Ledger, MemoryLedger};
pub use mismatch::{build_mismatch_proof, verify_mismatch_proof, MismatchEvidence, MismatchProof, ProvenNode};
pub use penalty::{transition, EpochState, PenaltyEvaluator, PenaltyEvent, PenaltyVerdict};
pub use reconstruction::{
    Reconstruction, ReconstructionEvent, ReconstructionMetricsSnapshot, ReconstructionOutcome, Reconstructor,
};
pub use share::{node_tree_payload, prepare_shares, seal_payload, CodecLayout, PostedCommitment, PreparedEpoch, Share};
pub use transport::{DropRule, MemoryTransport, Transport};
pub use validator::Validator;

use quorum_crypto::CryptoError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DasError {
    #[error("Not enough shares: got {have}, need {need}")]
    InsufficientShares { have: usize, need: usize },

    #[error("Inconsistent shares: {0}")]
    InconsistentShares(String),

    #[error("Commitment mismatch: claimed {claimed}, reconstructed {reconstructed}")]
    CommitmentMismatch {
        claimed: Commitment,
        reconstructed: Commitment,
    },

    #[error("Verdict already finalized")]
    AlreadyFinalized,

    #[error("Stake weights unavailable")]
    StakeWeightUnavailable,

    #[error("Malformed mismatch proof: {0}")]
    MalformedProof(String),

    #[error("Invalid share: {0}")]
    InvalidShare(String),

    #[error("Invalid availability claim: {0}")]
    InvalidClaim(String),

    #[error("Recipient is not part of the epoch's stake table")]
    UnknownRecipient,

    #[error("No commitment posted for this epoch")]
    UnknownEpoch,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Epoch deadline exceeded")]
    DeadlineExceeded,

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

impl DasError {
    /// Errors that are evidence of adversarial behaviour and must reach
    /// the caller rather than be retried.
    pub fn is_adversarial(&self) -> bool {
        matches!(
            self,
            DasError::InconsistentShares(_)
                | DasError::MalformedProof(_)
                | DasError::InvalidShare(_)
                | DasError::InvalidClaim(_)
                | DasError::CommitmentMismatch { .. }
        )
    }

    /// Errors that may clear up by waiting for more shares or retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, DasError::InsufficientShares { .. } | DasError::Transport(_))
    }
}

pub type Result<T> = std::result::Result<T, DasError>;
