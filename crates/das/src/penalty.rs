use dashmap::DashMap;
use quorum_types::{Epoch, EpochKey, Fraction, NodeId};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::info;

use crate::{DasError, Result};

/// Terminal outcome of a sharer epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PenaltyVerdict {
    Clean,
    PenalizedForWithholding,
    PenalizedForCorruption,
}

impl fmt::Display for PenaltyVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Clean => write!(f, "clean"),
            Self::PenalizedForWithholding => write!(f, "penalized for withholding"),
            Self::PenalizedForCorruption => write!(f, "penalized for corruption"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EpochState {
    Active {
        availability_proven: bool,
        pending_withholding: bool,
    },
    Final(PenaltyVerdict),
}

impl Default for EpochState {
    fn default() -> Self {
        Self::Active {
            availability_proven: false,
            pending_withholding: false,
        }
    }
}

impl EpochState {
    pub fn verdict(&self) -> Option<PenaltyVerdict> {
        match self {
            Self::Final(verdict) => Some(*verdict),
            Self::Active { .. } => None,
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(self, Self::Final(_))
    }
}

/// Inputs to the evaluator, all already verified by the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PenaltyEvent {
    /// A mismatch proof passed verification.
    MismatchProven,
    /// A validator reconstructed the object and it matched the commitment.
    AvailabilityProven,
    ComplaintsObserved { ratio: Fraction, threshold: Fraction },
    /// The epoch deadline passed.
    Close { ratio: Fraction, threshold: Fraction },
}

/// Pure transition of one epoch's state.
pub fn transition(state: EpochState, event: PenaltyEvent) -> Result<EpochState> {
    let (availability_proven, pending_withholding) = match state {
        EpochState::Final(_) => return Err(DasError::AlreadyFinalized),
        EpochState::Active {
            availability_proven,
            pending_withholding,
        } => (availability_proven, pending_withholding),
    };

    Ok(match event {
        PenaltyEvent::MismatchProven => EpochState::Final(PenaltyVerdict::PenalizedForCorruption),
        PenaltyEvent::AvailabilityProven => EpochState::Active {
            availability_proven: true,
            pending_withholding: false,
        },
        PenaltyEvent::ComplaintsObserved { ratio, threshold } => EpochState::Active {
            availability_proven,
            pending_withholding: !availability_proven && (pending_withholding || ratio >= threshold),
        },
        PenaltyEvent::Close { ratio, threshold } => {
            if !availability_proven && ratio >= threshold {
                EpochState::Final(PenaltyVerdict::PenalizedForWithholding)
            } else {
                EpochState::Final(PenaltyVerdict::Clean)
            }
        }
    })
}

/// Verdict state for every (sharer, epoch). The only writer of verdicts.
#[derive(Debug, Default)]
pub struct PenaltyEvaluator {
    states: DashMap<EpochKey, EpochState>,
}

impl PenaltyEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply `event` and return the new state. Final states reject every
    /// further event with `AlreadyFinalized`.
    pub fn apply(&self, sharer: NodeId, epoch: Epoch, event: PenaltyEvent) -> Result<EpochState> {
        let key = EpochKey::new(sharer, epoch);
        let mut state = self.states.entry(key).or_default();
        let next = transition(*state, event)?;
        if let Some(verdict) = next.verdict() {
            info!("Epoch {} finalized: {}", key, verdict);
        }
        *state = next;
        Ok(next)
    }

    pub fn state(&self, sharer: NodeId, epoch: Epoch) -> EpochState {
        self.states
            .get(&EpochKey::new(sharer, epoch))
            .map(|state| *state)
            .unwrap_or_default()
    }

    pub fn verdict(&self, sharer: NodeId, epoch: Epoch) -> Option<PenaltyVerdict> {
        self.state(sharer, epoch).verdict()
    }
}
