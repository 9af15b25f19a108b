use crate::NodeId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One commit/distribute/verify round of a sharer.
pub type Epoch = u64;

/// Logical time exposed by the ledger.
///
/// Protocol windows (epoch deadlines, complaint recency) are measured in
/// these ticks and never against local wall time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LedgerTime(pub u64);

impl LedgerTime {
    pub const ZERO: LedgerTime = LedgerTime(0);

    pub fn ticks(&self) -> u64 {
        self.0
    }

    pub fn saturating_add(&self, ticks: u64) -> LedgerTime {
        LedgerTime(self.0.saturating_add(ticks))
    }

    /// Ticks elapsed since `earlier`, zero if `earlier` lies in the future.
    pub fn since(&self, earlier: LedgerTime) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

impl fmt::Display for LedgerTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Key of every per-epoch accumulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EpochKey {
    pub sharer: NodeId,
    pub epoch: Epoch,
}

impl EpochKey {
    pub fn new(sharer: NodeId, epoch: Epoch) -> Self {
        Self { sharer, epoch }
    }
}

impl fmt::Display for EpochKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.sharer.short(), self.epoch)
    }
}
