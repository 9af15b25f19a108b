use quorum_types::Fraction;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{DasError, Result};

/// What the shares encode, chosen per deployment.
///
/// `RawObject` keeps shares small but a mismatch proof carries the whole
/// object. `NodeTree` distributes the nodes of the object's Merkle tree so
/// a mismatch is proven with O(log n) hashes, at the cost of roughly twice
/// the encoded payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitmentStrategy {
    RawObject,
    NodeTree,
}

impl Default for CommitmentStrategy {
    fn default() -> Self {
        Self::NodeTree
    }
}

/// Protocol parameters shared by sharers, validators and the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DasConfig {
    /// Leaf chunk size in bytes
    pub unit_size: usize,
    /// Total shares are `redundancy_factor` times the data units
    pub redundancy_factor: usize,
    /// Ledger ticks a complaint keeps counting toward the ratio
    pub recency_window: u64,
    /// Complaint ratio at which a sharer is penalized for withholding
    pub complaint_threshold: Fraction,
    /// Share encoding, see `CommitmentStrategy`
    pub strategy: CommitmentStrategy,
    /// Ledger ticks between posting a commitment and closing the epoch
    pub epoch_duration: u64,
    /// Share delivery retry policy
    pub delivery: DeliveryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Timeout of a single send attempt in milliseconds
    pub attempt_timeout_ms: u64,
    /// First retry delay in milliseconds
    pub initial_backoff_ms: u64,
    /// Upper bound of the exponential backoff in milliseconds
    pub max_backoff_ms: u64,
    /// Concurrent recipient transfers
    pub max_in_flight: usize,
    /// Attempts per share before a transfer is reported failed; the epoch
    /// deadline ends retries earlier
    pub max_attempts: u32,
}

impl Default for DasConfig {
    fn default() -> Self {
        Self {
            unit_size: 4096,
            redundancy_factor: 3,
            recency_window: 600,
            complaint_threshold: Fraction::ONE_THIRD,
            strategy: CommitmentStrategy::default(),
            epoch_duration: 1_800,
            delivery: DeliveryConfig::default(),
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            attempt_timeout_ms: 5_000,
            initial_backoff_ms: 50,
            max_backoff_ms: 2_000,
            max_in_flight: 64,
            max_attempts: 8,
        }
    }
}

impl DasConfig {
    pub fn validate(&self) -> Result<()> {
        if self.unit_size == 0 {
            return Err(DasError::InvalidConfig("unit_size must be greater than 0".into()));
        }
        if self.redundancy_factor < 2 {
            return Err(DasError::InvalidConfig(
                "redundancy_factor must be at least 2".into(),
            ));
        }
        let threshold = self.complaint_threshold;
        if threshold.denominator == 0
            || threshold.is_zero()
            || threshold.numerator > threshold.denominator
        {
            return Err(DasError::InvalidConfig(format!(
                "complaint_threshold {} must lie in (0, 1]",
                threshold
            )));
        }
        if self.recency_window == 0 {
            return Err(DasError::InvalidConfig("recency_window must be greater than 0".into()));
        }
        if self.epoch_duration == 0 {
            return Err(DasError::InvalidConfig("epoch_duration must be greater than 0".into()));
        }
        self.delivery.validate()
    }
}

impl DeliveryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.attempt_timeout_ms == 0 {
            return Err(DasError::InvalidConfig(
                "attempt_timeout_ms must be greater than 0".into(),
            ));
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(DasError::InvalidConfig(
                "initial_backoff_ms must not exceed max_backoff_ms".into(),
            ));
        }
        if self.max_in_flight == 0 {
            return Err(DasError::InvalidConfig("max_in_flight must be greater than 0".into()));
        }
        if self.max_attempts == 0 {
            return Err(DasError::InvalidConfig("max_attempts must be greater than 0".into()));
        }
        Ok(())
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    /// Delay before retry number `attempt` (1-based), doubling up to the cap.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
        let delay = self.initial_backoff_ms.saturating_mul(factor).min(self.max_backoff_ms);
        Duration::from_millis(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = DasConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.redundancy_factor, 3);
        assert_eq!(config.complaint_threshold, Fraction::ONE_THIRD);
    }

    #[test]
    fn test_validation() {
        let mut config = DasConfig::default();

        config.redundancy_factor = 1;
        assert!(config.validate().is_err());
        config.redundancy_factor = 3;

        config.complaint_threshold = Fraction { numerator: 4, denominator: 3 };
        assert!(config.validate().is_err());
        config.complaint_threshold = Fraction { numerator: 1, denominator: 0 };
        assert!(config.validate().is_err());
        config.complaint_threshold = Fraction::ONE_THIRD;

        config.unit_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backoff_doubles_until_cap() {
        let delivery = DeliveryConfig {
            initial_backoff_ms: 100,
            max_backoff_ms: 350,
            ..Default::default()
        };
        assert_eq!(delivery.backoff(1), Duration::from_millis(100));
        assert_eq!(delivery.backoff(2), Duration::from_millis(200));
        assert_eq!(delivery.backoff(3), Duration::from_millis(350));
        assert_eq!(delivery.backoff(80), Duration::from_millis(350));
    }
}
