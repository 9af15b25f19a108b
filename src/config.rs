use anyhow::{Context, Result};
use quorum_das::{CommitmentStrategy, DasConfig, DeliveryConfig};
use quorum_types::Fraction;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Complete node configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Protocol parameters
    pub das: ProtocolConfig,
    /// Share delivery
    pub delivery: DeliveryConfig,
    /// Local network used by `simulate`
    pub simulation: SimulationConfig,
    /// Logging configuration
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Leaf chunk size in bytes
    pub unit_size: usize,
    /// Shares per data unit
    pub redundancy_factor: usize,
    /// Ticks a complaint stays live
    pub recency_window: u64,
    /// Stake share of complaints that penalizes a sharer
    pub complaint_threshold: Fraction,
    /// Share encoding
    pub strategy: CommitmentStrategy,
    /// Ticks between commitment and verdict
    pub epoch_duration: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Number of validators
    pub validators: usize,
    /// Stake per validator; uniform stake when empty
    pub stakes: Vec<u64>,
    /// Size of the shared object in bytes
    pub object_size: usize,
    /// Seed for keys and object contents
    pub seed: u64,
    /// Validators whose shares are silently dropped
    pub withheld: usize,
    /// Validators that complain even though they received their shares
    pub false_complaints: usize,
    /// Commit to a different object than the one encoded
    pub corrupt: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level
    pub level: String,
    /// Enable JSON logging
    pub json: bool,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        let das = DasConfig::default();
        Self {
            unit_size: das.unit_size,
            redundancy_factor: das.redundancy_factor,
            recency_window: das.recency_window,
            complaint_threshold: das.complaint_threshold,
            strategy: das.strategy,
            epoch_duration: das.epoch_duration,
        }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            validators: 10,
            stakes: Vec::new(),
            object_size: 1 << 20,
            seed: 7,
            withheld: 0,
            false_complaints: 0,
            corrupt: false,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path).context("Failed to read configuration file")?;

        let config: Config = toml::from_str(&content).context("Failed to parse configuration")?;

        config.validate()?;

        Ok(config)
    }

    /// Save configuration to file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        fs::write(path, content).context("Failed to write configuration file")?;

        Ok(())
    }

    /// Protocol parameters as the library consumes them.
    pub fn das_config(&self) -> DasConfig {
        DasConfig {
            unit_size: self.das.unit_size,
            redundancy_factor: self.das.redundancy_factor,
            recency_window: self.das.recency_window,
            complaint_threshold: self.das.complaint_threshold,
            strategy: self.das.strategy,
            epoch_duration: self.das.epoch_duration,
            delivery: self.delivery.clone(),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.das_config().validate().context("Invalid protocol configuration")?;

        let sim = &self.simulation;
        if sim.validators == 0 {
            anyhow::bail!("simulation.validators must be greater than 0");
        }
        if !sim.stakes.is_empty() && sim.stakes.len() != sim.validators {
            anyhow::bail!(
                "simulation.stakes lists {} weights for {} validators",
                sim.stakes.len(),
                sim.validators
            );
        }
        if sim.withheld + sim.false_complaints > sim.validators {
            anyhow::bail!("simulation.withheld and false_complaints exceed the validator count");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.das_config().unit_size, 4096);
        assert_eq!(config.das_config().complaint_threshold, Fraction::ONE_THIRD);
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();

        config.das.redundancy_factor = 1;
        assert!(config.validate().is_err());
        config.das.redundancy_factor = 3;

        config.simulation.stakes = vec![1, 2];
        assert!(config.validate().is_err());
        config.simulation.stakes.clear();

        config.delivery.max_in_flight = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quorum.toml");

        let mut config = Config::default();
        config.das.strategy = CommitmentStrategy::RawObject;
        config.simulation.withheld = 4;
        config.to_file(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.das.strategy, CommitmentStrategy::RawObject);
        assert_eq!(loaded.simulation.withheld, 4);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [das]
            strategy = "raw_object"

            [simulation]
            validators = 4
            "#,
        )
        .unwrap();
        assert_eq!(config.das.unit_size, 4096);
        assert_eq!(config.simulation.validators, 4);
        assert_eq!(config.delivery.max_attempts, 8);
    }
}
