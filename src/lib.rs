// Core modules
pub mod config;
pub mod node;

pub use config::{Config, LogConfig, ProtocolConfig, SimulationConfig};
pub use node::{random_object, EpochPlan, LocalNetwork, SimulationReport};

// Re-export crate modules
pub use quorum_crypto as crypto;
pub use quorum_das as das;
pub use quorum_types as types;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get client version string
pub fn client_version() -> String {
    format!("quorum-da/v{}/rust", VERSION)
}
