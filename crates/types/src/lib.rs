pub mod epoch;
pub mod hash;
pub mod node_id;
pub mod stake;

pub use epoch::{Epoch, EpochKey, LedgerTime};
pub use hash::{HashExt, H160, H256};
pub use node_id::NodeId;
pub use stake::{Fraction, StakeWeights};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TypesError {
    #[error("Invalid hex string: {0}")]
    InvalidHex(String),

    #[error("Invalid length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("Fraction with zero denominator")]
    ZeroDenominator,

    #[error("Overflow in arithmetic operation")]
    Overflow,
}

pub type Result<T> = std::result::Result<T, TypesError>;
