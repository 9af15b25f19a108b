use crate::{Result, TypesError, H160};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identity of a protocol participant (sharer, recipient or validator).
///
/// Derived from the participant's signing key, see
/// `quorum_crypto::public_key_to_node_id`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(H160);

impl NodeId {
    pub const ZERO: NodeId = NodeId(H160::zero());

    pub fn from_slice(slice: &[u8]) -> Result<Self> {
        if slice.len() != 20 {
            return Err(TypesError::InvalidLength {
                expected: 20,
                actual: slice.len(),
            });
        }
        let mut array = [0u8; 20];
        array.copy_from_slice(slice);
        Ok(NodeId(H160::from(array)))
    }

    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        NodeId(H160::from(bytes))
    }

    /// Deterministic identity for tests and simulations.
    pub fn from_index(index: u64) -> Self {
        let mut bytes = [0u8; 20];
        bytes[12..].copy_from_slice(&index.to_be_bytes());
        NodeId(H160::from(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub fn to_bytes(&self) -> [u8; 20] {
        self.0.to_fixed_bytes()
    }

    /// Short form used in log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0.as_bytes()[16..])
    }
}

impl FromStr for NodeId {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.strip_prefix("0x").unwrap_or(s);

        if s.len() != 40 {
            return Err(TypesError::InvalidLength {
                expected: 40,
                actual: s.len(),
            });
        }

        let bytes = hex::decode(s).map_err(|_| TypesError::InvalidHex(s.to_string()))?;
        Self::from_slice(&bytes)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0.as_bytes()))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self)
    }
}

impl From<H160> for NodeId {
    fn from(hash: H160) -> Self {
        NodeId(hash)
    }
}

impl From<[u8; 20]> for NodeId {
    fn from(bytes: [u8; 20]) -> Self {
        NodeId::from_bytes(bytes)
    }
}
