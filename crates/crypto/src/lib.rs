use quorum_types::{HashExt, H256};
use sha3::{Digest, Keccak256};
use thiserror::Error;

pub mod signing;
pub use signing::*;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Invalid private key")]
    InvalidPrivateKey,

    #[error("Secp256k1 error: {0}")]
    Secp256k1(#[from] secp256k1::Error),
}

pub type Result<T> = std::result::Result<T, CryptoError>;

/// Domain tag of a Merkle leaf.
pub const LEAF_TAG: u8 = 0x00;
/// Domain tag of an internal Merkle node.
pub const NODE_TAG: u8 = 0x01;
/// Domain tag of a sealed (length-bound) Merkle root.
pub const SEAL_TAG: u8 = 0x02;
/// Domain tag of the message a sharer signs for each share.
pub const SHARE_TAG: u8 = 0x03;
/// Domain tag of a validator's availability claim.
pub const AVAILABILITY_TAG: u8 = 0x04;

/// Compute the Keccak-256 hash of the input data
pub fn keccak256(data: &[u8]) -> H256 {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    H256::from_slice_padded(&hasher.finalize())
}

/// Compute the Keccak-256 hash of multiple slices of data
pub fn keccak256_concat(data: &[&[u8]]) -> H256 {
    let mut hasher = Keccak256::new();
    for slice in data {
        hasher.update(slice);
    }
    H256::from_slice_padded(&hasher.finalize())
}

/// Hash of a Merkle leaf holding `chunk`.
pub fn leaf_hash(chunk: &[u8]) -> H256 {
    keccak256_concat(&[&[LEAF_TAG], chunk])
}

/// Hash of an internal Merkle node.
pub fn node_hash(left: &H256, right: &H256) -> H256 {
    keccak256_concat(&[&[NODE_TAG], left.as_bytes(), right.as_bytes()])
}

/// Binds a Merkle root to the length it was built over.
pub fn seal_hash(len: u64, root: &H256) -> H256 {
    keccak256_concat(&[&[SEAL_TAG], &len.to_be_bytes(), root.as_bytes()])
}
