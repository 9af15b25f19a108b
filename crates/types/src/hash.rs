use primitive_types::{H160 as PrimitiveH160, H256 as PrimitiveH256};

pub type H160 = PrimitiveH160;
pub type H256 = PrimitiveH256;

/// Lenient construction from byte slices of any length.
///
/// Shorter inputs are zero-padded on the right, longer inputs truncated.
pub trait HashExt {
    fn from_slice_padded(slice: &[u8]) -> Self;
}

impl HashExt for H160 {
    fn from_slice_padded(slice: &[u8]) -> Self {
        let mut hash = H160::zero();
        let len = std::cmp::min(slice.len(), 20);
        hash.as_bytes_mut()[..len].copy_from_slice(&slice[..len]);
        hash
    }
}

impl HashExt for H256 {
    fn from_slice_padded(slice: &[u8]) -> Self {
        let mut hash = H256::zero();
        let len = std::cmp::min(slice.len(), 32);
        hash.as_bytes_mut()[..len].copy_from_slice(&slice[..len]);
        hash
    }
}
