use crate::{keccak256, CryptoError, Result};
use quorum_types::{HashExt, NodeId, H256};
use secp256k1::{
    ecdsa::{RecoverableSignature, RecoveryId},
    Message, PublicKey, Secp256k1, SecretKey,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Recoverable ECDSA signature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub r: H256,
    pub s: H256,
    pub v: u8,
}

impl Signature {
    /// Create a new signature from r, s, and v components
    pub fn new(r: H256, s: H256, v: u8) -> Self {
        Signature { r, s, v }
    }

    /// Compact representation (65 bytes: r || s || v)
    pub fn to_bytes(&self) -> [u8; 65] {
        let mut bytes = [0u8; 65];
        bytes[0..32].copy_from_slice(self.r.as_bytes());
        bytes[32..64].copy_from_slice(self.s.as_bytes());
        bytes[64] = self.v;
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 65 {
            return Err(CryptoError::InvalidSignature);
        }

        Ok(Signature {
            r: H256::from_slice_padded(&bytes[0..32]),
            s: H256::from_slice_padded(&bytes[32..64]),
            v: bytes[64],
        })
    }
}

/// Signing identity of a sharer or validator.
#[derive(Clone)]
pub struct Keypair {
    secret: SecretKey,
    public: PublicKey,
    id: NodeId,
}

impl Keypair {
    pub fn generate() -> Self {
        Self::from_secret(SecretKey::new(&mut rand::thread_rng()))
    }

    /// Deterministic keypair, used by simulations and tests.
    pub fn from_seed(seed: u64) -> Self {
        let mut material = keccak256(&seed.to_be_bytes());
        loop {
            if let Ok(secret) = SecretKey::from_slice(material.as_bytes()) {
                return Self::from_secret(secret);
            }
            material = keccak256(material.as_bytes());
        }
    }

    pub fn from_secret(secret: SecretKey) -> Self {
        let secp = Secp256k1::signing_only();
        let public = PublicKey::from_secret_key(&secp, &secret);
        let id = public_key_to_node_id(&public);
        Self { secret, public, id }
    }

    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self> {
        let secret = SecretKey::from_slice(bytes).map_err(|_| CryptoError::InvalidPrivateKey)?;
        Ok(Self::from_secret(secret))
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub fn sign(&self, message: &H256) -> Result<Signature> {
        sign_message(message, &self.secret)
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair").field("id", &self.id).finish_non_exhaustive()
    }
}

/// Sign a 32-byte digest with a private key
pub fn sign_message(message: &H256, private_key: &SecretKey) -> Result<Signature> {
    let secp = Secp256k1::signing_only();
    let message = Message::from_slice(message.as_bytes())?;
    let recoverable_sig = secp.sign_ecdsa_recoverable(&message, private_key);
    let (recovery_id, sig_bytes) = recoverable_sig.serialize_compact();

    Ok(Signature {
        r: H256::from_slice_padded(&sig_bytes[0..32]),
        s: H256::from_slice_padded(&sig_bytes[32..64]),
        v: recovery_id.to_i32() as u8 + 27,
    })
}

/// Recover the public key from a signature
pub fn recover_public_key(message: &H256, signature: &Signature) -> Result<PublicKey> {
    let secp = Secp256k1::verification_only();
    let message = Message::from_slice(message.as_bytes())?;

    let recovery_id = signature
        .v
        .checked_sub(27)
        .ok_or(CryptoError::InvalidSignature)
        .and_then(|v| RecoveryId::from_i32(v as i32).map_err(|_| CryptoError::InvalidSignature))?;

    let mut sig_bytes = [0u8; 64];
    sig_bytes[0..32].copy_from_slice(signature.r.as_bytes());
    sig_bytes[32..64].copy_from_slice(signature.s.as_bytes());

    let recoverable_sig = RecoverableSignature::from_compact(&sig_bytes, recovery_id)?;
    Ok(secp.recover_ecdsa(&message, &recoverable_sig)?)
}

/// Identity of whoever produced `signature` over `message`.
pub fn recover_signer(message: &H256, signature: &Signature) -> Result<NodeId> {
    let public_key = recover_public_key(message, signature)?;
    Ok(public_key_to_node_id(&public_key))
}

/// Last 20 bytes of the Keccak-256 hash of the uncompressed public key.
pub fn public_key_to_node_id(public_key: &PublicKey) -> NodeId {
    let public_key_bytes = public_key.serialize_uncompressed();
    // Skip the 0x04 prefix
    let hash = keccak256(&public_key_bytes[1..]);
    let mut id = [0u8; 20];
    id.copy_from_slice(&hash.as_bytes()[12..]);
    NodeId::from_bytes(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_recover() {
        let keypair = Keypair::from_seed(1);
        let message = keccak256(b"share digest");

        let signature = keypair.sign(&message).unwrap();
        assert_eq!(recover_signer(&message, &signature).unwrap(), keypair.id());
    }

    #[test]
    fn test_recover_with_other_message_yields_other_signer() {
        let keypair = Keypair::from_seed(2);
        let signature = keypair.sign(&keccak256(b"a")).unwrap();
        let recovered = recover_signer(&keccak256(b"b"), &signature);
        assert!(recovered.map(|id| id != keypair.id()).unwrap_or(true));
    }

    #[test]
    fn test_public_key_to_node_id() {
        // Well-known secp256k1 test vector
        let private_key_hex = "c85ef7d79691fe79573b1a7064c19c1a9819ebdbd1faaab1a8ec92344438aaf4";
        let expected = "0xcd2a3d9f938e13cd947ec05abc7fe734df8dd826";

        let keypair = Keypair::from_secret_bytes(&hex::decode(private_key_hex).unwrap()).unwrap();
        assert_eq!(keypair.id().to_string(), expected);
    }

    #[test]
    fn test_seeded_keypairs_are_stable_and_distinct() {
        assert_eq!(Keypair::from_seed(7).id(), Keypair::from_seed(7).id());
        assert_ne!(Keypair::from_seed(7).id(), Keypair::from_seed(8).id());
    }

    #[test]
    fn test_signature_serialization() {
        let sig = Signature::new(H256::repeat_byte(1), H256::repeat_byte(2), 27);
        let recovered_sig = Signature::from_bytes(&sig.to_bytes()).unwrap();
        assert_eq!(sig, recovered_sig);
        assert!(Signature::from_bytes(&[0u8; 64]).is_err());
    }

    #[test]
    fn test_bad_recovery_id_is_rejected() {
        let keypair = Keypair::from_seed(3);
        let message = keccak256(b"m");
        let mut signature = keypair.sign(&message).unwrap();
        signature.v = 3;
        assert!(recover_signer(&message, &signature).is_err());
    }
}
