//! Node identity for the AILEE mesh.
//!
//! A worker's identity is its hex-encoded Ed25519 verifying key — the
//! `pubkey` field of `NodeId`. This crate owns key generation, signing,
//! and the recovery of verifying keys from their wire form.

#![forbid(unsafe_code)]

use ed25519_dalek::{Signer, Verifier};
use rand::rngs::OsRng;
use thiserror::Error;

pub type Signature = ed25519_dalek::Signature;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("invalid hex pubkey: {0}")]
    InvalidHex(String),

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("invalid signature encoding: {0}")]
    InvalidSignature(String),
}

/// Ed25519 keypair bound to a hex pubkey.
#[derive(Clone, Debug)]
pub struct NodeKeyPair {
    pubkey_hex: String,
    pk: ed25519_dalek::VerifyingKey,
    sk: ed25519_dalek::SigningKey,
}

impl NodeKeyPair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        let sk = ed25519_dalek::SigningKey::generate(&mut OsRng);
        let pk = sk.verifying_key();
        let pubkey_hex = hex::encode(pk.to_bytes());
        Self { pubkey_hex, pk, sk }
    }

    /// Restore a keypair from its 32-byte secret seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let sk = ed25519_dalek::SigningKey::from_bytes(seed);
        let pk = sk.verifying_key();
        let pubkey_hex = hex::encode(pk.to_bytes());
        Self { pubkey_hex, pk, sk }
    }

    /// The hex-encoded verifying key; this is the node's `pubkey`.
    pub fn pubkey_hex(&self) -> &str {
        &self.pubkey_hex
    }

    /// Sign arbitrary bytes, returning an Ed25519 signature.
    pub fn sign(&self, msg: &[u8]) -> Signature {
        self.sk.sign(msg)
    }

    /// Verify a signature against `msg` with this keypair's public half.
    pub fn verify(&self, msg: &[u8], sig: &Signature) -> bool {
        self.pk.verify(msg, sig).is_ok()
    }

    /// Secret seed bytes, for persistence.
    pub fn to_seed(&self) -> [u8; 32] {
        self.sk.to_bytes()
    }
}

/// Recover a verifying key from a hex pubkey as carried in proofs.
pub fn verifying_key_from_hex(
    pubkey_hex: &str,
) -> Result<ed25519_dalek::VerifyingKey, IdentityError> {
    let bytes = hex::decode(pubkey_hex)
        .map_err(|e| IdentityError::InvalidHex(e.to_string()))?;
    let arr: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| IdentityError::InvalidKey("pubkey is not 32 bytes".to_string()))?;
    ed25519_dalek::VerifyingKey::from_bytes(&arr)
        .map_err(|e| IdentityError::InvalidKey(e.to_string()))
}

/// Verify a detached signature given the hex pubkey and hex signature.
pub fn verify_detached(
    pubkey_hex: &str,
    msg: &[u8],
    signature_hex: &str,
) -> Result<bool, IdentityError> {
    let pk = verifying_key_from_hex(pubkey_hex)?;
    let sig_bytes = hex::decode(signature_hex)
        .map_err(|e| IdentityError::InvalidSignature(e.to_string()))?;
    let arr: [u8; 64] = sig_bytes
        .as_slice()
        .try_into()
        .map_err(|_| IdentityError::InvalidSignature("signature is not 64 bytes".to_string()))?;
    let sig = Signature::from_bytes(&arr);
    Ok(pk.verify(msg, &sig).is_ok())
}
