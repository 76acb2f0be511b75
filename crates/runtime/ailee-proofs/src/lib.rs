//! Hash-based execution proofs for the AILEE mesh.
//!
//! A proof binds (module, input, output) through the execution hash,
//! optionally anchors the execution trace under a Merkle root, carries an
//! Ed25519 signature and a strictly monotonic nonce, and travels as a
//! canonical key-sorted JSON bundle. Deliberately not hiding: these are
//! deterministic attestations, and the full ZK verifier is an external
//! plugin behind the same interface.

#![forbid(unsafe_code)]

mod aggregator;
mod merkle;
mod nonce;
mod proof;
mod wire;

pub use aggregator::ProofAggregator;
pub use merkle::{
    compute_merkle_root, generate_merkle_path, hash_pair, hash_step, verify_merkle_path,
    PathElement,
};
pub use nonce::{
    MemoryNonceStore, NonceRecord, NonceRegistry, NonceStore, NonceStoreError, SledNonceStore,
};
pub use proof::{
    HashProof, ProofGenerator, ProofVerifier, VerificationError, VerifyResult,
    DEFAULT_MAX_AGE_SECS, PROOF_TYPE_HASH_V1,
};
pub use wire::{decode_proof, encode_proof};
