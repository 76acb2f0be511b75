use crate::merkle::{compute_merkle_root, verify_merkle_path, PathElement};
use crate::nonce::NonceRegistry;
use ailee_identity::{verify_detached, NodeKeyPair};
use ailee_sandbox::{execution_hash, TraceStep, WasmResult};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Algorithm-version tag carried by every proof. `hash_v1` pins SHA-256;
/// a future SHA3-256 rotation gets a new tag and both sides must agree.
pub const PROOF_TYPE_HASH_V1: &str = "hash_v1";

/// Default acceptance window for proof timestamps.
pub const DEFAULT_MAX_AGE_SECS: u64 = 3_600;

/// Hash-based execution proof binding (module, input, output) through the
/// execution hash, optionally anchored to a Merkle-rooted trace and
/// signed by the executing node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HashProof {
    pub execution_hash: String,
    pub merkle_root: String,
    pub trace_path: Vec<PathElement>,
    pub module_hash: String,
    pub input_hash: String,
    pub output_hash: String,
    pub instruction_count: u64,
    pub gas_consumed: u64,
    /// Hex Ed25519 signature over the execution hash; empty when unsigned.
    pub node_signature: String,
    /// Hex Ed25519 verifying key of the executor; empty when unsigned.
    pub node_pubkey: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// Strictly monotonic per signer.
    pub nonce: u64,
    pub proof_type: String,
    pub verified: bool,
}

/// Why a proof was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerificationError {
    #[error("execution hash mismatch: stated {stated}, recomputed {recomputed}")]
    ExecutionHashMismatch { stated: String, recomputed: String },

    #[error("proof expired: age {age_secs}s exceeds {max_age_secs}s")]
    ProofExpired { age_secs: u64, max_age_secs: u64 },

    #[error("proof timestamp is in the future")]
    TimestampInFuture,

    #[error("unsupported proof algorithm tag: {0}")]
    AlgorithmMismatch(String),

    #[error("signature invalid for pubkey {0}")]
    SignatureInvalid(String),

    #[error("merkle path present but root is empty")]
    MerkleRootMissing,

    #[error("nonce replay detected for {peer} (nonce {nonce})")]
    NonceReplayDetected { peer: String, nonce: u64 },

    #[error("malformed proof bundle: {0}")]
    MalformedBundle(String),
}

/// Structured verification outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyResult {
    pub valid: bool,
    pub error: Option<VerificationError>,
}

impl VerifyResult {
    fn ok() -> Self {
        Self {
            valid: true,
            error: None,
        }
    }

    fn rejected(error: VerificationError) -> Self {
        Self {
            valid: false,
            error: Some(error),
        }
    }
}

/// Produces proofs for one executing node. The nonce is process-monotonic;
/// signing is optional and taken from the node's keypair when present.
pub struct ProofGenerator {
    keypair: Option<Arc<NodeKeyPair>>,
    next_nonce: AtomicU64,
}

impl ProofGenerator {
    pub fn new(keypair: Option<Arc<NodeKeyPair>>) -> Self {
        Self {
            keypair,
            next_nonce: AtomicU64::new(1),
        }
    }

    /// Resume nonce issuance above a persisted ceiling.
    pub fn with_nonce_floor(keypair: Option<Arc<NodeKeyPair>>, floor: u64) -> Self {
        Self {
            keypair,
            next_nonce: AtomicU64::new(floor.saturating_add(1)),
        }
    }

    /// Build a proof over the execution identity. With a trace, the
    /// Merkle root covers the leaf-hashed steps; without one the root
    /// falls back to the execution hash itself.
    pub fn generate(
        &self,
        module_hash: &str,
        input_hash: &str,
        output_hash: &str,
        instruction_count: u64,
        gas_consumed: u64,
        trace: Option<&[TraceStep]>,
    ) -> HashProof {
        let exec_hash = execution_hash(module_hash, input_hash, output_hash);
        let merkle_root = match trace {
            Some(steps) if !steps.is_empty() => compute_merkle_root(steps),
            _ => exec_hash.clone(),
        };

        let (node_signature, node_pubkey) = match &self.keypair {
            Some(kp) => (
                hex::encode(kp.sign(exec_hash.as_bytes()).to_bytes()),
                kp.pubkey_hex().to_string(),
            ),
            None => (String::new(), String::new()),
        };

        let nonce = self.next_nonce.fetch_add(1, Ordering::Relaxed);
        debug!(nonce, module = module_hash, "proof generated");

        HashProof {
            execution_hash: exec_hash,
            merkle_root,
            trace_path: Vec::new(),
            module_hash: module_hash.to_string(),
            input_hash: input_hash.to_string(),
            output_hash: output_hash.to_string(),
            instruction_count,
            gas_consumed,
            node_signature,
            node_pubkey,
            timestamp: Utc::now().timestamp_millis(),
            nonce,
            proof_type: PROOF_TYPE_HASH_V1.to_string(),
            verified: false,
        }
    }

    /// Stamp a proof straight from a successful execution result,
    /// including its trace when one was recorded.
    pub fn generate_from_result(&self, result: &WasmResult) -> HashProof {
        self.generate(
            &result.module_hash,
            &result.input_hash,
            &result.output_hash,
            result.metrics.instructions_executed,
            result.metrics.gas_consumed,
            result.trace.as_deref(),
        )
    }
}

/// Checks proofs against the acceptance rules: hash identity, age window,
/// algorithm tag, signature, Merkle consistency, and (when a registry is
/// attached) nonce monotonicity.
pub struct ProofVerifier {
    max_age_secs: u64,
    nonce_registry: Option<Arc<NonceRegistry>>,
}

impl Default for ProofVerifier {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_AGE_SECS)
    }
}

impl ProofVerifier {
    pub fn new(max_age_secs: u64) -> Self {
        Self {
            max_age_secs,
            nonce_registry: None,
        }
    }

    /// Attach replay protection; verified nonces are recorded as ceilings.
    pub fn with_nonce_registry(mut self, registry: Arc<NonceRegistry>) -> Self {
        self.nonce_registry = Some(registry);
        self
    }

    pub fn verify(&self, proof: &HashProof) -> VerifyResult {
        match self.check(proof) {
            Ok(()) => VerifyResult::ok(),
            Err(e) => VerifyResult::rejected(e),
        }
    }

    /// Logical AND over individual verifications.
    pub fn batch_verify(&self, proofs: &[HashProof]) -> bool {
        proofs.iter().all(|p| self.verify(p).valid)
    }

    /// Check a single trace step against the proof's Merkle root.
    pub fn verify_step(&self, proof: &HashProof, step: &TraceStep) -> bool {
        !proof.merkle_root.is_empty()
            && verify_merkle_path(
                &crate::merkle::hash_step(step),
                &proof.trace_path,
                &proof.merkle_root,
            )
    }

    fn check(&self, proof: &HashProof) -> Result<(), VerificationError> {
        if proof.proof_type != PROOF_TYPE_HASH_V1 {
            return Err(VerificationError::AlgorithmMismatch(
                proof.proof_type.clone(),
            ));
        }

        let recomputed =
            execution_hash(&proof.module_hash, &proof.input_hash, &proof.output_hash);
        if recomputed != proof.execution_hash {
            return Err(VerificationError::ExecutionHashMismatch {
                stated: proof.execution_hash.clone(),
                recomputed,
            });
        }

        let now_ms = Utc::now().timestamp_millis();
        if proof.timestamp > now_ms + 1_000 {
            return Err(VerificationError::TimestampInFuture);
        }
        let age_secs = ((now_ms - proof.timestamp).max(0) / 1_000) as u64;
        if age_secs > self.max_age_secs {
            return Err(VerificationError::ProofExpired {
                age_secs,
                max_age_secs: self.max_age_secs,
            });
        }

        if !proof.node_signature.is_empty() {
            let valid = verify_detached(
                &proof.node_pubkey,
                proof.execution_hash.as_bytes(),
                &proof.node_signature,
            )
            .map_err(|_| VerificationError::SignatureInvalid(proof.node_pubkey.clone()))?;
            if !valid {
                return Err(VerificationError::SignatureInvalid(
                    proof.node_pubkey.clone(),
                ));
            }
        }

        if !proof.trace_path.is_empty() && proof.merkle_root.is_empty() {
            return Err(VerificationError::MerkleRootMissing);
        }

        if let Some(registry) = &self.nonce_registry {
            let signer = if proof.node_pubkey.is_empty() {
                // Unsigned proofs still get replay protection per module.
                &proof.module_hash
            } else {
                &proof.node_pubkey
            };
            registry.check_and_record(signer, proof.nonce)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nonce::{MemoryNonceStore, NonceRegistry};

    fn sample_proof(generator: &ProofGenerator) -> HashProof {
        generator.generate("mhash", "ihash", "ohash", 1_000, 500, None)
    }

    #[test]
    fn generated_proofs_verify_within_max_age() {
        let generator = ProofGenerator::new(Some(Arc::new(NodeKeyPair::generate())));
        let proof = sample_proof(&generator);
        let verifier = ProofVerifier::default();
        assert!(verifier.verify(&proof).valid);
    }

    #[test]
    fn unsigned_proofs_verify_too() {
        let generator = ProofGenerator::new(None);
        let proof = sample_proof(&generator);
        assert!(proof.node_signature.is_empty());
        assert!(ProofVerifier::default().verify(&proof).valid);
    }

    #[test]
    fn expired_proofs_are_rejected() {
        let generator = ProofGenerator::new(None);
        let mut proof = sample_proof(&generator);
        proof.timestamp -= (DEFAULT_MAX_AGE_SECS as i64 + 60) * 1_000;
        let result = ProofVerifier::default().verify(&proof);
        assert!(!result.valid);
        assert!(matches!(
            result.error,
            Some(VerificationError::ProofExpired { .. })
        ));
    }

    #[test]
    fn tampered_output_breaks_the_execution_hash() {
        let generator = ProofGenerator::new(None);
        let mut proof = sample_proof(&generator);
        proof.output_hash = "tampered".to_string();
        let result = ProofVerifier::default().verify(&proof);
        assert!(matches!(
            result.error,
            Some(VerificationError::ExecutionHashMismatch { .. })
        ));
    }

    #[test]
    fn tampered_signature_is_rejected() {
        let generator = ProofGenerator::new(Some(Arc::new(NodeKeyPair::generate())));
        let mut proof = sample_proof(&generator);
        // Flip a nibble in the signature.
        let mut sig = proof.node_signature.clone().into_bytes();
        sig[0] = if sig[0] == b'a' { b'b' } else { b'a' };
        proof.node_signature = String::from_utf8(sig).unwrap();
        let result = ProofVerifier::default().verify(&proof);
        assert!(matches!(
            result.error,
            Some(VerificationError::SignatureInvalid(_))
        ));
    }

    #[test]
    fn foreign_algorithm_tags_are_rejected() {
        let generator = ProofGenerator::new(None);
        let mut proof = sample_proof(&generator);
        proof.proof_type = "sha3_v2".to_string();
        let result = ProofVerifier::default().verify(&proof);
        assert_eq!(
            result.error,
            Some(VerificationError::AlgorithmMismatch("sha3_v2".to_string()))
        );
    }

    #[test]
    fn nonces_are_strictly_monotonic_per_generator() {
        let generator = ProofGenerator::new(None);
        let a = sample_proof(&generator);
        let b = sample_proof(&generator);
        assert!(b.nonce > a.nonce);
    }

    #[test]
    fn replayed_nonce_is_rejected_on_second_verify() {
        let generator = ProofGenerator::new(Some(Arc::new(NodeKeyPair::generate())));
        let proof = sample_proof(&generator);
        let registry = Arc::new(NonceRegistry::new(Box::new(MemoryNonceStore::default())));
        let verifier = ProofVerifier::default().with_nonce_registry(registry);

        assert!(verifier.verify(&proof).valid);
        let second = verifier.verify(&proof);
        assert!(!second.valid);
        assert!(matches!(
            second.error,
            Some(VerificationError::NonceReplayDetected { .. })
        ));
    }

    #[test]
    fn batch_verify_is_a_logical_and() {
        let generator = ProofGenerator::new(None);
        let good = sample_proof(&generator);
        let mut bad = sample_proof(&generator);
        bad.output_hash = "tampered".to_string();
        let verifier = ProofVerifier::default();
        assert!(verifier.batch_verify(&[good.clone()]));
        assert!(!verifier.batch_verify(&[good, bad]));
    }

    #[test]
    fn trace_rooted_proofs_expose_step_verification() {
        let steps = vec![
            TraceStep {
                opcode: "enter.run".into(),
                gas_used: 0,
                pc: 0,
            },
            TraceStep {
                opcode: "host.output_write".into(),
                gas_used: 42,
                pc: 1,
            },
            TraceStep {
                opcode: "return".into(),
                gas_used: 50,
                pc: 2,
            },
        ];
        let generator = ProofGenerator::new(None);
        let mut proof = generator.generate("m", "i", "o", 50, 50, Some(&steps));
        assert_eq!(proof.merkle_root, compute_merkle_root(&steps));

        proof.trace_path = crate::merkle::generate_merkle_path(&steps, 1).unwrap();
        let verifier = ProofVerifier::default();
        assert!(verifier.verify_step(&proof, &steps[1]));
        assert!(!verifier.verify_step(&proof, &steps[0]));
    }

    #[test]
    fn traceless_proofs_root_to_the_execution_hash() {
        let generator = ProofGenerator::new(None);
        let proof = sample_proof(&generator);
        assert_eq!(proof.merkle_root, proof.execution_hash);
    }
}
