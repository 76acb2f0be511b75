use crate::proof::{HashProof, VerificationError};
use ailee_sandbox::execution_hash;

/// Canonical wire form of a proof: JSON with keys in sorted order, so the
/// same proof always serializes to the same bytes.
pub fn encode_proof(proof: &HashProof) -> Result<String, VerificationError> {
    // serde_json::Value objects are BTreeMap-backed, which sorts keys.
    let value = serde_json::to_value(proof)
        .map_err(|e| VerificationError::MalformedBundle(e.to_string()))?;
    serde_json::to_string(&value).map_err(|e| VerificationError::MalformedBundle(e.to_string()))
}

/// Decode a wire bundle, rejecting any whose stated execution hash
/// disagrees with the one recomputed from its component hashes.
pub fn decode_proof(json: &str) -> Result<HashProof, VerificationError> {
    let proof: HashProof = serde_json::from_str(json)
        .map_err(|e| VerificationError::MalformedBundle(e.to_string()))?;
    let recomputed = execution_hash(&proof.module_hash, &proof.input_hash, &proof.output_hash);
    if recomputed != proof.execution_hash {
        return Err(VerificationError::ExecutionHashMismatch {
            stated: proof.execution_hash,
            recomputed,
        });
    }
    Ok(proof)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proof::ProofGenerator;

    #[test]
    fn wire_roundtrip_preserves_the_proof() {
        let generator = ProofGenerator::new(None);
        let proof = generator.generate("m", "i", "o", 100, 100, None);
        let json = encode_proof(&proof).unwrap();
        let decoded = decode_proof(&json).unwrap();
        assert_eq!(proof, decoded);
    }

    #[test]
    fn encoding_is_canonical() {
        let generator = ProofGenerator::new(None);
        let proof = generator.generate("m", "i", "o", 100, 100, None);
        assert_eq!(encode_proof(&proof).unwrap(), encode_proof(&proof).unwrap());
        // Keys come out sorted.
        let json = encode_proof(&proof).unwrap();
        assert!(json.find("\"execution_hash\"").unwrap() < json.find("\"merkle_root\"").unwrap());
        assert!(json.find("\"merkle_root\"").unwrap() < json.find("\"timestamp\"").unwrap());
    }

    #[test]
    fn tampered_bundles_are_rejected_at_decode() {
        let generator = ProofGenerator::new(None);
        let proof = generator.generate("m", "i", "o", 100, 100, None);
        let json = encode_proof(&proof).unwrap();
        let tampered = json.replace("\"output_hash\":\"o\"", "\"output_hash\":\"p\"");
        assert!(matches!(
            decode_proof(&tampered),
            Err(VerificationError::ExecutionHashMismatch { .. })
        ));
        assert!(matches!(
            decode_proof("not json"),
            Err(VerificationError::MalformedBundle(_))
        ));
    }
}
