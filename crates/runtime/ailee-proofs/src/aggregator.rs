use crate::proof::HashProof;
use std::collections::HashMap;

/// Collects verified proofs for a single task from multiple workers and
/// tallies agreement by output hash. The aggregator never invents
/// outputs; consensus is always one of the supplied hashes.
#[derive(Debug)]
pub struct ProofAggregator {
    required_quorum: usize,
    proofs: Vec<HashProof>,
    output_counts: HashMap<String, usize>,
}

impl ProofAggregator {
    pub fn new(required_quorum: usize) -> Self {
        Self {
            required_quorum: required_quorum.max(1),
            proofs: Vec::new(),
            output_counts: HashMap::new(),
        }
    }

    /// Add one worker's proof. Unverified proofs are ignored; the caller
    /// runs verification first.
    pub fn add_proof(&mut self, proof: HashProof) {
        if !proof.verified {
            return;
        }
        *self
            .output_counts
            .entry(proof.output_hash.clone())
            .or_insert(0) += 1;
        self.proofs.push(proof);
    }

    /// True once any single output hash reaches the required quorum.
    pub fn has_quorum(&self) -> bool {
        self.output_counts
            .values()
            .any(|&count| count >= self.required_quorum)
    }

    /// The plurality output hash, available once quorum exists. Ties break
    /// on the lexicographically smaller hash for determinism.
    pub fn consensus_output(&self) -> Option<String> {
        if !self.has_quorum() {
            return None;
        }
        self.output_counts
            .iter()
            .max_by(|(hash_a, count_a), (hash_b, count_b)| {
                count_a.cmp(count_b).then_with(|| hash_b.cmp(hash_a))
            })
            .map(|(hash, _)| hash.clone())
    }

    /// All distinct output hashes with their submission counts, most
    /// frequent first.
    pub fn output_distribution(&self) -> Vec<(String, usize)> {
        let mut distribution: Vec<(String, usize)> = self
            .output_counts
            .iter()
            .map(|(hash, count)| (hash.clone(), *count))
            .collect();
        distribution.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        distribution
    }

    pub fn proof_count(&self) -> usize {
        self.proofs.len()
    }

    pub fn reset(&mut self) {
        self.proofs.clear();
        self.output_counts.clear();
    }
}
