use ailee_sandbox::TraceStep;
use sha2::{Digest, Sha256};

/// A sibling hash on the path from a leaf to the root, tagged with which
/// side it sits on.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PathElement {
    pub hash: String,
    /// True when the sibling is the right operand of the pair hash.
    pub sibling_is_right: bool,
}

fn hash_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Leaf hash of one trace step: `H(opcode ‖ gas_used_le ‖ pc_le)`.
pub fn hash_step(step: &TraceStep) -> String {
    let mut hasher = Sha256::new();
    hasher.update(step.opcode.as_bytes());
    hasher.update(step.gas_used.to_le_bytes());
    hasher.update(step.pc.to_le_bytes());
    hex::encode(hasher.finalize())
}

/// Internal node hash: `H(left ‖ right)` over the hex strings.
pub fn hash_pair(left: &str, right: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(left.as_bytes());
    hasher.update(right.as_bytes());
    hex::encode(hasher.finalize())
}

fn next_level(level: &[String]) -> Vec<String> {
    let mut parents = Vec::with_capacity(level.len().div_ceil(2));
    for pair in level.chunks(2) {
        let left = &pair[0];
        // Odd-count levels duplicate the last element.
        let right = pair.get(1).unwrap_or(left);
        parents.push(hash_pair(left, right));
    }
    parents
}

/// Root of the leaf-hashed trace. An empty trace roots to the hash of the
/// empty byte string so that "no trace" is still a well-defined value.
pub fn compute_merkle_root(trace: &[TraceStep]) -> String {
    if trace.is_empty() {
        return hash_hex(b"");
    }
    let mut level: Vec<String> = trace.iter().map(hash_step).collect();
    while level.len() > 1 {
        level = next_level(&level);
    }
    level.remove(0)
}

/// Sibling hashes from the leaf at `step_index` up to the root, in
/// ascending order. Returns `None` when the index is out of range.
pub fn generate_merkle_path(trace: &[TraceStep], step_index: usize) -> Option<Vec<PathElement>> {
    if step_index >= trace.len() {
        return None;
    }
    let mut level: Vec<String> = trace.iter().map(hash_step).collect();
    let mut index = step_index;
    let mut path = Vec::new();
    while level.len() > 1 {
        let sibling_index = if index % 2 == 0 { index + 1 } else { index - 1 };
        let sibling = level
            .get(sibling_index)
            .unwrap_or(&level[index]) // duplicated last element
            .clone();
        path.push(PathElement {
            hash: sibling,
            sibling_is_right: index % 2 == 0,
        });
        level = next_level(&level);
        index /= 2;
    }
    Some(path)
}

/// Fold a leaf hash up the path and compare against the published root.
pub fn verify_merkle_path(leaf_hash: &str, path: &[PathElement], root: &str) -> bool {
    let mut acc = leaf_hash.to_string();
    for element in path {
        acc = if element.sibling_is_right {
            hash_pair(&acc, &element.hash)
        } else {
            hash_pair(&element.hash, &acc)
        };
    }
    acc == root
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trace(n: usize) -> Vec<TraceStep> {
        (0..n)
            .map(|i| TraceStep {
                opcode: format!("op{i}"),
                gas_used: (i * 10) as u64,
                pc: i as u64,
            })
            .collect()
    }

    #[test]
    fn single_leaf_is_its_own_root() {
        let t = trace(1);
        assert_eq!(compute_merkle_root(&t), hash_step(&t[0]));
        let path = generate_merkle_path(&t, 0).unwrap();
        assert!(path.is_empty());
        assert!(verify_merkle_path(
            &hash_step(&t[0]),
            &path,
            &compute_merkle_root(&t)
        ));
    }

    #[test]
    fn every_leaf_of_every_size_verifies() {
        for n in 1..=9 {
            let t = trace(n);
            let root = compute_merkle_root(&t);
            for i in 0..n {
                let path = generate_merkle_path(&t, i).unwrap();
                assert!(
                    verify_merkle_path(&hash_step(&t[i]), &path, &root),
                    "leaf {i} of {n} failed"
                );
            }
        }
    }

    #[test]
    fn wrong_leaf_or_root_fails() {
        let t = trace(5);
        let root = compute_merkle_root(&t);
        let path = generate_merkle_path(&t, 2).unwrap();
        assert!(!verify_merkle_path(&hash_step(&t[3]), &path, &root));
        assert!(!verify_merkle_path(&hash_step(&t[2]), &path, "bogus"));
    }

    #[test]
    fn odd_levels_duplicate_the_last_element() {
        // Three leaves: root = H(H(a,b), H(c,c)).
        let t = trace(3);
        let a = hash_step(&t[0]);
        let b = hash_step(&t[1]);
        let c = hash_step(&t[2]);
        let expected = hash_pair(&hash_pair(&a, &b), &hash_pair(&c, &c));
        assert_eq!(compute_merkle_root(&t), expected);
    }

    #[test]
    fn root_depends_on_order() {
        let mut t = trace(4);
        let root = compute_merkle_root(&t);
        t.swap(1, 2);
        assert_ne!(compute_merkle_root(&t), root);
    }

    #[test]
    fn out_of_range_index_yields_none() {
        assert!(generate_merkle_path(&trace(3), 3).is_none());
    }
}
