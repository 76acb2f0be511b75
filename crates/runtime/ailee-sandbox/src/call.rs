use ailee_types::ErrorCode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// SHA-256 over raw bytes, hex encoded. All hash fields in calls, results,
/// and proofs use this form.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Execution hash binding module, input, and output:
/// `SHA256(module_hash ‖ input_hash ‖ output_hash)` over the hex strings.
pub fn execution_hash(module_hash: &str, input_hash: &str, output_hash: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(module_hash.as_bytes());
    hasher.update(input_hash.as_bytes());
    hasher.update(output_hash.as_bytes());
    hex::encode(hasher.finalize())
}

/// One invocation of a loaded module's export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WasmCall {
    pub module_hash: String,
    pub function_name: String,
    pub input_bytes: Vec<u8>,
    /// Must equal `SHA256(input_bytes)`; validated before execution.
    pub input_hash: String,
    pub custom_gas_limit: Option<u64>,
    pub custom_timeout_ms: Option<u64>,
    /// Telemetry tag: which node this call executes on.
    pub node_id: String,
    pub signature_proof: Option<String>,
}

impl WasmCall {
    pub fn new(
        module_hash: impl Into<String>,
        function_name: impl Into<String>,
        input_bytes: Vec<u8>,
    ) -> Self {
        let input_hash = sha256_hex(&input_bytes);
        Self {
            module_hash: module_hash.into(),
            function_name: function_name.into(),
            input_bytes,
            input_hash,
            custom_gas_limit: None,
            custom_timeout_ms: None,
            node_id: String::new(),
            signature_proof: None,
        }
    }
}

/// Which ceilings a call ran into, as observed by the enforcement layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OverflowFlags {
    pub timeout: bool,
    pub memory: bool,
    pub instructions: bool,
    pub gas: bool,
    pub function_calls: bool,
}

/// Measurements from one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ExecutionMetrics {
    pub execution_time_us: u64,
    pub instantiation_time_us: u64,
    pub peak_memory_bytes: u64,
    pub avg_memory_bytes: u64,
    pub instructions_executed: u64,
    pub gas_consumed: u64,
    pub host_call_count: u64,
    pub overflow: OverflowFlags,
    pub runtime_version: String,
}

/// One recorded trace step, the Merkle leaf input for hash proofs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceStep {
    pub opcode: String,
    pub gas_used: u64,
    pub pc: u64,
}

/// Outcome of one call. Either `success` with the output pair populated,
/// or `error` + `error_code` set; never neither.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WasmResult {
    pub success: bool,
    pub output_bytes: Vec<u8>,
    pub output_hash: String,
    pub module_hash: String,
    pub input_hash: String,
    pub execution_hash: String,
    pub error: Option<String>,
    pub error_code: ErrorCode,
    pub metrics: ExecutionMetrics,
    pub trace: Option<Vec<TraceStep>>,
    pub zk_proof: Option<String>,
    pub zk_verified: bool,
    pub timestamp: DateTime<Utc>,
}

impl WasmResult {
    pub fn failure(
        module_hash: impl Into<String>,
        input_hash: impl Into<String>,
        code: ErrorCode,
        error: impl Into<String>,
    ) -> Self {
        let module_hash = module_hash.into();
        let input_hash = input_hash.into();
        Self {
            success: false,
            output_bytes: Vec::new(),
            output_hash: String::new(),
            execution_hash: String::new(),
            module_hash,
            input_hash,
            error: Some(error.into()),
            error_code: code,
            metrics: ExecutionMetrics::default(),
            trace: None,
            zk_proof: None,
            zk_verified: false,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_matches_known_vector() {
        // SHA256("abc")
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn execution_hash_is_order_sensitive() {
        let a = execution_hash("m", "i", "o");
        let b = execution_hash("o", "i", "m");
        assert_ne!(a, b);
        assert_eq!(a, execution_hash("m", "i", "o"));
    }

    #[test]
    fn call_constructor_hashes_input() {
        let call = WasmCall::new("mhash", "run", b"payload".to_vec());
        assert_eq!(call.input_hash, sha256_hex(b"payload"));
    }
}
