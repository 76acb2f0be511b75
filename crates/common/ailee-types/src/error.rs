use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Numeric execution error codes, stable across releases. These travel on
/// the wire inside `WasmResult` and proof bundles; never renumber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ErrorCode {
    Success = 0,
    ModuleLoadFailed = 1,
    InstantiationFailed = 2,
    FunctionNotFound = 3,
    ExecutionTimeout = 4,
    MemoryLimitExceeded = 5,
    GasLimitExceeded = 6,
    InvalidInput = 7,
    InvalidOutput = 8,
    TrapOccurred = 9,
    SecurityViolation = 10,
    DeterminismViolation = 11,
    Unknown = 255,
}

impl ErrorCode {
    /// Resource exhaustion is worth retrying on a different worker;
    /// everything else is terminal for the attempt.
    pub fn retriable(self) -> bool {
        matches!(
            self,
            ErrorCode::ExecutionTimeout
                | ErrorCode::MemoryLimitExceeded
                | ErrorCode::GasLimitExceeded
        )
    }

    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => ErrorCode::Success,
            1 => ErrorCode::ModuleLoadFailed,
            2 => ErrorCode::InstantiationFailed,
            3 => ErrorCode::FunctionNotFound,
            4 => ErrorCode::ExecutionTimeout,
            5 => ErrorCode::MemoryLimitExceeded,
            6 => ErrorCode::GasLimitExceeded,
            7 => ErrorCode::InvalidInput,
            8 => ErrorCode::InvalidOutput,
            9 => ErrorCode::TrapOccurred,
            10 => ErrorCode::SecurityViolation,
            11 => ErrorCode::DeterminismViolation,
            _ => ErrorCode::Unknown,
        }
    }
}

/// Shared error taxonomy for the mesh core.
///
/// Validation and trust errors are non-retriable; resource errors retry up
/// to the task's budget; scheduling errors fail the single assignment;
/// systemic errors fail the task but leave the engine running.
#[derive(Debug, Error)]
pub enum MeshError {
    // Validation
    #[error("malformed task: {0}")]
    MalformedTask(String),
    #[error("hash mismatch: expected {expected}, computed {computed}")]
    HashMismatch { expected: String, computed: String },
    #[error("module not loaded: {0}")]
    MissingModule(String),
    #[error("capability denied: {0}")]
    CapabilityDenied(String),

    // Resource
    #[error("resource limit exceeded: {0:?}")]
    ResourceExceeded(ErrorCode),

    // Trust
    #[error("proof missing for {0}")]
    ProofMissing(String),
    #[error("proof expired (age {age_secs}s, max {max_age_secs}s)")]
    ProofExpired { age_secs: u64, max_age_secs: u64 },
    #[error("nonce replay detected for {peer} (nonce {nonce})")]
    NonceReplay { peer: String, nonce: u64 },
    #[error("signature invalid for {0}")]
    SignatureInvalid(String),
    #[error("reputation below threshold: {score} < {threshold}")]
    ReputationTooLow { score: f64, threshold: f64 },
    #[error("peer blacklisted: {0}")]
    Blacklisted(String),

    // Scheduling
    #[error("no candidates available")]
    NoCandidates,
    #[error("no node meets requirements: {0}")]
    NoEligibleNode(String),

    // Systemic
    #[error("engine stopped")]
    EngineStopped,
    #[error("task queue full (capacity {0})")]
    QueueFull(usize),
    #[error("discovery failure: {0}")]
    DiscoveryFailure(String),
}
