use ailee_proofs::HashProof;
use ailee_types::{Assignment, ErrorCode, TaskPayload};

/// What came back from dispatching one task to a worker.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub success: bool,
    pub output: Vec<u8>,
    pub proof: Option<HashProof>,
    pub error: Option<String>,
    pub error_code: ErrorCode,
    /// Observed quality in [0, 1], fed to the reputation ledger.
    pub quality: f64,
    pub execution_time_ms: u64,
}

impl TaskOutcome {
    pub fn failed(error_code: ErrorCode, error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: Vec::new(),
            proof: None,
            error: Some(error.into()),
            error_code,
            quality: 0.0,
            execution_time_ms: 0,
        }
    }
}

/// Dispatch boundary between the engine and whatever actually runs the
/// task (the ambient node's sandbox, usually). Registered per task type;
/// the engine never sees worker internals.
pub trait TaskExecutor: Send + Sync {
    fn execute(&self, task: &TaskPayload, assignment: &Assignment) -> anyhow::Result<TaskOutcome>;
}
