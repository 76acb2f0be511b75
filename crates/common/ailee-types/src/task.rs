use serde::{Deserialize, Serialize};

/// Kind of work a task carries. `Custom` names an executor registered at
/// runtime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskType {
    Computation,
    FederatedLearning,
    Verification,
    Storage,
    Custom(String),
}

/// Scheduling priority. Strict priority across tiers, FIFO within a tier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum TaskPriority {
    Low = 0,
    Normal = 1,
    High = 2,
    Critical = 3,
}

impl TaskPriority {
    pub const ALL: [TaskPriority; 4] = [
        TaskPriority::Critical,
        TaskPriority::High,
        TaskPriority::Normal,
        TaskPriority::Low,
    ];
}

/// Hard resource floor a candidate must clear before scoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ResourceRequirements {
    pub min_cpu_cores: u32,
    pub min_memory_mb: u64,
    pub min_storage_mb: u64,
    pub min_bandwidth_mbps: f64,
    pub requires_gpu: bool,
    pub requires_tpu: bool,
    /// Free-form capability tags the candidate must advertise
    /// (e.g. "sgx", "cuda_12").
    pub capability_tags: Vec<String>,
}

/// A submitted unit of work, as it travels from submission through the
/// queue to an assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPayload {
    pub task_id: String,
    pub task_type: TaskType,
    pub priority: TaskPriority,
    pub submitter_id: String,
    /// Unix seconds at submission.
    pub submitted_at: u64,
    pub requirements: ResourceRequirements,
    pub max_cost_tokens: f64,
    pub min_reputation_score: f64,
    pub preferred_region: Option<String>,
    pub prefer_green_energy: bool,
    pub blacklisted_nodes: Vec<String>,
    /// Unix seconds; tasks past their deadline are dropped before dispatch.
    pub deadline: Option<u64>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub payload_bytes: Vec<u8>,
}

impl TaskPayload {
    pub fn new(task_id: impl Into<String>, task_type: TaskType, priority: TaskPriority) -> Self {
        Self {
            task_id: task_id.into(),
            task_type,
            priority,
            submitter_id: String::new(),
            submitted_at: 0,
            requirements: ResourceRequirements::default(),
            max_cost_tokens: 0.0,
            min_reputation_score: 0.0,
            preferred_region: None,
            prefer_green_energy: false,
            blacklisted_nodes: Vec::new(),
            deadline: None,
            retry_count: 0,
            max_retries: 3,
            payload_bytes: Vec::new(),
        }
    }

    pub fn is_expired(&self, now_unix: u64) -> bool {
        matches!(self.deadline, Some(d) if d != 0 && now_unix > d)
    }

    pub fn retries_remaining(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_ordering_matches_tiers() {
        assert!(TaskPriority::Critical > TaskPriority::High);
        assert!(TaskPriority::High > TaskPriority::Normal);
        assert!(TaskPriority::Normal > TaskPriority::Low);
    }

    #[test]
    fn deadline_expiry() {
        let mut task = TaskPayload::new("t1", TaskType::Computation, TaskPriority::Normal);
        assert!(!task.is_expired(1_000));
        task.deadline = Some(500);
        assert!(task.is_expired(1_000));
        assert!(!task.is_expired(500));
        // Zero means no deadline, matching the wire convention.
        task.deadline = Some(0);
        assert!(!task.is_expired(1_000));
    }
}
