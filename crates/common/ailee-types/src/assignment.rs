use serde::{Deserialize, Serialize};

/// Normalized sub-scores for one candidate, all in [0, 1], plus the
/// weighted final.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct ScoreBreakdown {
    pub reputation: f64,
    pub latency: f64,
    pub capacity: f64,
    pub cost: f64,
    pub final_score: f64,
}

/// One scored candidate, as reported in `Assignment::candidate_scores`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateScore {
    pub peer_id: String,
    pub breakdown: ScoreBreakdown,
}

/// The orchestrator's decision record for one task.
///
/// Every terminal outcome of a task produces one of these, success or
/// failure, always with a non-empty `reason`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub assigned: bool,
    pub reason: String,
    pub assignment_id: String,
    /// Unix seconds at decision time.
    pub assigned_at: u64,
    pub worker_peer_id: String,
    pub worker_region: String,
    pub backup_worker_peer_id: Option<String>,
    pub score: ScoreBreakdown,
    pub expected_latency_ms: f64,
    pub expected_cost_tokens: f64,
    /// Unix seconds; decision time plus the expected execution window.
    pub estimated_completion_time: u64,
    /// All surviving candidates, ranked best first.
    pub candidate_scores: Vec<CandidateScore>,
}

impl Assignment {
    /// A failure decision carrying only the reason.
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            assigned: false,
            reason: reason.into(),
            assignment_id: String::new(),
            assigned_at: 0,
            worker_peer_id: String::new(),
            worker_region: String::new(),
            backup_worker_peer_id: None,
            score: ScoreBreakdown::default(),
            expected_latency_ms: 0.0,
            expected_cost_tokens: 0.0,
            estimated_completion_time: 0,
            candidate_scores: Vec::new(),
        }
    }
}
