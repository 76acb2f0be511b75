use serde::{Deserialize, Serialize};

/// The orchestrator's read-only view of one worker at scoring time.
///
/// Snapshots are plain values copied out of the node registry under its
/// lock and handed to the orchestrator after the lock is dropped; the
/// orchestrator never reaches back into live node state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub peer_id: String,
    pub region: String,
    pub device_class: String,

    // From the latest telemetry sample and capability advertisement.
    pub cpu_cores: u32,
    pub cpu_utilization: f64,
    pub available_mem_mb: f64,
    pub storage_mb: f64,
    pub bandwidth_mbps: f64,
    pub latency_ms: f64,
    pub efficiency_gflops_per_w: f64,
    pub carbon_intensity_gco2_per_kwh: f64,
    pub has_gpu: bool,
    pub has_tpu: bool,
    pub capability_tags: Vec<String>,

    /// Circuit-breaker state; safe-mode nodes are filtered before scoring.
    pub safe_mode: bool,
    /// Seconds since the latest telemetry sample; `None` when the node has
    /// never reported.
    pub telemetry_age_secs: Option<i64>,
    /// Whether the node's most recent attestation verified.
    pub has_verified_proof: bool,

    pub active_task_count: u32,
    pub max_task_count: u32,
    /// The node's advertised price for one task of typical size.
    pub expected_cost_tokens: f64,
}

impl NodeSnapshot {
    pub fn new(peer_id: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            region: String::new(),
            device_class: String::new(),
            cpu_cores: 1,
            cpu_utilization: 0.0,
            available_mem_mb: 0.0,
            storage_mb: 0.0,
            bandwidth_mbps: 0.0,
            latency_ms: 0.0,
            efficiency_gflops_per_w: 0.0,
            carbon_intensity_gco2_per_kwh: 0.0,
            has_gpu: false,
            has_tpu: false,
            capability_tags: Vec::new(),
            safe_mode: false,
            telemetry_age_secs: None,
            has_verified_proof: false,
            active_task_count: 0,
            max_task_count: 8,
            expected_cost_tokens: 0.0,
        }
    }

    /// Fraction of the node's task slots currently occupied.
    pub fn load_factor(&self) -> f64 {
        if self.max_task_count == 0 {
            return 1.0;
        }
        f64::from(self.active_task_count) / f64::from(self.max_task_count)
    }
}
