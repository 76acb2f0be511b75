use crate::node::NodeId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Physical energy state of a node at one sampling tick.
///
/// Powers are watts and never negative; temperatures are Celsius. The
/// carbon intensity of the supplying grid and the achieved compute
/// efficiency feed green scheduling and reward scaling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnergyProfile {
    pub input_power_w: f64,
    pub waste_heat_recovered_w: f64,
    pub device_temp_c: f64,
    pub ambient_temp_c: f64,
    pub carbon_intensity_gco2_per_kwh: f64,
    pub compute_efficiency_gflops_per_w: f64,
}

impl Default for EnergyProfile {
    fn default() -> Self {
        Self {
            input_power_w: 0.0,
            waste_heat_recovered_w: 0.0,
            device_temp_c: 0.0,
            ambient_temp_c: 0.0,
            carbon_intensity_gco2_per_kwh: 0.0,
            compute_efficiency_gflops_per_w: 0.0,
        }
    }
}

/// Compute-side state of a node at one sampling tick.
///
/// Utilizations are fractions in [0, 1].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputeProfile {
    pub cpu_utilization: f64,
    pub npu_utilization: f64,
    pub gpu_utilization: f64,
    pub available_mem_mb: f64,
    pub bandwidth_mbps: f64,
    pub latency_ms: f64,
    pub instantaneous_power_gflops: f64,
}

impl Default for ComputeProfile {
    fn default() -> Self {
        Self {
            cpu_utilization: 0.0,
            npu_utilization: 0.0,
            gpu_utilization: 0.0,
            available_mem_mb: 0.0,
            bandwidth_mbps: 0.0,
            latency_ms: 0.0,
            instantaneous_power_gflops: 0.0,
        }
    }
}

/// Differential-privacy budget carried by a node across its lifetime.
///
/// `remaining` is a fraction in [0, 1] and is monotonically
/// non-increasing; [`PrivacyBudget::consume`] is the only mutator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrivacyBudget {
    pub epsilon: f64,
    pub delta: f64,
    remaining: f64,
}

impl PrivacyBudget {
    pub fn new(epsilon: f64, delta: f64) -> Self {
        Self {
            epsilon,
            delta,
            remaining: 1.0,
        }
    }

    pub fn remaining(&self) -> f64 {
        self.remaining
    }

    /// Spend a fraction of the budget. Saturates at zero; the budget can
    /// never grow back.
    pub fn consume(&mut self, amount: f64) {
        if amount > 0.0 {
            self.remaining = (self.remaining - amount).max(0.0);
        }
    }
}

impl Default for PrivacyBudget {
    fn default() -> Self {
        Self::new(1.0, 1e-5)
    }
}

/// One telemetry ingestion: the full physical and compute state of a node
/// at `timestamp`. Only the latest sample per node is retained by the
/// core; history is an external sink's concern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub node: NodeId,
    pub energy: EnergyProfile,
    pub compute: ComputeProfile,
    pub privacy: PrivacyBudget,
    pub timestamp: DateTime<Utc>,
}

impl TelemetrySample {
    pub fn new(
        node: NodeId,
        energy: EnergyProfile,
        compute: ComputeProfile,
        privacy: PrivacyBudget,
    ) -> Self {
        Self {
            node,
            energy,
            compute,
            privacy,
            timestamp: Utc::now(),
        }
    }

    /// Age of this sample relative to `now`, in whole seconds.
    pub fn age_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.timestamp).num_seconds()
    }
}

/// Circuit-breaker thresholds for a single node.
///
/// A node is in safe-mode exactly when its latest device temperature
/// exceeds `max_temp_c` or its latest latency exceeds `max_latency_ms`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyPolicy {
    pub max_temp_c: f64,
    pub max_latency_ms: f64,
    pub max_block_mb: f64,
    pub max_error_count: u32,
}

impl SafetyPolicy {
    /// Evaluate the safe-mode predicate against a sample.
    pub fn tripped_by(&self, sample: &TelemetrySample) -> bool {
        sample.energy.device_temp_c > self.max_temp_c
            || sample.compute.latency_ms > self.max_latency_ms
    }
}

impl Default for SafetyPolicy {
    fn default() -> Self {
        Self {
            max_temp_c: 80.0,
            max_latency_ms: 300.0,
            max_block_mb: 8.0,
            max_error_count: 25,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(temp: f64, latency: f64) -> TelemetrySample {
        let mut energy = EnergyProfile::default();
        energy.device_temp_c = temp;
        let mut compute = ComputeProfile::default();
        compute.latency_ms = latency;
        TelemetrySample::new(
            NodeId::new("n1", "eu", "pc"),
            energy,
            compute,
            PrivacyBudget::default(),
        )
    }

    #[test]
    fn safety_policy_trips_on_temperature_or_latency() {
        let policy = SafetyPolicy::default();
        assert!(!policy.tripped_by(&sample(40.0, 50.0)));
        assert!(policy.tripped_by(&sample(95.0, 50.0)));
        assert!(policy.tripped_by(&sample(40.0, 400.0)));
        // Boundary: thresholds are strict inequalities.
        assert!(!policy.tripped_by(&sample(80.0, 300.0)));
    }

    #[test]
    fn privacy_budget_never_increases() {
        let mut budget = PrivacyBudget::new(1.0, 1e-5);
        budget.consume(0.3);
        assert!((budget.remaining() - 0.7).abs() < 1e-12);
        budget.consume(-1.0); // negative spends are ignored
        assert!((budget.remaining() - 0.7).abs() < 1e-12);
        budget.consume(2.0);
        assert_eq!(budget.remaining(), 0.0);
    }
}
