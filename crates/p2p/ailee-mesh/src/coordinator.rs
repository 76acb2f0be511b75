use crate::ambient::{AmbientNode, IncentiveRecord};
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Cluster-level coordination over a set of ambient nodes: health-ranked
/// selection and reward-scaled dispatch. Task-level scheduling with full
/// candidate scoring lives in the engine; this is the lighter ambient
/// path used for cluster housekeeping work.
pub struct MeshCoordinator {
    cluster_id: String,
    nodes: RwLock<Vec<Arc<AmbientNode>>>,
    /// Telemetry older than this is not schedulable.
    freshness_horizon_secs: i64,
}

impl MeshCoordinator {
    pub fn new(cluster_id: impl Into<String>, freshness_horizon_secs: i64) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            nodes: RwLock::new(Vec::new()),
            freshness_horizon_secs,
        }
    }

    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    pub fn register_node(&self, node: Arc<AmbientNode>) {
        self.nodes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(node);
    }

    pub fn node_count(&self) -> usize {
        self.nodes.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Highest-health node that is not in safe-mode, has fresh telemetry,
    /// and (when required) carries a verified proof. Ties break on peer
    /// id for determinism.
    pub fn select_node_for_task(&self, require_valid_proof: bool) -> Option<Arc<AmbientNode>> {
        let nodes = self.nodes.read().unwrap_or_else(|e| e.into_inner());
        let now = chrono::Utc::now();
        nodes
            .iter()
            .filter(|node| {
                if node.is_safe_mode() {
                    return false;
                }
                let fresh = node
                    .latest_sample()
                    .map(|s| s.age_secs(now) <= self.freshness_horizon_secs)
                    .unwrap_or(false);
                if !fresh {
                    return false;
                }
                if require_valid_proof {
                    return node.last_proof().map(|p| p.verified).unwrap_or(false);
                }
                true
            })
            .max_by(|a, b| {
                a.health_score()
                    .partial_cmp(&b.health_score())
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| b.peer_id().cmp(a.peer_id()))
            })
            .cloned()
    }

    /// Run `task_fn` on the best node and accrue a reward scaled by the
    /// returned multiplier, the node's compute efficiency, and its
    /// remaining privacy budget. Returns `None` when no node qualifies.
    pub fn dispatch_and_reward(
        &self,
        task_id: &str,
        task_fn: impl FnOnce(&AmbientNode) -> f64,
        base_reward_tokens: f64,
    ) -> Option<IncentiveRecord> {
        let node = self.select_node_for_task(true)?;
        let multiplier = task_fn(&node);

        let (efficiency_factor, privacy_factor) = node
            .latest_sample()
            .map(|s| {
                (
                    (s.energy.compute_efficiency_gflops_per_w / 10.0).min(1.0),
                    s.privacy.remaining(),
                )
            })
            .unwrap_or((0.0, 0.0));

        let reward = base_reward_tokens * multiplier * efficiency_factor * privacy_factor;
        debug!(
            cluster = %self.cluster_id,
            node = %node.peer_id(),
            task = task_id,
            reward,
            "dispatching cluster task"
        );
        Some(node.accrue_reward(task_id, reward))
    }
}
