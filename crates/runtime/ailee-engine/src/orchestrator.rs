use ailee_reputation::{LatencyMap, ReputationLedger};
use ailee_types::{Assignment, CandidateScore, NodeSnapshot, ScoreBreakdown, TaskPayload};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;
use uuid::Uuid;

/// Closed set of scheduling strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingStrategy {
    #[default]
    WeightedScore,
    RoundRobin,
    LeastLoaded,
    LowestLatency,
    HighestReputation,
    LowestCost,
    GeneticAlgorithm,
    GeographicAffinity,
    LoadBalancing,
}

/// Weights over the four normalized sub-scores.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoringWeights {
    pub trust: f64,
    pub speed: f64,
    pub power: f64,
    pub cost: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            trust: 0.6,
            speed: 0.3,
            power: 0.1,
            cost: 0.0,
        }
    }
}

/// Counters the orchestrator keeps about its own decisions. Interior
/// atomics only; decisions themselves stay a pure function of the inputs
/// (round-robin's shared cursor being that strategy's documented
/// exception).
#[derive(Debug, Default)]
struct Counters {
    total_assignments: AtomicU64,
    successful_assignments: AtomicU64,
    failed_assignments: AtomicU64,
    round_robin_cursor: AtomicUsize,
    per_worker: Mutex<HashMap<String, u64>>,
}

/// Snapshot of orchestrator counters for the monitoring loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct OrchestratorMetrics {
    pub total_assignments: u64,
    pub successful_assignments: u64,
    pub failed_assignments: u64,
    pub assignments_per_worker: Vec<(String, u64)>,
}

/// Tunables the orchestrator reads from the engine configuration.
#[derive(Debug, Clone, Copy)]
pub struct OrchestratorConfig {
    pub weights: ScoringWeights,
    pub max_acceptable_latency_ms: f64,
    pub telemetry_freshness_s: i64,
    pub task_timeout_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            weights: ScoringWeights::default(),
            max_acceptable_latency_ms: 1_000.0,
            telemetry_freshness_s: 120,
            task_timeout_ms: 30_000,
        }
    }
}

/// Turns a task plus a fleet snapshot into an assignment decision.
///
/// Reads the reputation ledger and latency map through shared handles but
/// never mutates node, reputation, or latency state; all mutation happens
/// in the engine after the assignment comes back.
pub struct Orchestrator {
    strategy: Mutex<SchedulingStrategy>,
    config: Mutex<OrchestratorConfig>,
    ledger: Arc<ReputationLedger>,
    latency: Arc<LatencyMap>,
    counters: Counters,
}

impl Orchestrator {
    pub fn new(
        strategy: SchedulingStrategy,
        config: OrchestratorConfig,
        ledger: Arc<ReputationLedger>,
        latency: Arc<LatencyMap>,
    ) -> Self {
        Self {
            strategy: Mutex::new(strategy),
            config: Mutex::new(config),
            ledger,
            latency,
            counters: Counters::default(),
        }
    }

    pub fn strategy(&self) -> SchedulingStrategy {
        *self.strategy.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_strategy(&self, strategy: SchedulingStrategy) {
        *self.strategy.lock().unwrap_or_else(|e| e.into_inner()) = strategy;
    }

    pub fn set_config(&self, config: OrchestratorConfig) {
        *self.config.lock().unwrap_or_else(|e| e.into_inner()) = config;
    }

    pub fn metrics(&self) -> OrchestratorMetrics {
        let mut per_worker: Vec<(String, u64)> = self
            .counters
            .per_worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        per_worker.sort_by(|a, b| a.0.cmp(&b.0));
        OrchestratorMetrics {
            total_assignments: self.counters.total_assignments.load(Ordering::Relaxed),
            successful_assignments: self
                .counters
                .successful_assignments
                .load(Ordering::Relaxed),
            failed_assignments: self.counters.failed_assignments.load(Ordering::Relaxed),
            assignments_per_worker: per_worker,
        }
    }

    /// Decide a worker for `task` over the given fleet snapshot.
    pub fn assign(&self, task: &TaskPayload, fleet: &[NodeSnapshot]) -> Assignment {
        self.counters
            .total_assignments
            .fetch_add(1, Ordering::Relaxed);

        let config = *self.config.lock().unwrap_or_else(|e| e.into_inner());
        let candidates = self.filter_candidates(task, fleet, &config);
        if candidates.is_empty() {
            self.counters
                .failed_assignments
                .fetch_add(1, Ordering::Relaxed);
            let reason = if fleet.is_empty() {
                "no candidates available".to_string()
            } else {
                format!(
                    "no node among {} candidates meets task requirements",
                    fleet.len()
                )
            };
            debug!(task = %task.task_id, "assignment rejected: {reason}");
            return Assignment::rejected(reason);
        }

        let strategy = self.strategy();
        let mut scored = self.score_candidates(task, &candidates, &config);
        // Ranked best-first, peer id breaking exact ties.
        scored.sort_by(|a, b| {
            b.breakdown
                .final_score
                .partial_cmp(&a.breakdown.final_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.peer_id.cmp(&b.peer_id))
        });

        let primary = self
            .select(strategy, task, &candidates, &scored, None)
            .unwrap_or_else(|| scored[0].peer_id.clone());
        let backup = self.select(strategy, task, &candidates, &scored, Some(primary.as_str()));

        let chosen = candidates
            .iter()
            .find(|c| c.peer_id == primary)
            .unwrap_or(&candidates[0]);
        let chosen_score = scored
            .iter()
            .find(|s| s.peer_id == primary)
            .map(|s| s.breakdown)
            .unwrap_or_default();

        self.counters
            .successful_assignments
            .fetch_add(1, Ordering::Relaxed);
        *self
            .counters
            .per_worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(primary.clone())
            .or_insert(0) += 1;

        let assigned_at = Utc::now().timestamp() as u64;
        let expected_latency_ms = self.effective_latency(chosen);
        Assignment {
            assigned: true,
            reason: format!("selected by {strategy:?}"),
            assignment_id: Uuid::new_v4().to_string(),
            assigned_at,
            worker_peer_id: primary,
            worker_region: chosen.region.clone(),
            backup_worker_peer_id: backup,
            score: chosen_score,
            expected_latency_ms,
            expected_cost_tokens: chosen.expected_cost_tokens,
            estimated_completion_time: assigned_at
                + config.task_timeout_ms / 1_000
                + (expected_latency_ms / 1_000.0).ceil() as u64,
            candidate_scores: scored,
        }
    }

    fn filter_candidates<'a>(
        &self,
        task: &TaskPayload,
        fleet: &'a [NodeSnapshot],
        config: &OrchestratorConfig,
    ) -> Vec<&'a NodeSnapshot> {
        fleet
            .iter()
            .filter(|node| {
                if node.safe_mode {
                    return false;
                }
                match node.telemetry_age_secs {
                    Some(age) if age <= config.telemetry_freshness_s => {}
                    _ => return false,
                }
                let req = &task.requirements;
                if node.cpu_cores < req.min_cpu_cores
                    || (node.available_mem_mb as u64) < req.min_memory_mb
                    || (node.storage_mb as u64) < req.min_storage_mb
                    || node.bandwidth_mbps < req.min_bandwidth_mbps
                    || (req.requires_gpu && !node.has_gpu)
                    || (req.requires_tpu && !node.has_tpu)
                {
                    return false;
                }
                if !req
                    .capability_tags
                    .iter()
                    .all(|tag| node.capability_tags.contains(tag))
                {
                    return false;
                }
                if self.ledger.get(&node.peer_id).score() < task.min_reputation_score {
                    return false;
                }
                if task.blacklisted_nodes.contains(&node.peer_id) {
                    return false;
                }
                if task.max_cost_tokens > 0.0 && node.expected_cost_tokens > task.max_cost_tokens {
                    return false;
                }
                if let Some(region) = &task.preferred_region {
                    if &node.region != region {
                        return false;
                    }
                }
                true
            })
            .collect()
    }

    fn effective_latency(&self, node: &NodeSnapshot) -> f64 {
        self.latency
            .latency_ms(&node.peer_id)
            .unwrap_or(node.latency_ms)
    }

    fn score_one(
        &self,
        task: &TaskPayload,
        node: &NodeSnapshot,
        weights: &ScoringWeights,
        config: &OrchestratorConfig,
    ) -> ScoreBreakdown {
        let reputation = self.ledger.get(&node.peer_id).score();

        let latency_ms = self.effective_latency(node);
        let latency = 1.0 - (latency_ms / config.max_acceptable_latency_ms).clamp(0.0, 1.0);

        let capacity = (node.bandwidth_mbps / 1_000.0).min(1.0) * 0.4
            + (1.0 - node.cpu_utilization.clamp(0.0, 1.0)) * 0.3
            + (node.efficiency_gflops_per_w / 10.0).min(1.0) * 0.2
            + (1.0 - node.load_factor().clamp(0.0, 1.0)) * 0.1;

        let cost = if task.max_cost_tokens > 0.0 {
            1.0 - (node.expected_cost_tokens / task.max_cost_tokens).clamp(0.0, 1.0)
        } else {
            0.0
        };

        let final_score = weights.trust * reputation
            + weights.speed * latency
            + weights.power * capacity
            + weights.cost * cost;

        ScoreBreakdown {
            reputation,
            latency,
            capacity,
            cost,
            final_score,
        }
    }

    fn score_candidates(
        &self,
        task: &TaskPayload,
        candidates: &[&NodeSnapshot],
        config: &OrchestratorConfig,
    ) -> Vec<CandidateScore> {
        candidates
            .iter()
            .map(|node| CandidateScore {
                peer_id: node.peer_id.clone(),
                breakdown: self.score_one(task, node, &config.weights, config),
            })
            .collect()
    }

    /// Pick one peer under `strategy`, optionally excluding the already
    /// chosen primary (backup selection re-runs with it removed).
    fn select(
        &self,
        strategy: SchedulingStrategy,
        task: &TaskPayload,
        candidates: &[&NodeSnapshot],
        scored: &[CandidateScore],
        exclude: Option<&str>,
    ) -> Option<String> {
        let pool: Vec<&&NodeSnapshot> = candidates
            .iter()
            .filter(|c| Some(c.peer_id.as_str()) != exclude)
            .collect();
        if pool.is_empty() {
            return None;
        }

        let best_scored = |pool: &[&&NodeSnapshot]| -> Option<String> {
            scored
                .iter()
                .find(|s| pool.iter().any(|c| c.peer_id == s.peer_id))
                .map(|s| s.peer_id.clone())
        };

        let argmin_by = |key: &dyn Fn(&NodeSnapshot) -> f64| -> Option<String> {
            pool.iter()
                .min_by(|a, b| {
                    key(a)
                        .partial_cmp(&key(b))
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| a.peer_id.cmp(&b.peer_id))
                })
                .map(|n| n.peer_id.clone())
        };

        match strategy {
            SchedulingStrategy::WeightedScore => best_scored(&pool),
            SchedulingStrategy::RoundRobin => {
                // Backup selection must not consume the shared cursor.
                if exclude.is_some() {
                    return best_scored(&pool);
                }
                // Deterministic order, shared advancing cursor.
                let mut ordered: Vec<&&&NodeSnapshot> = pool.iter().collect();
                ordered.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
                let cursor = self
                    .counters
                    .round_robin_cursor
                    .fetch_add(1, Ordering::Relaxed);
                Some(ordered[cursor % ordered.len()].peer_id.clone())
            }
            SchedulingStrategy::LeastLoaded => {
                argmin_by(&|n| f64::from(n.active_task_count))
            }
            SchedulingStrategy::LowestLatency => argmin_by(&|n| self.effective_latency(n)),
            SchedulingStrategy::HighestReputation => {
                argmin_by(&|n| -self.ledger.get(&n.peer_id).score())
            }
            SchedulingStrategy::LowestCost => argmin_by(&|n| n.expected_cost_tokens),
            SchedulingStrategy::GeneticAlgorithm => {
                self.genetic_select(task, &pool)
            }
            SchedulingStrategy::GeographicAffinity => {
                if let Some(region) = &task.preferred_region {
                    let local: Vec<&&NodeSnapshot> = pool
                        .iter()
                        .filter(|n| &n.region == region)
                        .copied()
                        .collect();
                    if !local.is_empty() {
                        return best_scored(&local);
                    }
                }
                best_scored(&pool)
            }
            SchedulingStrategy::LoadBalancing => argmin_by(&|n| n.load_factor()),
        }
    }

    /// Bounded local search: start from the weighted-score winner and
    /// re-rank under small deterministic weight perturbations derived from
    /// the task id. Equal inputs give equal answers.
    fn genetic_select(&self, task: &TaskPayload, pool: &[&&NodeSnapshot]) -> Option<String> {
        const GENERATIONS: u32 = 8;

        let config = *self.config.lock().unwrap_or_else(|e| e.into_inner());
        let seed = task
            .task_id
            .bytes()
            .fold(0u64, |acc, b| acc.wrapping_mul(31).wrapping_add(u64::from(b)));

        let mut best: Option<(f64, String)> = None;
        for generation in 0..GENERATIONS {
            // Deterministic jitter in [-0.05, 0.05] per weight.
            let jitter = |salt: u64| {
                let mixed = seed
                    .wrapping_mul(6_364_136_223_846_793_005)
                    .wrapping_add(salt.wrapping_add(u64::from(generation)));
                ((mixed >> 33) % 101) as f64 / 1_000.0 - 0.05
            };
            let weights = ScoringWeights {
                trust: (config.weights.trust + jitter(1)).max(0.0),
                speed: (config.weights.speed + jitter(2)).max(0.0),
                power: (config.weights.power + jitter(3)).max(0.0),
                cost: (config.weights.cost + jitter(4)).max(0.0),
            };
            for node in pool {
                let score = self.score_one(task, node, &weights, &config).final_score;
                let better = match &best {
                    None => true,
                    Some((best_score, best_peer)) => {
                        score > *best_score
                            || (score == *best_score && node.peer_id < *best_peer)
                    }
                };
                if better {
                    best = Some((score, node.peer_id.clone()));
                }
            }
        }
        best.map(|(_, peer)| peer)
    }
}
