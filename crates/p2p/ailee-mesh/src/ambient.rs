use crate::state::WorkerState;
use ailee_identity::NodeKeyPair;
use ailee_proofs::{HashProof, ProofGenerator, ProofVerifier};
use ailee_reputation::ReputationLedger;
use ailee_sandbox::{sha256_hex, SandboxLimits, WasmCall, WasmResult, WasmSandbox};
use ailee_types::{NodeId, NodeSnapshot, SafetyPolicy, TelemetrySample};
use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum AmbientError {
    #[error("telemetry sample is tagged for {got}, not this node ({expected})")]
    WrongNode { expected: String, got: String },

    #[error("illegal worker state transition: {from:?} -> {to:?}")]
    IllegalTransition { from: WorkerState, to: WorkerState },
}

/// Opaque federated-learning update produced by a local training step.
/// The engine never looks inside the gradient blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FederatedUpdate {
    pub model_id: String,
    pub gradient: Vec<u8>,
    pub epsilon: f64,
    pub delta: f64,
    pub privacy_remaining: f64,
}

/// Lightweight attestation of an externally verified computation,
/// attached to the node's recent activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputationAttestation {
    pub task_id: String,
    pub circuit_id: String,
    pub proof_hash: String,
    pub verified: bool,
}

/// One earned-but-undistributed reward entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncentiveRecord {
    pub task_id: String,
    pub node: NodeId,
    pub reward_tokens: f64,
    pub distributed: bool,
}

/// Static capabilities a node advertises alongside its telemetry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeAdvertisement {
    pub cpu_cores: u32,
    pub storage_mb: f64,
    pub has_gpu: bool,
    pub has_tpu: bool,
    pub capability_tags: Vec<String>,
    pub max_tasks: u32,
    pub expected_cost_tokens: f64,
}

impl Default for NodeAdvertisement {
    fn default() -> Self {
        Self {
            cpu_cores: 4,
            storage_mb: 64_000.0,
            has_gpu: false,
            has_tpu: false,
            capability_tags: Vec::new(),
            max_tasks: 8,
            expected_cost_tokens: 1.0,
        }
    }
}

/// One worker endpoint: identity, latest telemetry, the safe-mode
/// circuit breaker, a reputation handle, its sandbox, and its proof
/// generator.
///
/// The node uniquely owns its latest-sample slot, its safe-mode flag,
/// and its proof slot; everything the coordinator needs is exported as a
/// value `NodeSnapshot`.
pub struct AmbientNode {
    id: NodeId,
    policy: SafetyPolicy,
    advertisement: NodeAdvertisement,
    latest: Mutex<Option<TelemetrySample>>,
    safe_mode: AtomicBool,
    state: Mutex<WorkerState>,
    ledger: Arc<ReputationLedger>,
    last_proof: Mutex<Option<HashProof>>,
    attestations: Mutex<Vec<ComputationAttestation>>,
    incentives: Mutex<Vec<IncentiveRecord>>,
    active_tasks: AtomicU32,
    sandbox: Arc<WasmSandbox>,
    prover: ProofGenerator,
    verifier: ProofVerifier,
}

impl AmbientNode {
    pub fn new(
        id: NodeId,
        policy: SafetyPolicy,
        advertisement: NodeAdvertisement,
        limits: SandboxLimits,
        ledger: Arc<ReputationLedger>,
        keypair: Arc<NodeKeyPair>,
    ) -> Result<Self> {
        Ok(Self {
            id,
            policy,
            advertisement,
            latest: Mutex::new(None),
            safe_mode: AtomicBool::new(false),
            state: Mutex::new(WorkerState::Unregistered),
            ledger,
            last_proof: Mutex::new(None),
            attestations: Mutex::new(Vec::new()),
            incentives: Mutex::new(Vec::new()),
            active_tasks: AtomicU32::new(0),
            sandbox: Arc::new(WasmSandbox::new(limits)?),
            prover: ProofGenerator::new(Some(keypair)),
            verifier: ProofVerifier::default(),
        })
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn peer_id(&self) -> &str {
        &self.id.pubkey
    }

    pub fn sandbox(&self) -> &WasmSandbox {
        &self.sandbox
    }

    pub fn is_safe_mode(&self) -> bool {
        self.safe_mode.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> WorkerState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_state(&self, to: WorkerState) -> Result<(), AmbientError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if !state.can_transition(to) {
            return Err(AmbientError::IllegalTransition { from: *state, to });
        }
        debug!(node = %self.id.pubkey, from = ?*state, to = ?to, "worker state transition");
        *state = to;
        Ok(())
    }

    pub fn latest_sample(&self) -> Option<TelemetrySample> {
        self.latest.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn last_proof(&self) -> Option<HashProof> {
        self.last_proof
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Atomically replace the latest sample, re-evaluate the safe-mode
    /// breaker against the policy, and stamp a fresh telemetry
    /// attestation into the proof slot.
    pub fn ingest_telemetry(&self, sample: TelemetrySample) -> Result<(), AmbientError> {
        if sample.node != self.id {
            return Err(AmbientError::WrongNode {
                expected: self.id.pubkey.clone(),
                got: sample.node.pubkey.clone(),
            });
        }

        let tripped = self.policy.tripped_by(&sample);
        self.safe_mode.store(tripped, Ordering::SeqCst);
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let target = if tripped {
                WorkerState::SafeMode
            } else {
                WorkerState::Active
            };
            if state.can_transition(target) {
                *state = target;
            }
        }
        if tripped {
            info!(
                node = %self.id.pubkey,
                temp = sample.energy.device_temp_c,
                latency = sample.compute.latency_ms,
                "safety policy tripped, entering safe mode"
            );
        }

        let attestation = self.attest_telemetry(&sample);
        *self.latest.lock().unwrap_or_else(|e| e.into_inner()) = Some(sample);
        *self.last_proof.lock().unwrap_or_else(|e| e.into_inner()) = Some(attestation);
        Ok(())
    }

    fn attest_telemetry(&self, sample: &TelemetrySample) -> HashProof {
        let rendered = serde_json::to_vec(sample).unwrap_or_default();
        let mut proof = self.prover.generate(
            &sha256_hex(b"telemetry-attestation"),
            &sha256_hex(&rendered),
            &sha256_hex(self.id.pubkey.as_bytes()),
            0,
            0,
            None,
        );
        proof.verified = self.verifier.verify(&proof).valid;
        proof
    }

    /// One local federated step over a minibatch. The gradient is an
    /// opaque blob; the privacy budget carried forward is whatever the
    /// latest sample reported.
    pub fn run_local_training(&self, model_id: &str, minibatch: &[f32]) -> FederatedUpdate {
        let magnitude: f32 = minibatch.iter().sum();
        let privacy = self
            .latest_sample()
            .map(|s| s.privacy)
            .unwrap_or_default();
        FederatedUpdate {
            model_id: model_id.to_string(),
            gradient: magnitude.to_le_bytes().to_vec(),
            epsilon: privacy.epsilon,
            delta: privacy.delta,
            privacy_remaining: privacy.remaining(),
        }
    }

    /// Record an external verifier's verdict over a computation.
    pub fn verify_computation(
        &self,
        task_id: &str,
        circuit_id: &str,
        result_hash: &str,
    ) -> ComputationAttestation {
        let prefix: String = result_hash.chars().take(16).collect();
        let attestation = ComputationAttestation {
            task_id: task_id.to_string(),
            circuit_id: circuit_id.to_string(),
            proof_hash: format!("zk_{task_id}_{prefix}"),
            verified: true,
        };
        self.attestations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(attestation.clone());
        attestation
    }

    /// Append an earned reward; distribution is a settlement concern.
    pub fn accrue_reward(&self, task_id: &str, tokens: f64) -> IncentiveRecord {
        let record = IncentiveRecord {
            task_id: task_id.to_string(),
            node: self.id.clone(),
            reward_tokens: tokens,
            distributed: false,
        };
        self.incentives
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record.clone());
        record
    }

    pub fn incentives(&self) -> Vec<IncentiveRecord> {
        self.incentives
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Delegate a success/failure outcome to the shared ledger. Trust
    /// never drops below zero.
    pub fn update_reputation(&self, success: bool, delta_score: f64) {
        if success {
            self.ledger.update(&self.id.pubkey, 1, 0);
            self.ledger.reward_node(&self.id.pubkey, delta_score);
        } else {
            self.ledger.update(&self.id.pubkey, 0, 1);
            self.ledger.slash_node(&self.id.pubkey, delta_score, 0.0);
        }
    }

    pub fn reputation_score(&self) -> f64 {
        self.ledger.get(&self.id.pubkey).score()
    }

    /// Composite health in [0, ∞): bandwidth, latency, efficiency, and
    /// reputation folded at fixed weights, halved in safe-mode, floored
    /// at zero. Nodes that never reported telemetry score zero.
    pub fn health_score(&self) -> f64 {
        let Some(sample) = self.latest_sample() else {
            return 0.0;
        };
        let bandwidth = (sample.compute.bandwidth_mbps / 1_000.0).min(1.0);
        let latency = (sample.compute.latency_ms / 1_000.0).clamp(0.0, 1.0);
        let efficiency = (sample.energy.compute_efficiency_gflops_per_w / 10.0).min(1.0);
        let reputation = self.reputation_score();

        let mut score =
            0.4 * bandwidth - 0.3 * latency + 0.2 * efficiency + 0.1 * reputation;
        if self.is_safe_mode() {
            score *= 0.5;
        }
        score.max(0.0)
    }

    /// Execute a call in this node's sandbox, recording a trace, and
    /// stamp a signed proof over successful results. The proof also
    /// becomes the node's `last_proof`.
    pub fn execute_task(&self, call: &WasmCall) -> (WasmResult, Option<HashProof>) {
        self.active_tasks.fetch_add(1, Ordering::SeqCst);
        let result = self.sandbox.execute_with_trace(call);
        self.active_tasks.fetch_sub(1, Ordering::SeqCst);

        let proof = if result.success {
            let mut proof = self.prover.generate_from_result(&result);
            proof.verified = self.verifier.verify(&proof).valid;
            *self.last_proof.lock().unwrap_or_else(|e| e.into_inner()) = Some(proof.clone());
            Some(proof)
        } else {
            None
        };
        (result, proof)
    }

    pub fn active_task_count(&self) -> u32 {
        self.active_tasks.load(Ordering::SeqCst)
    }

    /// Export the value view the engine registry and orchestrator use.
    pub fn snapshot(&self) -> NodeSnapshot {
        let mut snapshot = NodeSnapshot::new(self.id.pubkey.clone());
        snapshot.region = self.id.region.clone();
        snapshot.device_class = self.id.device_class.clone();
        snapshot.cpu_cores = self.advertisement.cpu_cores;
        snapshot.storage_mb = self.advertisement.storage_mb;
        snapshot.has_gpu = self.advertisement.has_gpu;
        snapshot.has_tpu = self.advertisement.has_tpu;
        snapshot.capability_tags = self.advertisement.capability_tags.clone();
        snapshot.max_task_count = self.advertisement.max_tasks;
        snapshot.expected_cost_tokens = self.advertisement.expected_cost_tokens;
        snapshot.safe_mode = self.is_safe_mode();
        snapshot.active_task_count = self.active_task_count();
        snapshot.has_verified_proof = self
            .last_proof()
            .map(|p| p.verified)
            .unwrap_or(false);

        if let Some(sample) = self.latest_sample() {
            snapshot.cpu_utilization = sample.compute.cpu_utilization;
            snapshot.available_mem_mb = sample.compute.available_mem_mb;
            snapshot.bandwidth_mbps = sample.compute.bandwidth_mbps;
            snapshot.latency_ms = sample.compute.latency_ms;
            snapshot.efficiency_gflops_per_w = sample.energy.compute_efficiency_gflops_per_w;
            snapshot.carbon_intensity_gco2_per_kwh = sample.energy.carbon_intensity_gco2_per_kwh;
            snapshot.telemetry_age_secs = Some(sample.age_secs(Utc::now()).max(0));
        }
        snapshot
    }
}
