use crate::ambient::AmbientNode;
use crate::state::WorkerState;
use crate::transport::MeshTransport;
use ailee_engine::{AssignmentFuture, MeshEngine, TaskExecutor, TaskOutcome};
use ailee_mesh_protocol::{
    decode_message, encode_message, MeshProtocolMessage, TaskAnnouncementV1, TaskResultV1,
    TASK_DISTRIBUTE_TOPIC, TASK_RESULTS_TOPIC,
};
use ailee_sandbox::{sha256_hex, WasmCall, WasmResult};
use ailee_types::{Assignment, ErrorCode, MeshError, TaskPayload, TaskType};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A WASM module registered for one task type, loaded into every member
/// node's sandbox.
#[derive(Clone)]
struct WasmModuleSpec {
    module_hash: String,
    bytes: Vec<u8>,
    function_name: String,
}

type NodeMap = Arc<RwLock<HashMap<String, Arc<AmbientNode>>>>;
type ModuleMap = Arc<RwLock<HashMap<TaskType, WasmModuleSpec>>>;

/// Glue between the engine and the mesh: owns the member nodes, routes
/// dispatches into their sandboxes, pushes refreshed snapshots back into
/// the engine registry, and bridges the pub/sub topics.
pub struct MeshService {
    engine: Arc<MeshEngine>,
    transport: Arc<dyn MeshTransport>,
    nodes: NodeMap,
    modules: ModuleMap,
    results_tx: mpsc::UnboundedSender<TaskResultV1>,
    results_rx: Mutex<Option<mpsc::UnboundedReceiver<TaskResultV1>>>,
    executor: Arc<NodeTaskExecutor>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MeshService {
    pub fn new(engine: Arc<MeshEngine>, transport: Arc<dyn MeshTransport>) -> Arc<Self> {
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let nodes: NodeMap = Arc::new(RwLock::new(HashMap::new()));
        let modules: ModuleMap = Arc::new(RwLock::new(HashMap::new()));
        // Every registered module type dispatches through the same
        // node-backed executor.
        let executor = Arc::new(NodeTaskExecutor {
            nodes: Arc::clone(&nodes),
            modules: Arc::clone(&modules),
            engine: Arc::downgrade(&engine),
            results_tx: results_tx.clone(),
        });
        Arc::new(Self {
            engine,
            transport,
            nodes,
            modules,
            results_tx,
            results_rx: Mutex::new(Some(results_rx)),
            executor,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn engine(&self) -> &Arc<MeshEngine> {
        &self.engine
    }

    /// Add a worker node: register lifecycle state, preload every known
    /// module into its sandbox, and publish its first snapshot.
    pub fn add_node(&self, node: Arc<AmbientNode>) -> anyhow::Result<()> {
        if node.state() == WorkerState::Unregistered {
            node.set_state(WorkerState::Registered)?;
        }
        for spec in self
            .modules
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
        {
            node.sandbox().load_module(&spec.bytes, &spec.module_hash)?;
        }
        self.engine.update_node(node.snapshot());
        self.nodes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(node.peer_id().to_string(), node);
        Ok(())
    }

    pub fn remove_node(&self, peer_id: &str) {
        if let Some(node) = self
            .nodes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(peer_id)
        {
            let _ = node.set_state(WorkerState::Unregistered);
        }
        self.engine.unregister_node(peer_id);
    }

    /// Register the module that executes a task type, loading it into
    /// every member node.
    pub fn register_wasm_module(
        &self,
        task_type: TaskType,
        bytes: Vec<u8>,
        function_name: impl Into<String>,
    ) -> anyhow::Result<String> {
        let module_hash = sha256_hex(&bytes);
        for node in self
            .nodes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
        {
            node.sandbox().load_module(&bytes, &module_hash)?;
        }
        self.modules
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                task_type.clone(),
                WasmModuleSpec {
                    module_hash: module_hash.clone(),
                    bytes,
                    function_name: function_name.into(),
                },
            );
        self.engine
            .register_executor(task_type, Arc::clone(&self.executor) as Arc<dyn TaskExecutor>);
        Ok(module_hash)
    }

    /// Route a telemetry sample to its node and refresh the engine's
    /// view of that worker.
    pub fn ingest_telemetry(
        &self,
        sample: ailee_types::TelemetrySample,
    ) -> anyhow::Result<()> {
        let node = self
            .nodes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&sample.node.pubkey)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown node: {}", sample.node.pubkey))?;
        node.ingest_telemetry(sample)?;
        self.engine.update_node(node.snapshot());
        Ok(())
    }

    pub fn submit(&self, task: TaskPayload) -> Result<AssignmentFuture, MeshError> {
        self.engine.submit_task(task)
    }

    /// Start the engine plus the two topic bridges: inbound task
    /// announcements and outbound results.
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        self.engine.start();

        // Outbound: executor outcomes -> results topic.
        if let Some(mut results_rx) = self
            .results_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            let transport = Arc::clone(&self.transport);
            let forwarder = tokio::spawn(async move {
                while let Some(result) = results_rx.recv().await {
                    let message = MeshProtocolMessage::TaskResultV1(result);
                    match encode_message(&message) {
                        Ok(bytes) => {
                            if let Err(e) = transport.publish(TASK_RESULTS_TOPIC, bytes).await {
                                warn!("failed to publish task result: {e}");
                            }
                        }
                        Err(e) => warn!("failed to encode task result: {e}"),
                    }
                }
            });
            self.tasks
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(forwarder);
        }

        // Inbound: announcements -> engine submissions.
        let mut announcements = self.transport.subscribe(TASK_DISTRIBUTE_TOPIC).await?;
        let service = Arc::clone(self);
        let listener = tokio::spawn(async move {
            loop {
                match announcements.recv().await {
                    Ok(bytes) => service.handle_announcement(&bytes),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "announcement listener lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(listener);

        info!("mesh service started");
        Ok(())
    }

    fn handle_announcement(&self, bytes: &[u8]) {
        let message = match decode_message(bytes) {
            Ok(message) => message,
            Err(e) => {
                warn!("undecodable announcement dropped: {e}");
                return;
            }
        };
        let MeshProtocolMessage::TaskAnnouncementV1(announcement) = message else {
            return; // results on the wrong topic are ignored
        };

        let task = task_from_announcement(announcement);
        match self.engine.submit_task(task) {
            Ok(future) => {
                tokio::spawn(async move {
                    let assignment = future.await;
                    debug!(
                        assigned = assignment.assigned,
                        worker = %assignment.worker_peer_id,
                        "announced task resolved"
                    );
                });
            }
            Err(e) => warn!("announced task refused: {e}"),
        }
    }

    pub fn stop(&self) {
        self.engine.stop();
        for task in self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
        {
            task.abort();
        }
    }
}

fn task_from_announcement(announcement: TaskAnnouncementV1) -> TaskPayload {
    let mut task = TaskPayload::new(
        announcement.task_id,
        announcement.task_type,
        announcement.priority,
    );
    task.requirements = announcement.requirements;
    task.payload_bytes = announcement.payload;
    task.submitted_at = Utc::now().timestamp() as u64;
    task
}

/// Executes assigned tasks in the chosen node's sandbox and reports the
/// outcome both to the engine (return value) and the results topic
/// (side channel).
struct NodeTaskExecutor {
    nodes: NodeMap,
    modules: ModuleMap,
    engine: Weak<MeshEngine>,
    results_tx: mpsc::UnboundedSender<TaskResultV1>,
}

impl NodeTaskExecutor {
    fn publish_result(
        &self,
        task: &TaskPayload,
        worker: &str,
        result: &WasmResult,
        proof_hash: Option<String>,
    ) {
        let _ = self.results_tx.send(TaskResultV1 {
            task_id: task.task_id.clone(),
            executor_node: worker.to_string(),
            success: result.success,
            result_bytes: result.output_bytes.clone(),
            proof_hash,
            error: result.error.clone(),
        });
    }
}

/// Quality is the speed margin left against the sandbox deadline: a task
/// finishing instantly scores 1.0, one at the wire scores 0.5.
fn quality_from_metrics(result: &WasmResult, timeout_ms: u64) -> f64 {
    if !result.success {
        return 0.0;
    }
    let used = result.metrics.execution_time_us as f64 / 1_000.0;
    let budget = timeout_ms.max(1) as f64;
    (1.0 - 0.5 * (used / budget).clamp(0.0, 1.0)).clamp(0.0, 1.0)
}

impl TaskExecutor for NodeTaskExecutor {
    fn execute(&self, task: &TaskPayload, assignment: &Assignment) -> anyhow::Result<TaskOutcome> {
        let worker = assignment.worker_peer_id.as_str();
        let node = self
            .nodes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(worker)
            .cloned();
        let Some(node) = node else {
            return Ok(TaskOutcome::failed(
                ErrorCode::Unknown,
                format!("assigned worker {worker} is not a member of this mesh"),
            ));
        };
        let spec = self
            .modules
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&task.task_type)
            .cloned();
        let Some(spec) = spec else {
            return Ok(TaskOutcome::failed(
                ErrorCode::ModuleLoadFailed,
                format!("no module registered for task type {:?}", task.task_type),
            ));
        };

        let mut call = WasmCall::new(
            spec.module_hash.clone(),
            spec.function_name.clone(),
            task.payload_bytes.clone(),
        );
        call.node_id = worker.to_string();

        let (result, proof) = node.execute_task(&call);

        // The dispatch changed load and proof state; let the engine see it.
        if let Some(engine) = self.engine.upgrade() {
            engine.update_node(node.snapshot());
        }

        let proof_hash = proof.as_ref().map(|p| p.execution_hash.clone());
        self.publish_result(task, worker, &result, proof_hash.clone());

        let timeout_ms = node.sandbox().limits().timeout_ms;
        Ok(TaskOutcome {
            success: result.success,
            quality: quality_from_metrics(&result, timeout_ms),
            execution_time_ms: result.metrics.execution_time_us / 1_000,
            error: result.error.clone(),
            error_code: result.error_code,
            output: result.output_bytes,
            proof,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ailee_sandbox::{ExecutionMetrics, WasmResult};

    #[test]
    fn quality_rewards_fast_completions() {
        let mut result = WasmResult::failure("m", "i", ErrorCode::ExecutionTimeout, "late");
        assert_eq!(quality_from_metrics(&result, 1_000), 0.0);

        result.success = true;
        result.error = None;
        result.error_code = ErrorCode::Success;
        result.metrics = ExecutionMetrics::default();
        result.metrics.execution_time_us = 0;
        assert_eq!(quality_from_metrics(&result, 1_000), 1.0);

        result.metrics.execution_time_us = 1_000_000; // the whole budget
        assert_eq!(quality_from_metrics(&result, 1_000), 0.5);

        result.metrics.execution_time_us = 500_000;
        assert!((quality_from_metrics(&result, 1_000) - 0.75).abs() < 1e-9);
    }
}
