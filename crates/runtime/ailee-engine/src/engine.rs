use crate::config::{MeshConfig, PerformanceConfig};
use crate::discovery::DiscoveryProvider;
use crate::executor::{TaskExecutor, TaskOutcome};
use crate::metrics::{EngineInstruments, ENGINE_INSTRUMENTS};
use crate::orchestrator::{
    Orchestrator, OrchestratorConfig, OrchestratorMetrics, ScoringWeights,
};
use crate::queue::TaskQueue;
use crate::registry::NodeRegistry;
use ailee_reputation::{LatencyMap, ReputationLedger};
use ailee_types::{Assignment, ErrorCode, MeshError, TaskPayload, TaskType};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Reason attached to every promise cancelled by shutdown.
pub const STOPPED_REASON: &str = "Engine stopped before assignment";

const LOOP_POLL: Duration = Duration::from_millis(100);

/// Periodic health snapshot emitted by the monitoring loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct EngineMetrics {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
    pub active_nodes: usize,
    pub queued_tasks: usize,
    pub avg_task_latency_ms: f64,
    pub orchestrator: OrchestratorMetrics,
}

/// Future returned by `submit_task`, resolving with the task's terminal
/// `Assignment`. A dropped engine side resolves it as cancelled rather
/// than erroring.
pub struct AssignmentFuture {
    rx: oneshot::Receiver<Assignment>,
}

impl AssignmentFuture {
    /// Synchronous wait, for callers outside an async runtime.
    pub fn wait(self) -> Assignment {
        self.rx
            .blocking_recv()
            .unwrap_or_else(|_| Assignment::rejected(STOPPED_REASON))
    }
}

impl Future for AssignmentFuture {
    type Output = Assignment;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(assignment)) => Poll::Ready(assignment),
            Poll::Ready(Err(_)) => Poll::Ready(Assignment::rejected(STOPPED_REASON)),
            Poll::Pending => Poll::Pending,
        }
    }
}

struct Shared {
    config: Mutex<MeshConfig>,
    queue: TaskQueue,
    registry: NodeRegistry,
    ledger: Arc<ReputationLedger>,
    latency: Arc<LatencyMap>,
    orchestrator: Orchestrator,
    executors: Mutex<HashMap<TaskType, Arc<dyn TaskExecutor>>>,
    pending: Mutex<HashMap<String, oneshot::Sender<Assignment>>>,
    discovery: Mutex<Option<Arc<dyn DiscoveryProvider>>>,
    running: AtomicBool,
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    latency_sum_ms: AtomicU64,
    latency_count: AtomicU64,
    instruments: EngineInstruments,
}

/// The mesh compute engine: owns the task queue, the pending-promise
/// table, the node registry, and the worker/discovery/monitoring threads.
/// Everything else it touches (ledger, latency map, orchestrator) is
/// shared by handle.
pub struct MeshEngine {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

fn orchestrator_config(perf: &PerformanceConfig) -> OrchestratorConfig {
    OrchestratorConfig {
        weights: ScoringWeights {
            trust: perf.trust_weight,
            speed: perf.speed_weight,
            power: perf.power_weight,
            cost: perf.cost_weight,
        },
        max_acceptable_latency_ms: perf.max_acceptable_latency_ms,
        telemetry_freshness_s: perf.telemetry_freshness_s,
        task_timeout_ms: perf.task_timeout_ms,
    }
}

impl MeshEngine {
    pub fn new(config: MeshConfig) -> Self {
        Self::with_collaborators(
            config,
            Arc::new(ReputationLedger::new()),
            Arc::new(LatencyMap::new()),
        )
    }

    pub fn with_collaborators(
        config: MeshConfig,
        ledger: Arc<ReputationLedger>,
        latency: Arc<LatencyMap>,
    ) -> Self {
        Self::with_instruments(config, ledger, latency, ENGINE_INSTRUMENTS.clone())
    }

    /// Full constructor; tests pass instruments bound to a private
    /// prometheus registry.
    pub fn with_instruments(
        config: MeshConfig,
        ledger: Arc<ReputationLedger>,
        latency: Arc<LatencyMap>,
        instruments: EngineInstruments,
    ) -> Self {
        let orchestrator = Orchestrator::new(
            config.performance.default_strategy,
            orchestrator_config(&config.performance),
            Arc::clone(&ledger),
            Arc::clone(&latency),
        );
        let capacity = config.performance.max_concurrent_tasks.saturating_mul(16).max(64);
        Self {
            shared: Arc::new(Shared {
                config: Mutex::new(config),
                queue: TaskQueue::new(capacity),
                registry: NodeRegistry::new(),
                ledger,
                latency,
                orchestrator,
                executors: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                discovery: Mutex::new(None),
                running: AtomicBool::new(false),
                submitted: AtomicU64::new(0),
                completed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                retried: AtomicU64::new(0),
                latency_sum_ms: AtomicU64::new(0),
                latency_count: AtomicU64::new(0),
                instruments,
            }),
            threads: Mutex::new(Vec::new()),
        }
    }

    pub fn ledger(&self) -> Arc<ReputationLedger> {
        Arc::clone(&self.shared.ledger)
    }

    pub fn latency_map(&self) -> Arc<LatencyMap> {
        Arc::clone(&self.shared.latency)
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn current_strategy(&self) -> crate::orchestrator::SchedulingStrategy {
        self.shared.orchestrator.strategy()
    }

    /// Install the executor for a task type, replacing any previous one.
    pub fn register_executor(&self, task_type: TaskType, executor: Arc<dyn TaskExecutor>) {
        self.shared
            .executors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(task_type, executor);
    }

    pub fn set_discovery_provider(&self, provider: Arc<dyn DiscoveryProvider>) {
        *self
            .shared
            .discovery
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(provider);
    }

    /// Register or refresh a worker in the node registry.
    pub fn update_node(&self, snapshot: ailee_types::NodeSnapshot) {
        self.shared.registry.upsert(snapshot);
    }

    pub fn unregister_node(&self, peer_id: &str) -> bool {
        self.shared.registry.remove(peer_id)
    }

    pub fn node_count(&self) -> usize {
        self.shared.registry.len()
    }

    /// Spin up the worker pool, the discovery loop, and (when metrics are
    /// enabled) the monitoring loop. A second `start` is a no-op.
    pub fn start(&self) {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.queue.reopen();

        let (worker_threads, discovery_enabled, monitoring_enabled) = {
            let config = self.shared.config.lock().unwrap_or_else(|e| e.into_inner());
            (
                config.performance.worker_threads,
                true,
                config.monitoring.enable_metrics,
            )
        };

        let mut threads = self.threads.lock().unwrap_or_else(|e| e.into_inner());
        for index in 0..worker_threads {
            let shared = Arc::clone(&self.shared);
            threads.push(
                std::thread::Builder::new()
                    .name(format!("ailee-worker-{index}"))
                    .spawn(move || worker_loop(shared))
                    .expect("spawn worker thread"),
            );
        }
        if discovery_enabled {
            let shared = Arc::clone(&self.shared);
            threads.push(
                std::thread::Builder::new()
                    .name("ailee-discovery".to_string())
                    .spawn(move || discovery_loop(shared))
                    .expect("spawn discovery thread"),
            );
        }
        if monitoring_enabled {
            let shared = Arc::clone(&self.shared);
            threads.push(
                std::thread::Builder::new()
                    .name("ailee-monitor".to_string())
                    .spawn(move || monitoring_loop(shared))
                    .expect("spawn monitoring thread"),
            );
        }
        info!(workers = worker_threads, "engine started");
    }

    /// Submit a task; the returned future resolves with its terminal
    /// assignment. At most one completion ever fires per task id.
    pub fn submit_task(&self, mut task: TaskPayload) -> Result<AssignmentFuture, MeshError> {
        if !self.is_running() {
            return Err(MeshError::EngineStopped);
        }
        if task.submitted_at == 0 {
            task.submitted_at = Utc::now().timestamp() as u64;
        }
        if task.max_cost_tokens <= 0.0 {
            task.max_cost_tokens = self
                .shared
                .config
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .economic
                .default_max_cost_tokens;
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self
                .shared
                .pending
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if pending.contains_key(&task.task_id) {
                return Err(MeshError::MalformedTask(format!(
                    "task id already pending: {}",
                    task.task_id
                )));
            }
            pending.insert(task.task_id.clone(), tx);
        }

        if self.shared.queue.push(task.clone()).is_err() {
            self.shared
                .pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&task.task_id);
            return Err(MeshError::QueueFull(self.shared.queue.len()));
        }
        self.shared
            .instruments
            .queue_depth
            .set(self.shared.queue.len() as i64);
        debug!(task = %task.task_id, priority = ?task.priority, "task submitted");
        Ok(AssignmentFuture { rx })
    }

    /// Stop the engine: drain the queue, join every thread, and resolve
    /// every outstanding promise as cancelled. Idempotent.
    pub fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let _drained = self.shared.queue.close_and_drain();

        let handles: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.threads.lock().unwrap_or_else(|e| e.into_inner()));
        for handle in handles {
            let _ = handle.join();
        }

        let pending: HashMap<String, oneshot::Sender<Assignment>> =
            std::mem::take(&mut *self.shared.pending.lock().unwrap_or_else(|e| e.into_inner()));
        let cancelled = pending.len();
        for (task_id, tx) in pending {
            debug!(task = %task_id, "cancelling pending promise");
            let _ = tx.send(Assignment::rejected(STOPPED_REASON));
        }
        info!(cancelled, "engine stopped");
    }

    /// Replace the configuration and reapply the default strategy.
    pub fn update_config(&self, config: MeshConfig) {
        self.shared
            .orchestrator
            .set_strategy(config.performance.default_strategy);
        self.shared
            .orchestrator
            .set_config(orchestrator_config(&config.performance));
        *self.shared.config.lock().unwrap_or_else(|e| e.into_inner()) = config;
    }

    pub fn metrics(&self) -> EngineMetrics {
        let latency_count = self.shared.latency_count.load(Ordering::Relaxed);
        EngineMetrics {
            submitted: self.shared.submitted.load(Ordering::Relaxed),
            completed: self.shared.completed.load(Ordering::Relaxed),
            failed: self.shared.failed.load(Ordering::Relaxed),
            retried: self.shared.retried.load(Ordering::Relaxed),
            active_nodes: self.shared.registry.len(),
            queued_tasks: self.shared.queue.len(),
            avg_task_latency_ms: if latency_count == 0 {
                0.0
            } else {
                self.shared.latency_sum_ms.load(Ordering::Relaxed) as f64 / latency_count as f64
            },
            orchestrator: self.shared.orchestrator.metrics(),
        }
    }
}

impl Drop for MeshEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

fn resolve_promise(shared: &Shared, task_id: &str, assignment: Assignment) {
    let sender = shared
        .pending
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .remove(task_id);
    if let Some(tx) = sender {
        // A dropped receiver just means nobody is waiting anymore.
        let _ = tx.send(assignment);
    }
}

fn worker_loop(shared: Arc<Shared>) {
    while let Some(task) = shared.queue.pop_blocking() {
        shared.submitted.fetch_add(1, Ordering::Relaxed);
        shared.instruments.tasks_submitted.inc();
        shared
            .instruments
            .queue_depth
            .set(shared.queue.len() as i64);

        let task_id = task.task_id.clone();
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| process_task(&shared, task)));
        match outcome {
            Ok(None) => {} // requeued for retry; promise stays pending
            Ok(Some(assignment)) => resolve_promise(&shared, &task_id, assignment),
            Err(_) => {
                shared.failed.fetch_add(1, Ordering::Relaxed);
                shared.instruments.tasks_failed.inc();
                warn!(task = %task_id, "task processing panicked");
                resolve_promise(
                    &shared,
                    &task_id,
                    Assignment::rejected("internal error while processing task"),
                );
            }
        }
    }
}

/// Process one dequeued task. Returns the terminal assignment, or `None`
/// when the task went back on the queue for another attempt.
fn process_task(shared: &Shared, task: TaskPayload) -> Option<Assignment> {
    let now = Utc::now().timestamp() as u64;
    if task.is_expired(now) {
        shared.failed.fetch_add(1, Ordering::Relaxed);
        shared.instruments.tasks_failed.inc();
        return Some(Assignment::rejected("task deadline expired before dispatch"));
    }

    // Coarse fleet snapshot; the registry lock is released before scoring.
    let fleet = shared.registry.fleet();
    let assignment = shared.orchestrator.assign(&task, &fleet);
    if !assignment.assigned {
        shared.failed.fetch_add(1, Ordering::Relaxed);
        shared.instruments.tasks_failed.inc();
        return Some(assignment);
    }

    let executor = shared
        .executors
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .get(&task.task_type)
        .cloned();
    let Some(executor) = executor else {
        shared.failed.fetch_add(1, Ordering::Relaxed);
        shared.instruments.tasks_failed.inc();
        return Some(Assignment::rejected(format!(
            "no executor registered for task type {:?}",
            task.task_type
        )));
    };

    let worker = assignment.worker_peer_id.clone();
    let started = Instant::now();
    let outcome = match executor.execute(&task, &assignment) {
        Ok(outcome) => outcome,
        Err(e) => TaskOutcome::failed(ErrorCode::Unknown, e.to_string()),
    };
    let response_time_s = started.elapsed().as_secs_f64();

    if outcome.success {
        let _ = shared.ledger.record_task_completion(
            &worker,
            true,
            outcome.quality.clamp(0.0, 1.0),
            response_time_s,
        );
        shared.completed.fetch_add(1, Ordering::Relaxed);
        shared.instruments.tasks_completed.inc();
        shared
            .latency_sum_ms
            .fetch_add(outcome.execution_time_ms, Ordering::Relaxed);
        shared.latency_count.fetch_add(1, Ordering::Relaxed);
        return Some(assignment);
    }

    let _ = shared
        .ledger
        .record_task_completion(&worker, false, 0.0, response_time_s);

    let error_detail = outcome
        .error
        .unwrap_or_else(|| format!("{:?}", outcome.error_code));

    if outcome.error_code.retriable()
        && task.retries_remaining()
        && shared.running.load(Ordering::SeqCst)
    {
        let mut retry = task;
        retry.retry_count += 1;
        // Prefer a different worker on the next attempt.
        if !retry.blacklisted_nodes.contains(&worker) {
            retry.blacklisted_nodes.push(worker.clone());
        }
        let backoff = Duration::from_millis(100u64 << retry.retry_count.min(5));
        debug!(
            task = %retry.task_id,
            attempt = retry.retry_count,
            backoff_ms = backoff.as_millis() as u64,
            "retrying after retriable failure: {error_detail}"
        );
        std::thread::sleep(backoff);
        match shared.queue.push(retry) {
            Ok(()) => {
                shared.retried.fetch_add(1, Ordering::Relaxed);
                shared.instruments.tasks_retried.inc();
                return None;
            }
            Err(_) => {
                shared.failed.fetch_add(1, Ordering::Relaxed);
                shared.instruments.tasks_failed.inc();
                return Some(Assignment::rejected(
                    "queue closed while requeueing retriable failure",
                ));
            }
        }
    }

    shared.failed.fetch_add(1, Ordering::Relaxed);
    shared.instruments.tasks_failed.inc();
    Some(Assignment::rejected(format!(
        "execution failed on {worker}: {error_detail}"
    )))
}

fn discovery_loop(shared: Arc<Shared>) {
    while shared.running.load(Ordering::SeqCst) {
        if let Err(e) = run_discovery_pass(&shared) {
            warn!("discovery pass failed: {e}");
        }

        let interval = {
            let config = shared.config.lock().unwrap_or_else(|e| e.into_inner());
            Duration::from_secs(config.discovery.discovery_interval_s)
        };
        sleep_while_running(&shared, interval);
    }
}

fn run_discovery_pass(shared: &Shared) -> anyhow::Result<()> {
    let provider = shared
        .discovery
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .clone();
    if let Some(provider) = provider {
        for snapshot in provider.discover()? {
            shared.registry.upsert(snapshot);
        }
        for peer_id in shared.registry.peer_ids() {
            if let Some(probe) = provider.probe(&peer_id) {
                shared
                    .latency
                    .observe(&peer_id, probe.latency_ms, probe.bandwidth_mbps);
            }
        }
    }
    shared.ledger.decay_inactive_nodes(86_400);
    shared.latency.evict_stale(86_400);
    shared
        .instruments
        .active_nodes
        .set(shared.registry.len() as i64);
    Ok(())
}

fn monitoring_loop(shared: Arc<Shared>) {
    while shared.running.load(Ordering::SeqCst) {
        let interval = {
            let config = shared.config.lock().unwrap_or_else(|e| e.into_inner());
            Duration::from_secs(config.monitoring.metrics_interval_s.max(1))
        };
        sleep_while_running(&shared, interval);
        if !shared.running.load(Ordering::SeqCst) {
            break;
        }
        let orchestrator = shared.orchestrator.metrics();
        info!(
            submitted = shared.submitted.load(Ordering::Relaxed),
            completed = shared.completed.load(Ordering::Relaxed),
            failed = shared.failed.load(Ordering::Relaxed),
            queued = shared.queue.len(),
            active_nodes = shared.registry.len(),
            assignments = orchestrator.total_assignments,
            "engine metrics"
        );
        shared
            .instruments
            .queue_depth
            .set(shared.queue.len() as i64);
        shared
            .instruments
            .active_nodes
            .set(shared.registry.len() as i64);
    }
}

fn sleep_while_running(shared: &Shared, total: Duration) {
    let deadline = Instant::now() + total;
    while Instant::now() < deadline && shared.running.load(Ordering::SeqCst) {
        std::thread::sleep(LOOP_POLL.min(total));
    }
}
