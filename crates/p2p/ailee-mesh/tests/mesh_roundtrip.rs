use ailee_engine::{EngineInstruments, MeshConfig, MeshEngine};
use ailee_identity::NodeKeyPair;
use ailee_mesh::{
    AmbientNode, InProcessTransport, MeshService, MeshTransport, NodeAdvertisement,
};
use ailee_mesh_protocol::{
    decode_message, encode_message, MeshProtocolMessage, TaskAnnouncementV1,
    TASK_DISTRIBUTE_TOPIC, TASK_RESULTS_TOPIC,
};
use ailee_proofs::ProofVerifier;
use ailee_reputation::{LatencyMap, ReputationLedger};
use ailee_sandbox::SandboxLimits;
use ailee_types::{
    ComputeProfile, EnergyProfile, NodeId, PrivacyBudget, ResourceRequirements, SafetyPolicy,
    TaskPayload, TaskPriority, TaskType, TelemetrySample,
};
use prometheus::Registry;
use std::sync::Arc;
use std::time::Duration;

const ECHO_WAT: &str = r#"
    (module
      (import "ailee" "input_read" (func $input_read (param i32) (result i32)))
      (import "ailee" "output_write" (func $output_write (param i32 i32)))
      (memory (export "memory") 1)
      (func (export "run")
        (local $len i32)
        (local.set $len (call $input_read (i32.const 0)))
        (call $output_write (i32.const 0) (local.get $len))))
"#;

fn build_engine() -> Arc<MeshEngine> {
    let mut config = MeshConfig::default();
    config.performance.worker_threads = 1;
    config.monitoring.enable_metrics = false;
    Arc::new(MeshEngine::with_instruments(
        config,
        Arc::new(ReputationLedger::new()),
        Arc::new(LatencyMap::new()),
        EngineInstruments::new(&Registry::new()).unwrap(),
    ))
}

fn build_node(pubkey: &str, ledger: Arc<ReputationLedger>) -> Arc<AmbientNode> {
    Arc::new(
        AmbientNode::new(
            NodeId::new(pubkey, "eu-west", "gateway"),
            SafetyPolicy::default(),
            NodeAdvertisement::default(),
            SandboxLimits::default(),
            ledger,
            Arc::new(NodeKeyPair::generate()),
        )
        .unwrap(),
    )
}

fn healthy_sample(node: &AmbientNode) -> TelemetrySample {
    let mut energy = EnergyProfile::default();
    energy.device_temp_c = 40.0;
    energy.compute_efficiency_gflops_per_w = 5.0;
    let mut compute = ComputeProfile::default();
    compute.latency_ms = 40.0;
    compute.bandwidth_mbps = 500.0;
    compute.available_mem_mb = 8_192.0;
    TelemetrySample::new(
        node.id().clone(),
        energy,
        compute,
        PrivacyBudget::default(),
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn submitted_task_executes_with_proof_and_publishes_result() {
    let engine = build_engine();
    let ledger = engine.ledger();
    let transport: Arc<InProcessTransport> = Arc::new(InProcessTransport::new());
    let service = MeshService::new(Arc::clone(&engine), transport.clone());

    let node = build_node("worker-1", ledger.clone());
    service.add_node(Arc::clone(&node)).unwrap();
    service
        .register_wasm_module(
            TaskType::Computation,
            wat::parse_str(ECHO_WAT).unwrap(),
            "run",
        )
        .unwrap();
    service.ingest_telemetry(healthy_sample(&node)).unwrap();

    let mut results = transport.subscribe(TASK_RESULTS_TOPIC).await.unwrap();
    service.start().await.unwrap();

    let mut task = TaskPayload::new("task-1", TaskType::Computation, TaskPriority::High);
    task.payload_bytes = b"ping".to_vec();
    let assignment = service.submit(task).unwrap().await;
    assert!(assignment.assigned, "reason: {}", assignment.reason);
    assert_eq!(assignment.worker_peer_id, "worker-1");

    // The executor publishes the result on the results topic.
    let bytes = tokio::time::timeout(Duration::from_secs(5), results.recv())
        .await
        .expect("result published")
        .unwrap();
    let MeshProtocolMessage::TaskResultV1(result) = decode_message(&bytes).unwrap() else {
        panic!("expected a task result");
    };
    assert_eq!(result.task_id, "task-1");
    assert_eq!(result.executor_node, "worker-1");
    assert!(result.success);
    assert_eq!(result.result_bytes, b"ping");
    assert!(result.proof_hash.is_some());

    // The node's own proof verifies and the ledger saw the success.
    let proof = node.last_proof().unwrap();
    assert!(ProofVerifier::default().verify(&proof).valid);
    assert_eq!(proof.execution_hash, result.proof_hash.unwrap());
    assert_eq!(ledger.get("worker-1").successful_tasks, 1);

    service.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn announcements_on_the_distribute_topic_are_executed() {
    let engine = build_engine();
    let transport: Arc<InProcessTransport> = Arc::new(InProcessTransport::new());
    let service = MeshService::new(Arc::clone(&engine), transport.clone());

    let node = build_node("worker-1", engine.ledger());
    service.add_node(Arc::clone(&node)).unwrap();
    service
        .register_wasm_module(
            TaskType::Computation,
            wat::parse_str(ECHO_WAT).unwrap(),
            "run",
        )
        .unwrap();
    service.ingest_telemetry(healthy_sample(&node)).unwrap();

    let mut results = transport.subscribe(TASK_RESULTS_TOPIC).await.unwrap();
    service.start().await.unwrap();

    let announcement = MeshProtocolMessage::TaskAnnouncementV1(TaskAnnouncementV1 {
        task_id: "announced-1".to_string(),
        task_type: TaskType::Computation,
        priority: TaskPriority::Normal,
        requirements: ResourceRequirements::default(),
        payload: b"from the wire".to_vec(),
    });
    transport
        .publish(TASK_DISTRIBUTE_TOPIC, encode_message(&announcement).unwrap())
        .await
        .unwrap();

    let bytes = tokio::time::timeout(Duration::from_secs(5), results.recv())
        .await
        .expect("announced task produced a result")
        .unwrap();
    let MeshProtocolMessage::TaskResultV1(result) = decode_message(&bytes).unwrap() else {
        panic!("expected a task result");
    };
    assert_eq!(result.task_id, "announced-1");
    assert!(result.success);
    assert_eq!(result.result_bytes, b"from the wire");

    service.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn safe_mode_worker_is_passed_over_for_a_healthy_one() {
    let engine = build_engine();
    let transport: Arc<InProcessTransport> = Arc::new(InProcessTransport::new());
    let service = MeshService::new(Arc::clone(&engine), transport.clone());

    let hot = build_node("hot-node", engine.ledger());
    let cool = build_node("cool-node", engine.ledger());
    service.add_node(Arc::clone(&hot)).unwrap();
    service.add_node(Arc::clone(&cool)).unwrap();
    service
        .register_wasm_module(
            TaskType::Computation,
            wat::parse_str(ECHO_WAT).unwrap(),
            "run",
        )
        .unwrap();

    let mut overheated = healthy_sample(&hot);
    overheated.energy.device_temp_c = 95.0;
    service.ingest_telemetry(overheated).unwrap();
    service.ingest_telemetry(healthy_sample(&cool)).unwrap();

    service.start().await.unwrap();

    let mut task = TaskPayload::new("placed", TaskType::Computation, TaskPriority::Normal);
    task.payload_bytes = b"x".to_vec();
    let assignment = service.submit(task).unwrap().await;
    assert!(assignment.assigned);
    assert_eq!(assignment.worker_peer_id, "cool-node");

    service.stop();
}
