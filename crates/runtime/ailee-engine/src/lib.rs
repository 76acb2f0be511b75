//! Orchestration engine for the AILEE mesh.
//!
//! Owns the priority task queue, the worker pool, the node registry, and
//! the pending-promise table; reads reputation and latency through shared
//! handles; and exposes the future-based `submit_task` API. The
//! orchestrator itself is a pure scoring function over fleet snapshots —
//! all mutation happens here, after an assignment comes back.

pub mod config;
pub mod discovery;
pub mod engine;
pub mod executor;
pub mod metrics;
pub mod orchestrator;
pub mod queue;
pub mod registry;

pub use config::{
    DiscoveryConfig, EconomicConfig, FeatureFlags, MeshConfig, MonitoringConfig, NetworkConfig,
    PerformanceConfig,
};
pub use discovery::{DiscoveryProvider, LatencyProbe, StaticDiscovery};
pub use engine::{AssignmentFuture, EngineMetrics, MeshEngine, STOPPED_REASON};
pub use executor::{TaskExecutor, TaskOutcome};
pub use metrics::EngineInstruments;
pub use orchestrator::{
    Orchestrator, OrchestratorConfig, OrchestratorMetrics, SchedulingStrategy, ScoringWeights,
};
pub use queue::TaskQueue;
pub use registry::NodeRegistry;
