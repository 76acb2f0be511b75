//! Core data model for the AILEE verifiable-computation mesh.
//!
//! Everything here is a plain value type: node identity, telemetry
//! profiles, task descriptions, orchestrator assignments, and the error
//! taxonomy shared across the workspace. Behavior lives in the runtime
//! crates; this crate only defines the shapes they exchange.

#![forbid(unsafe_code)]

pub mod assignment;
pub mod error;
pub mod node;
pub mod snapshot;
pub mod task;
pub mod telemetry;

pub use assignment::{Assignment, CandidateScore, ScoreBreakdown};
pub use error::{ErrorCode, MeshError};
pub use node::NodeId;
pub use snapshot::NodeSnapshot;
pub use task::{ResourceRequirements, TaskPayload, TaskPriority, TaskType};
pub use telemetry::{
    ComputeProfile, EnergyProfile, PrivacyBudget, SafetyPolicy, TelemetrySample,
};
