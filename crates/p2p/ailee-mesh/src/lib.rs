//! Ambient nodes and mesh-level coordination for the AILEE network.
//!
//! An `AmbientNode` is one worker endpoint: telemetry slot, safe-mode
//! circuit breaker, reputation handle, sandbox, and proof generator. The
//! `MeshCoordinator` does cluster-level health-ranked selection; the
//! `MeshService` wires nodes into the scheduling engine and bridges the
//! task topics over a pluggable transport.

pub mod ambient;
pub mod coordinator;
pub mod service;
pub mod state;
pub mod transport;

pub use ambient::{
    AmbientError, AmbientNode, ComputationAttestation, FederatedUpdate, IncentiveRecord,
    NodeAdvertisement,
};
pub use coordinator::MeshCoordinator;
pub use service::MeshService;
pub use state::WorkerState;
pub use transport::{InProcessTransport, MeshTransport};
