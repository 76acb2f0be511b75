//! Reputation ledger and latency map for the AILEE mesh.
//!
//! The ledger keeps one running record per peer: counters, an
//! exponential-moving quality score, slashing totals, and the derived
//! trust score the orchestrator reads. The latency map keeps per-peer
//! network observations with staleness eviction. Both sit behind a single
//! mutex each; all batch operations take the lock once.

#![forbid(unsafe_code)]

mod latency;
mod ledger;

pub use latency::{LatencyMap, LatencyObservation};
pub use ledger::{PeerReputation, ReputationError, ReputationLedger};

/// Smoothing factor for the exponential-moving quality and response-time
/// averages.
pub const EMA_ALPHA: f64 = 0.1;
