use crate::EMA_ALPHA;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

/// Smoothed network observations for one peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencyObservation {
    pub peer_id: String,
    pub latency_ms: f64,
    pub bandwidth_mbps: f64,
    /// EMA of the absolute deviation between consecutive latency samples.
    pub jitter_ms: f64,
    pub last_updated: DateTime<Utc>,
}

/// Per-peer round-trip observations with staleness eviction. One mutex
/// over the map; probes write, the orchestrator reads copies.
#[derive(Debug, Default)]
pub struct LatencyMap {
    peers: Mutex<HashMap<String, LatencyObservation>>,
}

impl LatencyMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, LatencyObservation>> {
        self.peers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fold one probe result into the peer's record.
    pub fn observe(&self, peer_id: &str, latency_ms: f64, bandwidth_mbps: f64) {
        let mut peers = self.lock();
        match peers.get_mut(peer_id) {
            Some(obs) => {
                let deviation = (latency_ms - obs.latency_ms).abs();
                obs.jitter_ms = (1.0 - EMA_ALPHA) * obs.jitter_ms + EMA_ALPHA * deviation;
                obs.latency_ms = (1.0 - EMA_ALPHA) * obs.latency_ms + EMA_ALPHA * latency_ms;
                obs.bandwidth_mbps =
                    (1.0 - EMA_ALPHA) * obs.bandwidth_mbps + EMA_ALPHA * bandwidth_mbps;
                obs.last_updated = Utc::now();
            }
            None => {
                peers.insert(
                    peer_id.to_string(),
                    LatencyObservation {
                        peer_id: peer_id.to_string(),
                        latency_ms,
                        bandwidth_mbps,
                        jitter_ms: 0.0,
                        last_updated: Utc::now(),
                    },
                );
            }
        }
    }

    pub fn get(&self, peer_id: &str) -> Option<LatencyObservation> {
        self.lock().get(peer_id).cloned()
    }

    /// Observed latency for scoring; peers never probed report `None`.
    pub fn latency_ms(&self, peer_id: &str) -> Option<f64> {
        self.lock().get(peer_id).map(|o| o.latency_ms)
    }

    /// Drop observations older than `max_age_secs`. Returns how many were
    /// evicted.
    pub fn evict_stale(&self, max_age_secs: i64) -> usize {
        let now = Utc::now();
        let mut peers = self.lock();
        let before = peers.len();
        peers.retain(|_, obs| (now - obs.last_updated).num_seconds() <= max_age_secs);
        before - peers.len()
    }

    pub fn all(&self) -> Vec<LatencyObservation> {
        let mut all: Vec<LatencyObservation> = self.lock().values().cloned().collect();
        all.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        all
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_observation_is_taken_verbatim() {
        let map = LatencyMap::new();
        map.observe("p1", 40.0, 100.0);
        let obs = map.get("p1").unwrap();
        assert_eq!(obs.latency_ms, 40.0);
        assert_eq!(obs.bandwidth_mbps, 100.0);
        assert_eq!(obs.jitter_ms, 0.0);
    }

    #[test]
    fn observations_smooth_with_ema() {
        let map = LatencyMap::new();
        map.observe("p1", 40.0, 100.0);
        map.observe("p1", 60.0, 100.0);
        let obs = map.get("p1").unwrap();
        // 0.9 * 40 + 0.1 * 60
        assert!((obs.latency_ms - 42.0).abs() < 1e-12);
        // jitter folds the 20ms deviation at alpha
        assert!((obs.jitter_ms - 2.0).abs() < 1e-12);
    }

    #[test]
    fn stale_entries_evict() {
        let map = LatencyMap::new();
        map.observe("p1", 40.0, 100.0);
        assert_eq!(map.evict_stale(3600), 0);
        assert_eq!(map.evict_stale(-1), 1);
        assert!(map.get("p1").is_none());
    }
}
