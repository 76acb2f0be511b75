use crate::EMA_ALPHA;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ReputationError {
    #[error("quality score out of range: {0}")]
    QualityOutOfRange(f64),
}

/// Running reputation record for one peer.
///
/// Invariants: `trust_score` and `avg_quality_score` stay in [0, 1];
/// `successful_tasks + failed_tasks <= total_tasks`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerReputation {
    pub peer_id: String,
    pub trust_score: f64,
    pub total_tasks: u64,
    pub successful_tasks: u64,
    pub failed_tasks: u64,
    pub avg_quality_score: f64,
    pub avg_response_time_s: f64,
    pub byzantine_events: u32,
    pub slashed_total: f64,
    pub last_updated: DateTime<Utc>,
}

impl PeerReputation {
    /// Neutral starting record for a peer seen for the first time.
    pub fn neutral(peer_id: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            trust_score: 0.5,
            total_tasks: 0,
            successful_tasks: 0,
            failed_tasks: 0,
            avg_quality_score: 0.0,
            avg_response_time_s: 0.0,
            byzantine_events: 0,
            slashed_total: 0.0,
            last_updated: Utc::now(),
        }
    }

    /// Derived composite score:
    /// `0.7·success_rate + 0.2·quality + 0.1·(1 − min(avg_rt/10, 1))`,
    /// clamped to [0, 1]. A peer with no history scores its trust alone.
    pub fn score(&self) -> f64 {
        if self.total_tasks == 0 {
            return self.trust_score.clamp(0.0, 1.0);
        }
        let success_rate = self.successful_tasks as f64 / self.total_tasks as f64;
        let responsiveness = 1.0 - (self.avg_response_time_s / 10.0).min(1.0);
        let score = 0.7 * success_rate + 0.2 * self.avg_quality_score + 0.1 * responsiveness;
        score.clamp(0.0, 1.0)
    }

    fn touch(&mut self) {
        self.last_updated = Utc::now();
    }
}

/// Process-wide reputation ledger: one mutex over the peer map.
#[derive(Debug, Default)]
pub struct ReputationLedger {
    peers: Mutex<HashMap<String, PeerReputation>>,
}

impl ReputationLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, PeerReputation>> {
        // A poisoned ledger still holds valid counters; keep serving.
        self.peers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fetch a peer's record, creating the neutral default on first access.
    pub fn get(&self, peer_id: &str) -> PeerReputation {
        let mut peers = self.lock();
        peers
            .entry(peer_id.to_string())
            .or_insert_with(|| PeerReputation::neutral(peer_id))
            .clone()
    }

    /// Bump raw success/failure counters and refresh the trust score from
    /// the derived composite.
    pub fn update(&self, peer_id: &str, successes: u64, failures: u64) {
        let mut peers = self.lock();
        let entry = peers
            .entry(peer_id.to_string())
            .or_insert_with(|| PeerReputation::neutral(peer_id));
        entry.total_tasks += successes + failures;
        entry.successful_tasks += successes;
        entry.failed_tasks += failures;
        entry.trust_score = entry.score();
        entry.touch();
    }

    /// Record one completed task with its observed quality in [0, 1] and
    /// response time. Quality and response time fold in with α = 0.1.
    pub fn record_task_completion(
        &self,
        peer_id: &str,
        success: bool,
        quality: f64,
        response_time_s: f64,
    ) -> Result<(), ReputationError> {
        if !(0.0..=1.0).contains(&quality) {
            return Err(ReputationError::QualityOutOfRange(quality));
        }
        let mut peers = self.lock();
        let entry = peers
            .entry(peer_id.to_string())
            .or_insert_with(|| PeerReputation::neutral(peer_id));

        entry.total_tasks += 1;
        if success {
            entry.successful_tasks += 1;
        } else {
            entry.failed_tasks += 1;
        }
        if entry.total_tasks == 1 {
            entry.avg_quality_score = quality;
            entry.avg_response_time_s = response_time_s.max(0.0);
        } else {
            entry.avg_quality_score =
                (1.0 - EMA_ALPHA) * entry.avg_quality_score + EMA_ALPHA * quality;
            entry.avg_response_time_s =
                (1.0 - EMA_ALPHA) * entry.avg_response_time_s + EMA_ALPHA * response_time_s.max(0.0);
        }
        entry.trust_score = entry.score();
        entry.touch();
        Ok(())
    }

    /// Halve a peer's trust after provably inconsistent behavior.
    pub fn record_byzantine_behavior(&self, peer_id: &str, reason: &str) {
        let mut peers = self.lock();
        let entry = peers
            .entry(peer_id.to_string())
            .or_insert_with(|| PeerReputation::neutral(peer_id));
        entry.trust_score = (entry.trust_score * 0.5).clamp(0.0, 1.0);
        entry.byzantine_events += 1;
        entry.touch();
        warn!(peer = peer_id, reason, "byzantine behavior recorded");
    }

    /// Raise trust by `delta`, capped at 1.0.
    pub fn reward_node(&self, peer_id: &str, delta: f64) {
        let mut peers = self.lock();
        let entry = peers
            .entry(peer_id.to_string())
            .or_insert_with(|| PeerReputation::neutral(peer_id));
        entry.trust_score = (entry.trust_score + delta.max(0.0)).min(1.0);
        entry.touch();
    }

    /// Lower trust by `delta` (floor 0.0) and add `tokens` to the slashed
    /// total.
    pub fn slash_node(&self, peer_id: &str, delta: f64, tokens: f64) {
        let mut peers = self.lock();
        let entry = peers
            .entry(peer_id.to_string())
            .or_insert_with(|| PeerReputation::neutral(peer_id));
        entry.trust_score = (entry.trust_score - delta.max(0.0)).max(0.0);
        entry.slashed_total += tokens.max(0.0);
        entry.touch();
        warn!(peer = peer_id, delta, tokens, "peer slashed");
    }

    /// Decay trust of peers idle longer than `threshold_secs`. The decay is
    /// `elapsed/86400 · 0.01`, capped at 0.5 per pass.
    pub fn decay_inactive_nodes(&self, threshold_secs: i64) {
        self.decay_inactive_nodes_at(Utc::now(), threshold_secs)
    }

    fn decay_inactive_nodes_at(&self, now: DateTime<Utc>, threshold_secs: i64) {
        let mut peers = self.lock();
        for entry in peers.values_mut() {
            let elapsed = (now - entry.last_updated).num_seconds();
            if elapsed <= threshold_secs {
                continue;
            }
            let decay = ((elapsed as f64 / 86_400.0) * 0.01).min(0.5);
            entry.trust_score = (entry.trust_score - decay).max(0.0);
            // last_updated is deliberately untouched: decay is not activity.
        }
    }

    /// Clear a peer back to no record at all.
    pub fn reset_reputation(&self, peer_id: &str) {
        self.lock().remove(peer_id);
    }

    /// Best `n` peers by derived score, score-descending with peer id as a
    /// deterministic tie-break.
    pub fn top_n(&self, n: usize) -> Vec<PeerReputation> {
        let mut all: Vec<PeerReputation> = self.lock().values().cloned().collect();
        all.sort_by(|a, b| {
            b.score()
                .partial_cmp(&a.score())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.peer_id.cmp(&b.peer_id))
        });
        all.truncate(n);
        all
    }

    /// All peers whose derived score is at least `threshold`.
    pub fn above_threshold(&self, threshold: f64) -> Vec<PeerReputation> {
        let mut all: Vec<PeerReputation> = self
            .lock()
            .values()
            .filter(|p| p.score() >= threshold)
            .cloned()
            .collect();
        all.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        all
    }

    /// Consistent snapshot of every record, peer-id ordered.
    pub fn all(&self) -> Vec<PeerReputation> {
        let mut all: Vec<PeerReputation> = self.lock().values().cloned().collect();
        all.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        all
    }

    /// Deterministic rendering of the whole ledger for external
    /// persistence: peers sorted by id, serialized as a JSON array.
    pub fn export_audit_log(&self) -> String {
        let all = self.all();
        serde_json::to_string_pretty(&all).unwrap_or_else(|_| "[]".to_string())
    }
}
