use ailee_types::NodeSnapshot;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

struct Entry {
    snapshot: NodeSnapshot,
    stored_at: DateTime<Utc>,
}

/// The engine's table of known workers, keyed by peer id.
///
/// Writers are the discovery loop and explicit register/unregister calls;
/// readers take a coarse value snapshot and drop the lock before any
/// orchestration happens.
#[derive(Default)]
pub struct NodeRegistry {
    nodes: Mutex<HashMap<String, Entry>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh a worker's snapshot.
    pub fn upsert(&self, snapshot: NodeSnapshot) {
        self.nodes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                snapshot.peer_id.clone(),
                Entry {
                    snapshot,
                    stored_at: Utc::now(),
                },
            );
    }

    pub fn remove(&self, peer_id: &str) -> bool {
        self.nodes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(peer_id)
            .is_some()
    }

    pub fn get(&self, peer_id: &str) -> Option<NodeSnapshot> {
        self.nodes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(peer_id)
            .map(|entry| entry.snapshot.clone())
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.nodes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(peer_id)
    }

    pub fn len(&self) -> usize {
        self.nodes.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn peer_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .nodes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Value snapshot of the whole fleet, peer-id ordered, with telemetry
    /// ages advanced to now.
    pub fn fleet(&self) -> Vec<NodeSnapshot> {
        let now = Utc::now();
        let mut fleet: Vec<NodeSnapshot> = self
            .nodes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|entry| {
                let mut snapshot = entry.snapshot.clone();
                if let Some(age) = snapshot.telemetry_age_secs {
                    snapshot.telemetry_age_secs =
                        Some(age + (now - entry.stored_at).num_seconds());
                }
                snapshot
            })
            .collect();
        fleet.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        fleet
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_replaces_and_fleet_is_ordered() {
        let registry = NodeRegistry::new();
        let mut n = NodeSnapshot::new("b");
        n.active_task_count = 1;
        registry.upsert(n.clone());
        registry.upsert(NodeSnapshot::new("a"));
        n.active_task_count = 2;
        registry.upsert(n);

        let fleet = registry.fleet();
        assert_eq!(fleet.len(), 2);
        assert_eq!(fleet[0].peer_id, "a");
        assert_eq!(fleet[1].active_task_count, 2);
    }

    #[test]
    fn remove_and_contains() {
        let registry = NodeRegistry::new();
        registry.upsert(NodeSnapshot::new("a"));
        assert!(registry.contains("a"));
        assert!(registry.remove("a"));
        assert!(!registry.remove("a"));
        assert!(registry.is_empty());
    }
}
