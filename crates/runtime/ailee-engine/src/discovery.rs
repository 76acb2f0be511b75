use ailee_types::NodeSnapshot;
use std::sync::Mutex;

/// One latency probe result.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencyProbe {
    pub latency_ms: f64,
    pub bandwidth_mbps: f64,
}

/// External collaborator that finds new workers and probes known ones.
/// The discovery loop calls this every interval; errors are logged and do
/// not terminate the loop.
pub trait DiscoveryProvider: Send + Sync {
    fn discover(&self) -> anyhow::Result<Vec<NodeSnapshot>>;
    fn probe(&self, peer_id: &str) -> Option<LatencyProbe>;
}

/// Fixed-fleet provider used in tests and single-process deployments.
#[derive(Default)]
pub struct StaticDiscovery {
    nodes: Mutex<Vec<NodeSnapshot>>,
}

impl StaticDiscovery {
    pub fn new(nodes: Vec<NodeSnapshot>) -> Self {
        Self {
            nodes: Mutex::new(nodes),
        }
    }

    pub fn set_nodes(&self, nodes: Vec<NodeSnapshot>) {
        *self.nodes.lock().unwrap_or_else(|e| e.into_inner()) = nodes;
    }
}

impl DiscoveryProvider for StaticDiscovery {
    fn discover(&self) -> anyhow::Result<Vec<NodeSnapshot>> {
        Ok(self.nodes.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn probe(&self, peer_id: &str) -> Option<LatencyProbe> {
        self.nodes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|n| n.peer_id == peer_id)
            .map(|n| LatencyProbe {
                latency_ms: n.latency_ms,
                bandwidth_mbps: n.bandwidth_mbps,
            })
    }
}
