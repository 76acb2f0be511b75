use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identity of a worker node.
///
/// The `pubkey` is the globally unique handle (hex-encoded Ed25519
/// verifying key); `region` and `device_class` are coarse placement tags
/// used by the orchestrator's geographic and capacity heuristics. A
/// `NodeId` is immutable after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeId {
    pub pubkey: String,
    pub region: String,
    pub device_class: String,
}

impl NodeId {
    pub fn new(
        pubkey: impl Into<String>,
        region: impl Into<String>,
        device_class: impl Into<String>,
    ) -> Self {
        Self {
            pubkey: pubkey.into(),
            region: region.into(),
            device_class: device_class.into(),
        }
    }
}

// Identity is the pubkey alone; region and device class are descriptive.
impl PartialEq for NodeId {
    fn eq(&self, other: &Self) -> bool {
        self.pubkey == other.pubkey
    }
}

impl Eq for NodeId {}

impl std::hash::Hash for NodeId {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.pubkey.hash(state);
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}/{}", self.pubkey, self.region, self.device_class)
    }
}
