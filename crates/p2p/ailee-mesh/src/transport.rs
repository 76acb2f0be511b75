use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 64;

/// Topic-based message bus the mesh talks through. Real deployments back
/// this with the p2p gossip layer; the in-process implementation below
/// serves tests and single-host runs.
#[async_trait]
pub trait MeshTransport: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> anyhow::Result<()>;
    async fn subscribe(&self, topic: &str) -> anyhow::Result<broadcast::Receiver<Vec<u8>>>;
    async fn send_direct(&self, peer_id: &str, payload: Vec<u8>) -> anyhow::Result<()>;
}

/// Loopback transport: every topic and peer mailbox is a broadcast
/// channel in this process.
#[derive(Default)]
pub struct InProcessTransport {
    topics: Mutex<HashMap<String, broadcast::Sender<Vec<u8>>>>,
    mailboxes: Mutex<HashMap<String, broadcast::Sender<Vec<u8>>>>,
}

impl InProcessTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn topic_sender(&self, topic: &str) -> broadcast::Sender<Vec<u8>> {
        self.topics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Open a peer's direct mailbox, returning its receiving end.
    pub fn register_peer(&self, peer_id: &str) -> broadcast::Receiver<Vec<u8>> {
        self.mailboxes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(peer_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }
}

#[async_trait]
impl MeshTransport for InProcessTransport {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> anyhow::Result<()> {
        // No subscribers is not an error on a gossip bus.
        let _ = self.topic_sender(topic).send(payload);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> anyhow::Result<broadcast::Receiver<Vec<u8>>> {
        Ok(self.topic_sender(topic).subscribe())
    }

    async fn send_direct(&self, peer_id: &str, payload: Vec<u8>) -> anyhow::Result<()> {
        let sender = self
            .mailboxes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(peer_id)
            .cloned();
        match sender {
            Some(tx) => {
                let _ = tx.send(payload);
                Ok(())
            }
            None => anyhow::bail!("unknown peer: {peer_id}"),
        }
    }
}
