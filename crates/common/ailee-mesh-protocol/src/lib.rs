//! Wire messages for the AILEE mesh task protocol.
//!
//! The core talks to the p2p layer purely through these topic-addressed,
//! CBOR-encoded messages; the transport itself is an external
//! collaborator behind a publish/subscribe interface.

#![forbid(unsafe_code)]

use ailee_types::{ResourceRequirements, TaskPriority, TaskType};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Topic for announcing new tasks to the fleet.
pub const TASK_DISTRIBUTE_TOPIC: &str = "ailee/task/distribute";
/// Topic for publishing completed task results.
pub const TASK_RESULTS_TOPIC: &str = "ailee/task/results";

/// Largest payload carried inline in a protocol message.
pub const INLINE_PAYLOAD_MAX_SIZE: usize = 1024 * 1024; // 1 MiB

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("encode failed: {0}")]
    Encode(String),

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("inline payload of {size} bytes exceeds {max} byte cap")]
    PayloadTooLarge { size: usize, max: usize },
}

/// Announcement of a task looking for an executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAnnouncementV1 {
    pub task_id: String,
    pub task_type: TaskType,
    pub priority: TaskPriority,
    pub requirements: ResourceRequirements,
    pub payload: Vec<u8>,
}

/// Result of an executed task, published by the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResultV1 {
    pub task_id: String,
    pub executor_node: String,
    pub success: bool,
    pub result_bytes: Vec<u8>,
    /// Execution hash of the attached proof, when one was produced.
    pub proof_hash: Option<String>,
    pub error: Option<String>,
}

/// Versioned envelope for every message on the mesh topics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MeshProtocolMessage {
    TaskAnnouncementV1(TaskAnnouncementV1),
    TaskResultV1(TaskResultV1),
}

impl MeshProtocolMessage {
    fn inline_payload_len(&self) -> usize {
        match self {
            MeshProtocolMessage::TaskAnnouncementV1(a) => a.payload.len(),
            MeshProtocolMessage::TaskResultV1(r) => r.result_bytes.len(),
        }
    }
}

/// Encode a message to its CBOR wire form, enforcing the inline cap.
pub fn encode_message(message: &MeshProtocolMessage) -> Result<Vec<u8>, ProtocolError> {
    let size = message.inline_payload_len();
    if size > INLINE_PAYLOAD_MAX_SIZE {
        return Err(ProtocolError::PayloadTooLarge {
            size,
            max: INLINE_PAYLOAD_MAX_SIZE,
        });
    }
    serde_cbor::to_vec(message).map_err(|e| ProtocolError::Encode(e.to_string()))
}

/// Decode a message from its CBOR wire form.
pub fn decode_message(bytes: &[u8]) -> Result<MeshProtocolMessage, ProtocolError> {
    let message: MeshProtocolMessage =
        serde_cbor::from_slice(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))?;
    let size = message.inline_payload_len();
    if size > INLINE_PAYLOAD_MAX_SIZE {
        return Err(ProtocolError::PayloadTooLarge {
            size,
            max: INLINE_PAYLOAD_MAX_SIZE,
        });
    }
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cbor_roundtrip() {
        let message = MeshProtocolMessage::TaskAnnouncementV1(TaskAnnouncementV1 {
            task_id: "t1".to_string(),
            task_type: TaskType::Computation,
            priority: TaskPriority::High,
            requirements: ResourceRequirements::default(),
            payload: vec![1, 2, 3],
        });
        let bytes = encode_message(&message).unwrap();
        assert_eq!(decode_message(&bytes).unwrap(), message);

        let result = MeshProtocolMessage::TaskResultV1(TaskResultV1 {
            task_id: "t1".to_string(),
            executor_node: "w1".to_string(),
            success: true,
            result_bytes: b"out".to_vec(),
            proof_hash: Some("abc".to_string()),
            error: None,
        });
        let bytes = encode_message(&result).unwrap();
        assert_eq!(decode_message(&bytes).unwrap(), result);
    }

    #[test]
    fn oversized_payloads_are_refused() {
        let message = MeshProtocolMessage::TaskAnnouncementV1(TaskAnnouncementV1 {
            task_id: "big".to_string(),
            task_type: TaskType::Storage,
            priority: TaskPriority::Low,
            requirements: ResourceRequirements::default(),
            payload: vec![0u8; INLINE_PAYLOAD_MAX_SIZE + 1],
        });
        assert!(matches!(
            encode_message(&message),
            Err(ProtocolError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn garbage_fails_to_decode() {
        assert!(decode_message(b"definitely not cbor").is_err());
    }
}
