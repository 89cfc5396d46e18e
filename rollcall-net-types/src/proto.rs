//! Wire protocol for tracker replication
//!
//! Messages are postcard-encoded, length-implicit payloads handed to the
//! pub/sub layer as raw bytes. Decoding failures are expected for unknown
//! future variants and must be treated as ignorable by receivers.

use rollcall_crdt::{Clocks, Delta, Snapshot};
use rollcall_model::ReplicaRef;
use uuid::Uuid;

/// Error produced by the wire codec.
#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error("encode failed: {0}")]
    Encode(postcard::Error),
    #[error("decode failed: {0}")]
    Decode(postcard::Error),
}

/// Replication messages exchanged on the namespaced presence topic.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub enum TrackerMessage {
    /// Periodic liveness beacon, optionally carrying accumulated changes.
    Heartbeat {
        from: ReplicaRef,
        delta: Option<Delta>,
        clocks: Clocks,
    },
    /// Request for a full state transfer, sent when `clocks` show the
    /// recipient has observed events the sender has not.
    TransferReq {
        req: Uuid,
        from: ReplicaRef,
        clocks: Clocks,
    },
    /// Full state response to a [`TrackerMessage::TransferReq`].
    TransferAck {
        req: Uuid,
        from: ReplicaRef,
        snapshot: Snapshot,
    },
}

pub fn encode_message(msg: &TrackerMessage) -> Result<Vec<u8>, ProtoError> {
    postcard::to_allocvec(msg).map_err(ProtoError::Encode)
}

pub fn decode_message(bytes: &[u8]) -> Result<TrackerMessage, ProtoError> {
    postcard::from_bytes(bytes).map_err(ProtoError::Decode)
}
