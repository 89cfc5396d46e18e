//! Transport abstraction for rollcall
//!
//! Decouples the tracker from any concrete pub/sub fabric. Production
//! deployments provide a clustered implementation; test harnesses use the
//! in-memory one from `rollcall-net-sim`. The contract is at-most-once,
//! best-effort fan-out with no ordering guarantees.

pub mod proto;

pub use proto::{decode_message, encode_message, ProtoError, TrackerMessage};

use rollcall_model::ReplicaName;
use tokio::sync::broadcast;

/// Error type for pub/sub operations.
#[derive(Debug, thiserror::Error)]
pub enum PubSubError {
    #[error("subscribe failed: {0}")]
    Subscribe(String),
    #[error("broadcast failed: {0}")]
    Broadcast(String),
}

/// Pub/sub fan-out interface.
///
/// Implementations deal only in raw bytes and node names; message encoding
/// lives in [`proto`]. `subscribe` yields `(sender, payload)` pairs for
/// every broadcast on the topic except the subscriber's own.
#[async_trait::async_trait]
pub trait PubSub: Send + Sync + 'static {
    /// This node's stable name.
    fn node_name(&self) -> ReplicaName;

    /// Deliver subsequent broadcasts on `topic` to the returned receiver.
    async fn subscribe(
        &self,
        topic: &str,
    ) -> Result<broadcast::Receiver<(ReplicaName, Vec<u8>)>, PubSubError>;

    /// Broadcast to every subscriber of `topic` on every node except
    /// `publisher`.
    async fn broadcast_from(
        &self,
        publisher: &ReplicaName,
        topic: &str,
        payload: Vec<u8>,
    ) -> Result<(), PubSubError>;

    /// Deliver only to subscribers of `topic` on the named node.
    async fn direct_broadcast(
        &self,
        node: &ReplicaName,
        topic: &str,
        payload: Vec<u8>,
    ) -> Result<(), PubSubError>;
}
