//! In-memory pub/sub for rollcall
//!
//! A shared [`SimNetwork`] broker routes raw bytes between [`SimPubSub`]
//! instances over tokio broadcast channels, simulating cluster fan-out
//! without real networking. Each node carries an offline switch that drops
//! its inbound and outbound traffic, which is the partition lever for
//! multi-node tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rollcall_model::ReplicaName;
use rollcall_net_types::{PubSub, PubSubError};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

/// One message in flight: sender, optional direct target, payload.
#[derive(Clone, Debug)]
struct Frame {
    sender: ReplicaName,
    target: Option<ReplicaName>,
    payload: Vec<u8>,
}

/// Shared broker holding one broadcast channel per topic, shared by every
/// subscribed node.
#[derive(Clone, Debug, Default)]
pub struct SimNetwork {
    topics: Arc<RwLock<HashMap<String, broadcast::Sender<Frame>>>>,
}

impl SimNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    async fn get_or_create(&self, topic: &str) -> broadcast::Sender<Frame> {
        let mut topics = self.topics.write().await;
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(256).0)
            .clone()
    }
}

/// Per-node pub/sub handle backed by a [`SimNetwork`].
pub struct SimPubSub {
    name: ReplicaName,
    network: SimNetwork,
    offline: Arc<AtomicBool>,
    topic_tokens: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl SimPubSub {
    pub fn new(name: impl Into<ReplicaName>, network: &SimNetwork) -> Self {
        Self {
            name: name.into(),
            network: network.clone(),
            offline: Arc::new(AtomicBool::new(false)),
            topic_tokens: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Sever or restore this node's connectivity. While offline, outbound
    /// sends are suppressed and inbound frames are dropped.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::SeqCst)
    }

    /// Cancel every subscription pump.
    pub async fn shutdown(&self) {
        let mut tokens = self.topic_tokens.lock().await;
        for (_, token) in tokens.drain() {
            token.cancel();
        }
    }
}

#[async_trait::async_trait]
impl PubSub for SimPubSub {
    fn node_name(&self) -> ReplicaName {
        self.name.clone()
    }

    async fn subscribe(
        &self,
        topic: &str,
    ) -> Result<broadcast::Receiver<(ReplicaName, Vec<u8>)>, PubSubError> {
        // Tear down an existing subscription for the topic, if any.
        if let Some(token) = self.topic_tokens.lock().await.remove(topic) {
            token.cancel();
        }

        let sender = self.network.get_or_create(topic).await;
        let mut receiver = sender.subscribe();
        let me = self.name.clone();
        let offline = self.offline.clone();

        let token = CancellationToken::new();
        self.topic_tokens
            .lock()
            .await
            .insert(topic.to_string(), token.clone());

        let (inbound_tx, inbound_rx) = broadcast::channel(256);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    result = receiver.recv() => match result {
                        Ok(frame) => {
                            if frame.sender == me {
                                continue;
                            }
                            if let Some(target) = &frame.target {
                                if *target != me {
                                    continue;
                                }
                            }
                            if offline.load(Ordering::SeqCst) {
                                continue;
                            }
                            let _ = inbound_tx.send((frame.sender, frame.payload));
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!(node = %me, lagged = n, "sim pub/sub receiver lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });

        Ok(inbound_rx)
    }

    async fn broadcast_from(
        &self,
        publisher: &ReplicaName,
        topic: &str,
        payload: Vec<u8>,
    ) -> Result<(), PubSubError> {
        if self.is_offline() {
            return Ok(());
        }
        let sender = self.network.get_or_create(topic).await;
        let _ = sender.send(Frame {
            sender: publisher.clone(),
            target: None,
            payload,
        });
        Ok(())
    }

    async fn direct_broadcast(
        &self,
        node: &ReplicaName,
        topic: &str,
        payload: Vec<u8>,
    ) -> Result<(), PubSubError> {
        if self.is_offline() {
            return Ok(());
        }
        let sender = self.network.get_or_create(topic).await;
        let _ = sender.send(Frame {
            sender: self.name.clone(),
            target: Some(node.clone()),
            payload,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    async fn recv(
        rx: &mut broadcast::Receiver<(ReplicaName, Vec<u8>)>,
    ) -> Option<(ReplicaName, Vec<u8>)> {
        timeout(Duration::from_millis(200), rx.recv()).await.ok()?.ok()
    }

    #[tokio::test]
    async fn broadcast_excludes_publisher() {
        let net = SimNetwork::new();
        let a = SimPubSub::new("a", &net);
        let b = SimPubSub::new("b", &net);

        let mut rx_a = a.subscribe("t").await.unwrap();
        let mut rx_b = b.subscribe("t").await.unwrap();

        a.broadcast_from(&a.node_name(), "t", b"hi".to_vec()).await.unwrap();

        let (sender, payload) = recv(&mut rx_b).await.expect("b receives");
        assert_eq!(sender, ReplicaName::new("a"));
        assert_eq!(payload, b"hi");
        assert!(recv(&mut rx_a).await.is_none(), "publisher must not hear itself");
    }

    #[tokio::test]
    async fn direct_broadcast_targets_one_node() {
        let net = SimNetwork::new();
        let a = SimPubSub::new("a", &net);
        let b = SimPubSub::new("b", &net);
        let c = SimPubSub::new("c", &net);

        let mut rx_b = b.subscribe("t").await.unwrap();
        let mut rx_c = c.subscribe("t").await.unwrap();

        a.direct_broadcast(&ReplicaName::new("b"), "t", b"only-b".to_vec())
            .await
            .unwrap();

        assert!(recv(&mut rx_b).await.is_some());
        assert!(recv(&mut rx_c).await.is_none());
    }

    #[tokio::test]
    async fn offline_node_neither_sends_nor_receives() {
        let net = SimNetwork::new();
        let a = SimPubSub::new("a", &net);
        let b = SimPubSub::new("b", &net);

        let mut rx_a = a.subscribe("t").await.unwrap();
        let mut rx_b = b.subscribe("t").await.unwrap();

        b.set_offline(true);
        a.broadcast_from(&a.node_name(), "t", b"one".to_vec()).await.unwrap();
        assert!(recv(&mut rx_b).await.is_none(), "offline node drops inbound");

        b.broadcast_from(&b.node_name(), "t", b"two".to_vec()).await.unwrap();
        assert!(recv(&mut rx_a).await.is_none(), "offline node drops outbound");

        b.set_offline(false);
        a.broadcast_from(&a.node_name(), "t", b"three".to_vec()).await.unwrap();
        assert!(recv(&mut rx_b).await.is_some(), "traffic resumes after heal");
    }
}
