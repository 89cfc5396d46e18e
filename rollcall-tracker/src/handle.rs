//! Tracker - handle to a running tracker server
//!
//! Public API functions enqueue a command into the actor mailbox and await
//! the reply, so callers observe their own operations in order. Clones
//! share the mailbox; only the original owns the actor task and triggers
//! shutdown on drop.

use std::sync::Arc;

use rollcall_model::{generate_vsn, DiffHandler, Meta, PresenceRef, ReplicaRef, Session};
use rollcall_net_types::PubSub;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::actor::{TrackerActor, TrackerCmd};
use crate::config::TrackerConfig;
use crate::error::TrackerError;
use crate::replica::Replica;

pub struct Tracker {
    cmd_tx: mpsc::Sender<TrackerCmd>,
    actor: Option<JoinHandle<()>>,
}

impl Tracker {
    /// Validate the configuration, subscribe to the namespaced topic, and
    /// spawn the tracker actor.
    pub async fn spawn<P, H>(
        config: TrackerConfig,
        pubsub: Arc<P>,
        mut handler: H,
    ) -> Result<Self, TrackerError>
    where
        P: PubSub,
        H: DiffHandler + Sync,
        H::State: Sync,
    {
        config.validate()?;

        let self_ref = ReplicaRef::new(pubsub.node_name(), generate_vsn());
        let inbound = pubsub.subscribe(&config.topic()).await?;
        let (cmd_tx, cmd_rx) = mpsc::channel(128);

        let handler_state = handler.init();
        let actor = TrackerActor::new(
            config,
            self_ref,
            pubsub,
            handler,
            handler_state,
            cmd_tx.clone(),
        );
        let join = tokio::spawn(actor.run(cmd_rx, inbound));

        Ok(Self {
            cmd_tx,
            actor: Some(join),
        })
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> TrackerCmd,
    ) -> Result<T, TrackerError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .await
            .map_err(|_| TrackerError::ChannelClosed)?;
        rx.await.map_err(|_| TrackerError::ChannelClosed)
    }

    /// Track a presence for `session` on `topic` under `key`. The returned
    /// ref is also stored in the entry's meta under `phx_ref`.
    pub async fn track(
        &self,
        session: &Session,
        topic: impl Into<String>,
        key: impl Into<String>,
        meta: Meta,
    ) -> Result<PresenceRef, TrackerError> {
        let session = session.clone();
        let topic = topic.into();
        let key = key.into();
        self.call(move |resp| TrackerCmd::Track {
            session,
            topic,
            key,
            meta,
            resp,
        })
        .await?
    }

    /// Remove one presence of `session`.
    pub async fn untrack(
        &self,
        session: &Session,
        topic: impl Into<String>,
        key: impl Into<String>,
    ) -> Result<(), TrackerError> {
        let session = session.id();
        let topic = topic.into();
        let key = key.into();
        self.call(move |resp| TrackerCmd::Untrack {
            session,
            topic,
            key,
            resp,
        })
        .await
    }

    /// Remove every presence of `session`.
    pub async fn untrack_all(&self, session: &Session) -> Result<(), TrackerError> {
        let session = session.id();
        self.call(move |resp| TrackerCmd::UntrackAll { session, resp })
            .await
    }

    /// Replace the metadata of an existing presence. The diff carries both
    /// the new entry (with `phx_ref_prev` set) and the old one, so handlers
    /// can render it as a metadata change.
    pub async fn update(
        &self,
        session: &Session,
        topic: impl Into<String>,
        key: impl Into<String>,
        meta: Meta,
    ) -> Result<PresenceRef, TrackerError> {
        let session = session.id();
        let topic = topic.into();
        let key = key.into();
        self.call(move |resp| TrackerCmd::Update {
            session,
            topic,
            key,
            meta,
            resp,
        })
        .await?
    }

    /// Snapshot of the visible presences on a topic.
    pub async fn list(&self, topic: impl Into<String>) -> Result<Vec<(String, Meta)>, TrackerError> {
        let topic = topic.into();
        self.call(move |resp| TrackerCmd::List { topic, resp }).await
    }

    /// Snapshot of the replica registry.
    pub async fn replicas(&self) -> Result<Vec<Replica>, TrackerError> {
        self.call(|resp| TrackerCmd::Replicas { resp }).await
    }

    /// Stop the actor and wait for it to finish.
    pub async fn shutdown(mut self) {
        let _ = self.cmd_tx.send(TrackerCmd::Shutdown).await;
        if let Some(join) = self.actor.take() {
            let _ = join.await;
        }
    }
}

impl Clone for Tracker {
    fn clone(&self) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
            // Clones don't own the actor task.
            actor: None,
        }
    }
}

impl Drop for Tracker {
    fn drop(&mut self) {
        if self.actor.is_some() {
            let _ = self.cmd_tx.try_send(TrackerCmd::Shutdown);
        }
    }
}
