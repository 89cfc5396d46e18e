//! Tracker actor
//!
//! A single task owns the presence CRDT, the replica registry, and the
//! pending clock set, and serializes every state transition: local calls
//! from the handle, heartbeat ticks, and inbound transport messages.
//! Within one message the actor runs to completion; CRDT operations are
//! pure and fast, and the diff handler is required to be non-blocking.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use rand::Rng;
use rollcall_crdt::{Clocks, Delta, Entry, Snapshot, State};
use rollcall_model::{
    Diff, DiffHandler, Meta, PresenceRef, ReplicaName, ReplicaRef, Session, SessionId, META_REF,
    META_REF_PREV,
};
use rollcall_net_types::{decode_message, encode_message, PubSub, TrackerMessage};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Duration, MissedTickBehavior};
use uuid::Uuid;

use crate::clockset::ClockSet;
use crate::config::TrackerConfig;
use crate::error::TrackerError;
use crate::replica::{Replica, ReplicaMap, Status};

/// Requests and events flowing through the actor mailbox.
pub(crate) enum TrackerCmd {
    Track {
        session: Session,
        topic: String,
        key: String,
        meta: Meta,
        resp: oneshot::Sender<Result<PresenceRef, TrackerError>>,
    },
    Untrack {
        session: SessionId,
        topic: String,
        key: String,
        resp: oneshot::Sender<()>,
    },
    UntrackAll {
        session: SessionId,
        resp: oneshot::Sender<()>,
    },
    Update {
        session: SessionId,
        topic: String,
        key: String,
        meta: Meta,
        resp: oneshot::Sender<Result<PresenceRef, TrackerError>>,
    },
    List {
        topic: String,
        resp: oneshot::Sender<Vec<(String, Meta)>>,
    },
    Replicas {
        resp: oneshot::Sender<Vec<Replica>>,
    },
    SessionDown {
        session: SessionId,
    },
    Shutdown,
}

/// Marker for the one unrecoverable condition: the diff handler violated
/// its contract. Details are logged at the failure site.
struct Fatal;

pub(crate) struct TrackerActor<P, H: DiffHandler> {
    config: TrackerConfig,
    topic: String,
    self_ref: ReplicaRef,
    pubsub: Arc<P>,
    handler: H,
    handler_state: Option<H::State>,
    state: State,
    replicas: ReplicaMap,
    clock_set: ClockSet,
    silent_periods: u32,
    current_sample_count: u32,
    links: HashMap<SessionId, JoinHandle<()>>,
    cmd_tx: mpsc::Sender<TrackerCmd>,
}

impl<P: PubSub, H: DiffHandler> TrackerActor<P, H>
where
    H: Sync,
    H::State: Sync,
{
    pub(crate) fn new(
        config: TrackerConfig,
        self_ref: ReplicaRef,
        pubsub: Arc<P>,
        handler: H,
        handler_state: H::State,
        cmd_tx: mpsc::Sender<TrackerCmd>,
    ) -> Self {
        let topic = config.topic();
        let current_sample_count = config.clock_sample_periods;
        Self {
            config,
            topic,
            self_ref: self_ref.clone(),
            pubsub,
            handler,
            handler_state: Some(handler_state),
            state: State::new(self_ref),
            replicas: ReplicaMap::new(),
            clock_set: ClockSet::new(),
            silent_periods: 0,
            current_sample_count,
            links: HashMap::new(),
            cmd_tx,
        }
    }

    pub(crate) async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<TrackerCmd>,
        mut inbound: broadcast::Receiver<(ReplicaName, Vec<u8>)>,
    ) {
        // Stuttered start de-synchronizes heartbeats across nodes.
        let jitter = rand::thread_rng()
            .gen_range(Duration::ZERO..=self.config.broadcast_period / 4);
        let mut heartbeat = interval_at(
            tokio::time::Instant::now() + jitter,
            self.config.broadcast_period,
        );
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::debug!(replica = %self.self_ref, topic = %self.topic, "tracker started");

        loop {
            let step = tokio::select! {
                _ = heartbeat.tick() => self.handle_tick().await,
                cmd = cmd_rx.recv() => match cmd {
                    Some(TrackerCmd::Shutdown) | None => break,
                    Some(cmd) => self.handle_cmd(cmd).await,
                },
                msg = inbound.recv() => match msg {
                    Ok((sender, payload)) => self.handle_inbound(sender, payload).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(replica = %self.self_ref, lagged = n, "tracker inbound lagged");
                        Ok(())
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            };
            if step.is_err() {
                break;
            }
        }

        // Release every session link without touching the sessions.
        for (_, link) in self.links.drain() {
            link.abort();
        }
        tracing::debug!(replica = %self.self_ref, "tracker stopped");
    }

    // ==================== heartbeat tick ====================

    async fn handle_tick(&mut self) -> Result<(), Fatal> {
        // Broadcast phase.
        if self.state.has_delta() {
            let delta = self.state.extract_delta();
            self.broadcast_heartbeat(Some(delta)).await;
            self.silent_periods = 0;
        } else if self.silent_periods >= self.config.max_silent_periods {
            self.broadcast_heartbeat(None).await;
            self.silent_periods = 0;
        } else {
            self.silent_periods += 1;
        }

        // Sync phase.
        if self.current_sample_count == 1 {
            self.request_transfers().await;
            self.current_sample_count = self.config.clock_sample_periods;
        } else {
            self.current_sample_count -= 1;
        }

        // Liveness phase.
        let now = Instant::now();
        for name in self.replicas.names() {
            let transition = self.replicas.detect_down(
                &name,
                now,
                self.config.down_period(),
                self.config.permdown_period,
            );
            if let Some((prev, current)) = transition {
                self.handle_liveness_transition(prev, current)?;
            }
        }
        Ok(())
    }

    async fn broadcast_heartbeat(&mut self, delta: Option<Delta>) {
        let msg = TrackerMessage::Heartbeat {
            from: self.self_ref.clone(),
            delta,
            clocks: self.state.clocks(),
        };
        let payload = match encode_message(&msg) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::error!(replica = %self.self_ref, %err, "failed to encode heartbeat");
                return;
            }
        };
        if let Err(err) = self
            .pubsub
            .broadcast_from(&self.self_ref.name, &self.topic, payload)
            .await
        {
            // The next period is the retry.
            tracing::warn!(replica = %self.self_ref, %err, "heartbeat broadcast failed");
        }
    }

    async fn request_transfers(&mut self) {
        let local_clocks = self.state.clocks();
        let Some(local) = local_clocks.get(&self.self_ref.name) else {
            return;
        };
        let peers = self
            .clock_set
            .to_sync(&self.self_ref.name, local, &self.replicas);
        self.clock_set.clear();

        for peer in peers {
            let req = Uuid::new_v4();
            tracing::debug!(
                replica = %self.self_ref,
                peer = %peer,
                req = %req,
                "requesting state transfer"
            );
            let msg = TrackerMessage::TransferReq {
                req,
                from: self.self_ref.clone(),
                clocks: local_clocks.clone(),
            };
            self.send_direct(&peer.name, &msg).await;
        }
    }

    async fn send_direct(&self, node: &ReplicaName, msg: &TrackerMessage) {
        let payload = match encode_message(msg) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::error!(replica = %self.self_ref, %err, "failed to encode message");
                return;
            }
        };
        if let Err(err) = self
            .pubsub
            .direct_broadcast(node, &self.topic, payload)
            .await
        {
            tracing::warn!(replica = %self.self_ref, node = %node, %err, "direct broadcast failed");
        }
    }

    // ==================== inbound messages ====================

    async fn handle_inbound(
        &mut self,
        sender: ReplicaName,
        payload: Vec<u8>,
    ) -> Result<(), Fatal> {
        let msg = match decode_message(&payload) {
            Ok(msg) => msg,
            Err(err) => {
                tracing::debug!(
                    replica = %self.self_ref,
                    sender = %sender,
                    %err,
                    "ignoring unknown inbound message"
                );
                return Ok(());
            }
        };
        match msg {
            TrackerMessage::Heartbeat { from, delta, clocks } => {
                self.handle_heartbeat(from, delta, clocks)
            }
            TrackerMessage::TransferReq { req, from, .. } => {
                self.handle_transfer_req(req, from).await;
                Ok(())
            }
            TrackerMessage::TransferAck { req, from, snapshot } => {
                self.handle_transfer_ack(req, from, snapshot)
            }
        }
    }

    fn handle_heartbeat(
        &mut self,
        from: ReplicaRef,
        delta: Option<Delta>,
        clocks: Clocks,
    ) -> Result<(), Fatal> {
        if from == self.self_ref {
            return Ok(());
        }
        self.clock_set.append(&clocks);
        if let Some(delta) = delta {
            let (joined, left) = self.state.merge(&delta);
            self.report_diff(joined, left)?;
        }
        let (prev, current) = self.replicas.put_heartbeat(from, Instant::now());
        self.handle_heartbeat_transition(prev, current)
    }

    async fn handle_transfer_req(&mut self, req: Uuid, from: ReplicaRef) {
        tracing::debug!(replica = %self.self_ref, peer = %from, req = %req, "transfer requested");
        let snapshot = self.state.extract();
        let msg = TrackerMessage::TransferAck {
            req,
            from: self.self_ref.clone(),
            snapshot,
        };
        self.send_direct(&from.name, &msg).await;
    }

    fn handle_transfer_ack(
        &mut self,
        req: Uuid,
        from: ReplicaRef,
        snapshot: Snapshot,
    ) -> Result<(), Fatal> {
        tracing::debug!(replica = %self.self_ref, peer = %from, req = %req, "transfer received");
        let (joined, left) = self.state.merge_snapshot(&snapshot);
        self.report_diff(joined, left)
    }

    // ==================== replica state machine ====================

    fn handle_heartbeat_transition(
        &mut self,
        prev: Option<Replica>,
        current: Replica,
    ) -> Result<(), Fatal> {
        match prev {
            None => self.mark_up(&current),
            Some(prev) if prev.vsn() == current.vsn() => match prev.status() {
                Status::Up => Ok(()),
                Status::Down | Status::Permdown => self.mark_up(&current),
            },
            Some(prev) => {
                // Same name, new vsn: the peer restarted. Retire the old
                // incarnation before raising the new one.
                tracing::info!(
                    replica = %self.self_ref,
                    peer = %current.replica_ref(),
                    old_vsn = prev.vsn(),
                    "peer restarted with new vsn"
                );
                if prev.status() == Status::Up {
                    self.mark_down(&prev)?;
                }
                self.mark_permdown(&prev)?;
                self.mark_up(&current)
            }
        }
    }

    fn handle_liveness_transition(
        &mut self,
        prev: Replica,
        current: Replica,
    ) -> Result<(), Fatal> {
        match (prev.status(), current.status()) {
            (Status::Up, Status::Down) => self.mark_down(&current)?,
            (Status::Up, Status::Permdown) => {
                self.mark_down(&current)?;
                self.mark_permdown(&current)?;
                self.replicas.remove(current.name());
            }
            (Status::Down, Status::Permdown) => {
                self.mark_permdown(&current)?;
                self.replicas.remove(current.name());
            }
            _ => {}
        }
        Ok(())
    }

    fn mark_up(&mut self, replica: &Replica) -> Result<(), Fatal> {
        tracing::info!(replica = %self.self_ref, peer = %replica.replica_ref(), "replica up");
        let joined = self.state.replica_up(replica.replica_ref());
        self.report_diff(joined, Vec::new())
    }

    fn mark_down(&mut self, replica: &Replica) -> Result<(), Fatal> {
        tracing::info!(replica = %self.self_ref, peer = %replica.replica_ref(), "replica down");
        let left = self.state.replica_down(replica.replica_ref());
        self.report_diff(Vec::new(), left)
    }

    fn mark_permdown(&mut self, replica: &Replica) -> Result<(), Fatal> {
        // Entries were already surfaced as leaves on the down transition.
        tracing::info!(replica = %self.self_ref, peer = %replica.replica_ref(), "replica permanently down");
        self.state.remove_down_replicas(replica.replica_ref());
        Ok(())
    }

    // ==================== local operations ====================

    async fn handle_cmd(&mut self, cmd: TrackerCmd) -> Result<(), Fatal> {
        match cmd {
            TrackerCmd::Track {
                session,
                topic,
                key,
                mut meta,
                resp,
            } => {
                let pref = PresenceRef::generate();
                meta.insert(
                    META_REF.to_string(),
                    serde_json::Value::String(pref.to_string()),
                );
                self.link_session(&session);
                let (tag, replaced) =
                    self.state
                        .join(session.id(), topic.clone(), key.clone(), meta.clone());
                let entry = Entry {
                    session: session.id(),
                    topic,
                    key,
                    meta,
                    tag,
                };
                self.report_diff(vec![entry], replaced.into_iter().collect())?;
                let _ = resp.send(Ok(pref));
            }
            TrackerCmd::Untrack {
                session,
                topic,
                key,
                resp,
            } => {
                let left = self.state.leave(session, &topic, &key);
                self.report_diff(Vec::new(), left)?;
                if self.state.get_by_session(session).is_empty() {
                    self.unlink_session(session);
                }
                let _ = resp.send(());
            }
            TrackerCmd::UntrackAll { session, resp } => {
                let left = self.state.leave_all(session);
                self.unlink_session(session);
                self.report_diff(Vec::new(), left)?;
                let _ = resp.send(());
            }
            TrackerCmd::Update {
                session,
                topic,
                key,
                meta,
                resp,
            } => {
                let old_ref = match self.state.get(session, &topic, &key) {
                    Some(existing) => existing.meta.get(META_REF).cloned(),
                    None => {
                        let _ = resp.send(Err(TrackerError::NoPresence));
                        return Ok(());
                    }
                };
                let pref = PresenceRef::generate();
                let mut meta = meta;
                meta.insert(
                    META_REF.to_string(),
                    serde_json::Value::String(pref.to_string()),
                );
                if let Some(old_ref) = old_ref {
                    meta.insert(META_REF_PREV.to_string(), old_ref);
                }
                let (tag, replaced) =
                    self.state
                        .join(session, topic.clone(), key.clone(), meta.clone());
                let entry = Entry {
                    session,
                    topic,
                    key,
                    meta,
                    tag,
                };
                self.report_diff(vec![entry], replaced.into_iter().collect())?;
                let _ = resp.send(Ok(pref));
            }
            TrackerCmd::List { topic, resp } => {
                let _ = resp.send(self.state.get_by_topic(&topic));
            }
            TrackerCmd::Replicas { resp } => {
                let _ = resp.send(self.replicas.snapshot());
            }
            TrackerCmd::SessionDown { session } => {
                tracing::debug!(replica = %self.self_ref, ?session, "tracked session terminated");
                self.links.remove(&session);
                let left = self.state.leave_all(session);
                self.report_diff(Vec::new(), left)?;
            }
            // Handled by the run loop.
            TrackerCmd::Shutdown => {}
        }
        Ok(())
    }

    /// Watch a session's cancellation token, converting its firing into an
    /// internal `SessionDown` event.
    fn link_session(&mut self, session: &Session) {
        if self.links.contains_key(&session.id()) {
            return;
        }
        let token = session.token().clone();
        let id = session.id();
        let cmd_tx = self.cmd_tx.clone();
        let watch = tokio::spawn(async move {
            token.cancelled().await;
            let _ = cmd_tx.send(TrackerCmd::SessionDown { session: id }).await;
        });
        self.links.insert(id, watch);
    }

    fn unlink_session(&mut self, session: SessionId) {
        if let Some(watch) = self.links.remove(&session) {
            watch.abort();
        }
    }

    // ==================== diff reporting ====================

    fn report_diff(&mut self, joined: Vec<Entry>, left: Vec<Entry>) -> Result<(), Fatal> {
        if joined.is_empty() && left.is_empty() {
            return Ok(());
        }
        let mut diff = Diff::new();
        for Entry { topic, key, meta, .. } in joined {
            diff.entry(topic).or_default().joins.push((key, meta));
        }
        for Entry { topic, key, meta, .. } in left {
            diff.entry(topic).or_default().leaves.push((key, meta));
        }

        let Some(state) = self.handler_state.take() else {
            return Err(Fatal);
        };
        match self.handler.handle_diff(&diff, state) {
            Ok(next) => {
                self.handler_state = Some(next);
                Ok(())
            }
            Err(err) => {
                tracing::error!(
                    replica = %self.self_ref,
                    %err,
                    "diff handler violated its contract; tracker shutting down"
                );
                Err(Fatal)
            }
        }
    }
}
