//! Replica registry
//!
//! Tracks every peer replica's identity, liveness status, and last-seen
//! time. Status moves `up → down → permdown` as silence accumulates; a
//! heartbeat revives `down` back to `up`. Transition classification is the
//! caller's job; the registry only computes the new record.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use rollcall_model::{ReplicaName, ReplicaRef, Vsn};

/// Liveness status of a peer replica.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Up,
    Down,
    Permdown,
}

/// One peer's registry record.
#[derive(Clone, Debug)]
pub struct Replica {
    replica_ref: ReplicaRef,
    status: Status,
    last_heartbeat_at: Instant,
}

impl Replica {
    pub fn replica_ref(&self) -> &ReplicaRef {
        &self.replica_ref
    }

    pub fn name(&self) -> &ReplicaName {
        &self.replica_ref.name
    }

    pub fn vsn(&self) -> Vsn {
        self.replica_ref.vsn
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn last_heartbeat_at(&self) -> Instant {
        self.last_heartbeat_at
    }
}

/// Mapping from replica name to its current record.
#[derive(Debug, Default)]
pub struct ReplicaMap {
    replicas: HashMap<ReplicaName, Replica>,
}

impl ReplicaMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert a record for a received heartbeat: status becomes `Up`,
    /// last-seen becomes `now`. Returns the prior record (if any) and the
    /// new one so the caller can classify the transition.
    pub fn put_heartbeat(
        &mut self,
        replica_ref: ReplicaRef,
        now: Instant,
    ) -> (Option<Replica>, Replica) {
        let current = Replica {
            replica_ref: replica_ref.clone(),
            status: Status::Up,
            last_heartbeat_at: now,
        };
        let prev = self.replicas.insert(replica_ref.name, current.clone());
        (prev, current)
    }

    /// Re-evaluate one record's liveness against elapsed silence. Returns
    /// `Some((prev, current))` when the status changed, `None` otherwise.
    /// `Permdown` is terminal; the caller evicts the record.
    pub fn detect_down(
        &mut self,
        name: &ReplicaName,
        now: Instant,
        down_period: Duration,
        permdown_period: Duration,
    ) -> Option<(Replica, Replica)> {
        let record = self.replicas.get_mut(name)?;
        let elapsed = now.saturating_duration_since(record.last_heartbeat_at);
        let next = match record.status {
            Status::Up if elapsed >= permdown_period => Status::Permdown,
            Status::Up if elapsed >= down_period => Status::Down,
            Status::Down if elapsed >= permdown_period => Status::Permdown,
            current => current,
        };
        if next == record.status {
            return None;
        }
        let prev = record.clone();
        record.status = next;
        Some((prev, record.clone()))
    }

    pub fn get(&self, name: &ReplicaName) -> Option<&Replica> {
        self.replicas.get(name)
    }

    pub fn remove(&mut self, name: &ReplicaName) -> Option<Replica> {
        self.replicas.remove(name)
    }

    pub fn names(&self) -> Vec<ReplicaName> {
        self.replicas.keys().cloned().collect()
    }

    /// Registry contents, sorted by name for deterministic output.
    pub fn snapshot(&self) -> Vec<Replica> {
        let mut records: Vec<Replica> = self.replicas.values().cloned().collect();
        records.sort_by(|a, b| a.name().cmp(b.name()));
        records
    }

    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }
}
