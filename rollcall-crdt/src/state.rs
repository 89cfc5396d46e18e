//! Presence state machine
//!
//! An observed-remove set over `(session, topic, key, meta)` entries. Every
//! insert mints a causal [`Tag`]; removes propagate as observed tags, so a
//! remove can never cancel an add it has not seen. Observation is tracked as
//! a contiguous vector clock plus a cloud of out-of-order dots, which makes
//! merging deltas safe in any delivery order.

use std::collections::{BTreeMap, BTreeSet};
use std::mem;

use rollcall_model::{Meta, ReplicaRef, SessionId};

use crate::clock::{merge_context, ClockSummary, Clocks, Context};

/// Causal tag minted at insert time: the owning replica and its counter.
#[derive(
    Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, serde::Serialize, serde::Deserialize,
)]
pub struct Tag {
    pub owner: ReplicaRef,
    pub clock: u64,
}

/// One tracked presence.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Entry {
    pub session: SessionId,
    pub topic: String,
    pub key: String,
    #[serde(with = "rollcall_model::diff::meta_bytes")]
    pub meta: Meta,
    pub tag: Tag,
}

/// Changes accumulated since the last delta extraction. Broadcast in
/// heartbeats; merging the same delta twice is a no-op.
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct Delta {
    pub joins: Vec<Entry>,
    pub leaves: Vec<Tag>,
}

impl Delta {
    pub fn is_empty(&self) -> bool {
        self.joins.is_empty() && self.leaves.is_empty()
    }
}

/// Full-state payload for a transfer response.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct Snapshot {
    pub entries: Vec<Entry>,
    pub context: Context,
    pub cloud: BTreeSet<Tag>,
}

impl Snapshot {
    fn observed(&self, tag: &Tag) -> bool {
        self.context.get(&tag.owner).copied().unwrap_or(0) >= tag.clock
            || self.cloud.contains(tag)
    }
}

/// Presence CRDT owned by one replica.
pub struct State {
    self_ref: ReplicaRef,
    clock: u64,
    context: Context,
    cloud: BTreeSet<Tag>,
    entries: BTreeMap<Tag, Entry>,
    down: BTreeSet<ReplicaRef>,
    delta: Delta,
}

impl State {
    pub fn new(self_ref: ReplicaRef) -> Self {
        let mut context = Context::new();
        context.insert(self_ref.clone(), 0);
        Self {
            self_ref,
            clock: 0,
            context,
            cloud: BTreeSet::new(),
            entries: BTreeMap::new(),
            down: BTreeSet::new(),
            delta: Delta::default(),
        }
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Number of stored entries, including ones hidden by a down replica.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn observed(&self, tag: &Tag) -> bool {
        self.context.get(&tag.owner).copied().unwrap_or(0) >= tag.clock
            || self.cloud.contains(tag)
    }

    fn mark_observed(&mut self, tag: &Tag) {
        let current = self.context.get(&tag.owner).copied().unwrap_or(0);
        if tag.clock <= current {
            return;
        }
        if tag.clock == current + 1 {
            // Contiguous: advance the clock and absorb any queued dots.
            let mut clock = tag.clock;
            loop {
                let next = Tag {
                    owner: tag.owner.clone(),
                    clock: clock + 1,
                };
                if self.cloud.remove(&next) {
                    clock += 1;
                } else {
                    break;
                }
            }
            self.context.insert(tag.owner.clone(), clock);
        } else {
            self.cloud.insert(tag.clone());
        }
    }

    fn is_visible(&self, owner: &ReplicaRef) -> bool {
        !self.down.contains(owner)
    }

    /// Remove entries matching the predicate, recording their tags as
    /// leaves in the pending delta.
    fn remove_where<F: Fn(&Entry) -> bool>(&mut self, pred: F) -> Vec<Entry> {
        let tags: Vec<Tag> = self
            .entries
            .iter()
            .filter(|(_, entry)| pred(entry))
            .map(|(tag, _)| tag.clone())
            .collect();

        let mut removed = Vec::with_capacity(tags.len());
        for tag in tags {
            if let Some(entry) = self.entries.remove(&tag) {
                self.delta.leaves.push(tag);
                removed.push(entry);
            }
        }
        removed
    }

    /// Add a local entry, replacing any live self-owned entry for the same
    /// `(session, topic, key)`. Returns the new tag and the replaced entry,
    /// if one existed.
    ///
    /// Session ids are only meaningful on the replica that minted them, so
    /// this and the other session-keyed operations never match entries
    /// owned by another replica, even under a colliding numeric id.
    pub fn join(
        &mut self,
        session: SessionId,
        topic: impl Into<String>,
        key: impl Into<String>,
        meta: Meta,
    ) -> (Tag, Option<Entry>) {
        let topic = topic.into();
        let key = key.into();

        let owner = self.self_ref.clone();
        let replaced = self
            .remove_where(|e| {
                e.tag.owner == owner && e.session == session && e.topic == topic && e.key == key
            })
            .into_iter()
            .next();

        self.clock += 1;
        let tag = Tag {
            owner: self.self_ref.clone(),
            clock: self.clock,
        };
        self.context.insert(self.self_ref.clone(), self.clock);

        let entry = Entry {
            session,
            topic,
            key,
            meta,
            tag: tag.clone(),
        };
        self.entries.insert(tag.clone(), entry.clone());
        self.delta.joins.push(entry);

        (tag, replaced)
    }

    /// Remove the self-owned entry for `(session, topic, key)`. Returns
    /// the removed entries (empty if none was present).
    pub fn leave(&mut self, session: SessionId, topic: &str, key: &str) -> Vec<Entry> {
        let owner = self.self_ref.clone();
        self.remove_where(|e| {
            e.tag.owner == owner && e.session == session && e.topic == topic && e.key == key
        })
    }

    /// Remove every self-owned entry belonging to `session`.
    pub fn leave_all(&mut self, session: SessionId) -> Vec<Entry> {
        let owner = self.self_ref.clone();
        self.remove_where(|e| e.tag.owner == owner && e.session == session)
    }

    /// Merge a remote delta. Returns the entries that appeared and
    /// disappeared relative to the locally visible view.
    pub fn merge(&mut self, remote: &Delta) -> (Vec<Entry>, Vec<Entry>) {
        let mut left = Vec::new();
        for tag in &remote.leaves {
            if let Some(entry) = self.entries.remove(tag) {
                if self.is_visible(&tag.owner) {
                    left.push(entry);
                }
            }
            self.mark_observed(tag);
        }

        let mut joined = Vec::new();
        for entry in &remote.joins {
            if self.observed(&entry.tag) {
                continue;
            }
            self.entries.insert(entry.tag.clone(), entry.clone());
            self.mark_observed(&entry.tag);
            if self.is_visible(&entry.tag.owner) {
                joined.push(entry.clone());
            }
        }

        (joined, left)
    }

    /// Merge a full remote snapshot. Entries the remote has observed but no
    /// longer stores were removed somewhere and are pruned here; entries we
    /// have not observed are admitted. Own entries are never pruned, since
    /// this replica is authoritative for its own sessions.
    pub fn merge_snapshot(&mut self, remote: &Snapshot) -> (Vec<Entry>, Vec<Entry>) {
        let remote_tags: BTreeSet<&Tag> = remote.entries.iter().map(|e| &e.tag).collect();

        let stale: Vec<Tag> = self
            .entries
            .keys()
            .filter(|tag| {
                tag.owner != self.self_ref && remote.observed(tag) && !remote_tags.contains(*tag)
            })
            .cloned()
            .collect();

        let mut left = Vec::new();
        for tag in stale {
            if let Some(entry) = self.entries.remove(&tag) {
                if self.is_visible(&tag.owner) {
                    left.push(entry);
                }
            }
        }

        let mut joined = Vec::new();
        for entry in &remote.entries {
            if self.observed(&entry.tag) {
                continue;
            }
            self.entries.insert(entry.tag.clone(), entry.clone());
            self.mark_observed(&entry.tag);
            if self.is_visible(&entry.tag.owner) {
                joined.push(entry.clone());
            }
        }

        merge_context(&mut self.context, &remote.context);
        let remote_cloud: Vec<Tag> = remote.cloud.iter().cloned().collect();
        for tag in &remote_cloud {
            self.mark_observed(tag);
        }
        self.compact_cloud();

        (joined, left)
    }

    /// Drop cloud dots that the contiguous context now covers, absorbing
    /// runs that became contiguous after a bulk context merge.
    fn compact_cloud(&mut self) {
        loop {
            let absorbable: Vec<Tag> = self
                .cloud
                .iter()
                .filter(|tag| {
                    tag.clock <= self.context.get(&tag.owner).copied().unwrap_or(0) + 1
                })
                .cloned()
                .collect();
            if absorbable.is_empty() {
                break;
            }
            let mut advanced = false;
            for tag in absorbable {
                self.cloud.remove(&tag);
                let slot = self.context.entry(tag.owner.clone()).or_insert(0);
                if tag.clock == *slot + 1 {
                    *slot = tag.clock;
                    advanced = true;
                }
            }
            if !advanced {
                break;
            }
        }
    }

    /// Full snapshot for a transfer response. Clears the accumulated delta:
    /// the snapshot supersedes it.
    pub fn extract(&mut self) -> Snapshot {
        self.delta = Delta::default();
        Snapshot {
            entries: self.entries.values().cloned().collect(),
            context: self.context.clone(),
            cloud: self.cloud.clone(),
        }
    }

    /// Take the accumulated delta, leaving an empty one behind.
    pub fn extract_delta(&mut self) -> Delta {
        mem::take(&mut self.delta)
    }

    pub fn has_delta(&self) -> bool {
        !self.delta.is_empty()
    }

    pub fn reset_delta(&mut self) {
        self.delta = Delta::default();
    }

    /// This replica's clock advertisement for a heartbeat.
    pub fn clocks(&self) -> Clocks {
        let mut clocks = Clocks::new();
        clocks.insert(
            self.self_ref.name.clone(),
            ClockSummary {
                vsn: self.self_ref.vsn,
                context: self.context.clone(),
            },
        );
        clocks
    }

    /// Unhide entries owned by `replica`. Returns the entries that became
    /// visible.
    pub fn replica_up(&mut self, replica: &ReplicaRef) -> Vec<Entry> {
        if self.down.remove(replica) {
            self.owned_by(replica)
        } else {
            Vec::new()
        }
    }

    /// Hide entries owned by `replica` without deleting them. Returns the
    /// entries that became hidden.
    pub fn replica_down(&mut self, replica: &ReplicaRef) -> Vec<Entry> {
        if self.down.insert(replica.clone()) {
            self.owned_by(replica)
        } else {
            Vec::new()
        }
    }

    /// Permanently delete entries owned by `replica`. Its counters stay in
    /// the causal context so stale heartbeats from the same incarnation can
    /// never re-introduce them.
    pub fn remove_down_replicas(&mut self, replica: &ReplicaRef) -> Vec<Entry> {
        let tags: Vec<Tag> = self
            .entries
            .keys()
            .filter(|tag| tag.owner == *replica)
            .cloned()
            .collect();
        let mut removed = Vec::with_capacity(tags.len());
        for tag in tags {
            if let Some(entry) = self.entries.remove(&tag) {
                removed.push(entry);
            }
        }
        self.down.remove(replica);
        removed
    }

    fn owned_by(&self, replica: &ReplicaRef) -> Vec<Entry> {
        self.entries
            .values()
            .filter(|e| e.tag.owner == *replica)
            .cloned()
            .collect()
    }

    /// Visible `(key, meta)` pairs for a topic.
    pub fn get_by_topic(&self, topic: &str) -> Vec<(String, Meta)> {
        self.entries
            .values()
            .filter(|e| e.topic == topic && self.is_visible(&e.tag.owner))
            .map(|e| (e.key.clone(), e.meta.clone()))
            .collect()
    }

    /// Self-owned entries belonging to a session.
    pub fn get_by_session(&self, session: SessionId) -> Vec<&Entry> {
        self.entries
            .values()
            .filter(|e| e.tag.owner == self.self_ref && e.session == session)
            .collect()
    }

    /// The self-owned entry for `(session, topic, key)`, if any.
    pub fn get(&self, session: SessionId, topic: &str, key: &str) -> Option<&Entry> {
        self.entries.values().find(|e| {
            e.tag.owner == self.self_ref
                && e.session == session
                && e.topic == topic
                && e.key == key
        })
    }

    /// Topics with at least one visible entry.
    pub fn online_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self
            .entries
            .values()
            .filter(|e| self.is_visible(&e.tag.owner))
            .map(|e| e.topic.clone())
            .collect();
        topics.sort();
        topics.dedup();
        topics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_model::{ReplicaName, Session};

    fn replica(name: &str) -> ReplicaRef {
        ReplicaRef::new(name, 1)
    }

    fn meta(pairs: &[(&str, &str)]) -> Meta {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), serde_json::Value::String(v.to_string())))
            .collect()
    }

    fn session() -> SessionId {
        Session::new().id()
    }

    #[test]
    fn join_mints_increasing_tags() {
        let mut state = State::new(replica("a"));
        let (t1, _) = state.join(session(), "room", "u1", Meta::new());
        let (t2, _) = state.join(session(), "room", "u2", Meta::new());
        assert_eq!(t1.clock, 1);
        assert_eq!(t2.clock, 2);
        assert_eq!(state.context().get(&replica("a")), Some(&2));
    }

    #[test]
    fn join_replaces_same_session_topic_key() {
        let mut state = State::new(replica("a"));
        let s = session();
        let (t1, replaced) = state.join(s, "room", "u1", meta(&[("n", "1")]));
        assert!(replaced.is_none());

        let (t2, replaced) = state.join(s, "room", "u1", meta(&[("n", "2")]));
        let replaced = replaced.expect("previous entry replaced");
        assert_eq!(replaced.tag, t1);
        assert_ne!(t1, t2);
        assert_eq!(state.get_by_topic("room").len(), 1);
    }

    #[test]
    fn same_key_different_sessions_coexist() {
        let mut state = State::new(replica("a"));
        state.join(session(), "room", "u1", Meta::new());
        state.join(session(), "room", "u1", Meta::new());
        assert_eq!(state.get_by_topic("room").len(), 2);
    }

    #[test]
    fn leave_removes_and_records_delta() {
        let mut state = State::new(replica("a"));
        let s = session();
        state.join(s, "room", "u1", Meta::new());
        state.reset_delta();

        let removed = state.leave(s, "room", "u1");
        assert_eq!(removed.len(), 1);
        assert!(state.get_by_topic("room").is_empty());
        let delta = state.extract_delta();
        assert_eq!(delta.leaves.len(), 1);
        assert!(delta.joins.is_empty());
    }

    #[test]
    fn leave_all_clears_every_topic_for_session() {
        let mut state = State::new(replica("a"));
        let s = session();
        let other = session();
        state.join(s, "room", "u1", Meta::new());
        state.join(s, "hall", "u1", Meta::new());
        state.join(other, "room", "u2", Meta::new());

        let removed = state.leave_all(s);
        assert_eq!(removed.len(), 2);
        assert_eq!(state.len(), 1);
    }

    #[test]
    fn merge_adds_unseen_entries_once() {
        let mut a = State::new(replica("a"));
        let mut b = State::new(replica("b"));
        a.join(session(), "room", "u1", Meta::new());

        let delta = a.extract_delta();
        let (joined, left) = b.merge(&delta);
        assert_eq!(joined.len(), 1);
        assert!(left.is_empty());

        let (joined, left) = b.merge(&delta);
        assert!(joined.is_empty());
        assert!(left.is_empty());
        assert_eq!(b.len(), 1);
    }

    #[test]
    fn merge_applies_leaves_by_tag() {
        let mut a = State::new(replica("a"));
        let mut b = State::new(replica("b"));
        let s = session();

        a.join(s, "room", "u1", Meta::new());
        b.merge(&a.extract_delta());
        assert_eq!(b.len(), 1);

        a.leave(s, "room", "u1");
        let (joined, left) = b.merge(&a.extract_delta());
        assert!(joined.is_empty());
        assert_eq!(left.len(), 1);
        assert!(b.is_empty());
    }

    #[test]
    fn out_of_order_deltas_still_converge() {
        let mut a = State::new(replica("a"));
        let mut b = State::new(replica("b"));

        a.join(session(), "room", "u1", Meta::new());
        let first = a.extract_delta();
        a.join(session(), "room", "u2", Meta::new());
        let second = a.extract_delta();

        // Deliver newest first; the older join must still be admitted.
        b.merge(&second);
        let (joined, _) = b.merge(&first);
        assert_eq!(joined.len(), 1);
        assert_eq!(b.get_by_topic("room").len(), 2);
    }

    #[test]
    fn leave_before_join_blocks_resurrection() {
        let mut a = State::new(replica("a"));
        let mut b = State::new(replica("b"));
        let s = session();

        a.join(s, "room", "u1", Meta::new());
        let join_delta = a.extract_delta();
        a.leave(s, "room", "u1");
        let leave_delta = a.extract_delta();

        // Leave arrives first: the later join is already observed.
        b.merge(&leave_delta);
        let (joined, _) = b.merge(&join_delta);
        assert!(joined.is_empty());
        assert!(b.is_empty());
    }

    #[test]
    fn snapshot_prunes_observed_removals() {
        let mut a = State::new(replica("a"));
        let mut b = State::new(replica("b"));
        let s = session();

        a.join(s, "room", "u1", Meta::new());
        b.merge(&a.extract_delta());
        assert_eq!(b.len(), 1);

        // A removes while B misses the leave delta.
        a.leave(s, "room", "u1");
        a.extract_delta();

        let snapshot = a.extract();
        let (joined, left) = b.merge_snapshot(&snapshot);
        assert!(joined.is_empty());
        assert_eq!(left.len(), 1);
        assert!(b.is_empty());
    }

    #[test]
    fn snapshot_never_prunes_own_entries() {
        let mut a = State::new(replica("a"));
        let mut b = State::new(replica("b"));

        a.join(session(), "room", "u1", Meta::new());
        // B has observed A's join but purged the entry (e.g. permdown).
        b.merge(&a.extract_delta());
        b.remove_down_replicas(&replica("a"));

        let snapshot = b.extract();
        let (_, left) = a.merge_snapshot(&snapshot);
        assert!(left.is_empty());
        assert_eq!(a.len(), 1, "own entry must survive remote pruning");
    }

    #[test]
    fn merging_own_snapshot_is_empty_diff() {
        let mut a = State::new(replica("a"));
        a.join(session(), "room", "u1", Meta::new());
        a.extract_delta();

        let snapshot = a.extract();

        // Back into the producing state: a no-op.
        let (joined, left) = a.merge_snapshot(&snapshot);
        assert!(joined.is_empty());
        assert!(left.is_empty());

        // Into another state: applies once, then nothing.
        let mut b = State::new(replica("b"));
        b.merge_snapshot(&snapshot);
        let (joined, left) = b.merge_snapshot(&snapshot);
        assert!(joined.is_empty());
        assert!(left.is_empty());
    }

    #[test]
    fn replica_down_hides_and_up_restores() {
        let mut a = State::new(replica("a"));
        let mut b = State::new(replica("b"));

        a.join(session(), "room", "u1", Meta::new());
        b.merge(&a.extract_delta());
        assert_eq!(b.get_by_topic("room").len(), 1);

        let hidden = b.replica_down(&replica("a"));
        assert_eq!(hidden.len(), 1);
        assert!(b.get_by_topic("room").is_empty());
        assert_eq!(b.len(), 1, "hidden entries stay in storage");

        // Down is idempotent.
        assert!(b.replica_down(&replica("a")).is_empty());

        let restored = b.replica_up(&replica("a"));
        assert_eq!(restored.len(), 1);
        assert_eq!(b.get_by_topic("room").len(), 1);
    }

    #[test]
    fn merge_hides_joins_from_down_replicas() {
        let mut a = State::new(replica("a"));
        let mut b = State::new(replica("b"));

        b.replica_down(&replica("a"));
        a.join(session(), "room", "u1", Meta::new());
        let (joined, _) = b.merge(&a.extract_delta());
        assert!(joined.is_empty(), "joins from a down replica are not visible");
        assert_eq!(b.len(), 1, "but they are stored");
    }

    #[test]
    fn remove_down_replicas_purges_and_blocks_reintroduction() {
        let mut a = State::new(replica("a"));
        let mut b = State::new(replica("b"));

        a.join(session(), "room", "u1", Meta::new());
        let delta = a.extract_delta();
        b.merge(&delta);

        let removed = b.remove_down_replicas(&replica("a"));
        assert_eq!(removed.len(), 1);
        assert!(b.is_empty());

        // A stale re-send of the same delta must not resurrect the entry.
        let (joined, _) = b.merge(&delta);
        assert!(joined.is_empty());
        assert!(b.is_empty());
    }

    #[test]
    fn restarted_replica_entries_are_admitted() {
        let mut b = State::new(replica("b"));

        let mut a1 = State::new(ReplicaRef::new("a", 1));
        a1.join(session(), "room", "u1", Meta::new());
        b.merge(&a1.extract_delta());
        b.remove_down_replicas(&ReplicaRef::new("a", 1));

        // Same name, fresh vsn: its counters are a new key space.
        let mut a2 = State::new(ReplicaRef::new("a", 2));
        a2.join(session(), "room", "u2", Meta::new());
        let (joined, _) = b.merge(&a2.extract_delta());
        assert_eq!(joined.len(), 1);
        assert_eq!(joined[0].key, "u2");
    }

    #[test]
    fn clocks_advertise_own_name_and_context() {
        let mut a = State::new(replica("a"));
        a.join(session(), "room", "u1", Meta::new());

        let clocks = a.clocks();
        assert_eq!(clocks.len(), 1);
        let summary = clocks.get(&ReplicaName::new("a")).expect("own entry");
        assert_eq!(summary.vsn, 1);
        assert_eq!(summary.context.get(&replica("a")), Some(&1));
    }

    #[test]
    fn queries_filter_by_visibility() {
        let mut a = State::new(replica("a"));
        let mut b = State::new(replica("b"));

        a.join(session(), "room", "u1", meta(&[("status", "on")]));
        b.merge(&a.extract_delta());
        b.join(session(), "room", "u2", Meta::new());

        assert_eq!(b.online_topics(), vec!["room".to_string()]);
        assert_eq!(b.get_by_topic("room").len(), 2);

        b.replica_down(&replica("a"));
        assert_eq!(b.get_by_topic("room").len(), 1);
        assert_eq!(b.online_topics(), vec!["room".to_string()]);
    }

    #[test]
    fn local_session_ops_never_touch_remote_entries() {
        let mut a = State::new(replica("a"));
        let mut b = State::new(replica("b"));

        // Replicas mint session ids independently, so the same numeric id
        // on two nodes is routine, not an anomaly.
        let shared = SessionId::from_raw(1);
        a.join(shared, "room", "u1", Meta::new());
        b.merge(&a.extract_delta());

        assert!(b.get(shared, "room", "u1").is_none());
        assert!(b.get_by_session(shared).is_empty());
        assert!(b.leave(shared, "room", "u1").is_empty());
        assert!(b.leave_all(shared).is_empty());

        let (_, replaced) = b.join(shared, "room", "u1", Meta::new());
        assert!(replaced.is_none(), "join must not replace the remote entry");
        let delta = b.extract_delta();
        assert!(
            delta.leaves.is_empty(),
            "a local call must never retire another replica's tag"
        );
        assert_eq!(b.get_by_topic("room").len(), 2);

        // The local entry is now addressable; the remote one still is not.
        assert!(b.get(shared, "room", "u1").is_some());
        assert_eq!(b.leave(shared, "room", "u1").len(), 1);
        assert_eq!(b.get_by_topic("room").len(), 1);
    }
}
