//! Pending clock set and transfer selection
//!
//! Heartbeats advertise each peer's vector clock. The tracker accumulates
//! them here over `clock_sample_periods` ticks, then asks: which peers have
//! observed events we have not? Only those get a transfer request, and
//! peers whose clock is covered by another pending clock are skipped, which
//! dampens transfer storms when many peers diverge at once.

use rollcall_crdt::{dominates, ClockSummary, Clocks};
use rollcall_model::{ReplicaName, ReplicaRef};

use crate::replica::ReplicaMap;

/// Upper bound on distinct peers sampled per window.
const MAX_PENDING: usize = 64;

#[derive(Debug, Default)]
pub struct ClockSet {
    pending: Vec<(ReplicaName, ClockSummary)>,
}

impl ClockSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a heartbeat's clock advertisement into the pending set,
    /// keeping the latest summary per replica name.
    pub fn append(&mut self, clocks: &Clocks) {
        for (name, summary) in clocks {
            self.upsert(name, summary);
        }
    }

    fn upsert(&mut self, name: &ReplicaName, summary: &ClockSummary) {
        if let Some(slot) = self.pending.iter_mut().find(|(n, _)| n == name) {
            slot.1 = summary.clone();
        } else if self.pending.len() < MAX_PENDING {
            self.pending.push((name.clone(), summary.clone()));
        }
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Select the peers to request transfers from this window.
    ///
    /// A peer is selected when its clock is not dominated by the local
    /// clock or by any other pending clock. Mutually-equal clocks keep only
    /// the lexicographically-first name, so one request covers the group.
    /// Peers must still be present in the registry under the advertised
    /// vsn; stale advertisements are dropped.
    pub fn to_sync(
        &mut self,
        local_name: &ReplicaName,
        local: &ClockSummary,
        replicas: &ReplicaMap,
    ) -> Vec<ReplicaRef> {
        self.upsert(local_name, local);

        let mut out = Vec::new();
        for (name, summary) in &self.pending {
            if name == local_name {
                continue;
            }
            if dominates(&local.context, &summary.context) {
                continue;
            }
            let shadowed = self.pending.iter().any(|(other, other_summary)| {
                other != name
                    && dominates(&other_summary.context, &summary.context)
                    && (!dominates(&summary.context, &other_summary.context) || other < name)
            });
            if shadowed {
                continue;
            }
            match replicas.get(name) {
                Some(record) if record.vsn() == summary.vsn => {
                    out.push(record.replica_ref().clone());
                }
                _ => {}
            }
        }
        out
    }
}
