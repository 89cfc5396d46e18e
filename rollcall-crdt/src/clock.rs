//! Vector clocks for causality tracking
//!
//! Tracks how much of each replica's event stream has been observed. Used by
//! the tracker during heartbeat exchange to decide which peers hold events
//! it has not seen yet.

use std::collections::BTreeMap;

use rollcall_model::{ReplicaName, ReplicaRef, Vsn};

/// Vector clock: highest contiguously-observed counter per replica.
///
/// Keyed by the full `(name, vsn)` ref, so counters from a restarted peer
/// never collide with its previous incarnation.
pub type Context = BTreeMap<ReplicaRef, u64>;

/// One replica's clock advertisement: its boot nonce and its vector clock.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ClockSummary {
    pub vsn: Vsn,
    pub context: Context,
}

/// Clock advertisements carried by a heartbeat, keyed by replica name.
pub type Clocks = BTreeMap<ReplicaName, ClockSummary>;

/// True if `a` has observed at least everything `b` has.
pub fn dominates(a: &Context, b: &Context) -> bool {
    b.iter()
        .all(|(replica, clock)| a.get(replica).copied().unwrap_or(0) >= *clock)
}

/// Pointwise-max merge of `other` into `into`.
pub fn merge_context(into: &mut Context, other: &Context) {
    for (replica, clock) in other {
        let slot = into.entry(replica.clone()).or_insert(0);
        if *clock > *slot {
            *slot = *clock;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replica(name: &str) -> ReplicaRef {
        ReplicaRef::new(name, 1)
    }

    #[test]
    fn empty_context_is_dominated_by_everything() {
        let empty = Context::new();
        let mut one = Context::new();
        one.insert(replica("a"), 3);

        assert!(dominates(&one, &empty));
        assert!(dominates(&empty, &empty));
        assert!(!dominates(&empty, &one));
    }

    #[test]
    fn dominance_is_pointwise() {
        let mut a = Context::new();
        a.insert(replica("x"), 5);
        a.insert(replica("y"), 2);

        let mut b = Context::new();
        b.insert(replica("x"), 5);

        assert!(dominates(&a, &b));
        assert!(!dominates(&b, &a));

        // Concurrent: each holds something the other lacks.
        let mut c = Context::new();
        c.insert(replica("y"), 9);
        assert!(!dominates(&a, &c));
        assert!(!dominates(&c, &a));
    }

    #[test]
    fn merge_takes_pointwise_max() {
        let mut a = Context::new();
        a.insert(replica("x"), 5);
        a.insert(replica("y"), 1);

        let mut b = Context::new();
        b.insert(replica("y"), 4);
        b.insert(replica("z"), 2);

        merge_context(&mut a, &b);
        assert_eq!(a.get(&replica("x")), Some(&5));
        assert_eq!(a.get(&replica("y")), Some(&4));
        assert_eq!(a.get(&replica("z")), Some(&2));
    }

    #[test]
    fn restarted_replica_keys_do_not_collide() {
        let old = ReplicaRef::new("a", 1);
        let new = ReplicaRef::new("a", 2);

        let mut ctx = Context::new();
        ctx.insert(old.clone(), 10);
        ctx.insert(new.clone(), 1);

        assert_eq!(ctx.get(&old), Some(&10));
        assert_eq!(ctx.get(&new), Some(&1));
    }
}
