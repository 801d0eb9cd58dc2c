use std::{collections::BTreeMap, rc::Rc};

use crate::{
    analysis::Dependencies,
    core::{NodeId, Point, Value},
};

use super::differentiate::DiffValue;

/// Values of the dependency variables at the point where a costly node was
/// last evaluated.
pub(crate) type Snapshot = BTreeMap<NodeId, Value>;

/// Instrumentation counters of a node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Number of forward evaluations.
    pub evals: usize,
    /// Number of values returned from the cache.
    pub hits: usize,
    /// Number of derivative computations.
    pub diff_evals: usize,
    /// Number of derivatives returned from the cache.
    pub diff_hits: usize,
}

/// Memoized result of a node.
#[derive(Debug, Clone)]
pub(crate) struct Entry<T> {
    pub(crate) point: u64,
    pub(crate) value: T,
    pub(crate) snapshot: Option<Snapshot>,
    pub(crate) schedule: Option<u64>,
    pub(crate) fixed: bool,
}

impl<T> Entry<T> {
    /// Checks whether the entry can be reused. Only entries computed under the
    /// same schedule are considered, then in order of priority: same point
    /// (not a batch), node fixed within the schedule, costly node with
    /// unchanged dependency values.
    pub(crate) fn is_valid(
        &self,
        point: &Point,
        schedule: Option<u64>,
        fixed: bool,
        snapshot: Option<&Snapshot>,
    ) -> bool {
        if self.schedule != schedule {
            return false;
        }

        if !point.is_multi() && self.point == point.id() {
            return true;
        }

        if fixed && self.fixed {
            return true;
        }

        matches!((snapshot, &self.snapshot), (Some(current), Some(stored)) if current == stored)
    }
}

/// Side tables of the engines, keyed by node.
#[derive(Default)]
pub(crate) struct Caches {
    pub(crate) values: BTreeMap<NodeId, Entry<Value>>,
    pub(crate) derivatives: BTreeMap<NodeId, Entry<DiffValue>>,
    pub(crate) deps: BTreeMap<NodeId, Rc<Dependencies>>,
    pub(crate) stats: BTreeMap<NodeId, Stats>,
}

impl Caches {
    /// Drops memoized values and derivatives. Dependency sets stay valid since
    /// nodes never change.
    pub(crate) fn clear(&mut self) {
        self.values.clear();
        self.derivatives.clear();
    }

    pub(crate) fn stats_mut(&mut self, id: NodeId) -> &mut Stats {
        self.stats.entry(id).or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use nalgebra::dvector;

    fn entry(
        point: &Point,
        schedule: Option<u64>,
        fixed: bool,
        snapshot: Option<Snapshot>,
    ) -> Entry<Value> {
        Entry {
            point: point.id(),
            value: dvector![1.0],
            snapshot,
            schedule,
            fixed,
        }
    }

    #[test]
    fn hit_priorities() {
        let p1 = Point::builder().build();
        let p2 = Point::builder().build();

        assert!(entry(&p1, None, false, None).is_valid(&p1, None, false, None));
        assert!(!entry(&p1, None, false, None).is_valid(&p2, None, false, None));

        assert!(entry(&p1, Some(3), true, None).is_valid(&p2, Some(3), true, None));
        assert!(!entry(&p1, Some(3), true, None).is_valid(&p2, Some(4), true, None));
        assert!(!entry(&p1, Some(3), false, None).is_valid(&p2, Some(3), true, None));

        let mut snapshot = Snapshot::new();
        snapshot.insert(NodeId(0), dvector![2.0]);
        let stored = entry(&p1, None, false, Some(snapshot.clone()));
        assert!(stored.is_valid(&p2, None, false, Some(&snapshot)));

        snapshot.insert(NodeId(0), dvector![3.0]);
        assert!(!stored.is_valid(&p2, None, false, Some(&snapshot)));
    }

    #[test]
    fn schedule_change_invalidates_same_point() {
        let p = Point::builder().build();
        assert!(!entry(&p, Some(1), false, None).is_valid(&p, Some(2), false, None));
        assert!(!entry(&p, Some(1), false, None).is_valid(&p, None, false, None));
    }

    #[test]
    fn batches_never_hit_by_identity() {
        let multi = Point::multi(2).build();
        assert!(!entry(&multi, None, false, None).is_valid(&multi, None, false, None));
    }
}
