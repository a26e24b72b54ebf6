//! Chooses which ready task goes to which worker (spec §4.3).
//!
//! The precise `stacks`-vs-`ready` insertion heuristic is an open question
//! in the spec; it resolves it with a pluggable [`PlacementPolicy`] trait so
//! the default cost-based policy can be swapped without touching the rest
//! of the scheduler.

use std::collections::BTreeSet;

use scheduler_trace::debug;

use crate::ids::{TaskKey, WorkerAddr};
use crate::store::StateStore;

/// Where a newly-ready task should go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    /// Push onto this worker's locality-affine stack.
    Stack(WorkerAddr),
    /// Append to the common ready deque; no single worker is a clear win.
    Ready,
    /// No worker can run this (restrictions unsatisfiable, or empty
    /// cluster); move to `unrunnable`.
    Unrunnable,
}

/// Decides where a newly-ready, unrestricted task should land. Implementors
/// must be O(|dependencies(k)|) (spec §4.3 "constant-time guarantee").
pub trait PlacementPolicy: std::fmt::Debug {
    fn place(&self, store: &StateStore, key: &TaskKey) -> Placement;
}

/// Default policy from spec §4.3.2: score every worker by
/// `occupancy(w) + transfer_cost(k, w)`, take the minimizer, and push onto
/// its stack if it already holds at least one of `k`'s dependencies
/// (otherwise the locality affinity buys nothing, so prefer the common
/// pool to keep it stealable).
#[derive(Debug, Clone)]
pub struct CostBasedPlacement {
    pub assumed_bandwidth_bytes_per_sec: u64,
}

impl CostBasedPlacement {
    #[must_use]
    pub fn new(assumed_bandwidth_bytes_per_sec: u64) -> Self {
        Self {
            assumed_bandwidth_bytes_per_sec,
        }
    }

    #[must_use]
    pub fn transfer_cost(&self, store: &StateStore, key: &TaskKey, worker: &WorkerAddr) -> u64 {
        let deps = store.dependencies_of(key);
        let missing_bytes: u64 = deps
            .iter()
            .filter(|d| !store.replicas(d).contains(worker))
            .filter_map(|d| store.task(d).and_then(|t| t.nbytes))
            .sum();
        if self.assumed_bandwidth_bytes_per_sec == 0 {
            return missing_bytes;
        }
        missing_bytes / self.assumed_bandwidth_bytes_per_sec.max(1)
    }
}

impl PlacementPolicy for CostBasedPlacement {
    fn place(&self, store: &StateStore, key: &TaskKey) -> Placement {
        let restrictions = match store.task(key) {
            Some(task) => task.restrictions.clone(),
            None => return Placement::Unrunnable,
        };

        if !restrictions.is_empty() {
            let satisfying: Vec<WorkerAddr> = store
                .worker_ids()
                .into_iter()
                .filter(|w| {
                    store
                        .worker(w)
                        .map(|info| restrictions.satisfied_by(&info.hostname))
                        .unwrap_or(false)
                })
                .collect();

            return match satisfying
                .into_iter()
                .min_by_key(|w| store.processing.get(w).map(std::collections::BTreeMap::len).unwrap_or(0))
            {
                Some(w) => Placement::Stack(w),
                None => Placement::Unrunnable,
            };
        }

        let workers = store.worker_ids();
        if workers.is_empty() {
            return Placement::Unrunnable;
        }

        let deps = store.dependencies_of(key);
        let best = workers
            .into_iter()
            .map(|w| {
                let score = store.occupancy(&w) + self.transfer_cost(store, key, &w);
                (w, score)
            })
            .min_by_key(|(_, score)| *score);

        match best {
            Some((worker, _)) => {
                let has_affinity = deps.iter().any(|d| store.replicas(d).contains(&worker));
                if has_affinity {
                    debug!("placing {} on stack of {} (locality affine)", key, worker);
                    Placement::Stack(worker)
                } else {
                    Placement::Ready
                }
            }
            None => Placement::Unrunnable,
        }
    }
}

/// Fraction of a task's transfer cost, relative to the loaded worker's own
/// transfer cost for the same key, below which it is considered cheap
/// enough to steal (spec §4.3.4's "stealable ratio").
pub const STEAL_RATIO_THRESHOLD: f64 = 0.5;

#[derive(Debug)]
pub struct Dispatcher {
    pub policy: Box<dyn PlacementPolicy + Send>,
    /// Used only by [`Dispatcher::find_steal`]'s cheapness estimate; the
    /// placement policy has its own (possibly different) notion of cost.
    assumed_bandwidth_bytes_per_sec: u64,
    /// Upper bound on concurrent `processing` tasks per worker, independent
    /// of `Worker::ncores` (spec §4.3's overbook limit). The effective cap
    /// for a given worker is `min(ncores, worker_overbook_limit)`.
    worker_overbook_limit: usize,
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        policy: Box<dyn PlacementPolicy + Send>,
        assumed_bandwidth_bytes_per_sec: u64,
        worker_overbook_limit: usize,
    ) -> Self {
        Self {
            policy,
            assumed_bandwidth_bytes_per_sec,
            worker_overbook_limit,
        }
    }

    #[must_use]
    pub fn with_default_policy(assumed_bandwidth_bytes_per_sec: u64, worker_overbook_limit: usize) -> Self {
        Self::new(
            Box::new(CostBasedPlacement::new(assumed_bandwidth_bytes_per_sec)),
            assumed_bandwidth_bytes_per_sec,
            worker_overbook_limit,
        )
    }

    /// Routes a task whose `waiting` set just emptied to a queue (spec
    /// §4.3.2). O(|dependencies(k)|).
    pub fn route_ready_task(&self, store: &mut StateStore, key: TaskKey) {
        match self.policy.place(store, &key) {
            Placement::Stack(worker) => store.push_stack(&worker, key),
            Placement::Ready => store.push_ready(key),
            Placement::Unrunnable => store.mark_unrunnable(key),
        }
    }

    /// Worker-pull: supplies the next task for a worker with a free slot
    /// (spec §4.3.1), honoring its concurrent-processing cap. O(1).
    pub fn next_for_worker(&self, store: &mut StateStore, worker: &WorkerAddr) -> Option<TaskKey> {
        let cap = store.worker(worker)?.ncores as usize;
        let cap = cap.min(self.worker_overbook_limit);
        if store.processing_count(worker) >= cap {
            return None;
        }
        store.pop_stack(worker).or_else(|| store.pop_ready())
    }

    /// Looks for one stealable (worker, worker, key) triple: an idle worker
    /// and a loaded one whose stack-bottom task is cheap to move there. At
    /// most one steal per call, O(1) amortized per attempt (spec §4.3.4).
    pub fn find_steal(&self, store: &StateStore) -> Option<(WorkerAddr, WorkerAddr, TaskKey)> {
        let idle = store
            .worker_ids()
            .into_iter()
            .find(|w| store.stacks.get(w).map(Vec::is_empty).unwrap_or(true) && store.occupancy(w) == 0)?;

        let loaded_with_key = store
            .worker_ids()
            .into_iter()
            .filter(|w| *w != idle)
            .find_map(|w| store.stacks.get(&w).and_then(|s| s.first()).map(|k| (w, k.clone())));

        let (loaded, key) = loaded_with_key?;

        let on_loaded = self.transfer_cost_estimate(store, &key, &loaded);
        let on_idle = self.transfer_cost_estimate(store, &key, &idle);

        let ratio = if on_loaded == 0 {
            1.0
        } else {
            on_idle as f64 / on_loaded as f64
        };
        if ratio > STEAL_RATIO_THRESHOLD {
            return None;
        }

        Some((loaded, idle, key))
    }

    fn transfer_cost_estimate(&self, store: &StateStore, key: &TaskKey, worker: &WorkerAddr) -> u64 {
        let deps = store.dependencies_of(key);
        let missing_bytes: u64 = deps
            .iter()
            .filter(|d| !store.replicas(d).contains(worker))
            .filter_map(|d| store.task(d).and_then(|t| t.nbytes))
            .sum();
        missing_bytes / self.assumed_bandwidth_bytes_per_sec.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::Priority;
    use crate::task::Restrictions;

    fn key(s: &str) -> TaskKey {
        TaskKey::from(s)
    }

    #[test]
    fn unrestricted_task_with_no_workers_is_unrunnable() {
        let store = StateStore::new();
        let policy = CostBasedPlacement::new(1_000);
        let mut store = store;
        store
            .add_task(key("a"), vec![], BTreeSet::new(), Priority::new(0, 0), Restrictions::none(), None)
            .unwrap();
        assert_eq!(policy.place(&store, &key("a")), Placement::Unrunnable);
    }

    #[test]
    fn task_with_satisfied_restriction_goes_to_matching_worker() {
        let mut store = StateStore::new();
        store.add_worker(WorkerAddr::from("gpu-1"), "gpu-1".into(), 8);
        store.add_worker(WorkerAddr::from("cpu-1"), "cpu-1".into(), 8);

        let mut restrictions = Restrictions::none();
        restrictions.hosts.insert("gpu-1".to_string());
        store
            .add_task(key("k"), vec![], BTreeSet::new(), Priority::new(0, 0), restrictions, None)
            .unwrap();

        let policy = CostBasedPlacement::new(1_000);
        assert_eq!(policy.place(&store, &key("k")), Placement::Stack(WorkerAddr::from("gpu-1")));
    }

    #[test]
    fn unsatisfiable_restriction_is_unrunnable() {
        let mut store = StateStore::new();
        store.add_worker(WorkerAddr::from("cpu-1"), "cpu-1".into(), 8);

        let mut restrictions = Restrictions::none();
        restrictions.hosts.insert("gpu-1".to_string());
        store
            .add_task(key("k"), vec![], BTreeSet::new(), Priority::new(0, 0), restrictions, None)
            .unwrap();

        let policy = CostBasedPlacement::new(1_000);
        assert_eq!(policy.place(&store, &key("k")), Placement::Unrunnable);
    }

    #[test]
    fn task_prefers_worker_already_holding_its_dependency() {
        let mut store = StateStore::new();
        store.add_worker(WorkerAddr::from("w1"), "h1".into(), 4);
        store.add_worker(WorkerAddr::from("w2"), "h2".into(), 4);

        store
            .add_task(key("x"), vec![], BTreeSet::new(), Priority::new(0, 0), Restrictions::none(), None)
            .unwrap();
        store.record_memory(&key("x"), &WorkerAddr::from("w1"), 1_000_000);

        let deps = BTreeSet::from([key("x")]);
        store
            .add_task(key("z"), vec![], deps, Priority::new(0, 1), Restrictions::none(), None)
            .unwrap();

        let policy = CostBasedPlacement::new(1_000_000);
        assert_eq!(policy.place(&store, &key("z")), Placement::Stack(WorkerAddr::from("w1")));
    }
}
