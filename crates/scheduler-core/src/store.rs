//! The state store: every index from spec §3, kept mutually consistent.
//!
//! Every relationship is represented in both directions (`dependencies` /
//! `dependents`, `who_has` / `has_what`, `processing` / `rprocessing`,
//! `who_wants` / `wants_what`) so that no query here ever needs to scan the
//! whole graph. Mutating one side of a pair without the other is the one
//! bug class this module exists to make impossible to write by accident:
//! every public mutator updates both sides before returning.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::time::{Duration, Instant};

use scheduler_trace::{debug, info};

use crate::error::{SchedulerError, SchedulerResult};
use crate::ids::{ClientId, Priority, TaskKey, WorkerAddr};
use crate::task::{Client, Restrictions, Task, TaskState, Worker};

#[derive(Debug, Default)]
pub struct StateStore {
    pub(crate) tasks: HashMap<TaskKey, Task>,
    pub(crate) workers: HashMap<WorkerAddr, Worker>,
    pub(crate) clients: HashMap<ClientId, Client>,

    pub(crate) dependencies: HashMap<TaskKey, BTreeSet<TaskKey>>,
    pub(crate) dependents: HashMap<TaskKey, BTreeSet<TaskKey>>,

    pub(crate) waiting: HashMap<TaskKey, BTreeSet<TaskKey>>,
    pub(crate) waiting_data: HashMap<TaskKey, BTreeSet<TaskKey>>,

    pub(crate) who_has: HashMap<TaskKey, BTreeSet<WorkerAddr>>,
    pub(crate) has_what: HashMap<WorkerAddr, BTreeSet<TaskKey>>,

    pub(crate) processing: HashMap<WorkerAddr, BTreeMap<TaskKey, u64>>,
    pub(crate) rprocessing: HashMap<TaskKey, BTreeSet<WorkerAddr>>,

    pub(crate) who_wants: HashMap<TaskKey, BTreeSet<ClientId>>,
    pub(crate) wants_what: HashMap<ClientId, BTreeSet<TaskKey>>,

    pub(crate) unrunnable: BTreeSet<TaskKey>,
    pub(crate) ready: VecDeque<TaskKey>,
    pub(crate) stacks: HashMap<WorkerAddr, Vec<TaskKey>>,

    client_generation: HashMap<ClientId, i64>,
    last_heartbeat: HashMap<WorkerAddr, Instant>,
}

impl StateStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // -- clients ---------------------------------------------------------

    pub fn add_client(&mut self, id: ClientId) {
        self.clients.entry(id.clone()).or_insert_with(|| Client::new(id.clone()));
        self.wants_what.entry(id).or_default();
    }

    /// Removes a client and every `who_wants` entry pointing at it. Returns
    /// the keys that client was interested in, for the caller to evaluate
    /// for release.
    pub fn remove_client(&mut self, id: &ClientId) -> BTreeSet<TaskKey> {
        self.clients.remove(id);
        let wanted = self.wants_what.remove(id).unwrap_or_default();
        for key in &wanted {
            if let Some(wanters) = self.who_wants.get_mut(key) {
                wanters.remove(id);
            }
        }
        debug_assert!(self.invariants_hold(), "remove_client left a redundant index pair out of sync");
        wanted
    }

    #[must_use]
    pub fn client_ids(&self) -> Vec<ClientId> {
        self.clients.keys().cloned().collect()
    }

    /// Bumps and returns this client's generation counter; used by the
    /// `update-graph` handler to build priorities for the submitted batch
    /// (spec supplement: priority is `(client generation, submission index)`).
    pub fn next_generation(&mut self, client: &ClientId) -> i64 {
        let counter = self.client_generation.entry(client.clone()).or_insert(0);
        let generation = *counter;
        *counter += 1;
        generation
    }

    // -- workers -----------------------------------------------------------

    pub fn add_worker(&mut self, addr: WorkerAddr, hostname: String, ncores: u32) {
        self.workers
            .entry(addr.clone())
            .or_insert_with(|| Worker::new(addr.clone(), hostname, ncores));
        self.processing.entry(addr.clone()).or_default();
        self.has_what.entry(addr.clone()).or_default();
        self.stacks.entry(addr.clone()).or_default();
        self.last_heartbeat.insert(addr, Instant::now());
        debug_assert!(self.invariants_hold(), "add_worker left a redundant index pair out of sync");
    }

    /// Records that `worker` is still alive (spec §5 "Timeouts"). A no-op
    /// for an address the store doesn't know about.
    pub fn record_heartbeat(&mut self, worker: &WorkerAddr, at: Instant) {
        if self.workers.contains_key(worker) {
            self.last_heartbeat.insert(worker.clone(), at);
        }
    }

    /// Workers whose last heartbeat is older than `timeout`, as of `now`.
    #[must_use]
    pub fn stale_workers(&self, now: Instant, timeout: Duration) -> Vec<WorkerAddr> {
        self.last_heartbeat
            .iter()
            .filter(|(_, &last)| now.saturating_duration_since(last) > timeout)
            .map(|(addr, _)| addr.clone())
            .collect()
    }

    /// Removes a worker and unwinds every index it participated in. Returns
    /// the tasks it had `processing` (with their expected cost) and the keys
    /// it held in memory, so the failure manager can re-dispatch / recover
    /// them without the store needing to know about transition policy.
    pub fn remove_worker(
        &mut self,
        addr: &WorkerAddr,
    ) -> (BTreeMap<TaskKey, u64>, BTreeSet<TaskKey>) {
        self.workers.remove(addr);
        self.stacks.remove(addr);
        self.last_heartbeat.remove(addr);

        let processing = self.processing.remove(addr).unwrap_or_default();
        for key in processing.keys() {
            if let Some(workers) = self.rprocessing.get_mut(key) {
                workers.remove(addr);
                if workers.is_empty() {
                    self.rprocessing.remove(key);
                }
            }
        }

        let held = self.has_what.remove(addr).unwrap_or_default();
        for key in &held {
            if let Some(holders) = self.who_has.get_mut(key) {
                holders.remove(addr);
                if holders.is_empty() {
                    self.who_has.remove(key);
                }
            }
        }

        debug_assert!(self.invariants_hold(), "remove_worker left a redundant index pair out of sync");
        (processing, held)
    }

    #[must_use]
    pub fn worker_ids(&self) -> Vec<WorkerAddr> {
        self.workers.keys().cloned().collect()
    }

    #[must_use]
    pub fn worker(&self, addr: &WorkerAddr) -> Option<&Worker> {
        self.workers.get(addr)
    }

    #[must_use]
    pub fn occupancy(&self, addr: &WorkerAddr) -> u64 {
        self.processing
            .get(addr)
            .map(|m| m.values().sum())
            .unwrap_or(0)
    }

    /// Number of tasks currently `processing` on `addr` (spec §4.3's
    /// overbook limit is measured in task count, not cost).
    #[must_use]
    pub fn processing_count(&self, addr: &WorkerAddr) -> usize {
        self.processing.get(addr).map(BTreeMap::len).unwrap_or(0)
    }

    // -- tasks ---------------------------------------------------------

    /// Registers a new task and its static DAG edges. `waiting[key]` is
    /// computed from the set of dependencies not yet in `memory`; the
    /// caller (the `update-graph` handler in `machine`) is responsible for
    /// routing the task to `ready`/`stacks` if `waiting[key]` comes back
    /// empty.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::DuplicateTask`] if `key` is already known.
    pub fn add_task(
        &mut self,
        key: TaskKey,
        payload: Vec<u8>,
        deps: BTreeSet<TaskKey>,
        priority: Priority,
        restrictions: Restrictions,
        wanting_client: Option<ClientId>,
    ) -> SchedulerResult<BTreeSet<TaskKey>> {
        if self.tasks.contains_key(&key) {
            return Err(SchedulerError::DuplicateTask(key));
        }

        for dep in &deps {
            self.dependents.entry(dep.clone()).or_default().insert(key.clone());
        }
        self.dependencies.insert(key.clone(), deps.clone());

        let pending: BTreeSet<TaskKey> = deps
            .iter()
            .filter(|d| !matches!(self.task_state(d), Some(TaskState::Memory)))
            .cloned()
            .collect();
        for dep in &pending {
            self.waiting_data.entry(dep.clone()).or_default().insert(key.clone());
        }
        self.waiting.insert(key.clone(), pending.clone());

        let task = Task::new(key.clone(), payload, priority, restrictions);
        self.tasks.insert(key.clone(), task);

        if let Some(client) = wanting_client {
            self.who_wants.entry(key.clone()).or_default().insert(client.clone());
            self.wants_what.entry(client).or_default().insert(key.clone());
        }

        debug!("added task {} with {} pending deps", key, pending.len());
        debug_assert!(self.invariants_hold(), "add_task left a redundant index pair out of sync");
        Ok(pending)
    }

    /// Removes a task entirely. Legal only when it is `released`, `erred`,
    /// or `memory` with no holders (spec §4.1).
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::UnknownTask`] if absent, or
    /// [`SchedulerError::TaskStillLive`] if the preconditions aren't met.
    pub fn remove_task(&mut self, key: &TaskKey) -> SchedulerResult<()> {
        let state = self.task_state(key).ok_or_else(|| SchedulerError::UnknownTask(key.clone()))?;
        if !state.is_terminal_for_release() {
            return Err(SchedulerError::TaskStillLive(key.clone()));
        }
        if state == TaskState::Memory && !self.who_has.get(key).map(BTreeSet::is_empty).unwrap_or(true) {
            return Err(SchedulerError::TaskStillLive(key.clone()));
        }

        self.tasks.remove(key);
        self.dependencies.remove(key);
        self.dependents.remove(key);
        self.waiting.remove(key);
        self.waiting_data.remove(key);
        self.who_has.remove(key);
        self.rprocessing.remove(key);
        self.who_wants.remove(key);
        self.unrunnable.remove(key);
        info!("removed task {}", key);
        debug_assert!(self.invariants_hold(), "remove_task left a redundant index pair out of sync");
        Ok(())
    }

    #[must_use]
    pub fn task(&self, key: &TaskKey) -> Option<&Task> {
        self.tasks.get(key)
    }

    pub fn task_mut(&mut self, key: &TaskKey) -> Option<&mut Task> {
        self.tasks.get_mut(key)
    }

    #[must_use]
    pub fn task_state(&self, key: &TaskKey) -> Option<TaskState> {
        self.tasks.get(key).map(|t| t.state)
    }

    #[must_use]
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    #[must_use]
    pub fn dependencies_of(&self, key: &TaskKey) -> BTreeSet<TaskKey> {
        self.dependencies.get(key).cloned().unwrap_or_default()
    }

    #[must_use]
    pub fn dependents_of(&self, key: &TaskKey) -> BTreeSet<TaskKey> {
        self.dependents.get(key).cloned().unwrap_or_default()
    }

    #[must_use]
    pub fn desired_by(&self, key: &TaskKey) -> BTreeSet<ClientId> {
        self.who_wants.get(key).cloned().unwrap_or_default()
    }

    #[must_use]
    pub fn replicas(&self, key: &TaskKey) -> BTreeSet<WorkerAddr> {
        self.who_has.get(key).cloned().unwrap_or_default()
    }

    pub fn add_interest(&mut self, key: &TaskKey, client: ClientId) {
        self.who_wants.entry(key.clone()).or_default().insert(client.clone());
        self.wants_what.entry(client).or_default().insert(key.clone());
        debug_assert!(self.invariants_hold(), "add_interest left a redundant index pair out of sync");
    }

    /// Removes a client's interest in a key. Returns `true` if no one wants
    /// it and nothing depends on it any more (eligible for release, per
    /// invariant 6).
    pub fn remove_interest(&mut self, key: &TaskKey, client: &ClientId) -> bool {
        if let Some(wanters) = self.who_wants.get_mut(key) {
            wanters.remove(client);
            if wanters.is_empty() {
                self.who_wants.remove(key);
            }
        }
        if let Some(wanted) = self.wants_what.get_mut(client) {
            wanted.remove(key);
        }
        debug_assert!(self.invariants_hold(), "remove_interest left a redundant index pair out of sync");
        self.is_releasable(key)
    }

    #[must_use]
    pub fn is_releasable(&self, key: &TaskKey) -> bool {
        let no_wants = self.who_wants.get(key).map(BTreeSet::is_empty).unwrap_or(true);
        let no_waiters = self.waiting_data.get(key).map(BTreeSet::is_empty).unwrap_or(true);
        no_wants && no_waiters
    }

    // -- data residency ---------------------------------------------------

    pub fn record_memory(&mut self, key: &TaskKey, worker: &WorkerAddr, nbytes: u64) {
        self.who_has.entry(key.clone()).or_default().insert(worker.clone());
        self.has_what.entry(worker.clone()).or_default().insert(key.clone());
        if let Some(task) = self.tasks.get_mut(key) {
            task.state = TaskState::Memory;
            task.nbytes = Some(nbytes);
        }
        debug_assert!(self.invariants_hold(), "record_memory left a redundant index pair out of sync");
    }

    pub fn drop_replica(&mut self, key: &TaskKey, worker: &WorkerAddr) {
        if let Some(holders) = self.who_has.get_mut(key) {
            holders.remove(worker);
            if holders.is_empty() {
                self.who_has.remove(key);
            }
        }
        if let Some(held) = self.has_what.get_mut(worker) {
            held.remove(key);
        }
        debug_assert!(self.invariants_hold(), "drop_replica left a redundant index pair out of sync");
    }

    pub fn record_processing(&mut self, key: &TaskKey, worker: &WorkerAddr, cost: u64) {
        self.processing.entry(worker.clone()).or_default().insert(key.clone(), cost);
        self.rprocessing.entry(key.clone()).or_default().insert(worker.clone());
        if let Some(w) = self.workers.get_mut(worker) {
            w.occupancy_cost += cost;
        }
        if let Some(task) = self.tasks.get_mut(key) {
            task.state = TaskState::Processing;
        }
        debug_assert!(self.invariants_hold(), "record_processing left a redundant index pair out of sync");
    }

    pub fn clear_processing(&mut self, key: &TaskKey, worker: &WorkerAddr) -> Option<u64> {
        let cost = self.processing.get_mut(worker).and_then(|m| m.remove(key));
        if let Some(rp) = self.rprocessing.get_mut(key) {
            rp.remove(worker);
            if rp.is_empty() {
                self.rprocessing.remove(key);
            }
        }
        if let (Some(cost), Some(w)) = (cost, self.workers.get_mut(worker)) {
            w.occupancy_cost = w.occupancy_cost.saturating_sub(cost);
        }
        debug_assert!(self.invariants_hold(), "clear_processing left a redundant index pair out of sync");
        cost
    }

    pub fn record_released(&mut self, key: &TaskKey) {
        if let Some(task) = self.tasks.get_mut(key) {
            task.state = TaskState::Released;
        }
    }

    pub fn record_erred(&mut self, key: &TaskKey, exception: String, traceback: String) {
        if let Some(task) = self.tasks.get_mut(key) {
            task.state = TaskState::Erred;
            task.exception = Some(exception);
            task.traceback = Some(traceback);
        }
    }

    // -- dispatch queues ---------------------------------------------------

    pub fn push_ready(&mut self, key: TaskKey) {
        if let Some(task) = self.tasks.get_mut(&key) {
            task.state = TaskState::Ready;
        }
        self.ready.push_back(key);
    }

    pub fn push_stack(&mut self, worker: &WorkerAddr, key: TaskKey) {
        if let Some(task) = self.tasks.get_mut(&key) {
            task.state = TaskState::Stacks;
        }
        self.stacks.entry(worker.clone()).or_default().push(key);
    }

    pub fn pop_stack(&mut self, worker: &WorkerAddr) -> Option<TaskKey> {
        self.stacks.get_mut(worker).and_then(Vec::pop)
    }

    pub fn pop_ready(&mut self) -> Option<TaskKey> {
        self.ready.pop_front()
    }

    pub fn mark_unrunnable(&mut self, key: TaskKey) {
        if let Some(task) = self.tasks.get_mut(&key) {
            task.state = TaskState::NoWorker;
        }
        self.unrunnable.insert(key);
    }

    pub fn unmark_unrunnable(&mut self, key: &TaskKey) -> bool {
        self.unrunnable.remove(key)
    }

    #[must_use]
    pub fn unrunnable_tasks(&self) -> Vec<TaskKey> {
        self.unrunnable.iter().cloned().collect()
    }

    /// Debug-only consistency check across every redundant index pair
    /// (module doc, invariants I1-I4). Always compiled, only invoked from
    /// `debug_assert!` call sites so it costs nothing in release builds.
    #[must_use]
    pub fn invariants_hold(&self) -> bool {
        for (dep, dependents) in &self.dependents {
            for d in dependents {
                if !self.dependencies.get(d).map(|s| s.contains(dep)).unwrap_or(false) {
                    return false;
                }
            }
        }
        for (key, deps) in &self.dependencies {
            for dep in deps {
                if !self.dependents.get(dep).map(|s| s.contains(key)).unwrap_or(false) {
                    return false;
                }
            }
        }
        for (key, holders) in &self.who_has {
            for w in holders {
                if !self.has_what.get(w).map(|s| s.contains(key)).unwrap_or(false) {
                    return false;
                }
            }
        }
        for (worker, keys) in &self.has_what {
            for k in keys {
                if !self.who_has.get(k).map(|s| s.contains(worker)).unwrap_or(false) {
                    return false;
                }
            }
        }
        for (worker, tasks) in &self.processing {
            for k in tasks.keys() {
                if !self.rprocessing.get(k).map(|s| s.contains(worker)).unwrap_or(false) {
                    return false;
                }
            }
        }
        for (key, workers) in &self.rprocessing {
            for w in workers {
                if !self.processing.get(w).map(|m| m.contains_key(key)).unwrap_or(false) {
                    return false;
                }
            }
        }
        for (key, clients) in &self.who_wants {
            for c in clients {
                if !self.wants_what.get(c).map(|s| s.contains(key)).unwrap_or(false) {
                    return false;
                }
            }
        }
        for (client, keys) in &self.wants_what {
            for k in keys {
                if !self.who_wants.get(k).map(|s| s.contains(client)).unwrap_or(false) {
                    return false;
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> TaskKey {
        TaskKey::from(s)
    }

    #[test]
    fn add_task_with_no_deps_returns_empty_waiting_set() {
        let mut store = StateStore::new();
        let pending = store
            .add_task(key("a"), vec![], BTreeSet::new(), Priority::new(0, 0), Restrictions::none(), None)
            .unwrap();
        assert!(pending.is_empty());
        assert_eq!(store.task_state(&key("a")), Some(TaskState::Waiting));
    }

    #[test]
    fn add_task_populates_dependents_reverse_index() {
        let mut store = StateStore::new();
        store
            .add_task(key("a"), vec![], BTreeSet::new(), Priority::new(0, 0), Restrictions::none(), None)
            .unwrap();
        let deps = BTreeSet::from([key("a")]);
        store
            .add_task(key("b"), vec![], deps, Priority::new(0, 1), Restrictions::none(), None)
            .unwrap();

        assert_eq!(store.dependents_of(&key("a")), BTreeSet::from([key("b")]));
        assert_eq!(store.dependencies_of(&key("b")), BTreeSet::from([key("a")]));
    }

    #[test]
    fn duplicate_task_is_rejected() {
        let mut store = StateStore::new();
        store
            .add_task(key("a"), vec![], BTreeSet::new(), Priority::new(0, 0), Restrictions::none(), None)
            .unwrap();
        let result = store.add_task(key("a"), vec![], BTreeSet::new(), Priority::new(0, 1), Restrictions::none(), None);
        assert!(matches!(result, Err(SchedulerError::DuplicateTask(_))));
    }

    #[test]
    fn record_memory_keeps_who_has_and_has_what_in_lockstep() {
        let mut store = StateStore::new();
        store.add_worker(WorkerAddr::from("w1"), "host1".into(), 4);
        store
            .add_task(key("a"), vec![], BTreeSet::new(), Priority::new(0, 0), Restrictions::none(), None)
            .unwrap();

        store.record_memory(&key("a"), &WorkerAddr::from("w1"), 128);

        assert_eq!(store.replicas(&key("a")), BTreeSet::from([WorkerAddr::from("w1")]));
        assert!(store.has_what[&WorkerAddr::from("w1")].contains(&key("a")));
    }

    #[test]
    fn remove_worker_unwinds_processing_and_replicas() {
        let mut store = StateStore::new();
        let w1 = WorkerAddr::from("w1");
        store.add_worker(w1.clone(), "host1".into(), 4);
        store
            .add_task(key("a"), vec![], BTreeSet::new(), Priority::new(0, 0), Restrictions::none(), None)
            .unwrap();
        store.record_processing(&key("a"), &w1, 10);
        store.record_memory(&key("b").clone(), &w1, 5);

        let (processing, held) = store.remove_worker(&w1);
        assert_eq!(processing.get(&key("a")), Some(&10));
        assert!(held.contains(&key("b")));
        assert!(store.who_has.get(&key("b")).is_none());
        assert!(store.rprocessing.get(&key("a")).is_none());
    }

    #[test]
    fn releasable_requires_no_wants_and_no_waiters() {
        let mut store = StateStore::new();
        store
            .add_task(key("a"), vec![], BTreeSet::new(), Priority::new(0, 0), Restrictions::none(), Some(ClientId::from("c1")))
            .unwrap();
        assert!(!store.is_releasable(&key("a")));

        let releasable = store.remove_interest(&key("a"), &ClientId::from("c1"));
        assert!(releasable);
    }
}
