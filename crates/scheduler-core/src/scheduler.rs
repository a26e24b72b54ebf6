//! Top-level scheduler: owns the store and dispatcher, and is the single
//! entry point stimuli flow through (spec §5). Nothing outside this module
//! ever needs a `&mut StateStore` directly.

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use scheduler_trace::{debug, info, warn};

use crate::dispatcher::Dispatcher;
use crate::error::{SchedulerError, SchedulerResult};
use crate::failure;
use crate::ids::{ClientId, Priority, TaskKey, WorkerAddr};
use crate::machine;
use crate::messages::{Message, Outbound, TaskSubmission};
use crate::store::StateStore;
use crate::task::TaskState;

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub suspicion_limit: u32,
    pub assumed_bandwidth_bytes_per_sec: u64,
    /// Max concurrent `processing` tasks per worker, independent of its
    /// reported `ncores` (spec §4.3; config key `worker_overbook_limit`).
    pub worker_overbook_limit: usize,
    /// Missed heartbeats tolerated before a worker is treated as lost (spec
    /// §5 "Timeouts"; config key `heartbeat_miss_limit`).
    pub heartbeat_miss_limit: u32,
    /// Expected spacing between a worker's heartbeats, in milliseconds; the
    /// timeout checked by [`Scheduler::check_heartbeat_timeouts`] is
    /// `heartbeat_interval_ms * heartbeat_miss_limit` (config key
    /// `heartbeat_interval_ms`).
    pub heartbeat_interval_ms: u64,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            suspicion_limit: 3,
            assumed_bandwidth_bytes_per_sec: 100_000_000,
            worker_overbook_limit: 128,
            heartbeat_miss_limit: 5,
            heartbeat_interval_ms: 1000,
        }
    }
}

/// Owns the whole of the scheduler's mutable state. Every public method
/// here corresponds to one stimulus handler from spec §4.4 and runs to
/// completion before returning - there is no interior suspension point.
#[derive(Debug)]
pub struct Scheduler {
    store: StateStore,
    dispatcher: Dispatcher,
    suspicion_limit: u32,
    heartbeat_miss_limit: u32,
    heartbeat_interval_ms: u64,
}

impl Scheduler {
    #[must_use]
    pub fn new(options: SchedulerOptions) -> Self {
        Self {
            store: StateStore::new(),
            dispatcher: Dispatcher::with_default_policy(
                options.assumed_bandwidth_bytes_per_sec,
                options.worker_overbook_limit,
            ),
            suspicion_limit: options.suspicion_limit,
            heartbeat_miss_limit: options.heartbeat_miss_limit,
            heartbeat_interval_ms: options.heartbeat_interval_ms,
        }
    }

    #[must_use]
    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Applies a stimulus-batch in order, each message to completion,
    /// accumulating outbound messages across the whole batch (spec §5
    /// "handlers must tolerate receiving a list of messages").
    pub fn apply_batch(&mut self, batch: Vec<Message>) -> Vec<Outbound> {
        let mut outbound = Vec::new();
        for message in batch {
            outbound.extend(self.handle_message(message));
        }
        outbound
    }

    /// Handles one stimulus and, before returning, drains every free worker
    /// slot the handler's own effects may have unblocked (spec §4.3.1's
    /// worker-pull must follow every ready-making event, not just the ones a
    /// caller happens to re-poll for).
    pub fn handle_message(&mut self, message: Message) -> Vec<Outbound> {
        let mut outbound = match message {
            Message::UpdateGraph { client, tasks, keys_wanted } => {
                self.on_update_graph(client, tasks, keys_wanted)
            }
            Message::TaskFinished { worker, key, nbytes } => {
                machine::on_task_finished(&mut self.store, &self.dispatcher, &worker, &key, nbytes)
            }
            Message::TaskFailed { worker, key, exception, traceback } => {
                machine::on_task_failed(&mut self.store, &worker, &key, exception, traceback)
            }
            Message::AddWorker { address, hostname, ncores } => {
                machine::on_worker_added(&mut self.store, &self.dispatcher, address, hostname, ncores);
                Vec::new()
            }
            Message::RemoveWorker { address } => {
                failure::on_worker_lost(&mut self.store, &self.dispatcher, self.suspicion_limit, &address)
            }
            Message::ClientReleasesKeys { client, keys } => {
                machine::on_client_releases_keys(&mut self.store, &client, &keys)
            }
            Message::AddClient { client } => {
                self.store.add_client(client);
                Vec::new()
            }
            Message::RemoveClient { client } => machine::on_remove_client(&mut self.store, &client),
            Message::AddKeys { worker, keys } => self.on_add_keys(&worker, &keys),
            Message::MissingData { worker, key } => self.on_missing_data(&worker, &key),
            Message::Heartbeat { worker } => {
                debug!("heartbeat from {}", worker);
                self.store.record_heartbeat(&worker, Instant::now());
                Vec::new()
            }
        };
        outbound.extend(self.dispatch_all());
        outbound
    }

    /// Evicts any worker whose last heartbeat predates `now` by more than
    /// `heartbeat_interval_ms * heartbeat_miss_limit` (spec §5 "Timeouts"),
    /// through the same path an explicit `remove-worker` takes.
    pub fn check_heartbeat_timeouts(&mut self, now: Instant) -> Vec<Outbound> {
        let timeout = Duration::from_millis(self.heartbeat_interval_ms * u64::from(self.heartbeat_miss_limit));
        let mut outbound = Vec::new();
        for worker in self.store.stale_workers(now, timeout) {
            warn!("worker {} missed {} heartbeat(s); treating as lost", worker, self.heartbeat_miss_limit);
            outbound.extend(failure::on_worker_lost(
                &mut self.store,
                &self.dispatcher,
                self.suspicion_limit,
                &worker,
            ));
        }
        outbound.extend(self.dispatch_all());
        outbound
    }

    /// Surfaces [`StateStore::invariants_hold`] as a recoverable error for
    /// callers outside debug builds (where `debug_assert!` doesn't run).
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::InvariantViolation`] if any redundant index
    /// pair has gone out of sync.
    pub fn check_invariants(&self) -> SchedulerResult<()> {
        if self.store.invariants_hold() {
            Ok(())
        } else {
            Err(SchedulerError::InvariantViolation(
                "a redundant index pair is out of sync".to_string(),
            ))
        }
    }

    fn on_update_graph(
        &mut self,
        client: ClientId,
        tasks: Vec<TaskSubmission>,
        keys_wanted: BTreeSet<TaskKey>,
    ) -> Vec<Outbound> {
        self.store.add_client(client.clone());

        if let Some(cyclic) = find_cycle(&tasks, &self.store) {
            let err = SchedulerError::CyclicGraph(cyclic);
            warn!("rejected update-graph from {}: {}", client, err);
            return Vec::new();
        }

        let generation = self.store.next_generation(&client);
        info!("update-graph from {}: {} task(s)", client, tasks.len());

        for (index, submission) in tasks.into_iter().enumerate() {
            if self.store.task(&submission.key).is_some() {
                // Idempotent resubmission (spec §8 law): the task already
                // exists, only its wantedness might change below.
                continue;
            }
            let priority = Priority::new(generation, index as i64);
            let wanting_client = keys_wanted.contains(&submission.key).then(|| client.clone());
            match self.store.add_task(
                submission.key.clone(),
                submission.payload,
                submission.dependencies,
                priority,
                submission.restrictions,
                wanting_client,
            ) {
                Ok(_) => machine::on_task_added(&mut self.store, &self.dispatcher, submission.key),
                Err(err) => warn!("rejected task in update-graph: {}", err),
            }
        }

        for key in &keys_wanted {
            if self.store.task(key).is_some() {
                self.store.add_interest(key, client.clone());
            }
        }

        Vec::new()
    }

    fn on_add_keys(&mut self, worker: &WorkerAddr, keys: &BTreeSet<TaskKey>) -> Vec<Outbound> {
        let mut outbound = Vec::new();
        for key in keys {
            let Some(nbytes) = self.store.task(key).and_then(|t| t.nbytes) else {
                continue;
            };
            self.store.record_memory(key, worker, nbytes);
            for dependent in self.store.dependents_of(key) {
                let became_ready = if let Some(waiting) = self.store.waiting.get_mut(&dependent) {
                    waiting.remove(key);
                    waiting.is_empty()
                } else {
                    false
                };
                if became_ready && self.store.task_state(&dependent) == Some(TaskState::Waiting) {
                    self.dispatcher.route_ready_task(&mut self.store, dependent);
                }
            }
        }
        outbound.extend(self.maybe_steal());
        outbound
    }

    fn on_missing_data(&mut self, worker: &WorkerAddr, key: &TaskKey) -> Vec<Outbound> {
        warn!("worker {} reports missing data for {}", worker, key);
        self.store.drop_replica(key, worker);
        if self.store.replicas(key).is_empty() && self.store.task_state(key) == Some(TaskState::Memory) {
            let mut visited = BTreeSet::new();
            let mut outbound = Vec::new();
            failure::ensure_recoverable(&mut self.store, &self.dispatcher, key, &mut visited, &mut outbound);
            return outbound;
        }
        Vec::new()
    }

    /// Worker-pull (spec §4.3.1): this worker just freed a slot, give it
    /// its single next task, if any. O(1).
    pub fn drain_free_slots(&mut self, worker: &WorkerAddr) -> Vec<Outbound> {
        machine::try_dispatch_to_worker(&mut self.store, &self.dispatcher, worker)
            .into_iter()
            .collect()
    }

    /// Round-robins one free-slot pull per worker, repeating until nobody
    /// can take more work. Used after a batch that may have produced
    /// several newly-ready tasks at once (e.g. `update-graph`), so ready
    /// work spreads across idle workers instead of piling onto whichever
    /// worker is iterated first.
    pub fn dispatch_all(&mut self) -> Vec<Outbound> {
        let mut outbound = Vec::new();
        loop {
            let mut progressed = false;
            for worker in self.store.worker_ids() {
                if let Some(message) = machine::try_dispatch_to_worker(&mut self.store, &self.dispatcher, &worker) {
                    outbound.push(message);
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
        outbound
    }

    fn maybe_steal(&mut self) -> Vec<Outbound> {
        let mut outbound = Vec::new();
        if let Some((from, to, key)) = self.dispatcher.find_steal(&self.store) {
            if let Some(stack) = self.store.stacks.get_mut(&from) {
                stack.retain(|k| k != &key);
            }
            self.store.push_stack(&to, key);
            debug!("stole a task from {} to idle {}", from, to);
            outbound.extend(self.drain_free_slots(&to));
        }
        outbound
    }

    /// # Errors
    ///
    /// Returns [`SchedulerError::UnknownTask`] if `key` is unknown.
    pub fn task_state(&self, key: &TaskKey) -> SchedulerResult<TaskState> {
        self.store.task_state(key).ok_or_else(|| SchedulerError::UnknownTask(key.clone()))
    }
}

/// Looks for a dependency cycle among the tasks a single `update-graph`
/// batch is about to introduce (spec §9, invariant I5: cyclic graphs are
/// forbidden). Only tasks not yet in the store are considered: an
/// already-known task's edges were fixed by an earlier, already-accepted
/// batch, so it cannot participate in a cycle this batch newly creates -
/// this lets the check skip the whole existing graph and DFS only the
/// submitted one.
fn find_cycle(tasks: &[TaskSubmission], store: &StateStore) -> Option<TaskKey> {
    let mut deps_by_key: HashMap<TaskKey, BTreeSet<TaskKey>> = HashMap::new();
    for submission in tasks {
        if store.task(&submission.key).is_none() {
            deps_by_key.insert(submission.key.clone(), submission.dependencies.clone());
        }
    }

    enum Mark {
        Visiting,
        Done,
    }

    fn visit(
        key: &TaskKey,
        deps_by_key: &HashMap<TaskKey, BTreeSet<TaskKey>>,
        marks: &mut HashMap<TaskKey, Mark>,
    ) -> Option<TaskKey> {
        match marks.get(key) {
            Some(Mark::Done) => return None,
            Some(Mark::Visiting) => return Some(key.clone()),
            None => {}
        }
        let Some(deps) = deps_by_key.get(key) else {
            return None;
        };
        marks.insert(key.clone(), Mark::Visiting);
        for dep in deps {
            if let Some(cyclic) = visit(dep, deps_by_key, marks) {
                return Some(cyclic);
            }
        }
        marks.insert(key.clone(), Mark::Done);
        None
    }

    let mut marks: HashMap<TaskKey, Mark> = HashMap::new();
    let keys: Vec<TaskKey> = deps_by_key.keys().cloned().collect();
    for key in keys {
        if let Some(cyclic) = visit(&key, &deps_by_key, &mut marks) {
            return Some(cyclic);
        }
    }
    None
}
