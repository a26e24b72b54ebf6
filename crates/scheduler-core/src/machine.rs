//! Task state machine: the transition table from spec §4.2, plus the
//! blame-propagation and release logic that several transitions share.
//!
//! Every function here either completes all of a transition's side effects
//! or (on an early `Err`) leaves the store exactly as it found it — no
//! partial updates escape a handler (spec §4.2 "Invariant on transitions").

use std::collections::{BTreeSet, VecDeque};

use scheduler_trace::{debug, info, warn};

use crate::dispatcher::Dispatcher;
use crate::ids::{ClientId, TaskKey, WorkerAddr};
use crate::messages::{ClientMessage, Outbound, WorkerMessage};
use crate::store::StateStore;
use crate::task::TaskState;

/// Runs `add_task` for one submission and, if it became immediately ready,
/// routes it through the dispatcher. Returns the outbound messages, if any
/// (there are none for `update-graph` itself; dispatch to a worker happens
/// on the worker's next free-slot pull, spec §4.3.1).
pub fn on_task_added(store: &mut StateStore, dispatcher: &Dispatcher, key: TaskKey) {
    if store.task_state(&key) != Some(TaskState::Waiting) {
        return;
    }
    if store.waiting.get(&key).map(BTreeSet::is_empty).unwrap_or(true) {
        dispatcher.route_ready_task(store, key);
    }
}

/// Tries to satisfy a worker's free slot, returning the `compute-task`
/// outbound message if one was assigned (spec §4.3.1, transition
/// waiting→processing).
pub fn try_dispatch_to_worker(
    store: &mut StateStore,
    dispatcher: &Dispatcher,
    worker: &WorkerAddr,
) -> Option<Outbound> {
    let key = dispatcher.next_for_worker(store, worker)?;
    Some(assign(store, worker, key))
}

fn assign(store: &mut StateStore, worker: &WorkerAddr, key: TaskKey) -> Outbound {
    let task = store.task(&key).expect("dispatch target must exist");
    let priority = task.priority;
    let payload = task.payload.clone();
    let deps = store.dependencies_of(&key);
    let who_has: Vec<(TaskKey, Vec<WorkerAddr>)> = deps
        .iter()
        .map(|d| (d.clone(), store.replicas(d).into_iter().collect()))
        .collect();

    let cost = estimate_cost(&who_has);
    store.record_processing(&key, worker, cost);
    debug!("assigned {} to {}", key, worker);

    Outbound::ToWorker(
        worker.clone(),
        WorkerMessage::ComputeTask {
            key,
            payload,
            who_has,
            priority,
        },
    )
}

/// Placeholder compute-cost estimate until the worker reports a real one:
/// proportional to how much data it will need to fetch. Tasks with all
/// dependencies already local cost 1 unit so `occupancy` still orders
/// workers sensibly.
fn estimate_cost(who_has: &[(TaskKey, Vec<WorkerAddr>)]) -> u64 {
    1 + who_has.iter().filter(|(_, workers)| workers.is_empty()).count() as u64
}

/// `task-finished`: processing → memory (spec §4.2 row 4).
pub fn on_task_finished(
    store: &mut StateStore,
    dispatcher: &Dispatcher,
    worker: &WorkerAddr,
    key: &TaskKey,
    nbytes: u64,
) -> Vec<Outbound> {
    let mut outbound = Vec::new();

    if store.clear_processing(key, worker).is_none() {
        warn!("task-finished for {} from {}, but it was not processing there", key, worker);
        return outbound;
    }
    store.record_memory(key, worker, nbytes);
    info!("{} finished on {} ({} bytes)", key, worker, nbytes);

    for dependent in store.dependents_of(key) {
        let became_ready = if let Some(waiting) = store.waiting.get_mut(&dependent) {
            waiting.remove(key);
            waiting.is_empty()
        } else {
            false
        };
        if became_ready && store.task_state(&dependent) == Some(TaskState::Waiting) {
            dispatcher.route_ready_task(store, dependent);
        }
    }

    for dependency in store.dependencies_of(key) {
        if let Some(waiters) = store.waiting_data.get_mut(&dependency) {
            waiters.remove(key);
        }
        let empty_waiters = store.waiting_data.get(&dependency).map(BTreeSet::is_empty).unwrap_or(true);
        if empty_waiters && store.is_releasable(&dependency) {
            release(store, &dependency, &mut outbound);
        }
    }

    for client in store.desired_by(key) {
        outbound.push(Outbound::ToClient(client, ClientMessage::KeyDone { key: key.clone() }));
    }

    outbound
}

/// `task-failed`: processing → erred, with blame propagated through every
/// transitive dependent (spec §4.2 row 5, §4.5 "Task failure").
pub fn on_task_failed(
    store: &mut StateStore,
    worker: &WorkerAddr,
    key: &TaskKey,
    exception: String,
    traceback: String,
) -> Vec<Outbound> {
    let mut outbound = Vec::new();
    store.clear_processing(key, worker);
    store.record_erred(key, exception.clone(), traceback.clone());
    warn!("{} failed on {}: {}", key, worker, exception);

    blame_dependents(store, key, key, &mut outbound);

    for client in store.desired_by(key) {
        outbound.push(Outbound::ToClient(
            client,
            ClientMessage::KeyErred {
                key: key.clone(),
                blame: key.clone(),
                exception: exception.clone(),
                traceback: traceback.clone(),
            },
        ));
    }

    outbound
}

/// BFS over `dependents` marking every reachable task `erred` with
/// `exceptions_blame` set to the original root. Touches only the affected
/// subgraph (spec I6).
fn blame_dependents(store: &mut StateStore, root: &TaskKey, failed: &TaskKey, outbound: &mut Vec<Outbound>) {
    let mut queue: VecDeque<TaskKey> = store.dependents_of(failed).into_iter().collect();
    let mut seen: BTreeSet<TaskKey> = BTreeSet::new();

    while let Some(dependent) = queue.pop_front() {
        if !seen.insert(dependent.clone()) {
            continue;
        }
        if store.task_state(&dependent) == Some(TaskState::Erred) {
            continue;
        }

        store.record_erred(&dependent, String::new(), String::new());
        if let Some(task) = store.task_mut(&dependent) {
            task.exception_blame = Some(root.clone());
        }

        for client in store.desired_by(&dependent) {
            outbound.push(Outbound::ToClient(
                client,
                ClientMessage::KeyErred {
                    key: dependent.clone(),
                    blame: root.clone(),
                    exception: String::new(),
                    traceback: String::new(),
                },
            ));
        }

        for next in store.dependents_of(&dependent) {
            queue.push_back(next);
        }
    }
}

/// memory/waiting → released, once `waiting_data` and `who_wants` are both
/// empty (spec §4.2 row 7, invariant 6). Asks every replica holder to drop
/// the key; that ask is best-effort and not modeled as a blocking
/// round-trip here (the worker applies it on its own schedule).
pub fn release(store: &mut StateStore, key: &TaskKey, outbound: &mut Vec<Outbound>) {
    if store.task_state(key) == Some(TaskState::Processing) {
        for worker in store.rprocessing.get(key).cloned().unwrap_or_default() {
            store.clear_processing(key, &worker);
            outbound.push(Outbound::ToWorker(worker, WorkerMessage::Release { key: key.clone() }));
        }
    }

    for worker in store.replicas(key) {
        store.drop_replica(key, &worker);
        outbound.push(Outbound::ToWorker(worker, WorkerMessage::Release { key: key.clone() }));
    }

    store.record_released(key);
    debug!("released {}", key);
}

/// `client-releases-keys`: drop interest, release any key that becomes
/// eligible, and cascade to dependencies that lose their last waiter
/// (spec §4.2 row 8, §5 "Cancellation").
pub fn on_client_releases_keys(
    store: &mut StateStore,
    client: &ClientId,
    keys: &BTreeSet<TaskKey>,
) -> Vec<Outbound> {
    let mut outbound = Vec::new();
    let mut frontier: VecDeque<TaskKey> = VecDeque::new();

    for key in keys {
        if store.remove_interest(key, client) {
            frontier.push_back(key.clone());
        }
    }

    while let Some(key) = frontier.pop_front() {
        if !store.is_releasable(&key) {
            continue;
        }
        if matches!(store.task_state(&key), Some(TaskState::Released) | None) {
            continue;
        }

        let deps = store.dependencies_of(&key);
        release(store, &key, &mut outbound);

        for dep in deps {
            if let Some(waiters) = store.waiting_data.get_mut(&dep) {
                waiters.remove(&key);
            }
            if store.is_releasable(&dep) {
                frontier.push_back(dep);
            }
        }
    }

    outbound
}

/// `remove-client`: equivalent to releasing every key the client wanted.
pub fn on_remove_client(store: &mut StateStore, client: &ClientId) -> Vec<Outbound> {
    let wanted = store.remove_client(client);
    on_client_releases_keys(store, client, &wanted)
}

/// `add-worker`: registers the worker and, if any `unrunnable` task now
/// satisfies its restrictions (or the cluster was simply empty before),
/// retries placing it (spec §4.2 row 3).
pub fn on_worker_added(
    store: &mut StateStore,
    dispatcher: &Dispatcher,
    addr: WorkerAddr,
    hostname: String,
    ncores: u32,
) {
    store.add_worker(addr.clone(), hostname, ncores);
    info!("worker {} joined", addr);

    let candidates = store.unrunnable_tasks();
    for key in candidates {
        let satisfied = store
            .task(&key)
            .map(|t| t.restrictions.is_empty() || t.restrictions.satisfied_by(&store.worker(&addr).unwrap().hostname))
            .unwrap_or(false);
        if satisfied {
            store.unmark_unrunnable(&key);
            if let Some(task) = store.task_mut(&key) {
                task.state = TaskState::Waiting;
            }
            dispatcher.route_ready_task(store, key);
        }
    }
}
