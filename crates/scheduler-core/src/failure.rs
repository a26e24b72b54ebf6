//! Worker loss and blame propagation (spec §4.5).

use std::collections::BTreeSet;

use scheduler_trace::{info, warn};

use crate::dispatcher::Dispatcher;
use crate::ids::{TaskKey, WorkerAddr};
use crate::machine;
use crate::messages::{ClientMessage, Outbound};
use crate::store::StateStore;
use crate::task::TaskState;

/// `remove-worker`: unwinds everything the worker held, re-dispatches or
/// poisons in-flight tasks, and walks the dependency graph to recompute any
/// data that lost its last replica (spec §4.5).
pub fn on_worker_lost(
    store: &mut StateStore,
    dispatcher: &Dispatcher,
    suspicion_limit: u32,
    addr: &WorkerAddr,
) -> Vec<Outbound> {
    let mut outbound = Vec::new();
    let (processing, held) = store.remove_worker(addr);
    info!(
        "worker {} lost: {} in-flight task(s), {} replica(s)",
        addr,
        processing.len(),
        held.len()
    );

    for key in processing.keys() {
        reassign_or_poison(store, dispatcher, suspicion_limit, key, &mut outbound);
    }

    let mut visited: BTreeSet<TaskKey> = BTreeSet::new();
    for key in &held {
        if !store.replicas(key).is_empty() {
            continue;
        }
        let still_needed = !store.desired_by(key).is_empty() || !store.dependents_of(key).is_empty();
        if still_needed {
            ensure_recoverable(store, dispatcher, key, &mut visited, &mut outbound);
        }
    }

    outbound
}

fn reassign_or_poison(
    store: &mut StateStore,
    dispatcher: &Dispatcher,
    suspicion_limit: u32,
    key: &TaskKey,
    outbound: &mut Vec<Outbound>,
) {
    let Some(task) = store.task_mut(key) else {
        return;
    };
    task.suspicion_count += 1;
    let poisoned = task.suspicion_count >= suspicion_limit;

    if poisoned {
        warn!("{} hit suspicion limit ({}); erring permanently", key, suspicion_limit);
        let exception = format!("task involved in {suspicion_limit} worker failures; quarantined");
        store.record_erred(key, exception.clone(), String::new());
        for client in store.desired_by(key) {
            outbound.push(Outbound::ToClient(
                client,
                ClientMessage::KeyErred {
                    key: key.clone(),
                    blame: key.clone(),
                    exception: exception.clone(),
                    traceback: String::new(),
                },
            ));
        }
    } else {
        if let Some(task) = store.task_mut(key) {
            task.state = TaskState::Waiting;
        }
        dispatcher.route_ready_task(store, key.clone());
    }
}

/// Recursively ensures `key` can eventually be recomputed: if it still has a
/// surviving replica, nothing to do; otherwise walk its dependencies first
/// (recovering any of them that also lost their last replica), then mark
/// `key` `waiting` on whatever of its dependencies isn't already in memory.
/// Touches only the subgraph whose data was actually lost (spec's
/// "proportional to lost data" guarantee).
pub(crate) fn ensure_recoverable(
    store: &mut StateStore,
    dispatcher: &Dispatcher,
    key: &TaskKey,
    visited: &mut BTreeSet<TaskKey>,
    outbound: &mut Vec<Outbound>,
) {
    if !visited.insert(key.clone()) {
        return;
    }
    if !store.replicas(key).is_empty() {
        return;
    }
    if store.task_state(key) != Some(TaskState::Memory) {
        return;
    }

    let deps = store.dependencies_of(key);
    for dep in &deps {
        if store.replicas(dep).is_empty() && store.task_state(dep) == Some(TaskState::Memory) {
            ensure_recoverable(store, dispatcher, dep, visited, outbound);
        }
    }

    let pending: BTreeSet<TaskKey> = deps
        .iter()
        .filter(|d| store.task_state(d) != Some(TaskState::Memory))
        .cloned()
        .collect();
    for dep in &pending {
        store.waiting_data.entry(dep.clone()).or_default().insert(key.clone());
    }
    store.waiting.insert(key.clone(), pending.clone());
    if let Some(task) = store.task_mut(key) {
        task.state = TaskState::Waiting;
    }

    warn!("recomputing {}: lost its last replica", key);

    if pending.is_empty() {
        dispatcher.route_ready_task(store, key.clone());
    }
}

/// `task-failed` delegates straight to the task machine; re-exported here
/// so callers needing "something about task `k` went wrong" only import
/// `failure` for both worker and task failure handling.
pub use machine::on_task_failed;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{ClientId, Priority};
    use crate::machine::{on_task_added, try_dispatch_to_worker};
    use crate::task::Restrictions;

    fn key(s: &str) -> TaskKey {
        TaskKey::from(s)
    }

    fn setup() -> (StateStore, Dispatcher) {
        let mut store = StateStore::new();
        store.add_worker(WorkerAddr::from("w1"), "h1".into(), 4);
        store.add_worker(WorkerAddr::from("w2"), "h2".into(), 4);
        let dispatcher = Dispatcher::with_default_policy(1_000_000, usize::MAX);
        (store, dispatcher)
    }

    #[test]
    fn task_in_flight_on_lost_worker_is_redispatched_with_suspicion() {
        let (mut store, dispatcher) = setup();
        store
            .add_task(key("a"), vec![], Default::default(), Priority::new(0, 0), Restrictions::none(), Some(ClientId::from("c1")))
            .unwrap();
        on_task_added(&mut store, &dispatcher, key("a"));
        try_dispatch_to_worker(&mut store, &dispatcher, &WorkerAddr::from("w1")).unwrap();

        on_worker_lost(&mut store, &dispatcher, 3, &WorkerAddr::from("w1"));

        assert_eq!(store.task(&key("a")).unwrap().suspicion_count, 1);
        assert!(store.task_state(&key("a")).unwrap().is_dispatchable());
    }

    #[test]
    fn task_erred_after_hitting_suspicion_limit() {
        let (mut store, dispatcher) = setup();
        store
            .add_task(key("a"), vec![], Default::default(), Priority::new(0, 0), Restrictions::none(), Some(ClientId::from("c1")))
            .unwrap();

        for round in 0..3 {
            on_task_added(&mut store, &dispatcher, key("a"));
            try_dispatch_to_worker(&mut store, &dispatcher, &WorkerAddr::from("w1")).unwrap();
            let out = on_worker_lost(&mut store, &dispatcher, 3, &WorkerAddr::from("w1"));
            if round < 2 {
                assert!(store.task_state(&key("a")).unwrap().is_dispatchable());
                store.add_worker(WorkerAddr::from("w1"), "h1".into(), 4);
            } else {
                assert_eq!(store.task_state(&key("a")), Some(TaskState::Erred));
                assert!(out.iter().any(|o| matches!(o, Outbound::ToClient(_, ClientMessage::KeyErred { .. }))));
            }
        }
    }

    #[test]
    fn losing_last_replica_of_a_still_wanted_key_recomputes_it() {
        let (mut store, dispatcher) = setup();
        store
            .add_task(key("a"), vec![], Default::default(), Priority::new(0, 0), Restrictions::none(), Some(ClientId::from("c1")))
            .unwrap();
        on_task_added(&mut store, &dispatcher, key("a"));
        try_dispatch_to_worker(&mut store, &dispatcher, &WorkerAddr::from("w1")).unwrap();
        store.record_memory(&key("a"), &WorkerAddr::from("w1"), 10);
        store.clear_processing(&key("a"), &WorkerAddr::from("w1"));

        on_worker_lost(&mut store, &dispatcher, 3, &WorkerAddr::from("w1"));

        assert!(store.task_state(&key("a")).unwrap().is_dispatchable());
        assert!(store.replicas(&key("a")).is_empty());
    }
}
