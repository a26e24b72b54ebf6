//! End-to-end scenarios from the scheduler's design document, driven purely
//! through the public `Scheduler` API: `handle_message` in, `Outbound`
//! messages out.

use std::collections::BTreeSet;

use scheduler_core::{
    ClientMessage, Message, Outbound, Restrictions, Scheduler, SchedulerOptions, TaskKey, TaskState,
    TaskSubmission, WorkerMessage,
};

fn key(s: &str) -> TaskKey {
    TaskKey::from(s)
}

fn submission(key_str: &str, deps: &[&str]) -> TaskSubmission {
    TaskSubmission {
        key: key(key_str),
        payload: vec![],
        dependencies: deps.iter().map(|d| key(d)).collect(),
        restrictions: Restrictions::none(),
    }
}

fn finish(scheduler: &mut Scheduler, worker: &str, k: &str, nbytes: u64) -> Vec<Outbound> {
    scheduler.handle_message(Message::TaskFinished {
        worker: worker.into(),
        key: key(k),
        nbytes,
    })
}

#[test]
fn linear_chain_runs_on_a_single_worker_and_notifies_the_client() {
    let mut scheduler = Scheduler::new(SchedulerOptions::default());
    scheduler.handle_message(Message::AddClient { client: "client-1".into() });
    scheduler.handle_message(Message::AddWorker {
        address: "w1".into(),
        hostname: "h1".into(),
        ncores: 4,
    });

    let first = scheduler.handle_message(Message::UpdateGraph {
        client: "client-1".into(),
        tasks: vec![submission("a", &[]), submission("b", &["a"]), submission("c", &["b"])],
        keys_wanted: BTreeSet::from([key("c")]),
    });

    assert!(first
        .iter()
        .any(|o| matches!(o, Outbound::ToWorker(_, WorkerMessage::ComputeTask { key: k, .. }) if *k == key("a"))));

    let second = finish(&mut scheduler, "w1", "a", 10);
    assert!(second
        .iter()
        .any(|o| matches!(o, Outbound::ToWorker(_, WorkerMessage::ComputeTask { key: k, .. }) if *k == key("b"))));
    // `a` is only consumed once `b` finishes; it is still live data here.
    assert_eq!(scheduler.task_state(&key("a")).unwrap(), TaskState::Memory);

    let third = finish(&mut scheduler, "w1", "b", 10);
    assert!(third
        .iter()
        .any(|o| matches!(o, Outbound::ToWorker(_, WorkerMessage::ComputeTask { key: k, .. }) if *k == key("c"))));
    assert_eq!(scheduler.task_state(&key("a")).unwrap(), TaskState::Released);
    assert_eq!(scheduler.task_state(&key("b")).unwrap(), TaskState::Memory);

    let done = finish(&mut scheduler, "w1", "c", 10);
    assert_eq!(scheduler.task_state(&key("b")).unwrap(), TaskState::Released);
    assert_eq!(scheduler.task_state(&key("c")).unwrap(), TaskState::Memory);
    assert!(done
        .iter()
        .any(|o| matches!(o, Outbound::ToClient(c, ClientMessage::KeyDone { key: k }) if c.as_str() == "client-1" && *k == key("c"))));
}

#[test]
fn fan_in_dispatches_z_to_the_worker_holding_the_larger_input() {
    let mut scheduler = Scheduler::new(SchedulerOptions::default());
    scheduler.handle_message(Message::AddClient { client: "client-1".into() });
    scheduler.handle_message(Message::AddWorker { address: "w1".into(), hostname: "h1".into(), ncores: 4 });
    scheduler.handle_message(Message::AddWorker { address: "w2".into(), hostname: "h2".into(), ncores: 4 });

    let assigned = scheduler.handle_message(Message::UpdateGraph {
        client: "client-1".into(),
        tasks: vec![submission("x", &[]), submission("y", &[]), submission("z", &["x", "y"])],
        keys_wanted: BTreeSet::from([key("z")]),
    });
    assert_eq!(assigned.len(), 2);
    let worker_of = |wanted: &TaskKey| -> String {
        assigned
            .iter()
            .find_map(|o| match o {
                Outbound::ToWorker(w, WorkerMessage::ComputeTask { key: k, .. }) if k == wanted => {
                    Some(w.as_str().to_string())
                }
                _ => None,
            })
            .unwrap()
    };
    let x_worker = worker_of(&key("x"));
    let y_worker = worker_of(&key("y"));
    assert_ne!(x_worker, y_worker, "x and y should dispatch to different workers");

    finish(&mut scheduler, &x_worker, "x", 10);
    let z_dispatch = finish(&mut scheduler, &y_worker, "y", 1_000_000_000);

    assert!(matches!(
        z_dispatch.as_slice(),
        [Outbound::ToWorker(w, WorkerMessage::ComputeTask { key: k, .. })] if *k == key("z") && w.as_str() == y_worker.as_str()
    ));

    finish(&mut scheduler, &y_worker, "z", 5);
    assert_eq!(scheduler.store().replicas(&key("z")).len(), 1);
}

#[test]
fn worker_loss_mid_task_redispatches_then_errs_after_the_suspicion_limit() {
    let mut options = SchedulerOptions::default();
    options.suspicion_limit = 3;
    let mut scheduler = Scheduler::new(options);
    scheduler.handle_message(Message::AddClient { client: "client-1".into() });
    scheduler.handle_message(Message::AddWorker { address: "w1".into(), hostname: "h1".into(), ncores: 4 });

    scheduler.handle_message(Message::UpdateGraph {
        client: "client-1".into(),
        tasks: vec![submission("a", &[])],
        keys_wanted: BTreeSet::from([key("a")]),
    });

    // the cluster is now empty: the task has nowhere to go until a worker
    // rejoins, even though it was merely a suspected loss, not a failure.
    scheduler.handle_message(Message::RemoveWorker { address: "w1".into() });
    assert_eq!(scheduler.task_state(&key("a")).unwrap(), TaskState::NoWorker);

    scheduler.handle_message(Message::AddWorker { address: "w2".into(), hostname: "h2".into(), ncores: 4 });
    scheduler.handle_message(Message::RemoveWorker { address: "w2".into() });
    assert_eq!(scheduler.task_state(&key("a")).unwrap(), TaskState::NoWorker);

    scheduler.handle_message(Message::AddWorker { address: "w3".into(), hostname: "h3".into(), ncores: 4 });
    scheduler.handle_message(Message::RemoveWorker { address: "w3".into() });

    assert_eq!(scheduler.task_state(&key("a")).unwrap(), TaskState::Erred);
}

#[test]
fn task_failure_blames_every_transitive_dependent() {
    let mut scheduler = Scheduler::new(SchedulerOptions::default());
    scheduler.handle_message(Message::AddClient { client: "client-1".into() });
    scheduler.handle_message(Message::AddWorker { address: "w1".into(), hostname: "h1".into(), ncores: 4 });

    scheduler.handle_message(Message::UpdateGraph {
        client: "client-1".into(),
        tasks: vec![submission("a", &[]), submission("b", &["a"]), submission("c", &["b"])],
        keys_wanted: BTreeSet::from([key("c")]),
    });

    finish(&mut scheduler, "w1", "a", 10);

    let failed = scheduler.handle_message(Message::TaskFailed {
        worker: "w1".into(),
        key: key("b"),
        exception: "boom".into(),
        traceback: "tb".into(),
    });

    assert_eq!(scheduler.task_state(&key("b")).unwrap(), TaskState::Erred);
    assert_eq!(scheduler.task_state(&key("c")).unwrap(), TaskState::Erred);
    assert!(failed.iter().any(
        |o| matches!(o, Outbound::ToClient(_, ClientMessage::KeyErred { key: k, blame, .. }) if *k == key("c") && *blame == key("b"))
    ));
    assert_eq!(scheduler.task_state(&key("a")).unwrap(), TaskState::Memory);
}

#[test]
fn client_cancellation_drains_ancestors_to_released() {
    let mut scheduler = Scheduler::new(SchedulerOptions::default());
    scheduler.handle_message(Message::AddClient { client: "client-1".into() });
    scheduler.handle_message(Message::AddWorker { address: "w1".into(), hostname: "h1".into(), ncores: 4 });

    scheduler.handle_message(Message::UpdateGraph {
        client: "client-1".into(),
        tasks: vec![submission("a", &[]), submission("l", &["a"])],
        keys_wanted: BTreeSet::from([key("l")]),
    });
    finish(&mut scheduler, "w1", "a", 10);

    assert_eq!(scheduler.task_state(&key("l")).unwrap(), TaskState::Processing);

    let released = scheduler.handle_message(Message::ClientReleasesKeys {
        client: "client-1".into(),
        keys: BTreeSet::from([key("l")]),
    });

    assert!(released
        .iter()
        .any(|o| matches!(o, Outbound::ToWorker(_, WorkerMessage::Release { key: k }) if *k == key("l"))));
    assert_eq!(scheduler.task_state(&key("l")).unwrap(), TaskState::Released);
    assert_eq!(scheduler.task_state(&key("a")).unwrap(), TaskState::Released);
}

#[test]
fn restricted_task_waits_for_a_matching_worker() {
    let mut scheduler = Scheduler::new(SchedulerOptions::default());
    scheduler.handle_message(Message::AddClient { client: "client-1".into() });

    let restricted = TaskSubmission {
        key: key("k"),
        payload: vec![],
        dependencies: BTreeSet::new(),
        restrictions: {
            let mut r = Restrictions::none();
            r.hosts.insert("gpu-1".to_string());
            r
        },
    };

    scheduler.handle_message(Message::UpdateGraph {
        client: "client-1".into(),
        tasks: vec![restricted],
        keys_wanted: BTreeSet::from([key("k")]),
    });

    assert_eq!(scheduler.task_state(&key("k")).unwrap(), TaskState::NoWorker);

    let dispatched = scheduler.handle_message(Message::AddWorker {
        address: "gpu-1:9000".into(),
        hostname: "gpu-1".into(),
        ncores: 8,
    });

    assert!(matches!(
        dispatched.as_slice(),
        [Outbound::ToWorker(w, WorkerMessage::ComputeTask { key: k, .. })] if *k == key("k") && w.as_str() == "gpu-1:9000"
    ));
    assert_eq!(scheduler.task_state(&key("k")).unwrap(), TaskState::Processing);
}
