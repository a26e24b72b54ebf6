//! Inbound stimuli and outbound peer messages (spec §4.4, §6).
//!
//! A handler is a pure function of `(&mut StateStore, Message) -> Vec<Outbound>`.
//! Nothing here touches the network; `Outbound` values are handed to the
//! transport layer, which owns per-peer queues and batching (spec §5).

use std::collections::BTreeSet;

use crate::ids::{ClientId, Priority, TaskKey, WorkerAddr};
use crate::task::Restrictions;

/// One task as submitted in an `update-graph` batch.
#[derive(Debug, Clone)]
pub struct TaskSubmission {
    pub key: TaskKey,
    pub payload: Vec<u8>,
    pub dependencies: BTreeSet<TaskKey>,
    pub restrictions: Restrictions,
}

/// A single external stimulus. The transport layer may deliver several of
/// these as one stimulus-batch; `Scheduler::apply_batch` applies them in
/// order, each to completion, before the next one starts (spec §5).
#[derive(Debug, Clone)]
pub enum Message {
    UpdateGraph {
        client: ClientId,
        tasks: Vec<TaskSubmission>,
        keys_wanted: BTreeSet<TaskKey>,
    },
    TaskFinished {
        worker: WorkerAddr,
        key: TaskKey,
        nbytes: u64,
    },
    TaskFailed {
        worker: WorkerAddr,
        key: TaskKey,
        exception: String,
        traceback: String,
    },
    AddWorker {
        address: WorkerAddr,
        hostname: String,
        ncores: u32,
    },
    RemoveWorker {
        address: WorkerAddr,
    },
    ClientReleasesKeys {
        client: ClientId,
        keys: BTreeSet<TaskKey>,
    },
    AddClient {
        client: ClientId,
    },
    RemoveClient {
        client: ClientId,
    },
    AddKeys {
        worker: WorkerAddr,
        keys: BTreeSet<TaskKey>,
    },
    MissingData {
        worker: WorkerAddr,
        key: TaskKey,
    },
    Heartbeat {
        worker: WorkerAddr,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerMessage {
    ComputeTask {
        key: TaskKey,
        payload: Vec<u8>,
        who_has: Vec<(TaskKey, Vec<WorkerAddr>)>,
        priority: Priority,
    },
    Release {
        key: TaskKey,
    },
    Gather {
        keys: Vec<TaskKey>,
        source_workers: Vec<WorkerAddr>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    KeyDone {
        key: TaskKey,
    },
    KeyErred {
        key: TaskKey,
        blame: TaskKey,
        exception: String,
        traceback: String,
    },
    KeyLost {
        key: TaskKey,
    },
}

/// A message emitted by a handler, destined for one peer's send queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    ToWorker(WorkerAddr, WorkerMessage),
    ToClient(ClientId, ClientMessage),
}
