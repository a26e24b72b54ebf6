//! Wire framing for the scheduler's transport: newline-delimited JSON, one
//! tagged record per line, keyed on `op` (spec §6). `scheduler_core` never
//! sees this module; it only knows `Message`/`Outbound`.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use scheduler_core::{ClientId, ClientMessage, Message, Outbound, Restrictions, TaskKey, TaskSubmission, WorkerAddr, WorkerMessage};

/// First line a worker connection must send, before any other op is
/// accepted (§4.4 supplement: "worker-connected" is the transport-level
/// trigger for `add-worker`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHello {
    pub address: String,
    pub hostname: String,
    pub ncores: u32,
}

/// First line a client connection must send ("client-connected").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientHello {
    pub client: String,
}

/// Ops the scheduler consumes from a worker connection (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum WorkerInbound {
    TaskFinished { key: String, nbytes: u64 },
    TaskFailed { key: String, exception: String, traceback: String },
    AddKeys { keys: Vec<String> },
    MissingData { key: String },
    Heartbeat,
}

impl WorkerInbound {
    #[must_use]
    pub fn into_message(self, worker: &WorkerAddr) -> Message {
        match self {
            WorkerInbound::TaskFinished { key, nbytes } => Message::TaskFinished {
                worker: worker.clone(),
                key: TaskKey::from(key),
                nbytes,
            },
            WorkerInbound::TaskFailed { key, exception, traceback } => Message::TaskFailed {
                worker: worker.clone(),
                key: TaskKey::from(key),
                exception,
                traceback,
            },
            WorkerInbound::AddKeys { keys } => Message::AddKeys {
                worker: worker.clone(),
                keys: keys.into_iter().map(TaskKey::from).collect(),
            },
            WorkerInbound::MissingData { key } => Message::MissingData {
                worker: worker.clone(),
                key: TaskKey::from(key),
            },
            WorkerInbound::Heartbeat => Message::Heartbeat { worker: worker.clone() },
        }
    }
}

/// A task as it travels over the wire in an `update-graph` record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireTask {
    pub key: String,
    #[serde(default)]
    pub payload: Vec<u8>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub restricted_hosts: Vec<String>,
    #[serde(default)]
    pub loose_restrictions: bool,
}

impl From<WireTask> for TaskSubmission {
    fn from(task: WireTask) -> Self {
        let mut restrictions = Restrictions::none();
        restrictions.hosts = task.restricted_hosts.into_iter().collect();
        restrictions.loose = task.loose_restrictions;
        TaskSubmission {
            key: TaskKey::from(task.key),
            payload: task.payload,
            dependencies: task.dependencies.into_iter().map(TaskKey::from).collect(),
            restrictions,
        }
    }
}

/// Ops the scheduler consumes from a client connection (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum ClientInbound {
    UpdateGraph {
        tasks: Vec<WireTask>,
        keys: Vec<String>,
    },
    ClientReleasesKeys {
        keys: Vec<String>,
    },
}

impl ClientInbound {
    #[must_use]
    pub fn into_message(self, client: &ClientId) -> Message {
        match self {
            ClientInbound::UpdateGraph { tasks, keys } => Message::UpdateGraph {
                client: client.clone(),
                tasks: tasks.into_iter().map(TaskSubmission::from).collect(),
                keys_wanted: keys.into_iter().map(TaskKey::from).collect::<BTreeSet<_>>(),
            },
            ClientInbound::ClientReleasesKeys { keys } => Message::ClientReleasesKeys {
                client: client.clone(),
                keys: keys.into_iter().map(TaskKey::from).collect(),
            },
        }
    }
}

/// Ops the scheduler emits to a worker connection (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum WorkerOutbound {
    ComputeTask {
        key: String,
        payload: Vec<u8>,
        who_has: Vec<(String, Vec<String>)>,
        priority: (i64, i64),
    },
    Release {
        key: String,
    },
    Gather {
        keys: Vec<String>,
        source_workers: Vec<String>,
    },
}

impl From<WorkerMessage> for WorkerOutbound {
    fn from(message: WorkerMessage) -> Self {
        match message {
            WorkerMessage::ComputeTask { key, payload, who_has, priority } => WorkerOutbound::ComputeTask {
                key: key.to_string(),
                payload,
                who_has: who_has
                    .into_iter()
                    .map(|(dep, holders)| (dep.to_string(), holders.iter().map(WorkerAddr::to_string).collect()))
                    .collect(),
                priority: (priority.0, priority.1),
            },
            WorkerMessage::Release { key } => WorkerOutbound::Release { key: key.to_string() },
            WorkerMessage::Gather { keys, source_workers } => WorkerOutbound::Gather {
                keys: keys.iter().map(TaskKey::to_string).collect(),
                source_workers: source_workers.iter().map(WorkerAddr::to_string).collect(),
            },
        }
    }
}

/// Ops the scheduler emits to a client connection (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum ClientOutbound {
    KeyDone { key: String },
    KeyErred { key: String, blame: String, exception: String, traceback: String },
    KeyLost { key: String },
}

impl From<ClientMessage> for ClientOutbound {
    fn from(message: ClientMessage) -> Self {
        match message {
            ClientMessage::KeyDone { key } => ClientOutbound::KeyDone { key: key.to_string() },
            ClientMessage::KeyErred { key, blame, exception, traceback } => ClientOutbound::KeyErred {
                key: key.to_string(),
                blame: blame.to_string(),
                exception,
                traceback,
            },
            ClientMessage::KeyLost { key } => ClientOutbound::KeyLost { key: key.to_string() },
        }
    }
}

/// Splits a batch of [`Outbound`] into per-kind wire records, paired with
/// the destination peer's identity as a plain string (the transport looks
/// up the matching connection by that string).
#[must_use]
pub fn split_outbound(batch: Vec<Outbound>) -> (Vec<(String, WorkerOutbound)>, Vec<(String, ClientOutbound)>) {
    let mut to_workers = Vec::new();
    let mut to_clients = Vec::new();
    for item in batch {
        match item {
            Outbound::ToWorker(addr, message) => to_workers.push((addr.to_string(), WorkerOutbound::from(message))),
            Outbound::ToClient(id, message) => to_clients.push((id.to_string(), ClientOutbound::from(message))),
        }
    }
    (to_workers, to_clients)
}
