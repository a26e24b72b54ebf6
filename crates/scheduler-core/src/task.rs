//! Task entity and its lifecycle states (spec §3, §4.2).

use std::collections::BTreeSet;

use crate::ids::{ClientId, Priority, TaskKey, WorkerAddr};

/// Where a task currently sits in its lifecycle. `Ready` and `Stacks` are
/// the pseudo-states from spec §4.2: both represent a task whose
/// `waiting` set is empty but which has not yet been transmitted to a
/// worker, distinguished only by which dispatch queue currently holds it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum TaskState {
    Released,
    Waiting,
    Ready,
    Stacks,
    NoWorker,
    Processing,
    Memory,
    Erred,
}

impl TaskState {
    #[must_use]
    pub fn is_dispatchable(self) -> bool {
        matches!(self, TaskState::Ready | TaskState::Stacks)
    }

    #[must_use]
    pub fn is_terminal_for_release(self) -> bool {
        matches!(self, TaskState::Released | TaskState::Erred | TaskState::Memory)
    }
}

/// Acceptable hostnames a task may run on. An empty set means unrestricted.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Restrictions {
    pub hosts: BTreeSet<String>,
    /// If true, the scheduler may fall back to placement on any worker
    /// once `hosts` proves unsatisfiable (spec §7.5).
    pub loose: bool,
}

impl Restrictions {
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    #[must_use]
    pub fn satisfied_by(&self, hostname: &str) -> bool {
        self.hosts.is_empty() || self.hosts.contains(hostname)
    }
}

#[derive(Debug, Clone)]
pub struct Task {
    pub key: TaskKey,
    pub payload: Vec<u8>,
    pub state: TaskState,
    pub priority: Priority,
    pub restrictions: Restrictions,
    pub nbytes: Option<u64>,
    pub suspicion_count: u32,
    pub exception: Option<String>,
    pub traceback: Option<String>,
    pub exception_blame: Option<TaskKey>,
}

impl Task {
    #[must_use]
    pub fn new(
        key: TaskKey,
        payload: Vec<u8>,
        priority: Priority,
        restrictions: Restrictions,
    ) -> Self {
        Self {
            key,
            payload,
            state: TaskState::Waiting,
            priority,
            restrictions,
            nbytes: None,
            suspicion_count: 0,
            exception: None,
            traceback: None,
            exception_blame: None,
        }
    }
}

/// Worker-side bookkeeping (spec §3 "Worker").
#[derive(Debug, Clone)]
pub struct Worker {
    pub addr: WorkerAddr,
    pub hostname: String,
    pub ncores: u32,
    /// Running sum of `processing[w].values()`, kept in lock-step so
    /// occupancy queries stay O(1) (spec §4.3 `occupancy(w)`).
    pub occupancy_cost: u64,
}

impl Worker {
    #[must_use]
    pub fn new(addr: WorkerAddr, hostname: String, ncores: u32) -> Self {
        Self {
            addr,
            hostname,
            ncores,
            occupancy_cost: 0,
        }
    }
}

/// Client-side bookkeeping (spec §3 "Client").
#[derive(Debug, Clone)]
pub struct Client {
    pub id: ClientId,
}

impl Client {
    #[must_use]
    pub fn new(id: ClientId) -> Self {
        Self { id }
    }
}
