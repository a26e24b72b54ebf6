//! Error taxonomy for the scheduler core (spec §7).

use thiserror::Error;

use crate::ids::{ClientId, TaskKey, WorkerAddr};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("task {0} is unknown to the store")]
    UnknownTask(TaskKey),

    #[error("worker {0} is unknown to the store")]
    UnknownWorker(WorkerAddr),

    #[error("client {0} is unknown to the store")]
    UnknownClient(ClientId),

    #[error("task {0} already exists")]
    DuplicateTask(TaskKey),

    #[error("update-graph rejected: dependency cycle touching {0}")]
    CyclicGraph(TaskKey),

    #[error("cannot remove task {0}: still held by a worker or wanted by a client")]
    TaskStillLive(TaskKey),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
