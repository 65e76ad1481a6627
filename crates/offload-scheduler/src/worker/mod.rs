//! Worker units: the isolated execution contexts a pool hands tasks to.
//!
//! A unit accepts one [`TaskMessage`] at a time and eventually reports
//! exactly one [`WorkerEvent`] for it, or faults. Reports travel back to
//! the owning pool over an unbounded channel, tagged with the unit's
//! [`WorkerRef`] so that reports from a replaced unit are recognisably
//! stale.

pub mod inprocess;
pub mod process;
pub mod stdio;

use std::fmt;

use offload_core::{ResultMessage, TaskMessage};
use tokio::sync::mpsc;

pub use inprocess::{HandlerFuture, InProcessSpawner, TaskHandler};
pub use process::ProcessSpawner;
pub use stdio::{run_stdio_worker, run_worker_loop};

/// Channel a worker unit reports on.
pub type ReportSender = mpsc::UnboundedSender<WorkerReport>;

/// Arena-style reference to a worker: its slot in the pool plus the
/// generation of the unit occupying that slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerRef {
    pub slot: usize,
    pub generation: u64,
}

impl fmt::Display for WorkerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w{}.{}", self.slot, self.generation)
    }
}

/// What a worker unit has to say about its current task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    /// The unit finished a task (successfully or with an application error).
    Completed(ResultMessage),
    /// The unit died or broke protocol; it must not be reused.
    Faulted { reason: String },
}

/// A [`WorkerEvent`] tagged with the unit that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerReport {
    pub worker: WorkerRef,
    pub event: WorkerEvent,
}

impl WorkerReport {
    pub const fn completed(worker: WorkerRef, result: ResultMessage) -> Self {
        Self {
            worker,
            event: WorkerEvent::Completed(result),
        }
    }

    pub fn faulted(worker: WorkerRef, reason: impl Into<String>) -> Self {
        Self {
            worker,
            event: WorkerEvent::Faulted {
                reason: reason.into(),
            },
        }
    }
}

/// A live worker unit owned by a pool.
pub trait WorkerUnit: Send {
    /// Hand one task to the unit. Must not block; the outcome arrives later
    /// as a [`WorkerReport`].
    fn dispatch(&mut self, task: TaskMessage) -> Result<(), WorkerError>;

    /// Stop the unit. A requested termination never produces a fault report.
    fn terminate(self: Box<Self>);
}

/// Factory for worker units; a pool calls it once per slot and again for
/// every replacement.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(
        &self,
        worker: WorkerRef,
        reports: ReportSender,
    ) -> Result<Box<dyn WorkerUnit>, WorkerError>;
}

/// Errors from worker units.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkerError {
    #[error("Failed to spawn worker: {reason}")]
    Spawn { reason: String },

    #[error("Worker {worker} did not accept task: {reason}")]
    Send { worker: WorkerRef, reason: String },

    /// The task itself cannot be handed over; the unit is still usable.
    #[error("Task rejected: {reason}")]
    Rejected { reason: String },
}
