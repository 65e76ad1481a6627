//! Task, outcome, and statistics types for worker pools.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::worker::WorkerError;

/// Scheduler-generated task identity. Callers never choose it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(Uuid);

impl TaskId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Successful settlement of a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOutput {
    pub task_id: TaskId,
    pub result: Value,
    /// Processing time as reported by the worker.
    pub processing_time: Duration,
}

/// Failed settlement of a task. The scheduler never retries on its own.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("Task {task_id} timed out after {}ms", timeout.as_millis())]
    Timeout { task_id: TaskId, timeout: Duration },

    #[error("Worker fault while running task {task_id}: {reason}")]
    WorkerFault { task_id: TaskId, reason: String },

    #[error("Pool '{pool}' shut down before task {task_id} settled")]
    Shutdown { pool: String, task_id: TaskId },

    #[error("Task {task_id} failed: {message}")]
    Application { task_id: TaskId, message: String },
}

/// Discriminant of [`TaskError`], for logs, metrics and wire responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskErrorKind {
    Timeout,
    WorkerFault,
    Shutdown,
    Application,
}

impl TaskErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::WorkerFault => "worker_fault",
            Self::Shutdown => "shutdown",
            Self::Application => "application",
        }
    }
}

impl TaskError {
    pub const fn task_id(&self) -> TaskId {
        match self {
            Self::Timeout { task_id, .. }
            | Self::WorkerFault { task_id, .. }
            | Self::Shutdown { task_id, .. }
            | Self::Application { task_id, .. } => *task_id,
        }
    }

    pub const fn kind(&self) -> TaskErrorKind {
        match self {
            Self::Timeout { .. } => TaskErrorKind::Timeout,
            Self::WorkerFault { .. } => TaskErrorKind::WorkerFault,
            Self::Shutdown { .. } => TaskErrorKind::Shutdown,
            Self::Application { .. } => TaskErrorKind::Application,
        }
    }

    /// Whether resubmitting the same payload could plausibly succeed.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::WorkerFault { .. })
    }
}

/// Point-in-time view of a pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub name: String,
    pub max_workers: usize,
    /// Live worker units (below `max_workers` only while a respawn is pending).
    pub workers: usize,
    pub available: usize,
    /// Workers holding a task, including ones whose task already timed out.
    pub busy: usize,
    pub active: usize,
    pub pending: usize,
    pub submitted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub faulted: u64,
    pub late_replies: u64,
    pub restarts: u64,
}

/// Errors from pool construction and introspection.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Invalid pool configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to start worker {slot} of pool '{pool}': {source}")]
    Spawn {
        pool: String,
        slot: usize,
        #[source]
        source: WorkerError,
    },

    #[error("Pool '{0}' has been shut down")]
    Closed(String),
}
