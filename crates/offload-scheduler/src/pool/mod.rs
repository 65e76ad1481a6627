//! Bounded worker pools.
//!
//! A [`Pool`] owns a fixed set of worker units and a single coordinator
//! task. Every state change (submission, completion, timeout, crash,
//! shutdown) is a message to that coordinator, so pool state is never
//! locked. Callers get a [`TaskHandle`] per submission that settles
//! exactly once.

mod coordinator;
mod handle;
mod types;

#[cfg(test)]
mod tests;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use offload_core::{PoolConfig, TimeoutAnchor};

use crate::worker::{InProcessSpawner, ProcessSpawner, TaskHandler, WorkerSpawner};

pub use handle::{Pool, TaskHandle};
pub use types::{PoolError, PoolStats, TaskError, TaskErrorKind, TaskId, TaskOutput};

/// Default delay before retrying a failed worker respawn.
pub const DEFAULT_RESPAWN_BACKOFF: Duration = Duration::from_secs(1);

/// Everything needed to start a pool.
#[derive(Clone)]
pub struct PoolSpec {
    /// Number of worker units kept alive.
    pub max_workers: usize,
    /// Default per-task timeout.
    pub task_timeout: Duration,
    /// Where the timeout clock starts.
    pub timeout_anchor: TimeoutAnchor,
    /// Replace the worker of a timed-out task instead of waiting for it.
    pub replace_on_timeout: bool,
    /// Delay before retrying a failed respawn.
    pub respawn_backoff: Duration,
    /// Factory for worker units.
    pub spawner: Arc<dyn WorkerSpawner>,
}

impl PoolSpec {
    pub fn new(
        max_workers: usize,
        task_timeout: Duration,
        spawner: impl WorkerSpawner + 'static,
    ) -> Self {
        Self {
            max_workers,
            task_timeout,
            timeout_anchor: TimeoutAnchor::default(),
            replace_on_timeout: false,
            respawn_backoff: DEFAULT_RESPAWN_BACKOFF,
            spawner: Arc::new(spawner),
        }
    }

    /// Subprocess pool described by a settings entry.
    pub fn from_config(config: &PoolConfig) -> Result<Self, PoolError> {
        config
            .validate()
            .map_err(|e| PoolError::InvalidConfig(e.to_string()))?;
        Ok(Self {
            timeout_anchor: config.timeout_anchor,
            replace_on_timeout: config.replace_on_timeout,
            respawn_backoff: config.respawn_backoff(),
            ..Self::new(
                config.max_workers,
                config.task_timeout(),
                ProcessSpawner::from_config(config),
            )
        })
    }

    /// Pool whose units run `handler` on the tokio runtime.
    pub fn in_process(
        max_workers: usize,
        task_timeout: Duration,
        handler: impl TaskHandler,
    ) -> Self {
        Self::new(max_workers, task_timeout, InProcessSpawner::new(handler))
    }

    #[must_use]
    pub const fn with_timeout_anchor(mut self, anchor: TimeoutAnchor) -> Self {
        self.timeout_anchor = anchor;
        self
    }

    #[must_use]
    pub const fn with_replace_on_timeout(mut self, replace: bool) -> Self {
        self.replace_on_timeout = replace;
        self
    }

    #[must_use]
    pub const fn with_respawn_backoff(mut self, backoff: Duration) -> Self {
        self.respawn_backoff = backoff;
        self
    }

    pub fn validate(&self) -> Result<(), PoolError> {
        if self.max_workers == 0 {
            return Err(PoolError::InvalidConfig(
                "max_workers must be at least 1".into(),
            ));
        }
        if self.task_timeout.is_zero() {
            return Err(PoolError::InvalidConfig(
                "task timeout must be positive".into(),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for PoolSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolSpec")
            .field("max_workers", &self.max_workers)
            .field("task_timeout", &self.task_timeout)
            .field("timeout_anchor", &self.timeout_anchor)
            .field("replace_on_timeout", &self.replace_on_timeout)
            .field("respawn_backoff", &self.respawn_backoff)
            .finish_non_exhaustive()
    }
}
