//! Caller-facing pool handle and per-task futures.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::info;

use super::PoolSpec;
use super::coordinator::{Command, Coordinator, Submission};
use super::types::{PoolError, PoolStats, TaskError, TaskId, TaskOutput};

/// Cloneable handle to a running pool. The pool shuts down when the last
/// handle is dropped or [`Pool::shutdown`] is called.
#[derive(Debug, Clone)]
pub struct Pool {
    name: Arc<str>,
    max_workers: usize,
    commands: mpsc::UnboundedSender<Command>,
}

impl Pool {
    /// Spawn every worker unit and start the coordinator.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(name: impl Into<String>, spec: PoolSpec) -> Result<Self, PoolError> {
        let name: Arc<str> = Arc::from(name.into());
        spec.validate()?;
        let max_workers = spec.max_workers;

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let coordinator = Coordinator::new(Arc::clone(&name), spec, commands_rx)?;
        tokio::spawn(coordinator.run());

        info!(pool = %name, max_workers, "Pool started");
        Ok(Self {
            name,
            max_workers,
            commands: commands_tx,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Queue `payload` for execution. A `timeout` of `None` or zero uses the
    /// pool default.
    pub fn submit(&self, payload: Value, timeout: Option<Duration>) -> TaskHandle {
        let id = TaskId::new();
        let (reply, rx) = oneshot::channel();
        // On a closed pool the reply sender is dropped with the command and
        // the handle resolves to `TaskError::Shutdown`.
        let _ = self.commands.send(Command::Submit(Submission {
            id,
            payload,
            timeout,
            submitted_at: Instant::now(),
            reply,
        }));
        TaskHandle {
            id,
            pool: Arc::clone(&self.name),
            rx,
        }
    }

    pub async fn stats(&self) -> Result<PoolStats, PoolError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Stats { reply })
            .map_err(|_| self.closed())?;
        rx.await.map_err(|_| self.closed())
    }

    /// Fail every pending and active task and terminate all worker units.
    /// Safe to call more than once.
    pub async fn shutdown(&self) {
        let (done, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown { done }).is_ok() {
            // Dropped sender means another shutdown won the race.
            let _ = rx.await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    fn closed(&self) -> PoolError {
        PoolError::Closed(self.name.to_string())
    }
}

/// Future for one submitted task; settles exactly once.
#[derive(Debug)]
pub struct TaskHandle {
    id: TaskId,
    pool: Arc<str>,
    rx: oneshot::Receiver<Result<TaskOutput, TaskError>>,
}

impl TaskHandle {
    pub const fn id(&self) -> TaskId {
        self.id
    }
}

impl Future for TaskHandle {
    type Output = Result<TaskOutput, TaskError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(settled)) => Poll::Ready(settled),
            // The coordinator is gone without answering.
            Poll::Ready(Err(_)) => Poll::Ready(Err(TaskError::Shutdown {
                pool: this.pool.to_string(),
                task_id: this.id,
            })),
        }
    }
}
