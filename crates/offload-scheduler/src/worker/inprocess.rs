//! In-process worker units backed by an async [`TaskHandler`].
//!
//! Each dispatch runs the handler as its own tokio task. A handler panic is
//! the in-process equivalent of a process crash and is reported as a fault.
//! CPU-heavy handlers should move their work onto `spawn_blocking`.

use std::any::Any;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use offload_core::{ResultMessage, TaskMessage};
use serde_json::Value;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::debug;

use super::{ReportSender, WorkerError, WorkerRef, WorkerReport, WorkerSpawner, WorkerUnit};

/// Boxed future returned by a [`TaskHandler`].
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, String>> + Send>>;

/// Work performed for one task payload. `Err` is an application-level
/// failure, not a worker fault.
pub trait TaskHandler: Send + Sync + 'static {
    fn handle(&self, payload: Value) -> HandlerFuture;
}

impl<F, Fut> TaskHandler for F
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, String>> + Send + 'static,
{
    fn handle(&self, payload: Value) -> HandlerFuture {
        Box::pin(self(payload))
    }
}

/// Spawns in-process units sharing one handler.
#[derive(Clone)]
pub struct InProcessSpawner {
    handler: Arc<dyn TaskHandler>,
}

impl InProcessSpawner {
    pub fn new(handler: impl TaskHandler) -> Self {
        Self {
            handler: Arc::new(handler),
        }
    }
}

impl std::fmt::Debug for InProcessSpawner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessSpawner").finish_non_exhaustive()
    }
}

impl WorkerSpawner for InProcessSpawner {
    fn spawn(
        &self,
        worker: WorkerRef,
        reports: ReportSender,
    ) -> Result<Box<dyn WorkerUnit>, WorkerError> {
        Ok(Box::new(InProcessWorker {
            worker,
            handler: Arc::clone(&self.handler),
            reports,
            running: None,
        }))
    }
}

struct InProcessWorker {
    worker: WorkerRef,
    handler: Arc<dyn TaskHandler>,
    reports: ReportSender,
    running: Option<AbortHandle>,
}

impl WorkerUnit for InProcessWorker {
    fn dispatch(&mut self, task: TaskMessage) -> Result<(), WorkerError> {
        if self.running.as_ref().is_some_and(|h| !h.is_finished()) {
            return Err(WorkerError::Send {
                worker: self.worker,
                reason: "worker is busy".to_string(),
            });
        }

        let started = Instant::now();
        let job = tokio::spawn(self.handler.handle(task.payload));
        self.running = Some(job.abort_handle());

        let worker = self.worker;
        let reports = self.reports.clone();
        let task_id = task.task_id;
        tokio::spawn(async move {
            let report = match job.await {
                Ok(Ok(value)) => WorkerReport::completed(
                    worker,
                    ResultMessage::success(task_id, value, started.elapsed()),
                ),
                Ok(Err(message)) => WorkerReport::completed(
                    worker,
                    ResultMessage::failure(task_id, message, started.elapsed()),
                ),
                Err(e) if e.is_panic() => WorkerReport::faulted(
                    worker,
                    format!("handler panicked: {}", panic_message(e.into_panic().as_ref())),
                ),
                Err(_) => {
                    debug!(%worker, %task_id, "Handler aborted");
                    return;
                }
            };
            let _ = reports.send(report);
        });
        Ok(())
    }

    fn terminate(self: Box<Self>) {
        if let Some(running) = self.running {
            running.abort();
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}
