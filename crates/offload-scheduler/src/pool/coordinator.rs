//! The per-pool coordinator task.
//!
//! Owns all pool state and is the only code that mutates it. Three inputs
//! drive it: caller commands, worker reports, and its own timer and
//! respawn events.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use offload_core::{ResultMessage, TaskMessage, TimeoutAnchor};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::PoolSpec;
use super::types::{PoolError, PoolStats, TaskError, TaskErrorKind, TaskId, TaskOutput};
use crate::telemetry::Telemetry;
use crate::worker::{
    ReportSender, WorkerError, WorkerEvent, WorkerRef, WorkerReport, WorkerUnit,
};

type Reply = oneshot::Sender<Result<TaskOutput, TaskError>>;

/// Stand-in deadline for budgets too large to represent as an [`Instant`].
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `from + timeout`, saturating to a deadline that never fires in practice.
fn deadline_after(from: Instant, timeout: Duration) -> Instant {
    from.checked_add(timeout)
        .or_else(|| from.checked_add(FAR_FUTURE))
        .unwrap_or(from)
}

/// Requests from [`super::Pool`] handles.
pub enum Command {
    Submit(Submission),
    Stats { reply: oneshot::Sender<PoolStats> },
    Shutdown { done: oneshot::Sender<()> },
}

pub struct Submission {
    pub id: TaskId,
    pub payload: Value,
    pub timeout: Option<Duration>,
    pub submitted_at: Instant,
    pub reply: Reply,
}

/// Events the coordinator schedules for itself.
#[derive(Debug)]
enum Internal {
    TimerFired(TaskId),
    Respawn { slot: usize, generation: u64 },
}

struct Slot {
    generation: u64,
    /// `None` while a respawn is pending.
    unit: Option<Box<dyn WorkerUnit>>,
    /// Task the unit is working on. Outlives the task's `active` entry
    /// when the task times out.
    assignment: Option<TaskId>,
}

struct PendingTask {
    id: TaskId,
    payload: Value,
    timeout: Duration,
    /// Running already when timeouts count from submission.
    timer: Option<AbortHandle>,
    reply: Reply,
}

struct ActiveTask {
    worker: WorkerRef,
    timeout: Duration,
    dispatched_at: Instant,
    timer: AbortHandle,
    reply: Reply,
}

#[derive(Debug, Default)]
struct Counters {
    submitted: u64,
    succeeded: u64,
    failed: u64,
    timed_out: u64,
    faulted: u64,
    late_replies: u64,
    restarts: u64,
}

pub struct Coordinator {
    name: Arc<str>,
    spec: PoolSpec,
    slots: Vec<Slot>,
    /// Idle slots, least recently used first.
    available: VecDeque<usize>,
    active: HashMap<TaskId, ActiveTask>,
    pending: VecDeque<PendingTask>,
    counters: Counters,
    telemetry: Telemetry,
    commands: mpsc::UnboundedReceiver<Command>,
    reports_tx: ReportSender,
    reports: mpsc::UnboundedReceiver<WorkerReport>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal: mpsc::UnboundedReceiver<Internal>,
}

impl Coordinator {
    /// Spawn the initial units. Any failure tears down the ones already
    /// started.
    pub fn new(
        name: Arc<str>,
        spec: PoolSpec,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Result<Self, PoolError> {
        let (reports_tx, reports) = mpsc::unbounded_channel();
        let (internal_tx, internal) = mpsc::unbounded_channel();

        let mut slots: Vec<Slot> = Vec::with_capacity(spec.max_workers);
        for index in 0..spec.max_workers {
            let worker = WorkerRef {
                slot: index,
                generation: 0,
            };
            match spec.spawner.spawn(worker, reports_tx.clone()) {
                Ok(unit) => slots.push(Slot {
                    generation: 0,
                    unit: Some(unit),
                    assignment: None,
                }),
                Err(source) => {
                    for unit in slots.into_iter().filter_map(|slot| slot.unit) {
                        unit.terminate();
                    }
                    return Err(PoolError::Spawn {
                        pool: name.to_string(),
                        slot: index,
                        source,
                    });
                }
            }
        }

        Ok(Self {
            name,
            available: (0..slots.len()).collect(),
            slots,
            spec,
            active: HashMap::new(),
            pending: VecDeque::new(),
            counters: Counters::default(),
            telemetry: Telemetry::new(),
            commands,
            reports_tx,
            reports,
            internal_tx,
            internal,
        })
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                // Worker news first: a reply that is already in wins over a
                // timer or command that raced it.
                biased;
                // Both senders live in `self`, so these never yield `None`.
                Some(report) = self.reports.recv() => self.handle_report(report),
                Some(event) = self.internal.recv() => match event {
                    Internal::TimerFired(id) => self.handle_timeout(id),
                    Internal::Respawn { slot, generation } => self.handle_respawn(slot, generation),
                },
                command = self.commands.recv() => match command {
                    Some(Command::Submit(task)) => self.submit(task),
                    Some(Command::Stats { reply }) => {
                        let _ = reply.send(self.stats());
                    }
                    Some(Command::Shutdown { done }) => {
                        self.shutdown();
                        let _ = done.send(());
                        return;
                    }
                    None => {
                        debug!(pool = %self.name, "All pool handles dropped");
                        self.shutdown();
                        return;
                    }
                },
            }
        }
    }

    fn submit(&mut self, task: Submission) {
        self.counters.submitted += 1;
        let timeout = task
            .timeout
            .filter(|t| !t.is_zero())
            .unwrap_or(self.spec.task_timeout);
        let timer = match self.spec.timeout_anchor {
            TimeoutAnchor::Submission => Some(self.start_timer(task.id, task.submitted_at, timeout)),
            TimeoutAnchor::Dispatch => None,
        };
        debug!(pool = %self.name, task_id = %task.id, pending = self.pending.len(), "Task queued");
        self.pending.push_back(PendingTask {
            id: task.id,
            payload: task.payload,
            timeout,
            timer,
            reply: task.reply,
        });
        self.dispatch();
    }

    /// Pair pending tasks with idle workers, oldest task first.
    fn dispatch(&mut self) {
        while !self.pending.is_empty() {
            let Some(index) = self.available.pop_front() else {
                break;
            };
            if let Some(task) = self.pending.pop_front() {
                self.assign(index, task);
            }
        }
    }

    fn assign(&mut self, index: usize, task: PendingTask) {
        let Some(slot) = self.slots.get_mut(index) else {
            self.pending.push_front(task);
            return;
        };
        let worker = WorkerRef {
            slot: index,
            generation: slot.generation,
        };
        let Some(unit) = slot.unit.as_mut() else {
            warn!(pool = %self.name, %worker, "Vacant worker slot was marked available");
            self.pending.push_front(task);
            return;
        };

        if let Err(e) = unit.dispatch(TaskMessage::new(task.id.to_string(), task.payload)) {
            if let Some(timer) = task.timer {
                timer.abort();
            }
            if let WorkerError::Rejected { reason } = e {
                debug!(pool = %self.name, %worker, task_id = %task.id, %reason, "Task rejected by worker");
                self.settle(
                    task.reply,
                    Err(TaskError::Application {
                        task_id: task.id,
                        message: reason,
                    }),
                );
                self.available.push_front(index);
                return;
            }
            warn!(pool = %self.name, %worker, task_id = %task.id, error = %e, "Dispatch failed, replacing worker");
            self.settle(
                task.reply,
                Err(TaskError::WorkerFault {
                    task_id: task.id,
                    reason: e.to_string(),
                }),
            );
            self.replace_worker(index);
            return;
        }
        slot.assignment = Some(task.id);

        let dispatched_at = Instant::now();
        let timer = match task.timer {
            Some(timer) => timer,
            None => self.start_timer(task.id, dispatched_at, task.timeout),
        };
        debug!(pool = %self.name, %worker, task_id = %task.id, "Task dispatched");
        self.active.insert(
            task.id,
            ActiveTask {
                worker,
                timeout: task.timeout,
                dispatched_at,
                timer,
                reply: task.reply,
            },
        );
    }

    fn handle_report(&mut self, report: WorkerReport) {
        let current = self
            .slots
            .get(report.worker.slot)
            .is_some_and(|slot| slot.generation == report.worker.generation && slot.unit.is_some());
        if !current {
            debug!(pool = %self.name, worker = %report.worker, "Ignoring report from replaced worker");
            return;
        }
        match report.event {
            WorkerEvent::Completed(result) => self.complete(report.worker, result),
            WorkerEvent::Faulted { reason } => self.crash(report.worker, &reason),
        }
    }

    fn complete(&mut self, worker: WorkerRef, result: ResultMessage) {
        let Some(slot) = self.slots.get_mut(worker.slot) else {
            return;
        };
        let task_id = match (slot.assignment, result.task_id.parse::<TaskId>()) {
            (Some(assigned), Ok(reported)) if assigned == reported => assigned,
            (assigned, _) => {
                warn!(
                    pool = %self.name,
                    %worker,
                    reported = %result.task_id,
                    assigned = ?assigned.map(|id| id.to_string()),
                    "Discarding reply for a task this worker was not assigned"
                );
                return;
            }
        };
        slot.assignment = None;
        self.available.push_back(worker.slot);

        match self.active.remove(&task_id) {
            Some(task) => {
                task.timer.abort();
                let processing_time = result.processing_time();
                let outcome = if result.success {
                    Ok(TaskOutput {
                        task_id,
                        result: result.result.unwrap_or(Value::Null),
                        processing_time,
                    })
                } else {
                    Err(TaskError::Application {
                        task_id,
                        message: result
                            .error
                            .unwrap_or_else(|| "task failed without an error message".to_string()),
                    })
                };
                debug!(
                    pool = %self.name,
                    %worker,
                    %task_id,
                    elapsed_ms = task.dispatched_at.elapsed().as_millis(),
                    "Worker replied"
                );
                self.settle(task.reply, outcome);
            }
            None => {
                self.counters.late_replies += 1;
                warn!(pool = %self.name, %worker, %task_id, "Discarding late reply for timed-out task");
            }
        }
        self.dispatch();
    }

    fn crash(&mut self, worker: WorkerRef, reason: &str) {
        warn!(pool = %self.name, %worker, reason, "Worker crashed");
        let assignment = self
            .slots
            .get_mut(worker.slot)
            .and_then(|slot| slot.assignment.take());
        // A timed-out assignment has no active entry left to fail.
        if let Some((task_id, task)) =
            assignment.and_then(|id| self.active.remove_entry(&id))
        {
            task.timer.abort();
            self.settle(
                task.reply,
                Err(TaskError::WorkerFault {
                    task_id,
                    reason: reason.to_string(),
                }),
            );
        }
        self.replace_worker(worker.slot);
        self.dispatch();
    }

    fn handle_timeout(&mut self, id: TaskId) {
        if let Some(task) = self.active.remove(&id) {
            warn!(
                pool = %self.name,
                worker = %task.worker,
                task_id = %id,
                timeout_ms = task.timeout.as_millis(),
                "Task timed out"
            );
            self.settle(
                task.reply,
                Err(TaskError::Timeout {
                    task_id: id,
                    timeout: task.timeout,
                }),
            );
            // Otherwise the worker stays busy until it replies or faults.
            if self.spec.replace_on_timeout {
                self.replace_worker(task.worker.slot);
                self.dispatch();
            }
        } else if let Some(position) = self.pending.iter().position(|task| task.id == id) {
            if let Some(task) = self.pending.remove(position) {
                warn!(pool = %self.name, task_id = %id, "Task timed out while queued");
                self.settle(
                    task.reply,
                    Err(TaskError::Timeout {
                        task_id: id,
                        timeout: task.timeout,
                    }),
                );
            }
        }
        // Anything else already settled before its timer could be aborted.
    }

    fn handle_respawn(&mut self, index: usize, generation: u64) {
        let due = self
            .slots
            .get(index)
            .is_some_and(|slot| slot.generation == generation && slot.unit.is_none());
        if due {
            self.spawn_into(index);
            self.dispatch();
        }
    }

    /// Retire the unit in `index` and start a fresh one in its place.
    fn replace_worker(&mut self, index: usize) {
        let Some(slot) = self.slots.get_mut(index) else {
            return;
        };
        slot.generation += 1;
        slot.assignment = None;
        if let Some(unit) = slot.unit.take() {
            unit.terminate();
        }
        self.available.retain(|&idle| idle != index);
        self.counters.restarts += 1;
        self.telemetry.worker_replaced(&self.name);
        self.spawn_into(index);
    }

    fn spawn_into(&mut self, index: usize) {
        let Some(slot) = self.slots.get_mut(index) else {
            return;
        };
        let worker = WorkerRef {
            slot: index,
            generation: slot.generation,
        };
        match self.spec.spawner.spawn(worker, self.reports_tx.clone()) {
            Ok(unit) => {
                slot.unit = Some(unit);
                self.available.push_back(index);
                info!(pool = %self.name, %worker, "Worker replaced");
            }
            Err(e) => {
                let backoff = self.spec.respawn_backoff;
                warn!(
                    pool = %self.name,
                    %worker,
                    error = %e,
                    backoff_ms = backoff.as_millis(),
                    "Failed to spawn replacement worker, retrying"
                );
                let tx = self.internal_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(backoff).await;
                    let _ = tx.send(Internal::Respawn {
                        slot: index,
                        generation: worker.generation,
                    });
                });
            }
        }
    }

    fn start_timer(&self, id: TaskId, from: Instant, timeout: Duration) -> AbortHandle {
        let deadline = deadline_after(from, timeout);
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let _ = tx.send(Internal::TimerFired(id));
        })
        .abort_handle()
    }

    fn settle(&mut self, reply: Reply, outcome: Result<TaskOutput, TaskError>) {
        let failure = outcome.as_ref().err().map(TaskError::kind);
        match failure {
            None => self.counters.succeeded += 1,
            Some(TaskErrorKind::Application) => self.counters.failed += 1,
            Some(TaskErrorKind::Timeout) => self.counters.timed_out += 1,
            Some(TaskErrorKind::WorkerFault) => self.counters.faulted += 1,
            Some(TaskErrorKind::Shutdown) => {}
        }
        self.telemetry.task_settled(&self.name, failure);
        debug!(
            pool = %self.name,
            outcome = failure.map_or("success", TaskErrorKind::as_str),
            "Task settled"
        );
        if reply.send(outcome).is_err() {
            debug!(pool = %self.name, "Task handle dropped before settlement");
        }
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            name: self.name.to_string(),
            max_workers: self.spec.max_workers,
            workers: self.slots.iter().filter(|slot| slot.unit.is_some()).count(),
            available: self.available.len(),
            busy: self
                .slots
                .iter()
                .filter(|slot| slot.assignment.is_some())
                .count(),
            active: self.active.len(),
            pending: self.pending.len(),
            submitted: self.counters.submitted,
            succeeded: self.counters.succeeded,
            failed: self.counters.failed,
            timed_out: self.counters.timed_out,
            faulted: self.counters.faulted,
            late_replies: self.counters.late_replies,
            restarts: self.counters.restarts,
        }
    }

    fn shutdown(&mut self) {
        // Handles observe the pool as closed from here on; queued commands
        // are dropped with `self`, which fails their replies.
        self.commands.close();
        let pending = std::mem::take(&mut self.pending);
        let active = std::mem::take(&mut self.active);
        info!(
            pool = %self.name,
            pending = pending.len(),
            active = active.len(),
            "Shutting down pool"
        );

        for (task_id, task) in active {
            task.timer.abort();
            let err = self.shutdown_error(task_id);
            self.settle(task.reply, Err(err));
        }
        for task in pending {
            if let Some(timer) = task.timer {
                timer.abort();
            }
            let err = self.shutdown_error(task.id);
            self.settle(task.reply, Err(err));
        }

        self.available.clear();
        for slot in &mut self.slots {
            slot.assignment = None;
            if let Some(unit) = slot.unit.take() {
                unit.terminate();
            }
        }
    }

    fn shutdown_error(&self, task_id: TaskId) -> TaskError {
        TaskError::Shutdown {
            pool: self.name.to_string(),
            task_id,
        }
    }
}
