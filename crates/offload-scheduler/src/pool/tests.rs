#![allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use offload_core::{ResultMessage, TaskMessage, TimeoutAnchor};
use serde_json::{Value, json};
use tokio::time::Instant;

use super::*;
use crate::worker::{ReportSender, WorkerError, WorkerRef, WorkerReport, WorkerSpawner, WorkerUnit};

const fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

/// Test handler driven by the payload:
/// `{"sleepMs": n, "hang": true, "panic": true, "fail": "msg", "value": v}`.
async fn scripted(payload: Value) -> Result<Value, String> {
    if let Some(n) = payload.get("sleepMs").and_then(Value::as_u64) {
        tokio::time::sleep(ms(n)).await;
    }
    if payload.get("hang").and_then(Value::as_bool) == Some(true) {
        std::future::pending::<()>().await;
    }
    if payload.get("panic").and_then(Value::as_bool) == Some(true) {
        panic!("worker crashed");
    }
    if let Some(message) = payload.get("fail").and_then(Value::as_str) {
        return Err(message.to_string());
    }
    Ok(payload.get("value").cloned().unwrap_or(Value::Null))
}

fn scripted_pool(max_workers: usize, timeout: Duration) -> Pool {
    Pool::start("test", PoolSpec::in_process(max_workers, timeout, scripted)).unwrap()
}

#[tokio::test(start_paused = true)]
async fn settles_success_and_application_error() {
    let pool = scripted_pool(1, ms(100));

    let output = pool.submit(json!({"value": 7}), None).await.unwrap();
    assert_eq!(output.result, json!(7));

    let err = pool
        .submit(json!({"fail": "file not found"}), None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), TaskErrorKind::Application);
    assert!(matches!(err, TaskError::Application { ref message, .. } if message == "file not found"));

    let stats = pool.stats().await.unwrap();
    assert_eq!(stats.submitted, 2);
    assert_eq!(stats.succeeded, 1);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.available, 1);
    assert_eq!(stats.workers, 1);
}

#[tokio::test(start_paused = true)]
async fn task_ids_are_reported_back() {
    let pool = scripted_pool(1, ms(100));
    let handle = pool.submit(json!({"value": "x"}), None);
    let id = handle.id();
    assert_eq!(handle.await.unwrap().task_id, id);
}

#[tokio::test(start_paused = true)]
async fn hung_task_times_out_after_dispatch() {
    // Two workers, 100ms budget: A and B take 10ms, C hangs.
    let pool = scripted_pool(2, ms(100));
    let start = Instant::now();

    let a = pool.submit(json!({"sleepMs": 10, "value": "a"}), None);
    let b = pool.submit(json!({"sleepMs": 10, "value": "b"}), None);
    let c = pool.submit(json!({"hang": true}), None);
    let c_id = c.id();

    let (a, b, c) = tokio::join!(a, b, c);
    assert_eq!(a.unwrap().result, json!("a"));
    assert_eq!(b.unwrap().result, json!("b"));
    assert_eq!(
        c.unwrap_err(),
        TaskError::Timeout {
            task_id: c_id,
            timeout: ms(100),
        }
    );

    // C waited ~10ms for a worker, then had its full budget.
    let elapsed = start.elapsed();
    assert!(elapsed >= ms(110), "settled too early: {elapsed:?}");
    assert!(elapsed < ms(120), "settled too late: {elapsed:?}");

    let stats = pool.stats().await.unwrap();
    assert_eq!(stats.succeeded, 2);
    assert_eq!(stats.timed_out, 1);
    assert_eq!(stats.active, 0);
    // The hung worker is still holding its slot.
    assert_eq!(stats.busy, 1);
    assert_eq!(stats.available, 1);
}

#[tokio::test(start_paused = true)]
async fn hung_worker_keeps_its_capacity() {
    let pool = scripted_pool(1, ms(50));

    let err = pool.submit(json!({"hang": true}), None).await.unwrap_err();
    assert_eq!(err.kind(), TaskErrorKind::Timeout);

    let queued = pool.submit(json!({"value": 1}), None);
    tokio::time::sleep(ms(500)).await;
    let stats = pool.stats().await.unwrap();
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.busy, 1);
    assert_eq!(stats.available, 0);

    pool.shutdown().await;
    assert_eq!(queued.await.unwrap_err().kind(), TaskErrorKind::Shutdown);
}

#[tokio::test(start_paused = true)]
async fn replace_on_timeout_frees_the_slot() {
    let spec = PoolSpec::in_process(1, ms(50), scripted).with_replace_on_timeout(true);
    let pool = Pool::start("test", spec).unwrap();

    let hung = pool.submit(json!({"hang": true}), None);
    let next = pool.submit(json!({"value": "next"}), None);

    assert_eq!(hung.await.unwrap_err().kind(), TaskErrorKind::Timeout);
    assert_eq!(next.await.unwrap().result, json!("next"));

    let stats = pool.stats().await.unwrap();
    assert_eq!(stats.restarts, 1);
    assert_eq!(stats.workers, 1);
    assert_eq!(stats.busy, 0);
}

#[tokio::test(start_paused = true)]
async fn crash_fails_task_and_replaces_worker() {
    let pool = scripted_pool(1, ms(1000));

    let err = pool.submit(json!({"panic": true}), None).await.unwrap_err();
    assert!(
        matches!(err, TaskError::WorkerFault { ref reason, .. } if reason.contains("worker crashed")),
        "unexpected {err:?}"
    );
    assert!(err.is_retryable());

    let stats = pool.stats().await.unwrap();
    assert_eq!(stats.workers, 1);
    assert_eq!(stats.restarts, 1);
    assert_eq!(stats.faulted, 1);

    let output = pool.submit(json!({"value": "e"}), None).await.unwrap();
    assert_eq!(output.result, json!("e"));
}

#[tokio::test(start_paused = true)]
async fn crash_leaves_other_workers_alone() {
    let pool = scripted_pool(2, ms(1000));

    let slow = pool.submit(json!({"sleepMs": 50, "value": "slow"}), None);
    let doomed = pool.submit(json!({"sleepMs": 10, "panic": true}), None);

    let (slow, doomed) = tokio::join!(slow, doomed);
    assert_eq!(doomed.unwrap_err().kind(), TaskErrorKind::WorkerFault);
    assert_eq!(slow.unwrap().result, json!("slow"));
}

#[tokio::test(start_paused = true)]
async fn late_reply_is_discarded_and_frees_worker() {
    let pool = scripted_pool(1, ms(50));

    // Finishes 30ms after its deadline.
    let late = pool.submit(json!({"sleepMs": 80, "value": "late"}), None);
    let next = pool.submit(json!({"value": "next"}), None);

    assert_eq!(late.await.unwrap_err().kind(), TaskErrorKind::Timeout);
    // The late reply frees the worker; it must not be mistaken for `next`.
    assert_eq!(next.await.unwrap().result, json!("next"));

    let stats = pool.stats().await.unwrap();
    assert_eq!(stats.late_replies, 1);
    assert_eq!(stats.timed_out, 1);
    assert_eq!(stats.succeeded, 1);
}

#[tokio::test(start_paused = true)]
async fn dispatch_is_fifo() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&order);
    let handler = move |payload: Value| {
        let seen = Arc::clone(&seen);
        async move {
            seen.lock().unwrap().push(payload.as_u64().unwrap());
            Ok::<_, String>(payload)
        }
    };
    let pool = Pool::start("fifo", PoolSpec::in_process(1, ms(100), handler)).unwrap();

    let handles: Vec<_> = (0..8).map(|n| pool.submit(json!(n), None)).collect();
    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(*order.lock().unwrap(), (0..8).collect::<Vec<u64>>());
}

#[tokio::test(start_paused = true)]
async fn never_exceeds_max_workers() {
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (r, p) = (Arc::clone(&running), Arc::clone(&peak));
    let handler = move |_: Value| {
        let (running, peak) = (Arc::clone(&r), Arc::clone(&p));
        async move {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(ms(10)).await;
            running.fetch_sub(1, Ordering::SeqCst);
            Ok::<_, String>(Value::Null)
        }
    };
    let pool = Pool::start("cap", PoolSpec::in_process(3, ms(1000), handler)).unwrap();

    let handles: Vec<_> = (0..20).map(|_| pool.submit(Value::Null, None)).collect();
    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(peak.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn queue_wait_does_not_count_against_dispatch_anchored_timeout() {
    let pool = scripted_pool(1, ms(50));

    let first = pool.submit(json!({"sleepMs": 40}), None);
    let second = pool.submit(json!({"sleepMs": 20, "value": 2}), None);

    assert!(first.await.is_ok());
    assert_eq!(second.await.unwrap().result, json!(2));
}

#[tokio::test(start_paused = true)]
async fn submission_anchor_counts_queue_wait() {
    let spec = PoolSpec::in_process(1, ms(50), scripted)
        .with_timeout_anchor(TimeoutAnchor::Submission);
    let pool = Pool::start("test", spec).unwrap();

    let first = pool.submit(json!({"sleepMs": 40}), None);
    let second = pool.submit(json!({"sleepMs": 20}), None);

    assert!(first.await.is_ok());
    assert_eq!(second.await.unwrap_err().kind(), TaskErrorKind::Timeout);
}

#[tokio::test(start_paused = true)]
async fn submission_anchor_expires_queued_tasks() {
    let spec = PoolSpec::in_process(1, ms(50), scripted)
        .with_timeout_anchor(TimeoutAnchor::Submission);
    let pool = Pool::start("test", spec).unwrap();

    let hung = pool.submit(json!({"hang": true}), None);
    let queued = pool.submit(json!({"value": 1}), None);

    assert_eq!(queued.await.unwrap_err().kind(), TaskErrorKind::Timeout);
    assert_eq!(hung.await.unwrap_err().kind(), TaskErrorKind::Timeout);

    let stats = pool.stats().await.unwrap();
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.timed_out, 2);
}

#[tokio::test(start_paused = true)]
async fn timeout_override_and_zero_fallback() {
    let pool = scripted_pool(2, ms(1000));

    let short = pool.submit(json!({"hang": true}), Some(ms(20)));
    let zero = pool.submit(json!({"hang": true}), Some(Duration::ZERO));

    match short.await.unwrap_err() {
        TaskError::Timeout { timeout, .. } => assert_eq!(timeout, ms(20)),
        other => panic!("unexpected {other:?}"),
    }
    match zero.await.unwrap_err() {
        TaskError::Timeout { timeout, .. } => assert_eq!(timeout, ms(1000)),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn unbounded_timeout_override_leaves_pool_running() {
    for anchor in [TimeoutAnchor::Dispatch, TimeoutAnchor::Submission] {
        let spec = PoolSpec::in_process(2, ms(1000), scripted).with_timeout_anchor(anchor);
        let pool = Pool::start("test", spec).unwrap();

        let huge = pool.submit(json!({"hang": true}), Some(Duration::MAX));
        let bystander = pool.submit(json!({"sleepMs": 50, "value": "ok"}), None);
        assert_eq!(bystander.await.unwrap().result, json!("ok"));

        let stats = pool.stats().await.unwrap();
        assert_eq!((stats.active, stats.workers), (1, 2));
        assert!(!pool.is_closed());

        pool.shutdown().await;
        assert_eq!(huge.await.unwrap_err().kind(), TaskErrorKind::Shutdown);
    }
}

#[tokio::test(start_paused = true)]
async fn shutdown_fails_everything_and_is_idempotent() {
    let pool = scripted_pool(1, ms(10_000));

    let active = pool.submit(json!({"hang": true}), None);
    let pending = pool.submit(json!({"value": 1}), None);
    let stats = pool.stats().await.unwrap();
    assert_eq!((stats.active, stats.pending), (1, 1));

    pool.shutdown().await;
    assert!(pool.is_closed());

    for handle in [active, pending] {
        match handle.await.unwrap_err() {
            TaskError::Shutdown { pool: name, .. } => assert_eq!(name, "test"),
            other => panic!("unexpected {other:?}"),
        }
    }

    pool.shutdown().await;
    let err = pool.submit(json!({}), None).await.unwrap_err();
    assert_eq!(err.kind(), TaskErrorKind::Shutdown);
    assert!(matches!(pool.stats().await, Err(PoolError::Closed(name)) if name == "test"));
}

#[tokio::test(start_paused = true)]
async fn dropping_every_handle_shuts_down() {
    let pool = scripted_pool(1, ms(10_000));
    let clone = pool.clone();
    let task = pool.submit(json!({"hang": true}), None);

    drop(pool);
    drop(clone);
    assert_eq!(task.await.unwrap_err().kind(), TaskErrorKind::Shutdown);
}

#[tokio::test]
async fn rejects_invalid_spec() {
    let err = Pool::start("bad", PoolSpec::in_process(0, ms(10), scripted)).unwrap_err();
    assert!(matches!(err, PoolError::InvalidConfig(_)));
    let err = Pool::start("bad", PoolSpec::in_process(1, Duration::ZERO, scripted)).unwrap_err();
    assert!(matches!(err, PoolError::InvalidConfig(_)));
}

// Fake units give the tests direct control over replies and faults.

#[derive(Default)]
struct FakeState {
    /// Outcome of upcoming spawns; empty means succeed.
    spawn_plan: VecDeque<bool>,
    reject_dispatch: bool,
    spawned: Vec<(WorkerRef, ReportSender)>,
    dispatched: Vec<(WorkerRef, TaskMessage)>,
    terminated: Vec<WorkerRef>,
}

#[derive(Clone, Default)]
struct FakeSpawner(Arc<Mutex<FakeState>>);

impl FakeSpawner {
    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.0.lock().unwrap()
    }

    fn reports_for(&self, worker: WorkerRef) -> ReportSender {
        self.state()
            .spawned
            .iter()
            .find(|(w, _)| *w == worker)
            .map(|(_, tx)| tx.clone())
            .expect("worker was spawned")
    }

    fn last_dispatch(&self) -> (WorkerRef, TaskMessage) {
        self.state().dispatched.last().cloned().expect("a dispatch")
    }
}

impl WorkerSpawner for FakeSpawner {
    fn spawn(
        &self,
        worker: WorkerRef,
        reports: ReportSender,
    ) -> Result<Box<dyn WorkerUnit>, WorkerError> {
        let mut state = self.state();
        if !state.spawn_plan.pop_front().unwrap_or(true) {
            return Err(WorkerError::Spawn {
                reason: "no capacity".into(),
            });
        }
        state.spawned.push((worker, reports));
        Ok(Box::new(FakeUnit {
            worker,
            state: Arc::clone(&self.0),
        }))
    }
}

struct FakeUnit {
    worker: WorkerRef,
    state: Arc<Mutex<FakeState>>,
}

impl WorkerUnit for FakeUnit {
    fn dispatch(&mut self, task: TaskMessage) -> Result<(), WorkerError> {
        task.check_payload()
            .map_err(|reason| WorkerError::Rejected { reason })?;
        let mut state = self.state.lock().unwrap();
        if state.reject_dispatch {
            return Err(WorkerError::Send {
                worker: self.worker,
                reason: "pipe closed".into(),
            });
        }
        state.dispatched.push((self.worker, task));
        Ok(())
    }

    fn terminate(self: Box<Self>) {
        self.state.lock().unwrap().terminated.push(self.worker);
    }
}

const fn w(slot: usize, generation: u64) -> WorkerRef {
    WorkerRef { slot, generation }
}

fn fake_pool(max_workers: usize, spawner: &FakeSpawner) -> Pool {
    let spec = PoolSpec::new(max_workers, ms(1000), spawner.clone()).with_respawn_backoff(ms(500));
    Pool::start("fake", spec).unwrap()
}

#[tokio::test]
async fn failed_initial_spawn_tears_down_started_units() {
    let spawner = FakeSpawner::default();
    spawner.state().spawn_plan.extend([true, false]);

    let spec = PoolSpec::new(3, ms(1000), spawner.clone());
    match Pool::start("fake", spec) {
        Err(PoolError::Spawn { pool, slot, .. }) => {
            assert_eq!(pool, "fake");
            assert_eq!(slot, 1);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(spawner.state().terminated, vec![w(0, 0)]);
}

#[tokio::test]
async fn reply_for_unassigned_task_is_ignored() {
    let spawner = FakeSpawner::default();
    let pool = fake_pool(1, &spawner);

    let handle = pool.submit(json!({"n": 1}), None);
    pool.stats().await.unwrap();
    let (worker, task) = spawner.last_dispatch();
    let reports = spawner.reports_for(worker);

    for bogus in ["not-a-task".to_string(), TaskId::new().to_string()] {
        reports
            .send(WorkerReport::completed(
                worker,
                ResultMessage::success(bogus, json!("wrong"), ms(1)),
            ))
            .unwrap();
    }
    let stats = pool.stats().await.unwrap();
    assert_eq!((stats.active, stats.busy, stats.late_replies), (1, 1, 0));

    reports
        .send(WorkerReport::completed(
            worker,
            ResultMessage::success(task.task_id, json!("right"), ms(3)),
        ))
        .unwrap();
    let output = handle.await.unwrap();
    assert_eq!(output.result, json!("right"));
    assert_eq!(output.processing_time, ms(3));
}

#[tokio::test]
async fn reports_from_replaced_workers_are_ignored() {
    let spawner = FakeSpawner::default();
    let pool = fake_pool(1, &spawner);

    let handle = pool.submit(json!({}), None);
    pool.stats().await.unwrap();
    let (worker, task) = spawner.last_dispatch();
    assert_eq!(worker, w(0, 0));
    let stale = spawner.reports_for(worker);

    stale
        .send(WorkerReport::faulted(worker, "exit 139"))
        .unwrap();
    match handle.await.unwrap_err() {
        TaskError::WorkerFault { reason, .. } => assert_eq!(reason, "exit 139"),
        other => panic!("unexpected {other:?}"),
    }

    stale
        .send(WorkerReport::completed(
            worker,
            ResultMessage::success(task.task_id, json!(1), ms(1)),
        ))
        .unwrap();
    stale
        .send(WorkerReport::faulted(worker, "exit 139"))
        .unwrap();

    let stats = pool.stats().await.unwrap();
    assert_eq!(stats.restarts, 1);
    assert_eq!(stats.late_replies, 0);
    assert_eq!(stats.available, 1);
    assert_eq!(spawner.state().terminated, vec![w(0, 0)]);
    assert!(
        spawner
            .state()
            .spawned
            .iter()
            .any(|(worker, _)| *worker == w(0, 1))
    );
}

#[tokio::test]
async fn failed_dispatch_faults_task_and_replaces_worker() {
    let spawner = FakeSpawner::default();
    let pool = fake_pool(1, &spawner);
    spawner.state().reject_dispatch = true;

    let err = pool.submit(json!({}), None).await.unwrap_err();
    assert!(
        matches!(err, TaskError::WorkerFault { ref reason, .. } if reason.contains("pipe closed")),
        "unexpected {err:?}"
    );

    spawner.state().reject_dispatch = false;
    let _handle = pool.submit(json!({}), None);
    pool.stats().await.unwrap();
    assert_eq!(spawner.last_dispatch().0, w(0, 1));
    assert_eq!(spawner.state().terminated, vec![w(0, 0)]);
}

#[tokio::test]
async fn rejected_payload_fails_task_but_keeps_worker() {
    let spawner = FakeSpawner::default();
    let pool = fake_pool(1, &spawner);

    let err = pool
        .submit(json!({"taskId": "spoofed", "page": 1}), None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), TaskErrorKind::Application);

    let _handle = pool.submit(json!({"page": 2}), None);
    let stats = pool.stats().await.unwrap();
    assert_eq!((stats.active, stats.restarts, stats.failed), (1, 0, 1));
    let (worker, task) = spawner.last_dispatch();
    assert_eq!(worker, w(0, 0));
    assert_eq!(task.payload, json!({"page": 2}));
    assert!(spawner.state().terminated.is_empty());
}

#[tokio::test(start_paused = true)]
async fn failed_respawn_is_retried_after_backoff() {
    let spawner = FakeSpawner::default();
    let pool = fake_pool(1, &spawner);

    let crashed = pool.submit(json!({}), None);
    pool.stats().await.unwrap();
    let (worker, _) = spawner.last_dispatch();
    spawner.state().spawn_plan.push_back(false);
    spawner
        .reports_for(worker)
        .send(WorkerReport::faulted(worker, "killed by signal 9"))
        .unwrap();
    assert_eq!(crashed.await.unwrap_err().kind(), TaskErrorKind::WorkerFault);

    let waiting = pool.submit(json!({"n": 2}), None);
    let stats = pool.stats().await.unwrap();
    assert_eq!((stats.workers, stats.pending, stats.restarts), (0, 1, 1));

    tokio::time::sleep(ms(501)).await;
    let stats = pool.stats().await.unwrap();
    assert_eq!((stats.workers, stats.pending, stats.active), (1, 0, 1));

    let (worker, task) = spawner.last_dispatch();
    assert_eq!(worker, w(0, 1));
    spawner
        .reports_for(worker)
        .send(WorkerReport::completed(
            worker,
            ResultMessage::success(task.task_id, json!("ok"), ms(1)),
        ))
        .unwrap();
    assert_eq!(waiting.await.unwrap().result, json!("ok"));
}
