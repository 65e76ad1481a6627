//! Subprocess worker units.
//!
//! Each unit is a child process speaking the NDJSON worker protocol on its
//! stdin/stdout. A supervisor task owns the child: it turns stdout lines
//! into reports, and reports a fault when stdout closes, when a line does
//! not parse, or when writing a task fails. Stderr is forwarded to the log.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use offload_core::protocol::{encode_line, parse_result_line};
use offload_core::{PoolConfig, TaskMessage};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::{ReportSender, WorkerError, WorkerRef, WorkerReport, WorkerSpawner, WorkerUnit};

/// Default grace period between SIGTERM and SIGKILL.
const DEFAULT_TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// Spawns `program args...` once per worker slot.
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    program: PathBuf,
    args: Vec<String>,
    terminate_grace: Duration,
}

impl ProcessSpawner {
    pub fn new<I, S>(program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            terminate_grace: DEFAULT_TERMINATE_GRACE,
        }
    }

    pub fn from_config(config: &PoolConfig) -> Self {
        Self::new(config.program.clone(), config.args.iter().cloned())
            .with_terminate_grace(config.terminate_grace())
    }

    #[must_use]
    pub const fn with_terminate_grace(mut self, grace: Duration) -> Self {
        self.terminate_grace = grace;
        self
    }
}

impl WorkerSpawner for ProcessSpawner {
    fn spawn(
        &self,
        worker: WorkerRef,
        reports: ReportSender,
    ) -> Result<Box<dyn WorkerUnit>, WorkerError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| WorkerError::Spawn {
                reason: format!("{}: {e}", self.program.display()),
            })?;

        let pid = child.id();
        let stdin = child.stdin.take().ok_or_else(|| WorkerError::Spawn {
            reason: "Failed to capture stdin".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| WorkerError::Spawn {
            reason: "Failed to capture stdout".to_string(),
        })?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(%worker, "stderr: {}", line);
                }
                debug!(%worker, "stderr reader finished");
            });
        }

        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel::<String>();
        tokio::spawn(write_tasks(worker, stdin, stdin_rx, reports.clone()));

        let (stop_tx, stop_rx) = oneshot::channel();
        tokio::spawn(supervise(
            worker,
            child,
            stdout,
            stop_rx,
            self.terminate_grace,
            reports,
        ));

        info!(%worker, pid, program = %self.program.display(), "Spawned worker process");

        Ok(Box::new(ProcessWorker {
            worker,
            stdin_tx,
            stop_tx: Some(stop_tx),
        }))
    }
}

/// Handle to a running worker process.
struct ProcessWorker {
    worker: WorkerRef,
    stdin_tx: mpsc::UnboundedSender<String>,
    stop_tx: Option<oneshot::Sender<()>>,
}

impl WorkerUnit for ProcessWorker {
    fn dispatch(&mut self, task: TaskMessage) -> Result<(), WorkerError> {
        task.check_payload()
            .map_err(|reason| WorkerError::Rejected { reason })?;
        let line = encode_line(&task).map_err(|e| WorkerError::Send {
            worker: self.worker,
            reason: e.to_string(),
        })?;
        self.stdin_tx.send(line).map_err(|_| WorkerError::Send {
            worker: self.worker,
            reason: "stdin closed".to_string(),
        })
    }

    fn terminate(mut self: Box<Self>) {
        if let Some(stop) = self.stop_tx.take() {
            let _ = stop.send(());
        }
    }
}

async fn write_tasks(
    worker: WorkerRef,
    mut stdin: ChildStdin,
    mut lines: mpsc::UnboundedReceiver<String>,
    reports: ReportSender,
) {
    while let Some(line) = lines.recv().await {
        if let Err(e) = write_line(&mut stdin, &line).await {
            warn!(%worker, error = %e, "Failed to write task to worker");
            let _ = reports.send(WorkerReport::faulted(
                worker,
                format!("failed to write task: {e}"),
            ));
            break;
        }
    }
}

async fn write_line(stdin: &mut ChildStdin, line: &str) -> std::io::Result<()> {
    stdin.write_all(line.as_bytes()).await?;
    stdin.write_all(b"\n").await?;
    stdin.flush().await
}

async fn supervise(
    worker: WorkerRef,
    mut child: Child,
    stdout: ChildStdout,
    mut stop: oneshot::Receiver<()>,
    grace: Duration,
    reports: ReportSender,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        tokio::select! {
            // Fires on an explicit stop and when the handle is dropped.
            _ = &mut stop => {
                stop_child(worker, &mut child, grace).await;
                return;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => match parse_result_line(&line) {
                    Ok(result) => {
                        if reports.send(WorkerReport::completed(worker, result)).is_err() {
                            stop_child(worker, &mut child, grace).await;
                            return;
                        }
                    }
                    Err(e) => {
                        warn!(%worker, error = %e, "Worker broke protocol, killing it");
                        let _ = child.kill().await;
                        let _ = reports.send(WorkerReport::faulted(worker, e.to_string()));
                        return;
                    }
                },
                Ok(None) => {
                    let reason = match child.wait().await {
                        Ok(status) => describe_exit(status),
                        Err(e) => format!("worker exited (wait failed: {e})"),
                    };
                    let _ = reports.send(WorkerReport::faulted(worker, reason));
                    return;
                }
                Err(e) => {
                    let _ = child.kill().await;
                    let _ = reports.send(WorkerReport::faulted(
                        worker,
                        format!("failed to read worker output: {e}"),
                    ));
                    return;
                }
            },
        }
    }
}

/// SIGTERM, wait up to `grace`, then SIGKILL.
async fn stop_child(worker: WorkerRef, child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // SAFETY: pid is a valid process ID obtained from our own Child handle.
            // kill(2) with SIGTERM is safe to call on any owned subprocess.
            #[allow(unsafe_code)]
            #[allow(clippy::cast_possible_wrap)]
            let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
            if ret != 0 {
                let err = std::io::Error::last_os_error();
                warn!(%worker, pid, error = %err, "Failed to send SIGTERM");
            }
        }
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => debug!(%worker, ?status, "Worker process stopped"),
        Ok(Err(e)) => {
            warn!(%worker, error = %e, "Error waiting for worker process");
            child.kill().await.ok();
        }
        Err(_) => {
            warn!(%worker, "Timeout waiting for graceful shutdown, killing");
            child.kill().await.ok();
        }
    }
}

fn describe_exit(status: ExitStatus) -> String {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("worker killed by signal {signal}");
        }
    }
    status.code().map_or_else(
        || "worker exited".to_string(),
        |code| format!("worker exited with code {code}"),
    )
}
