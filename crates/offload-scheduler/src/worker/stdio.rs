//! Worker-side protocol loop.
//!
//! Any program can become a worker unit by running [`run_stdio_worker`]
//! with its [`TaskHandler`]: tasks are read from stdin one line at a time
//! and answered on stdout, strictly one task at a time.

use offload_core::protocol::{encode_line, parse_task_line};
use offload_core::ResultMessage;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::TaskHandler;

/// Serve tasks on this process's stdin/stdout until stdin closes.
pub async fn run_stdio_worker<H: TaskHandler>(handler: H) -> std::io::Result<()> {
    run_worker_loop(&handler, tokio::io::stdin(), tokio::io::stdout()).await
}

/// Serve tasks from `reader`, writing one result line per task to `writer`.
pub async fn run_worker_loop<H, R, W>(handler: &H, reader: R, mut writer: W) -> std::io::Result<()>
where
    H: TaskHandler + ?Sized,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let task = match parse_task_line(&line) {
            Ok(task) => task,
            Err(e) => {
                // Without a task id there is nobody to answer.
                warn!(error = %e, "Skipping malformed task line");
                continue;
            }
        };

        debug!(task_id = %task.task_id, "Task received");
        let started = Instant::now();
        let reply = match handler.handle(task.payload).await {
            Ok(value) => ResultMessage::success(task.task_id, value, started.elapsed()),
            Err(message) => ResultMessage::failure(task.task_id, message, started.elapsed()),
        };

        let line = encode_line(&reply).map_err(std::io::Error::other)?;
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
    }
    debug!("Input closed, worker exiting");
    Ok(())
}
