//! NDJSON request loop for the `offload` daemon.
//!
//! One JSON request per input line, one JSON response per request. Requests
//! run concurrently, so responses can come back out of order; callers match
//! them up by `id`.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::pool::{PoolStats, TaskError, TaskOutput};
use crate::registry::{Registry, RegistryError};

/// An inbound request line.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    /// Run `payload` on the named pool.
    Submit {
        #[serde(default)]
        id: Option<Value>,
        pool: String,
        #[serde(default)]
        payload: Value,
        #[serde(default, rename = "timeoutMs")]
        timeout_ms: Option<u64>,
    },
    /// Report statistics for every live pool.
    Stats {
        #[serde(default)]
        id: Option<Value>,
    },
}

/// Error details carried by a failed [`Response`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
}

/// An outbound response line. `id` echoes the request's `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_time_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<Vec<PoolStats>>,
}

impl Response {
    fn empty(id: Option<Value>, ok: bool) -> Self {
        Self {
            id,
            ok,
            task_id: None,
            result: None,
            error: None,
            processing_time_ms: None,
            stats: None,
        }
    }

    fn completed(id: Option<Value>, output: TaskOutput) -> Self {
        Self {
            task_id: Some(output.task_id.to_string()),
            result: Some(output.result),
            processing_time_ms: Some(
                u64::try_from(output.processing_time.as_millis()).unwrap_or(u64::MAX),
            ),
            ..Self::empty(id, true)
        }
    }

    fn task_failed(id: Option<Value>, err: &TaskError) -> Self {
        Self {
            task_id: Some(err.task_id().to_string()),
            ..Self::error(id, err.kind().as_str(), err.to_string())
        }
    }

    fn error(id: Option<Value>, kind: &str, message: String) -> Self {
        Self {
            error: Some(ErrorBody {
                kind: kind.to_string(),
                message,
            }),
            ..Self::empty(id, false)
        }
    }

    fn stats(id: Option<Value>, stats: Vec<PoolStats>) -> Self {
        Self {
            stats: Some(stats),
            ..Self::empty(id, true)
        }
    }
}

/// Read requests from `reader` until it closes or `shutdown` flips, writing
/// responses to `writer`.
///
/// On shutdown every pool is shut down first, so in-flight submissions
/// still get a (failed) response. Returns once every response is flushed.
pub async fn serve<R, W>(
    registry: Arc<Registry>,
    reader: R,
    writer: W,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let writer_task = tokio::spawn(write_responses(writer, out_rx));

    let mut in_flight = JoinSet::new();
    let mut lines = BufReader::new(reader).lines();
    loop {
        tokio::select! {
            biased;
            Ok(()) = shutdown.changed() => {
                info!(in_flight = in_flight.len(), "Shutdown requested, stopping intake");
                registry.shutdown_all().await;
                break;
            }
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Err(e) = joined {
                    warn!(error = %e, "Request handler failed");
                }
            }
            line = lines.next_line() => match line? {
                None => {
                    debug!("Request stream closed");
                    break;
                }
                Some(line) if line.trim().is_empty() => {}
                Some(line) => match serde_json::from_str::<Request>(&line) {
                    Ok(request) => {
                        let registry = Arc::clone(&registry);
                        let out = out_tx.clone();
                        in_flight.spawn(async move {
                            let _ = out.send(handle(&registry, request).await);
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "Rejecting malformed request");
                        let _ = out_tx.send(Response::error(None, "invalid_request", e.to_string()));
                    }
                },
            },
        }
    }

    while let Some(joined) = in_flight.join_next().await {
        if let Err(e) = joined {
            warn!(error = %e, "Request handler failed");
        }
    }
    drop(out_tx);
    writer_task.await.map_err(std::io::Error::other)?
}

async fn handle(registry: &Registry, request: Request) -> Response {
    match request {
        Request::Stats { id } => Response::stats(id, registry.stats().await),
        Request::Submit {
            id,
            pool,
            payload,
            timeout_ms,
        } => {
            let pool = match registry.get_pool(&pool, None).await {
                Ok(pool) => pool,
                Err(e) => {
                    let kind = match e {
                        RegistryError::UnknownPool { .. } => "unknown_pool",
                        RegistryError::Pool(_) => "pool_unavailable",
                    };
                    return Response::error(id, kind, e.to_string());
                }
            };
            match pool.submit(payload, timeout_ms.map(Duration::from_millis)).await {
                Ok(output) => Response::completed(id, output),
                Err(e) => Response::task_failed(id, &e),
            }
        }
    }
}

async fn write_responses<W>(
    mut writer: W,
    mut responses: mpsc::UnboundedReceiver<Response>,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(response) = responses.recv().await {
        let mut line = serde_json::to_string(&response).map_err(std::io::Error::other)?;
        line.push('\n');
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
    }
    Ok(())
}
