//! `offload-worker`
//!
//! Reference worker program speaking the NDJSON worker protocol on
//! stdin/stdout. The payload's `op` field selects the behaviour:
//!
//! - `echo` (default): return `value`, or the whole payload
//! - `sleep`: wait `ms` milliseconds, then echo
//! - `fail`: report an application error carrying `message`
//! - `crash`: exit with code 101 mid-task
//! - `hang`: never answer

use std::time::Duration;

use clap::Parser;
use serde_json::Value;
use tracing::{info, warn};

use offload_scheduler::worker::run_stdio_worker;

/// Exit code used by the `crash` op.
const CRASH_EXIT_CODE: i32 = 101;

#[derive(Parser, Debug)]
#[command(name = "offload-worker")]
#[command(version, about = "Offload reference worker")]
struct Args {
    /// Log level filter for stderr output.
    #[arg(long, default_value = "warn", env = "OFFLOAD_WORKER_LOG_LEVEL")]
    log_level: String,
}

async fn handle(payload: Value) -> Result<Value, String> {
    match payload.get("op").and_then(Value::as_str).unwrap_or("echo") {
        "echo" => Ok(echo(payload)),
        "sleep" => {
            let ms = payload.get("ms").and_then(Value::as_u64).unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(echo(payload))
        }
        "fail" => Err(payload
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("task failed")
            .to_string()),
        "crash" => {
            warn!("Crashing on request");
            std::process::exit(CRASH_EXIT_CODE);
        }
        "hang" => std::future::pending().await,
        other => Err(format!("unknown op '{other}'")),
    }
}

fn echo(mut payload: Value) -> Value {
    payload
        .get_mut("value")
        .map(Value::take)
        .unwrap_or(payload)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let level = &args.log_level;
    offload_core::tracing_init::init_tracing(
        &format!("offload_worker={level},offload_scheduler={level}"),
        false,
    );

    info!(pid = std::process::id(), "Worker ready");
    run_stdio_worker(handle).await?;
    Ok(())
}
