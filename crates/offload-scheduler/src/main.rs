//! `offload` daemon
//!
//! Serves NDJSON task requests on stdin against the worker pools declared in
//! the settings files, writing one response per request to stdout.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tracing::info;

use offload_scheduler::service::serve;
use offload_scheduler::{Registry, install_exit_hook};

#[derive(Parser, Debug)]
#[command(name = "offload")]
#[command(version, about = "Offload - bounded worker pools for blocking work")]
struct Args {
    /// Settings file to use instead of the global/project lookup.
    #[arg(long, env = "OFFLOAD_CONFIG")]
    config: Option<PathBuf>,

    /// Log level filter (e.g. "info", "debug", "warn"). Overrides settings.
    #[arg(long, env = "OFFLOAD_LOG_LEVEL")]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "OFFLOAD_LOG_JSON")]
    log_json: bool,

    /// OpenTelemetry OTLP endpoint for traces and metrics export
    /// (e.g. `http://localhost:4317`). Requires the `metrics` feature.
    #[cfg(feature = "metrics")]
    #[arg(long, env = "OFFLOAD_METRICS_ENDPOINT")]
    metrics_endpoint: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => offload_core::config::load_config_from(path)?,
        None => offload_core::config::load_config(std::env::current_dir().ok().as_deref())?,
    };

    #[cfg(feature = "metrics")]
    let metrics_endpoint = args.metrics_endpoint.as_deref();
    #[cfg(not(feature = "metrics"))]
    let metrics_endpoint: Option<&str> = None;

    // Held until exit so the OTLP pipeline keeps exporting.
    let log_level = args.log_level.as_deref().unwrap_or(&config.log_level);
    let log_filter = format!("offload={log_level},offload_scheduler={log_level}");
    #[cfg_attr(not(feature = "metrics"), allow(unused_variables))]
    let telemetry = offload_core::tracing_init::init_tracing_with_metrics(
        &log_filter,
        args.log_json || config.log_json,
        metrics_endpoint,
    );

    let mut pools: Vec<&str> = config.pools.keys().map(String::as_str).collect();
    pools.sort_unstable();
    info!(
        version = env!("CARGO_PKG_VERSION"),
        ?pools,
        "Starting offload"
    );

    let registry = Arc::new(Registry::from_config(&config));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut server = tokio::spawn(serve(
        Arc::clone(&registry),
        tokio::io::stdin(),
        tokio::io::stdout(),
        shutdown_rx,
    ));

    // Notify systemd that the daemon is ready to serve (unix only).
    // The `true` parameter unsets $NOTIFY_SOCKET so worker processes
    // don't accidentally notify systemd.
    #[cfg(unix)]
    sd_notify::notify(true, &[sd_notify::NotifyState::Ready])?;

    let mut exit_hook = install_exit_hook(Arc::clone(&registry));
    tokio::select! {
        result = &mut server => {
            // Input closed; in-flight requests have been answered.
            exit_hook.abort();
            result??;
            registry.shutdown_all().await;
        }
        _ = &mut exit_hook => {
            // Pools are already down; stop intake and flush the responses.
            let _ = shutdown_tx.send(true);
            server.await??;
        }
    }

    #[cfg(feature = "metrics")]
    if let Some(Err(e)) = telemetry.map(offload_core::metrics::TelemetryPipeline::shutdown) {
        tracing::warn!(error = %e, "Failed to flush telemetry");
    }

    info!("offload stopped");
    Ok(())
}
