//! Offload Scheduler Library
//!
//! Offloads expensive, blocking work onto a fixed set of worker units:
//! - Worker units: subprocesses speaking NDJSON, or in-process handlers
//! - Pools: FIFO dispatch, per-task timeouts, crash detection and replacement
//! - Registry: named pools created lazily and shut down together at exit
//! - Service: the NDJSON request loop behind the `offload` daemon

pub mod pool;
pub mod registry;
pub mod service;
pub mod signals;
mod telemetry;
pub mod worker;

pub use pool::{
    Pool, PoolError, PoolSpec, PoolStats, TaskError, TaskErrorKind, TaskHandle, TaskId,
    TaskOutput,
};
pub use registry::{Registry, RegistryError, exit_hook_on, install_exit_hook};
