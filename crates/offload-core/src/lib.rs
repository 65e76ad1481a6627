//! `Offload` Core Library
//!
//! Shared functionality for `Offload` components:
//! - NDJSON wire protocol spoken between a pool and its worker units
//! - Configuration resolution and hierarchy
//! - Tracing initialisation
//! - Common error types

pub mod config;
pub mod error;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod protocol;
pub mod tracing_init;

pub use config::{Config, PoolConfig, TimeoutAnchor};
pub use error::{Error, Result};
pub use protocol::{ResultMessage, TaskMessage};
