//! Error types for `Offload` core library.

use thiserror::Error;

/// Result type alias using `Offload` Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for `Offload` operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed worker protocol line
    #[error("Worker protocol error: {0}")]
    Protocol(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// OTLP pipeline setup or shutdown failure
    #[error("OpenTelemetry error: {0}")]
    Telemetry(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
