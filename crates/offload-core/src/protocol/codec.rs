//! Line codec for the worker protocol.
//!
//! Tolerant reader: unknown fields are ignored, but the correlation id and
//! the success flag are mandatory.

use serde::Serialize;
use serde_json::Value;

use super::types::{ResultMessage, TaskMessage};
use crate::error::{Error, Result};

/// Serialize a message into a single line (without the trailing newline).
pub fn encode_line<T: Serialize>(message: &T) -> Result<String> {
    Ok(serde_json::to_string(message)?)
}

/// Parse one line written by a worker.
pub fn parse_result_line(line: &str) -> Result<ResultMessage> {
    let raw = parse_object(line)?;
    require_str(&raw, "taskId")?;
    if !raw.get("success").is_some_and(Value::is_boolean) {
        return Err(Error::Protocol("Missing 'success' field".into()));
    }
    Ok(serde_json::from_value(raw)?)
}

/// Parse one line written by the pool.
pub fn parse_task_line(line: &str) -> Result<TaskMessage> {
    let raw = parse_object(line)?;
    require_str(&raw, "taskId")?;
    Ok(serde_json::from_value(raw)?)
}

fn parse_object(line: &str) -> Result<Value> {
    let raw: Value = serde_json::from_str(line.trim())
        .map_err(|e| Error::Protocol(format!("Invalid JSON line: {e}")))?;
    if !raw.is_object() {
        return Err(Error::Protocol("Expected a JSON object".into()));
    }
    Ok(raw)
}

fn require_str(raw: &Value, field: &str) -> Result<()> {
    match raw.get(field) {
        Some(Value::String(_)) => Ok(()),
        _ => Err(Error::Protocol(format!("Missing '{field}' field"))),
    }
}
