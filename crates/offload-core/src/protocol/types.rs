//! Message types for the worker protocol.

use std::time::Duration;

use serde::ser::{Error as _, SerializeMap};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};

const TASK_ID_KEY: &str = "taskId";
/// Key carrying payloads that are not JSON objects.
const PAYLOAD_KEY: &str = "payload";

/// Task handed to a worker unit.
///
/// On the wire an object payload is spread beside `taskId`:
/// `{"taskId":"t-1","page":3}`. Any other payload travels under `payload`:
/// `{"taskId":"t-1","payload":[1,2]}`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "Map<String, Value>")]
pub struct TaskMessage {
    pub task_id: String,
    /// Opaque cargo; the scheduler never inspects it.
    pub payload: Value,
}

impl TaskMessage {
    pub fn new(task_id: impl Into<String>, payload: Value) -> Self {
        Self {
            task_id: task_id.into(),
            payload,
        }
    }

    /// Whether the payload can be written to the wire unambiguously.
    ///
    /// An object payload may not carry its own `taskId`, nor consist of a
    /// lone non-object `payload` field (that shape denotes a bare value).
    pub fn check_payload(&self) -> Result<(), String> {
        let Value::Object(fields) = &self.payload else {
            return Ok(());
        };
        if fields.contains_key(TASK_ID_KEY) {
            return Err(format!("payload must not carry its own '{TASK_ID_KEY}' field"));
        }
        if is_wrapped(fields) {
            return Err(format!(
                "payload whose only field is a non-object '{PAYLOAD_KEY}' is ambiguous"
            ));
        }
        Ok(())
    }
}

fn is_wrapped(fields: &Map<String, Value>) -> bool {
    fields.len() == 1 && fields.get(PAYLOAD_KEY).is_some_and(|v| !v.is_object())
}

impl Serialize for TaskMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.check_payload().map_err(S::Error::custom)?;
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry(TASK_ID_KEY, &self.task_id)?;
        match &self.payload {
            Value::Object(fields) => {
                for (key, value) in fields {
                    map.serialize_entry(key, value)?;
                }
            }
            other => map.serialize_entry(PAYLOAD_KEY, other)?,
        }
        map.end()
    }
}

impl TryFrom<Map<String, Value>> for TaskMessage {
    type Error = String;

    fn try_from(mut fields: Map<String, Value>) -> Result<Self, Self::Error> {
        let Some(Value::String(task_id)) = fields.remove(TASK_ID_KEY) else {
            return Err(format!("missing '{TASK_ID_KEY}' field"));
        };
        let payload = if is_wrapped(&fields) {
            fields.remove(PAYLOAD_KEY).unwrap_or_default()
        } else {
            Value::Object(fields)
        };
        Ok(Self { task_id, payload })
    }
}

/// Outcome reported by a worker unit for one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultMessage {
    pub task_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub processing_time_ms: u64,
}

impl ResultMessage {
    /// Successful completion carrying `result`.
    pub fn success(task_id: impl Into<String>, result: Value, elapsed: Duration) -> Self {
        Self {
            task_id: task_id.into(),
            success: true,
            result: Some(result),
            error: None,
            processing_time_ms: millis(elapsed),
        }
    }

    /// Application-level failure; the worker itself is still healthy.
    pub fn failure(task_id: impl Into<String>, error: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            task_id: task_id.into(),
            success: false,
            result: None,
            error: Some(error.into()),
            processing_time_ms: millis(elapsed),
        }
    }

    pub const fn processing_time(&self) -> Duration {
        Duration::from_millis(self.processing_time_ms)
    }
}

fn millis(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}
