//! NDJSON wire protocol between a pool and its worker units.
//!
//! Each line is one JSON object. The pool writes [`TaskMessage`] lines to a
//! worker's stdin; the worker answers each with exactly one
//! [`ResultMessage`] line on stdout, correlated by `taskId`.

mod codec;
mod types;

pub use codec::{encode_line, parse_result_line, parse_task_line};
pub use types::*;
