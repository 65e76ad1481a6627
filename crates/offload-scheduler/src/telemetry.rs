//! Pool counters exported over OTLP when the `metrics` feature is on.
//!
//! Without the feature every call compiles to nothing.

#[cfg(not(feature = "metrics"))]
use crate::pool::TaskErrorKind;

#[cfg(feature = "metrics")]
mod otel {
    use opentelemetry::KeyValue;
    use opentelemetry::metrics::Counter;

    use crate::pool::TaskErrorKind;

    pub struct Telemetry {
        settled: Counter<u64>,
        restarts: Counter<u64>,
    }

    impl Telemetry {
        pub fn new() -> Self {
            let meter = offload_core::metrics::meter();
            Self {
                settled: meter
                    .u64_counter("offload.tasks.settled")
                    .with_description("Tasks settled, by pool and outcome")
                    .build(),
                restarts: meter
                    .u64_counter("offload.workers.restarts")
                    .with_description("Worker units replaced after a fault or timeout")
                    .build(),
            }
        }

        pub fn task_settled(&self, pool: &str, failure: Option<TaskErrorKind>) {
            let outcome = failure.map_or("success", TaskErrorKind::as_str);
            self.settled.add(
                1,
                &[
                    KeyValue::new("pool", pool.to_string()),
                    KeyValue::new("outcome", outcome),
                ],
            );
        }

        pub fn worker_replaced(&self, pool: &str) {
            self.restarts
                .add(1, &[KeyValue::new("pool", pool.to_string())]);
        }
    }
}

#[cfg(feature = "metrics")]
pub use otel::Telemetry;

#[cfg(not(feature = "metrics"))]
pub struct Telemetry;

#[cfg(not(feature = "metrics"))]
impl Telemetry {
    pub const fn new() -> Self {
        Self
    }

    #[allow(clippy::unused_self)]
    pub const fn task_settled(&self, _pool: &str, _failure: Option<TaskErrorKind>) {}

    #[allow(clippy::unused_self)]
    pub const fn worker_replaced(&self, _pool: &str) {}
}
