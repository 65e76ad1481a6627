//! OTLP export of pool telemetry.
//!
//! Compiled only with the `metrics` feature. [`init_metrics`] installs an
//! exporter pipeline for spans and pool counters, both tagged with the
//! `offload` service resource. Pools obtain their instruments from
//! [`meter`], so counters created before or after initialisation share
//! one instrumentation scope.

use opentelemetry::metrics::Meter;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{InstrumentationScope, global};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::{SdkTracer, SdkTracerProvider};

use crate::error::{Error, Result};

/// Service name reported in the OTLP resource and the instrumentation scope.
pub const SERVICE_NAME: &str = "offload";

fn scope() -> InstrumentationScope {
    InstrumentationScope::builder(SERVICE_NAME)
        .with_version(env!("CARGO_PKG_VERSION"))
        .build()
}

/// Meter for pool instruments (task settlements, worker restarts).
///
/// Backed by the global provider: a no-op until [`init_metrics`] runs.
pub fn meter() -> Meter {
    global::meter_with_scope(scope())
}

/// Keeps the span and metric providers alive.
///
/// Dropping it stops export without flushing; call
/// [`TelemetryPipeline::shutdown`] on the way out.
pub struct TelemetryPipeline {
    spans: SdkTracerProvider,
    counters: SdkMeterProvider,
}

impl TelemetryPipeline {
    /// Tracer feeding the `tracing-opentelemetry` layer.
    pub fn tracer(&self) -> SdkTracer {
        self.spans.tracer_with_scope(scope())
    }

    /// Flush buffered counters and spans, then stop both providers.
    pub fn shutdown(self) -> Result<()> {
        self.counters.shutdown().map_err(otel_error)?;
        self.spans.shutdown().map_err(otel_error)
    }
}

fn otel_error(e: impl std::fmt::Display) -> Error {
    Error::Telemetry(e.to_string())
}

/// Start exporting to the OTLP/gRPC receiver at `endpoint`
/// (e.g. `http://localhost:4317`) and make it the global provider.
pub fn init_metrics(endpoint: &str) -> Result<TelemetryPipeline> {
    let resource = Resource::builder().with_service_name(SERVICE_NAME).build();

    let span_exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(otel_error)?;
    let spans = SdkTracerProvider::builder()
        .with_resource(resource.clone())
        .with_batch_exporter(span_exporter)
        .build();

    let counter_exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(otel_error)?;
    let counters = SdkMeterProvider::builder()
        .with_resource(resource)
        .with_periodic_exporter(counter_exporter)
        .build();

    global::set_tracer_provider(spans.clone());
    global::set_meter_provider(counters.clone());
    Ok(TelemetryPipeline { spans, counters })
}
