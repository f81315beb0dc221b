//! Console logging plus optional OpenTelemetry export.
//!
//! Console output is always on and filtered by `RUST_LOG` (default `info`).
//! The `tracing` feature adds span export, `metrics` adds the host
//! instruments below, and `stdout` or `honeycomb` pick where exports go.
//! Honeycomb reads `HONEYCOMB_API_KEY`, `HONEYCOMB_DATASET`,
//! `HONEYCOMB_ENDPOINT` and `HONEYCOMB_COMPRESSION`.
//!
//! The metric helpers are safe to call at any time. Before
//! [`init_telemetry`] runs, or without `metrics`, they do nothing.

#[cfg(all(
    any(feature = "honeycomb", feature = "stdout"),
    not(any(feature = "tracing", feature = "metrics"))
))]
compile_error!("Telemetry exporters need the 'tracing' or 'metrics' feature.");

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(any(feature = "metrics", feature = "tracing"))]
use opentelemetry::{InstrumentationScope, KeyValue};
#[cfg(feature = "metrics")]
use opentelemetry::metrics::{Counter, Histogram, Meter, UpDownCounter};
#[cfg(feature = "tracing")]
use opentelemetry::trace::TracerProvider;
#[cfg(any(feature = "metrics", feature = "tracing"))]
use opentelemetry_sdk::Resource;
#[cfg(feature = "metrics")]
use opentelemetry_sdk::metrics as sdkmetrics;
#[cfg(feature = "tracing")]
use opentelemetry_sdk::trace as sdktrace;
#[cfg(any(feature = "metrics", feature = "tracing"))]
use opentelemetry_semantic_conventions as semvcns;
#[cfg(all(feature = "honeycomb", any(feature = "metrics", feature = "tracing")))]
use opentelemetry_otlp::{Compression, Protocol, WithExportConfig, WithTonicConfig};
#[cfg(any(feature = "honeycomb", feature = "stdout"))]
use std::time::Duration;
#[cfg(feature = "metrics")]
use std::sync::OnceLock;

const SERVICE_NAME: &str = "jobhost";

/// Providers to flush and shut down when the host stops.
pub struct TelemetryProviders {
    #[cfg(feature = "tracing")]
    pub tracer_provider: sdktrace::SdkTracerProvider,
    #[cfg(feature = "metrics")]
    pub meter_provider: sdkmetrics::SdkMeterProvider,
}

pub fn init_telemetry() -> anyhow::Result<TelemetryProviders> {
    let console = tracing_subscriber::fmt::layer()
        .with_thread_ids(true)
        .with_target(false)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .compact();
    let registry = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(console);

    #[cfg(any(feature = "metrics", feature = "tracing"))]
    let scope = InstrumentationScope::builder(SERVICE_NAME)
        .with_version(env!("CARGO_PKG_VERSION"))
        .with_schema_url(semvcns::SCHEMA_URL)
        .build();

    #[cfg(feature = "tracing")]
    let (registry, tracer_provider) = {
        opentelemetry::global::set_text_map_propagator(
            opentelemetry_sdk::propagation::TraceContextPropagator::new(),
        );
        let provider = tracer_provider()?;
        opentelemetry::global::set_tracer_provider(provider.clone());
        let layer = tracing_opentelemetry::layer()
            .with_tracer(provider.tracer_with_scope(scope.clone()))
            .with_error_records_to_exceptions(true);
        (registry.with(layer), provider)
    };

    #[cfg(feature = "metrics")]
    let (registry, meter_provider) = {
        let provider = meter_provider()?;
        opentelemetry::global::set_meter_provider(provider.clone());
        let _ = INSTRUMENTS.set(Instruments::new(&opentelemetry::global::meter_with_scope(
            scope,
        )));
        let layer = tracing_opentelemetry::MetricsLayer::new(provider.clone());
        (registry.with(layer), provider)
    };

    registry.try_init()?;

    Ok(TelemetryProviders {
        #[cfg(feature = "tracing")]
        tracer_provider,
        #[cfg(feature = "metrics")]
        meter_provider,
    })
}

#[cfg(any(feature = "metrics", feature = "tracing"))]
fn resource() -> Resource {
    Resource::builder()
        .with_service_name(SERVICE_NAME)
        .with_schema_url(
            [KeyValue::new(
                semvcns::resource::SERVICE_VERSION,
                env!("CARGO_PKG_VERSION"),
            )],
            semvcns::SCHEMA_URL,
        )
        .build()
}

/// Connection settings of the Honeycomb OTLP endpoint.
#[cfg(all(feature = "honeycomb", any(feature = "metrics", feature = "tracing")))]
struct Honeycomb {
    metadata: tonic::metadata::MetadataMap,
    endpoint: String,
    compression: Compression,
}

#[cfg(all(feature = "honeycomb", any(feature = "metrics", feature = "tracing")))]
impl Honeycomb {
    fn from_env() -> anyhow::Result<Self> {
        use anyhow::Context;
        use std::str::FromStr;

        let var = |name: &str| std::env::var(name).with_context(|| format!("missing `{name}`"));
        let mut metadata = tonic::metadata::MetadataMap::new();
        metadata.insert(
            "x-honeycomb-team",
            var("HONEYCOMB_API_KEY")?.parse().context("invalid API key")?,
        );
        metadata.insert(
            "x-honeycomb-dataset",
            var("HONEYCOMB_DATASET")?.parse().context("invalid dataset")?,
        );
        let compression = var("HONEYCOMB_COMPRESSION")?.to_ascii_lowercase();
        Ok(Self {
            metadata,
            endpoint: var("HONEYCOMB_ENDPOINT")?,
            compression: Compression::from_str(&compression)?,
        })
    }

    fn tls() -> tonic::transport::ClientTlsConfig {
        tonic::transport::ClientTlsConfig::new().with_native_roots()
    }
}

#[cfg(all(feature = "tracing", any(feature = "stdout", feature = "honeycomb")))]
fn batched<E>(exporter: E) -> sdktrace::BatchSpanProcessor
where
    E: opentelemetry_sdk::trace::SpanExporter + 'static,
{
    sdktrace::BatchSpanProcessor::builder(exporter)
        .with_batch_config(
            sdktrace::BatchConfigBuilder::default()
                .with_scheduled_delay(Duration::from_secs(5))
                .with_max_queue_size(2048)
                .build(),
        )
        .build()
}

#[cfg(feature = "tracing")]
fn tracer_provider() -> anyhow::Result<sdktrace::SdkTracerProvider> {
    let builder = sdktrace::SdkTracerProvider::builder().with_resource(resource());

    #[cfg(feature = "stdout")]
    let builder = builder.with_span_processor(batched(opentelemetry_stdout::SpanExporter::default()));

    #[cfg(feature = "honeycomb")]
    let builder = {
        use anyhow::Context;
        let honeycomb = Honeycomb::from_env()?;
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_tls_config(Honeycomb::tls())
            .with_metadata(honeycomb.metadata)
            .with_timeout(Duration::from_secs(10))
            .with_compression(honeycomb.compression)
            .with_endpoint(honeycomb.endpoint)
            .with_protocol(Protocol::Grpc)
            .build()
            .context("failed to build span exporter")?;
        builder.with_span_processor(batched(exporter))
    };

    Ok(builder.build())
}

#[cfg(feature = "metrics")]
fn meter_provider() -> anyhow::Result<sdkmetrics::SdkMeterProvider> {
    let builder = sdkmetrics::SdkMeterProvider::builder().with_resource(resource());

    #[cfg(feature = "stdout")]
    let builder = builder.with_reader(
        sdkmetrics::PeriodicReader::builder(opentelemetry_stdout::MetricExporter::default())
            .with_interval(Duration::from_secs(5))
            .build(),
    );

    #[cfg(feature = "honeycomb")]
    let builder = {
        use anyhow::Context;
        let honeycomb = Honeycomb::from_env()?;
        let exporter = opentelemetry_otlp::MetricExporter::builder()
            .with_tonic()
            .with_tls_config(Honeycomb::tls())
            .with_metadata(honeycomb.metadata)
            .with_timeout(Duration::from_secs(10))
            .with_compression(honeycomb.compression)
            .with_endpoint(honeycomb.endpoint)
            .with_protocol(Protocol::Grpc)
            .with_temporality(sdkmetrics::Temporality::Delta)
            .build()
            .context("failed to build metric exporter")?;
        builder.with_periodic_exporter(exporter)
    };

    Ok(builder.build())
}

/// Host instruments, registered once by [`init_telemetry`].
#[cfg(feature = "metrics")]
struct Instruments {
    invocations: Counter<u64>,
    invocation_failures: Counter<u64>,
    invocation_duration: Histogram<f64>,
    worker_restarts: Counter<u64>,
    ready_workers: UpDownCounter<i64>,
}

#[cfg(feature = "metrics")]
static INSTRUMENTS: OnceLock<Instruments> = OnceLock::new();

#[cfg(feature = "metrics")]
impl Instruments {
    fn new(meter: &Meter) -> Self {
        Self {
            invocations: meter
                .u64_counter("invocations")
                .with_description("Invocations sent to workers")
                .build(),
            invocation_failures: meter
                .u64_counter("invocation_failures")
                .with_description("Invocations that failed, timed out or were cancelled")
                .build(),
            invocation_duration: meter
                .f64_histogram("invocation_duration")
                .with_unit("ms")
                .with_description("Time from sending an invocation to its outcome")
                .build(),
            worker_restarts: meter
                .u64_counter("worker_restarts")
                .with_description("Replacement workers started")
                .build(),
            ready_workers: meter
                .i64_up_down_counter("ready_workers")
                .with_description("Worker channels that completed the handshake")
                .build(),
        }
    }
}

macro_rules! record {
    ($instrument:ident, $method:ident, $value:expr) => {{
        #[cfg(feature = "metrics")]
        if let Some(instruments) = INSTRUMENTS.get() {
            instruments.$instrument.$method($value, &[]);
        }
        #[cfg(not(feature = "metrics"))]
        let _ = $value;
    }};
}

pub fn increment_invocations() {
    record!(invocations, add, 1);
}

pub fn increment_invocation_failures() {
    record!(invocation_failures, add, 1);
}

pub fn record_invocation_duration(duration_ms: f64) {
    record!(invocation_duration, record, duration_ms);
}

pub fn increment_worker_restarts() {
    record!(worker_restarts, add, 1);
}

pub fn increment_ready_workers() {
    record!(ready_workers, add, 1);
}

pub fn decrement_ready_workers() {
    record!(ready_workers, add, -1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instruments_are_inert_before_init() {
        increment_invocations();
        increment_invocation_failures();
        record_invocation_duration(12.5);
        increment_worker_restarts();
        increment_ready_workers();
        decrement_ready_workers();
    }
}
