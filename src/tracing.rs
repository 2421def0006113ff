//! Tracing initialization
//!
//! Console logging is always on; when an OTLP endpoint is configured, spans
//! are additionally exported via OpenTelemetry so a turn's `trace_id` can be
//! followed across the scheduler, engine and orchestrator.

use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{runtime, trace as sdktrace, Resource};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sandbot=debug"))
}

/// Initialize console-only logging. Used by tests and by the binary when no
/// collector endpoint is configured.
pub fn init_logging() {
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);
    // try_init: harmless if a subscriber is already installed (test reruns)
    let _ = tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt_layer)
        .try_init();
}

/// Initialize logging plus OpenTelemetry span export to an OTLP collector.
pub fn init_tracing(
    service_name: &str,
    otlp_endpoint: &str,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(otlp_endpoint);

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(exporter)
        .with_trace_config(sdktrace::Config::default().with_resource(Resource::new(vec![
            KeyValue::new("service.name", service_name.to_string()),
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
        ])))
        .install_batch(runtime::Tokio)?;

    let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);

    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt_layer)
        .with(otel_layer)
        .init();

    tracing::info!(service = service_name, endpoint = otlp_endpoint, "tracing initialized");
    Ok(())
}

/// Flush pending spans to the collector before shutdown.
pub fn shutdown_tracing() {
    opentelemetry::global::shutdown_tracer_provider();
}
