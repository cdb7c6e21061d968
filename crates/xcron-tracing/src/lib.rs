//! Logging/tracing bootstrap plus a concrete `JobTracer`, grounded on the
//! teacher's `tips-tracing` crate (OTLP exporter + propagator wiring) and
//! `crates/ingress-rpc/src/main.rs` (combining a JSON stdout `fmt` layer
//! with the OpenTelemetry layer under one `Targets` filter).

use anyhow::Context;
use opentelemetry::trace::TracerProvider;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::{SpanExporter, WithExportConfig};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::SdkTracerProvider;
use opentelemetry_sdk::Resource;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::filter::{LevelFilter, Targets};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::Layer;
use xcron_scheduler::{JobSpan, JobTracer};

/// Bootstraps a global `tracing` subscriber: a JSON `fmt` layer on stdout at
/// `log_level` for the service's own target, plus an OTLP exporter layer fed
/// by every span regardless of level (sampling is left to the collector).
pub fn init_tracing(
    service_name: String,
    service_version: String,
    otlp_endpoint: String,
    log_level: LevelFilter,
) -> anyhow::Result<()> {
    global::set_text_map_propagator(TraceContextPropagator::new());

    let otlp_exporter = SpanExporter::builder()
        .with_tonic()
        .with_endpoint(&otlp_endpoint)
        .build()
        .context("failed to create OTLP exporter")?;

    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(otlp_exporter)
        .with_resource(
            Resource::builder_empty()
                .with_attributes([
                    KeyValue::new("service.name", service_name.clone()),
                    KeyValue::new("service.version", service_version),
                ])
                .build(),
        )
        .build();
    let tracer = provider.tracer(service_name.clone());

    let trace_filter = Targets::new().with_default(LevelFilter::OFF).with_target(&service_name, LevelFilter::TRACE);

    let log_filter = Targets::new().with_default(LevelFilter::INFO).with_target(&service_name, log_level);

    tracing::subscriber::set_global_default(
        tracing_subscriber::registry()
            .with(OpenTelemetryLayer::new(tracer).with_filter(trace_filter))
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_ansi(false)
                    .with_filter(log_filter),
            ),
    )
    .context("failed to install global tracing subscriber")?;

    Ok(())
}

/// `JobTracer` that opens one `tracing` span per job execution. Because the
/// OpenTelemetry layer derives span start/end from the `tracing::Span`
/// handle's own lifetime, simply holding the returned `OtelJobSpan` for the
/// duration of `JobWrapper::run` (without re-entering it) is enough to
/// capture the full execution as one OTel span.
#[derive(Debug, Default)]
pub struct OtelJobTracer;

impl OtelJobTracer {
    pub fn new() -> Self {
        Self
    }
}

impl JobTracer for OtelJobTracer {
    fn start_span(&self, name: &str) -> Box<dyn JobSpan> {
        let span = tracing::info_span!("job.execute", job.name = %name, error = tracing::field::Empty);
        Box::new(OtelJobSpan { span })
    }
}

struct OtelJobSpan {
    span: tracing::Span,
}

impl JobSpan for OtelJobSpan {
    fn record_error(&mut self, err: &anyhow::Error) {
        self.span.record("error", true);
        tracing::error!(parent: &self.span, error = %err, "job execution failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_span_does_not_panic_without_a_global_subscriber() {
        let tracer = OtelJobTracer::new();
        let mut span = tracer.start_span("nightly-report");
        span.record_error(&anyhow::anyhow!("boom"));
    }
}
