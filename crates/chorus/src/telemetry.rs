//! Logging and OpenTelemetry initialization.
//!
//! Log lines go to stderr as text or JSON. When an OTLP endpoint is
//! configured, traces, logs and metrics are exported over gRPC as well.

use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use chorusconf::{LogFormat, TelemetryConfig};
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::{RandomIdGenerator, Sampler, SdkTracerProvider};
use opentelemetry_sdk::Resource;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Timeout for OTLP exports - prevents blocking on unavailable endpoints
const EXPORT_TIMEOUT: Duration = Duration::from_secs(5);

static PROVIDERS: OnceLock<OtlpProviders> = OnceLock::new();

/// Handles kept so pending exports can be flushed at shutdown.
struct OtlpProviders {
    tracer: SdkTracerProvider,
    logger: SdkLoggerProvider,
    meter: SdkMeterProvider,
}

impl OtlpProviders {
    fn shutdown(&self) {
        if let Err(e) = self.tracer.shutdown() {
            tracing::warn!(error = %e, "trace provider shutdown failed");
        }
        if let Err(e) = self.logger.shutdown() {
            tracing::warn!(error = %e, "log provider shutdown failed");
        }
        if let Err(e) = self.meter.shutdown() {
            tracing::warn!(error = %e, "meter provider shutdown failed");
        }
    }
}

/// Install the global tracing subscriber.
pub fn init(config: &TelemetryConfig) -> Result<()> {
    let env_filter = EnvFilter::try_new(&config.log_level)
        .with_context(|| format!("Invalid log filter {:?}", config.log_level))?;

    let (text_layer, json_layer) = match config.log_format {
        LogFormat::Text => (
            Some(tracing_subscriber::fmt::layer().with_writer(std::io::stderr)),
            None,
        ),
        LogFormat::Json => (
            None,
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            ),
        ),
    };

    let otlp = match config.otlp_endpoint.trim() {
        "" => None,
        endpoint => Some(otlp_providers(endpoint)?),
    };

    let telemetry_layer = otlp
        .as_ref()
        .map(|providers| tracing_opentelemetry::layer().with_tracer(providers.tracer.tracer("chorus")));
    let log_appender = otlp.as_ref().map(|providers| {
        opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge::new(&providers.logger)
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(text_layer)
        .with(json_layer)
        .with(telemetry_layer)
        .with(log_appender)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    if let Some(providers) = otlp {
        global::set_tracer_provider(providers.tracer.clone());
        global::set_meter_provider(providers.meter.clone());
        let _ = PROVIDERS.set(providers);
        tracing::info!(endpoint = %config.otlp_endpoint, "OpenTelemetry export enabled");
    }

    Ok(())
}

fn otlp_providers(otlp_endpoint: &str) -> Result<OtlpProviders> {
    let resource = Resource::builder_empty()
        .with_service_name("chorus")
        .with_attributes(vec![KeyValue::new(
            "service.version",
            env!("CARGO_PKG_VERSION"),
        )])
        .build();

    let endpoint = if otlp_endpoint.contains("://") {
        otlp_endpoint.to_string()
    } else {
        format!("http://{}", otlp_endpoint)
    };

    let trace_exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint.clone())
        .with_timeout(EXPORT_TIMEOUT)
        .build()
        .context("Failed to create OTLP span exporter")?;

    let tracer_provider = SdkTracerProvider::builder()
        .with_span_processor(
            opentelemetry_sdk::trace::BatchSpanProcessor::builder(trace_exporter).build(),
        )
        .with_sampler(Sampler::AlwaysOn)
        .with_id_generator(RandomIdGenerator::default())
        .with_resource(resource.clone())
        .build();

    let log_exporter = opentelemetry_otlp::LogExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint.clone())
        .with_timeout(EXPORT_TIMEOUT)
        .build()
        .context("Failed to create OTLP log exporter")?;

    let logger_provider = SdkLoggerProvider::builder()
        .with_log_processor(
            opentelemetry_sdk::logs::BatchLogProcessor::builder(log_exporter).build(),
        )
        .with_resource(resource.clone())
        .build();

    let metric_exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .with_timeout(EXPORT_TIMEOUT)
        .build()
        .context("Failed to create OTLP metric exporter")?;

    let meter_provider = SdkMeterProvider::builder()
        .with_reader(opentelemetry_sdk::metrics::PeriodicReader::builder(metric_exporter).build())
        .with_resource(resource)
        .build();

    Ok(OtlpProviders {
        tracer: tracer_provider,
        logger: logger_provider,
        meter: meter_provider,
    })
}

/// Flush and stop the OTLP providers, if export was enabled. Each exporter
/// is bounded by the export timeout.
pub fn shutdown() {
    tracing::info!("shutting down telemetry");
    if let Some(providers) = PROVIDERS.get() {
        providers.shutdown();
    }
}
