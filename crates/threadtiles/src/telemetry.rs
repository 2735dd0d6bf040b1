//! Logging and OpenTelemetry setup.
//!
//! Always installs a `tracing` fmt subscriber. When an OTLP endpoint is
//! configured, traces, logs and metrics are also exported over gRPC.

use std::time::Duration;

use anyhow::{Context, Result};
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::{RandomIdGenerator, Sampler, SdkTracerProvider};
use opentelemetry_sdk::Resource;
use threadconf::TelemetryConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Timeout for OTLP exports - prevents blocking on unavailable endpoints
const EXPORT_TIMEOUT: Duration = Duration::from_secs(5);

const SERVICE_NAME: &str = "threadtiles";

/// Providers to flush on shutdown. Empty when OTLP export is off.
#[derive(Default)]
pub struct Telemetry {
    tracer: Option<SdkTracerProvider>,
    logger: Option<SdkLoggerProvider>,
    meter: Option<SdkMeterProvider>,
}

impl Telemetry {
    pub fn exporting(&self) -> bool {
        self.tracer.is_some()
    }
}

/// Install the global subscriber.
///
/// `RUST_LOG` overrides `config.log_level` when set.
pub fn init(config: &TelemetryConfig) -> Result<Telemetry> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    if !config.otlp_enabled() {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .context("Failed to install tracing subscriber")?;
        return Ok(Telemetry::default());
    }

    let endpoint = format!("http://{}", config.otlp_endpoint);

    let resource = Resource::builder_empty()
        .with_service_name(SERVICE_NAME)
        .with_attributes(vec![KeyValue::new(
            "service.version",
            env!("CARGO_PKG_VERSION"),
        )])
        .build();

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

    let tracer = tracer_provider.tracer(SERVICE_NAME);
    global::set_tracer_provider(tracer_provider.clone());

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
    global::set_meter_provider(meter_provider.clone());

    let telemetry_layer = tracing_opentelemetry::layer().with_tracer(tracer);
    let log_bridge =
        opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge::new(&logger_provider);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .with(telemetry_layer)
        .with(log_bridge)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    tracing::info!(
        "🔭 OpenTelemetry initialized with OTLP endpoint: {}",
        config.otlp_endpoint
    );

    Ok(Telemetry {
        tracer: Some(tracer_provider),
        logger: Some(logger_provider),
        meter: Some(meter_provider),
    })
}

/// Flush and stop exporters. Each exporter is bounded by its 5s timeout.
pub fn shutdown(telemetry: Telemetry) {
    if !telemetry.exporting() {
        return;
    }
    tracing::info!("🔭 Shutting down OpenTelemetry...");

    if let Some(tracer) = telemetry.tracer {
        if let Err(e) = tracer.shutdown() {
            eprintln!("tracer provider shutdown failed: {e}");
        }
    }
    if let Some(meter) = telemetry.meter {
        if let Err(e) = meter.shutdown() {
            eprintln!("meter provider shutdown failed: {e}");
        }
    }
    // Last, so the messages above still get exported
    if let Some(logger) = telemetry.logger {
        if let Err(e) = logger.shutdown() {
            eprintln!("logger provider shutdown failed: {e}");
        }
    }
}

/// Parse a W3C traceparent header and return an OpenTelemetry Context.
///
/// Format: `{version}-{trace_id}-{span_id}-{trace_flags}`
/// Example: `00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01`
///
/// Returns None if the traceparent is invalid or missing.
pub fn parse_traceparent(traceparent: Option<&str>) -> Option<opentelemetry::Context> {
    use opentelemetry::trace::{
        SpanContext, SpanId, TraceContextExt, TraceFlags, TraceId, TraceState,
    };

    let tp = traceparent?;
    let parts: Vec<&str> = tp.split('-').collect();
    let [version, trace_id, span_id, flags] = parts.as_slice() else {
        tracing::debug!(traceparent = tp, "Ignoring malformed traceparent");
        return None;
    };

    if *version != "00" {
        tracing::debug!(traceparent = tp, "Ignoring unsupported traceparent version");
        return None;
    }

    let trace_id = TraceId::from_bytes(hex_to_bytes::<16>(trace_id)?);
    let span_id = SpanId::from_bytes(hex_to_bytes::<8>(span_id)?);
    let flags = TraceFlags::new(hex_to_bytes::<1>(flags)?[0]);

    let span_context = SpanContext::new(
        trace_id,
        span_id,
        flags,
        true, // propagated from the client
        TraceState::default(),
    );
    if !span_context.is_valid() {
        return None;
    }

    Some(opentelemetry::Context::current().with_remote_span_context(span_context))
}

/// Helper to convert hex string to fixed-size byte array
fn hex_to_bytes<const N: usize>(hex: &str) -> Option<[u8; N]> {
    if hex.len() != N * 2 || !hex.is_ascii() {
        return None;
    }

    let mut bytes = [0u8; N];
    for (i, byte) in bytes.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).ok()?;
    }
    Some(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_to_bytes() {
        let result: Option<[u8; 4]> = hex_to_bytes("deadbeef");
        assert_eq!(result, Some([0xde, 0xad, 0xbe, 0xef]));

        let result: Option<[u8; 4]> = hex_to_bytes("short");
        assert_eq!(result, None);

        let result: Option<[u8; 4]> = hex_to_bytes("not_hex!");
        assert_eq!(result, None);

        // Multi-byte chars must not panic on slicing
        let result: Option<[u8; 2]> = hex_to_bytes("éé");
        assert_eq!(result, None);
    }

    #[test]
    fn test_parse_traceparent_valid() {
        use opentelemetry::trace::TraceContextExt;

        let tp = "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01";
        let ctx = parse_traceparent(Some(tp)).unwrap();
        let span = ctx.span();
        let span_context = span.span_context();
        assert_eq!(
            span_context.trace_id().to_string(),
            "0af7651916cd43dd8448eb211c80319c"
        );
        assert!(span_context.is_remote());
        assert!(span_context.is_sampled());
    }

    #[test]
    fn test_parse_traceparent_rejects_garbage() {
        assert!(parse_traceparent(None).is_none());
        assert!(parse_traceparent(Some("not-a-valid-traceparent")).is_none());
        assert!(parse_traceparent(Some(
            "01-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01"
        ))
        .is_none());
        assert!(parse_traceparent(Some("00-short-b7ad6b7169203331-01")).is_none());
        // All-zero ids are invalid per W3C
        assert!(parse_traceparent(Some(
            "00-00000000000000000000000000000000-b7ad6b7169203331-01"
        ))
        .is_none());
    }

    #[test]
    fn test_disabled_telemetry_has_nothing_to_flush() {
        let telemetry = Telemetry::default();
        assert!(!telemetry.exporting());
        shutdown(telemetry);
    }
}
