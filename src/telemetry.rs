//! Telemetry collaborator.
//!
//! The lifecycle only needs one thing from telemetry: something it can call
//! during startup that returns a shutdown closure. [`Telemetry`] is that
//! seam. [`OtelTelemetry`] is the stock implementation:
//!
//! - W3C trace-context and baggage propagators, so incoming `traceparent`
//!   and `baggage` headers flow into each request context,
//! - an OTLP (gRPC) batch span exporter when an endpoint is configured,
//! - the instrumented `tracing` subscriber (JSON or pretty) as the global
//!   default.

use opentelemetry::propagation::{Extractor, TextMapCompositePropagator};
use opentelemetry::{KeyValue, global};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::propagation::{BaggagePropagator, TraceContextPropagator};
use opentelemetry_sdk::trace::{RandomIdGenerator, Sampler, TracerProvider};
use thiserror::Error;
use tracing::info;

use crate::config::TelemetryConfig;
use crate::error::BoxError;
use crate::logging;

/// Tears telemetry down. Blocking: it flushes exporters.
pub type ShutdownFn = Box<dyn FnOnce() -> Result<(), BoxError> + Send + 'static>;

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("failed to initialize tracing: {0}")]
    Tracing(String),

    #[error("failed to initialize logging: {0}")]
    Logging(String),
}

/// Anything that can bring telemetry up for the lifecycle.
pub trait Telemetry: Send + Sync {
    /// Initializes exporters and the instrumented logger.
    ///
    /// On success the returned closure is registered for teardown. On error
    /// the process must not start serving.
    fn setup(&self, config: &TelemetryConfig) -> Result<ShutdownFn, TelemetryError>;
}

/// Telemetry that installs nothing. Useful for tests and embedded use.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoTelemetry;

impl Telemetry for NoTelemetry {
    fn setup(&self, _config: &TelemetryConfig) -> Result<ShutdownFn, TelemetryError> {
        Ok(Box::new(|| Ok(())))
    }
}

/// OpenTelemetry + `tracing-subscriber` setup.
#[derive(Clone, Copy, Debug, Default)]
pub struct OtelTelemetry;

impl Telemetry for OtelTelemetry {
    fn setup(&self, config: &TelemetryConfig) -> Result<ShutdownFn, TelemetryError> {
        global::set_text_map_propagator(TextMapCompositePropagator::new(vec![
            Box::new(TraceContextPropagator::new()),
            Box::new(BaggagePropagator::new()),
        ]));

        let provider = match &config.otlp_endpoint {
            Some(endpoint) => Some(tracer_provider(config, endpoint)?),
            None => None,
        };

        let dispatch = logging::instrumented(config).map_err(TelemetryError::Logging)?;
        tracing::dispatcher::set_global_default(dispatch)
            .map_err(|e| TelemetryError::Logging(e.to_string()))?;

        info!(
            service = %config.service_name,
            version = %config.service_version,
            exporting = provider.is_some(),
            "telemetry initialized"
        );

        Ok(Box::new(move || {
            let Some(provider) = provider else { return Ok(()) };
            let mut failures: Vec<String> = provider
                .force_flush()
                .into_iter()
                .filter_map(|r| r.err().map(|e| format!("flush: {e}")))
                .collect();
            if let Err(e) = provider.shutdown() {
                failures.push(format!("shutdown: {e}"));
            }
            if failures.is_empty() {
                Ok(())
            } else {
                Err(failures.join("; ").into())
            }
        }))
    }
}

fn tracer_provider(config: &TelemetryConfig, endpoint: &str) -> Result<TracerProvider, TelemetryError> {
    let resource = Resource::new([
        KeyValue::new(
            opentelemetry_semantic_conventions::resource::SERVICE_NAME,
            config.service_name.clone(),
        ),
        KeyValue::new(
            opentelemetry_semantic_conventions::resource::SERVICE_VERSION,
            config.service_version.clone(),
        ),
        KeyValue::new("deployment.environment", config.environment.clone()),
    ]);

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| TelemetryError::Tracing(e.to_string()))?;

    let provider = TracerProvider::builder()
        .with_batch_exporter(exporter, opentelemetry_sdk::runtime::Tokio)
        .with_sampler(sampler(config.sample_ratio))
        .with_id_generator(RandomIdGenerator::default())
        .with_resource(resource)
        .build();

    global::set_tracer_provider(provider.clone());
    Ok(provider)
}

fn sampler(ratio: f64) -> Sampler {
    if ratio >= 1.0 {
        Sampler::ParentBased(Box::new(Sampler::AlwaysOn))
    } else if ratio <= 0.0 {
        Sampler::AlwaysOff
    } else {
        Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(ratio)))
    }
}

/// Reads propagation headers out of an `http::HeaderMap`.
pub struct HeaderExtractor<'a>(pub &'a http::HeaderMap);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(http::HeaderName::as_str).collect()
    }
}

/// Parent context for a request, as carried by its headers.
pub(crate) fn extract(headers: &http::HeaderMap) -> opentelemetry::Context {
    global::get_text_map_propagator(|propagator| propagator.extract(&HeaderExtractor(headers)))
}
