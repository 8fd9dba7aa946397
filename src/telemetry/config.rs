//! Telemetry configuration and initialization.

use crate::telemetry::metrics::register_metrics;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{KeyValue, trace::TraceError};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    Resource, runtime,
    trace::{RandomIdGenerator, Sampler, TracerProvider},
};
use std::net::SocketAddr;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Error type for telemetry initialization failures.
#[derive(Debug, thiserror::Error)]
#[allow(clippy::enum_variant_names)]
pub enum TelemetryError {
    #[error("Failed to initialize OpenTelemetry tracer: {0}")]
    TracerInit(#[from] TraceError),
    #[error("Failed to initialize Prometheus exporter: {0}")]
    PrometheusInit(String),
    #[error("Invalid telemetry setting `{name}`: {reason}")]
    InvalidSetting { name: &'static str, reason: String },
    #[error("Failed to set global subscriber: {0}")]
    SubscriberInit(#[from] tracing_subscriber::util::TryInitError),
}

/// Builder for configuring telemetry.
///
/// # Example
///
/// ```ignore
/// let telemetry = TelemetryBuilder::from_env()?
///     .service_name("checkout")
///     .default_filter("info,hibernate=debug")
///     .build()?;
///
/// // ... run the engine and reminder workers ...
///
/// telemetry.shutdown();
/// ```
pub struct TelemetryBuilder {
    service_name: String,
    otlp_endpoint: Option<String>,
    prometheus_addr: Option<SocketAddr>,
    default_filter: String,
}

impl Default for TelemetryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetryBuilder {
    pub fn new() -> Self {
        Self {
            service_name: "hibernate".to_string(),
            otlp_endpoint: None,
            prometheus_addr: None,
            default_filter: "info".to_string(),
        }
    }

    /// Settings taken from the environment:
    ///
    /// - `OTEL_SERVICE_NAME`
    /// - `OTEL_EXPORTER_OTLP_ENDPOINT`
    /// - `HIBERNATE_PROMETHEUS_ADDR` (e.g. `0.0.0.0:9090`)
    pub fn from_env() -> Result<Self, TelemetryError> {
        let mut builder = Self::new();
        if let Ok(name) = std::env::var("OTEL_SERVICE_NAME")
            && !name.trim().is_empty()
        {
            builder.service_name = name;
        }
        if let Ok(endpoint) = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
            && !endpoint.trim().is_empty()
        {
            builder.otlp_endpoint = Some(endpoint);
        }
        if let Ok(addr) = std::env::var("HIBERNATE_PROMETHEUS_ADDR") {
            let addr = addr.trim().parse().map_err(|e: std::net::AddrParseError| {
                TelemetryError::InvalidSetting {
                    name: "HIBERNATE_PROMETHEUS_ADDR",
                    reason: e.to_string(),
                }
            })?;
            builder.prometheus_addr = Some(addr);
        }
        Ok(builder)
    }

    /// Set the service name for OpenTelemetry traces.
    pub fn service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = name.into();
        self
    }

    /// Set the OTLP endpoint for exporting traces, e.g. `http://localhost:4317`.
    pub fn otlp_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.otlp_endpoint = Some(endpoint.into());
        self
    }

    /// Expose Prometheus metrics on `addr`.
    pub fn prometheus_addr(mut self, addr: SocketAddr) -> Self {
        self.prometheus_addr = Some(addr);
        self
    }

    /// Filter used when `RUST_LOG` is not set (default: `info`).
    pub fn default_filter(mut self, directives: impl Into<String>) -> Self {
        self.default_filter = directives.into();
        self
    }

    /// Install the tracer, the metrics exporter and the global subscriber.
    ///
    /// Returns a `TelemetryHandle` that should be used for graceful shutdown.
    pub fn build(self) -> Result<TelemetryHandle, TelemetryError> {
        let tracer_provider = match &self.otlp_endpoint {
            Some(endpoint) => {
                let exporter = opentelemetry_otlp::SpanExporter::builder()
                    .with_tonic()
                    .with_endpoint(endpoint)
                    .build()?;

                let resource = Resource::new(vec![KeyValue::new(
                    opentelemetry_semantic_conventions::resource::SERVICE_NAME,
                    self.service_name.clone(),
                )]);

                Some(
                    TracerProvider::builder()
                        .with_batch_exporter(exporter, runtime::Tokio)
                        .with_sampler(Sampler::AlwaysOn)
                        .with_id_generator(RandomIdGenerator::default())
                        .with_resource(resource)
                        .build(),
                )
            }
            None => None,
        };

        if let Some(addr) = self.prometheus_addr {
            metrics_exporter_prometheus::PrometheusBuilder::new()
                .with_http_listener(addr)
                .install()
                .map_err(|e| TelemetryError::PrometheusInit(e.to_string()))?;
            register_metrics();
        }

        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&self.default_filter));
        let fmt_layer = tracing_subscriber::fmt::layer();

        match &tracer_provider {
            Some(provider) => {
                let otel_layer =
                    tracing_opentelemetry::layer().with_tracer(provider.tracer("hibernate"));
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt_layer)
                    .with(otel_layer)
                    .try_init()?;
            }
            None => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt_layer)
                    .try_init()?;
            }
        }

        tracing::info!(
            service = %self.service_name,
            otlp = self.otlp_endpoint.is_some(),
            prometheus = ?self.prometheus_addr,
            "Telemetry initialized"
        );

        Ok(TelemetryHandle { tracer_provider })
    }
}

/// Handle for managing telemetry lifecycle.
///
/// Call `shutdown()` to flush pending spans before the process exits.
pub struct TelemetryHandle {
    tracer_provider: Option<TracerProvider>,
}

impl TelemetryHandle {
    pub fn shutdown(self) {
        if let Some(provider) = self.tracer_provider
            && let Err(e) = provider.shutdown()
        {
            tracing::error!("Failed to shutdown tracer provider: {}", e);
        }
    }
}
