//! Logging and OpenTelemetry setup for the controller process
//!
//! Logs go to stdout through `tracing-subscriber`, as JSON by default. When an
//! OTLP endpoint is configured, spans and metrics are also exported to it.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::TracerProvider;
use opentelemetry_sdk::{runtime, Resource};
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Filter used when `RUST_LOG` is not set
pub const DEFAULT_LOG_FILTER: &str = "info,engine=debug,kube=info,tower=warn,hyper=warn";

/// Errors that can occur during telemetry initialization
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Failed to initialize the span exporter
    #[error("failed to initialize tracer: {0}")]
    TracerInit(String),

    /// Failed to initialize the metrics exporter
    #[error("failed to initialize metrics exporter: {0}")]
    MetricsInit(String),

    /// A global subscriber was already installed
    #[error("failed to initialize tracing subscriber: {0}")]
    SubscriberInit(String),
}

/// Configuration for telemetry initialization
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name attached to spans and metrics
    pub service_name: String,

    /// OTLP collector endpoint, e.g. `http://otel-collector:4317`
    pub otlp_endpoint: Option<String>,

    /// Emit JSON log lines instead of human-readable text
    pub json_logs: bool,

    /// Extra resource attributes, e.g. the controller pod name
    pub attributes: Vec<(String, String)>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "engine-controller".to_string(),
            otlp_endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok(),
            json_logs: true,
            attributes: Vec::new(),
        }
    }
}

/// Install the global tracing subscriber and, if configured, OTLP exporters
pub fn init_telemetry(config: TelemetryConfig) -> Result<(), TelemetryError> {
    global::set_text_map_propagator(TraceContextPropagator::new());

    let resource = build_resource(&config);

    let otel_layer = match &config.otlp_endpoint {
        Some(endpoint) => {
            init_otlp_metrics(endpoint, resource.clone())?;
            let provider = init_otlp_tracer(endpoint, resource)?;
            let tracer = provider.tracer(config.service_name.clone());
            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let fmt_layer = if config.json_logs {
        tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_target(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(true).boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(otel_layer)
        .try_init()
        .map_err(|e| TelemetryError::SubscriberInit(e.to_string()))
}

fn build_resource(config: &TelemetryConfig) -> Resource {
    let mut attributes = vec![
        KeyValue::new(
            opentelemetry_semantic_conventions::resource::SERVICE_NAME,
            config.service_name.clone(),
        ),
        KeyValue::new(
            opentelemetry_semantic_conventions::resource::SERVICE_VERSION,
            env!("CARGO_PKG_VERSION"),
        ),
    ];

    // Downward API
    for (env, key) in [
        ("POD_NAMESPACE", "k8s.namespace.name"),
        ("NODE_NAME", "k8s.node.name"),
    ] {
        if let Ok(value) = std::env::var(env) {
            attributes.push(KeyValue::new(key, value));
        }
    }

    attributes.extend(
        config
            .attributes
            .iter()
            .map(|(k, v)| KeyValue::new(k.clone(), v.clone())),
    );

    Resource::new(attributes)
}

fn init_otlp_tracer(endpoint: &str, resource: Resource) -> Result<TracerProvider, TelemetryError> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| TelemetryError::TracerInit(e.to_string()))?;

    let provider = TracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_resource(resource)
        .build();

    global::set_tracer_provider(provider.clone());
    Ok(provider)
}

fn init_otlp_metrics(endpoint: &str, resource: Resource) -> Result<(), TelemetryError> {
    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;

    let reader = PeriodicReader::builder(exporter, runtime::Tokio).build();
    let provider = SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(resource)
        .build();

    global::set_meter_provider(provider);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_carries_service_and_extra_attributes() {
        let config = TelemetryConfig {
            service_name: "engine-controller-test".to_string(),
            otlp_endpoint: None,
            json_logs: false,
            attributes: vec![("k8s.pod.name".to_string(), "controller-0".to_string())],
        };
        let resource = build_resource(&config);
        assert!(resource.len() >= 3);
        let pod = resource.get(opentelemetry::Key::new("k8s.pod.name"));
        assert_eq!(pod.map(|v| v.to_string()), Some("controller-0".to_string()));
    }

    #[test]
    fn default_config_emits_json() {
        let config = TelemetryConfig::default();
        assert_eq!(config.service_name, "engine-controller");
        assert!(config.json_logs);
    }
}
