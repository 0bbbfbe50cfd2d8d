//! Process-wide logging, tracing and metrics setup
//!
//! Logs go to stdout: JSON lines inside a pod, plain text otherwise. With an
//! OTLP collector configured, spans and the counters in [`crate::metrics`]
//! are pushed there too. Pod, namespace and instance name are attached as
//! resource attributes so one collector can tell syncers apart.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::TracerProvider;
use opentelemetry_sdk::{runtime, Resource};
use opentelemetry_semantic_conventions::resource::{SERVICE_NAME, SERVICE_VERSION};
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset
pub const DEFAULT_LOG_FILTER: &str = "info,vsync=debug,kube=info,tower=warn,hyper=warn";

/// Environment variables copied onto the telemetry resource
const RESOURCE_ENV: &[(&str, &str)] = &[
    ("POD_NAME", "k8s.pod.name"),
    ("POD_NAMESPACE", "k8s.namespace.name"),
    ("VSYNC_NAME", "vsync.instance"),
];

/// Telemetry setup failure
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// An OTLP exporter could not be built
    #[error("cannot export {signal} to collector: {message}")]
    Exporter {
        /// `traces` or `metrics`
        signal: &'static str,
        /// Exporter error
        message: String,
    },

    /// A global subscriber is already installed
    #[error("tracing subscriber already installed: {0}")]
    AlreadyInstalled(String),
}

/// Where telemetry goes
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// `service.name` of spans and metrics
    pub service_name: String,

    /// Collector address, e.g. `http://otel-collector:4317`; local logs only when unset
    pub otlp_endpoint: Option<String>,

    /// JSON lines instead of human readable text
    pub json_logs: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "vsync".to_string(),
            otlp_endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok(),
            json_logs: std::env::var("KUBERNETES_SERVICE_HOST").is_ok(),
        }
    }
}

/// Install the global subscriber, propagator and exporters
///
/// Must run once, before the first syncer starts.
pub fn init_telemetry(config: TelemetryConfig) -> Result<(), TelemetryError> {
    global::set_text_map_propagator(TraceContextPropagator::new());

    let otel_layer = match &config.otlp_endpoint {
        Some(endpoint) => {
            let resource = Resource::new(resource_attributes(&config.service_name, |var| {
                std::env::var(var).ok()
            }));
            let tracer = install_exporters(endpoint, resource)?.tracer(config.service_name.clone());
            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let json = config.json_logs.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
    });
    let text = (!config.json_logs).then(tracing_subscriber::fmt::layer);

    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(text)
        .with(otel_layer)
        .try_init()
        .map_err(|e| TelemetryError::AlreadyInstalled(e.to_string()))
}

/// Resource attributes for `service_name`, reading the environment through `env`
fn resource_attributes(service_name: &str, env: impl Fn(&str) -> Option<String>) -> Vec<KeyValue> {
    let mut attributes = vec![
        KeyValue::new(SERVICE_NAME, service_name.to_string()),
        KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
    ];
    attributes.extend(
        RESOURCE_ENV
            .iter()
            .filter_map(|(var, key)| env(var).map(|value| KeyValue::new(*key, value))),
    );
    attributes
}

/// Register batch span and periodic metric exporters, returning the tracer provider
fn install_exporters(endpoint: &str, resource: Resource) -> Result<TracerProvider, TelemetryError> {
    let spans = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| TelemetryError::Exporter {
            signal: "traces",
            message: e.to_string(),
        })?;
    let metrics = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| TelemetryError::Exporter {
            signal: "metrics",
            message: e.to_string(),
        })?;

    global::set_meter_provider(
        SdkMeterProvider::builder()
            .with_reader(PeriodicReader::builder(metrics, runtime::Tokio).build())
            .with_resource(resource.clone())
            .build(),
    );

    let provider = TracerProvider::builder()
        .with_batch_exporter(spans, runtime::Tokio)
        .with_resource(resource)
        .build();
    global::set_tracer_provider(provider.clone());
    Ok(provider)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value_of(attributes: &[KeyValue], key: &str) -> Option<String> {
        attributes
            .iter()
            .find(|kv| kv.key.as_str() == key)
            .map(|kv| kv.value.to_string())
    }

    #[test]
    fn pod_identity_is_attached_when_present() {
        let attributes = resource_attributes("vsync-tenant", |var| match var {
            "POD_NAME" => Some("syncer-0".to_string()),
            "VSYNC_NAME" => Some("tenant".to_string()),
            _ => None,
        });

        assert_eq!(value_of(&attributes, SERVICE_NAME).as_deref(), Some("vsync-tenant"));
        assert_eq!(value_of(&attributes, "k8s.pod.name").as_deref(), Some("syncer-0"));
        assert_eq!(value_of(&attributes, "vsync.instance").as_deref(), Some("tenant"));
        assert!(value_of(&attributes, "k8s.namespace.name").is_none());
    }

    #[test]
    fn outside_a_pod_only_service_attributes_remain() {
        let attributes = resource_attributes("vsync", |_| None);
        assert_eq!(attributes.len(), 2);
        assert!(value_of(&attributes, SERVICE_VERSION).is_some());
    }

    #[test]
    fn fallback_filter_parses() {
        assert!(EnvFilter::try_new(DEFAULT_LOG_FILTER).is_ok());
    }

    #[test]
    fn exporter_errors_name_the_signal() {
        let err = TelemetryError::Exporter {
            signal: "metrics",
            message: "bad endpoint".to_string(),
        };
        assert_eq!(err.to_string(), "cannot export metrics to collector: bad endpoint");
    }
}
