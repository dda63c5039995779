//! Trace sampling and publishing, swappable at run time.

use std::{borrow::Cow, fmt, sync::Arc, thread};

use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use opentelemetry::propagation::{Extractor, Injector, TextMapPropagator};
use opentelemetry::trace::{SpanKind, Status, TraceContextExt, Tracer as _, TracerProvider as _};
use opentelemetry::{Context, KeyValue};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::{Sampler, SdkTracerProvider, Tracer, TracerProviderBuilder};
use opentelemetry_sdk::Resource;
use opentelemetry_zipkin::ZipkinExporter;

use super::{parse_field, Active, Handle, InvalidField, Slot};
use crate::watcher::ConfigSnapshot;

pub const BACKEND_KEY: &str = "backend";
pub const ZIPKIN_ENDPOINT_KEY: &str = "zipkin-endpoint";
pub const SAMPLE_RATE_KEY: &str = "sample-rate";
pub const DEBUG_KEY: &str = "debug";
/// Older switch equivalent to `backend: zipkin`.
pub const ENABLE_KEY: &str = "enable";

pub const DEFAULT_SAMPLE_RATE: f64 = 0.1;

/// Where sampled spans go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceBackend {
    None,
    Zipkin { endpoint: String },
}

/// Tracing configuration parsed from the tracing configuration object.
#[derive(Debug, Clone, PartialEq)]
pub struct PublisherConfig {
    pub backend: TraceBackend,
    /// Fraction of requests traced, within `0.0..=1.0`.
    pub sample_rate: f64,
    /// Trace every request regardless of `sample_rate`.
    pub debug: bool,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            backend: TraceBackend::None,
            sample_rate: DEFAULT_SAMPLE_RATE,
            debug: false,
        }
    }
}

impl PublisherConfig {
    pub fn from_snapshot(snapshot: &ConfigSnapshot) -> Result<Self, PublisherError> {
        let backend = snapshot.get(BACKEND_KEY).map(|backend| backend.trim().to_ascii_lowercase());
        let backend = match backend {
            Some(backend) if !backend.is_empty() => backend,
            _ if parse_flag(snapshot, ENABLE_KEY)?.unwrap_or(false) => "zipkin".to_owned(),
            _ => "none".to_owned(),
        };

        let backend = match backend.as_str() {
            "none" => TraceBackend::None,
            "zipkin" => {
                let endpoint = snapshot
                    .get(ZIPKIN_ENDPOINT_KEY)
                    .map(str::trim)
                    .filter(|endpoint| !endpoint.is_empty())
                    .ok_or(PublisherError::MissingEndpoint)?;
                reqwest::Url::parse(endpoint).map_err(|_| InvalidField {
                    key: ZIPKIN_ENDPOINT_KEY,
                    value: endpoint.to_owned(),
                })?;
                TraceBackend::Zipkin {
                    endpoint: endpoint.to_owned(),
                }
            }
            _ => return Err(PublisherError::UnknownBackend(backend)),
        };

        let sample_rate =
            parse_field::<f64>(snapshot, SAMPLE_RATE_KEY)?.unwrap_or(DEFAULT_SAMPLE_RATE);
        if !(0.0..=1.0).contains(&sample_rate) {
            return Err(InvalidField {
                key: SAMPLE_RATE_KEY,
                value: sample_rate.to_string(),
            }
            .into());
        }

        Ok(Self {
            backend,
            sample_rate,
            debug: parse_flag(snapshot, DEBUG_KEY)?.unwrap_or(false),
        })
    }
}

impl fmt::Display for PublisherConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.backend {
            TraceBackend::None => f.write_str("no trace publisher"),
            TraceBackend::Zipkin { endpoint } if self.debug => {
                write!(f, "zipkin publisher to {endpoint} sampling everything")
            }
            TraceBackend::Zipkin { endpoint } => {
                write!(f, "zipkin publisher to {endpoint} sampling {}", self.sample_rate)
            }
        }
    }
}

fn parse_flag(snapshot: &ConfigSnapshot, key: &'static str) -> Result<Option<bool>, InvalidField> {
    match snapshot.get(key).map(|value| value.trim().to_ascii_lowercase()) {
        None => Ok(None),
        Some(value) => match value.as_str() {
            "" => Ok(None),
            "true" | "t" | "1" => Ok(Some(true)),
            "false" | "f" | "0" => Ok(Some(false)),
            _ => Err(InvalidField { key, value }),
        },
    }
}

/// Builds the provider for a configuration from a base already carrying
/// its sampler and resource.
type Builder = Box<
    dyn Fn(&PublisherConfig, TracerProviderBuilder) -> Result<SdkTracerProvider, PublisherError>
        + Send
        + Sync,
>;

/// Owns the active tracer provider and swaps it on configuration changes.
pub struct TracePublisherController {
    slot: Slot<PublisherConfig, Publisher>,
    resource: Resource,
    builder: Builder,
}

impl TracePublisherController {
    /// Starts without publishing until the first configuration arrives.
    pub fn new(service_name: impl Into<String>) -> Self {
        Self::with_builder(service_name, build_provider)
    }

    pub fn with_builder(
        service_name: impl Into<String>,
        builder: impl Fn(
                &PublisherConfig,
                TracerProviderBuilder,
            ) -> Result<SdkTracerProvider, PublisherError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        let resource = Resource::builder_empty()
            .with_attributes([KeyValue::new("service.name", service_name.into())])
            .build();
        let config = PublisherConfig::default();
        let disabled = Publisher::new(base_provider(&config, &resource).build());
        Self {
            slot: Slot::new(config, Arc::new(disabled)),
            resource,
            builder: Box::new(builder),
        }
    }

    pub fn apply_update(&self, snapshot: &ConfigSnapshot) {
        self.slot.update(
            "trace publisher",
            snapshot,
            PublisherConfig::from_snapshot,
            |config| {
                let provider = (self.builder)(config, base_provider(config, &self.resource))?;
                Ok(Arc::new(Publisher::new(provider)))
            },
        );
    }

    /// Starts the server span of a request, continuing the trace context carried by `headers`.
    ///
    /// The span keeps the provider active at its start alive until it ends.
    pub fn start_span(
        &self,
        name: impl Into<Cow<'static, str>>,
        headers: &HeaderMap,
    ) -> RequestSpan {
        let active = self.slot.load();
        let parent = TraceContextPropagator::new().extract(&HeaderExtractor(headers));
        let span = active
            .handle
            .tracer
            .span_builder(name)
            .with_kind(SpanKind::Server)
            .start_with_context(&active.handle.tracer, &parent);
        RequestSpan {
            context: parent.with_span(span),
            _active: active,
        }
    }

    pub fn config(&self) -> PublisherConfig {
        self.slot.load().config.clone()
    }

    /// Shuts every provider down, flushing what they still buffer.
    pub async fn shutdown(&self) {
        self.slot.shutdown().await;
    }
}

fn base_provider(config: &PublisherConfig, resource: &Resource) -> TracerProviderBuilder {
    let sampler = match config.backend {
        TraceBackend::None => Sampler::AlwaysOff,
        TraceBackend::Zipkin { .. } if config.debug => Sampler::AlwaysOn,
        TraceBackend::Zipkin { .. } => {
            Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(config.sample_rate)))
        }
    };
    SdkTracerProvider::builder()
        .with_sampler(sampler)
        .with_resource(resource.clone())
}

/// Adds the exporter described by `config` to `base`.
pub fn build_provider(
    config: &PublisherConfig,
    base: TracerProviderBuilder,
) -> Result<SdkTracerProvider, PublisherError> {
    let TraceBackend::Zipkin { endpoint } = &config.backend else {
        return Ok(base.build());
    };
    // the exporter's blocking client runs its own runtime, so it is built off ours
    let exporter = thread::scope(|scope| {
        scope
            .spawn(|| ZipkinExporter::builder().with_collector_endpoint(endpoint.as_str()).build())
            .join()
    })
    .map_err(|_| PublisherError::Exporter("zipkin exporter set-up panicked".to_owned()))?
    .map_err(|err| PublisherError::Exporter(err.to_string()))?;
    Ok(base.with_batch_exporter(exporter).build())
}

/// A tracer provider together with the tracer the ingress records with.
pub struct Publisher {
    provider: SdkTracerProvider,
    tracer: Tracer,
}

impl Publisher {
    fn new(provider: SdkTracerProvider) -> Self {
        Self {
            tracer: provider.tracer(env!("CARGO_PKG_NAME")),
            provider,
        }
    }
}

impl Handle for Publisher {
    fn close(&self) {
        if let Err(err) = self.provider.shutdown() {
            log::warn!("Failed to flush trace publisher: {err}");
        }
    }
}

/// The server span of one request, bound to the provider active when it started.
pub struct RequestSpan {
    context: Context,
    _active: Arc<Active<PublisherConfig, Publisher>>,
}

impl RequestSpan {
    pub fn is_sampled(&self) -> bool {
        self.context.span().span_context().is_sampled()
    }

    pub fn set_attribute(&self, attribute: KeyValue) {
        self.context.span().set_attribute(attribute);
    }

    /// Writes this span's trace context into outgoing `headers`.
    pub fn inject(&self, headers: &mut HeaderMap) {
        TraceContextPropagator::new().inject_context(&self.context, &mut HeaderInjector(headers));
    }

    /// Records the response status and ends the span.
    pub fn finish(self, status: StatusCode) {
        let span = self.context.span();
        span.set_attribute(KeyValue::new("http.status_code", i64::from(status.as_u16())));
        if status.is_server_error() {
            span.set_status(Status::error(status.to_string()));
        }
        span.end();
    }
}

struct HeaderExtractor<'a>(&'a HeaderMap);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|value| value.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(HeaderName::as_str).collect()
    }
}

struct HeaderInjector<'a>(&'a mut HeaderMap);

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        let name = HeaderName::from_bytes(key.as_bytes());
        if let (Ok(name), Ok(value)) = (name, HeaderValue::from_str(&value)) {
            self.0.insert(name, value);
        }
    }
}

/// The error type for publisher configuration and set-up.
#[derive(Debug, thiserror::Error)]
pub enum PublisherError {
    #[error("unknown tracing backend {0:?}")]
    UnknownBackend(String),
    #[error("zipkin backend requires zipkin-endpoint")]
    MissingEndpoint,
    #[error(transparent)]
    InvalidField(#[from] InvalidField),
    #[error("cannot build trace exporter: {0}")]
    Exporter(String),
}

#[cfg(test)]
mod tests {
    use opentelemetry::trace::{SpanId, TraceId};
    use opentelemetry_sdk::trace::InMemorySpanExporter;

    use super::*;

    fn tracing(version: &str, data: &[(&str, &str)]) -> ConfigSnapshot {
        ConfigSnapshot::new("config-tracing", version, data.iter().copied())
    }

    const ZIPKIN: &[(&str, &str)] = &[
        (BACKEND_KEY, "zipkin"),
        (ZIPKIN_ENDPOINT_KEY, "http://zipkin.istio-system:9411/api/v2/spans"),
        (SAMPLE_RATE_KEY, "0.5"),
    ];

    const PARENT: &str = "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01";

    #[test]
    fn parses_zipkin_configuration() {
        let config = PublisherConfig::from_snapshot(&tracing("1", ZIPKIN)).unwrap();
        assert_eq!(
            config.backend,
            TraceBackend::Zipkin {
                endpoint: "http://zipkin.istio-system:9411/api/v2/spans".to_owned()
            }
        );
        assert!((config.sample_rate - 0.5).abs() < f64::EPSILON);
        assert!(!config.debug);
    }

    #[test]
    fn empty_configuration_disables_tracing() {
        assert_eq!(
            PublisherConfig::from_snapshot(&tracing("1", &[])).unwrap(),
            PublisherConfig::default()
        );
    }

    #[test]
    fn enable_flag_selects_zipkin() {
        let config = PublisherConfig::from_snapshot(&tracing(
            "1",
            &[
                (ENABLE_KEY, "True"),
                (ZIPKIN_ENDPOINT_KEY, "http://zipkin:9411/api/v2/spans"),
                (DEBUG_KEY, "true"),
            ],
        ))
        .unwrap();
        assert!(matches!(config.backend, TraceBackend::Zipkin { .. }));
        assert!(config.debug);
    }

    #[test]
    fn rejects_malformed_payloads() {
        for data in [
            &[(BACKEND_KEY, "jaeger")][..],
            &[(BACKEND_KEY, "zipkin")][..],
            &[(BACKEND_KEY, "zipkin"), (ZIPKIN_ENDPOINT_KEY, "not a url")][..],
            &[(SAMPLE_RATE_KEY, "1.5")][..],
            &[(SAMPLE_RATE_KEY, "NaN")][..],
            &[(SAMPLE_RATE_KEY, "often")][..],
            &[(DEBUG_KEY, "yes please")][..],
        ] {
            assert!(PublisherConfig::from_snapshot(&tracing("1", data)).is_err(), "{data:?}");
        }
    }

    /// A controller whose zipkin providers export into one in-memory exporter.
    fn recording_controller() -> (TracePublisherController, InMemorySpanExporter) {
        let exporter = InMemorySpanExporter::default();
        let controller = TracePublisherController::with_builder("cluster-broker-ingress.test", {
            let exporter = exporter.clone();
            move |config, base| match config.backend {
                TraceBackend::None => Ok(base.build()),
                TraceBackend::Zipkin { .. } => {
                    Ok(base.with_simple_exporter(exporter.clone()).build())
                }
            }
        });
        (controller, exporter)
    }

    fn debug_zipkin(version: &str, endpoint: &str) -> ConfigSnapshot {
        tracing(
            version,
            &[(BACKEND_KEY, "zipkin"), (ZIPKIN_ENDPOINT_KEY, endpoint), (DEBUG_KEY, "true")],
        )
    }

    #[tokio::test]
    async fn span_continues_the_incoming_trace() {
        let (controller, exporter) = recording_controller();
        controller.apply_update(&debug_zipkin("1", "http://zipkin:9411/api/v2/spans"));

        let mut incoming = HeaderMap::new();
        incoming.insert("traceparent", HeaderValue::from_static(PARENT));
        let span = controller.start_span("ingress", &incoming);
        assert!(span.is_sampled());

        let mut outgoing = HeaderMap::new();
        span.inject(&mut outgoing);
        span.finish(StatusCode::ACCEPTED);

        let spans = exporter.get_finished_spans().unwrap();
        assert_eq!(spans.len(), 1);
        let recorded = &spans[0];
        let trace_id = TraceId::from_hex("4bf92f3577b34da6a3ce929d0e0e4736").unwrap();
        assert_eq!(recorded.span_context.trace_id(), trace_id);
        assert_eq!(recorded.parent_span_id, SpanId::from_hex("00f067aa0ba902b7").unwrap());
        assert_eq!(recorded.span_kind, SpanKind::Server);
        assert!(recorded
            .attributes
            .contains(&KeyValue::new("http.status_code", 202_i64)));

        let traceparent = outgoing["traceparent"].to_str().unwrap();
        let span_id = recorded.span_context.span_id();
        assert_eq!(traceparent, format!("00-{trace_id}-{span_id}-01"));
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn span_ends_on_the_provider_it_started_with() {
        let (controller, exporter) = recording_controller();
        controller.apply_update(&debug_zipkin("1", "http://zipkin:9411/api/v2/spans"));
        let span = controller.start_span("ingress", &HeaderMap::new());

        controller.apply_update(&tracing("2", &[]));
        tokio::task::yield_now().await;
        assert_eq!(controller.config(), PublisherConfig::default());

        span.finish(StatusCode::ACCEPTED);
        assert_eq!(exporter.get_finished_spans().unwrap().len(), 1);

        let unsampled = controller.start_span("ingress", &HeaderMap::new());
        assert!(!unsampled.is_sampled());
        unsampled.finish(StatusCode::ACCEPTED);
        assert_eq!(exporter.get_finished_spans().unwrap().len(), 1);
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn malformed_update_keeps_active_provider() {
        let (controller, _exporter) = recording_controller();
        controller.apply_update(&tracing("1", ZIPKIN));
        controller.apply_update(&tracing("2", &[(SAMPLE_RATE_KEY, "2")]));

        assert!(matches!(controller.config().backend, TraceBackend::Zipkin { .. }));
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn disabled_tracing_still_propagates_the_context() {
        let controller = TracePublisherController::new("svc");
        let mut incoming = HeaderMap::new();
        incoming.insert("traceparent", HeaderValue::from_static(PARENT));

        let span = controller.start_span("ingress", &incoming);
        assert!(!span.is_sampled());
        let mut outgoing = HeaderMap::new();
        span.inject(&mut outgoing);
        span.finish(StatusCode::ACCEPTED);

        let traceparent = outgoing["traceparent"].to_str().unwrap();
        assert!(traceparent.starts_with("00-4bf92f3577b34da6a3ce929d0e0e4736-"), "{traceparent}");
        assert!(traceparent.ends_with("-00"), "{traceparent}");
        controller.shutdown().await;
    }
}
