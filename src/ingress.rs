//! The serving loop: accepts events for a broker and forwards them to its channel.

use std::{future::Future, io, sync::Arc, time::Instant};

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::Router;
use opentelemetry::KeyValue;
use tokio_util::sync::CancellationToken;

use crate::controller::publisher::RequestSpan;
use crate::controller::TracePublisherController;

pub mod brokers;
pub mod defaulting;
pub mod stats;
pub mod transport;

pub use brokers::{BrokerLookup, BrokerStore, ChannelLookup};
pub use defaulting::TtlDefaulter;
pub use stats::StatsReporter;
pub use transport::{ConnectionArgs, TransportClient};

/// A blocking serve loop.
pub trait IngressHandler: Send + Sync + 'static {
    /// Serves until `cancel` fires or serving fails.
    fn start(
        &self,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<(), IngressError>> + Send;
}

/// The error type returned by [`IngressHandler::start`].
#[derive(Debug, thiserror::Error)]
pub enum IngressError {
    #[error("cannot listen on port {port}: {source}")]
    Bind { port: u16, source: io::Error },
    #[error("serving failed: {0}")]
    Serve(#[source] io::Error),
}

struct Shared<L> {
    brokers: L,
    transport: TransportClient,
    defaulter: TtlDefaulter,
    reporter: StatsReporter,
    tracing: Arc<TracePublisherController>,
}

/// HTTP ingress accepting binary-mode CloudEvents at `/{namespace}/{broker}`.
///
/// Also answers liveness probes at `/healthz`.
pub struct HttpIngress<L> {
    port: u16,
    shared: Arc<Shared<L>>,
}

impl<L: BrokerLookup> HttpIngress<L> {
    pub fn new(
        port: u16,
        brokers: L,
        transport: TransportClient,
        defaulter: TtlDefaulter,
        reporter: StatsReporter,
        tracing: Arc<TracePublisherController>,
    ) -> Self {
        Self {
            port,
            shared: Arc::new(Shared {
                brokers,
                transport,
                defaulter,
                reporter,
                tracing,
            }),
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/healthz", get(|| async { StatusCode::OK }))
            .route("/{namespace}/{broker}", post(receive::<L>))
            .with_state(Arc::clone(&self.shared))
    }
}

impl<L: BrokerLookup> IngressHandler for HttpIngress<L> {
    async fn start(&self, cancel: CancellationToken) -> Result<(), IngressError> {
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", self.port))
            .await
            .map_err(|source| IngressError::Bind { port: self.port, source })?;
        log::info!("Ingress listening on port {}", self.port);

        axum::serve(listener, self.router())
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await
            .map_err(IngressError::Serve)
    }
}

async fn receive<L: BrokerLookup>(
    State(shared): State<Arc<Shared<L>>>,
    Path((namespace, broker)): Path<(String, String)>,
    mut headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let started = Instant::now();
    let span = shared
        .tracing
        .start_span(format!("broker-ingress {namespace}/{broker}"), &headers);
    span.set_attribute(KeyValue::new("broker.namespace", namespace.clone()));
    span.set_attribute(KeyValue::new("broker.name", broker.clone()));

    let status = dispatch(&shared, &namespace, &broker, &mut headers, body, &span).await;

    shared
        .reporter
        .report_event(&namespace, &broker, status, started.elapsed());
    span.finish(status);
    status
}

async fn dispatch<L: BrokerLookup>(
    shared: &Shared<L>,
    namespace: &str,
    broker: &str,
    headers: &mut HeaderMap,
    body: Bytes,
    span: &RequestSpan,
) -> StatusCode {
    if !headers.contains_key("ce-specversion") || !headers.contains_key("ce-id") {
        log::debug!("Rejecting event for {namespace}/{broker} without CloudEvents headers");
        return StatusCode::BAD_REQUEST;
    }
    shared.defaulter.apply(headers);

    let address = match shared.brokers.channel(namespace, broker) {
        ChannelLookup::Address(address) => address,
        ChannelLookup::UnknownBroker => {
            log::debug!("Rejecting event for unknown broker {namespace}/{broker}");
            return StatusCode::NOT_FOUND;
        }
        ChannelLookup::NotReady => {
            log::warn!("Broker {namespace}/{broker} has no channel address yet");
            return StatusCode::INTERNAL_SERVER_ERROR;
        }
    };

    match shared.transport.send(&address, headers, body, span).await {
        Ok(status) if status.is_success() => StatusCode::ACCEPTED,
        Ok(status) => status,
        Err(err) => {
            log::warn!("Failed to forward event for {namespace}/{broker} to {address}: {err}");
            StatusCode::BAD_GATEWAY
        }
    }
}
