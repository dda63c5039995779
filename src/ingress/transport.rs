//! Outbound HTTP client shared by every forwarded event.

use std::time::Duration;

use axum::body::Bytes;
use axum::http::{header, HeaderMap, StatusCode};

use crate::controller::publisher::RequestSpan;

/// Idle connections kept across all hosts.
pub const DEFAULT_MAX_IDLE_CONNS: usize = 1000;
/// Idle connections kept per host.
pub const DEFAULT_MAX_IDLE_CONNS_PER_HOST: usize = 1000;

/// Connection-pool sizing of a [`TransportClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionArgs {
    pub max_idle_conns: usize,
    pub max_idle_conns_per_host: usize,
}

impl Default for ConnectionArgs {
    fn default() -> Self {
        Self {
            max_idle_conns: DEFAULT_MAX_IDLE_CONNS,
            max_idle_conns_per_host: DEFAULT_MAX_IDLE_CONNS_PER_HOST,
        }
    }
}

/// Client forwarding binary-mode events to channels.
#[derive(Clone)]
pub struct TransportClient {
    client: reqwest::Client,
    args: ConnectionArgs,
}

impl TransportClient {
    pub fn new(args: ConnectionArgs) -> Result<Self, reqwest::Error> {
        // the pool is only bounded per host, so the global cap bounds that too
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(args.max_idle_conns_per_host.min(args.max_idle_conns))
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;
        Ok(Self { client, args })
    }

    pub fn args(&self) -> ConnectionArgs {
        self.args
    }

    /// Posts the event to `address`, returning the channel's response status.
    ///
    /// Only the CloudEvents attributes and the content type are forwarded,
    /// followed by the trace context of `span`.
    pub async fn send(
        &self,
        address: &str,
        headers: &HeaderMap,
        body: Bytes,
        span: &RequestSpan,
    ) -> Result<StatusCode, reqwest::Error> {
        let mut forwarded: HeaderMap = headers
            .iter()
            .filter(|(name, _)| *name == header::CONTENT_TYPE || name.as_str().starts_with("ce-"))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        span.inject(&mut forwarded);

        let response = self.client.post(address).headers(forwarded).body(body).send().await?;
        Ok(response.status())
    }
}
