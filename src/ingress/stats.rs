//! Per-event measurements of the ingress.

use std::{sync::Arc, time::Duration};

use axum::http::StatusCode;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::controller::exporter::{Sample, SampleValue};
use crate::controller::MetricsExporterController;

pub const EVENT_COUNT: &str = "event_count";
pub const EVENT_DISPATCH_LATENCIES: &str = "event_dispatch_latencies";

/// Longest name accepted as a Kubernetes object name or label value.
const MAX_NAME_LENGTH: usize = 63;
/// Hex digits of the digest that stands in for the cut part of a long name.
const DIGEST_LENGTH: usize = 32;

/// Records event counts and dispatch latencies into the active metrics exporter.
pub struct StatsReporter {
    container_name: String,
    unique_name: String,
    metrics: Arc<MetricsExporterController>,
}

impl StatsReporter {
    pub fn new(
        container_name: impl Into<String>,
        pod_name: &str,
        metrics: Arc<MetricsExporterController>,
    ) -> Self {
        Self {
            container_name: container_name.into(),
            unique_name: child_name(pod_name, &Uuid::new_v4().to_string()),
            metrics,
        }
    }

    /// Name distinguishing this process from other replicas.
    pub fn unique_name(&self) -> &str {
        &self.unique_name
    }

    pub fn report_event(
        &self,
        namespace: &str,
        broker: &str,
        status: StatusCode,
        latency: Duration,
    ) {
        let labels = vec![
            ("namespace_name".to_owned(), namespace.to_owned()),
            ("broker_name".to_owned(), broker.to_owned()),
            ("response_code".to_owned(), status.as_str().to_owned()),
            ("response_code_class".to_owned(), code_class(status)),
            ("container_name".to_owned(), self.container_name.clone()),
            ("unique_name".to_owned(), self.unique_name.clone()),
        ];

        self.metrics.record(&Sample {
            name: EVENT_COUNT.to_owned(),
            labels: labels.clone(),
            value: SampleValue::Counter(1),
        });
        self.metrics.record(&Sample {
            name: EVENT_DISPATCH_LATENCIES.to_owned(),
            labels,
            value: SampleValue::Histogram(latency.as_secs_f64() * 1000.0),
        });
    }
}

fn code_class(status: StatusCode) -> String {
    format!("{}xx", status.as_u16() / 100)
}

/// Appends `suffix` to `parent`.
///
/// When the result would not fit in [`MAX_NAME_LENGTH`], the tail of `parent` is replaced
/// by a digest of it. If even that leaves no room, the digest covers `suffix` as well.
fn child_name(parent: &str, suffix: &str) -> String {
    if parent.len() + suffix.len() <= MAX_NAME_LENGTH {
        return format!("{parent}{suffix}");
    }

    let head = MAX_NAME_LENGTH - DIGEST_LENGTH;
    if suffix.len() >= head {
        let whole = format!("{parent}{suffix}");
        return format!("{}{}", prefix(parent, head), digest(&whole));
    }
    format!(
        "{}{}{suffix}",
        prefix(parent, head - suffix.len()),
        digest(parent)
    )
}

fn prefix(name: &str, len: usize) -> String {
    name.chars().take(len).collect()
}

fn digest(input: &str) -> String {
    hex::encode(&Sha256::digest(input.as_bytes())[..DIGEST_LENGTH / 2])
}
