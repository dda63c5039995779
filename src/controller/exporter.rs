//! Metrics exporter selection, swappable at run time.

use std::{collections::BTreeMap, fmt, future::IntoFuture, io, mem, sync::Arc, time::Duration};

use axum::routing::get;
use axum::Router;
use metrics::{Key, Label, Level, Metadata, Recorder};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle, PrometheusRecorder};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::{parse_field, Handle, InvalidField, Slot};
use crate::watcher::ConfigSnapshot;

pub const BACKEND_KEY: &str = "metrics.backend-destination";
pub const PROMETHEUS_PORT_KEY: &str = "metrics.prometheus-port";
pub const REPORTING_PERIOD_KEY: &str = "metrics.reporting-period-seconds";

/// Default port of the Prometheus scrape endpoint.
pub const DEFAULT_PROMETHEUS_PORT: u16 = 9092;
/// Default flush period of the log backend.
pub const DEFAULT_REPORTING_PERIOD: Duration = Duration::from_secs(60);

/// A single measurement.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub name: String,
    pub labels: Vec<(String, String)>,
    pub value: SampleValue,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SampleValue {
    /// Increment of a monotonic counter.
    Counter(u64),
    /// Absolute value of a gauge.
    Gauge(f64),
    /// One observation of a distribution.
    Histogram(f64),
}

/// A metrics output backend.
pub trait MetricsExporter: Handle {
    fn record(&self, sample: &Sample);
}

/// Backend selection parsed from the observability configuration.
#[derive(Debug, Clone, PartialEq)]
pub enum ExporterConfig {
    Prometheus { port: u16 },
    Log { reporting_period: Duration },
    None,
}

impl ExporterConfig {
    pub fn from_snapshot(
        snapshot: &ConfigSnapshot,
        options: &ExporterOptions,
    ) -> Result<Self, ExporterError> {
        let backend = snapshot
            .get(BACKEND_KEY)
            .map(|backend| backend.trim().to_ascii_lowercase())
            .filter(|backend| !backend.is_empty())
            .unwrap_or_else(|| "prometheus".to_owned());

        match backend.as_str() {
            "prometheus" => {
                let port = parse_field::<u16>(snapshot, PROMETHEUS_PORT_KEY)?
                    .unwrap_or(options.prometheus_port);
                if port == 0 {
                    return Err(InvalidField {
                        key: PROMETHEUS_PORT_KEY,
                        value: port.to_string(),
                    }
                    .into());
                }
                Ok(Self::Prometheus { port })
            }
            "log" => {
                let reporting_period = match parse_field::<u64>(snapshot, REPORTING_PERIOD_KEY)? {
                    None => options.reporting_period,
                    Some(0) => {
                        return Err(InvalidField {
                            key: REPORTING_PERIOD_KEY,
                            value: "0".to_owned(),
                        }
                        .into())
                    }
                    Some(secs) => Duration::from_secs(secs),
                };
                Ok(Self::Log { reporting_period })
            }
            "none" => Ok(Self::None),
            _ => Err(ExporterError::UnknownBackend(backend)),
        }
    }
}

impl fmt::Display for ExporterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Prometheus { port } => write!(f, "prometheus exporter on port {port}"),
            Self::Log { reporting_period } => {
                write!(f, "log exporter every {}s", reporting_period.as_secs())
            }
            Self::None => f.write_str("no exporter"),
        }
    }
}

/// Fixed parameters of the exporters, independent of the configuration object.
#[derive(Debug, Clone)]
pub struct ExporterOptions {
    /// Name of the component emitting the metrics, used as log target of the log backend.
    pub component: String,
    pub prometheus_port: u16,
    pub reporting_period: Duration,
}

impl ExporterOptions {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            prometheus_port: DEFAULT_PROMETHEUS_PORT,
            reporting_period: DEFAULT_REPORTING_PERIOD,
        }
    }

    fn default_config(&self) -> ExporterConfig {
        ExporterConfig::Prometheus {
            port: self.prometheus_port,
        }
    }
}

/// Outcome of building an exporter.
pub type Built = Result<Arc<dyn MetricsExporter>, ExporterError>;

/// Builds an exporter, spawning its background work onto the given tracker.
type Builder = Box<dyn Fn(&ExporterConfig, &ExporterOptions, &TaskTracker) -> Built + Send + Sync>;

/// Owns the active metrics exporter and swaps it on configuration changes.
///
/// A sample is recorded into exactly one exporter: the one active when it was emitted.
pub struct MetricsExporterController {
    slot: Slot<ExporterConfig, dyn MetricsExporter>,
    options: ExporterOptions,
    builder: Builder,
    tasks: TaskTracker,
}

impl MetricsExporterController {
    /// Starts with the default exporter, or none if the default cannot be set up.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(options: ExporterOptions) -> Self {
        Self::with_builder(options, build_exporter)
    }

    pub fn with_builder(
        options: ExporterOptions,
        builder: impl Fn(&ExporterConfig, &ExporterOptions, &TaskTracker) -> Built
            + Send
            + Sync
            + 'static,
    ) -> Self {
        let tasks = TaskTracker::new();
        let config = options.default_config();
        let slot = match builder(&config, &options, &tasks) {
            Ok(exporter) => Slot::new(config, exporter),
            Err(err) => {
                log::error!("Failed to set up default {config}, exporting nothing: {err}");
                let exporter: Arc<dyn MetricsExporter> = Arc::new(NoExporter);
                Slot::new(ExporterConfig::None, exporter)
            }
        };
        Self {
            slot,
            options,
            builder: Box::new(builder),
            tasks,
        }
    }

    pub fn apply_update(&self, snapshot: &ConfigSnapshot) {
        self.slot.update(
            "metrics exporter",
            snapshot,
            |snapshot| ExporterConfig::from_snapshot(snapshot, &self.options),
            |config| (self.builder)(config, &self.options, &self.tasks),
        );
    }

    pub fn record(&self, sample: &Sample) {
        let active = self.slot.load();
        active.handle.record(sample);
    }

    /// Configuration of the active exporter.
    pub fn config(&self) -> ExporterConfig {
        self.slot.load().config.clone()
    }

    /// Closes every exporter, then waits for their endpoints and flush loops to exit.
    pub async fn shutdown(&self) {
        self.slot.shutdown().await;
        self.tasks.close();
        self.tasks.wait().await;
    }

    /// Controller whose exporters drop every sample.
    #[cfg(test)]
    pub(crate) fn discarding() -> Self {
        Self::with_builder(ExporterOptions::new("test"), |_, _, _| {
            Ok(Arc::new(NoExporter) as Arc<dyn MetricsExporter>)
        })
    }

    #[cfg(test)]
    pub(crate) fn active(&self) -> Arc<super::Active<ExporterConfig, dyn MetricsExporter>> {
        self.slot.load()
    }
}

/// Builds the exporter described by `config`.
pub fn build_exporter(
    config: &ExporterConfig,
    options: &ExporterOptions,
    tasks: &TaskTracker,
) -> Result<Arc<dyn MetricsExporter>, ExporterError> {
    let exporter: Arc<dyn MetricsExporter> = match config {
        ExporterConfig::Prometheus { port } => Arc::new(PrometheusExporter::bind(*port, tasks)?),
        ExporterConfig::Log { reporting_period } => Arc::new(LogExporter::start(
            options.component.clone(),
            *reporting_period,
            tasks,
        )),
        ExporterConfig::None => Arc::new(NoExporter),
    };
    Ok(exporter)
}

/// Exporter serving a Prometheus scrape endpoint at `/metrics`.
pub struct PrometheusExporter {
    recorder: PrometheusRecorder,
    handle: PrometheusHandle,
    stop: CancellationToken,
}

impl PrometheusExporter {
    /// Listens on `port` and serves the endpoint from a task on `tasks` until closed.
    pub fn bind(port: u16, tasks: &TaskTracker) -> Result<Self, ExporterError> {
        let bind_error = |source| ExporterError::Bind { port, source };
        let listener = std::net::TcpListener::bind(("0.0.0.0", port)).map_err(bind_error)?;
        listener.set_nonblocking(true).map_err(bind_error)?;
        let listener = tokio::net::TcpListener::from_std(listener).map_err(bind_error)?;

        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let stop = CancellationToken::new();

        let app = Router::new().route(
            "/metrics",
            get({
                let handle = handle.clone();
                move || std::future::ready(handle.render())
            }),
        );
        let serve = axum::serve(listener, app)
            .with_graceful_shutdown(stop.clone().cancelled_owned())
            .into_future();
        tasks.spawn(async move {
            if let Err(err) = serve.await {
                log::error!("Prometheus endpoint on port {port} failed: {err}");
            }
        });

        Ok(Self { recorder, handle, stop })
    }

    /// Renders the current state in the Prometheus text format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

impl Handle for PrometheusExporter {
    fn close(&self) {
        self.stop.cancel();
    }
}

impl MetricsExporter for PrometheusExporter {
    fn record(&self, sample: &Sample) {
        let labels: Vec<Label> = sample
            .labels
            .iter()
            .map(|(key, value)| Label::new(key.clone(), value.clone()))
            .collect();
        let key = Key::from_parts(sample.name.clone(), labels);
        let metadata = Metadata::new(module_path!(), Level::INFO, Some(module_path!()));

        match sample.value {
            SampleValue::Counter(delta) => {
                self.recorder.register_counter(&key, &metadata).increment(delta);
            }
            SampleValue::Gauge(value) => self.recorder.register_gauge(&key, &metadata).set(value),
            SampleValue::Histogram(value) => {
                self.recorder.register_histogram(&key, &metadata).record(value);
            }
        }
    }
}

#[derive(Default)]
struct Series {
    count: u64,
    sum: f64,
    last: f64,
}

/// Exporter aggregating samples in memory and writing one log line per series each period.
pub struct LogExporter {
    target: String,
    buffer: Arc<Mutex<BTreeMap<String, Series>>>,
    stop: CancellationToken,
}

impl LogExporter {
    /// Starts the flush loop on `tasks`. It runs until the exporter is closed.
    pub fn start(target: String, reporting_period: Duration, tasks: &TaskTracker) -> Self {
        let exporter = Self {
            target,
            buffer: Arc::default(),
            stop: CancellationToken::new(),
        };

        let target = exporter.target.clone();
        let buffer = Arc::clone(&exporter.buffer);
        let stop = exporter.stop.clone();
        tasks.spawn(async move {
            let mut ticks = tokio::time::interval(reporting_period);
            ticks.tick().await;
            loop {
                tokio::select! {
                    () = stop.cancelled() => break,
                    _ = ticks.tick() => flush_series(&target, &buffer),
                }
            }
        });

        exporter
    }

    /// Number of series with unflushed observations.
    pub fn pending(&self) -> usize {
        self.buffer.lock().len()
    }
}

fn series_name(sample: &Sample) -> String {
    if sample.labels.is_empty() {
        return sample.name.clone();
    }
    let labels: Vec<String> = sample.labels.iter().map(|(k, v)| format!("{k}={v:?}")).collect();
    format!("{}{{{}}}", sample.name, labels.join(","))
}

fn flush_series(target: &str, buffer: &Mutex<BTreeMap<String, Series>>) {
    let series = mem::take(&mut *buffer.lock());
    for (name, series) in series {
        log::info!(
            target: "metrics",
            "[{target}] {name} count={} sum={} last={}",
            series.count,
            series.sum,
            series.last,
        );
    }
}

impl Handle for LogExporter {
    fn close(&self) {
        self.stop.cancel();
        flush_series(&self.target, &self.buffer);
    }
}

impl MetricsExporter for LogExporter {
    fn record(&self, sample: &Sample) {
        let value = match sample.value {
            SampleValue::Counter(delta) => delta as f64,
            SampleValue::Gauge(value) | SampleValue::Histogram(value) => value,
        };
        let mut buffer = self.buffer.lock();
        let series = buffer.entry(series_name(sample)).or_default();
        series.count += 1;
        series.sum += value;
        series.last = value;
    }
}

/// Exporter discarding every sample.
pub struct NoExporter;

impl Handle for NoExporter {
    fn close(&self) {}
}

impl MetricsExporter for NoExporter {
    fn record(&self, _sample: &Sample) {}
}

/// The error type for exporter configuration and set-up.
#[derive(Debug, thiserror::Error)]
pub enum ExporterError {
    #[error("unknown metrics backend {0:?}")]
    UnknownBackend(String),
    #[error(transparent)]
    InvalidField(#[from] InvalidField),
    #[error("cannot listen on port {port}: {source}")]
    Bind { port: u16, source: io::Error },
}
