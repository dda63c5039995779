//! Runtime-adjustable log severity.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};
use parking_lot::Mutex;

use crate::watcher::{ConfigBackend, ConfigSnapshot};

const FILTERS: [LevelFilter; 6] = [
    LevelFilter::Off,
    LevelFilter::Error,
    LevelFilter::Warn,
    LevelFilter::Info,
    LevelFilter::Debug,
    LevelFilter::Trace,
];

/// Key holding the logger configuration document.
pub const LOGGER_CONFIG_KEY: &str = "zap-logger-config";

/// A severity threshold shared between the logger and [`LogController`].
///
/// Cloning yields another handle to the same threshold.
#[derive(Debug, Clone)]
pub struct AtomicLevel(Arc<AtomicUsize>);

impl AtomicLevel {
    pub fn new(level: LevelFilter) -> Self {
        Self(Arc::new(AtomicUsize::new(level as usize)))
    }

    pub fn get(&self) -> LevelFilter {
        FILTERS
            .get(self.0.load(Ordering::Relaxed))
            .copied()
            .unwrap_or(LevelFilter::Trace)
    }

    pub fn set(&self, level: LevelFilter) {
        self.0.store(level as usize, Ordering::Relaxed);
    }
}

impl Default for AtomicLevel {
    fn default() -> Self {
        Self::new(LevelFilter::Info)
    }
}

/// Logger that drops records above the threshold of an [`AtomicLevel`].
pub struct LevelGate<L> {
    inner: L,
    level: AtomicLevel,
}

impl<L: Log> LevelGate<L> {
    pub fn new(inner: L, level: AtomicLevel) -> Self {
        Self { inner, level }
    }
}

impl<L: Log> Log for LevelGate<L> {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= self.level.get() && self.inner.enabled(metadata)
    }

    fn log(&self, record: &Record<'_>) {
        if self.enabled(record.metadata()) {
            self.inner.log(record);
        }
    }

    fn flush(&self) {
        self.inner.flush();
    }
}

/// Installs the process logger, gated by `level`.
pub fn install_logger(level: AtomicLevel) -> Result<(), SetLoggerError> {
    let inner = env_logger::Builder::new()
        .filter_level(LevelFilter::Trace)
        .format_timestamp_micros()
        .build();
    log::set_boxed_logger(Box::new(LevelGate::new(inner, level)))?;
    log::set_max_level(LevelFilter::Trace);
    Ok(())
}

/// Applies logging configuration updates to an [`AtomicLevel`].
pub struct LogController {
    level: AtomicLevel,
    component: String,
    last_version: Mutex<Option<String>>,
}

impl LogController {
    pub fn new(level: AtomicLevel, component: impl Into<String>) -> Self {
        Self {
            level,
            component: component.into(),
            last_version: Mutex::new(None),
        }
    }

    pub fn level(&self) -> &AtomicLevel {
        &self.level
    }

    /// Reads the source `name` once and applies it, before any watcher delivers it.
    ///
    /// A missing source applies the defaults. Only a failed read is an error.
    pub async fn preload<B: ConfigBackend>(&self, backend: &B, name: &str) -> Result<(), B::Error> {
        let snapshot = backend.get(name).await?.unwrap_or_else(|| ConfigSnapshot {
            name: name.to_owned(),
            ..ConfigSnapshot::default()
        });
        self.apply_update(&snapshot);
        Ok(())
    }

    pub fn apply_update(&self, snapshot: &ConfigSnapshot) {
        let mut last_version = self.last_version.lock();
        if last_version.as_deref() == Some(snapshot.version.as_str()) {
            return;
        }
        *last_version = Some(snapshot.version.clone());

        match level_for(snapshot, &self.component) {
            Ok(level) => {
                let previous = self.level.get();
                if previous != level {
                    self.level.set(level);
                    log::info!(
                        "Log level for {} changed from {previous} to {level}",
                        self.component
                    );
                }
            }
            Err(err) => log::error!(
                "Ignoring malformed logging configuration {} at version {:?}: {err}",
                snapshot.name,
                snapshot.version,
            ),
        }
    }
}

/// Resolves the level of `component`: its own key first, then the logger document, then info.
fn level_for(snapshot: &ConfigSnapshot, component: &str) -> Result<LevelFilter, LevelError> {
    if let Some(level) = snapshot.get(&format!("loglevel.{component}")) {
        return parse_level(level);
    }

    match snapshot.get(LOGGER_CONFIG_KEY).map(str::trim) {
        None | Some("") => Ok(LevelFilter::Info),
        Some(document) => {
            let document: serde_json::Value =
                serde_json::from_str(document).map_err(LevelError::Document)?;
            match document.get("level") {
                None => Ok(LevelFilter::Info),
                Some(serde_json::Value::String(level)) => parse_level(level),
                Some(other) => Err(LevelError::Unknown(other.to_string())),
            }
        }
    }
}

fn parse_level(level: &str) -> Result<LevelFilter, LevelError> {
    match level.trim().to_ascii_lowercase().as_str() {
        "trace" => Ok(LevelFilter::Trace),
        "debug" => Ok(LevelFilter::Debug),
        "info" => Ok(LevelFilter::Info),
        "warn" | "warning" => Ok(LevelFilter::Warn),
        "error" | "dpanic" | "panic" | "fatal" => Ok(LevelFilter::Error),
        _ => Err(LevelError::Unknown(level.to_owned())),
    }
}

#[derive(Debug, thiserror::Error)]
enum LevelError {
    #[error("unknown level {0:?}")]
    Unknown(String),
    #[error("invalid logger document: {0}")]
    Document(#[source] serde_json::Error),
}
