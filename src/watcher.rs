//! Watches named configuration objects and notifies subscribers of every change.
//!
//! Each watched source gets one background loop. The loop invokes the callbacks of its source
//! one at a time, in the order the backend reports changes, so a callback is never reentered and
//! never sees an older value after a newer one.

use std::{collections::BTreeMap, fmt, future::Future, sync::Arc, time::Duration};

use futures::stream::BoxStream;
use futures::{future, StreamExt};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

pub mod backend;
pub use backend::KubeBackend;

/// How long [`ConfigSourceWatcher::start`] waits for the backend to answer its initial probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// The observed state of a configuration object.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConfigSnapshot {
    /// Name of the object.
    pub name: String,
    /// Opaque version token, changes whenever the object changes.
    pub version: String,
    /// Key-value payload of the object.
    pub data: BTreeMap<String, String>,
}

impl ConfigSnapshot {
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        data: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            data: data.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(String::as_str)
    }
}

/// A change reported by a [`ConfigBackend`] for one source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceEvent {
    /// The object was created or modified.
    Applied(ConfigSnapshot),
    /// The object does not exist (anymore).
    Deleted,
}

/// Storage holding the configuration objects.
pub trait ConfigBackend: Send + Sync + 'static {
    type Error: fmt::Display + Send + 'static;

    /// Fetches the current value of a source, `None` if it does not exist.
    fn get(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<Option<ConfigSnapshot>, Self::Error>> + Send;

    /// Streams every change of a source, starting with its current state.
    ///
    /// Transient errors are yielded as items and the stream carries on.
    fn subscribe(&self, name: &str) -> BoxStream<'static, Result<SourceEvent, Self::Error>>;
}

/// Callback invoked with the latest value of a source.
pub type Callback = Arc<dyn Fn(&ConfigSnapshot) + Send + Sync>;

#[derive(Default)]
struct Source {
    default: Option<ConfigSnapshot>,
    callbacks: Vec<Callback>,
}

/// Dispatches changes of watched configuration sources to their subscribers.
pub struct ConfigSourceWatcher<B> {
    backend: Arc<B>,
    sources: BTreeMap<String, Source>,
    probe_timeout: Duration,
    started: bool,
}

impl<B: ConfigBackend> ConfigSourceWatcher<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend: Arc::new(backend),
            sources: BTreeMap::new(),
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            started: false,
        }
    }

    #[must_use]
    pub fn with_probe_timeout(mut self, probe_timeout: Duration) -> Self {
        self.probe_timeout = probe_timeout;
        self
    }

    /// Registers `callback` for changes of the source `name`.
    pub fn watch(
        &mut self,
        name: impl Into<String>,
        callback: impl Fn(&ConfigSnapshot) + Send + Sync + 'static,
    ) {
        self.sources
            .entry(name.into())
            .or_default()
            .callbacks
            .push(Arc::new(callback));
    }

    /// Like [`watch`](Self::watch), but delivers `default` whenever the source does not exist.
    pub fn watch_with_default(
        &mut self,
        default: ConfigSnapshot,
        callback: impl Fn(&ConfigSnapshot) + Send + Sync + 'static,
    ) {
        let source = self.sources.entry(default.name.clone()).or_default();
        source.default = Some(default);
        source.callbacks.push(Arc::new(callback));
    }

    /// Names of the watched sources.
    pub fn sources(&self) -> impl Iterator<Item = &str> {
        self.sources.keys().map(String::as_str)
    }

    /// Spawns one loop per watched source onto `tasks` and probes the backend once.
    ///
    /// Returns as soon as the probe completes, times out, or `cancel` fires.
    /// An error means the backend could not be reached in time or a source without default
    /// is missing; the loops keep running and retrying regardless.
    pub async fn start(
        &mut self,
        cancel: &CancellationToken,
        tasks: &TaskTracker,
    ) -> Result<(), WatchError> {
        if self.started {
            return Err(WatchError::AlreadyStarted);
        }
        self.started = true;

        for (name, source) in &self.sources {
            let events = self.backend.subscribe(name);
            tasks.spawn(run_source(
                name.clone(),
                events,
                source.default.clone(),
                source.callbacks.clone(),
                cancel.clone(),
            ));
        }

        let probes = self.sources.iter().map(|(name, source)| {
            let backend = Arc::clone(&self.backend);
            async move {
                match backend.get(name).await {
                    Ok(Some(_)) => Ok(None),
                    Ok(None) if source.default.is_some() => Ok(None),
                    Ok(None) => Ok(Some(name.clone())),
                    Err(err) => Err(WatchError::Connect {
                        source_name: name.clone(),
                        reason: err.to_string(),
                    }),
                }
            }
        });
        let probes = tokio::time::timeout(self.probe_timeout, future::try_join_all(probes));
        let probed = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(WatchError::Cancelled),
            probed = probes => probed,
        };
        let missing: Vec<String> = probed
            .map_err(|_| WatchError::Timeout(self.probe_timeout))??
            .into_iter()
            .flatten()
            .collect();
        if !missing.is_empty() {
            return Err(WatchError::Missing(missing));
        }

        log::info!("Watching {} configuration sources", self.sources.len());
        Ok(())
    }
}

async fn run_source<E: fmt::Display + Send>(
    name: String,
    mut events: BoxStream<'static, Result<SourceEvent, E>>,
    default: Option<ConfigSnapshot>,
    callbacks: Vec<Callback>,
    cancel: CancellationToken,
) {
    let mut last_version: Option<String> = None;

    loop {
        let event = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            event = events.next() => event,
        };

        let snapshot = match event {
            None => {
                log::warn!("Configuration stream for {name} ended");
                break;
            }
            Some(Err(err)) => {
                log::warn!("Failed to watch configuration {name}, retrying: {err}");
                continue;
            }
            Some(Ok(SourceEvent::Applied(snapshot))) => snapshot,
            Some(Ok(SourceEvent::Deleted)) => match &default {
                Some(default) => default.clone(),
                None => {
                    log::warn!("Configuration {name} is absent, keeping the current value");
                    continue;
                }
            },
        };

        // relists replay the current object
        if last_version.as_deref() == Some(snapshot.version.as_str()) {
            continue;
        }
        last_version = Some(snapshot.version.clone());

        log::debug!("Configuration {name} changed to version {:?}", snapshot.version);
        for callback in &callbacks {
            callback(&snapshot);
        }
    }

    log::debug!("Stopped watching configuration {name}");
}

/// The error type returned by [`ConfigSourceWatcher::start`].
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("watcher already started")]
    AlreadyStarted,
    #[error("cancelled while probing the configuration backend")]
    Cancelled,
    #[error("configuration backend did not answer within {0:?}")]
    Timeout(Duration),
    #[error("cannot reach configuration backend for {source_name}: {reason}")]
    Connect { source_name: String, reason: String },
    #[error("configuration objects not found: {}", .0.join(", "))]
    Missing(Vec<String>),
}


#[cfg(test)]
mod tests {
    use std::time::Duration;

    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    use super::testing::FakeBackend;
    use super::*;

    fn snapshot(version: &str, level: &str) -> ConfigSnapshot {
        ConfigSnapshot::new("config-logging", version, [("loglevel", level)])
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<String>) -> String {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("callback not invoked in time")
            .expect("callback dropped")
    }

    #[tokio::test]
    async fn delivers_initial_value_then_changes_in_order() {
        let backend = FakeBackend::default();
        backend.apply(snapshot("1", "info"));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut watcher = ConfigSourceWatcher::new(backend.clone());
        watcher.watch("config-logging", move |snapshot| {
            tx.send(snapshot.version.clone()).unwrap();
        });

        let cancel = CancellationToken::new();
        let tasks = TaskTracker::new();
        watcher.start(&cancel, &tasks).await.unwrap();

        assert_eq!(next(&mut rx).await, "1");
        backend.apply(snapshot("2", "debug"));
        backend.apply(snapshot("3", "warn"));
        assert_eq!(next(&mut rx).await, "2");
        assert_eq!(next(&mut rx).await, "3");

        cancel.cancel();
        tasks.close();
        tasks.wait().await;
    }

    #[tokio::test]
    async fn callback_is_never_reentered() {
        let backend = FakeBackend::default();
        backend.apply(snapshot("0", "info"));

        let in_flight = Arc::new(Mutex::new(false));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut watcher = ConfigSourceWatcher::new(backend.clone());
        watcher.watch("config-logging", {
            let in_flight = Arc::clone(&in_flight);
            move |snapshot| {
                {
                    let mut flag = in_flight.lock();
                    assert!(!*flag, "callback reentered");
                    *flag = true;
                }
                std::thread::sleep(Duration::from_millis(1));
                *in_flight.lock() = false;
                tx.send(snapshot.version.clone()).unwrap();
            }
        });

        let cancel = CancellationToken::new();
        let tasks = TaskTracker::new();
        watcher.start(&cancel, &tasks).await.unwrap();

        for version in 1..=20 {
            backend.apply(snapshot(&version.to_string(), "info"));
        }
        let mut seen = Vec::new();
        for _ in 0..=20 {
            seen.push(next(&mut rx).await.parse::<u32>().unwrap());
        }
        assert_eq!(seen, (0..=20).collect::<Vec<_>>());

        cancel.cancel();
        tasks.close();
        tasks.wait().await;
    }

    #[tokio::test]
    async fn every_subscriber_of_a_source_sees_each_change() {
        let backend = FakeBackend::default();
        backend.apply(snapshot("1", "info"));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut watcher = ConfigSourceWatcher::new(backend.clone());
        for id in ["a", "b"] {
            let tx = tx.clone();
            watcher.watch("config-logging", move |snapshot| {
                tx.send(format!("{id}{}", snapshot.version)).unwrap();
            });
        }

        let cancel = CancellationToken::new();
        let tasks = TaskTracker::new();
        watcher.start(&cancel, &tasks).await.unwrap();

        let mut seen = vec![next(&mut rx).await, next(&mut rx).await];
        seen.sort();
        assert_eq!(seen, ["a1", "b1"]);
        cancel.cancel();
    }

    #[tokio::test]
    async fn default_is_delivered_for_missing_source() {
        let backend = FakeBackend::default();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut watcher = ConfigSourceWatcher::new(backend.clone());
        let default = ConfigSnapshot::new("config-logging", "", [("loglevel", "info")]);
        watcher.watch_with_default(default, move |snapshot| {
            tx.send(snapshot.get("loglevel").unwrap_or_default().to_owned())
                .unwrap();
        });

        let cancel = CancellationToken::new();
        let tasks = TaskTracker::new();
        watcher.start(&cancel, &tasks).await.unwrap();
        assert_eq!(next(&mut rx).await, "info");

        backend.apply(snapshot("5", "debug"));
        assert_eq!(next(&mut rx).await, "debug");

        backend.delete("config-logging");
        assert_eq!(next(&mut rx).await, "info");
        cancel.cancel();
    }

    #[tokio::test]
    async fn missing_source_without_default_is_reported() {
        let mut watcher = ConfigSourceWatcher::new(FakeBackend::default());
        watcher.watch("config-tracing", |_| {});

        let cancel = CancellationToken::new();
        let err = watcher.start(&cancel, &TaskTracker::new()).await.unwrap_err();
        assert!(matches!(err, WatchError::Missing(names) if names == ["config-tracing"]));
        cancel.cancel();
    }

    #[tokio::test]
    async fn unreachable_backend_fails_start_but_keeps_retrying() {
        let backend = FakeBackend::default();
        backend.set_unreachable(true);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut watcher = ConfigSourceWatcher::new(backend.clone());
        watcher.watch("config-logging", move |snapshot| {
            tx.send(snapshot.version.clone()).unwrap();
        });

        let cancel = CancellationToken::new();
        let tasks = TaskTracker::new();
        let err = watcher.start(&cancel, &tasks).await.unwrap_err();
        assert!(matches!(err, WatchError::Connect { .. }));

        backend.fail("config-logging", "connection reset");
        backend.set_unreachable(false);
        backend.apply(snapshot("7", "info"));
        assert_eq!(next(&mut rx).await, "7");

        assert!(matches!(
            watcher.start(&cancel, &tasks).await,
            Err(WatchError::AlreadyStarted)
        ));
        cancel.cancel();
    }

    #[tokio::test]
    async fn cancellation_interrupts_a_stalled_initial_read() {
        let backend = FakeBackend::default();
        backend.set_hanging(true);
        let mut watcher = ConfigSourceWatcher::new(backend);
        watcher.watch("config-logging", |_| {});

        let cancel = CancellationToken::new();
        let tasks = TaskTracker::new();
        let start = watcher.start(&cancel, &tasks);
        let stop = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        };
        let both = async { tokio::join!(start, stop) };
        let (result, ()) = tokio::time::timeout(Duration::from_secs(5), both)
            .await
            .expect("start ignored cancellation");
        assert!(matches!(result, Err(WatchError::Cancelled)));

        tasks.close();
        tasks.wait().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_initial_read_gives_up_after_the_timeout() {
        let backend = FakeBackend::default();
        backend.set_hanging(true);
        let mut watcher =
            ConfigSourceWatcher::new(backend.clone()).with_probe_timeout(Duration::from_secs(3));
        let (tx, mut rx) = mpsc::unbounded_channel();
        watcher.watch("config-logging", move |snapshot| {
            tx.send(snapshot.version.clone()).unwrap();
        });

        let cancel = CancellationToken::new();
        let tasks = TaskTracker::new();
        let err = watcher.start(&cancel, &tasks).await.unwrap_err();
        assert!(matches!(err, WatchError::Timeout(timeout) if timeout == Duration::from_secs(3)));

        backend.apply(snapshot("4", "info"));
        assert_eq!(next(&mut rx).await, "4");
        cancel.cancel();
    }

    #[tokio::test]
    async fn no_callbacks_after_cancellation() {
        let backend = FakeBackend::default();
        backend.apply(snapshot("1", "info"));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut watcher = ConfigSourceWatcher::new(backend.clone());
        watcher.watch("config-logging", move |snapshot| {
            let _ = tx.send(snapshot.version.clone());
        });

        let cancel = CancellationToken::new();
        let tasks = TaskTracker::new();
        watcher.start(&cancel, &tasks).await.unwrap();
        assert_eq!(next(&mut rx).await, "1");

        cancel.cancel();
        tasks.close();
        tokio::time::timeout(Duration::from_secs(5), tasks.wait())
            .await
            .unwrap();

        backend.apply(snapshot("2", "debug"));
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }
}
