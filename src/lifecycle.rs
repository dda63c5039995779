//! Startup ordering, serving and shutdown of the process.

use std::{fmt, io, sync::Arc, time::Duration};

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::controller::{MetricsExporterController, TracePublisherController};
use crate::informer::{InformerCoordinator, SyncError};
use crate::ingress::IngressHandler;
use crate::watcher::{ConfigBackend, ConfigSourceWatcher, WatchError};

/// Time background tasks get to exit once shutdown begins.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Phase of the process. Phases are only ever entered in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum State {
    Initializing,
    ConfigWatchersStarting,
    InformersSyncing,
    Serving,
    ShuttingDown,
    Stopped,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Initializing => "initializing",
            Self::ConfigWatchersStarting => "starting config watchers",
            Self::InformersSyncing => "syncing informers",
            Self::Serving => "serving",
            Self::ShuttingDown => "shutting down",
            Self::Stopped => "stopped",
        })
    }
}

/// Everything [`LifecycleController::run`] drives.
pub struct Components<B, H> {
    pub watcher: ConfigSourceWatcher<B>,
    pub informers: InformerCoordinator,
    pub ingress: H,
    pub metrics: Arc<MetricsExporterController>,
    pub tracing: Arc<TracePublisherController>,
}

/// Owner of the process-wide cancellation token.
///
/// `main` creates exactly one; [`run`](Self::run) consumes it.
pub struct LifecycleController {
    cancel: CancellationToken,
    tasks: TaskTracker,
    state: watch::Sender<State>,
    grace_period: Duration,
}

impl Default for LifecycleController {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleController {
    pub fn new() -> Self {
        let (state, _) = watch::channel(State::Initializing);
        Self {
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
            state,
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }

    #[must_use]
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// The token that starts shutdown when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> State {
        *self.state.borrow()
    }

    /// Receiver observing every state transition.
    pub fn subscribe(&self) -> watch::Receiver<State> {
        self.state.subscribe()
    }

    /// Cancels on SIGINT or SIGTERM.
    pub fn listen_for_signals(&self) -> io::Result<()> {
        let mut terminate = signal(SignalKind::terminate())?;
        let mut interrupt = signal(SignalKind::interrupt())?;
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            loop {
                let name = tokio::select! {
                    Some(()) = terminate.recv() => "SIGTERM",
                    Some(()) = interrupt.recv() => "SIGINT",
                    else => break,
                };
                if cancel.is_cancelled() {
                    log::warn!("Received {name} while already shutting down");
                } else {
                    log::info!("Received {name}, shutting down");
                    cancel.cancel();
                }
            }
        });
        Ok(())
    }

    fn enter(&self, state: State) {
        let previous = self.state.send_replace(state);
        log::info!("Lifecycle: {previous} -> {state}");
    }

    /// Starts the components in order, serves until cancelled, then shuts everything down.
    ///
    /// Telemetry is flushed and the state reaches [`State::Stopped`]
    /// whether or not startup succeeded.
    pub async fn run<B, H>(self, components: Components<B, H>) -> Result<(), LifecycleError>
    where
        B: ConfigBackend,
        H: IngressHandler,
    {
        let Components {
            mut watcher,
            mut informers,
            ingress,
            metrics,
            tracing,
        } = components;

        self.enter(State::ConfigWatchersStarting);
        match watcher.start(&self.cancel, &self.tasks).await {
            Ok(()) => {}
            Err(WatchError::Cancelled) => {
                log::info!("Cancelled while starting configuration watchers");
                self.shut_down(&metrics, &tracing).await;
                return Ok(());
            }
            Err(err) => log::warn!("Continuing with default configuration: {err}"),
        }

        self.enter(State::InformersSyncing);
        let result = match informers.start_all(&self.cancel, &self.tasks).await {
            Ok(()) => {
                self.enter(State::Serving);
                self.serve(&ingress).await;
                Ok(())
            }
            Err(SyncError::Cancelled) => {
                log::info!("Cancelled before informers synced");
                Ok(())
            }
            Err(err) => Err(LifecycleError::Sync(err)),
        };

        self.shut_down(&metrics, &tracing).await;
        result
    }

    async fn serve<H: IngressHandler>(&self, ingress: &H) {
        let serve = ingress.start(self.cancel.clone());
        tokio::pin!(serve);

        let outcome = tokio::select! {
            outcome = &mut serve => Some(outcome),
            () = self.cancel.cancelled() => {
                tokio::time::timeout(self.grace_period, &mut serve).await.ok()
            }
        };
        match outcome {
            Some(Ok(())) => log::info!("Ingress stopped"),
            Some(Err(err)) => log::error!("Ingress failed: {err}"),
            None => log::error!("Ingress did not stop within {:?}", self.grace_period),
        }
    }

    async fn shut_down(
        &self,
        metrics: &MetricsExporterController,
        tracing: &TracePublisherController,
    ) {
        self.enter(State::ShuttingDown);
        self.cancel.cancel();
        self.tasks.close();
        if tokio::time::timeout(self.grace_period, self.tasks.wait()).await.is_err() {
            log::error!(
                "{} background tasks still running after {:?}",
                self.tasks.len(),
                self.grace_period
            );
        }

        let flush = async {
            tokio::join!(metrics.shutdown(), tracing.shutdown());
        };
        if tokio::time::timeout(self.grace_period, flush).await.is_err() {
            log::error!("Telemetry not flushed within {:?}", self.grace_period);
        }
        log::logger().flush();

        self.enter(State::Stopped);
    }
}

/// A failure that ends the process with a non-zero exit code.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("informers failed to sync: {0}")]
    Sync(#[from] SyncError),
}
