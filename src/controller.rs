//! Controllers owning the live-reconfigurable state of the process.
//!
//! Each controller exposes `apply_update`, meant to be registered as a
//! [`ConfigSourceWatcher`](crate::watcher::ConfigSourceWatcher) callback.
//! Updates are idempotent per version, and a malformed payload leaves the active value untouched.

use std::{fmt, str::FromStr, sync::Arc};

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tokio_util::sync::{CancellationToken, DropGuard};
use tokio_util::task::TaskTracker;

use crate::watcher::ConfigSnapshot;

pub mod exporter;
pub mod level;
pub mod publisher;

pub use exporter::MetricsExporterController;
pub use level::{AtomicLevel, LogController};
pub use publisher::TracePublisherController;

/// An output backend that must be closed once it is no longer reachable.
pub trait Handle: Send + Sync + 'static {
    /// Flushes buffered output and releases the backend.
    fn close(&self);
}

/// The currently active handle, together with the configuration it was built from.
pub struct Active<C, H: ?Sized> {
    pub config: C,
    pub handle: Arc<H>,
    /// Cancelled once the last reference to this value is dropped.
    released: CancellationToken,
    _release: DropGuard,
}

impl<C, H: ?Sized> Active<C, H> {
    fn new(config: C, handle: Arc<H>) -> Self {
        let released = CancellationToken::new();
        Self {
            config,
            handle,
            _release: released.clone().drop_guard(),
            released,
        }
    }
}

/// Single-writer, multi-reader holder of the active handle.
///
/// Readers clone the active `Arc` out of the slot, so a handle replaced by an update
/// stays usable by the writers that already hold it. It is closed once the last of them lets go.
pub(crate) struct Slot<C, H: ?Sized> {
    active: ArcSwap<Active<C, H>>,
    last_version: Mutex<Option<String>>,
    retiring: TaskTracker,
}

impl<C, H> Slot<C, H>
where
    C: PartialEq + fmt::Display + Send + Sync + 'static,
    H: Handle + ?Sized,
{
    pub(crate) fn new(config: C, handle: Arc<H>) -> Self {
        Self {
            active: ArcSwap::from_pointee(Active::new(config, handle)),
            last_version: Mutex::new(None),
            retiring: TaskTracker::new(),
        }
    }

    pub(crate) fn load(&self) -> Arc<Active<C, H>> {
        self.active.load_full()
    }

    /// Parses `snapshot` and, if it describes a new configuration,
    /// swaps in a handle built from it.
    ///
    /// Must be called within a tokio runtime.
    pub(crate) fn update<E: fmt::Display>(
        &self,
        kind: &str,
        snapshot: &ConfigSnapshot,
        parse: impl FnOnce(&ConfigSnapshot) -> Result<C, E>,
        build: impl FnOnce(&C) -> Result<Arc<H>, E>,
    ) {
        let mut last_version = self.last_version.lock();
        if last_version.as_deref() == Some(snapshot.version.as_str()) {
            return;
        }
        *last_version = Some(snapshot.version.clone());

        let config = match parse(snapshot) {
            Ok(config) => config,
            Err(err) => {
                log::error!(
                    "Ignoring malformed {kind} configuration {} at version {:?}: {err}",
                    snapshot.name,
                    snapshot.version,
                );
                return;
            }
        };
        if self.active.load().config == config {
            log::debug!("{kind} configuration unchanged at version {:?}", snapshot.version);
            return;
        }

        let handle = match build(&config) {
            Ok(handle) => handle,
            Err(err) => {
                log::error!(
                    "Failed to set up {kind} for {config}, keeping the current one: {err}"
                );
                return;
            }
        };

        log::info!("Switching {kind} to {config}");
        let previous = self.active.swap(Arc::new(Active::new(config, handle)));
        self.retire(previous);
    }

    fn retire(&self, previous: Arc<Active<C, H>>) {
        let released = previous.released.clone();
        let handle = Arc::clone(&previous.handle);
        drop(previous);
        self.retiring.spawn(async move {
            released.cancelled().await;
            handle.close();
        });
    }

    /// Waits for replaced handles to close, then closes the active one.
    pub(crate) async fn shutdown(&self) {
        self.retiring.close();
        self.retiring.wait().await;
        self.active.load().handle.close();
    }
}

/// Parses an optional numeric field of a snapshot.
pub(crate) fn parse_field<T: FromStr>(
    snapshot: &ConfigSnapshot,
    key: &'static str,
) -> Result<Option<T>, InvalidField> {
    match snapshot.get(key).map(str::trim) {
        None | Some("") => Ok(None),
        Some(raw) => raw.parse().map(Some).map_err(|_| InvalidField {
            key,
            value: raw.to_owned(),
        }),
    }
}

/// A configuration field whose value cannot be interpreted.
#[derive(Debug, thiserror::Error)]
#[error("invalid value {value:?} for {key}")]
pub struct InvalidField {
    pub key: &'static str,
    pub value: String,
}
