//! Cluster-resource watchers that must hold a complete initial view before traffic is served.

use std::{fmt::Debug, hash::Hash, mem};

use futures::future::{self, BoxFuture};
use futures::{FutureExt, StreamExt};
use kube_client::Api;
use kube_core::Resource;
use kube_runtime::reflector::Store;
use kube_runtime::{reflector, watcher, WatchStreamExt};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// A background watcher maintaining a local view of a resource collection.
pub trait Informer: Send + 'static {
    fn name(&self) -> String;

    /// Spawns the watch loop onto `tasks`, to run until `cancel` fires.
    ///
    /// The returned future resolves to `true` once the initial list has been received,
    /// or to `false` if the loop stopped before that.
    fn start(
        self: Box<Self>,
        cancel: CancellationToken,
        tasks: &TaskTracker,
    ) -> BoxFuture<'static, bool>;
}

/// Informer caching every object of the type `K` in a reflector [`Store`].
pub struct ReflectorInformer<K: Resource + 'static>
where
    K::DynamicType: Eq + Hash,
{
    name: String,
    api: Api<K>,
    watcher_config: watcher::Config,
    writer: reflector::store::Writer<K>,
}

impl<K> ReflectorInformer<K>
where
    K: Resource + 'static + Debug + Clone + DeserializeOwned + Send + Sync,
    K::DynamicType: Clone + Eq + Hash + Default + Send + Sync,
{
    pub fn new(name: impl Into<String>, api: Api<K>, watcher_config: watcher::Config) -> Self {
        Self::with(name, api, watcher_config, <_>::default())
    }
}

impl<K> ReflectorInformer<K>
where
    K: Resource + 'static + Debug + Clone + DeserializeOwned + Send + Sync,
    K::DynamicType: Clone + Eq + Hash + Send + Sync,
{
    /// Informer for objects of the type `dyntype`.
    pub fn with(
        name: impl Into<String>,
        api: Api<K>,
        watcher_config: watcher::Config,
        dyntype: K::DynamicType,
    ) -> Self {
        Self {
            name: name.into(),
            api,
            watcher_config,
            writer: reflector::store::Writer::new(dyntype),
        }
    }

    /// Read handle to the cached objects, usable before and after the informer starts.
    pub fn store(&self) -> Store<K> {
        self.writer.as_reader()
    }
}

impl<K> Informer for ReflectorInformer<K>
where
    K: Resource + 'static + Debug + Clone + DeserializeOwned + Send + Sync,
    K::DynamicType: Clone + Eq + Hash + Send + Sync,
{
    fn name(&self) -> String {
        self.name.clone()
    }

    fn start(
        self: Box<Self>,
        cancel: CancellationToken,
        tasks: &TaskTracker,
    ) -> BoxFuture<'static, bool> {
        let Self {
            name,
            api,
            watcher_config,
            writer,
        } = *self;
        let store = writer.as_reader();

        let mut events = reflector(writer, watcher(api, watcher_config).default_backoff()).boxed();
        tasks.spawn(async move {
            loop {
                let event = tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    event = events.next() => event,
                };
                match event {
                    None => break,
                    Some(Err(err)) => {
                        log::warn!("Informer {name} failed to watch, retrying: {err}");
                    }
                    Some(Ok(_)) => {}
                }
            }
            log::debug!("Informer {name} stopped");
        });

        async move { store.wait_until_ready().await.is_ok() }.boxed()
    }
}

/// Starts registered informers and waits for all of them to sync.
#[derive(Default)]
pub struct InformerCoordinator {
    informers: Vec<Box<dyn Informer>>,
}

impl InformerCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, informer: impl Informer) {
        self.informers.push(Box::new(informer));
    }

    pub fn len(&self) -> usize {
        self.informers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.informers.is_empty()
    }

    /// Starts every registered informer and returns once all have synced.
    ///
    /// Fails if `cancel` fires first or an informer stops before syncing.
    pub async fn start_all(
        &mut self,
        cancel: &CancellationToken,
        tasks: &TaskTracker,
    ) -> Result<(), SyncError> {
        let informers = mem::take(&mut self.informers);
        log::info!("Starting {} informers", informers.len());

        let pending: Vec<_> = informers
            .into_iter()
            .map(|informer| {
                let name = informer.name();
                let synced = informer.start(cancel.clone(), tasks);
                async move {
                    if synced.await {
                        log::debug!("Informer {name} synced");
                        Ok(())
                    } else {
                        Err(SyncError::Stopped(name))
                    }
                }
            })
            .collect();

        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(SyncError::Cancelled),
            result = future::try_join_all(pending) => result.map(drop),
        }
    }
}

/// The error type returned by [`InformerCoordinator::start_all`].
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("cancelled before informers synced")]
    Cancelled,
    #[error("informer {0} stopped before syncing")]
    Stopped(String),
}
