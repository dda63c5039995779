use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::ConfigMap;
use kube_client::{Api, Client};
use kube_core::ResourceExt;
use kube_runtime::{watcher, WatchStreamExt};

use super::{ConfigBackend, ConfigSnapshot, SourceEvent};

/// Backend reading `ConfigMap`s of one namespace from the apiserver.
#[derive(Clone)]
pub struct KubeBackend {
    api: Api<ConfigMap>,
}

impl KubeBackend {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }
}

impl ConfigBackend for KubeBackend {
    type Error = Error;

    async fn get(&self, name: &str) -> Result<Option<ConfigSnapshot>, Error> {
        let object = self.api.get_opt(name).await.map_err(Error::Get)?;
        Ok(object.as_ref().map(snapshot_of))
    }

    fn subscribe(&self, name: &str) -> BoxStream<'static, Result<SourceEvent, Error>> {
        let config = watcher::Config::default().fields(&format!("metadata.name={name}"));

        watcher(self.api.clone(), config)
            .default_backoff()
            .map_ok(|event| match event {
                watcher::Event::Applied(object) => SourceEvent::Applied(snapshot_of(&object)),
                watcher::Event::Deleted(_) => SourceEvent::Deleted,
                // the field selector matches at most one object
                watcher::Event::Restarted(mut objects) => match objects.pop() {
                    Some(object) => SourceEvent::Applied(snapshot_of(&object)),
                    None => SourceEvent::Deleted,
                },
            })
            .map_err(Error::Watch)
            .boxed()
    }
}

fn snapshot_of(object: &ConfigMap) -> ConfigSnapshot {
    ConfigSnapshot {
        name: object.name_any(),
        version: object.resource_version().unwrap_or_default(),
        data: object.data.clone().unwrap_or_default(),
    }
}

/// The error type of [`KubeBackend`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("get failed: {0}")]
    Get(#[source] kube_client::Error),
    #[error("watch failed: {0}")]
    Watch(#[source] watcher::Error),
}
