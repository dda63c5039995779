//! Resolution of a broker to the address of its backing channel.

use kube_core::{ApiResource, DynamicObject, GroupVersionKind};
use kube_runtime::reflector::{ObjectRef, Store};

/// Status annotation carrying the address of the broker's channel.
pub const CHANNEL_ADDRESS_ANNOTATION: &str = "knative.dev/channelAddress";

/// Outcome of looking a broker up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelLookup {
    UnknownBroker,
    /// The broker exists but does not publish a channel address yet.
    NotReady,
    Address(String),
}

pub trait BrokerLookup: Send + Sync + 'static {
    fn channel(&self, namespace: &str, broker: &str) -> ChannelLookup;
}

/// Broker lookup backed by an informer cache.
#[derive(Clone)]
pub struct BrokerStore {
    store: Store<DynamicObject>,
    resource: ApiResource,
}

impl BrokerStore {
    pub fn new(store: Store<DynamicObject>, resource: ApiResource) -> Self {
        Self { store, resource }
    }

    /// The `eventing.knative.dev/v1` Broker resource.
    pub fn broker_resource() -> ApiResource {
        ApiResource::from_gvk(&GroupVersionKind::gvk("eventing.knative.dev", "v1", "Broker"))
    }
}

impl BrokerLookup for BrokerStore {
    fn channel(&self, namespace: &str, broker: &str) -> ChannelLookup {
        let key = ObjectRef::new_with(broker, self.resource.clone()).within(namespace);
        match self.store.get(&key) {
            None => ChannelLookup::UnknownBroker,
            Some(object) => channel_address(&object),
        }
    }
}

fn channel_address(broker: &DynamicObject) -> ChannelLookup {
    let address = broker
        .data
        .get("status")
        .and_then(|status| status.get("annotations"))
        .and_then(|annotations| annotations.get(CHANNEL_ADDRESS_ANNOTATION))
        .and_then(serde_json::Value::as_str)
        .filter(|address| !address.is_empty());
    match address {
        Some(address) if address.contains("://") => ChannelLookup::Address(address.to_owned()),
        Some(host) => ChannelLookup::Address(format!("http://{host}")),
        None => ChannelLookup::NotReady,
    }
}

#[cfg(test)]
mod tests {
    use kube_runtime::watcher;
    use serde_json::json;

    use super::*;

    const CHANNEL_HOST: &str = "default-kne-trigger-kn-channel.default.svc.cluster.local";

    fn broker(name: &str, status: serde_json::Value) -> DynamicObject {
        DynamicObject::new(name, &BrokerStore::broker_resource())
            .within("default")
            .data(json!({ "spec": {}, "status": status }))
    }

    fn store_with(objects: Vec<DynamicObject>) -> BrokerStore {
        let resource = BrokerStore::broker_resource();
        let mut writer = kube_runtime::reflector::store::Writer::new(resource.clone());
        for object in objects {
            writer.apply_watcher_event(&watcher::Event::Applied(object));
        }
        BrokerStore::new(writer.as_reader(), resource)
    }

    #[test]
    fn resolves_channel_from_status_annotation() {
        let brokers = store_with(vec![broker(
            "default",
            json!({ "annotations": { "knative.dev/channelAddress": CHANNEL_HOST } }),
        )]);
        assert_eq!(
            brokers.channel("default", "default"),
            ChannelLookup::Address(format!("http://{CHANNEL_HOST}"))
        );
    }

    #[test]
    fn keeps_explicit_scheme() {
        let brokers = store_with(vec![broker(
            "default",
            json!({ "annotations": { "knative.dev/channelAddress": "https://channel.example" } }),
        )]);
        assert_eq!(
            brokers.channel("default", "default"),
            ChannelLookup::Address("https://channel.example".to_owned())
        );
    }

    #[test]
    fn distinguishes_unknown_and_unready_brokers() {
        let brokers = store_with(vec![broker("pending", json!({}))]);
        assert_eq!(brokers.channel("default", "pending"), ChannelLookup::NotReady);
        assert_eq!(brokers.channel("default", "missing"), ChannelLookup::UnknownBroker);
        assert_eq!(brokers.channel("other", "pending"), ChannelLookup::UnknownBroker);
    }
}
