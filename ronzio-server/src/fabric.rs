//! Pub/sub fabric.
//!
//! The fabric is the topic-matching broadcast bus sessions register their
//! subscription handlers with. It is pluggable: anything implementing
//! [`PubSubFabric`] can back the broker (an external message bus, a cluster
//! bridge). [`MemoryFabric`] is the in-process implementation.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use ronzio_core::{error::Error, qos::QoS, topic, Result};

/// Options carried with a publish across the fabric.
#[derive(Debug, Clone, Default)]
pub struct DeliveryOptions {
    /// QoS the message was published with.
    pub qos: QoS,
    /// Deliver with the retain flag set (retained replay and will messages).
    pub retain: bool,
    /// Broker-assigned monotone token; a delivery without one is always
    /// accepted and stamped by the receiving session.
    pub dedup_id: Option<u64>,
    /// The packet was replayed from an offline queue.
    pub offline: bool,
    /// Id the packet is stored under in the offline queue, if any.
    pub stored_id: Option<u16>,
}

/// One matched publish handed to a subscription handler.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub topic: Arc<str>,
    pub payload: Bytes,
    pub options: DeliveryOptions,
    /// The filter the receiving subscription was registered under.
    pub sub_filter: Arc<str>,
    /// QoS granted to that subscription at registration time.
    pub sub_qos: QoS,
}

/// Registration token returned by [`PubSubFabric::subscribe`]. The session
/// retains it in its subscription map so UNSUBSCRIBE deregisters exactly the
/// handler that was registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(pub u64);

/// A subscription callback: binds the subscribed filter and granted QoS and
/// feeds matched publishes into the owning session's delivery queue.
#[derive(Debug, Clone)]
pub struct SubscriptionHandler {
    filter: Arc<str>,
    qos: QoS,
    deliveries: mpsc::UnboundedSender<Delivery>,
}

impl SubscriptionHandler {
    pub fn new(filter: Arc<str>, qos: QoS, deliveries: mpsc::UnboundedSender<Delivery>) -> Self {
        SubscriptionHandler {
            filter,
            qos,
            deliveries,
        }
    }

    pub fn filter(&self) -> &Arc<str> {
        &self.filter
    }

    /// Hand a matched publish to the owning session. A send failure means
    /// the session is gone and the delivery is dropped.
    pub fn deliver(&self, topic: &Arc<str>, payload: &Bytes, options: &DeliveryOptions) {
        let _ = self.deliveries.send(Delivery {
            topic: Arc::clone(topic),
            payload: payload.clone(),
            options: options.clone(),
            sub_filter: Arc::clone(&self.filter),
            sub_qos: self.qos,
        });
    }
}

/// The topic-matching broadcast bus.
#[async_trait]
pub trait PubSubFabric: Send + Sync {
    /// Register a handler for a topic filter.
    async fn subscribe(&self, filter: &str, handler: SubscriptionHandler) -> Result<HandlerId>;

    /// Remove a previously registered handler.
    async fn unsubscribe(&self, filter: &str, handler: HandlerId) -> Result<()>;

    /// Invoke every handler whose filter matches `topic`.
    async fn publish(&self, topic: &str, payload: Bytes, options: DeliveryOptions) -> Result<()>;
}

/// In-process fabric. Handler registries are kept behind an `RwLock` so
/// publishes from concurrent sessions only contend on reads.
#[derive(Default)]
pub struct MemoryFabric {
    state: RwLock<State>,
}

#[derive(Default)]
struct State {
    next_handler: u64,
    handlers: HashMap<u64, Entry>,
}

struct Entry {
    filter: String,
    handler: SubscriptionHandler,
}

impl MemoryFabric {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PubSubFabric for MemoryFabric {
    async fn subscribe(&self, filter: &str, handler: SubscriptionHandler) -> Result<HandlerId> {
        let mut state = self
            .state
            .write()
            .map_err(|e| Error::Fabric(e.to_string()))?;

        state.next_handler += 1;
        let id = state.next_handler;
        state.handlers.insert(
            id,
            Entry {
                filter: filter.to_string(),
                handler,
            },
        );
        Ok(HandlerId(id))
    }

    async fn unsubscribe(&self, filter: &str, handler: HandlerId) -> Result<()> {
        let mut state = self
            .state
            .write()
            .map_err(|e| Error::Fabric(e.to_string()))?;

        match state.handlers.remove(&handler.0) {
            Some(entry) if entry.filter == filter => Ok(()),
            Some(entry) => {
                // Registered under a different filter; restore and refuse.
                state.handlers.insert(handler.0, entry);
                Err(Error::Fabric(format!(
                    "handler not registered under `{filter}`"
                )))
            }
            None => Err(Error::Fabric(format!("no handler for `{filter}`"))),
        }
    }

    async fn publish(&self, topic: &str, payload: Bytes, options: DeliveryOptions) -> Result<()> {
        let state = self
            .state
            .read()
            .map_err(|e| Error::Fabric(e.to_string()))?;

        let topic: Arc<str> = Arc::from(topic);
        for entry in state.handlers.values() {
            if topic::matches(&topic, &entry.filter) {
                entry.handler.deliver(&topic, &payload, &options);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn recv(rx: &mut mpsc::UnboundedReceiver<Delivery>) -> Delivery {
        timeout(Duration::from_millis(10), rx.recv())
            .await
            .expect("no delivery")
            .expect("channel closed")
    }

    fn handler(
        filter: &str,
        qos: QoS,
    ) -> (SubscriptionHandler, mpsc::UnboundedReceiver<Delivery>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (SubscriptionHandler::new(Arc::from(filter), qos, tx), rx)
    }

    #[tokio::test]
    async fn test_publish_reaches_matching_handlers() {
        let fabric = MemoryFabric::new();
        let (h1, mut rx1) = handler("a/b", QoS::AtMostOnce);
        let (h2, mut rx2) = handler("a/+", QoS::AtMostOnce);
        let (h3, mut rx3) = handler("other", QoS::AtMostOnce);

        fabric.subscribe("a/b", h1).await.unwrap();
        fabric.subscribe("a/+", h2).await.unwrap();
        fabric.subscribe("other", h3).await.unwrap();

        fabric
            .publish("a/b", Bytes::from("m"), DeliveryOptions::default())
            .await
            .unwrap();

        let d1 = recv(&mut rx1).await;
        assert_eq!(d1.topic.as_ref(), "a/b");
        assert_eq!(d1.sub_filter.as_ref(), "a/b");

        let d2 = recv(&mut rx2).await;
        assert_eq!(d2.sub_filter.as_ref(), "a/+");

        assert!(timeout(Duration::from_millis(10), rx3.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let fabric = MemoryFabric::new();
        let (h, mut rx) = handler("t", QoS::AtMostOnce);
        let id = fabric.subscribe("t", h).await.unwrap();

        fabric.unsubscribe("t", id).await.unwrap();
        fabric
            .publish("t", Bytes::from("m"), DeliveryOptions::default())
            .await
            .unwrap();

        assert!(timeout(Duration::from_millis(10), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_unsubscribe_unknown_handler_errors() {
        let fabric = MemoryFabric::new();
        let (h, _rx) = handler("t", QoS::AtMostOnce);
        let id = fabric.subscribe("t", h).await.unwrap();

        fabric.unsubscribe("t", id).await.unwrap();
        assert!(fabric.unsubscribe("t", id).await.is_err());
    }

    #[tokio::test]
    async fn test_unsubscribe_checks_filter() {
        let fabric = MemoryFabric::new();
        let (h, mut rx) = handler("t", QoS::AtMostOnce);
        let id = fabric.subscribe("t", h).await.unwrap();

        assert!(fabric.unsubscribe("wrong", id).await.is_err());

        // Still registered under the original filter.
        fabric
            .publish("t", Bytes::from("m"), DeliveryOptions::default())
            .await
            .unwrap();
        recv(&mut rx).await;
    }
}
