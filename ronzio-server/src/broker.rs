//! Broker-wide state the session core coordinates with.
//!
//! One `Broker` is shared by every session: it owns the pub/sub fabric, the
//! persistence backend, the authorization hooks, the process-wide dedup id
//! source, the table of connected clients, and the event stream the
//! embedding server can observe.

use std::{
    collections::{hash_map::Entry, HashMap},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tracing::{debug, error};

use ronzio_core::{error::Error, message::Message, Result};
use ronzio_storage::{BrokerStore, SessionState, StoredSubscription};

use crate::{
    fabric::{Delivery, DeliveryOptions, PubSubFabric, SubscriptionHandler},
    hooks::AuthHooks,
};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Configuration for the broker.
#[derive(Debug, Clone)]
pub struct BrokerOptions {
    /// Number of unacknowledged QoS 1 messages a session may hold before it
    /// is closed.
    pub max_inflight_messages: usize,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        BrokerOptions {
            max_inflight_messages: 1024,
        }
    }
}

/// Lifecycle notifications emitted by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    ClientConnected { client_id: String },
    ClientDisconnected { client_id: String },
    Subscribed { client_id: String, filter: String },
    Unsubscribed { client_id: String, filter: String },
}

/// Entry in the connected-clients table. The takeover channel lets a new
/// CONNECT with the same client id displace the session that owns it.
pub(crate) struct SessionHandle {
    epoch: u64,
    takeover: mpsc::UnboundedSender<oneshot::Sender<()>>,
}

pub struct Broker<S> {
    shared: Arc<Shared<S>>,
}

impl<S> Clone for Broker<S> {
    fn clone(&self) -> Self {
        Broker {
            shared: Arc::clone(&self.shared),
        }
    }
}

struct Shared<S> {
    fabric: Arc<dyn PubSubFabric>,
    storage: Arc<S>,
    hooks: Arc<dyn AuthHooks>,
    options: BrokerOptions,
    clients: Mutex<HashMap<String, SessionHandle>>,
    /// Source of dedup ids; starts above the sentinel `0` every session
    /// initializes `last_dedup_id` to.
    dedup_ids: AtomicU64,
    /// Source of client-table epochs, so a stale close never evicts the
    /// session that displaced it.
    epochs: AtomicU64,
    events: broadcast::Sender<BrokerEvent>,
}

impl<S: BrokerStore> Broker<S> {
    pub fn new(
        fabric: Arc<dyn PubSubFabric>,
        storage: Arc<S>,
        hooks: Arc<dyn AuthHooks>,
        options: BrokerOptions,
    ) -> Broker<S> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Broker {
            shared: Arc::new(Shared {
                fabric,
                storage,
                hooks,
                options,
                clients: Mutex::new(HashMap::new()),
                dedup_ids: AtomicU64::new(0),
                epochs: AtomicU64::new(0),
                events,
            }),
        }
    }

    /// Subscribe to broker lifecycle events.
    pub fn events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.shared.events.subscribe()
    }

    pub(crate) fn emit(&self, event: BrokerEvent) {
        // Nobody listening is fine.
        let _ = self.shared.events.send(event);
    }

    pub(crate) fn fabric(&self) -> &Arc<dyn PubSubFabric> {
        &self.shared.fabric
    }

    pub(crate) fn storage(&self) -> &Arc<S> {
        &self.shared.storage
    }

    pub(crate) fn hooks(&self) -> &Arc<dyn AuthHooks> {
        &self.shared.hooks
    }

    pub(crate) fn max_inflight(&self) -> usize {
        self.shared.options.max_inflight_messages
    }

    /// Strictly monotone, process-wide.
    pub(crate) fn next_dedup_id(&self) -> u64 {
        self.shared.dedup_ids.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Publish a message: store or clear the retained copy when the retain
    /// flag is set, stamp a dedup id if the publish does not carry one yet,
    /// and fan out across the fabric. Live deliveries always go out with the
    /// retain flag cleared; only retained replay sets it.
    pub async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        mut options: DeliveryOptions,
    ) -> Result<()> {
        if options.retain {
            let stored = if payload.is_empty() {
                // Empty payload clears the retained message
                None
            } else {
                Some(Message {
                    topic: Arc::from(topic),
                    qos: options.qos,
                    retain: false,
                    payload: payload.clone(),
                })
            };
            self.shared
                .storage
                .store_retained(topic, stored)
                .await
                .map_err(|e| Error::Storage(e.to_string()))?;
        }

        if options.dedup_id.is_none() {
            options.dedup_id = Some(self.next_dedup_id());
        }
        options.retain = false;

        self.shared.fabric.publish(topic, payload, options).await
    }

    /// Replay retained messages matching `filter` through a subscription
    /// handler, so they take the normal forwarding path of the session.
    pub(crate) async fn forward_retained(
        &self,
        filter: &str,
        handler: &SubscriptionHandler,
    ) -> Result<()> {
        let retained = self
            .shared
            .storage
            .matching_retained(filter)
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;

        for message in retained {
            let options = DeliveryOptions {
                qos: message.qos,
                retain: true,
                ..DeliveryOptions::default()
            };
            handler.deliver(&message.topic, &message.payload, &options);
        }
        Ok(())
    }

    /// Replay a client's offline queue into its delivery channel. Each packet
    /// carries the id it is stored under so the session can rewrite it to the
    /// freshly allocated one before writing.
    pub(crate) async fn forward_offline_packets(
        &self,
        client_id: &str,
        deliveries: &mpsc::UnboundedSender<Delivery>,
    ) -> Result<()> {
        let queued = self
            .shared
            .storage
            .offline_packets(client_id)
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;

        for packet in queued {
            let topic: Arc<str> = Arc::from(packet.topic.as_str());
            let delivery = Delivery {
                topic: Arc::clone(&topic),
                payload: packet.payload,
                options: DeliveryOptions {
                    qos: packet.qos,
                    offline: true,
                    stored_id: Some(packet.message_id),
                    ..DeliveryOptions::default()
                },
                sub_filter: topic,
                sub_qos: packet.qos,
            };
            let _ = deliveries.send(delivery);
        }
        Ok(())
    }

    /// Claim `client_id` in the clients table, displacing any session that
    /// currently owns it. Returns only after the displaced session has fully
    /// closed, so the caller's CONNACK is ordered after the prior teardown.
    pub(crate) async fn register_client(
        &self,
        client_id: &str,
        takeover: mpsc::UnboundedSender<oneshot::Sender<()>>,
    ) -> u64 {
        let epoch = self.shared.epochs.fetch_add(1, Ordering::SeqCst) + 1;

        loop {
            let prior = {
                let mut clients = self.shared.clients.lock().await;
                match clients.entry(client_id.to_string()) {
                    Entry::Vacant(slot) => {
                        slot.insert(SessionHandle {
                            epoch,
                            takeover: takeover.clone(),
                        });
                        return epoch;
                    }
                    Entry::Occupied(slot) => {
                        let handle = slot.get();
                        (handle.epoch, handle.takeover.clone())
                    }
                }
            };

            debug!("displacing existing session for client `{client_id}`");
            let (ack_tx, ack_rx) = oneshot::channel();
            if prior.1.send(ack_tx).is_ok() {
                // The displaced session acknowledges once it has closed; if
                // it dies without acknowledging, the dropped sender resolves
                // the wait and the retry finds the slot free.
                let _ = ack_rx.await;
            } else {
                // The owning task is already gone; evict its stale entry.
                let mut clients = self.shared.clients.lock().await;
                if let Some(handle) = clients.get(client_id) {
                    if handle.epoch == prior.0 {
                        clients.remove(client_id);
                    }
                }
            }
        }
    }

    /// Remove a session's entry, unless a newer session already claimed the
    /// id.
    pub(crate) async fn unregister_client(&self, client_id: &str, epoch: u64) {
        let mut clients = self.shared.clients.lock().await;
        if let Some(handle) = clients.get(client_id) {
            if handle.epoch == epoch {
                clients.remove(client_id);
            }
        }
    }

    /// Persist a closing session: non-clean sessions keep their subscription
    /// set for the next CONNECT, clean sessions leave nothing behind.
    pub(crate) async fn persist_client(
        &self,
        client_id: &str,
        clean: bool,
        subscriptions: Vec<StoredSubscription>,
    ) {
        if clean {
            if let Err(e) = self.shared.storage.delete_session(client_id).await {
                error!("failed to delete session state for `{client_id}`: {e}");
            }
            if let Err(e) = self.shared.storage.purge_offline(client_id).await {
                error!("failed to purge offline queue for `{client_id}`: {e}");
            }
        } else {
            let state = SessionState {
                client_id: client_id.to_string(),
                subscriptions,
            };
            if let Err(e) = self.shared.storage.save_session(client_id, &state).await {
                error!("failed to persist session state for `{client_id}`: {e}");
            }
        }
    }
}
