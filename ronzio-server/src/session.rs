//! Per-client session state machine.
//!
//! A session owns one transport and serializes everything that can touch its
//! state — inbound packets, deliveries from the pub/sub fabric, takeover
//! requests, and the keepalive deadline — in a single `select!` loop, so the
//! subscription map, the inflight table and the lifecycle flags need no
//! locking.

use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::{
    sync::{mpsc, oneshot},
    time::{self, Instant},
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use ronzio_core::{error::Error, qos::QoS, topic, Result};
use ronzio_packets::{
    connack::{ConnAckPacket, ConnectReturnCode},
    connect::{ConnectPacket, LastWill},
    pingresp::PingRespPacket,
    puback::PubAckPacket,
    publish::PublishPacket,
    suback::SubAckPacket,
    subscribe::SubscribePacket,
    unsuback::UnsubAckPacket,
    unsubscribe::UnsubscribePacket,
    ControlPacket,
};
use ronzio_storage::{BrokerStore, StoredSubscription, StoredWill};

use crate::{
    broker::{Broker, BrokerEvent},
    fabric::{Delivery, DeliveryOptions, HandlerId, SubscriptionHandler},
    transport::Transport,
};

/// One live subscription: the granted QoS plus the exact handler registered
/// on the fabric, retained so UNSUBSCRIBE deregisters that same handler.
struct Subscription {
    qos: QoS,
    id: HandlerId,
    handler: SubscriptionHandler,
}

pub struct Session<T, S> {
    transport: T,
    broker: Broker<S>,
    client_id: String,
    /// Registration epoch in the broker's client table.
    epoch: u64,
    clean: bool,
    keepalive: u16,
    will: Option<LastWill>,
    subscriptions: HashMap<String, Subscription>,
    /// QoS 1 publishes written to the peer and awaiting PUBACK.
    inflight: HashMap<u16, PublishPacket>,
    next_packet_id: u16,
    /// Highest dedup id already forwarded; `0` is below every real id.
    last_dedup_id: u64,
    closing: bool,
    closed: bool,
    deliveries_tx: mpsc::UnboundedSender<Delivery>,
    deliveries_rx: mpsc::UnboundedReceiver<Delivery>,
    takeover_rx: mpsc::UnboundedReceiver<oneshot::Sender<()>>,
}

/// MQTT allows one and a half keepalive periods of silence before the
/// connection is taken down.
fn keepalive_window(keepalive: u16) -> Duration {
    Duration::from_millis(u64::from(keepalive) * 1500)
}

fn connack(return_code: ConnectReturnCode) -> ControlPacket {
    ControlPacket::ConnAck(ConnAckPacket {
        session_present: false,
        return_code,
    })
}

impl<T, S> Session<T, S>
where
    T: Transport,
    S: BrokerStore,
{
    /// Drive one client connection to completion: CONNECT handshake, packet
    /// loop, teardown. The returned error, if any, is the failure that ended
    /// the connection; the session has been fully closed either way.
    pub async fn run(broker: Broker<S>, mut transport: T) -> Result<()> {
        // [MQTT-3.1.0-1] the first packet sent from the client MUST be CONNECT
        let connect = match transport.read_packet().await? {
            Some(ControlPacket::Connect(connect)) => connect,
            Some(_) => return Err(Error::Protocol("first packet was not CONNECT")),
            None => return Ok(()),
        };

        match Self::handshake(broker, transport, connect).await? {
            Some(mut session) => session.serve().await,
            None => Ok(()),
        }
    }

    /// Authenticate the peer and bring the session up: takeover of a prior
    /// session with the same id, state restore, CONNACK, offline replay.
    /// Returns `None` when the connection was refused with a CONNACK error
    /// code.
    async fn handshake(
        broker: Broker<S>,
        mut transport: T,
        connect: ConnectPacket,
    ) -> Result<Option<Session<T, S>>> {
        // [MQTT-3.1.3-8] an empty client id requires a clean session
        if connect.client_id.is_empty() && !connect.clean_session {
            let _ = transport
                .write_packet(connack(ConnectReturnCode::IdentifierRejected))
                .await;
            return Ok(None);
        }

        let client_id = if connect.client_id.is_empty() {
            Uuid::new_v4().hyphenated().to_string()
        } else {
            connect.client_id.clone()
        };

        match broker
            .hooks()
            .authenticate(
                &client_id,
                connect.username.as_deref(),
                connect.password.as_ref(),
            )
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                info!("authentication rejected for client `{client_id}`");
                let _ = transport
                    .write_packet(connack(ConnectReturnCode::NotAuthorized))
                    .await;
                return Ok(None);
            }
            Err(e) => {
                error!("authentication error for client `{client_id}`: {e}");
                return Err(e);
            }
        }

        let will = connect.will.map(|w| LastWill {
            topic: topic::normalize(&w.topic),
            payload: w.payload,
            qos: w.qos,
            retain: w.retain,
        });

        let (deliveries_tx, deliveries_rx) = mpsc::unbounded_channel();
        let (takeover_tx, takeover_rx) = mpsc::unbounded_channel();

        // A second CONNECT with the same id displaces the first; the call
        // returns only once the displaced session has fully closed, which
        // orders its teardown before our CONNACK.
        let epoch = broker.register_client(&client_id, takeover_tx).await;

        let mut session = Session {
            transport,
            broker,
            client_id,
            epoch,
            clean: connect.clean_session,
            keepalive: connect.keepalive,
            will,
            subscriptions: HashMap::new(),
            inflight: HashMap::new(),
            next_packet_id: 0,
            last_dedup_id: 0,
            closing: false,
            closed: false,
            deliveries_tx,
            deliveries_rx,
            takeover_rx,
        };

        let session_present = match session.prepare_session_state().await {
            Ok(present) => present,
            Err(e) => {
                session.close().await;
                return Err(e);
            }
        };

        if let Some(will) = &session.will {
            let stored = StoredWill {
                topic: will.topic.clone(),
                payload: will.payload.clone(),
                qos: will.qos,
                retain: will.retain,
            };
            if let Err(e) = session
                .broker
                .storage()
                .store_will(&session.client_id, &stored)
                .await
            {
                error!("failed to persist will for `{}`: {e}", session.client_id);
            }
        }

        let ack = ControlPacket::ConnAck(ConnAckPacket {
            session_present,
            return_code: ConnectReturnCode::Accepted,
        });
        if let Err(e) = session.transport.write_packet(ack).await {
            session.close().await;
            return Err(e);
        }

        session.broker.emit(BrokerEvent::ClientConnected {
            client_id: session.client_id.clone(),
        });
        info!(
            "client `{}` connected (clean = {})",
            session.client_id, session.clean
        );

        if !session.clean {
            if let Err(e) = session
                .broker
                .forward_offline_packets(&session.client_id, &session.deliveries_tx)
                .await
            {
                error!(
                    "failed to replay offline packets for `{}`: {e}",
                    session.client_id
                );
            }
        }

        Ok(Some(session))
    }

    /// Reset or restore persisted state according to the clean flag.
    /// Returns whether a prior session was resumed.
    async fn prepare_session_state(&mut self) -> Result<bool> {
        if self.clean {
            if let Err(e) = self.broker.storage().delete_session(&self.client_id).await {
                error!("failed to reset session state for `{}`: {e}", self.client_id);
            }
            if let Err(e) = self.broker.storage().purge_offline(&self.client_id).await {
                error!("failed to reset offline queue for `{}`: {e}", self.client_id);
            }
            return Ok(false);
        }

        let state = match self.broker.storage().load_session(&self.client_id).await {
            Ok(state) => state,
            Err(e) => {
                error!("failed to load session state for `{}`: {e}", self.client_id);
                None
            }
        };

        let Some(state) = state else {
            return Ok(false);
        };

        debug!(
            "restoring {} subscriptions for client `{}`",
            state.subscriptions.len(),
            self.client_id
        );
        for sub in state.subscriptions {
            self.register_subscription(&sub.filter, sub.qos).await?;
        }
        Ok(true)
    }

    /// The session event loop. Every arm funnels back into per-packet
    /// handlers that run to completion before the next event is taken.
    async fn serve(&mut self) -> Result<()> {
        let keepalive_enabled = self.keepalive > 0;
        let window = keepalive_window(self.keepalive);
        let deadline = time::sleep(window);
        tokio::pin!(deadline);

        // Whether the connection ended without a DISCONNECT, which is what
        // decides will delivery.
        let mut abnormal = false;
        let mut result = Ok(());

        'session: loop {
            if self.closed {
                break;
            }

            tokio::select! {
                maybe_packet = self.transport.read_packet() => {
                    let packet = match maybe_packet {
                        Ok(Some(packet)) => packet,
                        Ok(None) => {
                            debug!("transport for `{}` closed without DISCONNECT", self.client_id);
                            abnormal = true;
                            break 'session;
                        }
                        Err(e) => {
                            warn!("transport error for `{}`: {e}", self.client_id);
                            abnormal = true;
                            result = Err(e);
                            break 'session;
                        }
                    };

                    if keepalive_enabled {
                        deadline.as_mut().reset(Instant::now() + window);
                    }

                    if let ControlPacket::Disconnect(_) = packet {
                        // Normal close suppresses the will.
                        self.will = None;
                        if let Err(e) = self.broker.storage().delete_will(&self.client_id).await {
                            error!("failed to delete will for `{}`: {e}", self.client_id);
                        }
                        break 'session;
                    }

                    if let Err(e) = self.handle_packet(packet).await {
                        warn!("closing `{}` on protocol error: {e}", self.client_id);
                        abnormal = true;
                        result = Err(e);
                        break 'session;
                    }
                }

                Some(delivery) = self.deliveries_rx.recv() => {
                    if let Err(e) = self.forward(delivery).await {
                        warn!("closing `{}` on forwarding error: {e}", self.client_id);
                        abnormal = true;
                        result = Err(e);
                        break 'session;
                    }
                }

                Some(ack) = self.takeover_rx.recv() => {
                    info!(
                        "client `{}` displaced by a new connection with the same id",
                        self.client_id
                    );
                    self.close().await;
                    let _ = ack.send(());
                    return Ok(());
                }

                _ = &mut deadline, if keepalive_enabled => {
                    warn!("keepalive timeout for client `{}`", self.client_id);
                    abnormal = true;
                    break 'session;
                }
            }
        }

        let will = if abnormal { self.will.take() } else { None };
        self.close().await;
        if let Some(will) = will {
            self.publish_will(will).await;
        }
        result
    }

    async fn handle_packet(&mut self, packet: ControlPacket) -> Result<()> {
        match packet {
            ControlPacket::Publish(packet) => self.handle_publish(packet).await,
            ControlPacket::PubAck(packet) => self.handle_puback(packet).await,
            ControlPacket::Subscribe(packet) => self.handle_subscribe(packet).await,
            ControlPacket::Unsubscribe(packet) => self.handle_unsubscribe(packet).await,
            ControlPacket::PingReq(_) => {
                self.write(ControlPacket::PingResp(PingRespPacket {})).await
            }
            ControlPacket::Connect(_) => Err(Error::Protocol("duplicate CONNECT")),
            _ => Err(Error::Protocol("unexpected packet from client")),
        }
    }

    async fn handle_publish(&mut self, packet: PublishPacket) -> Result<()> {
        let publish_topic = topic::normalize(&packet.topic);

        match self
            .broker
            .hooks()
            .authorize_publish(&self.client_id, &publish_topic, &packet.payload)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                info!(
                    "publish to `{publish_topic}` denied for client `{}`",
                    self.client_id
                );
                self.close().await;
                return Ok(());
            }
            Err(e) => {
                error!(
                    "publish authorization error for client `{}`: {e}",
                    self.client_id
                );
                self.close().await;
                return Ok(());
            }
        }

        let options = DeliveryOptions {
            qos: packet.qos,
            retain: packet.retain,
            ..DeliveryOptions::default()
        };
        self.broker
            .publish(&publish_topic, packet.payload, options)
            .await?;

        // The acknowledgement goes out only once the fan-out has completed.
        if packet.qos == QoS::AtLeastOnce && !self.closing {
            let message_id = packet
                .message_id
                .ok_or(Error::Protocol("QoS 1 PUBLISH without a packet id"))?;
            self.write(ControlPacket::PubAck(PubAckPacket { message_id }))
                .await?;
        }
        Ok(())
    }

    async fn handle_puback(&mut self, packet: PubAckPacket) -> Result<()> {
        match self.inflight.remove(&packet.message_id) {
            Some(_) => {
                debug!(
                    "PUBACK {} from `{}`, {} inflight",
                    packet.message_id,
                    self.client_id,
                    self.inflight.len()
                );
                if let Err(e) = self
                    .broker
                    .storage()
                    .delete_offline_packet(&self.client_id, packet.message_id)
                    .await
                {
                    // Cleanup failures do not fail the session.
                    error!(
                        "failed to delete offline packet {} for `{}`: {e}",
                        packet.message_id, self.client_id
                    );
                }
            }
            None => {
                debug!(
                    "PUBACK for unknown packet id {} from `{}`",
                    packet.message_id, self.client_id
                );
            }
        }
        Ok(())
    }

    async fn handle_subscribe(&mut self, packet: SubscribePacket) -> Result<()> {
        // This broker grants QoS 0 and 1 only; QoS 2 requests are downgraded.
        let requested: Vec<(String, QoS)> = packet
            .subscriptions
            .iter()
            .map(|sub| (topic::normalize(&sub.filter), sub.qos.min(QoS::AtLeastOnce)))
            .collect();
        let granted: Vec<QoS> = requested.iter().map(|(_, qos)| *qos).collect();

        for (filter, qos) in &requested {
            // Already-subscribed filters only have their QoS updated.
            if let Some(existing) = self.subscriptions.get_mut(filter) {
                existing.qos = *qos;
                continue;
            }

            match self
                .broker
                .hooks()
                .authorize_subscribe(&self.client_id, filter)
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    info!(
                        "subscription to `{filter}` denied for client `{}`",
                        self.client_id
                    );
                    self.close().await;
                    return Ok(());
                }
                Err(e) => {
                    error!(
                        "subscribe authorization error for client `{}`: {e}",
                        self.client_id
                    );
                    self.close().await;
                    return Ok(());
                }
            }

            self.register_subscription(filter, *qos).await?;
            debug!("client `{}` subscribed to `{filter}`", self.client_id);
        }

        for (filter, _) in &requested {
            if let Some(sub) = self.subscriptions.get(filter) {
                if let Err(e) = self.broker.forward_retained(filter, &sub.handler).await {
                    error!(
                        "failed to forward retained messages for `{filter}` to `{}`: {e}",
                        self.client_id
                    );
                }
            }
            self.broker.emit(BrokerEvent::Subscribed {
                client_id: self.client_id.clone(),
                filter: filter.clone(),
            });
        }

        self.write(ControlPacket::SubAck(SubAckPacket {
            message_id: packet.message_id,
            granted,
        }))
        .await
    }

    async fn handle_unsubscribe(&mut self, packet: UnsubscribePacket) -> Result<()> {
        for filter in &packet.filters {
            let filter = topic::normalize(filter);
            let Some(sub) = self.subscriptions.get(&filter) else {
                continue;
            };

            if let Err(e) = self.broker.fabric().unsubscribe(&filter, sub.id).await {
                error!(
                    "unsubscribe failed for `{}` on `{filter}`: {e}",
                    self.client_id
                );
                self.close().await;
                break;
            }

            // A non-clean session mid-close keeps its map intact for
            // persistence.
            if !(self.closing && !self.clean) {
                self.subscriptions.remove(&filter);
                self.broker.emit(BrokerEvent::Unsubscribed {
                    client_id: self.client_id.clone(),
                    filter,
                });
            }
        }

        self.write(ControlPacket::UnsubAck(UnsubAckPacket {
            message_id: packet.message_id,
        }))
        .await
    }

    async fn register_subscription(&mut self, filter: &str, qos: QoS) -> Result<()> {
        let handler =
            SubscriptionHandler::new(Arc::from(filter), qos, self.deliveries_tx.clone());
        let id = self.broker.fabric().subscribe(filter, handler.clone()).await?;
        self.subscriptions
            .insert(filter.to_string(), Subscription { qos, id, handler });
        Ok(())
    }

    /// The forwarding path: one invocation per matched subscription of every
    /// publish on the bus.
    async fn forward(&mut self, delivery: Delivery) -> Result<()> {
        // At-most-once per dedup id across overlapping subscriptions. A
        // delivery without an id is always accepted and stamps one below.
        if let Some(id) = delivery.options.dedup_id {
            if id <= self.last_dedup_id {
                return Ok(());
            }
        }

        if self.closed || self.closing {
            return Ok(());
        }

        if self.inflight.len() >= self.broker.max_inflight() {
            warn!(
                "closing client `{}`: too many inflight messages",
                self.client_id
            );
            self.close().await;
            return Ok(());
        }

        // Wildcards within the first two characters of a filter may not
        // match into `$SYS`.
        if delivery.topic.starts_with("$SYS")
            && delivery
                .sub_filter
                .chars()
                .take(2)
                .any(|c| c == '#' || c == '+')
        {
            debug!(
                "`{}` not forwarded to wildcard filter `{}`",
                delivery.topic, delivery.sub_filter
            );
            return Ok(());
        }

        // The subscription's current QoS wins over the one bound at
        // registration, so a re-subscribe upgrade applies to deliveries
        // already queued.
        let sub_qos = self
            .subscriptions
            .get(delivery.sub_filter.as_ref())
            .map(|sub| sub.qos)
            .unwrap_or(delivery.sub_qos);
        let qos = delivery.options.qos.min(sub_qos).min(QoS::AtLeastOnce);

        self.last_dedup_id = match delivery.options.dedup_id {
            Some(id) => id,
            None => self.broker.next_dedup_id(),
        };

        let message_id = match qos {
            QoS::AtLeastOnce => Some(self.next_message_id()),
            _ => None,
        };

        if delivery.options.offline {
            if let (Some(stored_id), Some(new_id)) = (delivery.options.stored_id, message_id) {
                if let Err(e) = self
                    .broker
                    .storage()
                    .update_offline_packet(&self.client_id, stored_id, new_id)
                    .await
                {
                    error!(
                        "failed to update offline packet for `{}`: {e}",
                        self.client_id
                    );
                }
            }
        }

        let packet = PublishPacket {
            dup: false,
            qos,
            retain: delivery.options.retain,
            topic: delivery.topic.to_string(),
            message_id,
            payload: delivery.payload,
        };

        if let Some(id) = message_id {
            self.inflight.insert(id, packet.clone());
        }

        debug!(
            "forwarding `{}` to client `{}` (qos {:?})",
            packet.topic, self.client_id, qos
        );
        self.write(ControlPacket::Publish(packet)).await
    }

    /// Packet ids are nonzero and wrap within 16 bits.
    fn next_message_id(&mut self) -> u16 {
        self.next_packet_id = match self.next_packet_id {
            u16::MAX => 1,
            id => id + 1,
        };
        self.next_packet_id
    }

    /// No write may happen once the session has started closing.
    async fn write(&mut self, packet: ControlPacket) -> Result<()> {
        if self.closed || self.closing {
            return Ok(());
        }
        self.transport.write_packet(packet).await
    }

    /// Idempotent teardown: deregister every subscription from the fabric,
    /// persist what the clean flag says survives, release the client id and
    /// announce the disconnect.
    async fn close(&mut self) {
        if self.closed || self.closing {
            return;
        }
        self.closing = true;
        debug!("closing session for client `{}`", self.client_id);

        let fabric = Arc::clone(self.broker.fabric());
        let mut stored = Vec::with_capacity(self.subscriptions.len());
        for (filter, sub) in self.subscriptions.drain() {
            // Errors no longer matter at this point.
            if let Err(e) = fabric.unsubscribe(&filter, sub.id).await {
                debug!("unsubscribe during close failed for `{filter}`: {e}");
            }
            stored.push(StoredSubscription {
                filter,
                qos: sub.qos,
            });
        }

        self.broker
            .persist_client(&self.client_id, self.clean, stored)
            .await;
        self.broker
            .unregister_client(&self.client_id, self.epoch)
            .await;
        self.closed = true;

        self.broker.emit(BrokerEvent::ClientDisconnected {
            client_id: self.client_id.clone(),
        });
        info!("client `{}` disconnected", self.client_id);
    }

    /// Publish the will on behalf of an abnormally terminated client. Runs
    /// after `close`, so our own registrations are gone from the fabric and
    /// the message cannot loop back to this session.
    async fn publish_will(&mut self, will: LastWill) {
        info!(
            "publishing will for client `{}` on `{}`",
            self.client_id, will.topic
        );

        let options = DeliveryOptions {
            qos: will.qos,
            retain: will.retain,
            ..DeliveryOptions::default()
        };
        if let Err(e) = self.broker.publish(&will.topic, will.payload, options).await {
            error!("failed to publish will for `{}`: {e}", self.client_id);
        }
        if let Err(e) = self.broker.storage().delete_will(&self.client_id).await {
            error!("failed to delete will for `{}`: {e}", self.client_id);
        }
    }
}
