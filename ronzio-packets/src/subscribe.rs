use ronzio_core::qos::QoS;

/// One requested subscription in a SUBSCRIBE payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRequest {
    pub filter: String,
    pub qos: QoS,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribePacket {
    pub message_id: u16,
    pub subscriptions: Vec<SubscriptionRequest>,
}
