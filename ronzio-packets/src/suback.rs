use ronzio_core::qos::QoS;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAckPacket {
    pub message_id: u16,
    /// Granted QoS per requested filter, in request order. This broker only
    /// ever grants QoS 0 or 1.
    pub granted: Vec<QoS>,
}
