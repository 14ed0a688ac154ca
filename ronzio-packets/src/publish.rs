use bytes::Bytes;

use ronzio_core::qos::QoS;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PublishPacket {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub topic: String,
    /// Present iff `qos` is above `AtMostOnce`.
    pub message_id: Option<u16>,
    pub payload: Bytes,
}
