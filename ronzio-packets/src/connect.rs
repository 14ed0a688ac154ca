use bytes::Bytes;

use ronzio_core::qos::QoS;

/// Will message carried in the CONNECT payload, published by the broker on
/// behalf of a client that disconnected abnormally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWill {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectPacket {
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<Bytes>,
    /// Keepalive interval in seconds; `0` disables the keepalive watchdog.
    pub keepalive: u16,
    pub clean_session: bool,
    pub will: Option<LastWill>,
}
