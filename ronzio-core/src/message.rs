//! MQTT message type for internal routing.

use std::sync::Arc;

use bytes::Bytes;

use crate::qos::QoS;

/// MQTT message for internal routing and retained storage.
///
/// This struct is designed to be cheap to clone:
/// - `topic` uses `Arc<str>` for O(1) reference-counted cloning
/// - `payload` uses `Bytes` which is also reference-counted
#[derive(Clone, Debug)]
pub struct Message {
    /// Topic name - uses Arc<str> for cheap cloning when broadcasting to multiple subscribers
    pub topic: Arc<str>,
    pub qos: QoS,
    pub retain: bool,
    pub payload: Bytes,
}
