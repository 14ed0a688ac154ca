//! Error types for the Ronzio MQTT implementation.

use thiserror::Error;

/// Error type for ronzio operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error on the underlying transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer violated the MQTT protocol.
    #[error("protocol violation: {0}")]
    Protocol(&'static str),

    /// A QoS byte outside the 0..=2 range.
    #[error("invalid QoS value: {0}")]
    InvalidQoS(u8),

    /// The transport was closed by the peer.
    #[error("connection closed")]
    ConnectionClosed,

    /// Pub/sub fabric error.
    #[error("fabric error: {0}")]
    Fabric(String),

    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(String),
}
