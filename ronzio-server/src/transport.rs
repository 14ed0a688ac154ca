//! Transport abstraction.
//!
//! A session consumes decoded control packets and never touches the wire
//! format; listeners, TLS, and the MQTT codec live in the embedding server.
//! [`pair`] builds a connected in-process transport pair, which is also what
//! the test suites drive sessions with.

use async_trait::async_trait;
use tokio::sync::mpsc;

use ronzio_core::{error::Error, Result};
use ronzio_packets::ControlPacket;

/// A bidirectional stream of decoded MQTT control packets.
#[async_trait]
pub trait Transport: Send {
    /// Next packet from the peer. `Ok(None)` means the peer closed the
    /// stream without a DISCONNECT.
    async fn read_packet(&mut self) -> Result<Option<ControlPacket>>;

    /// Write a packet to the peer.
    async fn write_packet(&mut self, packet: ControlPacket) -> Result<()>;
}

/// In-process transport backed by a pair of crossed channels.
pub struct ChannelTransport {
    incoming: mpsc::UnboundedReceiver<ControlPacket>,
    outgoing: mpsc::UnboundedSender<ControlPacket>,
}

/// Create a connected transport pair. Dropping one end is observed by the
/// other as the stream closing.
pub fn pair() -> (ChannelTransport, ChannelTransport) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();

    (
        ChannelTransport {
            incoming: a_rx,
            outgoing: b_tx,
        },
        ChannelTransport {
            incoming: b_rx,
            outgoing: a_tx,
        },
    )
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn read_packet(&mut self) -> Result<Option<ControlPacket>> {
        Ok(self.incoming.recv().await)
    }

    async fn write_packet(&mut self, packet: ControlPacket) -> Result<()> {
        self.outgoing
            .send(packet)
            .map_err(|_| Error::ConnectionClosed)
    }
}
