//! Storage abstraction layer for the Ronzio MQTT broker.
//!
//! This crate provides traits for persistent broker state — restorable
//! subscription sets, retained messages, will messages, and offline packet
//! queues — allowing different storage backends (in-memory, SQL, Redis,
//! etc.). The session core consumes these through the narrow interfaces
//! below and never depends on a backend's encoding.

pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use ronzio_core::{message::Message, qos::QoS};
use thiserror::Error;

/// Error type for storage operations.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("storage operation failed: {0}")]
    OperationFailed(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// One persisted subscription of a non-clean session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSubscription {
    pub filter: String,
    pub qos: QoS,
}

/// Serializable session state for persistence.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub client_id: String,
    pub subscriptions: Vec<StoredSubscription>,
}

/// Will message for persistence.
#[derive(Debug, Clone)]
pub struct StoredWill {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// A publish queued for a client that was offline when it arrived.
///
/// `message_id` is the id the packet is stored under; the session rewrites
/// it to a freshly allocated id just before delivery.
#[derive(Debug, Clone)]
pub struct OfflinePacket {
    pub message_id: u16,
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
}

/// Trait for session persistence.
///
/// Implementations store and retrieve the subscription set of non-clean
/// sessions, enabling restoration on reconnect.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Save session state for a client.
    async fn save_session(&self, client_id: &str, session: &SessionState) -> Result<()>;

    /// Load session state for a client.
    async fn load_session(&self, client_id: &str) -> Result<Option<SessionState>>;

    /// Delete session state for a client.
    async fn delete_session(&self, client_id: &str) -> Result<()>;
}

/// Trait for retained message storage.
///
/// Retained messages are stored per topic and delivered to new subscribers.
#[async_trait]
pub trait RetainedMessageStore: Send + Sync {
    /// Store a retained message for a topic.
    /// Pass None to clear the retained message.
    async fn store_retained(&self, topic: &str, message: Option<Message>) -> Result<()>;

    /// Get retained messages matching a topic filter (supports wildcards).
    async fn matching_retained(&self, filter: &str) -> Result<Vec<Message>>;
}

/// Trait for will message storage.
///
/// Will messages are published when a client disconnects abnormally.
#[async_trait]
pub trait WillStore: Send + Sync {
    /// Store a will message for a client.
    async fn store_will(&self, client_id: &str, will: &StoredWill) -> Result<()>;

    /// Get the will message for a client.
    async fn load_will(&self, client_id: &str) -> Result<Option<StoredWill>>;

    /// Delete the will message for a client.
    async fn delete_will(&self, client_id: &str) -> Result<()>;
}

/// Trait for per-client offline packet queues.
///
/// Packets published to a non-clean session while it is disconnected are
/// queued here and replayed, in order, on the next CONNECT.
#[async_trait]
pub trait OfflineMessageStore: Send + Sync {
    /// Append a packet to a client's offline queue.
    async fn enqueue_offline(&self, client_id: &str, packet: OfflinePacket) -> Result<()>;

    /// All queued packets for a client, oldest first.
    async fn offline_packets(&self, client_id: &str) -> Result<Vec<OfflinePacket>>;

    /// Rewrite the stored id of a queued packet to the id it was delivered
    /// under, so a later acknowledgement can find it.
    async fn update_offline_packet(
        &self,
        client_id: &str,
        stored_id: u16,
        new_id: u16,
    ) -> Result<()>;

    /// Remove an acknowledged packet. Removing an id that is not queued is
    /// not an error.
    async fn delete_offline_packet(&self, client_id: &str, message_id: u16) -> Result<()>;

    /// Drop a client's entire offline queue.
    async fn purge_offline(&self, client_id: &str) -> Result<()>;
}

/// Combined trait for the full storage surface the broker consumes.
pub trait BrokerStore:
    SessionStore + RetainedMessageStore + WillStore + OfflineMessageStore + 'static
{
}

/// Blanket implementation for any type implementing all storage traits.
impl<T> BrokerStore for T where
    T: SessionStore + RetainedMessageStore + WillStore + OfflineMessageStore + 'static
{
}
