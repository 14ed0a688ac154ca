//! In-memory storage backend.
//!
//! This module provides a thread-safe in-memory implementation of all storage
//! traits. Suitable for development, testing, and single-node deployments
//! where persistence across restarts is not required.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use ronzio_core::{message::Message, topic};

use crate::{
    OfflineMessageStore, OfflinePacket, Result, RetainedMessageStore, SessionState, SessionStore,
    StorageError, StoredWill, WillStore,
};

/// In-memory storage backend implementing all storage traits.
///
/// Uses `RwLock` for thread-safe concurrent access. All data is lost on restart.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    sessions: Arc<RwLock<HashMap<String, SessionState>>>,
    retained: Arc<RwLock<HashMap<String, Message>>>,
    wills: Arc<RwLock<HashMap<String, StoredWill>>>,
    offline: Arc<RwLock<HashMap<String, Vec<OfflinePacket>>>>,
}

impl MemoryStore {
    /// Create a new in-memory store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn save_session(&self, client_id: &str, session: &SessionState) -> Result<()> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|e| StorageError::OperationFailed(e.to_string()))?;
        sessions.insert(client_id.to_string(), session.clone());
        Ok(())
    }

    async fn load_session(&self, client_id: &str) -> Result<Option<SessionState>> {
        let sessions = self
            .sessions
            .read()
            .map_err(|e| StorageError::OperationFailed(e.to_string()))?;
        Ok(sessions.get(client_id).cloned())
    }

    async fn delete_session(&self, client_id: &str) -> Result<()> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|e| StorageError::OperationFailed(e.to_string()))?;
        sessions.remove(client_id);
        Ok(())
    }
}

#[async_trait]
impl RetainedMessageStore for MemoryStore {
    async fn store_retained(&self, topic: &str, message: Option<Message>) -> Result<()> {
        let mut retained = self
            .retained
            .write()
            .map_err(|e| StorageError::OperationFailed(e.to_string()))?;

        match message {
            Some(msg) => {
                retained.insert(topic.to_string(), msg);
            }
            None => {
                retained.remove(topic);
            }
        }
        Ok(())
    }

    async fn matching_retained(&self, filter: &str) -> Result<Vec<Message>> {
        let retained = self
            .retained
            .read()
            .map_err(|e| StorageError::OperationFailed(e.to_string()))?;

        let messages: Vec<Message> = retained
            .iter()
            .filter(|(stored_topic, _)| topic::matches(stored_topic, filter))
            .map(|(_, msg)| {
                let mut msg = msg.clone();
                msg.retain = true; // Mark as retained when delivering
                msg
            })
            .collect();

        Ok(messages)
    }
}

#[async_trait]
impl WillStore for MemoryStore {
    async fn store_will(&self, client_id: &str, will: &StoredWill) -> Result<()> {
        let mut wills = self
            .wills
            .write()
            .map_err(|e| StorageError::OperationFailed(e.to_string()))?;
        wills.insert(client_id.to_string(), will.clone());
        Ok(())
    }

    async fn load_will(&self, client_id: &str) -> Result<Option<StoredWill>> {
        let wills = self
            .wills
            .read()
            .map_err(|e| StorageError::OperationFailed(e.to_string()))?;
        Ok(wills.get(client_id).cloned())
    }

    async fn delete_will(&self, client_id: &str) -> Result<()> {
        let mut wills = self
            .wills
            .write()
            .map_err(|e| StorageError::OperationFailed(e.to_string()))?;
        wills.remove(client_id);
        Ok(())
    }
}

#[async_trait]
impl OfflineMessageStore for MemoryStore {
    async fn enqueue_offline(&self, client_id: &str, packet: OfflinePacket) -> Result<()> {
        let mut offline = self
            .offline
            .write()
            .map_err(|e| StorageError::OperationFailed(e.to_string()))?;
        offline.entry(client_id.to_string()).or_default().push(packet);
        Ok(())
    }

    async fn offline_packets(&self, client_id: &str) -> Result<Vec<OfflinePacket>> {
        let offline = self
            .offline
            .read()
            .map_err(|e| StorageError::OperationFailed(e.to_string()))?;
        Ok(offline.get(client_id).cloned().unwrap_or_default())
    }

    async fn update_offline_packet(
        &self,
        client_id: &str,
        stored_id: u16,
        new_id: u16,
    ) -> Result<()> {
        let mut offline = self
            .offline
            .write()
            .map_err(|e| StorageError::OperationFailed(e.to_string()))?;

        if let Some(queue) = offline.get_mut(client_id) {
            for packet in queue.iter_mut() {
                if packet.message_id == stored_id {
                    packet.message_id = new_id;
                }
            }
        }
        Ok(())
    }

    async fn delete_offline_packet(&self, client_id: &str, message_id: u16) -> Result<()> {
        let mut offline = self
            .offline
            .write()
            .map_err(|e| StorageError::OperationFailed(e.to_string()))?;

        if let Some(queue) = offline.get_mut(client_id) {
            queue.retain(|packet| packet.message_id != message_id);
        }
        Ok(())
    }

    async fn purge_offline(&self, client_id: &str) -> Result<()> {
        let mut offline = self
            .offline
            .write()
            .map_err(|e| StorageError::OperationFailed(e.to_string()))?;
        offline.remove(client_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use ronzio_core::qos::QoS;
    use std::sync::Arc;

    use crate::StoredSubscription;

    fn create_test_message(topic: &str, payload: &str) -> Message {
        Message {
            topic: Arc::from(topic),
            qos: QoS::AtMostOnce,
            retain: false,
            payload: Bytes::from(payload.to_string()),
        }
    }

    #[tokio::test]
    async fn test_session_store() {
        let store = MemoryStore::new();

        let session = SessionState {
            client_id: "client1".to_string(),
            subscriptions: vec![
                StoredSubscription {
                    filter: "topic/a".to_string(),
                    qos: QoS::AtMostOnce,
                },
                StoredSubscription {
                    filter: "topic/b".to_string(),
                    qos: QoS::AtLeastOnce,
                },
            ],
        };

        // Save and load
        store.save_session("client1", &session).await.unwrap();
        let loaded = store.load_session("client1").await.unwrap();
        assert!(loaded.is_some());
        assert_eq!(loaded.unwrap().subscriptions.len(), 2);

        // Delete
        store.delete_session("client1").await.unwrap();
        let loaded = store.load_session("client1").await.unwrap();
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn test_retained_message_store() {
        let store = MemoryStore::new();

        let msg = create_test_message("sensors/temp", "22.5");
        store
            .store_retained("sensors/temp", Some(msg))
            .await
            .unwrap();

        // Exact match
        let retained = store.matching_retained("sensors/temp").await.unwrap();
        assert_eq!(retained.len(), 1);
        assert!(retained[0].retain);

        // Wildcard match
        let retained = store.matching_retained("sensors/+").await.unwrap();
        assert_eq!(retained.len(), 1);

        // Clear specific
        store.store_retained("sensors/temp", None).await.unwrap();
        let retained = store.matching_retained("sensors/temp").await.unwrap();
        assert!(retained.is_empty());
    }

    #[tokio::test]
    async fn test_will_store() {
        let store = MemoryStore::new();

        let will = StoredWill {
            topic: "client/status".to_string(),
            payload: Bytes::from("offline"),
            qos: QoS::AtLeastOnce,
            retain: true,
        };

        store.store_will("client1", &will).await.unwrap();
        let loaded = store.load_will("client1").await.unwrap();
        assert!(loaded.is_some());
        assert_eq!(loaded.unwrap().topic, "client/status");

        store.delete_will("client1").await.unwrap();
        let loaded = store.load_will("client1").await.unwrap();
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn test_offline_queue_preserves_order() {
        let store = MemoryStore::new();

        for id in 1..=3u16 {
            store
                .enqueue_offline(
                    "client1",
                    OfflinePacket {
                        message_id: id,
                        topic: "t".to_string(),
                        payload: Bytes::from(format!("m{id}")),
                        qos: QoS::AtLeastOnce,
                    },
                )
                .await
                .unwrap();
        }

        let queued = store.offline_packets("client1").await.unwrap();
        let ids: Vec<u16> = queued.iter().map(|p| p.message_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_offline_update_and_delete() {
        let store = MemoryStore::new();

        store
            .enqueue_offline(
                "client1",
                OfflinePacket {
                    message_id: 7,
                    topic: "t".to_string(),
                    payload: Bytes::from("m"),
                    qos: QoS::AtLeastOnce,
                },
            )
            .await
            .unwrap();

        store.update_offline_packet("client1", 7, 42).await.unwrap();
        let queued = store.offline_packets("client1").await.unwrap();
        assert_eq!(queued[0].message_id, 42);

        // Deleting an unknown id is not an error
        store.delete_offline_packet("client1", 7).await.unwrap();
        assert_eq!(store.offline_packets("client1").await.unwrap().len(), 1);

        store.delete_offline_packet("client1", 42).await.unwrap();
        assert!(store.offline_packets("client1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_purge_offline() {
        let store = MemoryStore::new();

        store
            .enqueue_offline(
                "client1",
                OfflinePacket {
                    message_id: 1,
                    topic: "t".to_string(),
                    payload: Bytes::from("m"),
                    qos: QoS::AtLeastOnce,
                },
            )
            .await
            .unwrap();

        store.purge_offline("client1").await.unwrap();
        assert!(store.offline_packets("client1").await.unwrap().is_empty());
    }
}
