//! Authentication and authorization hooks.
//!
//! The broker treats these as opaque decision callbacks supplied at
//! construction. A hook returning `Err` is an operational failure and tears
//! the connection down; `Ok(false)` is a clean denial.

use async_trait::async_trait;
use bytes::Bytes;

use ronzio_core::Result;

#[async_trait]
pub trait AuthHooks: Send + Sync {
    /// Gate for CONNECT. A denial is answered with CONNACK return code 5
    /// (not authorized) before the transport is ended.
    async fn authenticate(
        &self,
        client_id: &str,
        username: Option<&str>,
        password: Option<&Bytes>,
    ) -> Result<bool> {
        let _ = (client_id, username, password);
        Ok(true)
    }

    /// Gate for each inbound PUBLISH. A denial closes the session without a
    /// notification packet.
    async fn authorize_publish(&self, client_id: &str, topic: &str, payload: &Bytes) -> Result<bool> {
        let _ = (client_id, topic, payload);
        Ok(true)
    }

    /// Gate for each newly requested subscription filter. A denial fails the
    /// whole SUBSCRIBE and closes the session.
    async fn authorize_subscribe(&self, client_id: &str, filter: &str) -> Result<bool> {
        let _ = (client_id, filter);
        Ok(true)
    }
}

/// Hooks that accept every client and every operation.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl AuthHooks for AllowAll {}
