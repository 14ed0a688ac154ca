//! MQTT 3.1/3.1.1 broker session core.
//!
//! This crate implements the per-client session state machine of the Ronzio
//! broker: CONNECT handshake with authentication and duplicate-id takeover,
//! subscription management against a pluggable pub/sub fabric, QoS 0/1
//! forwarding with cross-subscription deduplication and inflight tracking,
//! keepalive enforcement, retained and offline message replay, and last-will
//! delivery on abnormal termination.
//!
//! The transport listener and wire codec live outside this crate: a session
//! is driven through the [`transport::Transport`] trait as a stream of
//! decoded control packets.

pub mod broker;
pub mod fabric;
pub mod hooks;
pub mod session;
pub mod transport;

pub use broker::{Broker, BrokerEvent, BrokerOptions};
pub use fabric::{MemoryFabric, PubSubFabric};
pub use hooks::{AllowAll, AuthHooks};
pub use session::Session;
pub use transport::Transport;
