//! Core types for the Ronzio MQTT broker.
//!
//! This crate provides the fundamental building blocks shared by the packet
//! representations, the storage layer, and the session core: quality of
//! service levels, the routed message type, topic utilities, and the common
//! error type.

pub mod error;
pub mod message;
pub mod qos;
pub mod topic;

/// A specialized `Result` type for ronzio operations
///
/// This is defined as a convenience
pub type Result<T> = std::result::Result<T, crate::error::Error>;
