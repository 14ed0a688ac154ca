//! Decoded MQTT 3.1/3.1.1 control packets.
//!
//! The session core consumes and emits these types through the transport
//! abstraction; the wire codec that produces them lives outside this
//! workspace. Only the packets a 3.1/3.1.1 broker session exchanges are
//! represented — the QoS 2 acknowledgement flow is absent because the broker
//! downgrades QoS 2 subscriptions to QoS 1.

pub mod connack;
pub mod connect;
pub mod disconnect;
pub mod pingreq;
pub mod pingresp;
pub mod puback;
pub mod publish;
pub mod suback;
pub mod subscribe;
pub mod unsuback;
pub mod unsubscribe;

use crate::{
    connack::ConnAckPacket, connect::ConnectPacket, disconnect::DisconnectPacket,
    pingreq::PingReqPacket, pingresp::PingRespPacket, puback::PubAckPacket,
    publish::PublishPacket, suback::SubAckPacket, subscribe::SubscribePacket,
    unsuback::UnsubAckPacket, unsubscribe::UnsubscribePacket,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlPacket {
    Connect(ConnectPacket),
    ConnAck(ConnAckPacket),
    Publish(PublishPacket),
    PubAck(PubAckPacket),
    Subscribe(SubscribePacket),
    SubAck(SubAckPacket),
    Unsubscribe(UnsubscribePacket),
    UnsubAck(UnsubAckPacket),
    PingReq(PingReqPacket),
    PingResp(PingRespPacket),
    Disconnect(DisconnectPacket),
}
