/// CONNACK return codes defined by MQTT 3.1.1 [MQTT-3.2.2.3].
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectReturnCode {
    #[default]
    Accepted = 0,
    UnacceptableProtocolVersion = 1,
    IdentifierRejected = 2,
    ServerUnavailable = 3,
    BadUsernameOrPassword = 4,
    NotAuthorized = 5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnAckPacket {
    /// Whether the broker resumed state from a previous non-clean session.
    pub session_present: bool,
    pub return_code: ConnectReturnCode,
}
