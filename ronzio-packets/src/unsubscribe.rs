#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsubscribePacket {
    pub message_id: u16,
    pub filters: Vec<String>,
}
