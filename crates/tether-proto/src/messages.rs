//! Protocol message definitions

use bytes::Bytes;
use std::fmt;

/// Control message type codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u64)]
pub enum MessageType {
    /// Agent -> relay: register and ask for a public port
    Connect = 1,
    /// Relay -> agent: a public connection is waiting (payload = agent id)
    Incoming = 2,
    /// Either direction: handshake reply (public address) or relay acknowledgement
    Ok = 3,
    /// Either direction: the message just processed was rejected
    Error = 4,
}

impl MessageType {
    pub fn code(self) -> u64 {
        self as u64
    }
}

impl TryFrom<u64> for MessageType {
    type Error = u64;

    fn try_from(value: u64) -> Result<Self, u64> {
        match value {
            1 => Ok(MessageType::Connect),
            2 => Ok(MessageType::Incoming),
            3 => Ok(MessageType::Ok),
            4 => Ok(MessageType::Error),
            other => Err(other),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::Connect => "Connect",
            MessageType::Incoming => "Incoming",
            MessageType::Ok => "Ok",
            MessageType::Error => "Error",
        };
        f.write_str(name)
    }
}

/// A single framed control message
///
/// The payload length on the wire is always `payload.len()`, so a `Message`
/// cannot disagree with its own header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageType,
    pub payload: Bytes,
}

impl Message {
    pub fn new(kind: MessageType, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    pub fn connect() -> Self {
        Self::new(MessageType::Connect, Bytes::new())
    }

    /// Wake an agent for the connection sitting in its pending slot
    pub fn incoming(agent_id: &str) -> Self {
        Self::new(MessageType::Incoming, Bytes::copy_from_slice(agent_id.as_bytes()))
    }

    pub fn ok(payload: impl Into<Bytes>) -> Self {
        Self::new(MessageType::Ok, payload)
    }

    pub fn error() -> Self {
        Self::new(MessageType::Error, Bytes::new())
    }

    pub fn error_with(payload: impl Into<Bytes>) -> Self {
        Self::new(MessageType::Error, payload)
    }

    pub fn payload_len(&self) -> u64 {
        self.payload.len() as u64
    }

    /// Payload as text, for agent ids and addresses
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Message {{ type: {}, payload_len: {}, payload: {:?} }}",
            self.kind,
            self.payload_len(),
            String::from_utf8_lossy(&self.payload)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_codes_match_wire_values() {
        assert_eq!(MessageType::Connect.code(), 1);
        assert_eq!(MessageType::Incoming.code(), 2);
        assert_eq!(MessageType::Ok.code(), 3);
        assert_eq!(MessageType::Error.code(), 4);
    }

    #[test]
    fn test_try_from_rejects_unknown_codes() {
        assert_eq!(MessageType::try_from(3), Ok(MessageType::Ok));
        assert_eq!(MessageType::try_from(0), Err(0));
        assert_eq!(MessageType::try_from(5), Err(5));
        assert_eq!(MessageType::try_from(u64::MAX), Err(u64::MAX));
    }

    #[test]
    fn test_constructors() {
        let msg = Message::incoming("127.0.0.1:50123");
        assert_eq!(msg.kind, MessageType::Incoming);
        assert_eq!(msg.payload_len(), 15);
        assert_eq!(msg.payload_str(), Some("127.0.0.1:50123"));

        assert_eq!(Message::connect().payload_len(), 0);
        assert_eq!(Message::error().payload_len(), 0);
    }

    #[test]
    fn test_display() {
        let msg = Message::ok("localhost:60551");
        let rendered = msg.to_string();
        assert!(rendered.contains("type: Ok"));
        assert!(rendered.contains("payload_len: 15"));
        assert!(rendered.contains("localhost:60551"));
    }
}
