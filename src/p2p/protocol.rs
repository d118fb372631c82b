//! Relay protocol messages
//!
//! Every frame on the wire carries exactly one [`Message`]: a numeric type tag
//! and an opaque payload. Chain traffic is nested one level deeper as a
//! [`ChainMessage`] inside a `ChainMessage`-typed envelope.
//!
//! Both structs are encoded with bincode, which is deterministic for a given
//! value and needs no delimiters, so one frame always decodes to one message.

use serde::{Deserialize, Serialize};

use super::error::CodecError;

/// Capability required of every type that travels inside a frame.
pub trait WireMessage: Sized + Send + Sync + 'static {
    fn to_bytes(&self) -> Result<Vec<u8>, CodecError>;
    fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError>;
}

/// Message type tags. The numeric values are part of the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageType {
    PeerHello = 1,
    PeerHelloAck = 2,
    PeerClose = 3,
    Keepalive = 10,
    KeepaliveAck = 11,
    ChainMessage = 20,
    RouterSync = 30,
    RouterGet = 31,
    RouterClose = 32,
}

impl MessageType {
    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

impl TryFrom<u16> for MessageType {
    type Error = u16;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Self::PeerHello,
            2 => Self::PeerHelloAck,
            3 => Self::PeerClose,
            10 => Self::Keepalive,
            11 => Self::KeepaliveAck,
            20 => Self::ChainMessage,
            30 => Self::RouterSync,
            31 => Self::RouterGet,
            32 => Self::RouterClose,
            other => return Err(other),
        })
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::PeerHello => "PEER_HELLO",
            Self::PeerHelloAck => "PEER_HELLO_ACK",
            Self::PeerClose => "PEER_CLOSE",
            Self::Keepalive => "KEEPALIVE",
            Self::KeepaliveAck => "KEEPALIVE_ACK",
            Self::ChainMessage => "CHAIN_MESSAGE",
            Self::RouterSync => "ROUTER_SYNC",
            Self::RouterGet => "ROUTER_GET",
            Self::RouterClose => "ROUTER_CLOSE",
        };
        f.write_str(name)
    }
}

/// Wire envelope.
///
/// The type is kept as a raw `u16` so that a frame with a tag this build
/// does not know still decodes; the receiver logs and skips it instead of
/// dropping the connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    msg_type: u16,
    payload: Vec<u8>,
}

impl Message {
    pub fn new(msg_type: MessageType, payload: Vec<u8>) -> Self {
        Self {
            msg_type: msg_type.as_u16(),
            payload,
        }
    }

    /// Envelope with a tag that may not map to a known [`MessageType`].
    pub fn raw(msg_type: u16, payload: Vec<u8>) -> Self {
        Self { msg_type, payload }
    }

    /// Known type of this message, or `Err(tag)` for an unknown tag.
    pub fn kind(&self) -> Result<MessageType, u16> {
        MessageType::try_from(self.msg_type)
    }

    pub fn raw_type(&self) -> u16 {
        self.msg_type
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// PEER_HELLO carries the sender's peer id as UTF-8.
    pub fn hello(peer_id: &str) -> Self {
        Self::new(MessageType::PeerHello, peer_id.as_bytes().to_vec())
    }

    pub fn hello_ack() -> Self {
        Self::new(MessageType::PeerHelloAck, Vec::new())
    }

    pub fn close(peer_id: &str) -> Self {
        Self::new(MessageType::PeerClose, peer_id.as_bytes().to_vec())
    }

    pub fn keepalive() -> Self {
        Self::new(MessageType::Keepalive, Vec::new())
    }

    pub fn keepalive_ack() -> Self {
        Self::new(MessageType::KeepaliveAck, Vec::new())
    }

    pub fn chain(msg: &ChainMessage) -> Result<Self, CodecError> {
        Ok(Self::new(MessageType::ChainMessage, msg.to_bytes()?))
    }

    /// Decode the embedded [`ChainMessage`] of a CHAIN_MESSAGE envelope.
    pub fn chain_message(&self) -> Result<ChainMessage, CodecError> {
        ChainMessage::from_bytes(&self.payload)
    }

    /// Payload interpreted as a peer id (HELLO / CLOSE).
    pub fn peer_id(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

impl WireMessage for Message {
    fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        Ok(bincode::serialize(self)?)
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Application payload relayed between peers.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainMessage {
    pub src_id: String,
    /// `"<chain>:<peer>"` for one peer, `"<chain>:"` for every peer of a chain.
    pub dst_id: String,
    pub payload: Vec<u8>,
    /// Passed through untouched; empty when unsigned.
    #[serde(default)]
    pub signature: Vec<u8>,
}

impl ChainMessage {
    pub fn new(
        src_id: impl Into<String>,
        dst_id: impl Into<String>,
        payload: Vec<u8>,
        signature: Vec<u8>,
    ) -> Self {
        Self {
            src_id: src_id.into(),
            dst_id: dst_id.into(),
            payload,
            signature,
        }
    }

    /// Chain part of the destination (text before the first colon).
    pub fn dst_chain(&self) -> &str {
        self.dst_id.split(':').next().unwrap_or_default()
    }

    /// True when the destination addresses every peer of a chain.
    pub fn is_broadcast(&self) -> bool {
        self.dst_id.ends_with(':')
    }
}

impl std::fmt::Debug for ChainMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainMessage")
            .field("src_id", &self.src_id)
            .field("dst_id", &self.dst_id)
            .field("payload_len", &self.payload.len())
            .field("signature", &hex::encode(&self.signature))
            .finish()
    }
}

impl WireMessage for ChainMessage {
    fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        Ok(bincode::serialize(self)?)
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Qualify a bare chain name as a chain-wide broadcast target.
///
/// `"shard1"` becomes `"shard1:"`; anything already containing a colon is
/// returned unchanged.
pub fn normalize_destination(dst_id: &str) -> String {
    if dst_id.contains(':') {
        dst_id.to_string()
    } else {
        format!("{}:", dst_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_tags_roundtrip() {
        for t in [
            MessageType::PeerHello,
            MessageType::PeerHelloAck,
            MessageType::PeerClose,
            MessageType::Keepalive,
            MessageType::KeepaliveAck,
            MessageType::ChainMessage,
            MessageType::RouterSync,
            MessageType::RouterGet,
            MessageType::RouterClose,
        ] {
            assert_eq!(MessageType::try_from(t.as_u16()), Ok(t));
        }
        assert_eq!(MessageType::try_from(999), Err(999));
    }

    #[test]
    fn test_unknown_type_still_decodes() {
        let msg = Message::raw(4242, vec![1, 2, 3]);
        let bytes = msg.to_bytes().unwrap();
        let decoded = Message::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.kind(), Err(4242));
        assert_eq!(decoded.payload(), &[1, 2, 3]);
    }

    #[test]
    fn test_chain_message_embedding() {
        let chain = ChainMessage::new("shard0:alice", "shard1:", b"tx".to_vec(), vec![9; 4]);
        let msg = Message::chain(&chain).unwrap();
        assert_eq!(msg.kind(), Ok(MessageType::ChainMessage));

        let wire = msg.to_bytes().unwrap();
        let back = Message::from_bytes(&wire).unwrap().chain_message().unwrap();
        assert_eq!(back, chain);
        assert!(back.is_broadcast());
        assert_eq!(back.dst_chain(), "shard1");
    }

    #[test]
    fn test_hello_carries_peer_id() {
        let msg = Message::hello("peer-7");
        assert_eq!(msg.kind(), Ok(MessageType::PeerHello));
        assert_eq!(msg.peer_id(), "peer-7");
    }

    #[test]
    fn test_normalize_destination() {
        assert_eq!(normalize_destination("shard1"), "shard1:");
        assert_eq!(normalize_destination("shard1:"), "shard1:");
        assert_eq!(normalize_destination("shard1:bob"), "shard1:bob");
        assert_eq!(normalize_destination("a:b:c"), "a:b:c");
        assert_eq!(normalize_destination(""), ":");
    }

    #[test]
    fn test_garbage_is_codec_error() {
        assert!(ChainMessage::from_bytes(&[0xff, 0x01]).is_err());
    }
}
