//! Wire message types for the p2p protocol.
//!
//! Every message kind carries a numeric wire code and declares the kind of
//! the response it expects (if any); the stall detector uses the latter to
//! know what to wait for.

use crate::net_address::NetAddress;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::BitOr;

/// Protocol version advertised during the handshake
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Identifier of a broadcastable message (32-byte hash)
pub type MsgId = [u8; 32];

/// Service bitset declaring which optional sub-protocols a peer supports.
/// The handshake demands equality between both sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceFlags(pub u64);

impl ServiceFlags {
    pub const NONE: ServiceFlags = ServiceFlags(0);
    /// Relays transactions
    pub const TX_RELAY: ServiceFlags = ServiceFlags(1 << 0);
    /// Relays blocks
    pub const BLOCK_RELAY: ServiceFlags = ServiceFlags(1 << 1);
    /// Serves block synchronization requests
    pub const BLOCK_SYNC: ServiceFlags = ServiceFlags(1 << 2);

    pub fn contains(&self, other: ServiceFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ServiceFlags {
    type Output = ServiceFlags;

    fn bitor(self, rhs: ServiceFlags) -> ServiceFlags {
        ServiceFlags(self.0 | rhs.0)
    }
}

/// Wire message kinds with their numeric codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Version,
    VersionAck,
    Reject,
    Ping,
    Pong,
    AddrReq,
    Addr,
    BlockReq,
    Block,
}

impl MessageKind {
    /// Numeric wire code of this kind
    pub fn code(self) -> u32 {
        match self {
            MessageKind::Version => 1,
            MessageKind::VersionAck => 2,
            MessageKind::Reject => 3,
            MessageKind::Ping => 4,
            MessageKind::Pong => 5,
            MessageKind::AddrReq => 6,
            MessageKind::Addr => 7,
            MessageKind::BlockReq => 8,
            MessageKind::Block => 9,
        }
    }

    /// Look up a kind by its wire code
    pub fn from_code(code: u32) -> Option<MessageKind> {
        match code {
            1 => Some(MessageKind::Version),
            2 => Some(MessageKind::VersionAck),
            3 => Some(MessageKind::Reject),
            4 => Some(MessageKind::Ping),
            5 => Some(MessageKind::Pong),
            6 => Some(MessageKind::AddrReq),
            7 => Some(MessageKind::Addr),
            8 => Some(MessageKind::BlockReq),
            9 => Some(MessageKind::Block),
            _ => None,
        }
    }

    /// The response kind this message expects, if it expects one
    pub fn response_kind(self) -> Option<MessageKind> {
        match self {
            MessageKind::Ping => Some(MessageKind::Pong),
            MessageKind::AddrReq => Some(MessageKind::Addr),
            MessageKind::BlockReq => Some(MessageKind::Block),
            _ => None,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageKind::Version => "Version",
            MessageKind::VersionAck => "VersionAck",
            MessageKind::Reject => "Reject",
            MessageKind::Ping => "Ping",
            MessageKind::Pong => "Pong",
            MessageKind::AddrReq => "AddrReq",
            MessageKind::Addr => "Addr",
            MessageKind::BlockReq => "BlockReq",
            MessageKind::Block => "Block",
        };
        write!(f, "{}", name)
    }
}

/// Handshake greeting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionMsg {
    /// Protocol version string
    pub version: String,
    /// Advertised listen port (the dialing side's source port is ephemeral)
    pub port: u16,
    /// Supported services
    pub services: ServiceFlags,
}

/// Protocol violation notice sent before disconnecting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectMsg {
    pub reason: String,
}

/// Keep-alive probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingMsg {
    pub state: u64,
}

/// Keep-alive reply carrying the responder's chain height
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PongMsg {
    pub state: u64,
}

/// Advertised peer addresses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddrMsg {
    pub addresses: Vec<NetAddress>,
}

/// Block request (opaque pass-through for the application layer)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockReqMsg {
    pub height: u64,
}

/// Block reply (opaque pass-through for the application layer)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockMsg {
    pub id: MsgId,
    pub height: u64,
    pub body: Vec<u8>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct EmptyPayload {}

/// A wire message
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Version(VersionMsg),
    VersionAck,
    Reject(RejectMsg),
    Ping(PingMsg),
    Pong(PongMsg),
    AddrReq,
    Addr(AddrMsg),
    BlockReq(BlockReqMsg),
    Block(BlockMsg),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Version(_) => MessageKind::Version,
            Message::VersionAck => MessageKind::VersionAck,
            Message::Reject(_) => MessageKind::Reject,
            Message::Ping(_) => MessageKind::Ping,
            Message::Pong(_) => MessageKind::Pong,
            Message::AddrReq => MessageKind::AddrReq,
            Message::Addr(_) => MessageKind::Addr,
            Message::BlockReq(_) => MessageKind::BlockReq,
            Message::Block(_) => MessageKind::Block,
        }
    }

    pub fn response_kind(&self) -> Option<MessageKind> {
        self.kind().response_kind()
    }

    /// Identifier used by the broadcast deduplication path. Control
    /// messages carry no id and are never deduplicated.
    pub fn msg_id(&self) -> Option<MsgId> {
        match self {
            Message::Block(block) => Some(block.id),
            _ => None,
        }
    }

    /// Hex rendering of the message id for logs; empty for control messages
    pub fn id_hex(&self) -> String {
        self.msg_id().map(hex::encode).unwrap_or_default()
    }

    /// Encode the payload fields (without the frame header)
    pub fn encode_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            Message::Version(m) => serde_json::to_vec(m),
            Message::VersionAck => serde_json::to_vec(&EmptyPayload {}),
            Message::Reject(m) => serde_json::to_vec(m),
            Message::Ping(m) => serde_json::to_vec(m),
            Message::Pong(m) => serde_json::to_vec(m),
            Message::AddrReq => serde_json::to_vec(&EmptyPayload {}),
            Message::Addr(m) => serde_json::to_vec(m),
            Message::BlockReq(m) => serde_json::to_vec(m),
            Message::Block(m) => serde_json::to_vec(m),
        }
    }

    /// Decode the payload fields of a known kind
    pub fn decode_payload(kind: MessageKind, bytes: &[u8]) -> Result<Message, serde_json::Error> {
        let msg = match kind {
            MessageKind::Version => Message::Version(serde_json::from_slice(bytes)?),
            MessageKind::VersionAck => {
                let _: EmptyPayload = serde_json::from_slice(bytes)?;
                Message::VersionAck
            }
            MessageKind::Reject => Message::Reject(serde_json::from_slice(bytes)?),
            MessageKind::Ping => Message::Ping(serde_json::from_slice(bytes)?),
            MessageKind::Pong => Message::Pong(serde_json::from_slice(bytes)?),
            MessageKind::AddrReq => {
                let _: EmptyPayload = serde_json::from_slice(bytes)?;
                Message::AddrReq
            }
            MessageKind::Addr => Message::Addr(serde_json::from_slice(bytes)?),
            MessageKind::BlockReq => Message::BlockReq(serde_json::from_slice(bytes)?),
            MessageKind::Block => Message::Block(serde_json::from_slice(bytes)?),
        };
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_codes_are_stable() {
        for kind in [
            MessageKind::Version,
            MessageKind::VersionAck,
            MessageKind::Reject,
            MessageKind::Ping,
            MessageKind::Pong,
            MessageKind::AddrReq,
            MessageKind::Addr,
            MessageKind::BlockReq,
            MessageKind::Block,
        ] {
            assert_eq!(MessageKind::from_code(kind.code()), Some(kind));
        }
        assert_eq!(MessageKind::from_code(0), None);
        assert_eq!(MessageKind::from_code(10), None);
    }

    #[test]
    fn test_response_kinds() {
        assert_eq!(
            MessageKind::Ping.response_kind(),
            Some(MessageKind::Pong)
        );
        assert_eq!(
            MessageKind::AddrReq.response_kind(),
            Some(MessageKind::Addr)
        );
        assert_eq!(
            MessageKind::BlockReq.response_kind(),
            Some(MessageKind::Block)
        );
        assert_eq!(MessageKind::Version.response_kind(), None);
        assert_eq!(MessageKind::Pong.response_kind(), None);
        assert_eq!(MessageKind::Addr.response_kind(), None);
    }

    #[test]
    fn test_control_messages_have_no_id() {
        assert_eq!(Message::Ping(PingMsg { state: 1 }).msg_id(), None);
        assert_eq!(Message::VersionAck.msg_id(), None);

        let block = Message::Block(BlockMsg {
            id: [7u8; 32],
            height: 42,
            body: vec![1, 2, 3],
        });
        assert_eq!(block.msg_id(), Some([7u8; 32]));
    }

    #[test]
    fn test_payload_roundtrip() {
        let msg = Message::Version(VersionMsg {
            version: PROTOCOL_VERSION.to_string(),
            port: 8080,
            services: ServiceFlags::TX_RELAY | ServiceFlags::BLOCK_RELAY,
        });
        let bytes = msg.encode_payload().unwrap();
        let decoded = Message::decode_payload(MessageKind::Version, &bytes).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn test_service_flags() {
        let flags = ServiceFlags::TX_RELAY | ServiceFlags::BLOCK_SYNC;
        assert!(flags.contains(ServiceFlags::TX_RELAY));
        assert!(!flags.contains(ServiceFlags::BLOCK_RELAY));
        assert_ne!(flags, ServiceFlags::TX_RELAY);
    }
}
