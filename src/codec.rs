//! Framed wire codec.
//!
//! A frame is: 4-byte magic, 4-byte message kind (big-endian), 4-byte
//! payload length (big-endian), 4-byte payload checksum (first four bytes
//! of the SHA-256 digest over the payload), then the payload bytes.

use crate::message::{Message, MessageKind};
use bytes::{Buf, BufMut, BytesMut};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Magic bytes identifying this network's frames
pub const MAGIC: [u8; 4] = [0x43, 0x48, 0x50, 0x32]; // "CHP2"

/// Upper bound on a frame payload (the per-session receive buffer)
pub const MAX_FRAME_SIZE: usize = 256 * 1024;

const HEADER_LEN: usize = 16;

/// Wire-level errors
#[derive(Error, Debug)]
pub enum WireError {
    #[error("malformed frame: bad magic bytes")]
    MalformedFrame,
    #[error("unknown message kind {0}")]
    UnknownKind(u32),
    #[error("frame payload of {0} bytes exceeds the receive buffer limit")]
    TooLarge(usize),
    #[error("payload checksum mismatch")]
    Checksum,
    #[error("payload encoding: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection closed by remote")]
    Closed,
}

/// First four bytes of the SHA-256 digest over the payload
pub fn checksum(payload: &[u8]) -> [u8; 4] {
    let digest = Sha256::digest(payload);
    [digest[0], digest[1], digest[2], digest[3]]
}

/// Codec turning a byte stream into framed messages
pub struct MessageCodec;

impl Encoder<Message> for MessageCodec {
    type Error = WireError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = item.encode_payload()?;
        if payload.len() > MAX_FRAME_SIZE {
            return Err(WireError::TooLarge(payload.len()));
        }

        dst.reserve(HEADER_LEN + payload.len());
        dst.put_slice(&MAGIC);
        dst.put_u32(item.kind().code());
        dst.put_u32(payload.len() as u32);
        dst.put_slice(&checksum(&payload));
        dst.put_slice(&payload);

        Ok(())
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        if src[..4] != MAGIC {
            return Err(WireError::MalformedFrame);
        }

        let code = u32::from_be_bytes([src[4], src[5], src[6], src[7]]);
        let kind = MessageKind::from_code(code).ok_or(WireError::UnknownKind(code))?;

        let len = u32::from_be_bytes([src[8], src[9], src[10], src[11]]) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(WireError::TooLarge(len));
        }

        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        let mut expected = [0u8; 4];
        expected.copy_from_slice(&src[12..16]);

        src.advance(HEADER_LEN);
        let payload = src.split_to(len);

        if checksum(&payload) != expected {
            return Err(WireError::Checksum);
        }

        Ok(Some(Message::decode_payload(kind, &payload)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{AddrMsg, BlockMsg, PingMsg, PongMsg, RejectMsg, ServiceFlags, VersionMsg};
    use crate::net_address::NetAddress;

    fn encode(msg: Message) -> BytesMut {
        let mut buf = BytesMut::new();
        MessageCodec.encode(msg, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_roundtrip_all_kinds() {
        let messages = vec![
            Message::Version(VersionMsg {
                version: "1.0.0".to_string(),
                port: 8080,
                services: ServiceFlags::TX_RELAY,
            }),
            Message::VersionAck,
            Message::Reject(RejectMsg {
                reason: "nope".to_string(),
            }),
            Message::Ping(PingMsg { state: 1 }),
            Message::Pong(PongMsg { state: 7 }),
            Message::AddrReq,
            Message::Addr(AddrMsg {
                addresses: vec![NetAddress::parse("tcp://10.0.0.1:9000").unwrap()],
            }),
            Message::Block(BlockMsg {
                id: [3u8; 32],
                height: 5,
                body: vec![0xde, 0xad],
            }),
        ];

        for msg in messages {
            let mut buf = encode(msg.clone());
            let decoded = MessageCodec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(msg, decoded);
            assert!(buf.is_empty());
        }
    }

    // decode consumes frames one at a time from a shared buffer
    #[test]
    fn test_two_frames_in_one_buffer() {
        let mut buf = encode(Message::Ping(PingMsg { state: 1 }));
        buf.extend_from_slice(&encode(Message::AddrReq));

        assert_eq!(
            MessageCodec.decode(&mut buf).unwrap().unwrap().kind(),
            MessageKind::Ping
        );
        assert_eq!(
            MessageCodec.decode(&mut buf).unwrap().unwrap().kind(),
            MessageKind::AddrReq
        );
        assert!(MessageCodec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_partial_frame_waits_for_more() {
        let buf = encode(Message::Ping(PingMsg { state: 1 }));
        let mut partial = BytesMut::from(&buf[..HEADER_LEN + 2]);
        assert!(MessageCodec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn test_bad_magic() {
        let mut buf = encode(Message::Ping(PingMsg { state: 1 }));
        buf[0] ^= 0xff;
        assert!(matches!(
            MessageCodec.decode(&mut buf),
            Err(WireError::MalformedFrame)
        ));
    }

    #[test]
    fn test_unknown_kind() {
        let mut buf = encode(Message::Ping(PingMsg { state: 1 }));
        buf[4..8].copy_from_slice(&0xffff_0000u32.to_be_bytes());
        assert!(matches!(
            MessageCodec.decode(&mut buf),
            Err(WireError::UnknownKind(_))
        ));
    }

    #[test]
    fn test_oversized_length() {
        let mut buf = encode(Message::Ping(PingMsg { state: 1 }));
        buf[8..12].copy_from_slice(&((MAX_FRAME_SIZE as u32 + 1).to_be_bytes()));
        assert!(matches!(
            MessageCodec.decode(&mut buf),
            Err(WireError::TooLarge(_))
        ));
    }

    #[test]
    fn test_corrupted_payload_fails_checksum() {
        let original = encode(Message::Block(BlockMsg {
            id: [9u8; 32],
            height: 1,
            body: vec![1, 2, 3, 4],
        }));
        for i in HEADER_LEN..original.len() {
            let mut buf = BytesMut::from(&original[..]);
            buf[i] ^= 0x01;
            assert!(
                matches!(MessageCodec.decode(&mut buf), Err(WireError::Checksum)),
                "corrupting payload byte {} must fail the checksum",
                i
            );
        }
    }
}
