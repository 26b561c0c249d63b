//! Message codec for the overlay wire protocol.
//!
//! After the text handshake every message on the wire is a fixed 23-byte
//! header followed by the payload:
//!
//! ```text
//! +-----------+----------+-----+------+-------------+---------+
//! | MUID (16) | Function | TTL | Hops | Size (4 LE) | Payload |
//! +-----------+----------+-----+------+-------------+---------+
//! ```
//!
//! # Message Size Limits
//!
//! The payload size announced in the header is checked before any payload
//! byte is buffered. A size above the configured maximum is a framing error
//! and the stream cannot be resynchronised.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rand::Rng;
use tokio_util::codec::{Decoder, Encoder};

use crate::{HostAddr, OverlayError, Result};

/// Size of the fixed message header.
pub const HEADER_SIZE: usize = 23;

/// Default maximum payload size (64 KiB).
pub const DEFAULT_MAX_PAYLOAD: u32 = 64 * 1024;

/// Size of a pong payload without extensions.
pub const PONG_PAYLOAD_SIZE: usize = 14;

/// 16-byte message identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Muid(pub [u8; 16]);

impl Muid {
    /// Generates a random identifier carrying the modern servent markers.
    pub fn random() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill(&mut bytes);
        bytes[8] = 0xff;
        bytes[15] = 0x00;
        Self(bytes)
    }

    /// Returns the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for Muid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Muid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Muid({})", hex::encode(&self.0[..4]))
    }
}

/// Message function byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageFunction {
    Ping,
    Pong,
    Bye,
    QueryRoutingTable,
    VendorMessage,
    StandardVendorMessage,
    Push,
    Query,
    QueryHit,
    Hsep,
    /// Unknown function code, kept so the message can be counted and dropped.
    Other(u8),
}

impl MessageFunction {
    /// Wire code of this function.
    pub fn code(self) -> u8 {
        match self {
            MessageFunction::Ping => 0x00,
            MessageFunction::Pong => 0x01,
            MessageFunction::Bye => 0x02,
            MessageFunction::QueryRoutingTable => 0x30,
            MessageFunction::VendorMessage => 0x31,
            MessageFunction::StandardVendorMessage => 0x32,
            MessageFunction::Push => 0x40,
            MessageFunction::Query => 0x80,
            MessageFunction::QueryHit => 0x81,
            MessageFunction::Hsep => 0xcd,
            MessageFunction::Other(code) => code,
        }
    }

    /// Human readable name for logging.
    pub fn name(self) -> &'static str {
        match self {
            MessageFunction::Ping => "Ping",
            MessageFunction::Pong => "Pong",
            MessageFunction::Bye => "Bye",
            MessageFunction::QueryRoutingTable => "QRP",
            MessageFunction::VendorMessage => "Vendor",
            MessageFunction::StandardVendorMessage => "Vendor-std",
            MessageFunction::Push => "Push",
            MessageFunction::Query => "Query",
            MessageFunction::QueryHit => "Query-hit",
            MessageFunction::Hsep => "HSEP",
            MessageFunction::Other(_) => "Unknown",
        }
    }
}

impl From<u8> for MessageFunction {
    fn from(code: u8) -> Self {
        match code {
            0x00 => MessageFunction::Ping,
            0x01 => MessageFunction::Pong,
            0x02 => MessageFunction::Bye,
            0x30 => MessageFunction::QueryRoutingTable,
            0x31 => MessageFunction::VendorMessage,
            0x32 => MessageFunction::StandardVendorMessage,
            0x40 => MessageFunction::Push,
            0x80 => MessageFunction::Query,
            0x81 => MessageFunction::QueryHit,
            0xcd => MessageFunction::Hsep,
            other => MessageFunction::Other(other),
        }
    }
}

/// Fixed-size message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub muid: Muid,
    pub function: MessageFunction,
    pub ttl: u8,
    pub hops: u8,
    /// Payload length in bytes.
    pub size: u32,
}

impl MessageHeader {
    /// Parses a header from the first [`HEADER_SIZE`] bytes of `buf`.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(OverlayError::InvalidMessage(format!(
                "truncated header: {} bytes",
                buf.len()
            )));
        }
        let mut muid = [0u8; 16];
        muid.copy_from_slice(&buf[..16]);
        Ok(Self {
            muid: Muid(muid),
            function: MessageFunction::from(buf[16]),
            ttl: buf[17],
            hops: buf[18],
            size: u32::from_le_bytes([buf[19], buf[20], buf[21], buf[22]]),
        })
    }

    /// Appends the wire form of this header to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_SIZE);
        dst.put_slice(&self.muid.0);
        dst.put_u8(self.function.code());
        dst.put_u8(self.ttl);
        dst.put_u8(self.hops);
        dst.put_u32_le(self.size);
    }
}

/// A complete message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub header: MessageHeader,
    pub payload: Bytes,
}

impl Message {
    /// Builds a message with a fresh MUID and zero hops.
    pub fn new(function: MessageFunction, ttl: u8, payload: Bytes) -> Self {
        Self::with_muid(Muid::random(), function, ttl, 0, payload)
    }

    /// Builds a message with an explicit header.
    pub fn with_muid(
        muid: Muid,
        function: MessageFunction,
        ttl: u8,
        hops: u8,
        payload: Bytes,
    ) -> Self {
        Self {
            header: MessageHeader {
                muid,
                function,
                ttl,
                hops,
                size: payload.len() as u32,
            },
            payload,
        }
    }

    /// A ping with an empty payload.
    pub fn ping(ttl: u8) -> Self {
        Self::new(MessageFunction::Ping, ttl, Bytes::new())
    }

    /// A pong answering the ping `muid`, advertising `info`.
    pub fn pong(muid: Muid, ttl: u8, info: &PongInfo) -> Self {
        Self::with_muid(muid, MessageFunction::Pong, ttl, 0, info.encode())
    }

    /// A Bye message. Bye never travels further than one hop.
    pub fn bye(code: u16, reason: &str) -> Self {
        let mut payload = BytesMut::with_capacity(2 + reason.len() + 1);
        payload.put_u16_le(code);
        payload.put_slice(reason.as_bytes());
        payload.put_u8(0);
        Self::new(MessageFunction::Bye, 1, payload.freeze())
    }

    pub fn function(&self) -> MessageFunction {
        self.header.function
    }

    /// Bytes this message occupies on the wire.
    pub fn wire_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Serializes header and payload.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.wire_len());
        self.header.encode(&mut buf);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Copy of this message as relayed one hop further.
    pub fn relayed(&self) -> Option<Self> {
        if self.header.ttl <= 1 {
            return None;
        }
        let mut next = self.clone();
        next.header.ttl -= 1;
        next.header.hops = next.header.hops.saturating_add(1);
        Some(next)
    }
}

/// Parses a Bye payload into its status code and reason.
pub fn parse_bye(payload: &[u8]) -> Option<(u16, String)> {
    if payload.len() < 2 {
        return None;
    }
    let code = u16::from_le_bytes([payload[0], payload[1]]);
    let text = &payload[2..];
    let end = text
        .iter()
        .position(|&b| b == 0 || b == b'\r' || b == b'\n')
        .unwrap_or(text.len());
    Some((code, String::from_utf8_lossy(&text[..end]).into_owned()))
}

/// The fixed part of a pong payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PongInfo {
    pub addr: HostAddr,
    pub files: u32,
    pub kbytes: u32,
}

impl PongInfo {
    /// Parses the leading 14 bytes of a pong payload. Extensions are ignored.
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < PONG_PAYLOAD_SIZE {
            return None;
        }
        let port = u16::from_le_bytes([payload[0], payload[1]]);
        let ip = Ipv4Addr::new(payload[2], payload[3], payload[4], payload[5]);
        let files = u32::from_le_bytes([payload[6], payload[7], payload[8], payload[9]]);
        let kbytes = u32::from_le_bytes([payload[10], payload[11], payload[12], payload[13]]);
        Some(Self {
            addr: HostAddr::new(IpAddr::V4(ip), port),
            files,
            kbytes,
        })
    }

    /// Encodes the payload. Only IPv4 fits in a plain pong; other families
    /// are written as 0.0.0.0.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(PONG_PAYLOAD_SIZE);
        buf.put_u16_le(self.addr.port);
        let octets = match self.addr.ip {
            IpAddr::V4(v4) => v4.octets(),
            IpAddr::V6(_) => [0; 4],
        };
        buf.put_slice(&octets);
        buf.put_u32_le(self.files);
        buf.put_u32_le(self.kbytes);
        buf.freeze()
    }
}

/// Codec for framing overlay messages.
///
/// Implements tokio's `Encoder` and `Decoder` traits. The node's receive
/// path also drives it directly over its inflated input buffer.
#[derive(Debug)]
pub struct MessageCodec {
    decode_state: DecodeState,
    max_payload: u32,
}

#[derive(Debug, Default)]
enum DecodeState {
    #[default]
    ReadingHeader,
    ReadingPayload(MessageHeader),
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD)
    }
}

impl MessageCodec {
    /// Creates a codec accepting payloads up to `max_payload` bytes.
    pub fn new(max_payload: u32) -> Self {
        Self {
            decode_state: DecodeState::ReadingHeader,
            max_payload,
        }
    }

    pub fn max_payload(&self) -> u32 {
        self.max_payload
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = OverlayError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        loop {
            match self.decode_state {
                DecodeState::ReadingHeader => {
                    if src.len() < HEADER_SIZE {
                        return Ok(None);
                    }
                    let header = MessageHeader::parse(&src[..HEADER_SIZE])?;
                    if header.size > self.max_payload {
                        return Err(OverlayError::Message(format!(
                            "{} payload too large: {} bytes (limit: {})",
                            header.function.name(),
                            header.size,
                            self.max_payload
                        )));
                    }
                    src.advance(HEADER_SIZE);
                    src.reserve(header.size as usize);
                    self.decode_state = DecodeState::ReadingPayload(header);
                }
                DecodeState::ReadingPayload(header) => {
                    let len = header.size as usize;
                    if src.len() < len {
                        return Ok(None);
                    }
                    let payload = src.split_to(len).freeze();
                    self.decode_state = DecodeState::ReadingHeader;
                    return Ok(Some(Message { header, payload }));
                }
            }
        }
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = OverlayError;

    fn encode(&mut self, message: Message, dst: &mut BytesMut) -> Result<()> {
        if message.payload.len() > self.max_payload as usize {
            return Err(OverlayError::Message(format!(
                "message too large: {} bytes",
                message.payload.len()
            )));
        }
        let mut header = message.header;
        header.size = message.payload.len() as u32;
        header.encode(dst);
        dst.extend_from_slice(&message.payload);
        Ok(())
    }
}

/// Helper functions for classifying messages.
pub mod helpers {
    use super::*;

    /// Returns true if this message is broadcast to every neighbour.
    pub fn is_broadcast(function: MessageFunction) -> bool {
        matches!(function, MessageFunction::Ping | MessageFunction::Query)
    }

    /// Returns true if this message travels back along a reply route.
    pub fn is_routed_reply(function: MessageFunction) -> bool {
        matches!(
            function,
            MessageFunction::Pong | MessageFunction::QueryHit | MessageFunction::Push
        )
    }

    /// The request function whose route a reply follows.
    pub fn request_for_reply(function: MessageFunction) -> Option<MessageFunction> {
        match function {
            MessageFunction::Pong => Some(MessageFunction::Ping),
            MessageFunction::QueryHit => Some(MessageFunction::Query),
            _ => None,
        }
    }

    /// Returns true if this message is only meaningful between neighbours.
    pub fn is_link_local(function: MessageFunction) -> bool {
        matches!(
            function,
            MessageFunction::Bye
                | MessageFunction::QueryRoutingTable
                | MessageFunction::VendorMessage
                | MessageFunction::StandardVendorMessage
                | MessageFunction::Hsep
        )
    }
}
