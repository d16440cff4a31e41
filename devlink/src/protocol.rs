//! Packet model and binary wire layout.
//!
//! A packet travels between the structural stage and the application as a
//! [`Packet`]. On the wire, inside one byte-stuffed frame, it is laid out as:
//!
//! ```text
//! 0      flags: bit0 internal, bit1 query, bit2 ack, bit3 fragment,
//!        bits 4..7 type tag
//! 1      message identifier length (1..=15)
//! 2      ack number (0 = none)
//! 3..5   payload length in this frame (u16 LE)
//! ..     message identifier (ASCII)
//! [..]   fragment offset (u16 LE), fragment total (u16 LE)
//! ..     payload
//! ..     CRC-16/CCITT-FALSE (u16 LE) over all preceding bytes
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc_all::Crc;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

/// Longest message identifier the header can express.
pub const MAX_MESSAGE_ID_LEN: usize = 15;

/// Fixed header bytes before the message identifier.
pub const HEADER_LEN: usize = 5;

/// Offset and total fields of a fragmented packet.
pub const FRAGMENT_HEADER_LEN: usize = 4;

pub const CRC_LEN: usize = 2;

/// Identifiers used by the link itself rather than by applications.
pub mod internal {
    /// Heartbeat ping; the device echoes the counter payload.
    pub const HEARTBEAT: &str = "h";
}

/// Identity query sent during the handshake.
pub const NAME: &str = "name";

const FLAG_INTERNAL: u8 = 0x01;
const FLAG_QUERY: u8 = 0x02;
const FLAG_ACK: u8 = 0x04;
const FLAG_FRAGMENT: u8 = 0x08;

/// Short ASCII identifier naming a message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(&self) -> Result<()> {
        if self.0.is_empty() || self.0.len() > MAX_MESSAGE_ID_LEN || !self.0.is_ascii() {
            return Err(Error::Protocol(format!(
                "message identifier '{}' must be 1..={} ASCII bytes",
                self.0, MAX_MESSAGE_ID_LEN
            )));
        }
        Ok(())
    }
}

impl From<&str> for MessageId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for MessageId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Payload type carried in the upper nibble of the flags byte.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::FromRepr,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum TypeTag {
    Callback = 0,
    Custom = 1,
    OffsetMetadata = 2,
    Byte = 3,
    Char = 4,
    Int8 = 5,
    Uint8 = 6,
    Int16 = 7,
    Uint16 = 8,
    Int32 = 9,
    Uint32 = 10,
    Float = 11,
    Double = 12,
    /// Not yet resolved; the type cache stage fills it in on the way out.
    Unknown = 15,
}

impl TypeTag {
    /// Width in bytes of one element, for fixed-width numeric types.
    pub fn element_width(self) -> Option<usize> {
        match self {
            TypeTag::Byte | TypeTag::Int8 | TypeTag::Uint8 => Some(1),
            TypeTag::Int16 | TypeTag::Uint16 => Some(2),
            TypeTag::Int32 | TypeTag::Uint32 | TypeTag::Float => Some(4),
            TypeTag::Double => Some(8),
            _ => None,
        }
    }
}

/// Position of one fragment within a larger payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fragment {
    /// Byte offset of this fragment's payload.
    pub offset: u16,
    /// Length of the whole reassembled payload.
    pub total: u16,
}

impl Fragment {
    pub fn is_leading(&self) -> bool {
        self.offset == 0
    }
}

/// Payload, either still raw or decoded into a structured value by a codec.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Raw(Bytes),
    Value(serde_json::Value),
}

impl Payload {
    pub fn empty() -> Self {
        Payload::Raw(Bytes::new())
    }
}

/// One logical message.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub message_id: MessageId,
    pub type_tag: TypeTag,
    pub internal: bool,
    pub query: bool,
    pub ack: bool,
    pub ack_num: u8,
    pub fragment: Option<Fragment>,
    pub payload: Payload,
}

impl Packet {
    pub fn new(message_id: impl Into<MessageId>, type_tag: TypeTag, payload: Payload) -> Self {
        Self {
            message_id: message_id.into(),
            type_tag,
            internal: false,
            query: false,
            ack: false,
            ack_num: 0,
            fragment: None,
            payload,
        }
    }

    /// Packet carrying raw bytes.
    pub fn raw(message_id: impl Into<MessageId>, type_tag: TypeTag, payload: impl Into<Bytes>) -> Self {
        Self::new(message_id, type_tag, Payload::Raw(payload.into()))
    }

    /// Packet carrying a structured value, encoded later by the codec stage.
    pub fn value(message_id: impl Into<MessageId>, type_tag: TypeTag, value: serde_json::Value) -> Self {
        Self::new(message_id, type_tag, Payload::Value(value))
    }

    pub fn as_query(mut self) -> Self {
        self.query = true;
        self
    }

    pub fn as_internal(mut self) -> Self {
        self.internal = true;
        self
    }

    /// Request an acknowledgement; the deliverability manager assigns the
    /// ack number.
    pub fn with_ack(mut self) -> Self {
        self.ack = true;
        self
    }

    pub fn raw_payload(&self) -> Option<&Bytes> {
        match &self.payload {
            Payload::Raw(bytes) => Some(bytes),
            Payload::Value(_) => None,
        }
    }

    pub fn as_value(&self) -> Option<&serde_json::Value> {
        match &self.payload {
            Payload::Value(value) => Some(value),
            Payload::Raw(_) => None,
        }
    }
}

pub fn crc16(bytes: &[u8]) -> u16 {
    const POLYNOMIAL: u16 = 0x1021;
    const WIDTH: usize = 16;
    const INITIAL: u16 = 0xffff;
    const XOR: u16 = 0;
    const REFLECT: bool = false;
    let mut crc16_ccitt = Crc::<u16>::new(POLYNOMIAL, WIDTH, INITIAL, XOR, REFLECT);

    crc16_ccitt.update(bytes);
    crc16_ccitt.finish()
}

/// Serialize a packet with a raw payload into `dst`.
pub fn encode_packet(packet: &Packet, dst: &mut BytesMut) -> Result<()> {
    packet.message_id.validate()?;

    let Payload::Raw(payload) = &packet.payload else {
        return Err(Error::Protocol(format!(
            "'{}' reached the wire with an unencoded value",
            packet.message_id
        )));
    };
    if packet.type_tag == TypeTag::Unknown {
        return Err(Error::Protocol(format!(
            "'{}' reached the wire without a resolved type",
            packet.message_id
        )));
    }
    let payload_len = u16::try_from(payload.len()).map_err(|_| {
        Error::Protocol(format!(
            "payload of '{}' is {} bytes, too long for one frame",
            packet.message_id,
            payload.len()
        ))
    })?;

    let start = dst.len();
    let mut flags = (packet.type_tag as u8) << 4;
    if packet.internal {
        flags |= FLAG_INTERNAL;
    }
    if packet.query {
        flags |= FLAG_QUERY;
    }
    if packet.ack {
        flags |= FLAG_ACK;
    }
    if packet.fragment.is_some() {
        flags |= FLAG_FRAGMENT;
    }

    dst.put_u8(flags);
    dst.put_u8(packet.message_id.as_str().len() as u8);
    dst.put_u8(packet.ack_num);
    dst.put_u16_le(payload_len);
    dst.put_slice(packet.message_id.as_str().as_bytes());
    if let Some(fragment) = packet.fragment {
        dst.put_u16_le(fragment.offset);
        dst.put_u16_le(fragment.total);
    }
    dst.put_slice(payload);

    let crc = crc16(&dst[start..]);
    dst.put_u16_le(crc);

    Ok(())
}

/// Parse one unstuffed frame into a packet with a raw payload.
pub fn decode_packet(frame: &[u8]) -> Result<Packet> {
    if frame.len() < HEADER_LEN + 1 + CRC_LEN {
        return Err(Error::Protocol(format!("frame of {} bytes is too short", frame.len())));
    }

    let (body, crc_bytes) = frame.split_at(frame.len() - CRC_LEN);
    let expected = u16::from_le_bytes([crc_bytes[0], crc_bytes[1]]);
    let actual = crc16(body);
    if expected != actual {
        return Err(Error::Protocol(format!(
            "CRC mismatch: expected {:04x}, computed {:04x}",
            expected, actual
        )));
    }

    let mut buf = body;
    let flags = buf.get_u8();
    let id_len = buf.get_u8() as usize;
    let ack_num = buf.get_u8();
    let payload_len = buf.get_u16_le() as usize;

    let type_tag = TypeTag::from_repr(flags >> 4)
        .ok_or_else(|| Error::Protocol(format!("unknown type tag {}", flags >> 4)))?;
    let fragmented = flags & FLAG_FRAGMENT != 0;

    let expected_len = id_len + payload_len + if fragmented { FRAGMENT_HEADER_LEN } else { 0 };
    if id_len == 0 || id_len > MAX_MESSAGE_ID_LEN || buf.remaining() != expected_len {
        return Err(Error::Protocol(format!(
            "length fields (id {}, payload {}) disagree with frame size {}",
            id_len,
            payload_len,
            frame.len()
        )));
    }

    let id = std::str::from_utf8(&buf[..id_len])
        .map_err(|_| Error::Protocol("message identifier is not ASCII".into()))?;
    let message_id = MessageId::from(id);
    buf.advance(id_len);

    let fragment = if fragmented {
        let offset = buf.get_u16_le();
        let total = buf.get_u16_le();
        Some(Fragment { offset, total })
    } else {
        None
    };

    Ok(Packet {
        message_id,
        type_tag,
        internal: flags & FLAG_INTERNAL != 0,
        query: flags & FLAG_QUERY != 0,
        ack: flags & FLAG_ACK != 0,
        ack_num,
        fragment,
        payload: Payload::Raw(Bytes::copy_from_slice(buf)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn as_hex(bytes: &[u8]) -> String {
        bytes
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<Vec<String>>()
            .join(" ")
    }

    fn assert_frame(packet: Packet, expect: &[u8]) {
        let mut frame = BytesMut::new();
        encode_packet(&packet, &mut frame).unwrap();
        if frame[..frame.len() - CRC_LEN] != *expect {
            panic!(
                "mismatch!\nexpected: {}\nactual: {}",
                as_hex(expect),
                as_hex(&frame[..])
            )
        }
    }

    #[test]
    fn test_crc16_check_value() {
        assert_eq!(crc16(b"123456789"), 0x29b1);
    }

    #[test]
    fn test_heartbeat_layout() {
        assert_frame(
            Packet::raw(internal::HEARTBEAT, TypeTag::Uint8, vec![7u8])
                .as_internal()
                .as_query(),
            &[0x63, 0x01, 0x00, 0x01, 0x00, b'h', 0x07],
        );
    }

    #[test]
    fn test_fragment_layout() {
        let mut packet = Packet::raw("blob", TypeTag::Byte, vec![0xaa, 0xbb]);
        packet.fragment = Some(Fragment { offset: 100, total: 250 });
        assert_frame(
            packet,
            &[
                0x38, 0x04, 0x00, 0x02, 0x00, b'b', b'l', b'o', b'b', 100, 0x00, 250, 0x00, 0xaa,
                0xbb,
            ],
        );
    }

    #[test]
    fn test_decode_restores_flags() {
        let mut packet = Packet::raw("led", TypeTag::Uint16, vec![1, 2]).with_ack();
        packet.ack_num = 9;

        let mut frame = BytesMut::new();
        encode_packet(&packet, &mut frame).unwrap();

        assert_eq!(decode_packet(&frame).unwrap(), packet);
    }

    #[test]
    fn test_decode_rejects_corruption() {
        let mut frame = BytesMut::new();
        encode_packet(&Packet::raw("led", TypeTag::Uint8, vec![1]), &mut frame).unwrap();
        frame[6] ^= 0xff;

        assert!(matches!(decode_packet(&frame), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_encode_rejects_long_identifier() {
        let packet = Packet::raw("a_very_long_identifier", TypeTag::Uint8, vec![1]);
        let mut frame = BytesMut::new();
        assert!(encode_packet(&packet, &mut frame).is_err());
    }

    #[test]
    fn test_type_tag_names() {
        assert_eq!(TypeTag::Uint8.to_string(), "uint8");
        assert_eq!("int16".parse::<TypeTag>().unwrap(), TypeTag::Int16);
        assert_eq!(TypeTag::from_repr(11), Some(TypeTag::Float));
    }
}
