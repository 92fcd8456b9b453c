//! Packet and message framing.
//!
//! Wire format, all integers little-endian:
//!
//! ```text
//! +--------+-----------+-----------+---------------------------+------+
//! | header | crc32     | ticks     | frag id | part | last      | body |
//! | 1 byte | 4 (opt)   | 2 (opt)   | 2 + 2 + 2 (opt)           |      |
//! +--------+-----------+-----------+---------------------------+------+
//! ```
//!
//! The header byte holds the packet type in bits 5-7 and the packet flags in
//! bits 0-4. The CRC32 covers the header byte and everything after the CRC
//! field.
//!
//! A connected body is one message, or with the `COMBINED` flag a sequence
//! of `len:u32 message` entries. Each message is:
//!
//! ```text
//! +---------+-----------+-----------+-------------+-------------+---------+
//! | mheader | ticks     | sequence  | attempt     | channel     | payload |
//! | 1 byte  | 2 (TIMED) | 2 (SEQ)   | 1 (RELIABLE)| 1 (CHANNEL) |         |
//! +---------+-----------+-----------+-------------+-------------+---------+
//! ```

use std::fmt;

use crc::{Crc, CRC_32_ISO_HDLC};
use thiserror::Error;

use super::error::{TransportError, TransportResult};
use crate::core::{DecodeError, Reader, Writer, CHANNEL_DEFAULT};

/// Size constants of the framing.
pub mod sizes {
    /// Packet header byte.
    pub const HEADER_SIZE: usize = 1;
    /// CRC32 field.
    pub const CRC_SIZE: usize = 4;
    /// Packet ticks field.
    pub const TICKS_SIZE: usize = 2;
    /// Fragment id, part and last index.
    pub const FRAGMENT_HEADER_SIZE: usize = 6;
    /// Length prefix of a combined message.
    pub const COMBINED_PREFIX_SIZE: usize = 4;
    /// Largest message header: type, ticks, sequence, attempt, channel.
    pub const MAX_MESSAGE_HEADER_SIZE: usize = 1 + 2 + 2 + 1 + 1;
}

static CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Packet type, stored in the top three bits of the header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Connection request.
    Request = 0x40,
    /// Connection rejected.
    Reject = 0x60,
    /// Connection accepted.
    Accept = 0x80,
    /// Messages of an established connection.
    Connected = 0xA0,
    /// Connectionless message to a single address.
    Unconnected = 0xC0,
    /// Connectionless broadcast message.
    Broadcast = 0xE0,
}

impl PacketType {
    const MASK: u8 = 0xE0;

    /// Parse the packet type from a header byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte & Self::MASK {
            0x40 => Some(Self::Request),
            0x60 => Some(Self::Reject),
            0x80 => Some(Self::Accept),
            0xA0 => Some(Self::Connected),
            0xC0 => Some(Self::Unconnected),
            0xE0 => Some(Self::Broadcast),
            _ => None,
        }
    }

    /// Convert to the header bits.
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Lowercase name used in logs and errors.
    pub fn name(self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Reject => "reject",
            Self::Accept => "accept",
            Self::Connected => "connected",
            Self::Unconnected => "unconnected",
            Self::Broadcast => "broadcast",
        }
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Packet flags, stored in the low five bits of the header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct PacketFlags(u8);

impl PacketFlags {
    /// No flags set.
    pub const NONE: Self = Self(0);
    /// Packet carries its send ticks.
    pub const TIMED: Self = Self(0x01);
    /// Packet is one fragment of a larger body.
    pub const FRAGMENTED: Self = Self(0x02);
    /// Body is compressed.
    pub const COMPRESSED: Self = Self(0x04);
    /// Body holds several length-prefixed messages.
    pub const COMBINED: Self = Self(0x08);
    /// Packet carries a CRC32.
    pub const VERIFIED: Self = Self(0x10);

    const MASK: u8 = 0x1F;

    /// Create flags from the low bits of a header byte.
    pub fn from_byte(byte: u8) -> Self {
        Self(byte & Self::MASK)
    }

    /// Get the raw byte value.
    pub fn as_byte(self) -> u8 {
        self.0
    }

    /// Check if every flag in `other` is set.
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Set the flags in `other`.
    pub fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Clear the flags in `other`.
    pub fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

/// Message type, stored in the top two bits of the message header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Connection is being closed.
    Disconnect = 0x00,
    /// Acknowledgement of a reliable message.
    Acknowledge = 0x40,
    /// Application message.
    Custom = 0x80,
    /// Round trip measurement.
    Ping = 0xC0,
}

impl MessageType {
    const MASK: u8 = 0xC0;

    /// Parse the message type from a message header byte.
    pub fn from_byte(byte: u8) -> Self {
        match byte & Self::MASK {
            0x00 => Self::Disconnect,
            0x40 => Self::Acknowledge,
            0x80 => Self::Custom,
            _ => Self::Ping,
        }
    }

    /// Convert to the header bits.
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Message flags, stored in the low six bits of the message header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct MessageFlags(u8);

impl MessageFlags {
    /// No flags set.
    pub const NONE: Self = Self(0);
    /// Message carries its creation ticks.
    pub const TIMED: Self = Self(0x01);
    /// Message carries a sequence number.
    pub const SEQUENCED: Self = Self(0x02);
    /// Message is retransmitted until acknowledged.
    pub const RELIABLE: Self = Self(0x04);
    /// Message is delivered in sequence order.
    pub const ORDERED: Self = Self(0x08);
    /// Duplicates of the message are suppressed.
    pub const UNIQUE: Self = Self(0x10);
    /// Message carries an explicit channel.
    pub const CHANNELED: Self = Self(0x20);

    const MASK: u8 = 0x3F;

    /// Create flags from the low bits of a message header byte.
    pub fn from_byte(byte: u8) -> Self {
        Self(byte & Self::MASK)
    }

    /// Get the raw byte value.
    pub fn as_byte(self) -> u8 {
        self.0
    }

    /// Check if every flag in `other` is set.
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Set the flags in `other`.
    pub fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Set the flags in `other` when `enabled`.
    pub fn with_if(self, other: Self, enabled: bool) -> Self {
        if enabled { self.with(other) } else { self }
    }
}

/// Fragment position within a fragment group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    /// Group identifier shared by all fragments of a body.
    pub id: u16,
    /// Index of this fragment.
    pub part: u16,
    /// Index of the final fragment.
    pub last: u16,
}

/// Decoded packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Packet type.
    pub packet_type: PacketType,
    /// Flags as received. `TIMED`, `FRAGMENTED` and `VERIFIED` are derived
    /// from the optional fields when encoding.
    pub flags: PacketFlags,
    /// Low 16 bits of the sender's host ticks.
    pub ticks: Option<u16>,
    /// Fragment position.
    pub fragment: Option<FragmentHeader>,
}

impl PacketHeader {
    /// Header of a packet of `packet_type` with no optional fields.
    pub fn new(packet_type: PacketType) -> Self {
        Self {
            packet_type,
            flags: PacketFlags::NONE,
            ticks: None,
            fragment: None,
        }
    }

    /// Set the send ticks.
    pub fn with_ticks(mut self, ticks: u16) -> Self {
        self.ticks = Some(ticks);
        self
    }

    /// Add flags.
    pub fn with_flags(mut self, flags: PacketFlags) -> Self {
        self.flags = self.flags.with(flags);
        self
    }

    /// Encoded header length.
    pub fn encoded_len(&self, verify: bool) -> usize {
        sizes::HEADER_SIZE
            + if verify { sizes::CRC_SIZE } else { 0 }
            + if self.ticks.is_some() { sizes::TICKS_SIZE } else { 0 }
            + if self.fragment.is_some() {
                sizes::FRAGMENT_HEADER_SIZE
            } else {
                0
            }
    }
}

/// Errors that can occur during frame parsing.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Datagram is empty.
    #[error("empty packet")]
    Empty,

    /// Packet type bits are not a known type.
    #[error("invalid packet type: 0x{0:02x}")]
    InvalidType(u8),

    /// Not enough bytes for a field.
    #[error("frame truncated: needed {needed} bytes, {remaining} remaining")]
    Truncated {
        /// Bytes required.
        needed: usize,
        /// Bytes left.
        remaining: usize,
    },

    /// Fragment part beyond the last index.
    #[error("invalid fragment: part {part} of last {last}")]
    InvalidFragment {
        /// Part index.
        part: u16,
        /// Last index.
        last: u16,
    },

    /// Fragment disagrees with earlier fragments of its group.
    #[error("fragment group {id} is inconsistent")]
    FragmentMismatch {
        /// Group id.
        id: u16,
    },

    /// Fragment received twice.
    #[error("duplicate fragment {part} of group {id}")]
    DuplicateFragment {
        /// Group id.
        id: u16,
        /// Part index.
        part: u16,
    },

    /// Reassembled body would exceed the allocator limit.
    #[error("fragment group too large: {size} > {limit}")]
    FragmentTooLarge {
        /// Projected size.
        size: usize,
        /// Maximum allowed size.
        limit: usize,
    },

    /// Reliable, ordered or unique message without a sequence.
    #[error("message requires a sequence")]
    MissingSequence,

    /// Payload that is malformed for its message type.
    #[error("malformed {0} payload")]
    MalformedPayload(&'static str),
}

impl From<DecodeError> for FrameError {
    fn from(err: DecodeError) -> Self {
        match err {
            DecodeError::UnexpectedEof { needed, remaining } => {
                FrameError::Truncated { needed, remaining }
            }
            DecodeError::InvalidEncoding(_) => FrameError::MalformedPayload("string"),
        }
    }
}

/// CRC32 over the header byte and everything after the CRC field.
pub fn packet_checksum(packet: &[u8]) -> u32 {
    let mut digest = CRC32.digest();
    digest.update(&packet[..sizes::HEADER_SIZE]);
    digest.update(&packet[sizes::HEADER_SIZE + sizes::CRC_SIZE..]);
    digest.finalize()
}

/// Serialize a packet into `out`, replacing its contents.
///
/// `verify` appends a CRC32. The `TIMED`, `FRAGMENTED` and `VERIFIED` flags
/// are set from the header fields; other flags are taken from `header.flags`.
pub fn encode_packet(header: &PacketHeader, body: &[u8], verify: bool, out: &mut Vec<u8>) {
    let mut flags = header
        .flags
        .without(PacketFlags::TIMED)
        .without(PacketFlags::FRAGMENTED)
        .without(PacketFlags::VERIFIED);
    if verify {
        flags = flags.with(PacketFlags::VERIFIED);
    }
    if header.ticks.is_some() {
        flags = flags.with(PacketFlags::TIMED);
    }
    if header.fragment.is_some() {
        flags = flags.with(PacketFlags::FRAGMENTED);
    }

    out.clear();
    out.reserve(header.encoded_len(verify) + body.len());
    let mut writer = Writer::from_vec(std::mem::take(out));
    writer.write_u8(header.packet_type.as_byte() | flags.as_byte());
    let crc_position = verify.then(|| writer.skip(sizes::CRC_SIZE));
    if let Some(ticks) = header.ticks {
        writer.write_u16(ticks);
    }
    if let Some(fragment) = header.fragment {
        writer.write_u16(fragment.id);
        writer.write_u16(fragment.part);
        writer.write_u16(fragment.last);
    }
    writer.write_bytes(body);
    if let Some(position) = crc_position {
        let checksum = packet_checksum(writer.as_slice());
        writer.patch_u32(position, checksum);
    }
    *out = writer.into_inner();
}

/// Parse a datagram into its header and body, verifying the CRC32 if the
/// packet carries one.
pub fn decode_packet(data: &[u8]) -> TransportResult<(PacketHeader, &[u8])> {
    let first = *data.first().ok_or(FrameError::Empty)?;
    let packet_type = PacketType::from_byte(first).ok_or(FrameError::InvalidType(first))?;
    let flags = PacketFlags::from_byte(first);

    let mut reader = Reader::new(&data[1..]);
    if flags.contains(PacketFlags::VERIFIED) {
        let expected = reader.read_u32().map_err(FrameError::from)?;
        let actual = packet_checksum(data);
        if expected != actual {
            return Err(TransportError::ChecksumMismatch { expected, actual });
        }
    }

    let ticks = if flags.contains(PacketFlags::TIMED) {
        Some(reader.read_u16().map_err(FrameError::from)?)
    } else {
        None
    };

    let fragment = if flags.contains(PacketFlags::FRAGMENTED) {
        let id = reader.read_u16().map_err(FrameError::from)?;
        let part = reader.read_u16().map_err(FrameError::from)?;
        let last = reader.read_u16().map_err(FrameError::from)?;
        if part > last {
            return Err(FrameError::InvalidFragment { part, last }.into());
        }
        Some(FragmentHeader { id, part, last })
    } else {
        None
    };

    let header = PacketHeader {
        packet_type,
        flags,
        ticks,
        fragment,
    };
    Ok((header, reader.remaining_bytes()))
}

/// Decoded message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Message type.
    pub message_type: MessageType,
    /// Flags. `TIMED`, `SEQUENCED` and `CHANNELED` are derived from the
    /// optional fields when encoding.
    pub flags: MessageFlags,
    /// Low 16 bits of the creation ticks.
    pub ticks: Option<u16>,
    /// Channel sequence.
    pub sequence: Option<u16>,
    /// Send attempt, present on reliable messages.
    pub attempt: u8,
    /// Channel.
    pub channel: u8,
}

impl MessageHeader {
    /// Header of a message with no optional fields on the default channel.
    pub fn new(message_type: MessageType, flags: MessageFlags) -> Self {
        Self {
            message_type,
            flags,
            ticks: None,
            sequence: None,
            attempt: 0,
            channel: CHANNEL_DEFAULT,
        }
    }

    fn wire_flags(&self) -> MessageFlags {
        let flags = MessageFlags(
            self.flags.as_byte()
                & !(MessageFlags::TIMED.0 | MessageFlags::SEQUENCED.0 | MessageFlags::CHANNELED.0),
        );
        flags
            .with_if(MessageFlags::TIMED, self.ticks.is_some())
            .with_if(MessageFlags::SEQUENCED, self.sequence.is_some())
            .with_if(MessageFlags::CHANNELED, self.channel != CHANNEL_DEFAULT)
    }

    /// Whether the message is reliable.
    pub fn is_reliable(&self) -> bool {
        self.flags.contains(MessageFlags::RELIABLE)
    }

    /// Whether the message is ordered.
    pub fn is_ordered(&self) -> bool {
        self.flags.contains(MessageFlags::ORDERED)
    }

    /// Whether the message is unique.
    pub fn is_unique(&self) -> bool {
        self.flags.contains(MessageFlags::UNIQUE)
    }

    /// Whether the message is timed.
    pub fn is_timed(&self) -> bool {
        self.ticks.is_some()
    }

    /// Offset of the attempt byte within the encoded message.
    pub fn attempt_offset(&self) -> Option<usize> {
        self.is_reliable().then(|| {
            1 + if self.ticks.is_some() { 2 } else { 0 }
                + if self.sequence.is_some() { 2 } else { 0 }
        })
    }

    /// Append the encoded header.
    pub fn write(&self, writer: &mut Writer) {
        writer.write_u8(self.message_type.as_byte() | self.wire_flags().as_byte());
        if let Some(ticks) = self.ticks {
            writer.write_u16(ticks);
        }
        if let Some(sequence) = self.sequence {
            writer.write_u16(sequence);
        }
        if self.is_reliable() {
            writer.write_u8(self.attempt);
        }
        if self.channel != CHANNEL_DEFAULT {
            writer.write_u8(self.channel);
        }
    }

    /// Parse a header, leaving `reader` at the payload.
    pub fn read(reader: &mut Reader<'_>) -> Result<Self, FrameError> {
        let first = reader.read_u8()?;
        let message_type = MessageType::from_byte(first);
        let flags = MessageFlags::from_byte(first);
        let ticks = if flags.contains(MessageFlags::TIMED) {
            Some(reader.read_u16()?)
        } else {
            None
        };
        let sequence = if flags.contains(MessageFlags::SEQUENCED) {
            Some(reader.read_u16()?)
        } else {
            None
        };
        let attempt = if flags.contains(MessageFlags::RELIABLE) {
            reader.read_u8()?
        } else {
            0
        };
        let channel = if flags.contains(MessageFlags::CHANNELED) {
            reader.read_u8()?
        } else {
            CHANNEL_DEFAULT
        };

        let needs_sequence = MessageFlags(
            MessageFlags::RELIABLE.0 | MessageFlags::ORDERED.0 | MessageFlags::UNIQUE.0,
        );
        if flags.as_byte() & needs_sequence.as_byte() != 0 && sequence.is_none() {
            return Err(FrameError::MissingSequence);
        }

        Ok(Self {
            message_type,
            flags,
            ticks,
            sequence,
            attempt,
            channel,
        })
    }
}

/// Iterator over the messages of a decoded body.
#[derive(Debug, Clone)]
pub struct Messages<'a> {
    reader: Reader<'a>,
    combined: bool,
    done: bool,
}

impl<'a> Messages<'a> {
    /// Split `body`; `combined` bodies hold length-prefixed messages.
    pub fn new(body: &'a [u8], combined: bool) -> Self {
        Self {
            reader: Reader::new(body),
            combined,
            done: false,
        }
    }
}

impl<'a> Iterator for Messages<'a> {
    type Item = Result<&'a [u8], FrameError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if !self.combined {
            self.done = true;
            let message = self.reader.remaining_bytes();
            return (!message.is_empty()).then_some(Ok(message));
        }
        if self.reader.is_empty() {
            self.done = true;
            return None;
        }
        let result = self
            .reader
            .read_u32()
            .and_then(|len| self.reader.read_bytes(len as usize))
            .map_err(FrameError::from);
        if result.is_err() {
            self.done = true;
        }
        Some(result)
    }
}

/// Append one message to a combined body.
pub fn write_combined(body: &mut Vec<u8>, message: &[u8]) {
    body.extend_from_slice(&(message.len() as u32).to_le_bytes());
    body.extend_from_slice(message);
}

/// Body of a `Request` packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestPayload<'a> {
    /// Requester's ECDH public key, empty without encryption.
    pub key: &'a [u8],
    /// Random challenge for the acceptor to sign, empty without authentication.
    pub challenge: &'a [u8],
    /// Application payload.
    pub payload: &'a [u8],
}

impl<'a> RequestPayload<'a> {
    /// Append the encoded payload.
    pub fn write(&self, writer: &mut Writer) {
        writer.write_u16(self.key.len() as u16);
        writer.write_u16(self.challenge.len() as u16);
        writer.write_bytes(self.key);
        writer.write_bytes(self.challenge);
        writer.write_bytes(self.payload);
    }

    /// Parse a request body.
    pub fn read(body: &'a [u8]) -> Result<Self, FrameError> {
        let mut reader = Reader::new(body);
        let key_len = reader.read_u16()? as usize;
        let challenge_len = reader.read_u16()? as usize;
        let key = reader.read_bytes(key_len)?;
        let challenge = reader.read_bytes(challenge_len)?;
        Ok(Self {
            key,
            challenge,
            payload: reader.remaining_bytes(),
        })
    }
}

/// Body of an `Accept` packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcceptPayload<'a> {
    /// Acceptor's ECDH public key, empty without encryption.
    pub key: &'a [u8],
    /// Signature over the request challenge, empty without authentication.
    pub signature: &'a [u8],
}

impl<'a> AcceptPayload<'a> {
    /// Append the encoded payload.
    pub fn write(&self, writer: &mut Writer) {
        writer.write_u16(self.key.len() as u16);
        writer.write_u16(self.signature.len() as u16);
        writer.write_bytes(self.key);
        writer.write_bytes(self.signature);
    }

    /// Parse an accept body.
    pub fn read(body: &'a [u8]) -> Result<Self, FrameError> {
        let mut reader = Reader::new(body);
        let key_len = reader.read_u16()? as usize;
        let signature_len = reader.read_u16()? as usize;
        let key = reader.read_bytes(key_len)?;
        let signature = reader.read_bytes(signature_len)?;
        Ok(Self { key, signature })
    }
}

/// Body of an `Acknowledge` message.
///
/// The message header carries the triggering sequence; the body adds the
/// attempt being answered and a cumulative view of the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckPayload {
    /// Attempt of the triggering message.
    pub attempt: u8,
    /// Highest reliable sequence received on the channel.
    pub latest: u16,
    /// Bit `i` set means `latest - 1 - i` was received.
    pub mask: u32,
}

impl AckPayload {
    /// Append the encoded payload.
    pub fn write(&self, writer: &mut Writer) {
        writer.write_u8(self.attempt);
        writer.write_u16(self.latest);
        writer.write_u32(self.mask);
    }

    /// Parse an acknowledgement body.
    pub fn read(body: &[u8]) -> Result<Self, FrameError> {
        let mut reader = Reader::new(body);
        let attempt = reader.read_u8()?;
        let latest = reader.read_u16()?;
        let mask = reader.read_u32()?;
        Ok(Self {
            attempt,
            latest,
            mask,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(header: &PacketHeader, body: &[u8], verify: bool) -> Vec<u8> {
        let mut out = Vec::new();
        encode_packet(header, body, verify, &mut out);
        out
    }

    #[test]
    fn test_packet_type_bits() {
        for packet_type in [
            PacketType::Request,
            PacketType::Reject,
            PacketType::Accept,
            PacketType::Connected,
            PacketType::Unconnected,
            PacketType::Broadcast,
        ] {
            let byte = packet_type.as_byte() | 0x1F;
            assert_eq!(PacketType::from_byte(byte), Some(packet_type));
        }
        assert_eq!(PacketType::from_byte(0x00), None);
        assert_eq!(PacketType::from_byte(0x3F), None);
    }

    #[test]
    fn test_minimal_packet_layout() {
        let bytes = encode(&PacketHeader::new(PacketType::Unconnected), b"hi", false);
        assert_eq!(bytes, [0xC0, b'h', b'i']);
    }

    #[test]
    fn test_full_header_layout() {
        let header = PacketHeader {
            packet_type: PacketType::Connected,
            flags: PacketFlags::COMPRESSED,
            ticks: Some(0x0102),
            fragment: Some(FragmentHeader {
                id: 7,
                part: 1,
                last: 2,
            }),
        };
        let bytes = encode(&header, b"x", true);
        assert_eq!(bytes.len(), header.encoded_len(true) + 1);
        // Connected | Verified | Compressed | Fragmented | Timed
        assert_eq!(bytes[0], 0xA0 | 0x10 | 0x04 | 0x02 | 0x01);
        assert_eq!(&bytes[5..], &hex::decode("020107000100020078").unwrap()[..]);

        let (decoded, body) = decode_packet(&bytes).unwrap();
        assert_eq!(decoded.packet_type, PacketType::Connected);
        assert!(decoded.flags.contains(PacketFlags::COMPRESSED));
        assert_eq!(decoded.ticks, Some(0x0102));
        assert_eq!(decoded.fragment, header.fragment);
        assert_eq!(body, b"x");
    }

    #[test]
    fn test_checksum_mismatch() {
        let header = PacketHeader::new(PacketType::Connected).with_ticks(5);
        let mut bytes = encode(&header, b"payload", true);
        assert!(decode_packet(&bytes).is_ok());

        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert!(matches!(
            decode_packet(&bytes),
            Err(TransportError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_checksum_covers_header_byte() {
        let mut bytes = encode(&PacketHeader::new(PacketType::Unconnected), b"abc", true);
        bytes[0] = PacketType::Broadcast.as_byte() | PacketFlags::VERIFIED.as_byte();
        assert!(matches!(
            decode_packet(&bytes),
            Err(TransportError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_malformed_packets() {
        assert!(matches!(
            decode_packet(&[]),
            Err(TransportError::Frame(FrameError::Empty))
        ));
        assert!(matches!(
            decode_packet(&[0x20]),
            Err(TransportError::Frame(FrameError::InvalidType(0x20)))
        ));
        assert!(matches!(
            decode_packet(&[0xA1, 0x00]),
            Err(TransportError::Frame(FrameError::Truncated { .. }))
        ));
        // part 3 of last 1
        assert!(matches!(
            decode_packet(&[0xA2, 0, 0, 3, 0, 1, 0]),
            Err(TransportError::Frame(FrameError::InvalidFragment { part: 3, last: 1 }))
        ));
    }

    #[test]
    fn test_message_header_roundtrip() {
        let header = MessageHeader {
            message_type: MessageType::Custom,
            flags: MessageFlags::RELIABLE.with(MessageFlags::ORDERED),
            ticks: Some(1000),
            sequence: Some(42),
            attempt: 3,
            channel: 9,
        };
        let mut writer = Writer::new();
        header.write(&mut writer);
        writer.write_bytes(b"data");
        let bytes = writer.into_inner();
        assert_eq!(header.attempt_offset(), Some(5));
        assert_eq!(bytes[5], 3);

        let mut reader = Reader::new(&bytes);
        let decoded = MessageHeader::read(&mut reader).unwrap();
        assert_eq!(decoded.message_type, MessageType::Custom);
        assert!(decoded.is_reliable() && decoded.is_ordered() && !decoded.is_unique());
        assert_eq!(decoded.ticks, Some(1000));
        assert_eq!(decoded.sequence, Some(42));
        assert_eq!(decoded.attempt, 3);
        assert_eq!(decoded.channel, 9);
        assert_eq!(reader.remaining_bytes(), b"data");
    }

    #[test]
    fn test_default_channel_is_implicit() {
        let header = MessageHeader::new(MessageType::Custom, MessageFlags::NONE);
        let mut writer = Writer::new();
        header.write(&mut writer);
        assert_eq!(writer.as_slice(), &[0x80]);
    }

    #[test]
    fn test_reliable_without_sequence_rejected() {
        // Custom | Reliable, attempt byte present but no sequence
        let bytes = [0x80 | 0x04, 0x00];
        let mut reader = Reader::new(&bytes);
        assert_eq!(
            MessageHeader::read(&mut reader),
            Err(FrameError::MissingSequence)
        );
    }

    #[test]
    fn test_combined_messages() {
        let mut body = Vec::new();
        write_combined(&mut body, b"one");
        write_combined(&mut body, b"three");
        let messages: Vec<_> = Messages::new(&body, true)
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(messages, vec![&b"one"[..], &b"three"[..]]);

        let single: Vec<_> = Messages::new(b"solo", false).collect();
        assert_eq!(single, vec![Ok(&b"solo"[..])]);

        body.truncate(body.len() - 1);
        let results: Vec<_> = Messages::new(&body, true).collect();
        assert_eq!(results.len(), 2);
        assert!(results[1].is_err());
    }

    #[test]
    fn test_request_payload() {
        let request = RequestPayload {
            key: &[1, 2],
            challenge: &[3],
            payload: b"hey",
        };
        let mut writer = Writer::new();
        request.write(&mut writer);
        let bytes = writer.into_inner();
        assert_eq!(bytes, hex::decode("02000100010203686579").unwrap());
        assert_eq!(RequestPayload::read(&bytes).unwrap(), request);

        assert!(RequestPayload::read(&[5, 0, 0, 0, 1]).is_err());
    }

    #[test]
    fn test_ack_payload_layout() {
        let ack = AckPayload {
            attempt: 2,
            latest: 0x0304,
            mask: 0x0A0B0C0D,
        };
        let mut writer = Writer::new();
        ack.write(&mut writer);
        assert_eq!(writer.as_slice(), &hex::decode("0204030d0c0b0a").unwrap()[..]);
        assert_eq!(writer.position(), crate::core::ACK_PAYLOAD_SIZE);
        assert_eq!(AckPayload::read(writer.as_slice()).unwrap(), ack);
        assert!(AckPayload::read(&[2, 4, 3]).is_err());
    }

    #[test]
    fn test_accept_payload() {
        let accept = AcceptPayload {
            key: &[9; 32],
            signature: &[],
        };
        let mut writer = Writer::new();
        accept.write(&mut writer);
        let bytes = writer.into_inner();
        assert_eq!(bytes.len(), 4 + 32);
        assert_eq!(AcceptPayload::read(&bytes).unwrap(), accept);
    }
}
