//! dgbus wire format: one packet per datagram.
//!
//! ```text
//! offset  size   field
//! 0       3      magic "DGB"
//! 3       16     message id
//! 19      1      role (0 = START, 1 = DATA)
//! 20      1      contiguous flag (nonzero = true)
//! -- START --
//! 21      2      topic length, big-endian (0xFFFF = empty topic, nothing follows)
//! 23      len    topic bytes (see `escape`)
//! 23+len  1      NUL
//! ...     rest   first payload chunk
//! -- DATA --
//! 21      2      chunk sequence number, big-endian, 1-based
//! 23      rest   payload chunk
//! ```
//!
//! On a START the contiguous flag says whether DATA packets follow. On a
//! DATA it says whether more DATA packets follow; a DATA with the flag
//! clear is the terminal fragment.
//!
//! Parsing never indexes past the buffer. Every short read is a
//! `DecodeError::Truncated`.

use bytes::{BufMut, Bytes, BytesMut};
use uuid::Uuid;

use crate::escape;

// ── Constants ─────────────────────────────────────────────────────────────────

/// Marker at the start of every packet.
pub const MAGIC: [u8; 3] = *b"DGB";

/// magic + message id + role + contiguous flag.
pub const HEADER_LEN: usize = 3 + 16 + 1 + 1;

/// Header plus the 2-byte sequence number of a DATA packet.
pub const DATA_OVERHEAD: usize = HEADER_LEN + 2;

/// Length prefix meaning "empty topic, no characters, no terminator".
pub const EMPTY_TOPIC_SENTINEL: u16 = 0xFFFF;

/// Default fixed packet size. Fits a typical Ethernet MTU with room for
/// IP and UDP headers.
pub const MAX_PACKET_SIZE: usize = 1400;

/// Largest UDP payload over IPv4.
pub const MAX_DATAGRAM_SIZE: usize = 65507;

const ROLE_START: u8 = 0;
const ROLE_DATA: u8 = 1;

// ── Types ─────────────────────────────────────────────────────────────────────

/// Role byte of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Role {
    Start = ROLE_START,
    Data = ROLE_DATA,
}

impl TryFrom<u8> for Role {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            ROLE_START => Ok(Role::Start),
            ROLE_DATA => Ok(Role::Data),
            other => Err(DecodeError::UnknownRole(other)),
        }
    }
}

impl From<Role> for u8 {
    fn from(r: Role) -> u8 {
        r as u8
    }
}

/// A parsed packet. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub message_id: Uuid,
    /// START: DATA packets follow. DATA: more DATA packets follow.
    pub contiguous: bool,
    pub body: PacketBody,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketBody {
    /// First packet of a message. Its chunk occupies position 1.
    Start { topic: String, chunk: Bytes },
    /// A subsequent fragment at 1-based position `seq`.
    Data { seq: u16, chunk: Bytes },
}

impl Packet {
    pub fn start(message_id: Uuid, topic: impl Into<String>, chunk: Bytes, contiguous: bool) -> Self {
        Self {
            message_id,
            contiguous,
            body: PacketBody::Start {
                topic: topic.into(),
                chunk,
            },
        }
    }

    pub fn data(message_id: Uuid, seq: u16, chunk: Bytes, contiguous: bool) -> Self {
        Self {
            message_id,
            contiguous,
            body: PacketBody::Data { seq, chunk },
        }
    }

    pub fn role(&self) -> Role {
        match self.body {
            PacketBody::Start { .. } => Role::Start,
            PacketBody::Data { .. } => Role::Data,
        }
    }

    /// Payload bytes carried by this packet.
    pub fn chunk(&self) -> &Bytes {
        match &self.body {
            PacketBody::Start { chunk, .. } | PacketBody::Data { chunk, .. } => chunk,
        }
    }

    /// Parse one datagram.
    pub fn parse(buf: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(buf);

        let magic = r.take(MAGIC.len())?;
        if magic != MAGIC {
            return Err(DecodeError::BadMagic([magic[0], magic[1], magic[2]]));
        }

        let mut id = [0u8; 16];
        id.copy_from_slice(r.take(16)?);
        let message_id = Uuid::from_bytes(id);

        let role = Role::try_from(r.u8()?)?;
        let contiguous = r.u8()? != 0;

        let body = match role {
            Role::Start => {
                let topic = r.topic()?;
                PacketBody::Start {
                    topic,
                    chunk: Bytes::copy_from_slice(r.rest()),
                }
            }
            Role::Data => {
                let seq = r.u16_be()?;
                PacketBody::Data {
                    seq,
                    chunk: Bytes::copy_from_slice(r.rest()),
                }
            }
        };

        Ok(Self {
            message_id,
            contiguous,
            body,
        })
    }

    /// Serialize this packet. Mirrors `parse` byte-for-byte.
    pub fn encode(&self) -> Result<Bytes, EncodeError> {
        let mut out = BytesMut::with_capacity(self.encoded_len()?);
        out.put_slice(&MAGIC);
        out.put_slice(self.message_id.as_bytes());
        out.put_u8(self.role().into());
        out.put_u8(u8::from(self.contiguous));

        match &self.body {
            PacketBody::Start { topic, chunk } => {
                put_topic(&mut out, topic)?;
                out.put_slice(chunk);
            }
            PacketBody::Data { seq, chunk } => {
                out.put_u16(*seq);
                out.put_slice(chunk);
            }
        }
        Ok(out.freeze())
    }

    fn encoded_len(&self) -> Result<usize, EncodeError> {
        Ok(match &self.body {
            PacketBody::Start { topic, chunk } => start_overhead(topic)? + chunk.len(),
            PacketBody::Data { chunk, .. } => DATA_OVERHEAD + chunk.len(),
        })
    }
}

/// Bytes a START packet spends before its first chunk.
pub fn start_overhead(topic: &str) -> Result<usize, EncodeError> {
    if topic.is_empty() {
        return Ok(HEADER_LEN + 2);
    }
    let len = escape::encode_topic(topic).len();
    if len >= EMPTY_TOPIC_SENTINEL as usize {
        return Err(EncodeError::TopicTooLong(len));
    }
    Ok(HEADER_LEN + 2 + len + 1)
}

fn put_topic(out: &mut BytesMut, topic: &str) -> Result<(), EncodeError> {
    if topic.is_empty() {
        out.put_u16(EMPTY_TOPIC_SENTINEL);
        return Ok(());
    }
    let wire = escape::encode_topic(topic);
    let len = u16::try_from(wire.len())
        .ok()
        .filter(|&l| l != EMPTY_TOPIC_SENTINEL)
        .ok_or(EncodeError::TopicTooLong(wire.len()))?;
    out.put_u16(len);
    out.put_slice(&wire);
    out.put_u8(0);
    Ok(())
}

/// Split a serialized payload into wire packets no larger than `max_packet`.
///
/// A payload that fits next to the START header goes out as a single
/// non-contiguous START. Otherwise the START carries as much as fits and
/// DATA packets with sequence numbers 2.. carry the rest; the last DATA
/// has its contiguous flag cleared.
pub fn split_message(
    message_id: Uuid,
    topic: &str,
    payload: &[u8],
    max_packet: usize,
) -> Result<Vec<Bytes>, EncodeError> {
    let overhead = start_overhead(topic)?;
    if max_packet < overhead {
        return Err(EncodeError::PacketTooSmall {
            size: max_packet,
            needed: overhead,
        });
    }

    let first_cap = max_packet - overhead;
    if payload.len() <= first_cap {
        let packet = Packet::start(message_id, topic, Bytes::copy_from_slice(payload), false);
        return Ok(vec![packet.encode()?]);
    }

    if max_packet <= DATA_OVERHEAD {
        return Err(EncodeError::PacketTooSmall {
            size: max_packet,
            needed: DATA_OVERHEAD + 1,
        });
    }
    let data_cap = max_packet - DATA_OVERHEAD;
    let (first, rest) = payload.split_at(first_cap);
    let data_chunks: Vec<&[u8]> = rest.chunks(data_cap).collect();

    let total = data_chunks.len() + 1;
    if total > u16::MAX as usize {
        return Err(EncodeError::TooManyChunks(total));
    }

    let mut packets = Vec::with_capacity(total);
    packets.push(Packet::start(message_id, topic, Bytes::copy_from_slice(first), true).encode()?);
    let last = data_chunks.len() - 1;
    for (i, chunk) in data_chunks.into_iter().enumerate() {
        // Position 1 is the START chunk.
        let seq = (i + 2) as u16;
        let packet = Packet::data(message_id, seq, Bytes::copy_from_slice(chunk), i != last);
        packets.push(packet.encode()?);
    }
    Ok(packets)
}

// ── Reader ────────────────────────────────────────────────────────────────────

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.pos.checked_add(n).filter(|&e| e <= self.buf.len()).ok_or(
            DecodeError::Truncated {
                needed: self.pos + n,
                available: self.buf.len(),
            },
        )?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u16_be(&mut self) -> Result<u16, DecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn topic(&mut self) -> Result<String, DecodeError> {
        let len = self.u16_be()?;
        if len == EMPTY_TOPIC_SENTINEL {
            return Ok(String::new());
        }
        let raw = self.take(len as usize)?;
        match self.buf.get(self.pos) {
            Some(0) => self.pos += 1,
            _ => return Err(DecodeError::UnterminatedString),
        }
        escape::decode_topic(raw)
    }

    fn rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that arise when interpreting an inbound datagram.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("bad magic marker: {0:02x?}")]
    BadMagic([u8; 3]),

    #[error("unknown role byte: 0x{0:02x}")]
    UnknownRole(u8),

    #[error("truncated packet: needed {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("malformed escape at topic offset {offset}")]
    BadEscape { offset: usize },

    #[error("topic string is not NUL-terminated")]
    UnterminatedString,

    #[error("topic is not valid UTF-8: {0}")]
    InvalidUtf8(std::str::Utf8Error),
}

/// Errors that arise when building outbound packets.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    #[error("encoded topic is {0} bytes, maximum is {}", EMPTY_TOPIC_SENTINEL - 1)]
    TopicTooLong(usize),

    #[error("packet size {size} cannot hold a {needed}-byte header")]
    PacketTooSmall { size: usize, needed: usize },

    #[error("message needs {0} packets, maximum is {}", u16::MAX)]
    TooManyChunks(usize),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
