//! Wire-format definitions for PPCB packets.
//!
//! Every message exchanged between client and server is a [`Packet`].  This
//! module is responsible for:
//! - Defining the on-wire binary layout of the seven packet kinds.
//! - Serialising a [`Packet`] into a byte buffer ready for transmission.
//! - Deserialising a raw byte slice back into a [`Packet`], returning errors
//!   for malformed, truncated, or oversized input.
//!
//! No I/O happens here; this is pure data transformation.
//!
//! # Wire format
//!
//! Layouts are packed (no padding).  The type tag, the session id and the
//! protocol id travel in **host** byte order; `total_len`, `chunk_index` and
//! `chunk_len` are **big-endian**.
//!
//! ```text
//!  CONN    | type:1 | session_id:8 | protocol_id:1 | total_len:8 |          18 bytes
//!  CONACC  | type:2 | session_id:8 |                                        9 bytes
//!  CONRJT  | type:3 | session_id:8 |                                        9 bytes
//!  DATA    | type:4 | session_id:8 | chunk_index:8 | chunk_len:4 | payload  21 + len
//!  ACC     | type:5 | session_id:8 | chunk_index:8 |                       17 bytes
//!  RJT     | type:6 | session_id:8 | chunk_index:8 |                       17 bytes
//!  RCVD    | type:7 | session_id:8 |                                        9 bytes
//! ```

use std::fmt;

use thiserror::Error;

/// Type tags carried in the first byte of every packet.
pub mod kind {
    pub const CONN: u8 = 1;
    pub const CONACC: u8 = 2;
    pub const CONRJT: u8 = 3;
    pub const DATA: u8 = 4;
    pub const ACC: u8 = 5;
    pub const RJT: u8 = 6;
    pub const RCVD: u8 = 7;
}

/// Byte length of a CONN packet.
pub const CONN_LEN: usize = 18;
/// Byte length of CONACC, CONRJT and RCVD packets.
pub const CONTROL_LEN: usize = 9;
/// Byte length of ACC and RJT packets.
pub const CHUNK_REPLY_LEN: usize = 17;
/// Byte length of the fixed DATA header preceding the payload.
pub const DATA_HEADER_LEN: usize = 21;

/// Largest chunk payload the protocol allows.
pub const MAX_CHUNK_LEN: u32 = 64_000;

// Byte offsets of each field within the serialised packet.
const OFF_TYPE: usize = 0;
const OFF_SESSION: usize = 1;
const OFF_PROTOCOL: usize = 9;
const OFF_TOTAL_LEN: usize = 10;
const OFF_INDEX: usize = 9;
const OFF_CHUNK_LEN: usize = 17;

// ---------------------------------------------------------------------------
// PacketKind
// ---------------------------------------------------------------------------

/// Discriminant of a [`Packet`], usable without owning a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    Conn,
    ConAcc,
    ConRjt,
    Data,
    Acc,
    Rjt,
    Rcvd,
}

impl PacketKind {
    /// Map a wire type tag to its kind.
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            kind::CONN => Some(Self::Conn),
            kind::CONACC => Some(Self::ConAcc),
            kind::CONRJT => Some(Self::ConRjt),
            kind::DATA => Some(Self::Data),
            kind::ACC => Some(Self::Acc),
            kind::RJT => Some(Self::Rjt),
            kind::RCVD => Some(Self::Rcvd),
            _ => None,
        }
    }

    pub fn tag(self) -> u8 {
        match self {
            Self::Conn => kind::CONN,
            Self::ConAcc => kind::CONACC,
            Self::ConRjt => kind::CONRJT,
            Self::Data => kind::DATA,
            Self::Acc => kind::ACC,
            Self::Rjt => kind::RJT,
            Self::Rcvd => kind::RCVD,
        }
    }

    /// Exact on-wire length of a fixed-size kind.
    ///
    /// Returns `None` for [`PacketKind::Data`], whose length depends on the
    /// payload; its fixed part is [`DATA_HEADER_LEN`].
    pub fn fixed_len(self) -> Option<usize> {
        match self {
            Self::Conn => Some(CONN_LEN),
            Self::ConAcc | Self::ConRjt | Self::Rcvd => Some(CONTROL_LEN),
            Self::Acc | Self::Rjt => Some(CHUNK_REPLY_LEN),
            Self::Data => None,
        }
    }
}

impl fmt::Display for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Conn => "CONN",
            Self::ConAcc => "CONACC",
            Self::ConRjt => "CONRJT",
            Self::Data => "DATA",
            Self::Acc => "ACC",
            Self::Rjt => "RJT",
            Self::Rcvd => "RCVD",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// DataHeader
// ---------------------------------------------------------------------------

/// The fixed 21-byte prefix of a DATA packet.
///
/// Parsed on its own so a receiver can validate a chunk before reading (or
/// trusting) its payload, and can still address an RJT when validation fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataHeader {
    pub session_id: u64,
    pub chunk_index: u64,
    /// Declared payload length.
    pub chunk_len: u32,
}

impl DataHeader {
    /// Parse the header from the first [`DATA_HEADER_LEN`] bytes of `buf`.
    ///
    /// Trailing bytes (the payload) are not inspected.
    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        let tag = *buf.first().ok_or(PacketError::Empty)?;
        if tag != kind::DATA {
            return Err(PacketError::UnexpectedType {
                expected: PacketKind::Data,
                actual: tag,
            });
        }
        if buf.len() < DATA_HEADER_LEN {
            return Err(PacketError::WrongLength {
                kind: PacketKind::Data,
                expected: DATA_HEADER_LEN,
                actual: buf.len(),
            });
        }
        Ok(Self {
            session_id: ne_u64(buf, OFF_SESSION),
            chunk_index: be_u64(buf, OFF_INDEX),
            chunk_len: be_u32(buf, OFF_CHUNK_LEN),
        })
    }

    /// `true` when the declared length lies in `1..=max_chunk`.
    pub fn chunk_len_valid(&self, max_chunk: u32) -> bool {
        (1..=max_chunk).contains(&self.chunk_len)
    }
}

// ---------------------------------------------------------------------------
// Packet
// ---------------------------------------------------------------------------

/// One complete PPCB packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Open a session and declare the transport and the total payload length.
    Conn {
        session_id: u64,
        protocol_id: u8,
        total_len: u64,
    },
    ConAcc {
        session_id: u64,
    },
    ConRjt {
        session_id: u64,
    },
    /// One chunk of the payload.  `chunk_len` on the wire is `payload.len()`.
    Data {
        session_id: u64,
        chunk_index: u64,
        payload: Vec<u8>,
    },
    Acc {
        session_id: u64,
        chunk_index: u64,
    },
    Rjt {
        session_id: u64,
        chunk_index: u64,
    },
    Rcvd {
        session_id: u64,
    },
}

impl Packet {
    pub fn kind(&self) -> PacketKind {
        match self {
            Self::Conn { .. } => PacketKind::Conn,
            Self::ConAcc { .. } => PacketKind::ConAcc,
            Self::ConRjt { .. } => PacketKind::ConRjt,
            Self::Data { .. } => PacketKind::Data,
            Self::Acc { .. } => PacketKind::Acc,
            Self::Rjt { .. } => PacketKind::Rjt,
            Self::Rcvd { .. } => PacketKind::Rcvd,
        }
    }

    pub fn session_id(&self) -> u64 {
        match *self {
            Self::Conn { session_id, .. }
            | Self::ConAcc { session_id }
            | Self::ConRjt { session_id }
            | Self::Data { session_id, .. }
            | Self::Acc { session_id, .. }
            | Self::Rjt { session_id, .. }
            | Self::Rcvd { session_id } => session_id,
        }
    }

    /// Number of bytes [`Packet::encode`] will produce.
    pub fn encoded_len(&self) -> usize {
        match self {
            Self::Data { payload, .. } => DATA_HEADER_LEN + payload.len(),
            other => other.kind().fixed_len().unwrap_or(DATA_HEADER_LEN),
        }
    }

    /// Serialise this packet into a newly allocated byte vector of exactly
    /// [`Packet::encoded_len`] bytes.
    ///
    /// No validation happens here: a DATA packet with an empty or oversized
    /// payload encodes faithfully so tests can put malformed chunks on the
    /// wire.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.push(self.kind().tag());
        buf.extend_from_slice(&self.session_id().to_ne_bytes());

        match self {
            Self::Conn {
                protocol_id,
                total_len,
                ..
            } => {
                buf.push(*protocol_id);
                buf.extend_from_slice(&total_len.to_be_bytes());
            }
            Self::Data {
                chunk_index,
                payload,
                ..
            } => {
                buf.extend_from_slice(&chunk_index.to_be_bytes());
                buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
                buf.extend_from_slice(payload);
            }
            Self::Acc { chunk_index, .. } | Self::Rjt { chunk_index, .. } => {
                buf.extend_from_slice(&chunk_index.to_be_bytes());
            }
            Self::ConAcc { .. } | Self::ConRjt { .. } | Self::Rcvd { .. } => {}
        }

        debug_assert_eq!(buf.len(), self.encoded_len());
        buf
    }

    /// Parse a [`Packet`] from a raw byte slice.
    ///
    /// Returns [`Err`] if:
    /// - `buf` is empty or carries an unknown type tag,
    /// - a fixed-size kind is not exactly its wire length,
    /// - a DATA packet is shorter than its header, declares a chunk length
    ///   outside `1..=max_chunk`, or is not followed by exactly that many
    ///   payload bytes.
    pub fn decode(buf: &[u8], max_chunk: u32) -> Result<Self, PacketError> {
        let tag = *buf.first().ok_or(PacketError::Empty)?;
        let kind = PacketKind::from_tag(tag).ok_or(PacketError::UnknownType(tag))?;

        let Some(expected) = kind.fixed_len() else {
            return Self::decode_data(buf, max_chunk);
        };
        if buf.len() != expected {
            return Err(PacketError::WrongLength {
                kind,
                expected,
                actual: buf.len(),
            });
        }

        let session_id = ne_u64(buf, OFF_SESSION);
        let packet = match kind {
            PacketKind::Conn => Self::Conn {
                session_id,
                protocol_id: buf[OFF_PROTOCOL],
                total_len: be_u64(buf, OFF_TOTAL_LEN),
            },
            PacketKind::ConAcc => Self::ConAcc { session_id },
            PacketKind::ConRjt => Self::ConRjt { session_id },
            PacketKind::Acc => Self::Acc {
                session_id,
                chunk_index: be_u64(buf, OFF_INDEX),
            },
            PacketKind::Rjt => Self::Rjt {
                session_id,
                chunk_index: be_u64(buf, OFF_INDEX),
            },
            PacketKind::Rcvd => Self::Rcvd { session_id },
            PacketKind::Data => return Self::decode_data(buf, max_chunk),
        };
        debug_assert_eq!(buf[OFF_TYPE], packet.kind().tag());
        Ok(packet)
    }

    fn decode_data(buf: &[u8], max_chunk: u32) -> Result<Self, PacketError> {
        let header = DataHeader::decode(buf)?;
        if !header.chunk_len_valid(max_chunk) {
            return Err(PacketError::InvalidChunkLength {
                header,
                max: max_chunk,
            });
        }
        let available = buf.len() - DATA_HEADER_LEN;
        if available != header.chunk_len as usize {
            return Err(PacketError::PayloadMismatch { header, available });
        }
        Ok(Self::Data {
            session_id: header.session_id,
            chunk_index: header.chunk_index,
            payload: buf[DATA_HEADER_LEN..].to_vec(),
        })
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conn {
                session_id,
                protocol_id,
                total_len,
            } => write!(f, "CONN sid={session_id} proto={protocol_id} len={total_len}"),
            Self::Data {
                session_id,
                chunk_index,
                payload,
            } => write!(f, "DATA sid={session_id} idx={chunk_index} len={}", payload.len()),
            Self::Acc {
                session_id,
                chunk_index,
            }
            | Self::Rjt {
                session_id,
                chunk_index,
            } => write!(f, "{} sid={session_id} idx={chunk_index}", self.kind()),
            other => write!(f, "{} sid={}", other.kind(), other.session_id()),
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can arise when parsing raw bytes into a packet.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    #[error("empty packet buffer")]
    Empty,
    #[error("unknown packet type {0}")]
    UnknownType(u8),
    #[error("expected a {expected} packet, got type {actual}")]
    UnexpectedType { expected: PacketKind, actual: u8 },
    #[error("{kind} packet must be {expected} bytes, got {actual}")]
    WrongLength {
        kind: PacketKind,
        expected: usize,
        actual: usize,
    },
    #[error("chunk length {} outside 1..={max}", .header.chunk_len)]
    InvalidChunkLength { header: DataHeader, max: u32 },
    #[error("DATA declares {} payload bytes but {available} follow", .header.chunk_len)]
    PayloadMismatch { header: DataHeader, available: usize },
}

impl PacketError {
    /// The parsed DATA header, when decoding failed after the header was read.
    pub fn data_header(&self) -> Option<&DataHeader> {
        match self {
            Self::InvalidChunkLength { header, .. } | Self::PayloadMismatch { header, .. } => {
                Some(header)
            }
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Field helpers
// ---------------------------------------------------------------------------

fn ne_u64(buf: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[off..off + 8]);
    u64::from_ne_bytes(b)
}

fn be_u64(buf: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[off..off + 8]);
    u64::from_be_bytes(b)
}

fn be_u32(buf: &[u8], off: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[off..off + 4]);
    u32::from_be_bytes(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: u32 = MAX_CHUNK_LEN;

    fn data(session_id: u64, chunk_index: u64, payload: &[u8]) -> Packet {
        Packet::Data {
            session_id,
            chunk_index,
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn every_kind_roundtrips() {
        let packets = [
            Packet::Conn {
                session_id: 42,
                protocol_id: 3,
                total_len: 1 << 40,
            },
            Packet::ConAcc { session_id: 42 },
            Packet::ConRjt { session_id: u64::MAX },
            data(42, 7, b"hello"),
            Packet::Acc {
                session_id: 42,
                chunk_index: 7,
            },
            Packet::Rjt {
                session_id: 42,
                chunk_index: u64::MAX,
            },
            Packet::Rcvd { session_id: 0 },
        ];
        for pkt in packets {
            let bytes = pkt.encode();
            assert_eq!(bytes.len(), pkt.encoded_len(), "{pkt}");
            assert_eq!(Packet::decode(&bytes, MAX), Ok(pkt));
        }
    }

    #[test]
    fn chunk_length_boundaries_roundtrip() {
        let smallest = data(1, 0, &[0xab]);
        assert_eq!(Packet::decode(&smallest.encode(), MAX), Ok(smallest));

        let largest = data(1, 1, &vec![0x5a; MAX as usize]);
        let bytes = largest.encode();
        assert_eq!(bytes.len(), DATA_HEADER_LEN + MAX as usize);
        assert_eq!(Packet::decode(&bytes, MAX), Ok(largest));
    }

    #[test]
    fn fixed_sizes_match_packed_layout() {
        assert_eq!(Packet::ConAcc { session_id: 1 }.encode().len(), 9);
        assert_eq!(Packet::Rcvd { session_id: 1 }.encode().len(), 9);
        assert_eq!(
            Packet::Acc {
                session_id: 1,
                chunk_index: 1
            }
            .encode()
            .len(),
            17
        );
        let conn = Packet::Conn {
            session_id: 1,
            protocol_id: 1,
            total_len: 1,
        };
        assert_eq!(conn.encode().len(), 18);
    }

    #[test]
    fn byte_order_per_field() {
        let bytes = Packet::Data {
            session_id: 0x0102_0304_0506_0708,
            chunk_index: 0x1112_1314_1516_1718,
            payload: vec![0; 0x0102],
        }
        .encode();
        assert_eq!(bytes[0], kind::DATA);
        assert_eq!(&bytes[1..9], &0x0102_0304_0506_0708u64.to_ne_bytes());
        assert_eq!(
            &bytes[9..17],
            &[0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17, 0x18]
        );
        assert_eq!(&bytes[17..21], &[0x00, 0x00, 0x01, 0x02]);

        let conn = Packet::Conn {
            session_id: 9,
            protocol_id: 2,
            total_len: 0x0a0b,
        }
        .encode();
        assert_eq!(conn[9], 2);
        assert_eq!(&conn[10..18], &[0, 0, 0, 0, 0, 0, 0x0a, 0x0b]);
    }

    #[test]
    fn short_fixed_packet_is_an_error() {
        let mut bytes = Packet::Acc {
            session_id: 5,
            chunk_index: 1,
        }
        .encode();
        bytes.pop();
        assert_eq!(
            Packet::decode(&bytes, MAX),
            Err(PacketError::WrongLength {
                kind: PacketKind::Acc,
                expected: CHUNK_REPLY_LEN,
                actual: CHUNK_REPLY_LEN - 1,
            })
        );
    }

    #[test]
    fn oversized_fixed_packet_is_an_error() {
        let mut bytes = Packet::Rcvd { session_id: 5 }.encode();
        bytes.push(0);
        assert!(matches!(
            Packet::decode(&bytes, MAX),
            Err(PacketError::WrongLength { .. })
        ));
    }

    #[test]
    fn empty_and_unknown_buffers_are_errors() {
        assert_eq!(Packet::decode(&[], MAX), Err(PacketError::Empty));
        assert_eq!(
            Packet::decode(&[0u8; 9], MAX),
            Err(PacketError::UnknownType(0))
        );
        assert_eq!(
            Packet::decode(&[8u8; 9], MAX),
            Err(PacketError::UnknownType(8))
        );
    }

    #[test]
    fn zero_length_chunk_is_rejected_with_header() {
        let bytes = data(3, 4, b"").encode();
        assert_eq!(bytes.len(), DATA_HEADER_LEN);
        let err = Packet::decode(&bytes, MAX).unwrap_err();
        assert_eq!(
            err.data_header(),
            Some(&DataHeader {
                session_id: 3,
                chunk_index: 4,
                chunk_len: 0
            })
        );
        assert!(matches!(err, PacketError::InvalidChunkLength { .. }));
    }

    #[test]
    fn chunk_above_limit_is_rejected() {
        let bytes = data(3, 0, &[1, 2, 3, 4, 5]).encode();
        assert!(Packet::decode(&bytes, 5).is_ok());
        assert!(matches!(
            Packet::decode(&bytes, 4),
            Err(PacketError::InvalidChunkLength { max: 4, .. })
        ));
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let mut bytes = data(3, 0, b"data").encode();
        bytes.pop();
        assert!(matches!(
            Packet::decode(&bytes, MAX),
            Err(PacketError::PayloadMismatch { available: 3, .. })
        ));
    }

    #[test]
    fn data_header_needs_full_prefix() {
        let bytes = data(3, 0, b"data").encode();
        assert!(DataHeader::decode(&bytes[..DATA_HEADER_LEN]).is_ok());
        assert!(matches!(
            DataHeader::decode(&bytes[..DATA_HEADER_LEN - 1]),
            Err(PacketError::WrongLength { .. })
        ));
        assert!(matches!(
            DataHeader::decode(&Packet::Rcvd { session_id: 3 }.encode()),
            Err(PacketError::UnexpectedType { .. })
        ));
    }

    #[test]
    fn kind_tags_roundtrip() {
        for tag in 1..=7u8 {
            let kind = PacketKind::from_tag(tag).unwrap();
            assert_eq!(kind.tag(), tag);
        }
        assert_eq!(PacketKind::from_tag(0), None);
    }
}
