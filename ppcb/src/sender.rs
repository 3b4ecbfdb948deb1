//! Outbound chunk state for stop-and-wait delivery.
//!
//! [`Sender`] splits the payload into chunks and tracks the single in-flight
//! DATA packet.  It does **not** touch the socket; [`crate::client`] calls
//! these methods and owns the actual send/receive loop.
//!
//! # Stop-and-wait contract (UDPR)
//! - At most **one** chunk is in flight at any moment (`unacked`).
//! - The next chunk may only be sent once `unacked` is `None`.
//! - On ACC for the in-flight index: clear `unacked`.
//! - On timeout: resend the same packet unchanged.
//!
//! TCP and plain UDP only use the chunking half.

use crate::packet::Packet;

// ---------------------------------------------------------------------------
// Chunking
// ---------------------------------------------------------------------------

/// One slice of the payload and its position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk<'a> {
    pub index: u64,
    pub bytes: &'a [u8],
}

/// Iterator over the chunks of a payload: indices start at 0, every chunk
/// but the last is exactly `max_chunk` bytes, and none is empty.
#[derive(Debug, Clone)]
pub struct Chunks<'a> {
    rest: &'a [u8],
    max_chunk: usize,
    next_index: u64,
}

pub fn chunks(payload: &[u8], max_chunk: u32) -> Chunks<'_> {
    Chunks {
        rest: payload,
        max_chunk: (max_chunk as usize).max(1),
        next_index: 0,
    }
}

impl<'a> Iterator for Chunks<'a> {
    type Item = Chunk<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.is_empty() {
            return None;
        }
        let (bytes, rest) = self.rest.split_at(self.rest.len().min(self.max_chunk));
        self.rest = rest;
        let chunk = Chunk {
            index: self.next_index,
            bytes,
        };
        self.next_index += 1;
        Some(chunk)
    }
}

// ---------------------------------------------------------------------------
// RetransmitEntry
// ---------------------------------------------------------------------------

/// A DATA packet that has been sent but not yet acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetransmitEntry {
    pub packet: Packet,
    pub chunk_index: u64,
}

/// What the sender makes of a packet while a chunk is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkReply {
    /// ACC for the in-flight chunk.
    Acked,
    /// A replayed CONACC, or ACC for an earlier chunk.
    Stale,
    /// RJT for the in-flight chunk.
    Rejected { chunk_index: u64 },
    /// RCVD while the last chunk is in flight: its ACC was lost.
    Completed,
    /// Anything else, including packets of other sessions.
    Unexpected,
}

// ---------------------------------------------------------------------------
// Sender
// ---------------------------------------------------------------------------

/// Send-side state for one session.
#[derive(Debug)]
pub struct Sender<'a> {
    session_id: u64,
    chunks: std::iter::Peekable<Chunks<'a>>,
    /// The in-flight chunk, or `None` when the sender is idle.
    unacked: Option<RetransmitEntry>,
}

impl<'a> Sender<'a> {
    pub fn new(session_id: u64, payload: &'a [u8], max_chunk: u32) -> Self {
        Self {
            session_id,
            chunks: chunks(payload, max_chunk).peekable(),
            unacked: None,
        }
    }

    /// Build the DATA packet for the next chunk, or `None` when every chunk
    /// has been produced.
    pub fn next_packet(&mut self) -> Option<Packet> {
        debug_assert!(self.unacked.is_none(), "next chunk requested while one is in flight");
        let chunk = self.chunks.next()?;
        Some(Packet::Data {
            session_id: self.session_id,
            chunk_index: chunk.index,
            payload: chunk.bytes.to_vec(),
        })
    }

    /// `true` once the final chunk has been produced.
    pub fn is_exhausted(&mut self) -> bool {
        self.chunks.peek().is_none()
    }

    /// Move `packet` into the in-flight slot.
    pub fn record_sent(&mut self, packet: Packet) {
        debug_assert!(self.unacked.is_none());
        let chunk_index = match packet {
            Packet::Data { chunk_index, .. } => chunk_index,
            _ => 0,
        };
        self.unacked = Some(RetransmitEntry {
            packet,
            chunk_index,
        });
    }

    pub fn in_flight(&self) -> Option<&Packet> {
        self.unacked.as_ref().map(|e| &e.packet)
    }

    pub fn in_flight_index(&self) -> Option<u64> {
        self.unacked.as_ref().map(|e| e.chunk_index)
    }

    /// Classify `packet` against the in-flight chunk.
    pub fn on_reply(&mut self, packet: &Packet) -> ChunkReply {
        let Some(current) = self.in_flight_index() else {
            return ChunkReply::Unexpected;
        };
        if packet.session_id() != self.session_id {
            return ChunkReply::Unexpected;
        }
        match *packet {
            Packet::Acc { chunk_index, .. } if chunk_index == current => ChunkReply::Acked,
            Packet::Acc { chunk_index, .. } if chunk_index < current => ChunkReply::Stale,
            Packet::ConAcc { .. } => ChunkReply::Stale,
            Packet::Rjt { chunk_index, .. } if chunk_index == current => {
                ChunkReply::Rejected { chunk_index }
            }
            Packet::Rcvd { .. } if self.is_exhausted() => ChunkReply::Completed,
            _ => ChunkReply::Unexpected,
        }
    }

    /// Clear the in-flight slot after its ACC.
    pub fn on_ack(&mut self) {
        self.unacked = None;
    }
}
