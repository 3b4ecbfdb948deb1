//! Inbound chunk validation and reassembly.
//!
//! [`Receiver`] decides what happens to each DATA header the server sees
//! while a session is active, and accumulates accepted payload bytes in
//! order.  It does not send anything itself; it tells
//! [`crate::server`] which reply the chunk deserves.

use crate::packet::{DataHeader, Packet};

/// Decision for one inbound DATA header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The next expected chunk with a legal length.
    Accept,
    /// A chunk this session already accepted (UDPR only); re-acknowledge it.
    Duplicate,
    /// Answer with RJT.  `abort` is set when the chunk belongs to the active
    /// session, which then ends.
    Reject { abort: bool },
}

/// Receive-side state for one session.
#[derive(Debug)]
pub struct Receiver {
    session_id: u64,
    max_chunk: u32,
    /// UDPR tolerates replays of accepted chunks.
    reliable: bool,
    /// Index of the next chunk to accept.
    expected: u64,
    bytes_remaining: u64,
    payload: Vec<u8>,
}

impl Receiver {
    pub fn new(session_id: u64, total_len: u64, max_chunk: u32, reliable: bool) -> Self {
        Self {
            session_id,
            max_chunk,
            reliable,
            expected: 0,
            bytes_remaining: total_len,
            payload: Vec::new(),
        }
    }

    pub fn classify(&self, header: &DataHeader) -> Verdict {
        if header.session_id != self.session_id {
            return Verdict::Reject { abort: false };
        }
        if !header.chunk_len_valid(self.max_chunk) {
            return Verdict::Reject { abort: true };
        }
        if header.chunk_index == self.expected {
            if u64::from(header.chunk_len) > self.bytes_remaining {
                return Verdict::Reject { abort: true };
            }
            return Verdict::Accept;
        }
        if self.reliable && header.chunk_index < self.expected {
            return Verdict::Duplicate;
        }
        Verdict::Reject { abort: true }
    }

    /// Append an accepted chunk.  Call only after [`Verdict::Accept`].
    pub fn accept(&mut self, chunk_index: u64, bytes: &[u8]) {
        debug_assert_eq!(chunk_index, self.expected);
        self.payload.extend_from_slice(bytes);
        self.bytes_remaining = self.bytes_remaining.saturating_sub(bytes.len() as u64);
        self.expected += 1;
    }

    pub fn is_complete(&self) -> bool {
        self.bytes_remaining == 0
    }

    pub fn expected(&self) -> u64 {
        self.expected
    }

    pub fn bytes_remaining(&self) -> u64 {
        self.bytes_remaining
    }

    /// The packet that acknowledged the latest progress: CONACC before any
    /// chunk, otherwise ACC for the last accepted chunk.
    pub fn last_ack(&self) -> Packet {
        match self.expected.checked_sub(1) {
            None => Packet::ConAcc {
                session_id: self.session_id,
            },
            Some(chunk_index) => Packet::Acc {
                session_id: self.session_id,
                chunk_index,
            },
        }
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }
}
