//! Session-level errors and the connection handshake rules shared by every
//! transport.
//!
//! The per-transport state machines in [`crate::client`] and
//! [`crate::server`] feed the packets they receive through the classifiers
//! here and then apply their own policy: TCP and plain UDP treat anything
//! unexpected as fatal, UDPR ignores it and keeps waiting.

use thiserror::Error;

use crate::config::{ConfigError, Protocol};
use crate::packet::{Packet, PacketError, PacketKind};
use crate::socket::SocketError;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Why a session ended without completing.
#[derive(Debug, Error)]
pub enum ConnError {
    /// Transport failure: timeout, peer close, short transfer, or OS error.
    #[error(transparent)]
    Socket(#[from] SocketError),
    #[error("malformed packet: {0}")]
    Packet(#[from] PacketError),
    /// The server answered CONN with CONRJT.
    #[error("connection rejected (session {session_id})")]
    ConnectionRejected { session_id: u64 },
    /// The server answered a chunk with RJT.
    #[error("data rejected (session {session_id}, chunk {chunk_index})")]
    DataRejected { session_id: u64, chunk_index: u64 },
    /// The server refused a chunk of the session it was receiving.
    #[error("invalid chunk {chunk_index} in session {session_id}")]
    InvalidChunk { session_id: u64, chunk_index: u64 },
    /// A well-formed packet arrived where no rule accepts it.
    #[error("invalid package: expected {expected}, got {got}")]
    InvalidPacket { expected: PacketKind, got: String },
    #[error("session {session_id} declares protocol {actual}, listener serves {expected}")]
    UnexpectedProtocol {
        session_id: u64,
        expected: Protocol,
        actual: u8,
    },
    /// The retransmit budget ran out.
    #[error("timeout after {retransmits} retransmissions")]
    Timeout { retransmits: u32 },
    #[error("cancelled")]
    Cancelled,
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ConnError {
    /// `true` when the peer explicitly refused the session or its data, as
    /// opposed to the session failing.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::ConnectionRejected { .. } | Self::DataRejected { .. }
        )
    }

    /// `true` for both a single expired wait and an exhausted retransmit
    /// budget.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Socket(SocketError::Timeout)
        )
    }
}

/// Build the protocol-violation error for `got` arriving while waiting for
/// `expected`.
pub fn unexpected(got: &Packet, expected: PacketKind) -> ConnError {
    ConnError::InvalidPacket {
        expected,
        got: got.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Reply classification
// ---------------------------------------------------------------------------

/// What a client makes of a packet while waiting for CONACC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnReply {
    Accepted,
    Rejected,
    Other,
}

pub fn conn_reply(packet: &Packet, session_id: u64) -> ConnReply {
    match *packet {
        Packet::ConAcc { session_id: sid } if sid == session_id => ConnReply::Accepted,
        Packet::ConRjt { session_id: sid } if sid == session_id => ConnReply::Rejected,
        _ => ConnReply::Other,
    }
}

/// What a client makes of a packet while waiting for RCVD.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalReply {
    Received,
    Rejected { chunk_index: u64 },
    /// A replayed CONACC or ACC of this session; harmless on UDPR.
    Duplicate,
    Other,
}

pub fn final_reply(packet: &Packet, session_id: u64) -> FinalReply {
    if packet.session_id() != session_id {
        return FinalReply::Other;
    }
    match *packet {
        Packet::Rcvd { .. } => FinalReply::Received,
        Packet::Rjt { chunk_index, .. } => FinalReply::Rejected { chunk_index },
        Packet::ConAcc { .. } | Packet::Acc { .. } => FinalReply::Duplicate,
        _ => FinalReply::Other,
    }
}

/// Strict CONACC check used by the transports without recovery.
pub fn expect_conacc(packet: &Packet, session_id: u64) -> Result<(), ConnError> {
    match conn_reply(packet, session_id) {
        ConnReply::Accepted => Ok(()),
        ConnReply::Rejected => Err(ConnError::ConnectionRejected { session_id }),
        ConnReply::Other => Err(unexpected(packet, PacketKind::ConAcc)),
    }
}

/// Strict RCVD check used by the transports without recovery.
pub fn expect_rcvd(packet: &Packet, session_id: u64) -> Result<(), ConnError> {
    match final_reply(packet, session_id) {
        FinalReply::Received => Ok(()),
        FinalReply::Rejected { chunk_index } => Err(ConnError::DataRejected {
            session_id,
            chunk_index,
        }),
        FinalReply::Duplicate | FinalReply::Other => Err(unexpected(packet, PacketKind::Rcvd)),
    }
}
