//! Session tunables and transport selection.
//!
//! A [`Config`] is built once (from CLI flags in `main.rs`, or by hand in
//! tests) and validated before any socket is created.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::packet::MAX_CHUNK_LEN;

/// Idle timeout applied to every send and receive.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Retransmissions allowed per wait before a UDPR session gives up.
pub const DEFAULT_MAX_RETRANSMITS: u32 = 15;

// ---------------------------------------------------------------------------
// Protocol
// ---------------------------------------------------------------------------

/// Transport a session runs over.  The discriminant is the wire protocol id
/// carried in CONN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
#[repr(u8)]
pub enum Protocol {
    /// Stream transport; the kernel provides reliability.
    Tcp = 1,
    /// Datagram transport, best effort.
    Udp = 2,
    /// Datagram transport with stop-and-wait retransmission.
    Udpr = 3,
}

impl Protocol {
    pub fn id(self) -> u8 {
        self as u8
    }

    /// `true` for the transports that share one unconnected UDP socket.
    pub fn is_datagram(self) -> bool {
        matches!(self, Self::Udp | Self::Udpr)
    }
}

impl TryFrom<u8> for Protocol {
    type Error = ConfigError;

    fn try_from(id: u8) -> Result<Self, Self::Error> {
        match id {
            1 => Ok(Self::Tcp),
            2 => Ok(Self::Udp),
            3 => Ok(Self::Udpr),
            other => Err(ConfigError::UnknownProtocolId(other)),
        }
    }
}

impl FromStr for Protocol {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            "udpr" => Ok(Self::Udpr),
            other => Err(ConfigError::UnknownProtocol(other.to_owned())),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Udpr => "udpr",
        })
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Adjustable session parameters shared by client and server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Idle timeout for one blocking send or receive wait.
    pub timeout: Duration,
    /// UDPR retransmissions allowed per wait (CONN, DATA, or ack replay).
    pub max_retransmits: u32,
    /// Largest chunk the client sends and the server accepts.
    pub max_chunk: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            max_retransmits: DEFAULT_MAX_RETRANSMITS,
            max_chunk: MAX_CHUNK_LEN,
        }
    }
}

impl Config {
    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        if !(1..=MAX_CHUNK_LEN).contains(&self.max_chunk) {
            return Err(ConfigError::ChunkSize(self.max_chunk));
        }
        Ok(())
    }
}

/// Parse a port number, rejecting 0 and values above `u16::MAX`.
pub fn parse_port(s: &str) -> Result<u16, ConfigError> {
    match s.parse::<u16>() {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(ConfigError::Port(s.to_owned())),
    }
}

/// Usage and configuration errors, reported before any socket I/O.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("protocol {0} is not supported")]
    UnknownProtocol(String),
    #[error("unknown protocol id {0}")]
    UnknownProtocolId(u8),
    #[error("protocol {0} is not served by this command")]
    UnsupportedProtocol(Protocol),
    #[error("{0} is not a valid port number")]
    Port(String),
    #[error("timeout must be non-zero")]
    ZeroTimeout,
    #[error("chunk size {0} outside 1..={max}", max = MAX_CHUNK_LEN)]
    ChunkSize(u32),
}
