//! Session finite-state-machine types.
//!
//! Transitions are driven by [`crate::client`] and [`crate::server`]; this
//! module only names the states and the success path between them, so the
//! drivers can log every step and assert they never skip one.  Any failure
//! leaves the session wherever it was and ends it.
//!
//! ```text
//!  client:  Idle ──CONN──▶ AwaitingConack ──CONACC──▶ Established ──RCVD──▶ Completed
//!
//!  server:  Listening ──▶ AwaitingConn ──CONN──▶ AwaitingData ──last chunk──▶
//!           AwaitingCompletion ──RCVD sent──▶ Closed
//! ```

use std::fmt;

/// States of the sending side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientState {
    #[default]
    Idle,
    /// CONN sent; waiting for CONACC or CONRJT.
    AwaitingConack,
    /// Chunks are being sent, then RCVD is awaited.
    Established,
    Completed,
}

impl ClientState {
    /// The state that follows `self` on the success path.
    pub fn successor(self) -> Option<Self> {
        match self {
            Self::Idle => Some(Self::AwaitingConack),
            Self::AwaitingConack => Some(Self::Established),
            Self::Established => Some(Self::Completed),
            Self::Completed => None,
        }
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "IDLE",
            Self::AwaitingConack => "AWAITING_CONACC",
            Self::Established => "ESTABLISHED",
            Self::Completed => "COMPLETED",
        })
    }
}

/// States of one receiving session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServerState {
    #[default]
    Listening,
    /// A connection (TCP) or the listening socket (UDP) is waiting for CONN.
    AwaitingConn,
    AwaitingData,
    /// Every byte arrived; RCVD is being sent.
    AwaitingCompletion,
    Closed,
}

impl ServerState {
    pub fn successor(self) -> Option<Self> {
        match self {
            Self::Listening => Some(Self::AwaitingConn),
            Self::AwaitingConn => Some(Self::AwaitingData),
            Self::AwaitingData => Some(Self::AwaitingCompletion),
            Self::AwaitingCompletion => Some(Self::Closed),
            Self::Closed => None,
        }
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Listening => "LISTENING",
            Self::AwaitingConn => "AWAITING_CONN",
            Self::AwaitingData => "AWAITING_DATA",
            Self::AwaitingCompletion => "AWAITING_COMPLETION",
            Self::Closed => "CLOSED",
        })
    }
}
