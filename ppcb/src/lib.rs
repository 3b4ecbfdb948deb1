//! `ppcb`: a packet-oriented byte-transfer protocol over TCP, UDP, and
//! UDP with stop-and-wait retransmission (UDPR).
//!
//! # Architecture
//!
//! ```text
//!  ┌──────────┐    DATA     ┌──────────┐
//!  │  Sender  │────────────▶│ Receiver │
//!  └────┬─────┘             └─────┬────┘
//!       │     CONACC/ACC/RCVD     │
//!       │◀────────────────────────┘
//!       │
//!  ┌────▼────────────┐     ┌─────────────────────────┐
//!  │     Client      │     │  TcpServer / Datagram-  │
//!  │ (one session)   │     │  Server (per-session    │
//!  └────┬────────────┘     │  state machines)        │
//!       │                  └────────────┬────────────┘
//!  ┌────▼──────┐  ┌───────────┐         │
//!  │  Stream   │  │  Socket   │◀────────┘
//!  │  (TCP)    │  │ (UDP/UDPR)│  ◀── Simulator (tests)
//!  └───────────┘  └───────────┘
//! ```
//!
//! Each module has a single responsibility:
//! - [`packet`]      wire format (serialise / deserialise)
//! - [`config`]      transports and tunables
//! - [`connection`]  session errors and handshake reply rules
//! - [`client`]      sending-side state machine for all transports
//! - [`server`]      TCP and datagram listeners
//! - [`sender`]      chunking and the in-flight chunk
//! - [`receiver`]    chunk validation and reassembly
//! - [`state`]       finite-state-machine types
//! - [`timer`]       UDPR retransmit budget
//! - [`shutdown`]    cancellation token
//! - [`socket`]      async datagram socket abstraction
//! - [`stream`]      packet framing over TCP
//! - [`simulator`]   lossy network layer for testing

pub mod client;
pub mod config;
pub mod connection;
pub mod packet;
pub mod receiver;
pub mod sender;
pub mod server;
pub mod shutdown;
pub mod simulator;
pub mod socket;
pub mod state;
pub mod stream;
pub mod timer;

pub use client::{Client, ClientReport};
pub use config::{Config, Protocol};
pub use connection::ConnError;
pub use packet::Packet;
pub use server::{DatagramServer, SessionReport, TcpServer};
