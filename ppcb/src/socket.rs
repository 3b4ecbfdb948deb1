//! Async datagram socket abstraction.
//!
//! [`Socket`] wraps anything implementing [`DatagramSocket`] (normally a
//! `tokio::net::UdpSocket`, or a [`crate::simulator::Simulator`] in tests)
//! and speaks [`Packet`] instead of raw bytes.  All protocol logic lives
//! elsewhere; this module owns only byte I/O and the per-wait deadline.
//!
//! [`SocketError`] is shared with the stream transport in [`crate::stream`]
//! so both report the same four outcomes.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time::{timeout, timeout_at, Instant};

use crate::config::Config;
use crate::packet::{Packet, PacketError};

/// Receive buffer size; large enough for any UDP payload.
pub const MAX_DATAGRAM: usize = 65_536;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Outcome of a failed send or receive.
#[derive(Debug, Error)]
pub enum SocketError {
    /// No progress before the deadline.
    #[error("timed out")]
    Timeout,
    /// The peer closed the connection before any byte of the request moved.
    #[error("connection closed by peer")]
    Closed,
    /// Some, but not all, of the requested bytes were transferred.
    #[error("incomplete transfer: {actual} of {expected} bytes")]
    Incomplete { expected: usize, actual: usize },
    #[error("socket I/O error: {0}")]
    Io(#[from] io::Error),
}

impl SocketError {
    /// Map an OS error, folding resets and broken pipes into [`Self::Closed`].
    pub fn from_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => Self::Closed,
            _ => Self::Io(err),
        }
    }
}

// ---------------------------------------------------------------------------
// DatagramSocket
// ---------------------------------------------------------------------------

/// The raw datagram operations [`Socket`] needs.
///
/// Implemented for `tokio::net::UdpSocket`; the fault-injecting simulator
/// implements it by wrapping another `DatagramSocket`.
pub trait DatagramSocket: Send + Sync {
    fn send_to(
        &self,
        buf: &[u8],
        target: SocketAddr,
    ) -> impl Future<Output = io::Result<usize>> + Send;

    fn recv_from(
        &self,
        buf: &mut [u8],
    ) -> impl Future<Output = io::Result<(usize, SocketAddr)>> + Send;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl DatagramSocket for UdpSocket {
    fn send_to(
        &self,
        buf: &[u8],
        target: SocketAddr,
    ) -> impl Future<Output = io::Result<usize>> + Send {
        UdpSocket::send_to(self, buf, target)
    }

    fn recv_from(
        &self,
        buf: &mut [u8],
    ) -> impl Future<Output = io::Result<(usize, SocketAddr)>> + Send {
        UdpSocket::recv_from(self, buf)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}

// ---------------------------------------------------------------------------
// Socket
// ---------------------------------------------------------------------------

/// One received datagram.  Decoding failures are handed back instead of
/// being raised, because whether they are fatal depends on the transport.
#[derive(Debug)]
pub struct Datagram {
    pub peer: SocketAddr,
    pub packet: Result<Packet, PacketError>,
}

/// An async, packet-oriented datagram socket.
#[derive(Debug)]
pub struct Socket<S = UdpSocket> {
    /// Address this socket is bound to (filled in after the OS assigns an
    /// ephemeral port).
    pub local_addr: SocketAddr,
    inner: S,
    timeout: Duration,
    max_chunk: u32,
    buf: Box<[u8]>,
}

impl Socket<UdpSocket> {
    /// Bind a new UDP socket to `local_addr`.
    ///
    /// Passing `0.0.0.0:0` lets the OS choose an ephemeral port.
    pub async fn bind(local_addr: SocketAddr, cfg: &Config) -> Result<Self, SocketError> {
        let inner = UdpSocket::bind(local_addr).await?;
        Self::new(inner, cfg)
    }
}

impl<S: DatagramSocket> Socket<S> {
    pub fn new(inner: S, cfg: &Config) -> Result<Self, SocketError> {
        let local_addr = inner.local_addr()?;
        Ok(Self {
            local_addr,
            inner,
            timeout: cfg.timeout,
            max_chunk: cfg.max_chunk,
            buf: vec![0u8; MAX_DATAGRAM].into_boxed_slice(),
        })
    }

    /// Encode `packet` and send it as a single datagram to `dest`.
    ///
    /// Returns the number of bytes put on the wire.
    pub async fn send_to(&self, packet: &Packet, dest: SocketAddr) -> Result<usize, SocketError> {
        let bytes = packet.encode();
        let sent = timeout(self.timeout, self.inner.send_to(&bytes, dest))
            .await
            .map_err(|_| SocketError::Timeout)??;
        if sent != bytes.len() {
            return Err(SocketError::Incomplete {
                expected: bytes.len(),
                actual: sent,
            });
        }
        Ok(sent)
    }

    /// Receive the next datagram, waiting no longer than `deadline`.
    pub async fn recv_until(&mut self, deadline: Instant) -> Result<Datagram, SocketError> {
        let (n, peer) = timeout_at(deadline, self.inner.recv_from(&mut self.buf))
            .await
            .map_err(|_| SocketError::Timeout)??;
        Ok(Datagram {
            peer,
            packet: Packet::decode(&self.buf[..n], self.max_chunk),
        })
    }

    /// Receive the next datagram within one idle timeout.
    pub async fn recv(&mut self) -> Result<Datagram, SocketError> {
        let deadline = Instant::now() + self.timeout;
        self.recv_until(deadline).await
    }
}
