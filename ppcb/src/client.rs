//! Sending side of a PPCB session.
//!
//! [`Client::send`] opens one session to a server, transfers the payload
//! chunk by chunk, and returns a [`ClientReport`] once the server confirms
//! with RCVD.  The three transports share the same shape:
//!
//! ```text
//!  CONN ─▶ ◀─ CONACC │ DATA 0 ─▶ [◀─ ACC 0] │ ... │ DATA n ─▶ [◀─ ACC n] │ ◀─ RCVD
//! ```
//!
//! and differ only in what happens when something goes wrong.  TCP and UDP
//! fail on the first unexpected packet or timeout.  UDPR retransmits on
//! timeout, skips malformed datagrams and replayed acknowledgements of its
//! own session, and still aborts on any other well-formed packet (the
//! bracketed ACCs are UDPR only).

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;

use crate::config::{Config, Protocol};
use crate::connection::{self, ConnError, ConnReply, FinalReply};
use crate::packet::{Packet, PacketKind};
use crate::sender::{ChunkReply, Sender};
use crate::shutdown::Shutdown;
use crate::socket::{DatagramSocket, Socket, SocketError};
use crate::state::ClientState;
use crate::stream::Stream;
use crate::timer::RetransmitTimer;

/// Summary of a completed session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientReport {
    pub session_id: u64,
    pub protocol: Protocol,
    pub state: ClientState,
    /// DATA packets sent for the first time.
    pub chunks: u64,
    /// Every byte put on the wire, retransmissions included.
    pub bytes_sent: u64,
    pub retransmits: u32,
    pub elapsed: Duration,
}

/// Per-session bookkeeping shared by the transport loops.
struct Progress {
    session_id: u64,
    protocol: Protocol,
    state: ClientState,
    chunks: u64,
    bytes_sent: u64,
    started: Instant,
}

impl Progress {
    fn new(protocol: Protocol, session_id: u64) -> Self {
        Self {
            session_id,
            protocol,
            state: ClientState::Idle,
            chunks: 0,
            bytes_sent: 0,
            started: Instant::now(),
        }
    }

    fn advance(&mut self, next: ClientState) {
        debug_assert_eq!(self.state.successor(), Some(next));
        log::debug!(
            "[{}] session {}: {} → {}",
            self.protocol,
            self.session_id,
            self.state,
            next
        );
        self.state = next;
    }

    fn sent(&mut self, bytes: usize) {
        self.bytes_sent += bytes as u64;
    }

    fn finish(self, retransmits: u32) -> ClientReport {
        ClientReport {
            session_id: self.session_id,
            protocol: self.protocol,
            state: self.state,
            chunks: self.chunks,
            bytes_sent: self.bytes_sent,
            retransmits,
            elapsed: self.started.elapsed(),
        }
    }
}

/// Sends payloads to PPCB servers.
#[derive(Debug, Clone)]
pub struct Client {
    cfg: Config,
    shutdown: Shutdown,
}

impl Client {
    pub fn new(cfg: Config, shutdown: Shutdown) -> Result<Self, ConnError> {
        cfg.validate()?;
        Ok(Self { cfg, shutdown })
    }

    /// Run one session over `protocol` to `server`.
    pub async fn send(
        &mut self,
        protocol: Protocol,
        server: SocketAddr,
        session_id: u64,
        payload: &[u8],
    ) -> Result<ClientReport, ConnError> {
        match protocol {
            Protocol::Tcp => {
                let stream = self
                    .shutdown
                    .guard(Stream::connect(server, &self.cfg))
                    .await?;
                log::info!("[tcp] connected to {server}");
                self.send_stream(stream, session_id, payload).await
            }
            Protocol::Udp | Protocol::Udpr => {
                let local = SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0));
                let socket = Socket::bind(local, &self.cfg).await?;
                self.send_datagram(socket, protocol, server, session_id, payload)
                    .await
            }
        }
    }

    // -----------------------------------------------------------------------
    // TCP
    // -----------------------------------------------------------------------

    /// Run a TCP session over an already connected stream.
    pub async fn send_stream<S>(
        &mut self,
        mut stream: Stream<S>,
        session_id: u64,
        payload: &[u8],
    ) -> Result<ClientReport, ConnError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let shutdown = &mut self.shutdown;
        let mut progress = Progress::new(Protocol::Tcp, session_id);

        let conn = Packet::Conn {
            session_id,
            protocol_id: Protocol::Tcp.id(),
            total_len: payload.len() as u64,
        };
        progress.sent(shutdown.guard(stream.send_packet(&conn)).await?);
        log::debug!("[tcp] → {conn}");
        progress.advance(ClientState::AwaitingConack);

        let reply = shutdown.guard(stream.recv_packet()).await?;
        log::debug!("[tcp] ← {reply}");
        connection::expect_conacc(&reply, session_id)?;
        progress.advance(ClientState::Established);

        let mut sender = Sender::new(session_id, payload, self.cfg.max_chunk);
        while let Some(packet) = sender.next_packet() {
            match shutdown.guard(stream.send_packet(&packet)).await {
                Ok(n) => {
                    progress.sent(n);
                    progress.chunks += 1;
                    log::debug!("[tcp] → {packet}");
                }
                Err(ConnError::Socket(SocketError::Closed)) => {
                    // The server may have refused an earlier chunk and hung up;
                    // its RJT is still readable.
                    log::warn!("[tcp] server closed the connection mid-transfer");
                    return Err(match shutdown.guard(stream.recv_packet()).await {
                        Ok(Packet::Rjt {
                            session_id: sid,
                            chunk_index,
                        }) if sid == session_id => ConnError::DataRejected {
                            session_id,
                            chunk_index,
                        },
                        _ => ConnError::Socket(SocketError::Closed),
                    });
                }
                Err(e) => return Err(e),
            }
        }

        let reply = shutdown.guard(stream.recv_packet()).await?;
        log::debug!("[tcp] ← {reply}");
        connection::expect_rcvd(&reply, session_id)?;
        progress.advance(ClientState::Completed);
        Ok(progress.finish(0))
    }

    // -----------------------------------------------------------------------
    // UDP / UDPR
    // -----------------------------------------------------------------------

    /// Run a UDP or UDPR session from `socket` to `server`.
    pub async fn send_datagram<S: DatagramSocket>(
        &mut self,
        mut socket: Socket<S>,
        protocol: Protocol,
        server: SocketAddr,
        session_id: u64,
        payload: &[u8],
    ) -> Result<ClientReport, ConnError> {
        if !protocol.is_datagram() {
            return Err(ConnError::Config(
                crate::config::ConfigError::UnsupportedProtocol(protocol),
            ));
        }
        let reliable = protocol == Protocol::Udpr;
        let shutdown = &mut self.shutdown;
        let mut progress = Progress::new(protocol, session_id);
        let mut timer = RetransmitTimer::new(&self.cfg);

        // Handshake.
        let conn = Packet::Conn {
            session_id,
            protocol_id: protocol.id(),
            total_len: payload.len() as u64,
        };
        progress.sent(shutdown.guard(socket.send_to(&conn, server)).await?);
        log::debug!("[{protocol}] → {conn}");
        progress.advance(ClientState::AwaitingConack);

        let mut deadline = timer.arm();
        loop {
            let dgram = match shutdown.guard(socket.recv_until(deadline)).await {
                Ok(d) => d,
                Err(ConnError::Socket(SocketError::Timeout)) if reliable => {
                    let attempt = timer.on_timeout()?;
                    log::debug!("[udpr] no CONACC; resending CONN (retransmit {attempt})");
                    progress.sent(shutdown.guard(socket.send_to(&conn, server)).await?);
                    deadline = timer.arm();
                    continue;
                }
                Err(e) => return Err(e),
            };
            if dgram.peer != server {
                log::debug!("[{protocol}] ignoring datagram from {}", dgram.peer);
                continue;
            }
            let packet = match dgram.packet {
                Ok(p) => p,
                Err(e) if reliable => {
                    log::debug!("[udpr] ignoring malformed datagram: {e}");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            log::debug!("[{protocol}] ← {packet}");
            match connection::conn_reply(&packet, session_id) {
                ConnReply::Accepted => break,
                ConnReply::Rejected => return Err(ConnError::ConnectionRejected { session_id }),
                ConnReply::Other if reliable => {
                    log::debug!("[udpr] ignoring {packet} while awaiting CONACC");
                }
                ConnReply::Other => return Err(connection::unexpected(&packet, PacketKind::ConAcc)),
            }
        }
        progress.advance(ClientState::Established);

        // Chunks.
        let mut sender = Sender::new(session_id, payload, self.cfg.max_chunk);
        while let Some(packet) = sender.next_packet() {
            progress.sent(shutdown.guard(socket.send_to(&packet, server)).await?);
            progress.chunks += 1;
            log::debug!("[{protocol}] → {packet}");
            if !reliable {
                continue;
            }

            sender.record_sent(packet);
            let chunk_index = sender.in_flight_index().unwrap_or_default();
            timer.reset();
            deadline = timer.arm();
            loop {
                let dgram = match shutdown.guard(socket.recv_until(deadline)).await {
                    Ok(d) => d,
                    Err(ConnError::Socket(SocketError::Timeout)) => {
                        let attempt = timer.on_timeout()?;
                        if let Some(pending) = sender.in_flight() {
                            log::debug!(
                                "[udpr] no ACC for idx={chunk_index}; resending (retransmit {attempt})"
                            );
                            progress.sent(shutdown.guard(socket.send_to(pending, server)).await?);
                        }
                        deadline = timer.arm();
                        continue;
                    }
                    Err(e) => return Err(e),
                };
                if dgram.peer != server {
                    log::debug!("[udpr] ignoring datagram from {}", dgram.peer);
                    continue;
                }
                let reply = match dgram.packet {
                    Ok(p) => p,
                    Err(e) => {
                        log::debug!("[udpr] ignoring malformed datagram: {e}");
                        continue;
                    }
                };
                log::debug!("[udpr] ← {reply}");
                match sender.on_reply(&reply) {
                    ChunkReply::Acked => {
                        sender.on_ack();
                        break;
                    }
                    ChunkReply::Stale => continue,
                    ChunkReply::Rejected { chunk_index } => {
                        return Err(ConnError::DataRejected {
                            session_id,
                            chunk_index,
                        });
                    }
                    ChunkReply::Completed => {
                        log::debug!("[udpr] RCVD arrived before ACC idx={chunk_index}");
                        progress.advance(ClientState::Completed);
                        return Ok(progress.finish(timer.total_retransmits()));
                    }
                    ChunkReply::Unexpected => {
                        return Err(connection::unexpected(&reply, PacketKind::Acc));
                    }
                }
            }
        }

        // Completion.
        let deadline = Instant::now() + self.cfg.timeout;
        loop {
            let dgram = shutdown.guard(socket.recv_until(deadline)).await?;
            if dgram.peer != server {
                log::debug!("[{protocol}] ignoring datagram from {}", dgram.peer);
                continue;
            }
            let packet = match dgram.packet {
                Ok(p) => p,
                Err(e) if reliable => {
                    log::debug!("[udpr] ignoring malformed datagram: {e}");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            log::debug!("[{protocol}] ← {packet}");
            match connection::final_reply(&packet, session_id) {
                FinalReply::Received => break,
                FinalReply::Rejected { chunk_index } => {
                    return Err(ConnError::DataRejected {
                        session_id,
                        chunk_index,
                    });
                }
                FinalReply::Duplicate if reliable => continue,
                FinalReply::Duplicate | FinalReply::Other => {
                    return Err(connection::unexpected(&packet, PacketKind::Rcvd));
                }
            }
        }
        progress.advance(ClientState::Completed);
        Ok(progress.finish(timer.total_retransmits()))
    }
}
