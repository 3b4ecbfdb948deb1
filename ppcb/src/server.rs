//! Receiving side of PPCB.
//!
//! Two listeners:
//! - [`TcpServer`] accepts connections and runs one session per connection
//!   on its own task; each task owns its stream exclusively.
//! - [`DatagramServer`] serves `udp` and `udpr` sessions on one shared UDP
//!   socket, one session at a time.  Datagrams from other sessions, or from
//!   any address but the active peer, are answered inline (CONRJT / RJT)
//!   without disturbing the active one.
//!
//! Every session that gets past CONN produces a [`SessionReport`] on the
//! channel handed to `run`; a failed session is logged and the listener
//! keeps going.

use std::io;
use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::config::{Config, Protocol};
use crate::connection::{self, ConnError};
use crate::packet::{DataHeader, Packet, PacketError, PacketKind};
use crate::receiver::{Receiver, Verdict};
use crate::shutdown::Shutdown;
use crate::socket::{DatagramSocket, Socket, SocketError};
use crate::state::ServerState;
use crate::stream::Stream;
use crate::timer::RetransmitTimer;

/// Outcome of one server-side session.
#[derive(Debug)]
pub struct SessionReport {
    pub session_id: u64,
    pub protocol: Protocol,
    pub peer: SocketAddr,
    /// The reassembled payload, or why the session failed.
    pub outcome: Result<Vec<u8>, ConnError>,
}

pub type ReportSender = mpsc::UnboundedSender<SessionReport>;

fn publish(reports: &ReportSender, report: SessionReport) {
    match &report.outcome {
        Ok(payload) => log::info!(
            "[{}] session {} from {} complete: {} bytes",
            report.protocol,
            report.session_id,
            report.peer,
            payload.len()
        ),
        Err(e) => log::warn!(
            "[{}] session {} from {} failed: {e}",
            report.protocol,
            report.session_id,
            report.peer
        ),
    }
    // A dropped receiver only means nobody is listening for reports.
    let _ = reports.send(report);
}

/// Server-side state tracker with transition logging.
struct Phase {
    protocol: Protocol,
    session_id: u64,
    state: ServerState,
}

impl Phase {
    fn new(protocol: Protocol, session_id: u64) -> Self {
        Self {
            protocol,
            session_id,
            state: ServerState::AwaitingConn,
        }
    }

    fn advance(&mut self, next: ServerState) {
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
}

// ---------------------------------------------------------------------------
// TCP
// ---------------------------------------------------------------------------

/// TCP listener; one task per accepted connection.
#[derive(Debug)]
pub struct TcpServer {
    listener: TcpListener,
    cfg: Config,
}

impl TcpServer {
    pub async fn bind(addr: SocketAddr, cfg: Config) -> Result<Self, ConnError> {
        cfg.validate()?;
        let listener = TcpListener::bind(addr).await.map_err(SocketError::from)?;
        Ok(Self { listener, cfg })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` fires, then wait for the running
    /// sessions to unwind.
    pub async fn run(self, mut shutdown: Shutdown, reports: ReportSender) -> Result<(), ConnError> {
        log::info!(
            "[tcp] listening on {}",
            self.local_addr().map_err(SocketError::from)?
        );
        let mut sessions = JoinSet::new();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            log::debug!("[tcp] set_nodelay for {peer}: {e}");
                        }
                        let stream = Stream::new(stream, &self.cfg);
                        let cfg = self.cfg.clone();
                        let mut shutdown = shutdown.clone();
                        let reports = reports.clone();
                        sessions.spawn(async move {
                            match serve_stream(stream, peer, &cfg, &mut shutdown).await {
                                Ok(report) => publish(&reports, report),
                                Err(e) => log::warn!("[tcp] connection from {peer} dropped: {e}"),
                            }
                        });
                    }
                    Err(e) => log::warn!("[tcp] accept failed: {e}"),
                },
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = joined {
                        log::error!("[tcp] session task failed: {e}");
                    }
                }
            }
        }
        log::info!("[tcp] shutting down; {} session(s) in progress", sessions.len());
        while let Some(joined) = sessions.join_next().await {
            if let Err(e) = joined {
                log::error!("[tcp] session task failed: {e}");
            }
        }
        Ok(())
    }
}

/// Serve one TCP connection.
///
/// `Err` means the connection failed before it named a session (no CONN);
/// everything after CONN is reported through the returned [`SessionReport`].
pub async fn serve_stream<S>(
    mut stream: Stream<S>,
    peer: SocketAddr,
    cfg: &Config,
    shutdown: &mut Shutdown,
) -> Result<SessionReport, ConnError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let first = shutdown.guard(stream.recv_packet()).await?;
    log::debug!("[tcp] ← {first}");
    let (session_id, total_len) = match first {
        Packet::Conn {
            session_id,
            protocol_id,
            total_len,
        } => {
            if protocol_id != Protocol::Tcp.id() {
                return Ok(SessionReport {
                    session_id,
                    protocol: Protocol::Tcp,
                    peer,
                    outcome: Err(ConnError::UnexpectedProtocol {
                        session_id,
                        expected: Protocol::Tcp,
                        actual: protocol_id,
                    }),
                });
            }
            (session_id, total_len)
        }
        other => return Err(connection::unexpected(&other, PacketKind::Conn)),
    };
    log::info!("[tcp] session {session_id} from {peer}: {total_len} bytes announced");

    let outcome = receive_stream(&mut stream, session_id, total_len, cfg, shutdown).await;
    Ok(SessionReport {
        session_id,
        protocol: Protocol::Tcp,
        peer,
        outcome,
    })
}

async fn receive_stream<S>(
    stream: &mut Stream<S>,
    session_id: u64,
    total_len: u64,
    cfg: &Config,
    shutdown: &mut Shutdown,
) -> Result<Vec<u8>, ConnError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut phase = Phase::new(Protocol::Tcp, session_id);
    let conacc = Packet::ConAcc { session_id };
    shutdown.guard(stream.send_packet(&conacc)).await?;
    log::debug!("[tcp] → {conacc}");
    phase.advance(ServerState::AwaitingData);

    let mut rx = Receiver::new(session_id, total_len, cfg.max_chunk, false);
    while !rx.is_complete() {
        let (chunk_index, reason) = match shutdown.guard(stream.recv_packet()).await {
            Ok(Packet::Data {
                session_id: sid,
                chunk_index,
                payload,
            }) => {
                let header = DataHeader {
                    session_id: sid,
                    chunk_index,
                    chunk_len: payload.len() as u32,
                };
                match rx.classify(&header) {
                    Verdict::Accept => {
                        rx.accept(chunk_index, &payload);
                        log::debug!(
                            "[tcp] ← DATA idx={chunk_index} len={} ({} left)",
                            payload.len(),
                            rx.bytes_remaining()
                        );
                        continue;
                    }
                    Verdict::Duplicate | Verdict::Reject { .. } => (
                        chunk_index,
                        ConnError::InvalidChunk {
                            session_id,
                            chunk_index,
                        },
                    ),
                }
            }
            Err(ConnError::Packet(err)) => match err.data_header().copied() {
                Some(header) => (header.chunk_index, ConnError::Packet(err)),
                None => return Err(ConnError::Packet(err)),
            },
            Ok(other) => (rx.expected(), connection::unexpected(&other, PacketKind::Data)),
            Err(e) => return Err(e),
        };

        let rjt = Packet::Rjt {
            session_id,
            chunk_index,
        };
        match shutdown.guard(stream.send_packet(&rjt)).await {
            Ok(_) => log::debug!("[tcp] → {rjt}"),
            Err(e) => log::debug!("[tcp] could not send {rjt}: {e}"),
        }
        return Err(reason);
    }

    phase.advance(ServerState::AwaitingCompletion);
    let rcvd = Packet::Rcvd { session_id };
    shutdown.guard(stream.send_packet(&rcvd)).await?;
    log::debug!("[tcp] → {rcvd}");
    phase.advance(ServerState::Closed);
    Ok(rx.into_payload())
}

// ---------------------------------------------------------------------------
// UDP / UDPR
// ---------------------------------------------------------------------------

/// A CONN that opened a datagram session.
#[derive(Debug, Clone, Copy)]
struct Incoming {
    session_id: u64,
    protocol: Protocol,
    total_len: u64,
    peer: SocketAddr,
}

/// Datagram listener serving `udp` and `udpr` sessions sequentially.
#[derive(Debug)]
pub struct DatagramServer<S = UdpSocket> {
    socket: Socket<S>,
    cfg: Config,
}

impl DatagramServer<UdpSocket> {
    pub async fn bind(addr: SocketAddr, cfg: Config) -> Result<Self, ConnError> {
        cfg.validate()?;
        let socket = Socket::bind(addr, &cfg).await?;
        Ok(Self { socket, cfg })
    }
}

impl<S: DatagramSocket> DatagramServer<S> {
    pub fn new(socket: Socket<S>, cfg: Config) -> Result<Self, ConnError> {
        cfg.validate()?;
        Ok(Self { socket, cfg })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr
    }

    /// Serve sessions until `shutdown` fires or the socket fails.
    pub async fn run(mut self, mut shutdown: Shutdown, reports: ReportSender) -> Result<(), ConnError> {
        log::info!("[server] listening on {} (udp, udpr)", self.local_addr());
        loop {
            let incoming = match self.accept(&mut shutdown).await {
                Ok(incoming) => incoming,
                Err(ConnError::Cancelled) => break,
                Err(e) => return Err(e),
            };
            let outcome = self.receive(incoming, &mut shutdown).await;
            let cancelled = matches!(outcome, Err(ConnError::Cancelled));
            publish(
                &reports,
                SessionReport {
                    session_id: incoming.session_id,
                    protocol: incoming.protocol,
                    peer: incoming.peer,
                    outcome,
                },
            );
            if cancelled {
                break;
            }
        }
        log::info!("[server] shut down");
        Ok(())
    }

    /// Wait for a CONN naming a datagram transport; everything else is noise.
    async fn accept(&mut self, shutdown: &mut Shutdown) -> Result<Incoming, ConnError> {
        loop {
            let dgram = match shutdown.guard(self.socket.recv()).await {
                Ok(d) => d,
                Err(ConnError::Socket(SocketError::Timeout)) => continue,
                Err(e) => return Err(e),
            };
            let peer = dgram.peer;
            match dgram.packet {
                Ok(Packet::Conn {
                    session_id,
                    protocol_id,
                    total_len,
                }) => match Protocol::try_from(protocol_id) {
                    Ok(protocol) if protocol.is_datagram() => {
                        log::info!(
                            "[{protocol}] session {session_id} from {peer}: {total_len} bytes announced"
                        );
                        return Ok(Incoming {
                            session_id,
                            protocol,
                            total_len,
                            peer,
                        });
                    }
                    _ => log::warn!(
                        "[server] ignoring CONN for protocol {protocol_id} from {peer}"
                    ),
                },
                Ok(other) => log::debug!("[server] ignoring {other} from {peer} while idle"),
                Err(e) => log::debug!("[server] ignoring malformed datagram from {peer}: {e}"),
            }
        }
    }

    /// Send `packet` to `dest`, logging instead of failing.  Used for replies
    /// to foreign sessions, which must not end the active one.
    async fn reply_best_effort(&self, shutdown: &mut Shutdown, packet: &Packet, dest: SocketAddr) {
        match shutdown.guard(self.socket.send_to(packet, dest)).await {
            Ok(_) => log::debug!("[server] → {packet} to {dest}"),
            Err(e) => log::debug!("[server] could not send {packet} to {dest}: {e}"),
        }
    }

    /// Answer a datagram from an address other than the active peer.  It
    /// never touches the active session, whatever session id it names.
    async fn turn_away(
        &self,
        shutdown: &mut Shutdown,
        packet: Result<Packet, PacketError>,
        from: SocketAddr,
    ) {
        let reply = match packet {
            Ok(Packet::Conn { session_id, .. }) => Packet::ConRjt { session_id },
            Ok(Packet::Data {
                session_id,
                chunk_index,
                ..
            }) => Packet::Rjt {
                session_id,
                chunk_index,
            },
            Ok(other) => {
                log::debug!("[server] ignoring {other} from {from}");
                return;
            }
            Err(err) => match err.data_header() {
                Some(header) => Packet::Rjt {
                    session_id: header.session_id,
                    chunk_index: header.chunk_index,
                },
                None => {
                    log::debug!("[server] ignoring malformed datagram from {from}: {err}");
                    return;
                }
            },
        };
        log::warn!("[server] turning away {from} with {reply}: another peer is being served");
        self.reply_best_effort(shutdown, &reply, from).await;
    }

    /// Run one session to completion.
    async fn receive(&mut self, conn: Incoming, shutdown: &mut Shutdown) -> Result<Vec<u8>, ConnError> {
        let Incoming {
            session_id,
            protocol,
            total_len,
            peer,
        } = conn;
        let reliable = protocol == Protocol::Udpr;
        let mut phase = Phase::new(protocol, session_id);

        let conacc = Packet::ConAcc { session_id };
        shutdown.guard(self.socket.send_to(&conacc, peer)).await?;
        log::debug!("[{protocol}] → {conacc}");
        phase.advance(ServerState::AwaitingData);

        let mut rx = Receiver::new(session_id, total_len, self.cfg.max_chunk, reliable);
        let mut timer = RetransmitTimer::new(&self.cfg);
        let mut deadline = timer.arm();

        while !rx.is_complete() {
            let dgram = match shutdown.guard(self.socket.recv_until(deadline)).await {
                Ok(d) => d,
                Err(ConnError::Socket(SocketError::Timeout)) if reliable => {
                    let attempt = timer.on_timeout()?;
                    let ack = rx.last_ack();
                    log::debug!(
                        "[udpr] no DATA idx={}; resending {ack} (retransmit {attempt})",
                        rx.expected()
                    );
                    shutdown.guard(self.socket.send_to(&ack, peer)).await?;
                    deadline = timer.arm();
                    continue;
                }
                Err(e) => return Err(e),
            };
            let from = dgram.peer;
            if from != peer {
                self.turn_away(shutdown, dgram.packet, from).await;
                continue;
            }

            let rejected = match dgram.packet {
                Ok(Packet::Data {
                    session_id: sid,
                    chunk_index,
                    payload,
                }) => {
                    let header = DataHeader {
                        session_id: sid,
                        chunk_index,
                        chunk_len: payload.len() as u32,
                    };
                    match rx.classify(&header) {
                        Verdict::Accept => {
                            rx.accept(chunk_index, &payload);
                            log::debug!(
                                "[{protocol}] ← DATA idx={chunk_index} len={} ({} left)",
                                payload.len(),
                                rx.bytes_remaining()
                            );
                            if reliable {
                                let acc = Packet::Acc {
                                    session_id,
                                    chunk_index,
                                };
                                shutdown.guard(self.socket.send_to(&acc, peer)).await?;
                                log::debug!("[udpr] → {acc}");
                            }
                            timer.reset();
                            deadline = timer.arm();
                            continue;
                        }
                        Verdict::Duplicate => {
                            log::debug!("[udpr] duplicate DATA idx={chunk_index}; re-acknowledging");
                            let acc = Packet::Acc {
                                session_id,
                                chunk_index,
                            };
                            shutdown.guard(self.socket.send_to(&acc, peer)).await?;
                            continue;
                        }
                        Verdict::Reject { abort } => (header, abort),
                    }
                }
                Err(err) => match err.data_header().copied() {
                    Some(header) => (header, header.session_id == session_id),
                    None => {
                        log::debug!("[{protocol}] ignoring malformed datagram from {from}: {err}");
                        continue;
                    }
                },
                Ok(Packet::Conn { session_id: sid, .. }) if sid != session_id => {
                    log::warn!(
                        "[server] rejecting session {sid} from {from}: session {session_id} is active"
                    );
                    self.reply_best_effort(shutdown, &Packet::ConRjt { session_id: sid }, from)
                        .await;
                    continue;
                }
                Ok(Packet::Conn { .. }) if reliable => {
                    if rx.expected() == 0 {
                        log::debug!("[udpr] duplicate CONN; resending {conacc}");
                        shutdown.guard(self.socket.send_to(&conacc, peer)).await?;
                    }
                    continue;
                }
                Ok(other) if other.session_id() != session_id => {
                    log::debug!("[server] ignoring {other} from {from}");
                    continue;
                }
                Ok(other) => return Err(connection::unexpected(&other, PacketKind::Data)),
            };

            let (header, abort) = rejected;
            let rjt = Packet::Rjt {
                session_id: header.session_id,
                chunk_index: header.chunk_index,
            };
            if abort {
                shutdown.guard(self.socket.send_to(&rjt, peer)).await?;
                log::debug!("[{protocol}] → {rjt}");
                return Err(ConnError::InvalidChunk {
                    session_id,
                    chunk_index: header.chunk_index,
                });
            }
            log::warn!("[server] rejecting DATA of session {} from {from}", header.session_id);
            self.reply_best_effort(shutdown, &rjt, from).await;
        }

        phase.advance(ServerState::AwaitingCompletion);
        let rcvd = Packet::Rcvd { session_id };
        shutdown.guard(self.socket.send_to(&rcvd, peer)).await?;
        log::debug!("[{protocol}] → {rcvd}");
        phase.advance(ServerState::Closed);
        Ok(rx.into_payload())
    }
}
