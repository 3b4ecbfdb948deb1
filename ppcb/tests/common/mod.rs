//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use ppcb::packet::{Packet, MAX_CHUNK_LEN};
use ppcb::shutdown::{self, Trigger};
use ppcb::simulator::{SendLog, Simulator, SimulatorConfig};
use ppcb::socket::{DatagramSocket, Socket};
use ppcb::{Config, ConnError, DatagramServer, SessionReport, TcpServer};

/// Upper bound on any single test step.
pub const STEP: Duration = Duration::from_secs(10);

pub fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

pub fn config(timeout_ms: u64, max_retransmits: u32, max_chunk: u32) -> Config {
    Config {
        timeout: Duration::from_millis(timeout_ms),
        max_retransmits,
        max_chunk,
    }
}

pub fn default_config() -> Config {
    config(1000, 5, MAX_CHUNK_LEN)
}

/// A running server plus the handles a test needs to observe and stop it.
pub struct Running {
    pub addr: SocketAddr,
    pub reports: mpsc::UnboundedReceiver<SessionReport>,
    trigger: Trigger,
    task: JoinHandle<Result<(), ConnError>>,
}

impl Running {
    pub async fn next_report(&mut self) -> SessionReport {
        tokio::time::timeout(STEP, self.reports.recv())
            .await
            .expect("no session report")
            .expect("report channel closed")
    }

    pub async fn stop(self) {
        self.trigger.trigger();
        tokio::time::timeout(STEP, self.task)
            .await
            .expect("server did not stop")
            .expect("server task panicked")
            .expect("server failed");
    }
}

pub async fn start_tcp(cfg: Config) -> Running {
    let server = TcpServer::bind(loopback(), cfg).await.expect("bind tcp server");
    let addr = server.local_addr().unwrap();
    let (trigger, shutdown) = shutdown::channel();
    let (tx, reports) = mpsc::unbounded_channel();
    let task = tokio::spawn(server.run(shutdown, tx));
    Running {
        addr,
        reports,
        trigger,
        task,
    }
}

pub async fn start_datagram<S>(socket: S, cfg: Config) -> Running
where
    S: DatagramSocket + 'static,
{
    let socket = Socket::new(socket, &cfg).expect("wrap server socket");
    let server = DatagramServer::new(socket, cfg).expect("datagram server");
    let addr = server.local_addr();
    let (trigger, shutdown) = shutdown::channel();
    let (tx, reports) = mpsc::unbounded_channel();
    let task = tokio::spawn(server.run(shutdown, tx));
    Running {
        addr,
        reports,
        trigger,
        task,
    }
}

pub async fn start_udp(cfg: Config) -> Running {
    let socket = UdpSocket::bind(loopback()).await.expect("bind udp server");
    start_datagram(socket, cfg).await
}

/// A loopback UDP socket behind a simulator, plus its send history.
pub async fn simulated(config: SimulatorConfig) -> (Simulator<UdpSocket>, SendLog) {
    let socket = UdpSocket::bind(loopback()).await.expect("bind");
    let sim = Simulator::new(socket, config);
    let log = sim.send_log();
    (sim, log)
}

/// Raw datagram peer for driving a server packet by packet.
pub struct RawPeer {
    pub socket: UdpSocket,
    pub server: SocketAddr,
}

impl RawPeer {
    pub async fn new(server: SocketAddr) -> Self {
        let socket = UdpSocket::bind(loopback()).await.expect("bind raw peer");
        Self { socket, server }
    }

    pub async fn send(&self, packet: &Packet) {
        self.socket
            .send_to(&packet.encode(), self.server)
            .await
            .expect("raw send");
    }

    pub async fn recv(&self) -> Packet {
        let mut buf = vec![0u8; 70_000];
        let (n, _) = tokio::time::timeout(STEP, self.socket.recv_from(&mut buf))
            .await
            .expect("raw peer got no reply")
            .expect("raw recv");
        Packet::decode(&buf[..n], MAX_CHUNK_LEN).expect("server sent a malformed packet")
    }
}
