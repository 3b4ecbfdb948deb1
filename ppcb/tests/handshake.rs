//! Integration tests for session setup and teardown.
//!
//! Each test spins up a real server on loopback in a background task and
//! drives it either with [`Client`] or with raw packets, then checks what
//! both sides observed.

mod common;

use std::time::Duration;

use tokio::net::{TcpStream, UdpSocket};

use ppcb::packet::{Packet, PacketKind};
use ppcb::shutdown;
use ppcb::simulator::SimulatorConfig;
use ppcb::socket::Socket;
use ppcb::state::ClientState;
use ppcb::stream::Stream;
use ppcb::{Client, ConnError, Protocol};

use common::*;

/// CONN(42, 10) → CONACC(42) → DATA{0, 10 bytes} → RCVD(42).
#[tokio::test]
async fn tcp_happy_path_completes() {
    let mut server = start_tcp(default_config()).await;

    let mut client = Client::new(default_config(), shutdown::Shutdown::never()).unwrap();
    let report = tokio::time::timeout(
        STEP,
        client.send(Protocol::Tcp, server.addr, 42, b"0123456789"),
    )
    .await
    .expect("client timed out")
    .expect("client failed");

    assert_eq!(report.state, ClientState::Completed);
    assert_eq!(report.session_id, 42);
    assert_eq!(report.chunks, 1);
    // CONN (18) + DATA header (21) + payload (10).
    assert_eq!(report.bytes_sent, 49);
    assert_eq!(report.retransmits, 0);

    let session = server.next_report().await;
    assert_eq!(session.session_id, 42);
    assert_eq!(session.protocol, Protocol::Tcp);
    assert_eq!(session.outcome.unwrap(), b"0123456789");

    server.stop().await;
}

/// The same exchange packet by packet, as seen from the wire.
#[tokio::test]
async fn tcp_exchange_on_the_wire() {
    let cfg = default_config();
    let mut server = start_tcp(cfg.clone()).await;

    let tcp = TcpStream::connect(server.addr).await.unwrap();
    let mut stream = Stream::new(tcp, &cfg);

    stream
        .send_packet(&Packet::Conn {
            session_id: 42,
            protocol_id: Protocol::Tcp.id(),
            total_len: 10,
        })
        .await
        .unwrap();
    assert_eq!(
        stream.recv_packet().await.unwrap(),
        Packet::ConAcc { session_id: 42 }
    );

    stream
        .send_packet(&Packet::Data {
            session_id: 42,
            chunk_index: 0,
            payload: b"0123456789".to_vec(),
        })
        .await
        .unwrap();
    assert_eq!(
        stream.recv_packet().await.unwrap(),
        Packet::Rcvd { session_id: 42 }
    );

    assert!(server.next_report().await.outcome.is_ok());
    server.stop().await;
}

/// A TCP connection whose first packet is not CONN fails alone; the
/// listener keeps serving.
#[tokio::test]
async fn tcp_requires_conn_first() {
    let cfg = default_config();
    let mut server = start_tcp(cfg.clone()).await;

    let tcp = TcpStream::connect(server.addr).await.unwrap();
    let mut stream = Stream::new(tcp, &cfg);
    stream
        .send_packet(&Packet::Rcvd { session_id: 1 })
        .await
        .unwrap();
    // The server hangs up without replying.
    assert!(stream.recv_packet().await.is_err());

    let mut client = Client::new(cfg, shutdown::Shutdown::never()).unwrap();
    client
        .send(Protocol::Tcp, server.addr, 2, b"still alive")
        .await
        .expect("listener stopped serving");
    assert_eq!(server.next_report().await.session_id, 2);

    server.stop().await;
}

/// A TCP CONN announcing a datagram transport is refused.
#[tokio::test]
async fn tcp_rejects_wrong_protocol_id() {
    let cfg = default_config();
    let mut server = start_tcp(cfg.clone()).await;

    let tcp = TcpStream::connect(server.addr).await.unwrap();
    let mut stream = Stream::new(tcp, &cfg);
    stream
        .send_packet(&Packet::Conn {
            session_id: 9,
            protocol_id: Protocol::Udp.id(),
            total_len: 1,
        })
        .await
        .unwrap();

    let report = server.next_report().await;
    assert!(matches!(
        report.outcome,
        Err(ConnError::UnexpectedProtocol { actual: 2, .. })
    ));
    server.stop().await;
}

/// Total silence after CONN: exactly 1 + ceiling CONN transmissions, then a
/// timeout error.
#[tokio::test]
async fn udpr_retransmit_ceiling() {
    let silent = UdpSocket::bind(loopback()).await.unwrap();
    let server_addr = silent.local_addr().unwrap();

    let cfg = config(30, 3, 64);
    let (sim, sent) = simulated(SimulatorConfig::default()).await;
    let socket = Socket::new(sim, &cfg).unwrap();

    let mut client = Client::new(cfg, shutdown::Shutdown::never()).unwrap();
    let result = tokio::time::timeout(
        STEP,
        client.send_datagram(socket, Protocol::Udpr, server_addr, 5, b"payload"),
    )
    .await
    .expect("client hung");

    assert!(
        matches!(result, Err(ConnError::Timeout { retransmits: 3 })),
        "expected timeout, got {result:?}"
    );
    assert_eq!(sent.count(PacketKind::Conn), 4);
    assert_eq!(sent.count(PacketKind::Data), 0);
    drop(silent);
}

/// Plain UDP does not retransmit: one CONN, then a socket timeout.
#[tokio::test]
async fn udp_handshake_timeout_is_immediate() {
    let silent = UdpSocket::bind(loopback()).await.unwrap();
    let server_addr = silent.local_addr().unwrap();

    let cfg = config(30, 3, 64);
    let (sim, sent) = simulated(SimulatorConfig::default()).await;
    let socket = Socket::new(sim, &cfg).unwrap();

    let mut client = Client::new(cfg, shutdown::Shutdown::never()).unwrap();
    let err = client
        .send_datagram(socket, Protocol::Udp, server_addr, 5, b"payload")
        .await
        .unwrap_err();

    assert!(err.is_timeout());
    assert!(!err.is_rejection());
    assert_eq!(sent.count(PacketKind::Conn), 1);
}

/// CONN(B) during session A gets CONRJT(B); A completes untouched.
#[tokio::test]
async fn foreign_session_is_rejected() {
    let mut server = start_udp(default_config()).await;
    let a = RawPeer::new(server.addr).await;
    let b = RawPeer::new(server.addr).await;

    a.send(&Packet::Conn {
        session_id: 0xA,
        protocol_id: Protocol::Udpr.id(),
        total_len: 8,
    })
    .await;
    assert_eq!(a.recv().await, Packet::ConAcc { session_id: 0xA });

    a.send(&Packet::Data {
        session_id: 0xA,
        chunk_index: 0,
        payload: b"abcd".to_vec(),
    })
    .await;
    assert_eq!(
        a.recv().await,
        Packet::Acc {
            session_id: 0xA,
            chunk_index: 0
        }
    );

    b.send(&Packet::Conn {
        session_id: 0xB,
        protocol_id: Protocol::Udpr.id(),
        total_len: 4,
    })
    .await;
    assert_eq!(b.recv().await, Packet::ConRjt { session_id: 0xB });

    b.send(&Packet::Data {
        session_id: 0xB,
        chunk_index: 1,
        payload: b"zzzz".to_vec(),
    })
    .await;
    assert_eq!(
        b.recv().await,
        Packet::Rjt {
            session_id: 0xB,
            chunk_index: 1
        }
    );

    // A's expected index is still 1 and 4 bytes remain.
    a.send(&Packet::Data {
        session_id: 0xA,
        chunk_index: 1,
        payload: b"efgh".to_vec(),
    })
    .await;
    assert_eq!(
        a.recv().await,
        Packet::Acc {
            session_id: 0xA,
            chunk_index: 1
        }
    );
    assert_eq!(a.recv().await, Packet::Rcvd { session_id: 0xA });

    let report = server.next_report().await;
    assert_eq!(report.session_id, 0xA);
    assert_eq!(report.protocol, Protocol::Udpr);
    assert_eq!(report.outcome.unwrap(), b"abcdefgh");
    server.stop().await;
}

/// A repeated CONN before any data is answered with CONACC again.
#[tokio::test]
async fn udpr_duplicate_conn_is_reacknowledged() {
    let mut server = start_udp(default_config()).await;
    let a = RawPeer::new(server.addr).await;
    let conn = Packet::Conn {
        session_id: 3,
        protocol_id: Protocol::Udpr.id(),
        total_len: 1,
    };

    a.send(&conn).await;
    assert_eq!(a.recv().await, Packet::ConAcc { session_id: 3 });
    a.send(&conn).await;
    assert_eq!(a.recv().await, Packet::ConAcc { session_id: 3 });

    a.send(&Packet::Data {
        session_id: 3,
        chunk_index: 0,
        payload: vec![7],
    })
    .await;
    assert_eq!(
        a.recv().await,
        Packet::Acc {
            session_id: 3,
            chunk_index: 0
        }
    );
    assert_eq!(a.recv().await, Packet::Rcvd { session_id: 3 });
    assert_eq!(server.next_report().await.outcome.unwrap(), [7u8]);
    server.stop().await;
}

/// Cancellation interrupts a client blocked in a retransmit wait.
#[tokio::test]
async fn cancellation_stops_client() {
    let silent = UdpSocket::bind(loopback()).await.unwrap();
    let server_addr = silent.local_addr().unwrap();

    let (trigger, shutdown) = shutdown::channel();
    let mut client = Client::new(config(5_000, 15, 64), shutdown).unwrap();
    let session = tokio::spawn(async move {
        client
            .send(Protocol::Udpr, server_addr, 1, b"never delivered")
            .await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    trigger.trigger();

    let result = tokio::time::timeout(Duration::from_secs(2), session)
        .await
        .expect("client ignored cancellation")
        .unwrap();
    assert!(matches!(result, Err(ConnError::Cancelled)));
}
