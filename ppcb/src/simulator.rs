//! Fault-injecting network layer for deterministic testing.
//!
//! Real networks drop and duplicate datagrams.  To exercise the UDPR
//! recovery paths without depending on actual network conditions,
//! [`Simulator`] wraps any [`DatagramSocket`] and intercepts outbound
//! datagrams, applying a configurable fault model:
//!
//! | Fault        | Description                                          |
//! |--------------|------------------------------------------------------|
//! | Packet loss  | Drop a datagram with probability `loss_rate`.        |
//! | Duplication  | Send a datagram twice with probability `duplicate_rate`. |
//! | Drop rules   | Drop the first `n` packets of a given kind / index.  |
//!
//! Randomness comes from a seeded `StdRng`, so a failing run can be
//! replayed.  Every datagram handed to the simulator is recorded in a
//! shared [`SendLog`] that tests can inspect while the socket is owned by
//! a client or server.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::packet::{Packet, PacketKind};
use crate::socket::DatagramSocket;

/// Configuration for the fault-injection model.
///
/// Probabilities are in the range `[0.0, 1.0]`.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    pub loss_rate: f64,
    pub duplicate_rate: f64,
    pub seed: u64,
    pub drop_rules: Vec<DropRule>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        // No faults by default: the simulator is a transparent pass-through.
        Self {
            loss_rate: 0.0,
            duplicate_rate: 0.0,
            seed: 0x5eed,
            drop_rules: Vec::new(),
        }
    }
}

/// Drop the first `occurrences` outbound packets of `kind` (and, when set,
/// with `chunk_index`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DropRule {
    pub kind: PacketKind,
    pub chunk_index: Option<u64>,
    pub occurrences: u32,
}

impl DropRule {
    pub fn first(kind: PacketKind, chunk_index: Option<u64>) -> Self {
        Self {
            kind,
            chunk_index,
            occurrences: 1,
        }
    }

    fn matches(&self, packet: &Packet) -> bool {
        if self.occurrences == 0 || packet.kind() != self.kind {
            return false;
        }
        match (self.chunk_index, packet) {
            (None, _) => true,
            (Some(want), Packet::Data { chunk_index, .. })
            | (Some(want), Packet::Acc { chunk_index, .. })
            | (Some(want), Packet::Rjt { chunk_index, .. }) => *chunk_index == want,
            (Some(_), _) => false,
        }
    }
}

/// What happened to one outbound datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fate {
    Delivered,
    Dropped,
    Duplicated,
}

/// One outbound datagram as seen by the simulator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentRecord {
    pub dest: SocketAddr,
    /// `None` for bytes that do not decode as a packet.
    pub packet: Option<Packet>,
    pub fate: Fate,
}

/// Shared, append-only history of outbound datagrams.
#[derive(Debug, Clone, Default)]
pub struct SendLog {
    records: Arc<Mutex<Vec<SentRecord>>>,
}

impl SendLog {
    fn push(&self, record: SentRecord) {
        if let Ok(mut records) = self.records.lock() {
            records.push(record);
        }
    }

    pub fn records(&self) -> Vec<SentRecord> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }

    /// Datagrams of `kind` the owner attempted to send, dropped or not.
    pub fn count(&self, kind: PacketKind) -> usize {
        self.records()
            .iter()
            .filter(|r| r.packet.as_ref().map(Packet::kind) == Some(kind))
            .count()
    }

    /// Attempts to send DATA with `chunk_index`.
    pub fn data_sends(&self, chunk_index: u64) -> usize {
        self.records()
            .iter()
            .filter(|r| {
                matches!(
                    r.packet,
                    Some(Packet::Data { chunk_index: idx, .. }) if idx == chunk_index
                )
            })
            .count()
    }
}

#[derive(Debug)]
struct FaultState {
    rng: StdRng,
    rules: Vec<DropRule>,
}

/// A fault-injecting wrapper around a datagram socket.
///
/// Only outbound traffic is disturbed; wrap both ends to disturb both
/// directions.
#[derive(Debug)]
pub struct Simulator<S> {
    inner: S,
    loss_rate: f64,
    duplicate_rate: f64,
    state: Mutex<FaultState>,
    log: SendLog,
}

impl<S: DatagramSocket> Simulator<S> {
    pub fn new(inner: S, config: SimulatorConfig) -> Self {
        Self {
            inner,
            loss_rate: config.loss_rate,
            duplicate_rate: config.duplicate_rate,
            state: Mutex::new(FaultState {
                rng: StdRng::seed_from_u64(config.seed),
                rules: config.drop_rules,
            }),
            log: SendLog::default(),
        }
    }

    /// Handle to the send history; stays valid after the simulator moves.
    pub fn send_log(&self) -> SendLog {
        self.log.clone()
    }

    fn decide(&self, packet: Option<&Packet>) -> Fate {
        let Ok(mut state) = self.state.lock() else {
            return Fate::Delivered;
        };
        if let Some(packet) = packet {
            if let Some(rule) = state.rules.iter_mut().find(|r| r.matches(packet)) {
                rule.occurrences -= 1;
                return Fate::Dropped;
            }
        }
        if self.loss_rate > 0.0 && state.rng.random_bool(self.loss_rate.min(1.0)) {
            return Fate::Dropped;
        }
        if self.duplicate_rate > 0.0 && state.rng.random_bool(self.duplicate_rate.min(1.0)) {
            return Fate::Duplicated;
        }
        Fate::Delivered
    }
}

impl<S: DatagramSocket> DatagramSocket for Simulator<S> {
    fn send_to(
        &self,
        buf: &[u8],
        target: SocketAddr,
    ) -> impl Future<Output = io::Result<usize>> + Send {
        let packet = Packet::decode(buf, u32::MAX).ok();
        let fate = self.decide(packet.as_ref());
        if let Some(ref p) = packet {
            log::debug!("[sim] {p} to {target}: {fate:?}");
        }
        self.log.push(SentRecord {
            dest: target,
            packet,
            fate: fate.clone(),
        });
        async move {
            match fate {
                // A lost datagram still looks sent to the caller.
                Fate::Dropped => Ok(buf.len()),
                Fate::Delivered => self.inner.send_to(buf, target).await,
                Fate::Duplicated => {
                    self.inner.send_to(buf, target).await?;
                    self.inner.send_to(buf, target).await
                }
            }
        }
    }

    fn recv_from(
        &self,
        buf: &mut [u8],
    ) -> impl Future<Output = io::Result<(usize, SocketAddr)>> + Send {
        self.inner.recv_from(buf)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}
