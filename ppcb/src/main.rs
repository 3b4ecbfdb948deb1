//! Entry point for `ppcb`.
//!
//! Parses CLI arguments and dispatches into either **server** or **client**
//! mode.  All protocol work is delegated to the library; `main.rs` owns only
//! process setup (logging, signal handling, argument parsing, stdin/stdout).

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

use ppcb::config::{parse_port, ConfigError, DEFAULT_MAX_RETRANSMITS};
use ppcb::packet::MAX_CHUNK_LEN;
use ppcb::shutdown::{self, Shutdown};
use ppcb::{Client, Config, DatagramServer, Protocol, SessionReport, TcpServer};

/// Byte transfer over TCP, UDP, or retransmitting UDP.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,

    /// Idle timeout for every send and receive, in seconds.
    #[arg(long, global = true, default_value_t = 5)]
    timeout_secs: u64,

    /// UDPR retransmissions allowed per wait.
    #[arg(long, global = true, default_value_t = DEFAULT_MAX_RETRANSMITS)]
    max_retransmits: u32,

    /// Largest DATA chunk, in bytes.
    #[arg(long, global = true, default_value_t = MAX_CHUNK_LEN)]
    chunk_size: u32,
}

#[derive(Subcommand)]
enum Mode {
    /// Send standard input to a server.
    Client {
        #[arg(value_enum)]
        protocol: Protocol,
        host: String,
        #[arg(value_parser = parse_port)]
        port: u16,
    },
    /// Receive sessions and write each payload to standard output.
    Server {
        /// `udp` also serves udpr sessions.
        #[arg(value_enum)]
        protocol: Protocol,
        #[arg(value_parser = parse_port)]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise env_logger; set RUST_LOG to control verbosity.
    env_logger::init();

    let cli = Cli::parse();
    let cfg = Config {
        timeout: Duration::from_secs(cli.timeout_secs),
        max_retransmits: cli.max_retransmits,
        max_chunk: cli.chunk_size,
    };
    cfg.validate()?;

    let (trigger, shutdown) = shutdown::channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("interrupted; cancelling");
            trigger.trigger();
        }
    });

    match cli.mode {
        Mode::Client {
            protocol,
            host,
            port,
        } => run_client(cfg, shutdown, protocol, &host, port).await,
        Mode::Server { protocol, port } => run_server(cfg, shutdown, protocol, port).await,
    }
}

async fn run_client(
    cfg: Config,
    shutdown: Shutdown,
    protocol: Protocol,
    host: &str,
    port: u16,
) -> anyhow::Result<()> {
    let mut payload = Vec::new();
    tokio::io::stdin()
        .read_to_end(&mut payload)
        .await
        .context("failed to read standard input")?;

    let server = resolve(host, port).await?;
    let session_id: u64 = rand::random();
    log::info!(
        "[{protocol}] session {session_id}: sending {} bytes to {server}",
        payload.len()
    );

    let mut client = Client::new(cfg, shutdown)?;
    let report = client
        .send(protocol, server, session_id, &payload)
        .await
        .with_context(|| format!("session {session_id} failed"))?;

    log::info!(
        "[{protocol}] session {} complete: {} chunks, {} bytes on the wire, {} retransmits, {:.3}s",
        report.session_id,
        report.chunks,
        report.bytes_sent,
        report.retransmits,
        report.elapsed.as_secs_f64()
    );
    Ok(())
}

/// Resolve `host` to its first IPv4 address.
async fn resolve(host: &str, port: u16) -> anyhow::Result<SocketAddr> {
    tokio::net::lookup_host((host, port))
        .await
        .with_context(|| format!("cannot resolve {host}"))?
        .find(SocketAddr::is_ipv4)
        .with_context(|| format!("{host} has no IPv4 address"))
}

async fn run_server(
    cfg: Config,
    shutdown: Shutdown,
    protocol: Protocol,
    port: u16,
) -> anyhow::Result<()> {
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    let (tx, mut rx) = mpsc::unbounded_channel::<SessionReport>();

    let printer = tokio::spawn(async move {
        let mut out = tokio::io::stdout();
        while let Some(report) = rx.recv().await {
            if let Ok(payload) = report.outcome {
                out.write_all(&payload).await?;
                out.flush().await?;
            }
        }
        Ok::<_, std::io::Error>(())
    });

    match protocol {
        Protocol::Tcp => TcpServer::bind(addr, cfg).await?.run(shutdown, tx).await?,
        Protocol::Udp => DatagramServer::bind(addr, cfg).await?.run(shutdown, tx).await?,
        Protocol::Udpr => bail!(ConfigError::UnsupportedProtocol(protocol)),
    }

    printer
        .await
        .context("output task panicked")?
        .context("failed to write to standard output")?;
    Ok(())
}
