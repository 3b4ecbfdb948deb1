//! Packet framing over a byte stream.
//!
//! TCP delivers bytes, not messages, so a packet is recovered by reading its
//! type tag first, then exactly as many bytes as that kind needs.  For DATA
//! the 21-byte header is read and validated before any payload byte is
//! consumed: a chunk with an illegal length is reported without trusting
//! the length field.
//!
//! Every read and write is bounded by the idle timeout and loops until the
//! full count has moved, classifying failures as [`SocketError::Timeout`],
//! [`SocketError::Closed`] (nothing moved), or [`SocketError::Incomplete`].

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::config::Config;
use crate::connection::ConnError;
use crate::packet::{DataHeader, Packet, PacketError, PacketKind, DATA_HEADER_LEN};
use crate::socket::SocketError;

/// A packet-oriented view of a byte stream.
#[derive(Debug)]
pub struct Stream<S = TcpStream> {
    inner: S,
    timeout: Duration,
    max_chunk: u32,
}

impl Stream<TcpStream> {
    /// Open a TCP connection to `addr` within one idle timeout.
    pub async fn connect(addr: SocketAddr, cfg: &Config) -> Result<Self, SocketError> {
        let inner = timeout(cfg.timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| SocketError::Timeout)??;
        inner.set_nodelay(true)?;
        Ok(Self::new(inner, cfg))
    }
}

impl<S> Stream<S> {
    pub fn new(inner: S, cfg: &Config) -> Self {
        Self {
            inner,
            timeout: cfg.timeout,
            max_chunk: cfg.max_chunk,
        }
    }
}

impl<S: AsyncWrite + Unpin> Stream<S> {
    /// Write all of `bytes`.
    pub async fn send_exact(&mut self, bytes: &[u8]) -> Result<(), SocketError> {
        let expected = bytes.len();
        let mut written = 0;
        while written < expected {
            let failure = match timeout(self.timeout, self.inner.write(&bytes[written..])).await {
                Ok(Ok(0)) => SocketError::Closed,
                Ok(Ok(n)) => {
                    written += n;
                    continue;
                }
                Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
                Ok(Err(e)) => SocketError::from_io(e),
                Err(_) => SocketError::Timeout,
            };
            return Err(partial(failure, expected, written));
        }
        timeout(self.timeout, self.inner.flush())
            .await
            .map_err(|_| SocketError::Timeout)?
            .map_err(SocketError::from_io)
    }

    /// Encode and write one packet.  Returns the number of bytes written.
    pub async fn send_packet(&mut self, packet: &Packet) -> Result<usize, SocketError> {
        let bytes = packet.encode();
        self.send_exact(&bytes).await?;
        Ok(bytes.len())
    }
}

impl<S: AsyncRead + Unpin> Stream<S> {
    /// Read exactly `n` bytes.
    pub async fn recv_exact(&mut self, n: usize) -> Result<Vec<u8>, SocketError> {
        let mut buf = vec![0u8; n];
        self.fill(&mut buf, 0).await?;
        Ok(buf)
    }

    /// Fill `buf[filled..]`.  `filled` bytes of the same request were
    /// already read, so a failure after them counts as incomplete.
    async fn fill(&mut self, buf: &mut [u8], mut filled: usize) -> Result<(), SocketError> {
        let expected = buf.len();
        while filled < expected {
            let failure = match timeout(self.timeout, self.inner.read(&mut buf[filled..])).await {
                Ok(Ok(0)) => SocketError::Closed,
                Ok(Ok(n)) => {
                    filled += n;
                    continue;
                }
                Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
                Ok(Err(e)) => SocketError::from_io(e),
                Err(_) => SocketError::Timeout,
            };
            return Err(partial(failure, expected, filled));
        }
        Ok(())
    }

    /// Read one complete packet.
    ///
    /// A DATA header declaring a chunk length outside `1..=max_chunk` yields
    /// [`PacketError::InvalidChunkLength`] with the parsed header attached;
    /// its payload is left unread.
    pub async fn recv_packet(&mut self) -> Result<Packet, ConnError> {
        let mut tag = [0u8; 1];
        self.fill(&mut tag, 0).await?;
        let kind = PacketKind::from_tag(tag[0]).ok_or(PacketError::UnknownType(tag[0]))?;

        let Some(len) = kind.fixed_len() else {
            return self.recv_data(tag[0]).await;
        };
        let mut frame = vec![0u8; len];
        frame[0] = tag[0];
        self.fill(&mut frame, 1).await?;
        Ok(Packet::decode(&frame, self.max_chunk)?)
    }

    async fn recv_data(&mut self, tag: u8) -> Result<Packet, ConnError> {
        let mut head = [0u8; DATA_HEADER_LEN];
        head[0] = tag;
        self.fill(&mut head, 1).await?;

        let header = DataHeader::decode(&head)?;
        if !header.chunk_len_valid(self.max_chunk) {
            return Err(PacketError::InvalidChunkLength {
                header,
                max: self.max_chunk,
            }
            .into());
        }

        let mut frame = vec![0u8; DATA_HEADER_LEN + header.chunk_len as usize];
        frame[..DATA_HEADER_LEN].copy_from_slice(&head);
        self.fill(&mut frame, DATA_HEADER_LEN).await?;
        Ok(Packet::decode(&frame, self.max_chunk)?)
    }
}

fn partial(failure: SocketError, expected: usize, moved: usize) -> SocketError {
    if moved == 0 {
        failure
    } else {
        SocketError::Incomplete {
            expected,
            actual: moved,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use super::*;

    fn cfg() -> Config {
        Config {
            timeout: Duration::from_millis(200),
            ..Config::default()
        }
    }

    /// Accepts `limit` bytes, then behaves like a reset connection.
    struct ShortWriter {
        accepted: Vec<u8>,
        limit: usize,
    }

    impl AsyncWrite for ShortWriter {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            let room = self.limit - self.accepted.len();
            if room == 0 {
                return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
            }
            let n = room.min(buf.len());
            self.accepted.extend_from_slice(&buf[..n]);
            Poll::Ready(Ok(n))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn short_write_is_incomplete() {
        let writer = ShortWriter {
            accepted: Vec::new(),
            limit: 5,
        };
        let mut stream = Stream::new(writer, &cfg());
        let err = stream.send_exact(&[7u8; 10]).await.unwrap_err();
        assert!(matches!(
            err,
            SocketError::Incomplete {
                expected: 10,
                actual: 5
            }
        ));
    }

    #[tokio::test]
    async fn write_to_closed_peer_is_closed() {
        let writer = ShortWriter {
            accepted: Vec::new(),
            limit: 0,
        };
        let mut stream = Stream::new(writer, &cfg());
        let err = stream.send_exact(b"abc").await.unwrap_err();
        assert!(matches!(err, SocketError::Closed));
    }

    #[tokio::test]
    async fn short_read_is_incomplete_and_empty_read_is_closed() {
        let mut stream = Stream::new(&[1u8, 2, 3, 4, 5][..], &cfg());
        let err = stream.recv_exact(10).await.unwrap_err();
        assert!(matches!(
            err,
            SocketError::Incomplete {
                expected: 10,
                actual: 5
            }
        ));

        let mut stream = Stream::new(&[0u8; 0][..], &cfg());
        assert!(matches!(
            stream.recv_exact(4).await,
            Err(SocketError::Closed)
        ));
    }

    #[tokio::test]
    async fn packets_are_reframed_from_a_byte_stream() {
        let (a, b) = tokio::io::duplex(64);
        let mut tx = Stream::new(a, &cfg());
        let mut rx = Stream::new(b, &cfg());

        let sent = vec![
            Packet::Conn {
                session_id: 42,
                protocol_id: 1,
                total_len: 10,
            },
            Packet::Data {
                session_id: 42,
                chunk_index: 0,
                payload: b"0123456789".to_vec(),
            },
            Packet::Rcvd { session_id: 42 },
        ];
        let writer = tokio::spawn(async move {
            for pkt in &sent {
                tx.send_packet(pkt).await.unwrap();
            }
            sent
        });

        let mut got = Vec::new();
        for _ in 0..3 {
            got.push(rx.recv_packet().await.unwrap());
        }
        assert_eq!(got, writer.await.unwrap());
    }

    #[tokio::test]
    async fn oversized_chunk_is_rejected_before_payload() {
        let pkt = Packet::Data {
            session_id: 5,
            chunk_index: 3,
            payload: vec![0u8; 8],
        };
        let bytes = pkt.encode();
        let small = Config {
            max_chunk: 4,
            ..cfg()
        };
        let mut stream = Stream::new(&bytes[..], &small);

        let err = stream.recv_packet().await.unwrap_err();
        let ConnError::Packet(err) = err else {
            panic!("expected a packet error");
        };
        let header = err.data_header().copied().unwrap();
        assert_eq!(header.chunk_index, 3);
        assert_eq!(header.chunk_len, 8);
    }

    #[tokio::test]
    async fn truncated_header_is_incomplete() {
        let bytes = Packet::Rcvd { session_id: 1 }.encode();
        let mut stream = Stream::new(&bytes[..4], &cfg());
        let err = stream.recv_packet().await.unwrap_err();
        assert!(matches!(
            err,
            ConnError::Socket(SocketError::Incomplete {
                expected: 9,
                actual: 4
            })
        ));
    }

    #[tokio::test]
    async fn unknown_tag_is_malformed() {
        let mut stream = Stream::new(&[42u8, 0, 0][..], &cfg());
        assert!(matches!(
            stream.recv_packet().await,
            Err(ConnError::Packet(PacketError::UnknownType(42)))
        ));
    }
}
