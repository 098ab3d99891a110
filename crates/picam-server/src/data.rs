//! Data channel: bulk media outside the command channel.
//!
//! A transfer is always announced on the command channel first, with a
//! [`TransferToken`]. The client then connects to the data port and sends a
//! framed [`DataHello`] carrying that token; connections presenting any
//! other token are dropped.
//!
//! Two modes exist:
//! - finite: the whole payload is written, then the connection is shut down
//!   ([`DataChannel::send_finite`]);
//! - continuous: camera chunks are forwarded to a [`MediaSink`] by [`pump`]
//!   until the producer goes away; closing the sink ends the transfer.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout, timeout_at};
use tracing::{debug, info, warn};

use picam_protocol::{DataHello, FrameReader, TransferToken};

use crate::camera::TS_PACKET_SIZE;
use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};

/// Bytes per stream datagram: seven whole transport stream packets.
pub const DATAGRAM_PAYLOAD: usize = 7 * TS_PACKET_SIZE;

/// Listener for data connections.
///
/// Shared by every control connection; concurrent transfers are prevented
/// by the device lease each of them holds.
pub struct DataChannel {
    listener: TcpListener,
    accept_timeout: Duration,
    hello_timeout: Duration,
    write_timeout: Duration,
}

impl DataChannel {
    /// Binds the data listener described by `config`.
    pub async fn bind(config: &ServerConfig) -> ServerResult<Self> {
        let addr = config.data_addr()?;
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "Data channel listening");
        Ok(Self {
            listener,
            accept_timeout: config.data_accept_timeout,
            hello_timeout: config.hello_timeout,
            write_timeout: config.write_timeout,
        })
    }

    /// Local address of the data listener.
    pub fn local_addr(&self) -> ServerResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts data connections until one presents `token`.
    pub async fn accept_transfer(&self, token: TransferToken) -> ServerResult<TcpStream> {
        let deadline = Instant::now() + self.accept_timeout;
        loop {
            let (mut stream, peer) = timeout_at(deadline, self.listener.accept())
                .await
                .map_err(|_| ServerError::timeout("data connection accept"))??;

            let hello = timeout(
                self.hello_timeout,
                FrameReader::new(&mut stream).read_message::<DataHello>(),
            )
            .await;

            match hello {
                Ok(Ok(Some(hello))) if hello.transfer_token == token => {
                    debug!(peer = %peer, %token, "Data connection accepted");
                    return Ok(stream);
                }
                Ok(Ok(Some(hello))) => {
                    warn!(
                        peer = %peer,
                        presented = %hello.transfer_token,
                        "Dropping data connection with foreign transfer token"
                    );
                }
                Ok(Ok(None)) => debug!(peer = %peer, "Data connection closed before hello"),
                Ok(Err(e)) => warn!(peer = %peer, error = %e, "Invalid data connection hello"),
                Err(_) => warn!(peer = %peer, "Data connection hello timed out"),
            }
        }
    }

    /// Accepts the transfer for `token` and writes `payload` in full.
    pub async fn send_finite(&self, token: TransferToken, payload: &[u8]) -> ServerResult<()> {
        let mut stream = self.accept_transfer(token).await?;
        timeout(self.write_timeout, async {
            stream.write_all(payload).await?;
            stream.shutdown().await
        })
        .await
        .map_err(|_| ServerError::timeout("data transfer"))?
        .map_err(|e| ServerError::transfer(e.to_string()))?;
        debug!(bytes = payload.len(), "Finite transfer complete");
        Ok(())
    }
}

/// Where continuous media goes.
pub enum MediaSink {
    /// A data-channel connection, closed to signal the end.
    Data(TcpStream),
    /// UDP datagrams to a fixed destination.
    Datagram {
        socket: UdpSocket,
        destination: SocketAddr,
        pending: Vec<u8>,
    },
}

impl MediaSink {
    /// Creates a datagram sink sending to `destination`.
    pub async fn datagram(destination: SocketAddr) -> ServerResult<Self> {
        let bind: SocketAddr = if destination.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = UdpSocket::bind(bind).await?;
        Ok(Self::Datagram {
            socket,
            destination,
            pending: Vec::with_capacity(DATAGRAM_PAYLOAD * 2),
        })
    }

    /// Short description for logs.
    pub fn describe(&self) -> String {
        match self {
            Self::Data(stream) => match stream.peer_addr() {
                Ok(peer) => format!("data connection to {peer}"),
                Err(_) => "data connection".to_string(),
            },
            Self::Datagram { destination, .. } => format!("udp://{destination}"),
        }
    }

    /// Writes one chunk; returns how many bytes left this process.
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> std::io::Result<usize> {
        match self {
            Self::Data(stream) => {
                stream.write_all(chunk).await?;
                Ok(chunk.len())
            }
            Self::Datagram {
                socket,
                destination,
                pending,
            } => {
                pending.extend_from_slice(chunk);
                let mut sent = 0;
                let mut offset = 0;
                while pending.len() - offset >= DATAGRAM_PAYLOAD {
                    let datagram = &pending[offset..offset + DATAGRAM_PAYLOAD];
                    sent += send_datagram(socket, *destination, datagram).await;
                    offset += DATAGRAM_PAYLOAD;
                }
                pending.drain(..offset);
                Ok(sent)
            }
        }
    }

    /// Flushes buffered bytes and closes the sink; returns bytes flushed.
    pub async fn close(self) -> std::io::Result<usize> {
        match self {
            Self::Data(mut stream) => {
                stream.flush().await?;
                stream.shutdown().await?;
                Ok(0)
            }
            Self::Datagram {
                socket,
                destination,
                pending,
            } => {
                let mut sent = 0;
                for datagram in pending.chunks(DATAGRAM_PAYLOAD) {
                    sent += send_datagram(&socket, destination, datagram).await;
                }
                Ok(sent)
            }
        }
    }
}

/// Sends one datagram. Loss is normal for a live stream: errors are logged
/// and the datagram counts as not sent.
async fn send_datagram(socket: &UdpSocket, destination: SocketAddr, datagram: &[u8]) -> usize {
    match socket.send_to(datagram, destination).await {
        Ok(n) => n,
        Err(e) => {
            debug!(%destination, error = %e, "Dropped stream datagram");
            0
        }
    }
}

/// Forwards camera chunks to `sink` until the producer side closes.
///
/// After a sink failure the remaining chunks are still drained so the
/// encoder never blocks; the failure is reported once the channel closes.
/// Returns the number of bytes the sink accepted.
pub async fn pump(
    mut chunks: mpsc::Receiver<Vec<u8>>,
    mut sink: MediaSink,
    write_timeout: Duration,
) -> ServerResult<u64> {
    let label = sink.describe();
    let mut sent = 0u64;
    let mut failure: Option<ServerError> = None;

    while let Some(chunk) = chunks.recv().await {
        if failure.is_some() {
            continue;
        }
        match timeout(write_timeout, sink.write_chunk(&chunk)).await {
            Ok(Ok(n)) => sent += n as u64,
            Ok(Err(e)) => {
                warn!(sink = %label, error = %e, "Media sink failed; discarding remaining chunks");
                failure = Some(ServerError::transfer(e.to_string()));
            }
            Err(_) => {
                warn!(sink = %label, "Media sink write timed out; discarding remaining chunks");
                failure = Some(ServerError::timeout("media write"));
            }
        }
    }

    if let Some(err) = failure {
        return Err(err);
    }

    let flushed = timeout(write_timeout, sink.close())
        .await
        .map_err(|_| ServerError::timeout("closing media sink"))?
        .map_err(|e| ServerError::transfer(e.to_string()))?;
    sent += flushed as u64;
    debug!(sink = %label, bytes = sent, "Media sink closed");
    Ok(sent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use picam_protocol::encode_message;
    use tokio::io::AsyncReadExt;

    async fn channel() -> DataChannel {
        let config = ServerConfig::ephemeral().with_data_accept_timeout(Duration::from_secs(2));
        DataChannel::bind(&config).await.unwrap()
    }

    async fn connect_with(addr: SocketAddr, token: TransferToken) -> TcpStream {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let hello = encode_message(&DataHello {
            transfer_token: token,
        })
        .unwrap();
        stream.write_all(&hello).await.unwrap();
        stream
    }

    #[tokio::test]
    async fn finite_transfer_delivers_exact_bytes() {
        let data = channel().await;
        let addr = data.local_addr().unwrap();
        let token = TransferToken::new();
        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();

        let client = tokio::spawn(async move {
            let mut stream = connect_with(addr, token).await;
            let mut received = Vec::new();
            stream.read_to_end(&mut received).await.unwrap();
            received
        });

        data.send_finite(token, &payload).await.unwrap();
        assert_eq!(client.await.unwrap(), payload);
    }

    #[tokio::test]
    async fn foreign_token_is_dropped() {
        let data = channel().await;
        let addr = data.local_addr().unwrap();
        let token = TransferToken::new();

        let client = tokio::spawn(async move {
            let mut intruder = connect_with(addr, TransferToken::new()).await;
            let mut buf = Vec::new();
            // Dropped without data.
            intruder.read_to_end(&mut buf).await.unwrap();
            assert!(buf.is_empty());

            let mut stream = connect_with(addr, token).await;
            let mut received = Vec::new();
            stream.read_to_end(&mut received).await.unwrap();
            received
        });

        data.send_finite(token, b"picture").await.unwrap();
        assert_eq!(client.await.unwrap(), b"picture");
    }

    #[tokio::test]
    async fn accept_times_out_without_client() {
        let config =
            ServerConfig::ephemeral().with_data_accept_timeout(Duration::from_millis(50));
        let data = DataChannel::bind(&config).await.unwrap();
        let err = data.accept_transfer(TransferToken::new()).await.unwrap_err();
        assert!(matches!(err, ServerError::Timeout(_)));
    }

    #[tokio::test]
    async fn pump_counts_and_closes_data_sink() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let reader = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            let mut received = Vec::new();
            stream.read_to_end(&mut received).await.unwrap();
            received.len()
        });
        let (stream, _) = listener.accept().await.unwrap();

        let (tx, rx) = mpsc::channel(4);
        let pump = tokio::spawn(pump(rx, MediaSink::Data(stream), Duration::from_secs(1)));
        for _ in 0..10 {
            tx.send(vec![7u8; 1000]).await.unwrap();
        }
        drop(tx);

        assert_eq!(pump.await.unwrap().unwrap(), 10_000);
        assert_eq!(reader.await.unwrap(), 10_000);
    }

    #[tokio::test]
    async fn datagram_sink_sends_whole_packets() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let destination = receiver.local_addr().unwrap();
        let sink = MediaSink::datagram(destination).await.unwrap();
        assert_eq!(sink.describe(), format!("udp://{destination}"));

        let (tx, rx) = mpsc::channel(4);
        let pump = tokio::spawn(pump(rx, sink, Duration::from_secs(1)));
        // Ten packets: one full datagram plus a three-packet tail.
        tx.send(vec![0x47; TS_PACKET_SIZE * 10]).await.unwrap();
        drop(tx);
        assert_eq!(pump.await.unwrap().unwrap(), (TS_PACKET_SIZE * 10) as u64);

        let mut buf = vec![0u8; 4096];
        let first = receiver.recv(&mut buf).await.unwrap();
        assert_eq!(first, DATAGRAM_PAYLOAD);
        let second = receiver.recv(&mut buf).await.unwrap();
        assert_eq!(second, TS_PACKET_SIZE * 3);
    }
}
