//! Data-channel receivers.
//!
//! Every data connection starts with a framed [`DataHello`] carrying the
//! token from the reply that announced the transfer. Finite transfers are
//! read in the foreground until the announced size is reached; recordings
//! are read by a background [`RecordingReceiver`] until the server closes
//! the connection or the receiver is cancelled.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use picam_protocol::{DataHello, FrameWriter, TransferToken};

use crate::config::Timeouts;
use crate::error::{ClientError, ClientResult};

const READ_BUFFER: usize = 64 * 1024;

/// Opens a data connection and presents `token`.
pub async fn open_data(
    endpoint: &str,
    token: TransferToken,
    timeouts: Timeouts,
) -> ClientResult<TcpStream> {
    let mut stream = timeout(timeouts.connect, TcpStream::connect(endpoint))
        .await
        .map_err(|_| ClientError::Timeout(format!("connecting data channel {}", endpoint)))?
        .map_err(|e| {
            ClientError::Connection(format!("failed to connect data channel {}: {}", endpoint, e))
        })?;
    FrameWriter::new(&mut stream)
        .write_message(&DataHello {
            transfer_token: token,
        })
        .await?;
    debug!(endpoint = %endpoint, %token, "Data connection opened");
    Ok(stream)
}

/// Receives exactly `size` bytes of a finite transfer.
pub async fn receive_finite(
    endpoint: &str,
    token: TransferToken,
    size: u64,
    timeouts: Timeouts,
) -> ClientResult<Vec<u8>> {
    let expected = usize::try_from(size)
        .map_err(|_| ClientError::Protocol(format!("announced size {} is too large", size)))?;
    let mut stream = open_data(endpoint, token, timeouts).await?;
    read_exactly(&mut stream, expected, timeouts.transfer).await
}

/// Reads `expected` bytes, growing the buffer as they arrive.
///
/// The announced size comes from the peer, so at most [`READ_BUFFER`] is
/// reserved up front.
async fn read_exactly<R: AsyncRead + Unpin>(
    stream: &mut R,
    expected: usize,
    per_read: Duration,
) -> ClientResult<Vec<u8>> {
    let mut data = Vec::with_capacity(expected.min(READ_BUFFER));
    while data.len() < expected {
        let received = data.len();
        let remaining = (expected - received) as u64;
        let n = timeout(per_read, (&mut *stream).take(remaining).read_buf(&mut data))
            .await
            .map_err(|_| ClientError::Timeout(format!("reading data after {} bytes", received)))??;
        if n == 0 {
            return Err(ClientError::Transfer(format!(
                "peer closed the data connection after {} of {} bytes",
                received, expected
            )));
        }
    }
    Ok(data)
}

/// Background task writing a close-terminated recording to disk.
pub struct RecordingReceiver {
    path: PathBuf,
    cancel: watch::Sender<bool>,
    task: JoinHandle<ClientResult<u64>>,
}

impl RecordingReceiver {
    /// Opens the data connection and starts writing to `path`.
    ///
    /// The connection is opened before this returns, so the server's accept
    /// is satisfied even if the caller goes on to do something else.
    pub async fn spawn(
        endpoint: &str,
        token: TransferToken,
        path: PathBuf,
        timeouts: Timeouts,
    ) -> ClientResult<Self> {
        let file = File::create(&path).await.map_err(|e| {
            ClientError::InvalidArgument(format!("cannot create {}: {}", path.display(), e))
        })?;
        let stream = open_data(endpoint, token, timeouts).await?;
        let (cancel, cancelled) = watch::channel(false);
        let task = tokio::spawn(receive_until_closed(stream, file, cancelled, path.clone()));
        Ok(Self { path, cancel, task })
    }

    /// Where the recording is written.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Asks the task to stop reading and close the file.
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }

    /// Waits for the server to close the connection; returns bytes written.
    ///
    /// If that takes longer than `deadline` the task is cancelled and a
    /// timeout is reported.
    pub async fn finish(mut self, deadline: Duration) -> ClientResult<u64> {
        match timeout(deadline, &mut self.task).await {
            Ok(joined) => {
                joined.map_err(|e| ClientError::Transfer(format!("receiver task failed: {}", e)))?
            }
            Err(_) => {
                self.cancel();
                let _ = timeout(Duration::from_secs(1), &mut self.task).await;
                Err(ClientError::Timeout(format!(
                    "waiting for recording {} to finish",
                    self.path.display()
                )))
            }
        }
    }
}

impl Drop for RecordingReceiver {
    fn drop(&mut self) {
        let _ = self.cancel.send(true);
    }
}

async fn receive_until_closed(
    mut stream: TcpStream,
    file: File,
    mut cancelled: watch::Receiver<bool>,
    path: PathBuf,
) -> ClientResult<u64> {
    let mut out = BufWriter::new(file);
    let mut buf = vec![0u8; READ_BUFFER];
    let mut total = 0u64;

    loop {
        tokio::select! {
            biased;
            changed = cancelled.changed() => {
                if changed.is_err() || *cancelled.borrow() {
                    warn!(path = %path.display(), bytes = total, "Recording receiver cancelled");
                    break;
                }
            }
            read = stream.read(&mut buf) => {
                let n = read?;
                if n == 0 {
                    break;
                }
                out.write_all(&buf[..n]).await?;
                total += n as u64;
            }
        }
    }

    out.flush().await?;
    info!(path = %path.display(), bytes = total, "Recording saved");
    Ok(total)
}
