//! TCP listener for the command channel.
//!
//! One task is spawned per accepted control connection; the number of
//! concurrent connections is bounded by a semaphore. The data channel
//! listener is bound alongside and shared by all connections.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tracing::{Instrument, debug, error, info, info_span};

use picam_protocol::{CommandEnvelope, FrameReader, FrameWriter, ResponseEnvelope, decode_payload};

use crate::camera::Camera;
use crate::config::ServerConfig;
use crate::data::DataChannel;
use crate::device::Device;
use crate::error::{ServerError, ServerResult};
use crate::handler::RequestHandler;

/// Command and data listeners plus the camera they serve.
pub struct CameraServer {
    config: ServerConfig,
    listener: TcpListener,
    data: Arc<DataChannel>,
    device: Device,
    connection_semaphore: Arc<Semaphore>,
}

impl CameraServer {
    /// Binds the command and data listeners.
    pub async fn bind(config: ServerConfig, camera: impl Camera) -> ServerResult<Self> {
        let listener = TcpListener::bind(config.command_addr()?).await?;
        info!(addr = %listener.local_addr()?, "Command channel listening");
        let data = Arc::new(DataChannel::bind(&config).await?);
        let connection_semaphore = Arc::new(Semaphore::new(config.max_connections));

        Ok(Self {
            config,
            listener,
            data,
            device: Device::new(camera),
            connection_semaphore,
        })
    }

    /// Local address of the command listener.
    pub fn command_addr(&self) -> ServerResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Local address of the data listener.
    pub fn data_addr(&self) -> ServerResult<SocketAddr> {
        self.data.local_addr()
    }

    /// The camera device served by this server.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Accepts a single control connection.
    pub async fn accept(&self) -> ServerResult<Connection> {
        let permit = Arc::clone(&self.connection_semaphore)
            .acquire_owned()
            .await
            .map_err(|_| ServerError::config("connection semaphore closed"))?;

        let (stream, peer) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        debug!(peer = %peer, "Accepted control connection");

        let (read, write) = stream.into_split();
        Ok(Connection {
            reader: FrameReader::new(read),
            writer: FrameWriter::new(write),
            peer,
            idle_timeout: self.config.idle_timeout,
            write_timeout: self.config.write_timeout,
            _permit: permit,
        })
    }

    /// Builds the handler that serves connections of this server.
    pub fn handler(&self) -> RequestHandler {
        RequestHandler::new(
            self.config.clone(),
            self.device.clone(),
            Arc::clone(&self.data),
        )
    }

    /// Runs the accept loop, one task per connection.
    pub async fn run(&self) -> ServerResult<()> {
        let handler = Arc::new(self.handler());
        loop {
            match self.accept().await {
                Ok(connection) => {
                    let handler = Arc::clone(&handler);
                    let span = info_span!("connection", peer = %connection.peer());
                    tokio::spawn(
                        async move { handler.handle_connection(connection).await }.instrument(span),
                    );
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    /// Runs the accept loop until `shutdown` completes.
    pub async fn run_until_shutdown<S>(&self, shutdown: S) -> ServerResult<()>
    where
        S: Future<Output = ()> + Send,
    {
        tokio::select! {
            result = self.run() => result,
            _ = shutdown => {
                info!("Shutdown signal received");
                Ok(())
            }
        }
    }
}

/// One control connection.
pub struct Connection {
    reader: FrameReader<OwnedReadHalf>,
    writer: FrameWriter<OwnedWriteHalf>,
    peer: SocketAddr,
    idle_timeout: Option<Duration>,
    write_timeout: Duration,
    _permit: OwnedSemaphorePermit,
}

impl Connection {
    /// Address of the client.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Reads the next command, honouring the idle timeout.
    ///
    /// Returns `Ok(None)` when the client closed the connection.
    pub async fn read_command(&mut self) -> ServerResult<Option<CommandEnvelope>> {
        let frame = match self.idle_timeout {
            Some(idle) => timeout(idle, self.reader.read_frame())
                .await
                .map_err(|_| ServerError::timeout("waiting for command"))??,
            None => self.reader.read_frame().await?,
        };
        match frame {
            Some(payload) => Ok(Some(decode_payload(&payload)?)),
            None => Ok(None),
        }
    }

    /// Reads the next raw frame with no deadline.
    pub async fn read_frame_untimed(&mut self) -> ServerResult<Option<Vec<u8>>> {
        Ok(self.reader.read_frame().await?)
    }

    /// Writes one reply within the write timeout.
    pub async fn respond(&mut self, reply: &ResponseEnvelope) -> ServerResult<()> {
        timeout(self.write_timeout, self.writer.write_message(reply))
            .await
            .map_err(|_| ServerError::timeout("writing reply"))??;
        Ok(())
    }
}
