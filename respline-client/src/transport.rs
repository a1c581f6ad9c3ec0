//! Raw byte channel to one server.

use crate::connection::ConnectionConfig;
use crate::error::ClientError;
use crate::stream::TransportStream;
use bytes::{Bytes, BytesMut};
use std::future::Future;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::TcpStream;

/// One socket, owned by exactly one logical path (the primary connection or
/// a single subscription).
///
/// `read` returns whatever is available, which may be less than one frame.
/// An empty read means the peer closed; after that, or after any I/O error,
/// the transport reports itself as not alive.
pub struct Transport {
    stream: Option<TransportStream>,
    read_buf: BytesMut,
    read_buffer_size: usize,
    alive: bool,
}

impl Transport {
    /// Opens a TCP connection to the configured server.
    pub async fn connect(config: &ConnectionConfig) -> Result<Self, ClientError> {
        let addr = config.addr();
        tracing::debug!("Connecting to {}...", addr);

        let stream = tokio::time::timeout(
            config.connect_timeout,
            TcpStream::connect((config.host.as_str(), config.port)),
        )
        .await
        .map_err(|_| {
            tracing::debug!("Connection to {} timed out", addr);
            ClientError::ConnectTimeout { addr: addr.clone() }
        })?
        .map_err(|source| {
            tracing::debug!("Connection to {} failed: {}", addr, source);
            ClientError::Connect {
                addr: addr.clone(),
                source,
            }
        })?;

        // Request/reply traffic is small frames; don't let Nagle hold them back.
        stream.set_nodelay(true).ok();

        tracing::debug!("TCP connected to {}", addr);
        Ok(Self::from_stream(stream, config.read_buffer_size))
    }

    /// Wraps an already established stream.
    pub fn from_stream(stream: impl Into<TransportStream>, read_buffer_size: usize) -> Self {
        Self {
            stream: Some(stream.into()),
            read_buf: BytesMut::with_capacity(read_buffer_size),
            read_buffer_size,
            alive: true,
        }
    }

    /// Wraps one end of an in-memory pipe, with the default read buffer size.
    pub fn from_duplex(stream: DuplexStream) -> Self {
        Self::from_stream(stream, crate::connection::DEFAULT_READ_BUFFER_SIZE)
    }

    /// Writes every byte of `data`, retrying partial writes.
    pub async fn write(&mut self, data: &[u8]) -> Result<(), ClientError> {
        let stream = self.stream.as_mut().ok_or(ClientError::NotConnected)?;
        let result = async {
            stream.write_all(data).await?;
            stream.flush().await
        }
        .await;

        if let Err(e) = result {
            self.alive = false;
            return Err(ClientError::Io(e));
        }
        Ok(())
    }

    /// Waits for at least one byte and returns everything available.
    ///
    /// An empty result means the peer closed the stream.
    pub async fn read(&mut self) -> Result<Bytes, ClientError> {
        let stream = self.stream.as_mut().ok_or(ClientError::NotConnected)?;
        self.read_buf.reserve(self.read_buffer_size);

        match stream.read_buf(&mut self.read_buf).await {
            Ok(0) => {
                tracing::debug!("Peer closed the connection");
                self.alive = false;
                Ok(Bytes::new())
            }
            Ok(_) => Ok(self.read_buf.split().freeze()),
            Err(e) => {
                self.alive = false;
                Err(ClientError::Io(e))
            }
        }
    }

    /// Best-effort liveness check: false once closed, after EOF or an I/O
    /// error, or when the socket has a pending error.
    pub fn is_alive(&self) -> bool {
        match &self.stream {
            Some(stream) => self.alive && !stream.has_pending_error(),
            None => false,
        }
    }

    /// Shuts the stream down. Safe to call more than once.
    pub async fn close(&mut self) {
        self.alive = false;
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
    }
}

/// Opens transports. The primary connection uses it to reconnect and the
/// subscription manager uses it to open one transport per channel.
pub trait Dialer: Send + Sync + 'static {
    fn dial(
        &self,
        config: &ConnectionConfig,
    ) -> impl Future<Output = Result<Transport, ClientError>> + Send;
}

/// Dials real TCP connections.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpDialer;

impl Dialer for TcpDialer {
    async fn dial(&self, config: &ConnectionConfig) -> Result<Transport, ClientError> {
        Transport::connect(config).await
    }
}
