//! Connection management.

use crate::error::ClientError;
use crate::transport::{Dialer, TcpDialer, Transport};
use respline_protocol::{Decoder, Encoder, ProtocolError, RespValue, DEFAULT_PORT};
use std::sync::Arc;
use std::time::Duration;

/// Default read buffer size (8 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

/// Minimum read buffer size (1 KiB).
pub const MIN_READ_BUFFER_SIZE: usize = 1024;

/// Maximum read buffer size (1 MiB).
pub const MAX_READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Server host name or IP address.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Password sent with AUTH on every (re)connect.
    pub password: Option<String>,
    /// Name sent with CLIENT SETNAME on every (re)connect.
    pub client_name: Option<String>,
    /// Database index sent with SELECT on every (re)connect.
    pub database: Option<i64>,
    /// Connection timeout. Reads have no timeout.
    pub connect_timeout: Duration,
    /// Read buffer size for socket reads.
    pub read_buffer_size: usize,
}

impl ConnectionConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            password: None,
            client_name: None,
            database: None,
            connect_timeout: Duration::from_secs(10),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = Some(name.into());
        self
    }

    pub fn with_database(mut self, index: i64) -> Self {
        self.database = Some(index);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.clamp(MIN_READ_BUFFER_SIZE, MAX_READ_BUFFER_SIZE);
        self
    }

    /// Returns `host:port`, for logs and errors.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::new("127.0.0.1", DEFAULT_PORT)
    }
}

/// Observable state of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    Closed,
}

enum ConnectionState {
    Connected(Transport),
    Disconnected,
    Closed,
}

/// A reconnecting request/reply connection to one server.
///
/// Each `send` is one uninterrupted write + read + decode on the transport.
/// A transport that died, or produced bytes that could not be decoded, is
/// dropped and the next `send` dials a new one, re-running AUTH, CLIENT
/// SETNAME and SELECT as configured. Only `close` is final.
///
/// A `send` whose future is dropped before its reply arrives leaves that
/// reply on the wire; the next `send` then replaces the transport instead of
/// reading a stale answer.
pub struct Connection<D: Dialer = TcpDialer> {
    config: ConnectionConfig,
    dialer: Arc<D>,
    state: ConnectionState,
    decoder: Decoder,
    /// Set while a request is written but its reply not yet decoded.
    in_flight: bool,
}

impl<D: Dialer> Connection<D> {
    /// Creates a new connection (not yet connected).
    pub fn new(config: ConnectionConfig, dialer: Arc<D>) -> Self {
        Self {
            config,
            dialer,
            state: ConnectionState::Disconnected,
            decoder: Decoder::new(),
            in_flight: false,
        }
    }

    /// Creates a connection and performs the initial connect and handshake.
    pub async fn open(config: ConnectionConfig, dialer: Arc<D>) -> Result<Self, ClientError> {
        let mut conn = Self::new(config, dialer);
        conn.connect().await?;
        Ok(conn)
    }

    /// Dials a fresh transport and runs the handshake on it.
    ///
    /// The previous transport, if any, is replaced only once the new one has
    /// completed its handshake.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        if matches!(self.state, ConnectionState::Closed) {
            return Err(ClientError::NotConnected);
        }

        let mut transport = self.dialer.dial(&self.config).await?;
        self.decoder.clear();

        if let Err(e) = handshake(&mut transport, &mut self.decoder, &self.config).await {
            tracing::debug!("Handshake with {} failed: {}", self.config.addr(), e);
            transport.close().await;
            return Err(e);
        }

        tracing::debug!("Connected to {}", self.config.addr());
        self.state = ConnectionState::Connected(transport);
        Ok(())
    }

    /// Sends one command and waits for its reply.
    ///
    /// An error frame anywhere in the reply is returned as
    /// [`ClientError::Server`].
    pub async fn send<A: AsRef<[u8]>>(
        &mut self,
        name: &str,
        args: &[A],
    ) -> Result<RespValue, ClientError> {
        let frame = Encoder::encode_command(name, args);
        tracing::debug!(
            "Sending {} with {} args ({} bytes)",
            name,
            args.len(),
            frame.len()
        );
        let reply = self.round_trip(&frame).await?;
        into_result(reply)
    }

    /// Sends AUTH and returns the raw reply.
    ///
    /// On success the password is kept so later reconnects re-authenticate.
    pub async fn auth(&mut self, password: &str) -> Result<RespValue, ClientError> {
        let reply = self.send("AUTH", &[password]).await?;
        if reply.is_ok() {
            self.config.password = Some(password.to_string());
        }
        Ok(reply)
    }

    async fn round_trip(&mut self, frame: &[u8]) -> Result<RespValue, ClientError> {
        self.ensure_connected().await?;

        let ConnectionState::Connected(transport) = &mut self.state else {
            return Err(ClientError::NotConnected);
        };
        self.in_flight = true;
        let result = exchange(transport, &mut self.decoder, frame).await;
        self.in_flight = false;

        if let Err(e) = &result {
            if e.poisons_transport() {
                tracing::debug!("Dropping transport to {}: {}", self.config.addr(), e);
                self.disconnect().await;
            }
        }
        result
    }

    async fn ensure_connected(&mut self) -> Result<(), ClientError> {
        let alive = match &self.state {
            ConnectionState::Closed => return Err(ClientError::NotConnected),
            ConnectionState::Connected(transport) => transport.is_alive(),
            ConnectionState::Disconnected => false,
        };
        if alive && !self.in_flight {
            return Ok(());
        }
        if self.in_flight {
            tracing::debug!(
                "Abandoned request left a reply outstanding on {}",
                self.config.addr()
            );
        }

        tracing::debug!("Reconnecting to {}...", self.config.addr());
        self.disconnect().await;
        self.connect().await
    }

    async fn disconnect(&mut self) {
        if let ConnectionState::Connected(mut transport) =
            std::mem::replace(&mut self.state, ConnectionState::Disconnected)
        {
            transport.close().await;
        }
        self.decoder.clear();
        self.in_flight = false;
    }

    /// Returns the current state.
    pub fn status(&self) -> ConnectionStatus {
        match self.state {
            ConnectionState::Connected(_) => ConnectionStatus::Connected,
            ConnectionState::Disconnected => ConnectionStatus::Disconnected,
            ConnectionState::Closed => ConnectionStatus::Closed,
        }
    }

    /// Returns whether a live transport is currently held.
    pub fn is_connected(&self) -> bool {
        matches!(&self.state, ConnectionState::Connected(t) if t.is_alive())
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub(crate) fn config_mut(&mut self) -> &mut ConnectionConfig {
        &mut self.config
    }

    /// Closes the connection. Safe to call more than once.
    pub async fn close(&mut self) {
        if let ConnectionState::Connected(mut transport) =
            std::mem::replace(&mut self.state, ConnectionState::Closed)
        {
            tracing::debug!("Closing connection to {}", self.config.addr());
            transport.close().await;
        }
        self.decoder.clear();
        self.in_flight = false;
    }
}

/// Runs AUTH, CLIENT SETNAME and SELECT as configured on a fresh transport.
async fn handshake(
    transport: &mut Transport,
    decoder: &mut Decoder,
    config: &ConnectionConfig,
) -> Result<(), ClientError> {
    if let Some(password) = &config.password {
        tracing::debug!("Authenticating with {}...", config.addr());
        let reply = command(transport, decoder, "AUTH", &[password.as_str()]).await?;
        if !reply.is_ok() {
            return Err(ClientError::NotAuthorized(format!(
                "unexpected AUTH reply: {}",
                reply
            )));
        }
    }

    if let Some(name) = &config.client_name {
        command(transport, decoder, "CLIENT", &["SETNAME", name.as_str()]).await?;
    }

    if let Some(index) = config.database {
        command(transport, decoder, "SELECT", &[index.to_string()]).await?;
    }

    Ok(())
}

async fn command<A: AsRef<[u8]>>(
    transport: &mut Transport,
    decoder: &mut Decoder,
    name: &str,
    args: &[A],
) -> Result<RespValue, ClientError> {
    let frame = Encoder::encode_command(name, args);
    into_result(exchange(transport, decoder, &frame).await?)
}

/// Writes one frame and reads back exactly one reply.
pub(crate) async fn exchange(
    transport: &mut Transport,
    decoder: &mut Decoder,
    frame: &[u8],
) -> Result<RespValue, ClientError> {
    transport.write(frame).await?;
    read_reply(transport, decoder).await
}

/// Reads until the decoder holds one complete reply.
pub(crate) async fn read_reply(
    transport: &mut Transport,
    decoder: &mut Decoder,
) -> Result<RespValue, ClientError> {
    loop {
        if let Some(reply) = decoder.decode_reply()? {
            return Ok(reply);
        }

        let chunk = transport.read().await?;
        if chunk.is_empty() {
            return Err(if decoder.buffered() == 0 {
                ClientError::Protocol(ProtocolError::EmptyResponse)
            } else {
                ClientError::ConnectionClosed
            });
        }
        decoder.extend(&chunk);
    }
}

/// Turns a reply carrying an error frame, at any depth, into an error.
pub(crate) fn into_result(reply: RespValue) -> Result<RespValue, ClientError> {
    match reply.first_error() {
        Some(message) => Err(ClientError::Server(message.to_string())),
        None => Ok(reply),
    }
}
