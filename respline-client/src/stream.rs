//! Byte stream abstraction over TCP and in-process pipes.
//!
//! Production transports are always TCP. The `Memory` arm carries one end of
//! a `tokio::io::duplex` pipe, which lets a [`Dialer`](crate::transport::Dialer)
//! hand the connection and subscription code a scripted peer: reconnects,
//! split replies and dropped sockets are then driven without a server.

use pin_project_lite::pin_project;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::net::TcpStream;

pin_project! {
    /// A transport stream that is either a TCP socket or an in-memory pipe.
    #[project = TransportStreamProj]
    pub enum TransportStream {
        Tcp { #[pin] stream: TcpStream },
        Memory { #[pin] stream: DuplexStream },
    }
}

impl TransportStream {
    /// Checks the socket's pending-error state (`SO_ERROR`).
    ///
    /// Returns true when the socket reports an error. Pipes never do.
    pub fn has_pending_error(&self) -> bool {
        match self {
            TransportStream::Tcp { stream } => !matches!(stream.take_error(), Ok(None)),
            TransportStream::Memory { .. } => false,
        }
    }
}

impl From<TcpStream> for TransportStream {
    fn from(stream: TcpStream) -> Self {
        TransportStream::Tcp { stream }
    }
}

impl From<DuplexStream> for TransportStream {
    fn from(stream: DuplexStream) -> Self {
        TransportStream::Memory { stream }
    }
}

impl AsyncRead for TransportStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.project() {
            TransportStreamProj::Tcp { stream } => stream.poll_read(cx, buf),
            TransportStreamProj::Memory { stream } => stream.poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for TransportStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.project() {
            TransportStreamProj::Tcp { stream } => stream.poll_write(cx, buf),
            TransportStreamProj::Memory { stream } => stream.poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            TransportStreamProj::Tcp { stream } => stream.poll_flush(cx),
            TransportStreamProj::Memory { stream } => stream.poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            TransportStreamProj::Tcp { stream } => stream.poll_shutdown(cx),
            TransportStreamProj::Memory { stream } => stream.poll_shutdown(cx),
        }
    }
}
