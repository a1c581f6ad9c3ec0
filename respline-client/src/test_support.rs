//! In-process fakes for driving connections and subscriptions in tests.

use crate::connection::ConnectionConfig;
use crate::error::ClientError;
use crate::transport::{Dialer, Transport};
use respline_protocol::{Decoder, Encoder, RespValue};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};

const PIPE_CAPACITY: usize = 64 * 1024;

/// Hands out pre-queued in-memory pipes instead of dialing TCP.
///
/// Dialing with an empty queue fails like a refused connection.
#[derive(Clone, Default)]
pub(crate) struct MemoryDialer {
    pipes: Arc<Mutex<VecDeque<DuplexStream>>>,
    dials: Arc<AtomicUsize>,
}

impl MemoryDialer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Queues a pipe for the next dial and returns its server end.
    pub(crate) fn push_pipe(&self) -> DuplexStream {
        let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
        self.pipes.lock().unwrap().push_back(client);
        server
    }

    pub(crate) fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

impl Dialer for MemoryDialer {
    async fn dial(&self, config: &ConnectionConfig) -> Result<Transport, ClientError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let pipe = self.pipes.lock().unwrap().pop_front();
        match pipe {
            Some(stream) => Ok(Transport::from_stream(stream, config.read_buffer_size)),
            None => Err(ClientError::Connect {
                addr: config.addr(),
                source: std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "no pipe queued",
                ),
            }),
        }
    }
}

/// Server end of a stream: reads command arrays and writes replies.
pub(crate) struct FakeServer<S> {
    stream: S,
    decoder: Decoder,
}

impl<S: AsyncRead + AsyncWrite + Unpin> FakeServer<S> {
    pub(crate) fn new(stream: S) -> Self {
        Self {
            stream,
            decoder: Decoder::new(),
        }
    }

    /// Reads the next command as its list of arguments, or `None` on EOF.
    pub(crate) async fn next_command(&mut self) -> Option<Vec<String>> {
        let mut buf = [0u8; 4096];
        loop {
            if let Some(value) = self.decoder.decode_reply().unwrap() {
                let args = value
                    .into_array()
                    .unwrap()
                    .into_iter()
                    .map(|arg| arg.into_text().unwrap())
                    .collect();
                return Some(args);
            }
            let n = self.stream.read(&mut buf).await.ok()?;
            if n == 0 {
                return None;
            }
            self.decoder.extend(&buf[..n]);
        }
    }

    pub(crate) async fn reply(&mut self, value: &RespValue) {
        self.reply_raw(&Encoder::encode_value(value)).await;
    }

    pub(crate) async fn reply_raw(&mut self, data: &[u8]) {
        let _ = self.stream.write_all(data).await;
        let _ = self.stream.flush().await;
    }
}
