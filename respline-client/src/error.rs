//! Client error types.

use respline_protocol::ProtocolError;
use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("cannot connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("connect to {addr} timed out")]
    ConnectTimeout { addr: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("not connected")]
    NotConnected,

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("server error: {0}")]
    Server(String),

    #[error("not authorized: {0}")]
    NotAuthorized(String),
}

impl ClientError {
    /// Returns whether the socket could not be opened, failed, or is gone.
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            ClientError::Connect { .. }
                | ClientError::ConnectTimeout { .. }
                | ClientError::Io(_)
                | ClientError::ConnectionClosed
                | ClientError::NotConnected
        )
    }

    /// Returns whether the server answered with an error frame.
    pub fn is_server_error(&self) -> bool {
        matches!(self, ClientError::Server(_))
    }

    /// Returns whether the byte stream can no longer be trusted, so the
    /// transport that produced this error must be discarded.
    pub(crate) fn poisons_transport(&self) -> bool {
        match self {
            ClientError::Protocol(ProtocolError::TypeMismatch { .. }) => false,
            ClientError::Protocol(_) => true,
            other => other.is_connection_failure(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let io = ClientError::Io(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "broken pipe",
        ));
        assert!(io.is_connection_failure());
        assert!(!io.is_server_error());

        let server = ClientError::Server("WRONGPASS invalid password".to_string());
        assert!(server.is_server_error());
        assert!(!server.is_connection_failure());
        assert!(!server.poisons_transport());

        assert!(ClientError::ConnectTimeout {
            addr: "10.0.0.1:6379".to_string()
        }
        .is_connection_failure());
    }

    #[test]
    fn test_protocol_errors_poison_transport() {
        assert!(ClientError::Protocol(ProtocolError::EmptyResponse).poisons_transport());
        assert!(ClientError::Protocol(ProtocolError::UnknownType(b'?')).poisons_transport());
        assert!(!ClientError::Protocol(ProtocolError::TypeMismatch {
            expected: "integer",
            found: "null",
        })
        .poisons_transport());
    }

    #[test]
    fn test_error_display() {
        let err = ClientError::Connect {
            addr: "localhost:6379".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
        };
        assert!(err.to_string().contains("localhost:6379"));

        let err = ClientError::Server("ERR unknown command 'TTT'".to_string());
        assert!(err.to_string().contains("TTT"));
    }
}
