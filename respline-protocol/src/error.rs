//! Protocol error types.

use thiserror::Error;

/// Errors raised while encoding, decoding or inspecting RESP values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Zero bytes were available where a reply was expected.
    #[error("empty response")]
    EmptyResponse,

    /// The leading type byte is not one of `+ - : $ *`.
    #[error("unknown RESP type byte: {0:#04x}")]
    UnknownType(u8),

    /// The bytes do not form valid RESP.
    #[error("malformed encoding: {0}")]
    MalformedEncoding(String),

    /// The buffer ends before the frame does.
    #[error("incomplete frame")]
    Incomplete,

    /// A reply was extracted as a type it does not hold.
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },
}

impl ProtocolError {
    pub(crate) fn malformed(detail: impl Into<String>) -> Self {
        ProtocolError::MalformedEncoding(detail.into())
    }

    /// Returns whether more input could turn this error into a success.
    pub fn is_incomplete(&self) -> bool {
        matches!(self, ProtocolError::Incomplete)
    }
}
