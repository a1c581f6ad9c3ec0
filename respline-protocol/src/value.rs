//! Reply values.

use crate::error::ProtocolError;
use std::fmt;

/// A decoded RESP2 reply.
///
/// Arrays hold fully decoded children in protocol order. `Null` comes from a
/// bulk string (or array) whose declared length is negative, so it is never
/// confused with an empty bulk string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// `$-1` or `*-1`.
    Null,
    /// `:<i64>`.
    Integer(i64),
    /// `+<text>`.
    SimpleString(String),
    /// `$<len>` followed by `len` bytes.
    BulkString(String),
    /// `*<count>` followed by `count` replies.
    Array(Vec<RespValue>),
    /// `-<text>`, a rejection from the server.
    Error(String),
}

impl RespValue {
    /// Short name of the variant, used in mismatch errors.
    pub fn kind(&self) -> &'static str {
        match self {
            RespValue::Null => "null",
            RespValue::Integer(_) => "integer",
            RespValue::SimpleString(_) => "simple string",
            RespValue::BulkString(_) => "bulk string",
            RespValue::Array(_) => "array",
            RespValue::Error(_) => "error",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, RespValue::Null)
    }

    /// Returns true for the `+OK` status reply.
    pub fn is_ok(&self) -> bool {
        matches!(self, RespValue::SimpleString(s) if s == "OK")
    }

    /// Borrows the text of a simple or bulk string.
    pub fn as_text(&self) -> Result<&str, ProtocolError> {
        match self {
            RespValue::SimpleString(s) | RespValue::BulkString(s) => Ok(s),
            other => Err(other.mismatch("text")),
        }
    }

    pub fn as_int(&self) -> Result<i64, ProtocolError> {
        match self {
            RespValue::Integer(n) => Ok(*n),
            other => Err(other.mismatch("integer")),
        }
    }

    pub fn as_array(&self) -> Result<&[RespValue], ProtocolError> {
        match self {
            RespValue::Array(items) => Ok(items),
            other => Err(other.mismatch("array")),
        }
    }

    pub fn into_text(self) -> Result<String, ProtocolError> {
        match self {
            RespValue::SimpleString(s) | RespValue::BulkString(s) => Ok(s),
            other => Err(other.mismatch("text")),
        }
    }

    /// Like [`into_text`](Self::into_text), but maps `Null` to `None`.
    pub fn into_optional_text(self) -> Result<Option<String>, ProtocolError> {
        match self {
            RespValue::Null => Ok(None),
            other => other.into_text().map(Some),
        }
    }

    pub fn into_array(self) -> Result<Vec<RespValue>, ProtocolError> {
        match self {
            RespValue::Array(items) => Ok(items),
            other => Err(other.mismatch("array")),
        }
    }

    /// Finds the first error frame, searching arrays depth-first.
    pub fn first_error(&self) -> Option<&str> {
        match self {
            RespValue::Error(msg) => Some(msg),
            RespValue::Array(items) => items.iter().find_map(RespValue::first_error),
            _ => None,
        }
    }

    fn mismatch(&self, expected: &'static str) -> ProtocolError {
        ProtocolError::TypeMismatch {
            expected,
            found: self.kind(),
        }
    }
}

impl fmt::Display for RespValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RespValue::Null => write!(f, "(nil)"),
            RespValue::Integer(n) => write!(f, "{}", n),
            RespValue::SimpleString(s) | RespValue::BulkString(s) => write!(f, "{}", s),
            RespValue::Error(msg) => write!(f, "(error) {}", msg),
            RespValue::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
        }
    }
}

impl From<&str> for RespValue {
    fn from(s: &str) -> Self {
        RespValue::BulkString(s.to_string())
    }
}

impl From<String> for RespValue {
    fn from(s: String) -> Self {
        RespValue::BulkString(s)
    }
}

impl From<i64> for RespValue {
    fn from(n: i64) -> Self {
        RespValue::Integer(n)
    }
}

impl<T: Into<RespValue>> From<Vec<T>> for RespValue {
    fn from(items: Vec<T>) -> Self {
        RespValue::Array(items.into_iter().map(Into::into).collect())
    }
}
