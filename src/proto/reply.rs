//! Decoded reply values.

use bytes::Bytes;

/// A decoded RESP2 reply.
///
/// Ownership moves to whoever receives it from a context. Error replies that
/// are not cluster signals (redirects, auth failures) are delivered as
/// [`Reply::Error`] rather than as an `Err`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Status reply (`+OK`).
    Status(Bytes),
    /// Error reply (`-ERR ...`).
    Error(Bytes),
    /// Integer reply (`:1000`).
    Integer(i64),
    /// Bulk string reply (`$6\r\nfoobar`).
    Bulk(Bytes),
    /// Array reply (`*2\r\n...`).
    Array(Vec<Reply>),
    /// Null bulk string or null array.
    Nil,
}

impl Reply {
    /// Returns true for the `+OK` status.
    pub fn is_ok(&self) -> bool {
        matches!(self, Reply::Status(s) if s.as_ref() == b"OK")
    }

    /// Returns true for error replies.
    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }

    /// Returns true for nil.
    pub fn is_nil(&self) -> bool {
        matches!(self, Reply::Nil)
    }

    /// Text of a status, error or bulk reply, if it is valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Reply::Status(b) | Reply::Error(b) | Reply::Bulk(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Raw bytes of a status, error or bulk reply.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Reply::Status(b) | Reply::Error(b) | Reply::Bulk(b) => Some(b),
            _ => None,
        }
    }

    /// Integer value, if this is an integer reply.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Reply::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Elements of an array reply.
    pub fn as_array(&self) -> Option<&[Reply]> {
        match self {
            Reply::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Text of an error reply.
    pub fn error_message(&self) -> Option<&str> {
        match self {
            Reply::Error(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub(crate) fn kind_name(&self) -> &'static str {
        match self {
            Reply::Status(_) => "status",
            Reply::Error(_) => "error",
            Reply::Integer(_) => "integer",
            Reply::Bulk(_) => "bulk",
            Reply::Array(_) => "array",
            Reply::Nil => "nil",
        }
    }
}
