use std::fmt::{self, Write as _};
use std::io;

use thiserror::Error;

/// Result type alias for shardis operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by cluster contexts and their collaborators.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The installed allocator refused an allocation.
    #[error("Out of memory")]
    OutOfMemory,

    /// Invalid argument provided.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of invalid argument.
        message: String,
    },

    /// Multi-key command whose keys hash to different slots.
    ///
    /// Detected before any network I/O. Use hash tags `{...}` to force
    /// related keys into one slot.
    #[error("CROSSSLOT Keys in request don't hash to the same slot")]
    CrossSlot,

    /// The node rejected the credentials, or demanded credentials that were
    /// never sent. The message is the node's reply text, verbatim.
    #[error("{message}")]
    Auth {
        /// Error text as sent by the node (`WRONGPASS ...`, `NOAUTH ...`).
        message: String,
    },

    /// An IO error occurred.
    #[error("IO error: {source}")]
    Io {
        /// The underlying IO error.
        #[from]
        source: io::Error,
    },

    /// The connection was lost or could not be used.
    #[error("connection error: {message}")]
    Connection {
        /// Description of the failure.
        message: String,
    },

    /// No node is known to serve the request, or the cluster reported
    /// itself down until the retry budget ran out.
    #[error("{message}")]
    ClusterDown {
        /// Description of the failure.
        message: String,
    },

    /// The redirect budget ran out.
    #[error("too many cluster redirects, last: {last}")]
    TooManyRetries {
        /// The last redirect or retry signal received.
        last: String,
    },

    /// A protocol error occurred.
    #[error("protocol error: {message}")]
    Protocol {
        /// Description of the error.
        message: String,
    },

    /// The connect or command deadline passed.
    #[error("operation timed out")]
    Timeout,
}

/// Fixed error taxonomy reported by [`Error::kind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ErrorKind {
    /// An allocation was refused.
    OutOfMemory,
    /// The call was malformed and was never sent.
    InvalidArgument,
    /// Credentials were rejected or missing.
    AuthenticationFailed,
    /// Transport failure, including timeouts.
    ConnectionError,
    /// No usable owner for the requested slot.
    ClusterDown,
    /// The redirect budget was exhausted.
    TooManyRetries,
    /// The peer sent something that is not a valid reply.
    ProtocolError,
}

impl Error {
    /// Maps the error onto the fixed taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::OutOfMemory => ErrorKind::OutOfMemory,
            Error::InvalidArgument { .. } | Error::CrossSlot => ErrorKind::InvalidArgument,
            Error::Auth { .. } => ErrorKind::AuthenticationFailed,
            Error::Io { .. } | Error::Connection { .. } | Error::Timeout => {
                ErrorKind::ConnectionError
            }
            Error::ClusterDown { .. } => ErrorKind::ClusterDown,
            Error::TooManyRetries { .. } => ErrorKind::TooManyRetries,
            Error::Protocol { .. } => ErrorKind::ProtocolError,
        }
    }

    /// Returns true for transport failures that justify another attempt on a
    /// fresh connection.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::Io { .. } | Error::Connection { .. } | Error::Timeout
        )
    }

    pub(crate) fn connection(message: impl Into<String>) -> Self {
        Error::Connection {
            message: message.into(),
        }
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Error::Protocol {
            message: message.into(),
        }
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Error::InvalidArgument {
            message: message.into(),
        }
    }

    pub(crate) fn cluster_down(message: impl Into<String>) -> Self {
        Error::ClusterDown {
            message: message.into(),
        }
    }
}

impl Clone for Error {
    fn clone(&self) -> Self {
        match self {
            Error::OutOfMemory => Error::OutOfMemory,
            Error::InvalidArgument { message } => Error::InvalidArgument {
                message: message.clone(),
            },
            Error::CrossSlot => Error::CrossSlot,
            Error::Auth { message } => Error::Auth {
                message: message.clone(),
            },
            Error::Io { source } => Error::Io {
                source: io::Error::new(source.kind(), source.to_string()),
            },
            Error::Connection { message } => Error::Connection {
                message: message.clone(),
            },
            Error::ClusterDown { message } => Error::ClusterDown {
                message: message.clone(),
            },
            Error::TooManyRetries { last } => Error::TooManyRetries { last: last.clone() },
            Error::Protocol { message } => Error::Protocol {
                message: message.clone(),
            },
            Error::Timeout => Error::Timeout,
        }
    }
}

const LAST_ERROR_CAPACITY: usize = 128;

/// Last error recorded by a context: a kind plus a bounded message.
///
/// The message lives in a fixed buffer so recording an error never needs an
/// allocation. Longer messages are cut at a character boundary.
#[derive(Clone)]
pub struct LastError {
    kind: Option<ErrorKind>,
    buf: [u8; LAST_ERROR_CAPACITY],
    len: usize,
}

impl LastError {
    /// Creates an empty record.
    pub const fn new() -> Self {
        Self {
            kind: None,
            buf: [0; LAST_ERROR_CAPACITY],
            len: 0,
        }
    }

    /// Forgets the recorded error.
    pub fn clear(&mut self) {
        self.kind = None;
        self.len = 0;
    }

    /// Records `err`, replacing any previous error.
    pub fn set(&mut self, err: &Error) {
        self.kind = Some(err.kind());
        self.len = 0;
        let _ = write!(self, "{err}");
    }

    /// Kind of the recorded error.
    pub fn kind(&self) -> Option<ErrorKind> {
        self.kind
    }

    /// Message of the recorded error, empty if none.
    pub fn message(&self) -> &str {
        std::str::from_utf8(&self.buf[..self.len]).unwrap_or_default()
    }
}

impl Default for LastError {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Write for LastError {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for ch in s.chars() {
            let width = ch.len_utf8();
            if self.len + width > LAST_ERROR_CAPACITY {
                break;
            }
            ch.encode_utf8(&mut self.buf[self.len..self.len + width]);
            self.len += width;
        }
        Ok(())
    }
}

impl fmt::Debug for LastError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LastError")
            .field("kind", &self.kind)
            .field("message", &self.message())
            .finish()
    }
}
