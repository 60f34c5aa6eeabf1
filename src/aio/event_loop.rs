//! Readiness registration seam between async contexts and an event loop.
//!
//! An [`AsyncClusterContext`](super::AsyncClusterContext) never polls
//! sockets itself. It registers each node socket through an [`EventLoop`]
//! and expects the loop owner to feed readiness back through
//! [`handle_event`](super::AsyncClusterContext::handle_event).

use std::io;
use std::os::fd::RawFd;

/// Identifies a registered connection in readiness notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(pub usize);

/// Readiness a connection waits for. Never empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    readable: bool,
    writable: bool,
}

impl Interest {
    /// Wait for incoming data.
    pub const READABLE: Interest = Interest {
        readable: true,
        writable: false,
    };
    /// Wait for send buffer space.
    pub const WRITABLE: Interest = Interest {
        readable: false,
        writable: true,
    };
    /// Both of the above.
    pub const BOTH: Interest = Interest {
        readable: true,
        writable: true,
    };

    /// Returns true if readability is requested.
    pub fn is_readable(self) -> bool {
        self.readable
    }

    /// Returns true if writability is requested.
    pub fn is_writable(self) -> bool {
        self.writable
    }
}

/// What the loop observed for one token.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    /// Data (or end of stream) can be read
    pub readable: bool,
    /// Data can be written, or a pending connect finished
    pub writable: bool,
    /// The socket reported an error
    pub error: bool,
    /// The peer closed its side
    pub hangup: bool,
}

impl Readiness {
    /// Readable only.
    pub const READABLE: Readiness = Readiness {
        readable: true,
        writable: false,
        error: false,
        hangup: false,
    };
    /// Writable only.
    pub const WRITABLE: Readiness = Readiness {
        readable: false,
        writable: true,
        error: false,
        hangup: false,
    };
}

/// Registration half of an event loop.
///
/// Notifications are edge-triggered from the context's point of view: after
/// a readiness event it reads and writes until the socket would block.
/// `reregister` must re-arm the registration so that a socket which is
/// already ready is reported again.
pub trait EventLoop {
    /// Starts watching `fd`.
    fn register(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()>;

    /// Changes the interest of a watched `fd`.
    fn reregister(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()>;

    /// Stops watching `fd`. Called before the socket is closed.
    fn deregister(&mut self, fd: RawFd) -> io::Result<()>;
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interest_flags() {
        assert!(Interest::READABLE.is_readable());
        assert!(!Interest::READABLE.is_writable());
        assert!(Interest::BOTH.is_readable() && Interest::BOTH.is_writable());
    }

    #[test]
    fn test_readiness_default_is_quiet() {
        let r = Readiness::default();
        assert!(!r.readable && !r.writable && !r.error && !r.hangup);
    }
}
