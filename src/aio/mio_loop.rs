//! [`EventLoop`] backed by `mio::Poll`.
//!
//! The poll and its registration handle are separate: the context owns a
//! [`MioRegistration`] while the application keeps the [`MioEventLoop`]
//! and drives it with [`run_once`](MioEventLoop::run_once).

use std::io;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Poll, Registry};
use tracing::trace;

use crate::aio::event_loop::{EventLoop, Interest, Readiness, Token};
use crate::aio::AsyncClusterContext;
use crate::proto::error::{Error, Result};

const EVENT_CAPACITY: usize = 256;

/// Owns the `mio::Poll` an [`AsyncClusterContext`] is registered with.
pub struct MioEventLoop {
    poll: Poll,
    events: Events,
}

impl MioEventLoop {
    /// Creates a poll with room for 256 events per turn.
    pub fn new() -> Result<Self> {
        Self::with_capacity(EVENT_CAPACITY)
    }

    /// Polls at most `events` readiness events per turn.
    pub fn with_capacity(events: usize) -> Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(events.max(1)),
        })
    }

    /// A registration handle to [`attach`](AsyncClusterContext::attach).
    pub fn registration(&self) -> Result<MioRegistration> {
        Ok(MioRegistration {
            registry: self.poll.registry().try_clone()?,
        })
    }

    /// Waits for readiness once and dispatches what arrived, then expires
    /// deadlines. The wait never exceeds the context's next deadline.
    ///
    /// Returns the number of events dispatched.
    pub fn run_once(
        &mut self,
        ctx: &mut AsyncClusterContext,
        timeout: Option<Duration>,
    ) -> Result<usize> {
        let wait = match (timeout, ctx.next_timeout()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        match self.poll.poll(&mut self.events, wait) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(0),
            Err(e) => return Err(e.into()),
        }

        let mut handled = 0;
        for event in self.events.iter() {
            let readiness = Readiness {
                readable: event.is_readable(),
                writable: event.is_writable(),
                error: event.is_error(),
                hangup: event.is_read_closed() || event.is_write_closed(),
            };
            trace!(token = event.token().0, ?readiness, "readiness");
            ctx.handle_event(Token(event.token().0), readiness);
            handled += 1;
        }
        ctx.handle_timeouts();
        Ok(handled)
    }

    /// Runs until `ctx` has nothing in flight.
    ///
    /// # Errors
    ///
    /// `Error::Timeout` if work is still pending after `timeout`.
    pub fn run_until_idle(&mut self, ctx: &mut AsyncClusterContext, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        while !ctx.is_idle() {
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout);
            }
            self.run_once(ctx, Some(deadline - now))?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for MioEventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MioEventLoop")
            .field("capacity", &self.events.capacity())
            .finish_non_exhaustive()
    }
}

/// Registration half handed to the context.
#[derive(Debug)]
pub struct MioRegistration {
    registry: Registry,
}

impl EventLoop for MioRegistration {
    fn register(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        self.registry
            .register(&mut SourceFd(&fd), mio::Token(token.0), to_mio(interest))
    }

    fn reregister(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        self.registry
            .reregister(&mut SourceFd(&fd), mio::Token(token.0), to_mio(interest))
    }

    fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        self.registry.deregister(&mut SourceFd(&fd))
    }
}

fn to_mio(interest: Interest) -> mio::Interest {
    match (interest.is_readable(), interest.is_writable()) {
        (true, true) => mio::Interest::READABLE | mio::Interest::WRITABLE,
        (false, true) => mio::Interest::WRITABLE,
        _ => mio::Interest::READABLE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interest_mapping() {
        assert!(to_mio(Interest::READABLE).is_readable());
        assert!(!to_mio(Interest::READABLE).is_writable());
        assert!(to_mio(Interest::WRITABLE).is_writable());
        let both = to_mio(Interest::BOTH);
        assert!(both.is_readable() && both.is_writable());
    }

    #[test]
    fn test_idle_context_returns_immediately() {
        let mut ev = MioEventLoop::new().unwrap();
        let mut acc = AsyncClusterContext::new();
        ev.run_until_idle(&mut acc, Duration::ZERO).unwrap();
    }

    #[test]
    fn test_run_once_times_out_quietly() {
        let mut ev = MioEventLoop::new().unwrap();
        let mut acc = AsyncClusterContext::new();
        acc.attach(ev.registration().unwrap()).unwrap();
        let handled = ev.run_once(&mut acc, Some(Duration::from_millis(1))).unwrap();
        assert_eq!(handled, 0);
    }
}
