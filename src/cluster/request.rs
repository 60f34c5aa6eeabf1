//! Per-request redirect state machine.
//!
//! Every command sent through a cluster context owns a [`RequestMachine`].
//! The machine looks at each reply (or transport failure) and decides what
//! happens next; it never performs I/O itself, so the retry policy can be
//! exercised with plain values.
//!
//! ```text
//! Sent -> AwaitingReply -> Completed
//!              |       \-> Failed
//!              v
//!          Redirected -> Retrying -> AwaitingReply ...
//! ```

use crate::cluster::addr::NodeAddr;
use crate::cluster::redirect::{classify, Signal};
use crate::proto::error::Error;
use crate::proto::reply::Reply;

/// Default number of redirects and retries allowed per request.
pub const DEFAULT_MAX_REDIRECTS: u32 = 5;

/// Lifecycle of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Built, not yet written.
    Sent,
    /// Written, waiting for the reply.
    AwaitingReply,
    /// Told to go elsewhere or try again.
    Redirected,
    /// About to be written again.
    Retrying,
    /// Final reply delivered.
    Completed,
    /// Final error delivered.
    Failed,
}

/// What the caller must do after a reply.
#[derive(Debug)]
pub enum Step<'r> {
    /// The reply is final; hand it to the caller.
    Complete,
    /// Point `slot` at the node at `host:port` and resend there.
    Moved {
        /// Slot that moved
        slot: u16,
        /// Host of the new owner
        host: &'r str,
        /// Port of the new owner
        port: u16,
    },
    /// Send `ASKING` and then the request to `host:port`, once.
    Ask {
        /// Host of the node to ask
        host: &'r str,
        /// Port of the node to ask
        port: u16,
    },
    /// Resend to the slot owner, optionally after a slot map refresh.
    Retry {
        /// Whether the slot map should be refreshed first
        refresh: bool,
    },
    /// Give up with this error.
    Fail(Error),
}

/// Redirect and retry bookkeeping for one request.
#[derive(Debug, Clone)]
pub struct RequestMachine {
    state: RequestState,
    attempts: u32,
    max_redirects: u32,
}

impl RequestMachine {
    /// Creates a machine allowing `max_redirects` redirects or retries.
    pub fn new(max_redirects: u32) -> Self {
        Self {
            state: RequestState::Sent,
            attempts: 0,
            max_redirects,
        }
    }

    /// Current state.
    pub fn state(&self) -> RequestState {
        self.state
    }

    /// Redirects and retries consumed so far.
    pub fn redirects(&self) -> u32 {
        self.attempts
    }

    /// Returns true once the request reached `Completed` or `Failed`.
    pub fn is_finished(&self) -> bool {
        matches!(self.state, RequestState::Completed | RequestState::Failed)
    }

    /// The request was written to a connection.
    pub fn written(&mut self) {
        debug_assert!(
            matches!(self.state, RequestState::Sent | RequestState::Retrying),
            "write in state {:?}",
            self.state
        );
        self.state = RequestState::AwaitingReply;
    }

    /// A redirected request is about to be written again.
    pub fn resend(&mut self) {
        debug_assert_eq!(self.state, RequestState::Redirected);
        self.state = RequestState::Retrying;
    }

    /// Feeds the reply received from `sender`.
    ///
    /// Ordinary error replies complete the request; the caller receives
    /// them as values.
    pub fn on_reply<'r>(&mut self, reply: &'r Reply, sender: &'r NodeAddr) -> Step<'r> {
        let Some(signal) = classify(reply) else {
            self.state = RequestState::Completed;
            return Step::Complete;
        };
        let message = || reply.error_message().unwrap_or_default().to_string();

        if signal == Signal::Auth {
            return self.fail(Error::Auth { message: message() });
        }

        if self.attempts >= self.max_redirects {
            let err = match signal {
                Signal::ClusterDown => Error::ClusterDown { message: message() },
                _ => Error::TooManyRetries { last: message() },
            };
            return self.fail(err);
        }
        self.attempts += 1;
        self.state = RequestState::Redirected;

        match signal {
            Signal::Moved { slot, .. } => {
                let (host, port) = signal.target(sender).unwrap_or_default();
                Step::Moved { slot, host, port }
            }
            Signal::Ask { .. } => {
                let (host, port) = signal.target(sender).unwrap_or_default();
                Step::Ask { host, port }
            }
            Signal::TryAgain => Step::Retry { refresh: false },
            Signal::ClusterDown => Step::Retry { refresh: true },
            Signal::Auth => self.fail(Error::Auth { message: message() }),
        }
    }

    /// Feeds a transport failure on the connection the request used.
    pub fn on_transport_error(&mut self, err: Error) -> Step<'static> {
        if self.attempts >= self.max_redirects {
            return self.fail(err);
        }
        self.attempts += 1;
        self.state = RequestState::Redirected;
        Step::Retry { refresh: true }
    }

    /// Ends the request with `err`.
    pub fn fail<'r>(&mut self, err: Error) -> Step<'r> {
        self.state = RequestState::Failed;
        Step::Fail(err)
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn err(s: &str) -> Reply {
        Reply::Error(Bytes::copy_from_slice(s.as_bytes()))
    }

    fn sender() -> NodeAddr {
        NodeAddr::new("127.0.0.1", 7000)
    }

    #[test]
    fn test_plain_reply_completes() {
        let mut machine = RequestMachine::new(DEFAULT_MAX_REDIRECTS);
        machine.written();
        let reply = Reply::Status(Bytes::from_static(b"OK"));
        assert!(matches!(machine.on_reply(&reply, &sender()), Step::Complete));
        assert_eq!(machine.state(), RequestState::Completed);
        assert!(machine.is_finished());
    }

    #[test]
    fn test_ordinary_error_completes() {
        let mut machine = RequestMachine::new(DEFAULT_MAX_REDIRECTS);
        machine.written();
        let reply = err("ERR wrong number of arguments");
        assert!(matches!(machine.on_reply(&reply, &sender()), Step::Complete));
    }

    #[test]
    fn test_moved_then_complete() {
        let mut machine = RequestMachine::new(DEFAULT_MAX_REDIRECTS);
        machine.written();

        let reply = err("MOVED 866 127.0.0.1:7002");
        let sender = sender();
        match machine.on_reply(&reply, &sender) {
            Step::Moved { slot, host, port } => {
                assert_eq!((slot, host, port), (866, "127.0.0.1", 7002));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(machine.state(), RequestState::Redirected);

        machine.resend();
        assert_eq!(machine.state(), RequestState::Retrying);
        machine.written();

        let ok = Reply::Bulk(Bytes::from_static(b"Hello"));
        assert!(matches!(machine.on_reply(&ok, &sender), Step::Complete));
        assert_eq!(machine.redirects(), 1);
    }

    #[test]
    fn test_ask_keeps_target() {
        let mut machine = RequestMachine::new(DEFAULT_MAX_REDIRECTS);
        machine.written();
        let reply = err("ASK 866 :7003");
        let sender = sender();
        match machine.on_reply(&reply, &sender) {
            Step::Ask { host, port } => assert_eq!((host, port), ("127.0.0.1", 7003)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_budget_exhaustion_reports_last_signal() {
        let mut machine = RequestMachine::new(2);
        let reply = err("MOVED 1 127.0.0.1:7001");
        let sender = sender();
        for _ in 0..2 {
            machine.written();
            assert!(matches!(machine.on_reply(&reply, &sender), Step::Moved { .. }));
            machine.resend();
        }
        machine.written();
        match machine.on_reply(&reply, &sender) {
            Step::Fail(Error::TooManyRetries { last }) => {
                assert_eq!(last, "MOVED 1 127.0.0.1:7001");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(machine.state(), RequestState::Failed);
    }

    #[test]
    fn test_zero_budget_fails_on_first_redirect() {
        let mut machine = RequestMachine::new(0);
        machine.written();
        let reply = err("TRYAGAIN Multiple keys request during rehashing of slot");
        assert!(matches!(
            machine.on_reply(&reply, &sender()),
            Step::Fail(Error::TooManyRetries { .. })
        ));
    }

    #[test]
    fn test_clusterdown_retries_with_refresh_then_surfaces() {
        let mut machine = RequestMachine::new(1);
        let reply = err("CLUSTERDOWN The cluster is down");
        let sender = sender();

        machine.written();
        assert!(matches!(
            machine.on_reply(&reply, &sender),
            Step::Retry { refresh: true }
        ));
        machine.resend();
        machine.written();
        match machine.on_reply(&reply, &sender) {
            Step::Fail(Error::ClusterDown { message }) => {
                assert!(message.starts_with("CLUSTERDOWN"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_tryagain_retries_without_refresh() {
        let mut machine = RequestMachine::new(DEFAULT_MAX_REDIRECTS);
        machine.written();
        let reply = err("TRYAGAIN");
        assert!(matches!(
            machine.on_reply(&reply, &sender()),
            Step::Retry { refresh: false }
        ));
    }

    #[test]
    fn test_auth_errors_are_never_retried() {
        let mut machine = RequestMachine::new(DEFAULT_MAX_REDIRECTS);
        machine.written();
        let reply = err("NOAUTH Authentication required.");
        match machine.on_reply(&reply, &sender()) {
            Step::Fail(Error::Auth { message }) => {
                assert_eq!(message, "NOAUTH Authentication required.");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(machine.redirects(), 0);
    }

    #[test]
    fn test_transport_errors_share_the_budget() {
        let mut machine = RequestMachine::new(1);
        machine.written();
        let io = || Error::connection("connection reset");
        assert!(matches!(
            machine.on_transport_error(io()),
            Step::Retry { refresh: true }
        ));
        machine.resend();
        machine.written();
        assert!(matches!(
            machine.on_transport_error(io()),
            Step::Fail(Error::Connection { .. })
        ));
    }
}
