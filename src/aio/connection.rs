//! Non-blocking connection to one node.

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Write};
use std::net::{Shutdown, ToSocketAddrs};
use std::os::fd::AsRawFd;
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes};
use mio::net::TcpStream;
use tracing::{debug, warn};

use crate::aio::event_loop::{EventLoop, Interest, Token};
use crate::aio::AsyncClusterContext;
use crate::alloc::{AllocGuard, GuardedBuf};
use crate::cluster::addr::NodeAddr;
use crate::cluster::registry::NodeKey;
use crate::cluster::request::RequestMachine;
use crate::cluster::router::Route;
use crate::core::connection::ConnectionState;
use crate::core::options::ClusterOptions;
use crate::proto::codec::{encode_command, would_block, Decoder};
use crate::proto::error::{Error, Result};
use crate::proto::reply::Reply;

/// Completion callback of an async command.
pub type Callback = Box<dyn FnOnce(&mut AsyncClusterContext, Result<Reply>)>;

pub(crate) type DynLoop = Box<dyn EventLoop>;

/// A user request in flight.
pub(crate) struct AsyncRequest {
    pub(crate) encoded: Bytes,
    /// `None` for requests pinned to a node.
    pub(crate) route: Option<Route>,
    pub(crate) machine: RequestMachine,
    pub(crate) callback: Callback,
}

/// What the next reply on a connection answers.
pub(crate) enum Pending {
    Auth,
    Asking,
    Refresh,
    Request(AsyncRequest),
}

/// Outcome of checking a socket whose connect was in progress.
pub(crate) enum ConnectProgress {
    InProgress,
    Established,
}

pub(crate) struct AsyncConnection {
    key: NodeKey,
    addr: NodeAddr,
    token: Token,
    stream: Option<TcpStream>,
    state: ConnectionState,
    registered: Option<Interest>,
    decoder: Decoder,
    wbuf: GuardedBuf,
    pending: VecDeque<Pending>,
    deadline: Option<Instant>,
    /// Close once every pending reply arrived.
    closing: bool,
    alloc: AllocGuard,
}

impl AsyncConnection {
    pub(crate) fn new(key: NodeKey, addr: NodeAddr, alloc: AllocGuard) -> Self {
        Self {
            key,
            addr,
            token: token_of(key),
            stream: None,
            state: ConnectionState::Disconnected,
            registered: None,
            decoder: Decoder::with_allocator(alloc.clone()),
            wbuf: GuardedBuf::new(alloc.clone()),
            pending: VecDeque::new(),
            deadline: None,
            closing: false,
            alloc,
        }
    }

    pub(crate) fn key(&self) -> NodeKey {
        self.key
    }

    pub(crate) fn addr(&self) -> &NodeAddr {
        &self.addr
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.state
    }

    pub(crate) fn has_stream(&self) -> bool {
        self.stream.is_some()
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.wbuf.is_empty()
    }

    pub(crate) fn has_output(&self) -> bool {
        !self.wbuf.is_empty()
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing
    }

    pub(crate) fn close_when_idle(&mut self) {
        self.closing = true;
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Starts a non-blocking connect and queues `AUTH` ahead of anything
    /// else.
    pub(crate) fn open(&mut self, options: &ClusterOptions, ev: &mut DynLoop) -> Result<()> {
        let sock = (self.addr.host(), self.addr.port())
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| Error::connection(format!("{} did not resolve", self.addr)))?;

        let auth = match options.password.as_deref() {
            Some(password) => Some(match options.username.as_deref() {
                Some(user) => encode_command(&self.alloc, &["AUTH", user, password])?,
                None => encode_command(&self.alloc, &["AUTH", password])?,
            }),
            None => None,
        };
        if let Some(auth) = &auth {
            self.reserve(1, auth.len())?;
        }

        self.state = ConnectionState::Connecting;
        let stream = match TcpStream::connect(sock) {
            Ok(stream) => stream,
            Err(e) => {
                self.state = ConnectionState::Failed;
                return Err(e.into());
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!(node = %self.addr, error = %e, "set_nodelay failed");
        }
        if let Err(e) = ev.register(stream.as_raw_fd(), self.token, Interest::BOTH) {
            self.state = ConnectionState::Failed;
            return Err(e.into());
        }

        self.stream = Some(stream);
        self.registered = Some(Interest::BOTH);
        self.decoder.clear();
        self.closing = false;
        self.deadline = options.connect_timeout.map(|t| Instant::now() + t);
        if let Some(auth) = auth {
            self.push(&auth, Pending::Auth);
        }
        debug!(node = %self.addr, token = self.token.0, "connecting");
        Ok(())
    }

    /// Checks whether an in-progress connect finished.
    pub(crate) fn finish_connect(&mut self, command_timeout: Option<Duration>) -> Result<ConnectProgress> {
        let Some(stream) = self.stream.as_ref() else {
            return Err(self.not_connected());
        };
        if let Some(e) = stream.take_error()? {
            return Err(map_io(e));
        }
        match stream.peer_addr() {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotConnected => {
                return Ok(ConnectProgress::InProgress)
            }
            Err(e) => return Err(map_io(e)),
        }

        let authenticating = matches!(self.pending.front(), Some(Pending::Auth));
        self.state = if authenticating {
            ConnectionState::Authenticating
        } else {
            ConnectionState::Connected
        };
        self.deadline = self.reply_deadline(command_timeout);
        debug!(node = %self.addr, state = ?self.state, "transport established");
        Ok(ConnectProgress::Established)
    }

    /// `AUTH` was accepted.
    pub(crate) fn authenticated(&mut self) {
        self.state = ConnectionState::Connected;
    }

    /// Reserves room for `entries` pending replies and `bytes` of output.
    pub(crate) fn reserve(&mut self, entries: usize, bytes: usize) -> Result<()> {
        self.alloc.reserve_deque(&mut self.pending, entries)?;
        self.wbuf.reserve(bytes)
    }

    /// Appends one request. Room must have been reserved.
    pub(crate) fn push(&mut self, data: &[u8], pending: Pending) {
        self.wbuf.extend_from_slice(data);
        self.pending.push_back(pending);
    }

    /// Starts the reply deadline if this is the only outstanding reply.
    pub(crate) fn start_deadline(&mut self, command_timeout: Option<Duration>) {
        if self.deadline.is_none() && self.state != ConnectionState::Connecting {
            self.deadline = command_timeout.map(|t| Instant::now() + t);
        }
    }

    fn reply_deadline(&self, command_timeout: Option<Duration>) -> Option<Instant> {
        if self.pending.is_empty() {
            None
        } else {
            command_timeout.map(|t| Instant::now() + t)
        }
    }

    /// Writes buffered output until done or the socket would block.
    pub(crate) fn flush(&mut self) -> Result<()> {
        if self.state == ConnectionState::Connecting {
            return Ok(());
        }
        let Some(stream) = self.stream.as_mut() else {
            return Err(self.not_connected());
        };
        while !self.wbuf.is_empty() {
            match stream.write(&self.wbuf) {
                Ok(0) => {
                    return Err(Error::connection(format!("{} stopped accepting data", self.addr)))
                }
                Ok(n) => self.wbuf.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(map_io(e)),
            }
        }
        Ok(())
    }

    /// Reads everything available into the decoder.
    pub(crate) fn fill(&mut self) -> Result<()> {
        loop {
            let Some(stream) = self.stream.as_mut() else {
                return Err(self.not_connected());
            };
            match would_block(self.decoder.read_from(stream)) {
                Ok(Some(0)) => {
                    return Err(Error::connection(format!(
                        "{} closed the connection",
                        self.addr
                    )))
                }
                Ok(Some(_)) => {}
                Ok(None) => return Ok(()),
                Err(Error::Io { source }) if source.kind() == io::ErrorKind::Interrupted => {}
                Err(Error::Io { source }) => return Err(map_io(source)),
                Err(e) => return Err(e),
            }
        }
    }

    /// Decodes the next buffered reply and pairs it with its request.
    pub(crate) fn next_reply(
        &mut self,
        command_timeout: Option<Duration>,
    ) -> Result<Option<(Reply, Pending)>> {
        let Some(reply) = self.decoder.decode()? else {
            return Ok(None);
        };
        let Some(pending) = self.pending.pop_front() else {
            return Err(Error::protocol(format!(
                "{} sent a reply nobody asked for",
                self.addr
            )));
        };
        debug!(node = %self.addr, kind = reply.kind_name(), "reply received");
        self.deadline = self.reply_deadline(command_timeout);
        Ok(Some((reply, pending)))
    }

    /// Updates the registration to match what the connection waits for.
    ///
    /// `force` re-arms even an unchanged interest, so output queued on an
    /// already writable socket is noticed.
    pub(crate) fn arm(&mut self, ev: &mut DynLoop, force: bool) -> Result<()> {
        let Some(stream) = self.stream.as_ref() else {
            return Ok(());
        };
        let wanted = if self.state == ConnectionState::Connecting || !self.wbuf.is_empty() {
            Interest::BOTH
        } else {
            Interest::READABLE
        };
        if force || self.registered != Some(wanted) {
            ev.reregister(stream.as_raw_fd(), self.token, wanted)?;
            self.registered = Some(wanted);
        }
        Ok(())
    }

    /// Closes the socket and hands back every unanswered request.
    pub(crate) fn teardown(
        &mut self,
        state: ConnectionState,
        ev: Option<&mut DynLoop>,
    ) -> VecDeque<Pending> {
        if let Some(stream) = self.stream.take() {
            if let Some(ev) = ev {
                if let Err(e) = ev.deregister(stream.as_raw_fd()) {
                    warn!(node = %self.addr, error = %e, "deregister failed");
                }
            }
            if let Err(e) = stream.shutdown(Shutdown::Both) {
                debug!(node = %self.addr, error = %e, "shutdown failed");
            }
        }
        self.registered = None;
        self.wbuf.reset();
        self.decoder.clear();
        self.deadline = None;
        self.closing = false;
        self.state = state;
        std::mem::take(&mut self.pending)
    }

    fn not_connected(&self) -> Error {
        Error::connection(format!("{} is not connected", self.addr))
    }
}

impl fmt::Debug for AsyncConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncConnection")
            .field("addr", &self.addr)
            .field("token", &self.token)
            .field("state", &self.state)
            .field("pending", &self.pending.len())
            .field("closing", &self.closing)
            .finish()
    }
}

pub(crate) fn token_of(key: NodeKey) -> Token {
    Token(key.get() as usize)
}

fn map_io(e: io::Error) -> Error {
    match e.kind() {
        io::ErrorKind::TimedOut => Error::Timeout,
        _ => Error::Io { source: e },
    }
}
