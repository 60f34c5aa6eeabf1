use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};

use tracing::{debug, warn};

use crate::alloc::{AllocGuard, GuardedBuf};
use crate::cluster::addr::NodeAddr;
use crate::core::command::ASKING;
use crate::core::options::ClusterOptions;
use crate::proto::codec::{encode_command, Decoder};
use crate::proto::error::{Error, Result};
use crate::proto::reply::Reply;

/// Lifecycle of a node connection.
///
/// ```text
/// Disconnected -> Connecting -> (Authenticating) -> Connected
///        any state --transport error--> Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConnectionState {
    /// No transport; initial and terminal state.
    Disconnected,
    /// Transport being opened.
    Connecting,
    /// `AUTH` sent, waiting for the verdict.
    Authenticating,
    /// Usable.
    Connected,
    /// Transport or authentication failure; reconnected on next use.
    Failed,
}

/// Blocking connection to one cluster node.
///
/// Pipelined requests are queued in a write buffer and flushed lazily.
/// Replies owed to those requests that arrive while the connection serves
/// a redirected request are parked in a stash so FIFO order survives.
pub(crate) struct Connection {
    addr: NodeAddr,
    stream: Option<TcpStream>,
    state: ConnectionState,
    decoder: Decoder,
    wbuf: GuardedBuf,
    stash: VecDeque<Reply>,
    /// Pipelined replies still to be read off the socket.
    owed: usize,
    /// Bumped whenever the transport is torn down.
    epoch: u64,
    alloc: AllocGuard,
}

impl Connection {
    pub(crate) fn new(addr: NodeAddr, alloc: AllocGuard) -> Self {
        Self {
            addr,
            stream: None,
            state: ConnectionState::Disconnected,
            decoder: Decoder::with_allocator(alloc.clone()),
            wbuf: GuardedBuf::new(alloc.clone()),
            stash: VecDeque::new(),
            owed: 0,
            epoch: 0,
            alloc,
        }
    }

    pub(crate) fn addr(&self) -> &NodeAddr {
        &self.addr
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.state
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Opens the transport and authenticates if it is not usable yet.
    pub(crate) fn ensure_connected(&mut self, options: &ClusterOptions) -> Result<()> {
        if self.is_connected() && self.stream.is_some() {
            return Ok(());
        }
        if self.stream.is_some() {
            self.teardown(ConnectionState::Disconnected);
        }

        self.state = ConnectionState::Connecting;
        let stream = match self.open(options) {
            Ok(stream) => stream,
            Err(e) => {
                warn!(node = %self.addr, error = %e, "connect failed");
                self.state = ConnectionState::Failed;
                return Err(e);
            }
        };
        self.stream = Some(stream);
        self.decoder.clear();

        if let Some(password) = options.password.as_deref() {
            self.state = ConnectionState::Authenticating;
            let reply = match options.username.as_deref() {
                Some(user) => self.exchange(&["AUTH", user, password]),
                None => self.exchange(&["AUTH", password]),
            };
            match reply {
                Ok(Reply::Error(text)) => {
                    let message = String::from_utf8_lossy(&text).into_owned();
                    warn!(node = %self.addr, %message, "authentication rejected");
                    self.teardown(ConnectionState::Failed);
                    return Err(Error::Auth { message });
                }
                Ok(_) => {}
                Err(e) => {
                    self.fail();
                    return Err(e);
                }
            }
        }

        debug!(node = %self.addr, "connected");
        self.state = ConnectionState::Connected;
        Ok(())
    }

    fn open(&self, options: &ClusterOptions) -> Result<TcpStream> {
        let addrs = (self.addr.host(), self.addr.port()).to_socket_addrs()?;
        let mut last = None;
        for sock in addrs {
            let attempt = match options.connect_timeout {
                Some(timeout) => TcpStream::connect_timeout(&sock, timeout),
                None => TcpStream::connect(sock),
            };
            match attempt {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    stream.set_read_timeout(options.command_timeout)?;
                    stream.set_write_timeout(options.command_timeout)?;
                    return Ok(stream);
                }
                Err(e) => last = Some(e),
            }
        }
        Err(match last {
            Some(e) => map_io(e),
            None => Error::connection(format!("{} did not resolve", self.addr)),
        })
    }

    /// Sends one command outside the pipeline and reads its reply.
    fn exchange<A: AsRef<[u8]>>(&mut self, args: &[A]) -> Result<Reply> {
        let encoded = encode_command(&self.alloc, args)?;
        self.write_raw(&encoded)?;
        self.read_reply()
    }

    /// Queues an encoded pipelined request. Nothing is written yet.
    ///
    /// Fails only on refused allocation, leaving the buffer untouched.
    pub(crate) fn queue(&mut self, encoded: &[u8]) -> Result<()> {
        self.wbuf.reserve(encoded.len())?;
        self.wbuf.extend_from_slice(encoded);
        self.owed += 1;
        Ok(())
    }

    /// Writes every queued request.
    pub(crate) fn flush(&mut self) -> Result<()> {
        if self.wbuf.is_empty() {
            return Ok(());
        }
        let Some(stream) = self.stream.as_mut() else {
            return Err(self.not_connected());
        };
        let written = stream.write_all(&self.wbuf).and_then(|_| stream.flush());
        if let Err(e) = written {
            let err = map_io(e);
            self.fail();
            return Err(err);
        }
        debug!(node = %self.addr, bytes = self.wbuf.len(), "flushed pipeline");
        self.wbuf.clear();
        Ok(())
    }

    /// Next reply owed to a pipelined request.
    ///
    /// An allocation failure while decoding keeps the reply buffered.
    pub(crate) fn next_reply(&mut self) -> Result<Reply> {
        if let Some(reply) = self.stash.pop_front() {
            return Ok(reply);
        }
        if self.owed == 0 {
            return Err(Error::connection(format!(
                "no reply expected from {}",
                self.addr
            )));
        }
        self.flush()?;
        let reply = self.read_reply()?;
        self.owed -= 1;
        Ok(reply)
    }

    /// Writes one request and returns its reply.
    pub(crate) fn round_trip(&mut self, encoded: &[u8]) -> Result<Reply> {
        self.send_and_read(encoded, false)
    }

    /// Like [`round_trip`](Self::round_trip), prefixed with `ASKING`.
    pub(crate) fn round_trip_asking(&mut self, encoded: &[u8]) -> Result<Reply> {
        self.send_and_read(encoded, true)
    }

    fn send_and_read(&mut self, encoded: &[u8], asking: bool) -> Result<Reply> {
        self.alloc.reserve_deque(&mut self.stash, self.owed)?;
        self.flush()?;
        if asking {
            self.write_raw(ASKING)?;
        }
        self.write_raw(encoded)?;

        // Everything from here on has been sent; any failure leaves the
        // reply stream in an unknown position.
        let result = self.read_after_send(asking);
        if result.is_err() && self.stream.is_some() {
            self.fail();
        }
        result
    }

    fn read_after_send(&mut self, asking: bool) -> Result<Reply> {
        while self.owed > 0 {
            let early = self.read_reply()?;
            self.stash.push_back(early);
            self.owed -= 1;
        }
        if asking {
            let ack = self.read_reply()?;
            if let Some(message) = ack.error_message() {
                return Err(Error::protocol(format!("ASKING rejected: {message}")));
            }
        }
        self.read_reply()
    }

    fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(self.not_connected());
        };
        if let Err(e) = stream.write_all(data) {
            let err = map_io(e);
            self.fail();
            return Err(err);
        }
        Ok(())
    }

    fn read_reply(&mut self) -> Result<Reply> {
        loop {
            if let Some(reply) = self.decoder.decode()? {
                debug!(node = %self.addr, kind = reply.kind_name(), "reply received");
                return Ok(reply);
            }
            let stream = match self.stream.as_mut() {
                Some(stream) => stream,
                None => return Err(self.not_connected()),
            };
            match self.decoder.read_from(stream) {
                Ok(0) => {
                    self.fail();
                    return Err(Error::connection(format!(
                        "{} closed the connection",
                        self.addr
                    )));
                }
                Ok(_) => {}
                Err(Error::Io { source }) if source.kind() == io::ErrorKind::Interrupted => {}
                Err(Error::Io { source }) => {
                    let err = map_io(source);
                    self.fail();
                    return Err(err);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn not_connected(&self) -> Error {
        Error::connection(format!("{} is not connected", self.addr))
    }

    /// Marks the connection failed after a transport error.
    pub(crate) fn fail(&mut self) {
        if self.state != ConnectionState::Failed {
            warn!(node = %self.addr, "connection failed");
        }
        self.teardown(ConnectionState::Failed);
    }

    /// Closes the transport and forgets queued and stashed replies.
    pub(crate) fn disconnect(&mut self) {
        self.teardown(ConnectionState::Disconnected);
    }

    fn teardown(&mut self, state: ConnectionState) {
        if let Some(stream) = self.stream.take() {
            if let Err(e) = stream.shutdown(Shutdown::Both) {
                debug!(node = %self.addr, error = %e, "shutdown failed");
            }
            self.epoch += 1;
        }
        self.wbuf.reset();
        self.stash.clear();
        self.decoder.clear();
        self.owed = 0;
        self.state = state;
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("addr", &self.addr)
            .field("state", &self.state)
            .field("owed", &self.owed)
            .field("stashed", &self.stash.len())
            .field("epoch", &self.epoch)
            .finish()
    }
}

fn map_io(e: io::Error) -> Error {
    match e.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => Error::Timeout,
        _ => Error::Io { source: e },
    }
}
