//! # Event-driven cluster context
//!
//! [`AsyncClusterContext`] wraps a [`ClusterContext`] for slot map and node
//! bookkeeping and talks to nodes over non-blocking sockets registered with
//! an externally driven [`EventLoop`]. Every command carries a completion
//! callback that runs inside [`handle_event`](AsyncClusterContext::handle_event)
//! once the final reply (after any redirects) arrives.
//!
//! ## Example
//!
//! ```no_run
//! use std::time::Duration;
//! use shardis::aio::{AsyncClusterContext, MioEventLoop};
//!
//! # fn main() -> shardis::Result<()> {
//! let mut ev = MioEventLoop::new()?;
//! let mut acc = AsyncClusterContext::new();
//! acc.attach(ev.registration()?)?;
//! acc.context_mut().add_nodes("127.0.0.1:7000")?;
//! acc.connect()?;
//!
//! acc.command(&["SET", "key1", "Hello"], |_, reply| {
//!     println!("{reply:?}");
//! })?;
//! ev.run_until_idle(&mut acc, Duration::from_secs(1))?;
//! acc.disconnect();
//! # Ok(())
//! # }
//! ```

mod connection;
pub mod event_loop;
pub mod mio_loop;

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};

use futures::channel::oneshot;
use tracing::{debug, instrument, warn};

use crate::alloc::AllocGuard;
use crate::cluster::addr::NodeAddr;
use crate::cluster::context::Action;
use crate::cluster::registry::NodeKey;
use crate::cluster::request::RequestMachine;
use crate::cluster::router::{route, Route};
use crate::cluster::ClusterContext;
use crate::core::command::ASKING;
use crate::core::connection::ConnectionState;
use crate::proto::codec::encode_command;
use crate::proto::error::{Error, ErrorKind, LastError, Result};
use crate::proto::reply::Reply;

use connection::{token_of, AsyncConnection, AsyncRequest, ConnectProgress, DynLoop, Pending};

pub use connection::Callback;
pub use event_loop::{EventLoop, Interest, Readiness, Token};
pub use mio_loop::{MioEventLoop, MioRegistration};

/// Notified with the node address when a connection comes up or goes down.
type LinkCallback = Box<dyn FnMut(&NodeAddr, Result<()>)>;

/// Non-blocking client for a Redis Cluster.
///
/// Single-threaded: callbacks run inside the dispatch turn that received
/// the reply and may issue further commands on the context they receive.
pub struct AsyncClusterContext {
    cc: ClusterContext,
    conns: HashMap<Token, AsyncConnection>,
    event_loop: Option<DynLoop>,
    on_connect: Option<LinkCallback>,
    on_disconnect: Option<LinkCallback>,
    last_error: LastError,
    /// A topology query is in flight.
    refreshing: bool,
    disconnecting: bool,
}

impl AsyncClusterContext {
    /// Creates an unconnected context using the system allocator.
    pub fn new() -> Self {
        Self::from_context(ClusterContext::new())
    }

    /// Creates an unconnected context that allocates through `alloc`.
    pub fn with_allocator(alloc: AllocGuard) -> Self {
        Self::from_context(ClusterContext::with_allocator(alloc))
    }

    /// Wraps a configured, possibly connected, blocking context.
    pub fn from_context(cc: ClusterContext) -> Self {
        Self {
            cc,
            conns: HashMap::new(),
            event_loop: None,
            on_connect: None,
            on_disconnect: None,
            last_error: LastError::new(),
            refreshing: false,
            disconnecting: false,
        }
    }

    /// The nested blocking context holding nodes, slot map and options.
    pub fn context(&self) -> &ClusterContext {
        &self.cc
    }

    /// Mutable access to the nested context, for configuration.
    pub fn context_mut(&mut self) -> &mut ClusterContext {
        &mut self.cc
    }

    fn record<T>(&mut self, result: Result<T>) -> Result<T> {
        self.last_error.clear();
        if let Err(e) = &result {
            self.last_error.set(e);
        }
        result
    }

    /// Kind of the last recorded error.
    pub fn err(&self) -> Option<ErrorKind> {
        self.last_error.kind()
    }

    /// Message of the last recorded error, empty if none.
    pub fn errstr(&self) -> &str {
        self.last_error.message()
    }

    /// Called once per connection that becomes usable (`Ok`) or fails
    /// before becoming usable (`Err`).
    pub fn set_connect_callback<F>(&mut self, callback: F) -> Result<()>
    where
        F: FnMut(&NodeAddr, Result<()>) + 'static,
    {
        let result = self.cc.alloc().boxed(callback);
        let result = result.map(|boxed| {
            self.on_connect = Some(boxed);
        });
        self.record(result)
    }

    /// Called once per usable connection that closes, `Ok` when closed by
    /// [`disconnect`](Self::disconnect), `Err` on failure.
    pub fn set_disconnect_callback<F>(&mut self, callback: F) -> Result<()>
    where
        F: FnMut(&NodeAddr, Result<()>) + 'static,
    {
        let result = self.cc.alloc().boxed(callback);
        let result = result.map(|boxed| {
            self.on_disconnect = Some(boxed);
        });
        self.record(result)
    }

    /// Hands the context its event loop. Only one loop can be attached.
    pub fn attach<E: EventLoop + 'static>(&mut self, event_loop: E) -> Result<()> {
        let result = self.install_loop(event_loop);
        self.record(result)
    }

    fn install_loop<E: EventLoop + 'static>(&mut self, event_loop: E) -> Result<()> {
        if self.event_loop.is_some() {
            return Err(Error::invalid("an event loop is already attached"));
        }
        let boxed: DynLoop = self.cc.alloc().boxed(event_loop)?;
        self.event_loop = Some(boxed);
        Ok(())
    }

    /// Learns the slot layout with a blocking refresh.
    ///
    /// A failure is recorded on this context and on the nested one.
    #[instrument(skip(self), level = "debug")]
    pub fn connect(&mut self) -> Result<()> {
        let result = self.cc.connect();
        self.record(result)
    }

    /// Sends a command to the node owning its keys; `callback` receives the
    /// final reply.
    ///
    /// # Errors
    ///
    /// Fails without calling `callback` if the command cannot be routed or
    /// queued: `Error::CrossSlot`, `Error::ClusterDown` when the slot has no
    /// owner (for instance after a failed [`connect`](Self::connect)),
    /// `Error::InvalidArgument` without an event loop, `Error::OutOfMemory`.
    pub fn command<A, F>(&mut self, args: &[A], callback: F) -> Result<()>
    where
        A: AsRef<[u8]>,
        F: FnOnce(&mut AsyncClusterContext, Result<Reply>) + 'static,
    {
        let result = self.submit(args, callback);
        self.record(result)
    }

    fn submit<A, F>(&mut self, args: &[A], callback: F) -> Result<()>
    where
        A: AsRef<[u8]>,
        F: FnOnce(&mut AsyncClusterContext, Result<Reply>) + 'static,
    {
        let route = route(args)?;
        let encoded = encode_command(self.cc.alloc(), args)?;
        let key = self.cc.node_for_route(route)?;
        let callback: Callback = self.cc.alloc().boxed(callback)?;
        let request = AsyncRequest {
            encoded,
            route: Some(route),
            machine: RequestMachine::new(self.cc.options().max_redirects),
            callback,
        };
        self.send(key, request, false).map_err(|(e, _)| e)
    }

    /// Sends a command to one node; redirects are delivered as replies.
    pub fn command_to_node<A, F>(&mut self, addr: &NodeAddr, args: &[A], callback: F) -> Result<()>
    where
        A: AsRef<[u8]>,
        F: FnOnce(&mut AsyncClusterContext, Result<Reply>) + 'static,
    {
        let result = self.submit_to(addr, args, callback);
        self.record(result)
    }

    fn submit_to<A, F>(&mut self, addr: &NodeAddr, args: &[A], callback: F) -> Result<()>
    where
        A: AsRef<[u8]>,
        F: FnOnce(&mut AsyncClusterContext, Result<Reply>) + 'static,
    {
        if args.is_empty() {
            return Err(Error::invalid("empty command"));
        }
        let key = self
            .cc
            .registry()
            .lookup(addr)
            .ok_or_else(|| Error::invalid(format!("{addr} is not a known cluster node")))?;
        let encoded = encode_command(self.cc.alloc(), args)?;
        let callback: Callback = self.cc.alloc().boxed(callback)?;
        let request = AsyncRequest {
            encoded,
            route: None,
            machine: RequestMachine::new(0),
            callback,
        };
        self.send(key, request, false).map_err(|(e, _)| e)
    }

    /// Like [`command`](Self::command), resolving a future instead of
    /// calling back. The future completes once the event loop delivered
    /// the reply.
    pub fn command_future<A: AsRef<[u8]>>(
        &mut self,
        args: &[A],
    ) -> Result<oneshot::Receiver<Result<Reply>>> {
        let (tx, rx) = oneshot::channel();
        self.command(args, move |_, result| {
            let _ = tx.send(result);
        })?;
        Ok(rx)
    }

    /// Stops accepting commands and closes each connection once its
    /// pending replies arrived.
    pub fn disconnect(&mut self) {
        debug!(pending = self.pending(), "disconnecting");
        self.disconnecting = true;
        for conn in self.conns.values_mut() {
            conn.close_when_idle();
        }
        self.close_idle();
        self.last_error.clear();
    }

    /// Feeds one readiness notification from the event loop.
    pub fn handle_event(&mut self, token: Token, readiness: Readiness) {
        let timeout = self.cc.options().command_timeout;
        let Some(conn) = self.conns.get_mut(&token) else {
            debug!(token = token.0, "event for unknown token");
            return;
        };
        if !conn.has_stream() {
            return;
        }

        if conn.state() == ConnectionState::Connecting {
            match conn.finish_connect(timeout) {
                Ok(ConnectProgress::InProgress) => return,
                Ok(ConnectProgress::Established) => {
                    if conn.state() == ConnectionState::Connected {
                        let addr = conn.addr().clone();
                        self.notify_connect(&addr, Ok(()));
                    }
                }
                Err(e) => {
                    self.fail_connection(token, e);
                    return;
                }
            }
        }

        if readiness.readable || readiness.hangup || readiness.error {
            let filled = match self.conns.get_mut(&token) {
                Some(conn) => conn.fill(),
                None => return,
            };
            self.drain_replies(token);
            if let Err(e) = filled {
                self.fail_connection(token, e);
                return;
            }
        }
        self.after_io(token);
    }

    /// Fails every connection whose connect or reply deadline passed.
    pub fn handle_timeouts(&mut self) {
        let now = Instant::now();
        while let Some(token) = self
            .conns
            .iter()
            .find(|(_, c)| c.has_stream() && c.deadline().is_some_and(|d| d <= now))
            .map(|(token, _)| *token)
        {
            self.fail_connection(token, Error::Timeout);
        }
    }

    /// Time until the earliest deadline, if any.
    pub fn next_timeout(&self) -> Option<Duration> {
        let now = Instant::now();
        self.conns
            .values()
            .filter_map(AsyncConnection::deadline)
            .min()
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    /// Returns true when no reply is outstanding and nothing waits to be
    /// written.
    pub fn is_idle(&self) -> bool {
        self.conns.values().all(AsyncConnection::is_idle)
    }

    /// Number of replies still expected, internal ones included.
    pub fn pending(&self) -> usize {
        self.conns.values().map(AsyncConnection::pending_len).sum()
    }

    /// Queues `request` on the connection of `key`, connecting first if
    /// needed. On failure the request is handed back untouched.
    fn send(
        &mut self,
        key: NodeKey,
        mut request: AsyncRequest,
        asking: bool,
    ) -> std::result::Result<(), (Error, AsyncRequest)> {
        let (entries, extra) = if asking { (2, ASKING.len()) } else { (1, 0) };
        if let Err(e) = self.prepare(key, entries, request.encoded.len() + extra) {
            return Err((e, request));
        }
        request.machine.written();
        let encoded = request.encoded.clone();
        self.enqueue(token_of(key), asking, &encoded, Pending::Request(request));
        Ok(())
    }

    /// Makes sure a connection for `key` exists and has room for the
    /// request. Nothing is queued.
    fn prepare(&mut self, key: NodeKey, entries: usize, bytes: usize) -> Result<()> {
        if self.disconnecting {
            return Err(Error::connection("context is disconnecting"));
        }
        let Some(ev) = self.event_loop.as_mut() else {
            return Err(Error::invalid("no event loop attached"));
        };

        let token = token_of(key);
        if !self.conns.contains_key(&token) {
            let node = self
                .cc
                .registry()
                .get(key)
                .ok_or_else(|| Error::connection("node left the cluster"))?;
            let addr = NodeAddr::try_new(self.cc.alloc(), node.addr().host(), node.addr().port())?;
            self.cc.alloc().reserve_map(&mut self.conns, 1)?;
            self.conns
                .insert(token, AsyncConnection::new(key, addr, self.cc.alloc().clone()));
        }
        let Some(conn) = self.conns.get_mut(&token) else {
            return Err(Error::connection("node left the cluster"));
        };
        if conn.is_closing() {
            return Err(Error::connection(format!("{} is closing", conn.addr())));
        }
        if !conn.has_stream() {
            if let Err(e) = conn.open(self.cc.options(), ev) {
                warn!(node = %conn.addr(), error = %e, "connect failed");
                let addr = conn.addr().clone();
                self.last_error.set(&e);
                self.notify_connect(&addr, Err(e.clone()));
                return Err(e);
            }
        }
        conn.reserve(entries, bytes)
    }

    /// Appends to a prepared connection and asks the loop for writability.
    fn enqueue(&mut self, token: Token, asking: bool, data: &[u8], pending: Pending) {
        let timeout = self.cc.options().command_timeout;
        let Some(conn) = self.conns.get_mut(&token) else {
            return;
        };
        let quiet = !conn.has_output();
        if asking {
            conn.push(ASKING, Pending::Asking);
        }
        conn.push(data, pending);
        conn.start_deadline(timeout);
        let armed = match self.event_loop.as_mut() {
            Some(ev) => conn.arm(ev, quiet),
            None => Ok(()),
        };
        if let Err(e) = armed {
            self.fail_connection(token, e);
        }
    }

    fn drain_replies(&mut self, token: Token) {
        let timeout = self.cc.options().command_timeout;
        loop {
            let next = match self.conns.get_mut(&token) {
                Some(conn) if conn.has_stream() => conn.next_reply(timeout),
                _ => return,
            };
            match next {
                Ok(Some((reply, pending))) => self.on_reply(token, reply, pending),
                Ok(None) => return,
                Err(e) => {
                    self.fail_connection(token, e);
                    return;
                }
            }
        }
    }

    fn on_reply(&mut self, token: Token, reply: Reply, pending: Pending) {
        match pending {
            Pending::Auth => {
                if let Some(message) = reply.error_message() {
                    let err = Error::Auth {
                        message: message.to_string(),
                    };
                    self.cc.record_error(&err);
                    self.fail_connection(token, err);
                } else if let Some(conn) = self.conns.get_mut(&token) {
                    conn.authenticated();
                    let addr = conn.addr().clone();
                    self.notify_connect(&addr, Ok(()));
                }
            }
            Pending::Asking => {
                if let Some(message) = reply.error_message() {
                    warn!(%message, "ASKING rejected");
                }
            }
            Pending::Refresh => {
                self.refreshing = false;
                self.install_topology(token, &reply);
            }
            Pending::Request(request) => self.settle(token, request, reply),
        }
    }

    /// Decides what a reply means for its request: deliver it or send the
    /// request somewhere else.
    fn settle(&mut self, token: Token, mut request: AsyncRequest, reply: Reply) {
        let Some(route) = request.route else {
            (request.callback)(self, Ok(reply));
            return;
        };
        let action = match self.conns.get(&token) {
            Some(conn) => {
                let step = request.machine.on_reply(&reply, conn.addr());
                self.cc.resolve(step)
            }
            None => Err(Error::connection("connection vanished")),
        };

        let next = match action {
            Ok(Action::Complete) => {
                (request.callback)(self, Ok(reply));
                return;
            }
            Ok(Action::Fail(e)) | Err(e) => {
                (request.callback)(self, Err(e));
                return;
            }
            Ok(Action::Moved { slot, target }) => {
                self.cc.redirect_moved(slot, target).map(|key| (key, false))
            }
            Ok(Action::Ask { target }) => self.cc.register(target).map(|key| (key, true)),
            Ok(Action::Retry { refresh }) => {
                if refresh {
                    self.request_refresh(token);
                }
                self.cc.node_for_route(route).map(|key| (key, false))
            }
        };

        match next {
            Ok((key, asking)) => {
                request.machine.resend();
                debug!(key = key.get(), asking, "resending request");
                if let Err((e, request)) = self.send(key, request, asking) {
                    (request.callback)(self, Err(e));
                }
            }
            Err(e) => (request.callback)(self, Err(e)),
        }
    }

    /// Queries the topology over the connection of `via`, or any other
    /// node, unless a query is already in flight.
    fn request_refresh(&mut self, via: Token) {
        if self.refreshing {
            return;
        }
        let command = self.cc.options().topology_source.command();
        let encoded = match encode_command(self.cc.alloc(), &command) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!(error = %e, "cannot build topology query");
                return;
            }
        };
        let key = match self.conns.get(&via) {
            Some(conn) if conn.state() == ConnectionState::Connected => Ok(conn.key()),
            _ => self.cc.node_for_route(Route::Any),
        };
        let prepared = key.and_then(|key| self.prepare(key, 1, encoded.len()).map(|()| key));
        match prepared {
            Ok(key) => {
                self.refreshing = true;
                self.enqueue(token_of(key), false, &encoded, Pending::Refresh);
            }
            Err(e) => warn!(error = %e, "cannot request a slot map refresh"),
        }
    }

    fn install_topology(&mut self, token: Token, reply: &Reply) {
        let Some(origin) = self.conns.get(&token).map(|c| c.addr().clone()) else {
            return;
        };
        match self.cc.install_reply(reply, &origin) {
            Ok(()) => {
                // connections to nodes the refresh dropped close once drained
                for conn in self.conns.values_mut() {
                    if self.cc.registry().get(conn.key()).is_none() {
                        conn.close_when_idle();
                    }
                }
                self.close_idle();
            }
            Err(e) => warn!(node = %origin, error = %e, "slot map refresh failed"),
        }
    }

    fn after_io(&mut self, token: Token) {
        let Some(conn) = self.conns.get_mut(&token) else {
            return;
        };
        if !conn.has_stream() {
            return;
        }
        if let Err(e) = conn.flush() {
            self.fail_connection(token, e);
            return;
        }
        let armed = match self.event_loop.as_mut() {
            Some(ev) => conn.arm(ev, false),
            None => Ok(()),
        };
        if let Err(e) = armed {
            self.fail_connection(token, e);
            return;
        }
        if conn.is_closing() && conn.is_idle() {
            self.close_connection(token);
        }
    }

    fn close_idle(&mut self) {
        while let Some(token) = self
            .conns
            .iter()
            .find(|(_, c)| c.has_stream() && c.is_closing() && c.is_idle())
            .map(|(token, _)| *token)
        {
            self.close_connection(token);
        }
        let registry = self.cc.registry();
        self.conns
            .retain(|_, c| c.has_stream() || registry.get(c.key()).is_some());
    }

    /// Graceful close of an idle connection.
    fn close_connection(&mut self, token: Token) {
        let Some(conn) = self.conns.get_mut(&token) else {
            return;
        };
        if !conn.has_stream() {
            return;
        }
        let was = conn.state();
        let addr = conn.addr().clone();
        let drained = conn.teardown(ConnectionState::Disconnected, self.event_loop.as_mut());
        debug!(node = %addr, "disconnected");
        if was == ConnectionState::Connected {
            self.notify_disconnect(&addr, Ok(()));
        }
        self.resolve_drained(drained, &Error::connection("connection closed"));
    }

    /// Tears down a broken connection and fails everything it owed.
    fn fail_connection(&mut self, token: Token, err: Error) {
        let Some(conn) = self.conns.get_mut(&token) else {
            return;
        };
        if !conn.has_stream() {
            return;
        }
        let was = conn.state();
        let addr = conn.addr().clone();
        warn!(node = %addr, error = %err, "connection failed");
        let drained = conn.teardown(ConnectionState::Failed, self.event_loop.as_mut());
        self.last_error.set(&err);
        if was == ConnectionState::Connected {
            self.notify_disconnect(&addr, Err(err.clone()));
        } else {
            self.notify_connect(&addr, Err(err.clone()));
        }
        self.resolve_drained(drained, &err);
    }

    fn resolve_drained(&mut self, drained: VecDeque<Pending>, err: &Error) {
        for pending in drained {
            match pending {
                Pending::Request(request) => (request.callback)(self, Err(err.clone())),
                Pending::Refresh => self.refreshing = false,
                Pending::Auth | Pending::Asking => {}
            }
        }
    }

    fn notify_connect(&mut self, addr: &NodeAddr, result: Result<()>) {
        if let Some(callback) = self.on_connect.as_mut() {
            callback(addr, result);
        }
    }

    fn notify_disconnect(&mut self, addr: &NodeAddr, result: Result<()>) {
        if let Some(callback) = self.on_disconnect.as_mut() {
            callback(addr, result);
        }
    }
}

impl Default for AsyncClusterContext {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AsyncClusterContext {
    fn drop(&mut self) {
        self.disconnecting = true;
        let freed = Error::connection("async context freed");
        while let Some(token) = self
            .conns
            .iter()
            .find(|(_, c)| c.has_stream())
            .map(|(token, _)| *token)
        {
            let Some(conn) = self.conns.get_mut(&token) else {
                break;
            };
            let was = conn.state();
            let addr = conn.addr().clone();
            let drained = conn.teardown(ConnectionState::Disconnected, self.event_loop.as_mut());
            if was == ConnectionState::Connected {
                self.notify_disconnect(&addr, Ok(()));
            }
            self.resolve_drained(drained, &freed);
        }
    }
}

impl fmt::Debug for AsyncClusterContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncClusterContext")
            .field("context", &self.cc)
            .field("connections", &self.conns.len())
            .field("pending", &self.pending())
            .field("attached", &self.event_loop.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::aio::event_loop::recording::{Call, RecordingLoop};
    use crate::cluster::slot::key_slot;
    use crate::testing::MockCluster;

    const WAIT: Duration = Duration::from_secs(5);

    type Seen = Rc<RefCell<Vec<Result<Reply>>>>;

    fn collect(seen: &Seen) -> impl FnOnce(&mut AsyncClusterContext, Result<Reply>) + 'static {
        let seen = Rc::clone(seen);
        move |_, result| seen.borrow_mut().push(result)
    }

    fn connected(cluster: &MockCluster) -> (AsyncClusterContext, MioEventLoop) {
        let ev = MioEventLoop::new().unwrap();
        let mut acc = AsyncClusterContext::new();
        acc.attach(ev.registration().unwrap()).unwrap();
        acc.context_mut().add_nodes(&cluster.seeds()).unwrap();
        acc.connect().unwrap();
        (acc, ev)
    }

    #[test]
    fn test_command_requires_event_loop() {
        let cluster = MockCluster::builder().nodes(1).build();
        let mut acc = AsyncClusterContext::new();
        acc.context_mut().add_nodes(&cluster.seeds()).unwrap();
        acc.connect().unwrap();

        let err = acc.command(&["GET", "foo"], |_, _| {}).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
        assert_eq!(acc.err(), Some(ErrorKind::InvalidArgument));
        assert!(acc.is_idle());
    }

    #[test]
    fn test_attach_twice() {
        let mut acc = AsyncClusterContext::new();
        acc.attach(RecordingLoop::default()).unwrap();
        assert!(acc.attach(RecordingLoop::default()).is_err());
    }

    #[test]
    fn test_set_then_get() {
        let cluster = MockCluster::builder().nodes(3).build();
        let (mut acc, mut ev) = connected(&cluster);
        let seen: Seen = Rc::default();

        acc.command(&["SET", "foo", "bar"], collect(&seen)).unwrap();
        acc.command(&["GET", "foo"], collect(&seen)).unwrap();
        assert!(!acc.is_idle());
        ev.run_until_idle(&mut acc, WAIT).unwrap();

        let seen = seen.borrow();
        assert_eq!(seen.len(), 2);
        assert!(seen[0].as_ref().unwrap().is_ok());
        assert_eq!(seen[1].as_ref().unwrap().as_bytes(), Some(&b"bar"[..]));
    }

    #[test]
    fn test_cross_slot_rejected_without_io() {
        let cluster = MockCluster::builder().nodes(3).build();
        let (mut acc, _ev) = connected(&cluster);
        cluster.clear_log();

        let err = acc.command(&["MSET", "foo", "1", "bar", "2"], |_, _| {}).unwrap_err();
        assert!(matches!(err, Error::CrossSlot));
        assert!(acc.is_idle());
        assert_eq!(cluster.command_count(), 0);
    }

    #[test]
    fn test_moved_updates_slot_map() {
        let cluster = MockCluster::builder().nodes(2).unlisted(1).build();
        let (mut acc, mut ev) = connected(&cluster);
        let slot = key_slot("foo");
        cluster.move_slot(slot, 2);
        let seen: Seen = Rc::default();

        acc.command(&["SET", "foo", "x"], collect(&seen)).unwrap();
        ev.run_until_idle(&mut acc, WAIT).unwrap();

        assert!(seen.borrow()[0].as_ref().unwrap().is_ok());
        let owner = acc.context().node_for_slot(slot).unwrap();
        assert_eq!(owner.addr(), &cluster.addr(2));
        assert_eq!(cluster.commands_on(2), vec!["SET foo x"]);
    }

    #[test]
    fn test_ask_sends_asking_first() {
        let cluster = MockCluster::builder().nodes(3).build();
        let (mut acc, mut ev) = connected(&cluster);
        let slot = key_slot("foo");
        let owner = cluster.owner_of(slot);
        let target = (owner + 1) % 3;
        cluster.begin_migration(slot, target);
        let seen: Seen = Rc::default();

        acc.command(&["SET", "foo", "asked"], collect(&seen)).unwrap();
        ev.run_until_idle(&mut acc, WAIT).unwrap();

        assert!(seen.borrow()[0].as_ref().unwrap().is_ok());
        assert_eq!(cluster.commands_on(target), vec!["ASKING", "SET foo asked"]);
        let still = acc.context().node_for_slot(slot).unwrap();
        assert_eq!(still.addr(), &cluster.addr(owner));
    }

    #[test]
    fn test_callback_can_issue_commands() {
        let cluster = MockCluster::builder().nodes(3).build();
        let (mut acc, mut ev) = connected(&cluster);
        let seen: Seen = Rc::default();

        let inner = Rc::clone(&seen);
        acc.command(&["SET", "key1", "Hello"], move |acc, result| {
            assert!(result.unwrap().is_ok());
            let sink = Rc::clone(&inner);
            acc.command(&["GET", "key1"], move |_, r| sink.borrow_mut().push(r))
                .unwrap();
        })
        .unwrap();
        ev.run_until_idle(&mut acc, WAIT).unwrap();

        assert_eq!(
            seen.borrow()[0].as_ref().unwrap().as_bytes(),
            Some(&b"Hello"[..])
        );
    }

    #[test]
    fn test_command_future_resolves() {
        let cluster = MockCluster::builder().nodes(1).build();
        let (mut acc, mut ev) = connected(&cluster);

        let mut rx = acc.command_future(&["INCR", "counter"]).unwrap();
        assert!(rx.try_recv().unwrap().is_none());
        ev.run_until_idle(&mut acc, WAIT).unwrap();

        let reply = rx.try_recv().unwrap().unwrap().unwrap();
        assert_eq!(reply.as_integer(), Some(1));
    }

    #[test]
    fn test_disconnect_waits_for_replies() {
        let cluster = MockCluster::builder().nodes(1).build();
        let (mut acc, mut ev) = connected(&cluster);
        let seen: Seen = Rc::default();
        let closed = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&closed);
        acc.set_disconnect_callback(move |addr, result| {
            sink.borrow_mut().push((addr.clone(), result.is_ok()));
        })
        .unwrap();

        acc.command(&["SET", "foo", "1"], collect(&seen)).unwrap();
        acc.disconnect();
        assert!(acc.command(&["GET", "foo"], |_, _| {}).is_err());
        ev.run_until_idle(&mut acc, WAIT).unwrap();

        assert!(seen.borrow()[0].as_ref().unwrap().is_ok());
        assert_eq!(*closed.borrow(), vec![(cluster.addr(0), true)]);
        assert_eq!(cluster.value("foo").as_deref(), Some("1"));
    }

    #[test]
    fn test_drop_fails_pending_callbacks() {
        let cluster = MockCluster::builder().nodes(1).build();
        let seen: Seen = Rc::default();
        {
            let (mut acc, _ev) = connected(&cluster);
            acc.command(&["GET", "foo"], collect(&seen)).unwrap();
        }
        let seen = seen.borrow();
        assert_eq!(seen.len(), 1);
        assert!(matches!(seen[0], Err(Error::Connection { .. })));
    }

    #[test]
    fn test_failed_auth_fails_commands_without_io() {
        let cluster = MockCluster::builder().nodes(1).password("secretword").build();
        let ev = MioEventLoop::new().unwrap();
        let mut acc = AsyncClusterContext::new();
        acc.attach(ev.registration().unwrap()).unwrap();
        acc.context_mut().add_nodes(&cluster.seeds()).unwrap();
        acc.context_mut().set_password("faultypass").unwrap();

        let err = acc.connect().unwrap_err();
        assert!(matches!(&err, Error::Auth { message } if message.starts_with("WRONGPASS")));
        assert_eq!(acc.err(), Some(ErrorKind::AuthenticationFailed));
        assert_eq!(acc.context().err(), Some(ErrorKind::AuthenticationFailed));

        cluster.clear_log();
        let err = acc.command(&["SET", "key1", "Hello"], |_, _| {}).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ClusterDown);
        assert_eq!(cluster.command_count(), 0);
    }

    #[test]
    fn test_noauth_reply_fails_the_request() {
        let cluster = MockCluster::builder().nodes(1).build();
        let (mut acc, mut ev) = connected(&cluster);
        cluster.set_password(Some("secretword"));
        cluster.clear_log();
        let seen: Seen = Rc::default();

        acc.command(&["SET", "key1", "Hello"], collect(&seen)).unwrap();
        ev.run_until_idle(&mut acc, WAIT).unwrap();

        let seen = seen.borrow();
        assert_eq!(seen.len(), 1);
        match &seen[0] {
            Err(e @ Error::Auth { message }) => {
                assert_eq!(message, "NOAUTH Authentication required.");
                assert_eq!(e.kind(), ErrorKind::AuthenticationFailed);
            }
            other => panic!("expected NOAUTH, got {other:?}"),
        }
        assert!(acc.is_idle());
        assert_eq!(cluster.command_count(), 0);
    }

    #[test]
    fn test_auth_then_command() {
        let cluster = MockCluster::builder().nodes(1).password("secretword").build();
        let mut ev = MioEventLoop::new().unwrap();
        let mut acc = AsyncClusterContext::new();
        acc.attach(ev.registration().unwrap()).unwrap();
        acc.context_mut().add_nodes(&cluster.seeds()).unwrap();
        acc.context_mut().set_password("secretword").unwrap();
        let connects = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&connects);
        acc.set_connect_callback(move |_, result| sink.borrow_mut().push(result.is_ok()))
            .unwrap();
        acc.connect().unwrap();

        let seen: Seen = Rc::default();
        acc.command(&["SET", "key1", "Hello"], collect(&seen)).unwrap();
        ev.run_until_idle(&mut acc, WAIT).unwrap();

        assert!(seen.borrow()[0].as_ref().unwrap().is_ok());
        assert_eq!(*connects.borrow(), vec![true]);
    }

    #[test]
    fn test_reply_timeout_fails_request() {
        let silent = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = NodeAddr::new("127.0.0.1", silent.local_addr().unwrap().port());
        let mut ev = MioEventLoop::new().unwrap();
        let mut acc = AsyncClusterContext::new();
        acc.attach(ev.registration().unwrap()).unwrap();
        acc.context_mut().add_nodes(&addr.to_string()).unwrap();
        acc.context_mut()
            .set_command_timeout(Duration::from_millis(50));

        let seen: Seen = Rc::default();
        acc.command_to_node(&addr, &["PING"], collect(&seen)).unwrap();
        ev.run_until_idle(&mut acc, WAIT).unwrap();

        assert!(matches!(seen.borrow()[0], Err(Error::Timeout)));
        assert_eq!(acc.err(), Some(ErrorKind::ConnectionError));
        assert_eq!(acc.next_timeout(), None);
    }

    #[test]
    fn test_registration_lifecycle() {
        let cluster = MockCluster::builder().nodes(1).build();
        let recorder = RecordingLoop::default();
        let calls = Rc::clone(&recorder.calls);
        let mut acc = AsyncClusterContext::new();
        acc.attach(recorder).unwrap();
        acc.context_mut().add_nodes(&cluster.seeds()).unwrap();
        acc.connect().unwrap();

        acc.command(&["PING"], |_, _| {}).unwrap();
        assert!(matches!(calls.borrow()[0], Call::Register(_, Interest::BOTH)));
        assert_eq!(acc.pending(), 1);

        drop(acc);
        assert_eq!(calls.borrow().last(), Some(&Call::Deregister));
    }
}
