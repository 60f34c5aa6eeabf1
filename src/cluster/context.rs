//! Blocking cluster context.
//!
//! [`ClusterContext`] owns the node registry, the slot map and the pipeline
//! queue. Commands are routed by slot, sent on the owner's connection and
//! followed through `MOVED`, `ASK`, `TRYAGAIN` and `CLUSTERDOWN` replies
//! until a final reply arrives or the redirect budget runs out.

use std::collections::VecDeque;
use std::fmt;
use std::ops::ControlFlow;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, instrument, warn};

use crate::alloc::AllocGuard;
use crate::cluster::addr::{parse_descriptor_list, NodeAddr};
use crate::cluster::registry::{Node, NodeKey, NodeRegistry, SlotMap};
use crate::cluster::request::{RequestMachine, Step};
use crate::cluster::router::{route, Route};
use crate::cluster::redirect::{classify, Signal};
use crate::cluster::topology::{ClusterTopology, TopologySource};
use crate::core::builder::ClusterBuilder;
use crate::core::connection::Connection;
use crate::core::options::ClusterOptions;
use crate::proto::codec::encode_command;
use crate::proto::error::{Error, ErrorKind, LastError, Result};
use crate::proto::reply::Reply;

/// Lifecycle notifications delivered to the event callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ClusterEvent {
    /// A refresh installed a new slot map.
    SlotMapUpdated,
    /// The first slot map is in place; commands can be routed.
    Ready,
    /// The context is being dropped.
    Freeing,
}

type EventCallback = Box<dyn FnMut(&ClusterContext, ClusterEvent) + Send>;

/// A request queued by [`ClusterContext::append_command`].
struct PendingRequest {
    encoded: Bytes,
    /// `None` for requests pinned to a node; those are never redirected.
    route: Option<Route>,
    node: NodeKey,
    epoch: u64,
    machine: RequestMachine,
}

/// Where the next attempt of a request goes.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Hop {
    /// Plain send.
    Send(NodeKey),
    /// `ASKING` first.
    Ask(NodeKey),
}

/// Owned form of a [`Step`], detached from the reply it came from.
pub(crate) enum Action {
    Complete,
    Moved { slot: u16, target: Target },
    Ask { target: Target },
    Retry { refresh: bool },
    Fail(Error),
}

/// A redirect target, registered or not.
pub(crate) enum Target {
    Known(NodeKey),
    New(NodeAddr),
}

/// Blocking client for a Redis Cluster.
///
/// # Example
///
/// ```no_run
/// use shardis::ClusterContext;
///
/// # fn main() -> shardis::Result<()> {
/// let mut cc = ClusterContext::new();
/// cc.add_nodes("127.0.0.1:7000,127.0.0.1:7001")?;
/// cc.set_password("secretword")?;
/// cc.connect()?;
///
/// let reply = cc.command(&["SET", "key1", "Hello"])?;
/// assert!(reply.is_ok());
///
/// cc.append_command(&["GET", "key1"])?;
/// cc.append_command(&["INCR", "counter"])?;
/// let value = cc.get_reply()?;
/// let count = cc.get_reply()?;
/// # let _ = (value, count);
/// # Ok(())
/// # }
/// ```
pub struct ClusterContext {
    options: ClusterOptions,
    alloc: AllocGuard,
    seeds: Vec<NodeAddr>,
    registry: NodeRegistry,
    slots: Option<SlotMap>,
    pipeline: VecDeque<PendingRequest>,
    last_error: LastError,
    on_event: Option<EventCallback>,
    ready: bool,
}

impl ClusterContext {
    /// Creates an unconnected context using the system allocator.
    pub fn new() -> Self {
        Self::with_allocator(AllocGuard::system())
    }

    /// Creates an unconnected context that allocates through `alloc`.
    pub fn with_allocator(alloc: AllocGuard) -> Self {
        Self {
            options: ClusterOptions::default(),
            seeds: Vec::new(),
            registry: NodeRegistry::new(alloc.clone()),
            slots: None,
            pipeline: VecDeque::new(),
            last_error: LastError::new(),
            on_event: None,
            ready: false,
            alloc,
        }
    }

    /// Returns a builder for configuring a context.
    pub fn builder() -> ClusterBuilder {
        ClusterBuilder::new()
    }

    pub(crate) fn with_options(options: ClusterOptions, alloc: AllocGuard) -> Self {
        let mut cc = Self::with_allocator(alloc);
        cc.options = options;
        cc
    }

    /// Records the outcome of a public call as the last error.
    fn record<T>(&mut self, result: Result<T>) -> Result<T> {
        self.last_error.clear();
        if let Err(e) = &result {
            self.last_error.set(e);
        }
        result
    }

    /// Kind of the error recorded by the last call, if it failed.
    pub fn err(&self) -> Option<ErrorKind> {
        self.last_error.kind()
    }

    /// Message of the error recorded by the last call; empty on success.
    pub fn errstr(&self) -> &str {
        self.last_error.message()
    }

    /// Current options.
    pub fn options(&self) -> &ClusterOptions {
        &self.options
    }

    /// Adds seed nodes from a comma separated list.
    ///
    /// Entries are `host:port`, `[ipv6]:port` or `redis://host[:port]`.
    /// Nodes are registered but not contacted.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidArgument` for malformed entries and
    /// `Error::OutOfMemory` on a refused allocation. Nothing is merged in
    /// either case.
    pub fn add_nodes(&mut self, descriptors: &str) -> Result<()> {
        let result = self.merge_seeds(descriptors);
        self.record(result)
    }

    fn merge_seeds(&mut self, descriptors: &str) -> Result<()> {
        let addrs = parse_descriptor_list(&self.alloc, descriptors)?;
        let staged = self.registry.stage(&addrs)?;
        let fresh = addrs.iter().filter(|a| !self.seeds.contains(a)).count();
        self.alloc.reserve(&mut self.seeds, fresh)?;

        self.registry.commit(staged);
        for addr in addrs {
            if !self.seeds.contains(&addr) {
                self.seeds.push(addr);
            }
        }
        Ok(())
    }

    /// Seed addresses added so far.
    pub fn seeds(&self) -> &[NodeAddr] {
        &self.seeds
    }

    /// Sets the password sent with `AUTH`. An empty password disables
    /// authentication.
    pub fn set_password(&mut self, password: &str) -> Result<()> {
        let result = self.copy_option(password);
        let result = result.map(|p| self.options.password = p);
        self.record(result)
    }

    /// Sets the ACL user sent with `AUTH`. An empty name clears it.
    pub fn set_username(&mut self, username: &str) -> Result<()> {
        let result = self.copy_option(username);
        let result = result.map(|u| self.options.username = u);
        self.record(result)
    }

    fn copy_option(&self, value: &str) -> Result<Option<String>> {
        if value.is_empty() {
            return Ok(None);
        }
        self.alloc.string(value).map(Some)
    }

    /// Sets the deadline for establishing connections.
    pub fn set_connect_timeout(&mut self, timeout: Duration) {
        self.options.connect_timeout = Some(timeout);
    }

    /// Sets the deadline for one command round trip.
    pub fn set_command_timeout(&mut self, timeout: Duration) {
        self.options.command_timeout = Some(timeout);
    }

    /// Sets how many redirects and retries a request may take.
    pub fn set_max_redirects(&mut self, max_redirects: u32) {
        self.options.max_redirects = max_redirects;
    }

    /// Chooses the query used to learn the slot layout.
    pub fn set_topology_source(&mut self, source: TopologySource) {
        self.options.topology_source = source;
    }

    /// Installs a callback for lifecycle events.
    pub fn set_event_callback<F>(&mut self, callback: F) -> Result<()>
    where
        F: FnMut(&ClusterContext, ClusterEvent) + Send + 'static,
    {
        let result = self.alloc.boxed(callback).map(|cb| {
            let cb: EventCallback = cb;
            self.on_event = Some(cb);
        });
        self.record(result)
    }

    fn emit(&mut self, event: ClusterEvent) {
        if let Some(mut callback) = self.on_event.take() {
            callback(self, event);
            if self.on_event.is_none() {
                self.on_event = Some(callback);
            }
        }
    }

    /// Learns the slot layout from the configured nodes.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidArgument` if no node was added, `Error::Auth`
    /// if a node rejects the credentials, and `Error::ClusterDown` if no
    /// node can provide a slot layout.
    #[instrument(skip(self), level = "debug")]
    pub fn connect(&mut self) -> Result<()> {
        let result = if self.seeds.is_empty() && self.registry.is_empty() {
            Err(Error::invalid("no nodes added to the cluster context"))
        } else {
            self.refresh()
        };
        self.record(result)
    }

    /// Queries the cluster for the current slot layout and installs it.
    ///
    /// Connected nodes are asked first, then the other known nodes, then
    /// seeds that are no longer part of the registry. The new layout only
    /// replaces the old one once it has been fully built.
    #[instrument(skip(self), level = "debug")]
    pub fn refresh_slot_map(&mut self) -> Result<()> {
        let result = self.refresh();
        self.record(result)
    }

    pub(crate) fn refresh(&mut self) -> Result<()> {
        let mut candidates: Vec<NodeKey> = self.alloc.vec(self.registry.len())?;
        let connected = |n: &&Node| n.conn().is_connected();
        candidates.extend(self.registry.iter().filter(connected).map(Node::key));
        candidates.extend(
            self.registry
                .iter()
                .filter(|n| !connected(n))
                .map(Node::key),
        );

        let mut last = None;
        for key in candidates {
            let Some(node) = self.registry.get_mut(key) else {
                continue;
            };
            let attempt = query_topology(node.conn_mut(), &self.options, &self.alloc);
            if let Some(topology) = settle(attempt, &mut last)? {
                return self.install(&topology);
            }
        }

        for i in 0..self.seeds.len() {
            let seed = &self.seeds[i];
            if self.registry.lookup(seed).is_some() {
                continue;
            }
            let addr = NodeAddr::try_new(&self.alloc, seed.host(), seed.port())?;
            let mut conn = Connection::new(addr, self.alloc.clone());
            let attempt = query_topology(&mut conn, &self.options, &self.alloc);
            conn.disconnect();
            if let Some(topology) = settle(attempt, &mut last)? {
                return self.install(&topology);
            }
        }

        Err(match last {
            Some(e @ Error::ClusterDown { .. }) => e,
            Some(e) => Error::cluster_down(format!("no reachable node in cluster: {e}")),
            None => Error::cluster_down("no reachable node in cluster"),
        })
    }

    /// Swaps in a parsed topology.
    pub(crate) fn install(&mut self, topology: &ClusterTopology) -> Result<()> {
        let plan = self.registry.plan(topology)?;
        let slots = self.registry.apply(plan);
        debug!(
            nodes = self.registry.len(),
            slots = slots.assigned_slots(),
            "slot map updated"
        );
        self.slots = Some(slots);
        self.emit(ClusterEvent::SlotMapUpdated);
        if !self.ready {
            self.ready = true;
            self.emit(ClusterEvent::Ready);
        }
        Ok(())
    }

    /// Parses a topology reply received by `origin` and installs it.
    pub(crate) fn install_reply(&mut self, reply: &Reply, origin: &NodeAddr) -> Result<()> {
        let topology = parse_topology(reply, origin, &self.options, &self.alloc)?;
        self.install(&topology)
    }

    /// Sends a command to the node owning its keys and returns the final
    /// reply.
    ///
    /// Error replies from the node that are not cluster signals are
    /// returned as `Ok(Reply::Error(..))`.
    ///
    /// # Errors
    ///
    /// Returns `Error::CrossSlot` without any I/O if the keys span slots,
    /// `Error::ClusterDown` if the slot has no owner, and
    /// `Error::TooManyRetries` once the redirect budget is used up.
    #[instrument(skip_all, level = "debug")]
    pub fn command<A: AsRef<[u8]>>(&mut self, args: &[A]) -> Result<Reply> {
        let result = self.execute(args);
        self.record(result)
    }

    /// Splits `line` on whitespace and runs it as a command.
    pub fn command_str(&mut self, line: &str) -> Result<Reply> {
        let result = self.execute_line(line);
        self.record(result)
    }

    fn execute_line(&mut self, line: &str) -> Result<Reply> {
        let count = line.split_whitespace().count();
        if count == 0 {
            return Err(Error::invalid("empty command"));
        }
        let mut args: Vec<&str> = self.alloc.vec(count)?;
        args.extend(line.split_whitespace());
        self.execute(&args)
    }

    fn execute<A: AsRef<[u8]>>(&mut self, args: &[A]) -> Result<Reply> {
        let route = route(args)?;
        let encoded = encode_command(&self.alloc, args)?;
        let node = self.node_for_route(route)?;
        let mut machine = RequestMachine::new(self.options.max_redirects);
        self.dispatch(route, &encoded, &mut machine, Hop::Send(node))
    }

    /// Sends a command to one node. Redirects are returned as replies.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidArgument` if `addr` is not a known node.
    #[instrument(skip(self, args), level = "debug")]
    pub fn command_to_node<A: AsRef<[u8]>>(&mut self, addr: &NodeAddr, args: &[A]) -> Result<Reply> {
        let result = self.execute_on(addr, args);
        self.record(result)
    }

    fn execute_on<A: AsRef<[u8]>>(&mut self, addr: &NodeAddr, args: &[A]) -> Result<Reply> {
        if args.is_empty() {
            return Err(Error::invalid("empty command"));
        }
        let key = self.known_node(addr)?;
        let encoded = encode_command(&self.alloc, args)?;
        self.send_to(key, &encoded, false)
    }

    fn known_node(&self, addr: &NodeAddr) -> Result<NodeKey> {
        self.registry
            .lookup(addr)
            .ok_or_else(|| Error::invalid(format!("{addr} is not a known cluster node")))
    }

    /// Queues a command; its reply is collected by [`get_reply`](Self::get_reply).
    ///
    /// A failed append leaves the pipeline and connection buffers as they
    /// were.
    pub fn append_command<A: AsRef<[u8]>>(&mut self, args: &[A]) -> Result<()> {
        let result = self.append(args);
        self.record(result)
    }

    fn append<A: AsRef<[u8]>>(&mut self, args: &[A]) -> Result<()> {
        let route = route(args)?;
        let encoded = encode_command(&self.alloc, args)?;
        let node = self.node_for_route(route)?;
        self.enqueue(encoded, Some(route), node)
    }

    /// Queues a command for one node. Its reply is never redirected.
    pub fn append_command_to_node<A: AsRef<[u8]>>(&mut self, addr: &NodeAddr, args: &[A]) -> Result<()> {
        let result = self.append_on(addr, args);
        self.record(result)
    }

    fn append_on<A: AsRef<[u8]>>(&mut self, addr: &NodeAddr, args: &[A]) -> Result<()> {
        if args.is_empty() {
            return Err(Error::invalid("empty command"));
        }
        let node = self.known_node(addr)?;
        let encoded = encode_command(&self.alloc, args)?;
        self.enqueue(encoded, None, node)
    }

    fn enqueue(&mut self, encoded: Bytes, route: Option<Route>, node: NodeKey) -> Result<()> {
        self.alloc.reserve_deque(&mut self.pipeline, 1)?;
        let conn = self
            .registry
            .get_mut(node)
            .ok_or_else(|| Error::connection("node left the cluster"))?
            .conn_mut();
        conn.ensure_connected(&self.options)?;
        conn.queue(&encoded)?;
        let epoch = conn.epoch();

        let mut machine = RequestMachine::new(self.options.max_redirects);
        machine.written();
        self.pipeline.push_back(PendingRequest {
            encoded,
            route,
            node,
            epoch,
            machine,
        });
        Ok(())
    }

    /// Returns the reply to the oldest appended command.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidArgument` if nothing is pending. On
    /// `Error::OutOfMemory` the request stays queued and the call can be
    /// repeated; any other error retires it.
    #[instrument(skip(self), level = "debug")]
    pub fn get_reply(&mut self) -> Result<Reply> {
        let result = self.next_pipelined();
        self.record(result)
    }

    fn next_pipelined(&mut self) -> Result<Reply> {
        let Some(front) = self.pipeline.front() else {
            return Err(Error::invalid("no pending request"));
        };
        let (key, epoch) = (front.node, front.epoch);

        let usable = self
            .registry
            .get(key)
            .map(|n| n.conn().epoch() == epoch && n.conn().is_connected())
            .unwrap_or(false);
        if !usable {
            self.pipeline.pop_front();
            return Err(Error::connection("connection lost before the reply arrived"));
        }

        let received = match self.registry.get_mut(key) {
            Some(node) => node.conn_mut().next_reply(),
            None => Err(Error::connection("node left the cluster")),
        };
        if matches!(received, Err(Error::OutOfMemory)) {
            return Err(Error::OutOfMemory);
        }
        let Some(mut request) = self.pipeline.pop_front() else {
            return Err(Error::invalid("no pending request"));
        };
        let Some(route) = request.route else {
            return received;
        };
        match self.after_attempt(route, &mut request.machine, key, received)? {
            ControlFlow::Break(reply) => Ok(reply),
            ControlFlow::Continue(hop) => {
                self.dispatch(route, &request.encoded, &mut request.machine, hop)
            }
        }
    }

    /// Drops every pending request and closes every connection.
    pub fn reset(&mut self) {
        debug!(pending = self.pipeline.len(), "resetting cluster context");
        self.pipeline.clear();
        self.registry.disconnect_all();
        self.last_error.clear();
    }

    /// Number of appended commands whose reply was not collected yet.
    pub fn pending(&self) -> usize {
        self.pipeline.len()
    }

    /// Known nodes.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.registry.iter()
    }

    /// The node with `key`, if still registered.
    pub fn node(&self, key: NodeKey) -> Option<&Node> {
        self.registry.get(key)
    }

    /// The current slot map, once a refresh succeeded.
    pub fn slot_map(&self) -> Option<&SlotMap> {
        self.slots.as_ref()
    }

    /// The node owning `slot`.
    ///
    /// # Errors
    ///
    /// Returns `Error::ClusterDown` if the slot has no known owner.
    pub fn node_for_slot(&self, slot: u16) -> Result<&Node> {
        self.slot_owner(slot).and_then(|key| {
            self.registry
                .get(key)
                .ok_or_else(|| Error::cluster_down("slot owner left the cluster"))
        })
    }

    fn slot_owner(&self, slot: u16) -> Result<NodeKey> {
        self.slots
            .as_ref()
            .and_then(|map| map.owner(slot))
            .filter(|key| self.registry.get(*key).is_some())
            .ok_or_else(|| Error::cluster_down(format!("slot {slot} is not served by any node")))
    }

    pub(crate) fn node_for_route(&self, route: Route) -> Result<NodeKey> {
        match route {
            Route::Slot(slot) => self.slot_owner(slot),
            Route::Any => self
                .registry
                .iter()
                .find(|n| n.conn().is_connected())
                .or_else(|| self.registry.iter().next())
                .map(Node::key)
                .ok_or_else(|| Error::cluster_down("no node available")),
        }
    }

    pub(crate) fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub(crate) fn alloc(&self) -> &AllocGuard {
        &self.alloc
    }

    pub(crate) fn record_error(&mut self, err: &Error) {
        self.last_error.set(err);
    }

    /// Sends `encoded` along `hop` until a final reply or error.
    fn dispatch(
        &mut self,
        route: Route,
        encoded: &[u8],
        machine: &mut RequestMachine,
        mut hop: Hop,
    ) -> Result<Reply> {
        loop {
            let (key, asking) = match hop {
                Hop::Send(key) => (key, false),
                Hop::Ask(key) => (key, true),
            };
            machine.written();
            let attempt = self.send_to(key, encoded, asking);
            match self.after_attempt(route, machine, key, attempt)? {
                ControlFlow::Break(reply) => return Ok(reply),
                ControlFlow::Continue(next) => hop = next,
            }
        }
    }

    fn send_to(&mut self, key: NodeKey, encoded: &[u8], asking: bool) -> Result<Reply> {
        let conn = self
            .registry
            .get_mut(key)
            .ok_or_else(|| Error::connection("node left the cluster"))?
            .conn_mut();
        conn.ensure_connected(&self.options)?;
        if asking {
            conn.round_trip_asking(encoded)
        } else {
            conn.round_trip(encoded)
        }
    }

    /// Decides what follows one attempt of a request sent to `sender`.
    fn after_attempt(
        &mut self,
        route: Route,
        machine: &mut RequestMachine,
        sender: NodeKey,
        attempt: Result<Reply>,
    ) -> Result<ControlFlow<Reply, Hop>> {
        let (action, reply) = match attempt {
            Ok(reply) => {
                let sender = self
                    .registry
                    .get(sender)
                    .map(Node::addr)
                    .ok_or_else(|| Error::connection("node left the cluster"))?;
                let step = machine.on_reply(&reply, sender);
                (self.resolve(step)?, Some(reply))
            }
            Err(e) if e.is_transport() => {
                warn!(error = %e, "transport failure, retrying");
                (self.resolve(machine.on_transport_error(e))?, None)
            }
            Err(e) => return Err(e),
        };

        let hop = match action {
            Action::Complete => {
                return reply
                    .map(ControlFlow::Break)
                    .ok_or_else(|| Error::connection("no reply"));
            }
            Action::Fail(e) => return Err(e),
            Action::Moved { slot, target } => {
                let key = self.redirect_moved(slot, target)?;
                Hop::Send(key)
            }
            Action::Ask { target } => Hop::Ask(self.register(target)?),
            Action::Retry { refresh } => {
                if refresh {
                    self.refresh_for_retry()?;
                }
                Hop::Send(self.node_for_route(route)?)
            }
        };
        machine.resend();
        Ok(ControlFlow::Continue(hop))
    }

    /// Turns a borrowed step into an owned action.
    pub(crate) fn resolve(&self, step: Step<'_>) -> Result<Action> {
        let target = |host: &str, port: u16| -> Result<Target> {
            Ok(match self.registry.find(host, port) {
                Some(key) => Target::Known(key),
                None => Target::New(NodeAddr::try_new(&self.alloc, host, port)?),
            })
        };
        Ok(match step {
            Step::Complete => Action::Complete,
            Step::Moved { slot, host, port } => Action::Moved {
                slot,
                target: target(host, port)?,
            },
            Step::Ask { host, port } => Action::Ask {
                target: target(host, port)?,
            },
            Step::Retry { refresh } => Action::Retry { refresh },
            Step::Fail(e) => Action::Fail(e),
        })
    }

    pub(crate) fn register(&mut self, target: Target) -> Result<NodeKey> {
        match target {
            Target::Known(key) => Ok(key),
            Target::New(addr) => self.registry.insert_or_get(addr.host(), addr.port()),
        }
    }

    /// Points `slot` at the redirect target.
    pub(crate) fn redirect_moved(&mut self, slot: u16, target: Target) -> Result<NodeKey> {
        let key = self.register(target)?;
        if let Some(slots) = self.slots.as_mut() {
            slots.set(slot, key);
        }
        debug!(slot, key = key.get(), "slot moved");
        Ok(key)
    }

    /// Refresh triggered by a retry. Only allocation and authentication
    /// failures end the request; otherwise the old map is kept.
    fn refresh_for_retry(&mut self) -> Result<()> {
        match self.refresh() {
            Ok(()) => Ok(()),
            Err(e @ (Error::OutOfMemory | Error::Auth { .. })) => Err(e),
            Err(e) => {
                warn!(error = %e, "slot map refresh failed, keeping the old one");
                Ok(())
            }
        }
    }
}

impl Default for ClusterContext {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ClusterContext {
    fn drop(&mut self) {
        self.emit(ClusterEvent::Freeing);
        self.pipeline.clear();
        self.registry.disconnect_all();
    }
}

impl fmt::Debug for ClusterContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterContext")
            .field("options", &self.options)
            .field("seeds", &self.seeds)
            .field("registry", &self.registry)
            .field("pending", &self.pipeline.len())
            .field("last_error", &self.last_error)
            .finish_non_exhaustive()
    }
}

/// Connects `conn` if needed and asks it for the topology.
fn query_topology(
    conn: &mut Connection,
    options: &ClusterOptions,
    alloc: &AllocGuard,
) -> Result<ClusterTopology> {
    conn.ensure_connected(options)?;
    let encoded = encode_command(alloc, &options.topology_source.command())?;
    let reply = conn.round_trip(&encoded)?;
    parse_topology(&reply, conn.addr(), options, alloc)
}

fn parse_topology(
    reply: &Reply,
    origin: &NodeAddr,
    options: &ClusterOptions,
    alloc: &AllocGuard,
) -> Result<ClusterTopology> {
    if let Some(message) = reply.error_message() {
        return Err(match classify(reply) {
            Some(Signal::Auth) => Error::Auth {
                message: message.to_string(),
            },
            Some(Signal::ClusterDown) => Error::cluster_down(message),
            _ => Error::protocol(format!("{origin} refused the topology query: {message}")),
        });
    }
    let topology = options.topology_source.parse(reply, origin, alloc)?;
    if topology.is_empty() {
        return Err(Error::cluster_down(format!("{origin} reports no slot assignments")));
    }
    Ok(topology)
}

/// Sorts one refresh attempt into "use it", "try the next node" or "stop".
fn settle(
    attempt: Result<ClusterTopology>,
    last: &mut Option<Error>,
) -> Result<Option<ClusterTopology>> {
    match attempt {
        Ok(topology) => Ok(Some(topology)),
        Err(e @ (Error::OutOfMemory | Error::Auth { .. })) => Err(e),
        Err(e) => {
            warn!(error = %e, "topology query failed, trying next node");
            *last = Some(e);
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::alloc::FailAfter;
    use crate::cluster::slot::key_slot;
    use crate::testing::MockCluster;

    fn connected(cluster: &MockCluster) -> ClusterContext {
        let mut cc = ClusterContext::new();
        cc.add_nodes(&cluster.seeds()).unwrap();
        cc.connect().unwrap();
        cc
    }

    #[test]
    fn test_connect_without_nodes() {
        let mut cc = ClusterContext::new();
        let err = cc.connect().unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
        assert_eq!(cc.err(), Some(ErrorKind::InvalidArgument));
        assert!(cc.errstr().contains("no nodes"));
    }

    #[test]
    fn test_add_nodes_is_all_or_nothing() {
        let mut cc = ClusterContext::new();
        assert!(cc.add_nodes("127.0.0.1:7000,not-an-address").is_err());
        assert!(cc.seeds().is_empty());
        assert_eq!(cc.nodes().count(), 0);

        cc.add_nodes(" 127.0.0.1:7000 , redis://127.0.0.1:7001").unwrap();
        cc.add_nodes("127.0.0.1:7000").unwrap();
        assert_eq!(cc.seeds().len(), 2);
        assert_eq!(cc.nodes().count(), 2);
        assert_eq!(cc.err(), None);
    }

    #[test]
    fn test_command_before_connect_is_cluster_down() {
        let mut cc = ClusterContext::new();
        cc.add_nodes("127.0.0.1:7000").unwrap();
        let err = cc.command(&["GET", "foo"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ClusterDown);
    }

    #[test]
    fn test_cross_slot_fails_without_io() {
        let cluster = MockCluster::builder().nodes(3).build();
        let mut cc = connected(&cluster);
        cluster.clear_log();

        let err = cc.command(&["MGET", "foo", "bar"]).unwrap_err();
        assert!(matches!(err, Error::CrossSlot));
        assert_eq!(cc.err(), Some(ErrorKind::InvalidArgument));
        assert_eq!(cluster.command_count(), 0);
    }

    #[test]
    fn test_connect_covers_every_slot() {
        let cluster = MockCluster::builder().nodes(3).build();
        let cc = connected(&cluster);
        assert!(cc.slot_map().unwrap().is_fully_covered());
        assert_eq!(cc.nodes().count(), 3);

        let owner = cc.node_for_slot(key_slot("foo")).unwrap();
        assert_eq!(owner.addr(), &cluster.addr(cluster.owner_of(key_slot("foo"))));
    }

    #[test]
    fn test_refresh_is_idempotent() {
        let cluster = MockCluster::builder().nodes(3).build();
        let mut cc = connected(&cluster);
        let before = cc.slot_map().unwrap().clone();
        cc.refresh_slot_map().unwrap();
        assert_eq!(cc.slot_map().unwrap(), &before);
    }

    #[test]
    fn test_set_then_get() {
        let cluster = MockCluster::builder().nodes(3).build();
        let mut cc = connected(&cluster);

        assert!(cc.command(&["SET", "foo", "bar"]).unwrap().is_ok());
        let value = cc.command_str("GET foo").unwrap();
        assert_eq!(value.as_bytes(), Some(&b"bar"[..]));
        assert!(cc.command_str("   ").is_err());
    }

    #[test]
    fn test_keyless_command_goes_anywhere() {
        let cluster = MockCluster::builder().nodes(2).build();
        let mut cc = connected(&cluster);
        let reply = cc.command(&["PING"]).unwrap();
        assert_eq!(reply.as_str(), Some("PONG"));
    }

    #[test]
    fn test_moved_updates_slot_map() {
        let cluster = MockCluster::builder().nodes(3).unlisted(1).build();
        let mut cc = connected(&cluster);
        let slot = key_slot("foo");
        cluster.move_slot(slot, 3);

        assert!(cc.command(&["SET", "foo", "moved"]).unwrap().is_ok());
        let owner = cc.node_for_slot(slot).unwrap();
        assert_eq!(owner.addr(), &cluster.addr(3));
        assert_eq!(cluster.value("foo").as_deref(), Some("moved"));
        assert_eq!(cluster.commands_on(3), vec!["SET foo moved"]);
    }

    #[test]
    fn test_ask_leaves_slot_map_alone() {
        let cluster = MockCluster::builder().nodes(3).build();
        let mut cc = connected(&cluster);
        let slot = key_slot("foo");
        let owner = cluster.owner_of(slot);
        let target = (owner + 1) % 3;
        cluster.begin_migration(slot, target);

        assert!(cc.command(&["SET", "foo", "asked"]).unwrap().is_ok());
        assert_eq!(cc.node_for_slot(slot).unwrap().addr(), &cluster.addr(owner));
        assert_eq!(cluster.commands_on(target), vec!["ASKING", "SET foo asked"]);
    }

    #[test]
    fn test_retry_budget_exhaustion() {
        let cluster = MockCluster::builder().nodes(1).build();
        let mut cc = connected(&cluster);
        cc.set_max_redirects(2);
        for _ in 0..3 {
            cluster.inject_reply(0, "-TRYAGAIN Multiple keys request during rehashing of slot");
        }
        let err = cc.command(&["GET", "foo"]).unwrap_err();
        assert!(matches!(err, Error::TooManyRetries { .. }));
        assert_eq!(cc.err(), Some(ErrorKind::TooManyRetries));
    }

    #[test]
    fn test_clusterdown_surfaces_after_budget() {
        let cluster = MockCluster::builder().nodes(1).build();
        let mut cc = connected(&cluster);
        cc.set_max_redirects(1);
        cluster.set_cluster_down(true);
        let err = cc.command(&["GET", "foo"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ClusterDown);

        cluster.set_cluster_down(false);
        cc.refresh_slot_map().unwrap();
        assert!(cc.command(&["GET", "foo"]).unwrap().is_nil());
    }

    #[test]
    fn test_pipeline_preserves_order_across_nodes() {
        let cluster = MockCluster::builder().nodes(3).build();
        let mut cc = connected(&cluster);

        cc.append_command(&["SET", "foo", "1"]).unwrap();
        cc.append_command(&["SET", "bar", "2"]).unwrap();
        cc.append_command(&["GET", "foo"]).unwrap();
        cc.append_command(&["GET", "bar"]).unwrap();
        assert_eq!(cc.pending(), 4);

        assert!(cc.get_reply().unwrap().is_ok());
        assert!(cc.get_reply().unwrap().is_ok());
        assert_eq!(cc.get_reply().unwrap().as_bytes(), Some(&b"1"[..]));
        assert_eq!(cc.get_reply().unwrap().as_bytes(), Some(&b"2"[..]));

        let err = cc.get_reply().unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
    }

    #[test]
    fn test_pipeline_follows_moved() {
        let cluster = MockCluster::builder().nodes(2).unlisted(1).build();
        let mut cc = connected(&cluster);
        cluster.move_slot(key_slot("foo"), 2);

        cc.append_command(&["SET", "foo", "x"]).unwrap();
        cc.append_command(&["GET", "foo"]).unwrap();
        assert!(cc.get_reply().unwrap().is_ok());
        assert_eq!(cc.get_reply().unwrap().as_bytes(), Some(&b"x"[..]));
    }

    #[test]
    fn test_reset_drops_pending() {
        let cluster = MockCluster::builder().nodes(1).build();
        let mut cc = connected(&cluster);
        cc.append_command(&["GET", "foo"]).unwrap();
        cc.reset();
        assert_eq!(cc.pending(), 0);
        assert!(cc.get_reply().is_err());
        assert!(cc.command(&["GET", "foo"]).unwrap().is_nil());
    }

    #[test]
    fn test_command_to_node_does_not_follow_redirects() {
        let cluster = MockCluster::builder().nodes(2).build();
        let mut cc = connected(&cluster);
        let slot = key_slot("foo");
        let other = cluster.addr(1 - cluster.owner_of(slot));

        let reply = cc.command_to_node(&other, &["GET", "foo"]).unwrap();
        assert!(reply.error_message().unwrap().starts_with("MOVED"));

        let unknown = NodeAddr::new("127.0.0.1", 1);
        let err = cc.command_to_node(&unknown, &["PING"]).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
    }

    #[test]
    fn test_events_fire() {
        let cluster = MockCluster::builder().nodes(1).build();
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let mut cc = ClusterContext::new();
            let sink = Arc::clone(&seen);
            cc.set_event_callback(move |_, event| sink.lock().unwrap().push(event))
                .unwrap();
            cc.add_nodes(&cluster.seeds()).unwrap();
            cc.connect().unwrap();
            cc.refresh_slot_map().unwrap();
        }
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                ClusterEvent::SlotMapUpdated,
                ClusterEvent::Ready,
                ClusterEvent::SlotMapUpdated,
                ClusterEvent::Freeing,
            ]
        );
    }

    #[test]
    fn test_out_of_memory_leaves_context_usable() {
        let cluster = MockCluster::builder().nodes(3).build();
        let alloc = Arc::new(FailAfter::unlimited());
        let mut cc = ClusterContext::with_allocator(AllocGuard::shared(alloc.clone()));
        cc.add_nodes(&cluster.seeds()).unwrap();
        cc.connect().unwrap();

        let mut budget = 0;
        let reply = loop {
            alloc.set_remaining(budget);
            match cc.command(&["SET", "{k}1", "v"]) {
                Ok(reply) => break reply,
                Err(Error::OutOfMemory) => {
                    assert_eq!(cc.errstr(), "Out of memory");
                    budget += 1;
                }
                Err(e) => panic!("unexpected {e:?}"),
            }
        };
        alloc.set_unlimited();
        assert!(budget > 0);
        assert!(reply.is_ok());
        assert_eq!(cluster.value("{k}1").as_deref(), Some("v"));
    }
}
