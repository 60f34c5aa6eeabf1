//! A fake Redis Cluster served from a background thread.
//!
//! Every node listens on its own loopback port and answers a small command
//! set against one shared keyspace: `AUTH`, `PING`, `ASKING`,
//! `CLUSTER SLOTS`, `CLUSTER NODES`, `GET`, `SET`, `DEL`, `EXISTS`, `MGET`,
//! `MSET` and `INCR`. Keyed commands sent to the wrong node get `MOVED` or
//! `ASK` exactly like a real cluster.

use std::collections::{HashMap, VecDeque};
use std::net::TcpListener as StdListener;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};
use tracing::{debug, warn};

use crate::cluster::addr::NodeAddr;
use crate::cluster::slot::{key_slot, SLOT_COUNT};
use crate::proto::codec::{Decoder, Encoder};
use crate::proto::reply::Reply;

const HOST: &str = "127.0.0.1";

/// Configures a [`MockCluster`].
#[derive(Debug)]
pub struct MockClusterBuilder {
    nodes: usize,
    unlisted: usize,
    password: Option<String>,
}

impl Default for MockClusterBuilder {
    fn default() -> Self {
        Self {
            nodes: 3,
            unlisted: 0,
            password: None,
        }
    }
}

impl MockClusterBuilder {
    /// Number of masters sharing the slots evenly (default: 3).
    pub fn nodes(mut self, nodes: usize) -> Self {
        self.nodes = nodes.max(1);
        self
    }

    /// Extra nodes that start without slots, so topology replies leave them
    /// out until a slot is moved to them.
    pub fn unlisted(mut self, unlisted: usize) -> Self {
        self.unlisted = unlisted;
        self
    }

    /// Requires `AUTH` with this password on every connection.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Binds every node and starts serving.
    ///
    /// # Panics
    ///
    /// Panics if a loopback port cannot be bound or the server thread
    /// cannot be spawned.
    pub fn build(self) -> MockCluster {
        let total = self.nodes + self.unlisted;
        let listeners: Vec<StdListener> = (0..total)
            .map(|_| {
                let listener = StdListener::bind((HOST, 0)).expect("bind mock node");
                listener
                    .set_nonblocking(true)
                    .expect("non-blocking mock listener");
                listener
            })
            .collect();
        let ports: Vec<u16> = listeners
            .iter()
            .map(|l| l.local_addr().expect("mock node address").port())
            .collect();

        let state = Arc::new(Mutex::new(State::new(
            ports.clone(),
            self.nodes,
            self.password,
        )));
        let (kick, kicked) = watch::channel(0u64);
        let (shutdown, stopped) = oneshot::channel();

        let shared = Arc::clone(&state);
        let thread = std::thread::Builder::new()
            .name("mock-cluster".into())
            .spawn(move || run(listeners, shared, kicked, stopped))
            .expect("spawn mock cluster thread");

        debug!(?ports, "mock cluster started");
        MockCluster {
            ports,
            state,
            kick,
            shutdown: Some(shutdown),
            thread: Some(thread),
        }
    }
}

/// An in-process Redis Cluster for tests.
///
/// # Example
///
/// ```ignore
/// use shardis::testing::MockCluster;
/// use shardis::ClusterContext;
///
/// let cluster = MockCluster::builder().nodes(3).build();
/// let mut cc = ClusterContext::new();
/// cc.add_nodes(&cluster.seeds()).unwrap();
/// cc.connect().unwrap();
/// assert!(cc.command(&["SET", "foo", "bar"]).unwrap().is_ok());
/// assert_eq!(cluster.value("foo").as_deref(), Some("bar"));
/// ```
pub struct MockCluster {
    ports: Vec<u16>,
    state: Arc<Mutex<State>>,
    kick: watch::Sender<u64>,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl MockCluster {
    /// Returns a builder with three nodes and no password.
    pub fn builder() -> MockClusterBuilder {
        MockClusterBuilder::default()
    }

    /// Number of nodes, unlisted ones included.
    pub fn len(&self) -> usize {
        self.ports.len()
    }

    /// Always false; a mock cluster has at least one node.
    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    /// Comma separated addresses of the nodes that start with slots.
    pub fn seeds(&self) -> String {
        let listed = self.lock().listed;
        self.ports[..listed]
            .iter()
            .map(|port| format!("{HOST}:{port}"))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Address of node `node`.
    pub fn addr(&self, node: usize) -> NodeAddr {
        NodeAddr::new(HOST, self.ports[node])
    }

    /// Index of the node owning `slot`.
    pub fn owner_of(&self, slot: u16) -> usize {
        self.lock().owners[usize::from(slot)]
    }

    /// Hands `slot` to node `to` for good.
    pub fn move_slot(&self, slot: u16, to: usize) {
        let mut state = self.lock();
        state.owners[usize::from(slot)] = to;
        state.migrating.remove(&slot);
    }

    /// Starts migrating `slot` to node `to`: the owner answers `ASK` and
    /// `to` serves the slot after `ASKING`.
    pub fn begin_migration(&self, slot: u16, to: usize) {
        self.lock().migrating.insert(slot, to);
    }

    /// Makes node `node` answer its next keyed command with `line`.
    ///
    /// A leading `-` gives an error reply, `+` a status, `:` an integer;
    /// anything else is sent as a bulk string.
    pub fn inject_reply(&self, node: usize, line: &str) {
        let reply = parse_line(line);
        self.lock().injected[node].push_back(reply);
    }

    /// Makes every keyed command fail with `CLUSTERDOWN`.
    pub fn set_cluster_down(&self, down: bool) {
        self.lock().cluster_down = down;
    }

    /// Changes the password every node requires, like `CONFIG SET
    /// requirepass`. Open connections must authenticate again.
    pub fn set_password(&self, password: Option<&str>) {
        self.lock().password = password.map(str::to_string);
    }

    /// Closes every client connection currently open.
    pub fn disconnect_clients(&self) {
        self.kick.send_modify(|generation| *generation += 1);
    }

    /// Forgets the command log.
    pub fn clear_log(&self) {
        for log in self.lock().log.iter_mut() {
            log.clear();
        }
    }

    /// Commands received by all nodes, `AUTH` and `CLUSTER` excluded.
    pub fn command_count(&self) -> usize {
        self.lock().log.iter().map(Vec::len).sum()
    }

    /// Commands received by node `node`, as space separated words.
    pub fn commands_on(&self, node: usize) -> Vec<String> {
        self.lock().log[node].clone()
    }

    /// Current value of `key`.
    pub fn value(&self, key: &str) -> Option<String> {
        self.lock()
            .data
            .get(key.as_bytes())
            .map(|v| String::from_utf8_lossy(v).into_owned())
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for MockCluster {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl std::fmt::Debug for MockCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockCluster")
            .field("ports", &self.ports)
            .finish_non_exhaustive()
    }
}

fn run(
    listeners: Vec<StdListener>,
    state: Arc<Mutex<State>>,
    kicked: watch::Receiver<u64>,
    stopped: oneshot::Receiver<()>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            warn!(error = %e, "mock cluster runtime failed to start");
            return;
        }
    };

    runtime.block_on(async move {
        for (node, listener) in listeners.into_iter().enumerate() {
            match TcpListener::from_std(listener) {
                Ok(listener) => {
                    tokio::spawn(accept(node, listener, Arc::clone(&state), kicked.clone()));
                }
                Err(e) => warn!(node, error = %e, "mock node failed to listen"),
            }
        }
        let _ = stopped.await;
    });
}

async fn accept(
    node: usize,
    listener: TcpListener,
    state: Arc<Mutex<State>>,
    kicked: watch::Receiver<u64>,
) {
    loop {
        let Ok((socket, _)) = listener.accept().await else {
            return;
        };
        let _ = socket.set_nodelay(true);
        tokio::spawn(serve(node, socket, Arc::clone(&state), kicked.clone()));
    }
}

async fn serve(
    node: usize,
    mut socket: TcpStream,
    state: Arc<Mutex<State>>,
    mut kicked: watch::Receiver<u64>,
) {
    let _ = kicked.borrow_and_update();
    let mut decoder = Decoder::new();
    let mut encoder = Encoder::new();
    let mut session = Session::default();
    let mut buf = [0u8; 4096];

    loop {
        let n = tokio::select! {
            read = socket.read(&mut buf) => match read {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            },
            _ = kicked.changed() => return,
        };
        if decoder.append(&buf[..n]).is_err() {
            return;
        }

        while let Ok(Some(request)) = decoder.decode() {
            let reply = state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .execute(node, &mut session, request);
            if encoder.encode(&reply).is_err() {
                return;
            }
            if socket.write_all(&encoder.take()).await.is_err() {
                return;
            }
        }
    }
}

/// Per-connection flags.
#[derive(Default)]
struct Session {
    authed: bool,
    asking: bool,
}

struct State {
    ports: Vec<u16>,
    listed: usize,
    owners: Vec<usize>,
    migrating: HashMap<u16, usize>,
    data: HashMap<Bytes, Bytes>,
    injected: Vec<VecDeque<Reply>>,
    log: Vec<Vec<String>>,
    cluster_down: bool,
    password: Option<String>,
}

impl State {
    fn new(ports: Vec<u16>, listed: usize, password: Option<String>) -> Self {
        let total = ports.len();
        let slots = usize::from(SLOT_COUNT);
        // same split as redis-cli: 0-5460, 5461-10922, 10923-16383 for three
        let start = |i: usize| (2 * i * slots + listed) / (2 * listed);
        let mut owners = vec![0; slots];
        for node in 0..listed {
            let end = if node + 1 == listed { slots } else { start(node + 1) };
            owners[start(node)..end].fill(node);
        }

        Self {
            ports,
            listed,
            owners,
            migrating: HashMap::new(),
            data: HashMap::new(),
            injected: vec![VecDeque::new(); total],
            log: vec![Vec::new(); total],
            cluster_down: false,
            password,
        }
    }

    fn execute(&mut self, node: usize, session: &mut Session, request: Reply) -> Reply {
        let args = match request {
            Reply::Array(items) => {
                let mut args = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        Reply::Bulk(arg) => args.push(arg),
                        _ => return error("ERR Protocol error: expected bulk strings"),
                    }
                }
                args
            }
            _ => return error("ERR Protocol error: expected an array"),
        };
        let Some(name) = args.first() else {
            return error("ERR empty command");
        };
        let name = String::from_utf8_lossy(name).to_ascii_uppercase();

        if name == "AUTH" {
            return self.auth(session, &args[1..]);
        }
        if self.password.is_some() && !session.authed {
            return error("NOAUTH Authentication required.");
        }
        if name == "CLUSTER" {
            return self.cluster(node, &args[1..]);
        }

        self.log[node].push(
            args.iter()
                .map(|a| String::from_utf8_lossy(a).into_owned())
                .collect::<Vec<_>>()
                .join(" "),
        );
        if name == "ASKING" {
            session.asking = true;
            return status("OK");
        }
        let asking = std::mem::take(&mut session.asking);
        if name == "PING" {
            return status("PONG");
        }
        if let Some(reply) = self.injected[node].pop_front() {
            return reply;
        }
        if self.cluster_down {
            return error("CLUSTERDOWN The cluster is down");
        }

        let keys = match keys_of(&name, &args) {
            Ok(keys) => keys,
            Err(reply) => return reply,
        };
        let mut slots = keys.iter().map(key_slot);
        let Some(slot) = slots.next() else {
            return error("ERR no keys");
        };
        if slots.any(|s| s != slot) {
            return error("CROSSSLOT Keys in request don't hash to the same slot");
        }

        let owner = self.owners[usize::from(slot)];
        let importing = self.migrating.get(&slot).copied();
        match importing {
            Some(to) if owner == node => {
                return error(&format!("ASK {slot} {HOST}:{}", self.ports[to]));
            }
            Some(to) if to == node && asking => {}
            _ if owner == node => {}
            _ => return error(&format!("MOVED {slot} {HOST}:{}", self.ports[owner])),
        }
        self.apply(&name, &args)
    }

    fn auth(&self, session: &mut Session, args: &[Bytes]) -> Reply {
        let Some(password) = &self.password else {
            return error(
                "ERR AUTH <password> called without any password configured for the default user. \
                 Are you sure your configuration is correct?",
            );
        };
        let accepted = match args {
            [given] => given.as_ref() == password.as_bytes(),
            [user, given] => user.as_ref() == b"default" && given.as_ref() == password.as_bytes(),
            _ => return error("ERR wrong number of arguments for 'auth' command"),
        };
        if accepted {
            session.authed = true;
            status("OK")
        } else {
            error("WRONGPASS invalid username-password pair or user is disabled.")
        }
    }

    fn cluster(&self, node: usize, args: &[Bytes]) -> Reply {
        let sub = args
            .first()
            .map(|a| String::from_utf8_lossy(a).to_ascii_uppercase())
            .unwrap_or_default();
        match sub.as_str() {
            "SLOTS" => Reply::Array(
                self.ranges()
                    .into_iter()
                    .map(|(start, end, owner)| {
                        Reply::Array(vec![
                            Reply::Integer(i64::from(start)),
                            Reply::Integer(i64::from(end)),
                            Reply::Array(vec![
                                bulk(HOST),
                                Reply::Integer(i64::from(self.ports[owner])),
                                bulk(&node_id(owner)),
                            ]),
                        ])
                    })
                    .collect(),
            ),
            "NODES" => {
                let ranges = self.ranges();
                let mut text = String::new();
                for (i, port) in self.ports.iter().enumerate() {
                    let owned: Vec<String> = ranges
                        .iter()
                        .filter(|(_, _, owner)| *owner == i)
                        .map(|(start, end, _)| format!(" {start}-{end}"))
                        .collect();
                    if owned.is_empty() && i >= self.listed {
                        continue;
                    }
                    let flags = if i == node { "myself,master" } else { "master" };
                    text.push_str(&format!(
                        "{} {HOST}:{port}@{} {flags} - 0 0 {} connected{}\n",
                        node_id(i),
                        u32::from(*port) + 10000,
                        i + 1,
                        owned.concat(),
                    ));
                }
                bulk(&text)
            }
            _ => error("ERR unknown subcommand"),
        }
    }

    /// Owner runs as `(start, end, node)`.
    fn ranges(&self) -> Vec<(u16, u16, usize)> {
        let mut ranges: Vec<(u16, u16, usize)> = Vec::new();
        for (slot, &owner) in (0..SLOT_COUNT).zip(self.owners.iter()) {
            match ranges.last_mut() {
                Some((_, end, last)) if *last == owner => *end = slot,
                _ => ranges.push((slot, slot, owner)),
            }
        }
        ranges
    }

    fn apply(&mut self, name: &str, args: &[Bytes]) -> Reply {
        match name {
            "GET" => self
                .data
                .get(&args[1])
                .map_or(Reply::Nil, |v| Reply::Bulk(v.clone())),
            "SET" => {
                self.data.insert(args[1].clone(), args[2].clone());
                status("OK")
            }
            "DEL" => Reply::Integer(
                args[1..]
                    .iter()
                    .filter(|k| self.data.remove(*k).is_some())
                    .count() as i64,
            ),
            "EXISTS" => Reply::Integer(
                args[1..]
                    .iter()
                    .filter(|k| self.data.contains_key(*k))
                    .count() as i64,
            ),
            "MGET" => Reply::Array(
                args[1..]
                    .iter()
                    .map(|k| self.data.get(k).map_or(Reply::Nil, |v| Reply::Bulk(v.clone())))
                    .collect(),
            ),
            "MSET" => {
                for pair in args[1..].chunks(2) {
                    self.data.insert(pair[0].clone(), pair[1].clone());
                }
                status("OK")
            }
            "INCR" => {
                let current = match self.data.get(&args[1]) {
                    None => Some(0),
                    Some(v) => std::str::from_utf8(v).ok().and_then(|s| s.parse::<i64>().ok()),
                };
                match current.and_then(|n| n.checked_add(1)) {
                    Some(next) => {
                        self.data
                            .insert(args[1].clone(), Bytes::from(next.to_string()));
                        Reply::Integer(next)
                    }
                    None => error("ERR value is not an integer or out of range"),
                }
            }
            _ => error(&format!("ERR unknown command '{name}'")),
        }
    }
}

/// Keys of a supported command, or the error reply for a bad request.
fn keys_of(name: &str, args: &[Bytes]) -> Result<Vec<Bytes>, Reply> {
    let arity = || error(&format!("ERR wrong number of arguments for '{}' command", name.to_ascii_lowercase()));
    match name {
        "GET" | "INCR" if args.len() == 2 => Ok(vec![args[1].clone()]),
        "SET" if args.len() >= 3 => Ok(vec![args[1].clone()]),
        "DEL" | "EXISTS" | "MGET" if args.len() >= 2 => Ok(args[1..].to_vec()),
        "MSET" if args.len() >= 3 && args.len() % 2 == 1 => {
            Ok(args[1..].iter().step_by(2).cloned().collect())
        }
        "GET" | "INCR" | "SET" | "DEL" | "EXISTS" | "MGET" | "MSET" => Err(arity()),
        _ => Err(error(&format!("ERR unknown command '{name}'"))),
    }
}

fn node_id(node: usize) -> String {
    format!("{:040x}", node + 1)
}

fn parse_line(line: &str) -> Reply {
    if let Some(rest) = line.strip_prefix('-') {
        error(rest)
    } else if let Some(rest) = line.strip_prefix('+') {
        status(rest)
    } else if let Some(n) = line.strip_prefix(':').and_then(|n| n.parse().ok()) {
        Reply::Integer(n)
    } else {
        bulk(line)
    }
}

fn error(message: &str) -> Reply {
    Reply::Error(Bytes::copy_from_slice(message.as_bytes()))
}

fn status(message: &str) -> Reply {
    Reply::Status(Bytes::copy_from_slice(message.as_bytes()))
}

fn bulk(value: &str) -> Reply {
    Reply::Bulk(Bytes::copy_from_slice(value.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_split_matches_redis_cli() {
        let state = State::new(vec![7000, 7001, 7002], 3, None);
        assert_eq!(
            state.ranges(),
            vec![(0, 5460, 0), (5461, 10922, 1), (10923, 16383, 2)]
        );
    }

    #[test]
    fn test_wrong_node_answers_moved() {
        let mut state = State::new(vec![7000, 7001, 7002], 3, None);
        let mut session = Session::default();
        let request = Reply::Array(vec![bulk("GET"), bulk("foo")]);
        // "foo" hashes to slot 12182, owned by node 2
        let reply = state.execute(0, &mut session, request);
        assert_eq!(reply, error("MOVED 12182 127.0.0.1:7002"));
    }

    #[test]
    fn test_password_required() {
        let mut state = State::new(vec![7000], 1, Some("secretword".into()));
        let mut session = Session::default();
        let ping = || Reply::Array(vec![bulk("PING")]);
        assert_eq!(
            state.execute(0, &mut session, ping()),
            error("NOAUTH Authentication required.")
        );
        let auth = Reply::Array(vec![bulk("AUTH"), bulk("secretword")]);
        assert!(state.execute(0, &mut session, auth).is_ok());
        assert_eq!(state.execute(0, &mut session, ping()), status("PONG"));
    }
}
