//! Node registry and slot map.
//!
//! The registry owns every known node together with its connection. The
//! slot map refers to nodes by [`NodeKey`] only, so replacing either side
//! never leaves a dangling reference: a key whose node is gone simply stops
//! resolving.
//!
//! Refreshes are split in two phases. [`NodeRegistry::plan`] performs every
//! allocation a new topology needs and may fail; [`NodeRegistry::apply`]
//! commits the plan and cannot fail.

use std::collections::HashMap;
use std::fmt;

use tracing::debug;

use crate::alloc::AllocGuard;
use crate::cluster::addr::NodeAddr;
use crate::cluster::slot::SLOT_COUNT;
use crate::cluster::topology::{ClusterTopology, NodeId};
use crate::core::connection::{Connection, ConnectionState};
use crate::proto::error::Result;

/// Stable handle of a registered node. Keys are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeKey(u32);

impl NodeKey {
    /// Raw key value.
    pub fn get(self) -> u32 {
        self.0
    }
}

/// A cluster primary known to the registry.
pub struct Node {
    key: NodeKey,
    addr: NodeAddr,
    id: Option<NodeId>,
    replicas: Vec<NodeAddr>,
    conn: Connection,
}

impl Node {
    fn new(key: NodeKey, addr: NodeAddr, conn_addr: NodeAddr, alloc: &AllocGuard) -> Self {
        Self {
            key,
            addr,
            id: None,
            replicas: Vec::new(),
            conn: Connection::new(conn_addr, alloc.clone()),
        }
    }

    /// Registry key.
    pub fn key(&self) -> NodeKey {
        self.key
    }

    /// Network address; the node's identity.
    pub fn addr(&self) -> &NodeAddr {
        &self.addr
    }

    /// Node id reported by the last refresh, if any.
    pub fn id(&self) -> Option<&NodeId> {
        self.id.as_ref()
    }

    /// Replica addresses reported by the last refresh.
    pub fn replicas(&self) -> &[NodeAddr] {
        &self.replicas
    }

    /// State of the node's blocking connection.
    pub fn state(&self) -> ConnectionState {
        self.conn.state()
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    pub(crate) fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("key", &self.key)
            .field("addr", &self.addr)
            .field("id", &self.id)
            .field("replicas", &self.replicas)
            .field("state", &self.conn.state())
            .finish()
    }
}

/// Owner of each of the 16384 hash slots.
#[derive(Clone, PartialEq, Eq)]
pub struct SlotMap {
    owners: Box<[Option<NodeKey>]>,
}

impl SlotMap {
    /// A map in which no slot has an owner.
    pub(crate) fn empty(alloc: &AllocGuard) -> Result<Self> {
        let mut owners = alloc.vec(usize::from(SLOT_COUNT))?;
        owners.resize(usize::from(SLOT_COUNT), None);
        Ok(Self {
            owners: owners.into_boxed_slice(),
        })
    }

    /// Owner of `slot`.
    pub fn owner(&self, slot: u16) -> Option<NodeKey> {
        self.owners.get(usize::from(slot)).copied().flatten()
    }

    pub(crate) fn set(&mut self, slot: u16, key: NodeKey) {
        if let Some(entry) = self.owners.get_mut(usize::from(slot)) {
            *entry = Some(key);
        }
    }

    /// Number of slots with an owner.
    pub fn assigned_slots(&self) -> usize {
        self.owners.iter().filter(|o| o.is_some()).count()
    }

    /// Returns true if every slot has an owner.
    pub fn is_fully_covered(&self) -> bool {
        self.owners.iter().all(Option::is_some)
    }

    /// Contiguous runs of slots with the same owner, unowned runs skipped.
    pub fn ranges(&self) -> Ranges<'_> {
        Ranges {
            owners: &self.owners,
            pos: 0,
        }
    }
}

impl fmt::Debug for SlotMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (start, end, key) in self.ranges() {
            map.entry(&format_args!("{start}..={end}"), &key);
        }
        map.finish()
    }
}

/// Iterator returned by [`SlotMap::ranges`].
#[derive(Debug)]
pub struct Ranges<'a> {
    owners: &'a [Option<NodeKey>],
    pos: usize,
}

impl Iterator for Ranges<'_> {
    type Item = (u16, u16, NodeKey);

    fn next(&mut self) -> Option<Self::Item> {
        while self.pos < self.owners.len() {
            let start = self.pos;
            let owner = self.owners[start];
            let mut end = start;
            while end + 1 < self.owners.len() && self.owners[end + 1] == owner {
                end += 1;
            }
            self.pos = end + 1;
            if let Some(key) = owner {
                return Some((start as u16, end as u16, key));
            }
        }
        None
    }
}

/// Every allocation a refresh needs, done ahead of the swap.
pub(crate) struct RefreshPlan {
    slots: SlotMap,
    entries: Vec<PlanEntry>,
    reported: Vec<NodeKey>,
    next_key: u32,
}

struct PlanEntry {
    key: NodeKey,
    id: Option<NodeId>,
    replicas: Vec<NodeAddr>,
    fresh: Option<(NodeAddr, Node)>,
}

/// Nodes built by [`NodeRegistry::stage`].
pub(crate) struct StagedNodes {
    staged: Vec<(NodeAddr, Node)>,
    next_key: u32,
}

/// Known nodes, each owning one blocking connection.
pub(crate) struct NodeRegistry {
    nodes: HashMap<NodeKey, Node>,
    by_addr: HashMap<NodeAddr, NodeKey>,
    next_key: u32,
    alloc: AllocGuard,
}

impl NodeRegistry {
    pub(crate) fn new(alloc: AllocGuard) -> Self {
        Self {
            nodes: HashMap::new(),
            by_addr: HashMap::new(),
            next_key: 0,
            alloc,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub(crate) fn get(&self, key: NodeKey) -> Option<&Node> {
        self.nodes.get(&key)
    }

    pub(crate) fn get_mut(&mut self, key: NodeKey) -> Option<&mut Node> {
        self.nodes.get_mut(&key)
    }

    pub(crate) fn lookup(&self, addr: &NodeAddr) -> Option<NodeKey> {
        self.by_addr.get(addr).copied()
    }

    /// Finds a node without building an address.
    pub(crate) fn find(&self, host: &str, port: u16) -> Option<NodeKey> {
        self.by_addr
            .iter()
            .find(|(addr, _)| addr.matches(host, port))
            .map(|(_, key)| *key)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Returns the key for `host:port`, registering the node if unseen.
    ///
    /// On a refused allocation the registry is left as it was.
    pub(crate) fn insert_or_get(&mut self, host: &str, port: u16) -> Result<NodeKey> {
        if let Some(key) = self.find(host, port) {
            return Ok(key);
        }
        self.alloc.reserve_map(&mut self.nodes, 1)?;
        self.alloc.reserve_map(&mut self.by_addr, 1)?;
        let addr = NodeAddr::try_new(&self.alloc, host, port)?;
        let index_addr = NodeAddr::try_new(&self.alloc, host, port)?;
        let conn_addr = NodeAddr::try_new(&self.alloc, host, port)?;

        let key = NodeKey(self.next_key);
        self.next_key += 1;
        debug!(node = %addr, key = key.0, "node registered");
        self.by_addr.insert(index_addr, key);
        self.nodes
            .insert(key, Node::new(key, addr, conn_addr, &self.alloc));
        Ok(key)
    }

    /// Builds nodes for every address not registered yet, without touching
    /// the registry beyond reserving capacity.
    pub(crate) fn stage(&mut self, addrs: &[NodeAddr]) -> Result<StagedNodes> {
        let mut staged: Vec<(NodeAddr, Node)> = self.alloc.vec(addrs.len())?;
        let mut next_key = self.next_key;
        for addr in addrs {
            let seen = self.lookup(addr).is_some() || staged.iter().any(|(a, _)| a == addr);
            if seen {
                continue;
            }
            let copy = || NodeAddr::try_new(&self.alloc, addr.host(), addr.port());
            let key = NodeKey(next_key);
            next_key += 1;
            let node = Node::new(key, copy()?, copy()?, &self.alloc);
            staged.push((copy()?, node));
        }
        self.alloc.reserve_map(&mut self.nodes, staged.len())?;
        self.alloc.reserve_map(&mut self.by_addr, staged.len())?;
        Ok(StagedNodes { staged, next_key })
    }

    /// Registers staged nodes.
    pub(crate) fn commit(&mut self, staged: StagedNodes) {
        for (index_addr, node) in staged.staged {
            debug!(node = %node.addr, key = node.key.0, "node registered");
            self.by_addr.insert(index_addr, node.key);
            self.nodes.insert(node.key, node);
        }
        self.next_key = staged.next_key;
    }

    /// Builds everything needed to switch to `topology`.
    ///
    /// Existing nodes keep their key and connection. Only capacity is
    /// reserved on the registry itself.
    pub(crate) fn plan(&mut self, topology: &ClusterTopology) -> Result<RefreshPlan> {
        let ranges = &topology.slot_ranges;
        let mut slots = SlotMap::empty(&self.alloc)?;
        let mut entries: Vec<PlanEntry> = self.alloc.vec(ranges.len())?;
        let mut masters: Vec<&NodeAddr> = self.alloc.vec(ranges.len())?;
        let mut next_key = self.next_key;

        for range in ranges {
            let master = &range.master.addr;
            let key = match masters.iter().position(|addr| *addr == master) {
                Some(i) => entries[i].key,
                None => {
                    let id = match &range.master.id {
                        Some(id) => Some(NodeId::new(self.alloc.string(id.as_str())?)),
                        None => None,
                    };
                    let mut replicas = self.alloc.vec(range.replicas.len())?;
                    for replica in &range.replicas {
                        let addr = &replica.addr;
                        replicas.push(NodeAddr::try_new(&self.alloc, addr.host(), addr.port())?);
                    }
                    let (key, fresh) = match self.lookup(master) {
                        Some(key) => (key, None),
                        None => {
                            let key = NodeKey(next_key);
                            next_key += 1;
                            let copy = || NodeAddr::try_new(&self.alloc, master.host(), master.port());
                            let node = Node::new(key, copy()?, copy()?, &self.alloc);
                            (key, Some((copy()?, node)))
                        }
                    };
                    masters.push(master);
                    entries.push(PlanEntry {
                        key,
                        id,
                        replicas,
                        fresh,
                    });
                    key
                }
            };
            for slot in range.start..=range.end {
                slots.set(slot, key);
            }
        }

        let mut reported = self.alloc.vec(entries.len())?;
        reported.extend(entries.iter().map(|e| e.key));
        reported.sort_unstable();

        let fresh = entries.iter().filter(|e| e.fresh.is_some()).count();
        self.alloc.reserve_map(&mut self.nodes, fresh)?;
        self.alloc.reserve_map(&mut self.by_addr, fresh)?;

        Ok(RefreshPlan {
            slots,
            entries,
            reported,
            next_key,
        })
    }

    /// Commits a plan and returns the new slot map. Nodes the topology no
    /// longer reports are dropped, closing their connections.
    pub(crate) fn apply(&mut self, plan: RefreshPlan) -> SlotMap {
        let RefreshPlan {
            slots,
            entries,
            reported,
            next_key,
        } = plan;

        for entry in entries {
            if let Some((index_addr, node)) = entry.fresh {
                debug!(node = %node.addr, key = entry.key.0, "node discovered");
                self.by_addr.insert(index_addr, entry.key);
                self.nodes.insert(entry.key, node);
            }
            if let Some(node) = self.nodes.get_mut(&entry.key) {
                node.id = entry.id;
                node.replicas = entry.replicas;
            }
        }
        self.next_key = next_key;

        let keep = |key: &NodeKey| reported.binary_search(key).is_ok();
        self.nodes.retain(|key, node| {
            let kept = keep(key);
            if !kept {
                debug!(node = %node.addr, "node dropped from topology");
            }
            kept
        });
        self.by_addr.retain(|_, key| keep(key));
        slots
    }

    /// Closes every connection.
    pub(crate) fn disconnect_all(&mut self) {
        for node in self.nodes.values_mut() {
            node.conn.disconnect();
        }
    }
}

impl fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeRegistry")
            .field("nodes", &self.nodes.len())
            .field("next_key", &self.next_key)
            .finish()
    }
}
