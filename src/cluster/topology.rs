//! Cluster topology data structures and parsers.
//!
//! A topology is what a node reports about slot ownership, either through
//! `CLUSTER SLOTS` or `CLUSTER NODES`. Parsing produces a
//! [`ClusterTopology`] that the registry turns into a slot map.

use crate::alloc::AllocGuard;
use crate::cluster::addr::{split_host_port, NodeAddr};
use crate::cluster::slot::SLOT_COUNT;
use crate::proto::error::{Error, Result};
use crate::proto::reply::Reply;

/// Unique identifier for a node in the cluster.
///
/// Node IDs are 40-character hex strings assigned by the server.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeId(String);

impl NodeId {
    /// Creates a new NodeId from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the node ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Flags indicating the role and state of a cluster node.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NodeFlags {
    /// Node is a master
    pub master: bool,
    /// Node is a replica
    pub slave: bool,
    /// Node is the one that answered the query
    pub myself: bool,
    /// Node is in PFAIL state (possibly failing)
    pub pfail: bool,
    /// Node is in FAIL state (confirmed failed)
    pub fail: bool,
    /// Node is still in handshake
    pub handshake: bool,
    /// Node has no known address
    pub noaddr: bool,
}

impl NodeFlags {
    /// Parses node flags from a comma-separated string.
    ///
    /// # Examples
    ///
    /// ```
    /// # use shardis::cluster::NodeFlags;
    /// let flags = NodeFlags::parse("myself,master");
    /// assert!(flags.master);
    /// assert!(flags.myself);
    /// assert!(!flags.slave);
    /// ```
    pub fn parse(flags_str: &str) -> Self {
        let mut flags = Self::default();
        for flag in flags_str.split(',') {
            match flag.trim() {
                "master" => flags.master = true,
                "slave" | "replica" => flags.slave = true,
                "myself" => flags.myself = true,
                "fail?" | "pfail" => flags.pfail = true,
                "fail" => flags.fail = true,
                "handshake" => flags.handshake = true,
                "noaddr" => flags.noaddr = true,
                _ => {}
            }
        }
        flags
    }

    /// Returns true if the node can serve slots it owns.
    pub fn is_serving_master(&self) -> bool {
        self.master && !self.fail && !self.handshake && !self.noaddr
    }
}

/// Information about one node in a topology reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    /// Node ID, when the reply carries one
    pub id: Option<NodeId>,
    /// Network address
    pub addr: NodeAddr,
    /// Role and state flags
    pub flags: NodeFlags,
}

/// A contiguous range of hash slots served by one master.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotRange {
    /// Start of the slot range (inclusive)
    pub start: u16,
    /// End of the slot range (inclusive)
    pub end: u16,
    /// Master node serving this slot range
    pub master: NodeInfo,
    /// Replica nodes for this slot range
    pub replicas: Vec<NodeInfo>,
}

impl SlotRange {
    /// Returns true if the given slot is within this range.
    pub fn contains(&self, slot: u16) -> bool {
        slot >= self.start && slot <= self.end
    }

    /// Returns the number of slots in this range.
    pub fn len(&self) -> usize {
        (self.end - self.start) as usize + 1
    }

    /// Always false; parsed ranges hold at least one slot.
    pub fn is_empty(&self) -> bool {
        false
    }
}

/// Which command a refresh uses to learn the topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TopologySource {
    /// `CLUSTER SLOTS`
    #[default]
    ClusterSlots,
    /// `CLUSTER NODES`
    ClusterNodes,
}

impl TopologySource {
    /// The query sent to a node.
    pub(crate) fn command(self) -> [&'static str; 2] {
        match self {
            TopologySource::ClusterSlots => ["CLUSTER", "SLOTS"],
            TopologySource::ClusterNodes => ["CLUSTER", "NODES"],
        }
    }

    /// Parses the reply to [`command`](Self::command).
    pub(crate) fn parse(
        self,
        reply: &Reply,
        origin: &NodeAddr,
        alloc: &AllocGuard,
    ) -> Result<ClusterTopology> {
        match self {
            TopologySource::ClusterSlots => ClusterTopology::from_cluster_slots(reply, origin, alloc),
            TopologySource::ClusterNodes => ClusterTopology::from_cluster_nodes(reply, origin, alloc),
        }
    }
}

/// Slot ownership as reported by one node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterTopology {
    /// Slot ranges with their master and replica nodes
    pub slot_ranges: Vec<SlotRange>,
}

impl ClusterTopology {
    /// Finds the master node responsible for a given slot.
    pub fn master_for_slot(&self, slot: u16) -> Option<&NodeInfo> {
        self.slot_ranges
            .iter()
            .find(|range| range.contains(slot))
            .map(|range| &range.master)
    }

    /// Number of slots covered by some range.
    pub fn covered_slots(&self) -> usize {
        self.slot_ranges.iter().map(SlotRange::len).sum()
    }

    /// Returns true if no slot has an owner.
    pub fn is_empty(&self) -> bool {
        self.slot_ranges.is_empty()
    }

    /// Parses a `CLUSTER SLOTS` reply.
    ///
    /// # Arguments
    ///
    /// * `reply` - The reply to `CLUSTER SLOTS`
    /// * `origin` - Node that answered; its host replaces empty or `?` hosts
    /// * `alloc` - Allocation guard for the parsed structures
    ///
    /// # Errors
    ///
    /// Returns `Error::Protocol` if the reply is not shaped like a slots
    /// table, and `Error::OutOfMemory` on allocation refusal.
    pub fn from_cluster_slots(reply: &Reply, origin: &NodeAddr, alloc: &AllocGuard) -> Result<Self> {
        let ranges = match reply {
            Reply::Array(items) => items,
            other => {
                return Err(Error::Protocol {
                    message: format!(
                        "CLUSTER SLOTS reply must be an array, got {}",
                        other.kind_name()
                    ),
                })
            }
        };

        let mut slot_ranges = alloc.vec(ranges.len())?;
        for entry in ranges {
            let fields = entry
                .as_array()
                .filter(|f| f.len() >= 3)
                .ok_or_else(|| Error::protocol("CLUSTER SLOTS entry must be an array of 3+ items"))?;

            let start = slot_number(&fields[0])?;
            let end = slot_number(&fields[1])?;
            if start > end {
                return Err(Error::Protocol {
                    message: format!("inverted slot range {start}-{end}"),
                });
            }

            let master = parse_slots_node(&fields[2], origin, alloc)?;
            let mut replicas = alloc.vec(fields.len() - 3)?;
            for field in &fields[3..] {
                replicas.push(parse_slots_node(field, origin, alloc)?);
            }

            slot_ranges.push(SlotRange {
                start,
                end,
                master,
                replicas,
            });
        }

        Ok(Self { slot_ranges })
    }

    /// Parses a `CLUSTER NODES` reply.
    ///
    /// Masters that are failed, in handshake or without an address are
    /// skipped, as are slots in migration markers (`[slot->-id]`).
    ///
    /// # Errors
    ///
    /// Returns `Error::Protocol` for malformed lines and
    /// `Error::OutOfMemory` on allocation refusal.
    pub fn from_cluster_nodes(reply: &Reply, origin: &NodeAddr, alloc: &AllocGuard) -> Result<Self> {
        let text = match reply {
            Reply::Bulk(b) | Reply::Status(b) => std::str::from_utf8(b)
                .map_err(|_| Error::protocol("CLUSTER NODES reply is not valid UTF-8"))?,
            other => {
                return Err(Error::Protocol {
                    message: format!(
                        "CLUSTER NODES reply must be a bulk string, got {}",
                        other.kind_name()
                    ),
                })
            }
        };

        let lines = || text.lines().map(str::trim).filter(|l| !l.is_empty());
        let range_count = lines()
            .map(|l| l.split_whitespace().skip(8).count())
            .sum();
        let mut slot_ranges: Vec<SlotRange> = alloc.vec(range_count)?;

        // masters first, so replicas can find them by id
        for line in lines() {
            let fields = NodesLine::parse(line)?;
            if !fields.flags.is_serving_master() {
                continue;
            }
            for token in fields.slots.clone() {
                let Some((start, end)) = parse_slot_token(token)? else {
                    continue;
                };
                slot_ranges.push(SlotRange {
                    start,
                    end,
                    master: fields.node_info(origin, alloc)?,
                    replicas: Vec::new(),
                });
            }
        }

        for line in lines() {
            let fields = NodesLine::parse(line)?;
            if !fields.flags.slave || fields.flags.fail || fields.flags.noaddr {
                continue;
            }
            let Some(master_id) = fields.master_id else {
                continue;
            };
            for range in slot_ranges.iter_mut() {
                let owned_by = range.master.id.as_ref().map(NodeId::as_str);
                if owned_by == Some(master_id) {
                    let replica = fields.node_info(origin, alloc)?;
                    alloc.reserve(&mut range.replicas, 1)?;
                    range.replicas.push(replica);
                }
            }
        }

        slot_ranges.sort_by_key(|r| r.start);
        Ok(Self { slot_ranges })
    }
}

fn slot_number(reply: &Reply) -> Result<u16> {
    match reply {
        Reply::Integer(n) if (0..i64::from(SLOT_COUNT)).contains(n) => Ok(*n as u16),
        other => Err(Error::Protocol {
            message: format!("invalid slot number in topology reply: {other:?}"),
        }),
    }
}

/// Substitutes the answering node's host for an unknown one.
fn resolve_host<'a>(host: &'a str, origin: &'a NodeAddr) -> &'a str {
    if host.is_empty() || host == "?" {
        origin.host()
    } else {
        host
    }
}

fn parse_slots_node(reply: &Reply, origin: &NodeAddr, alloc: &AllocGuard) -> Result<NodeInfo> {
    let fields = reply
        .as_array()
        .filter(|f| f.len() >= 2)
        .ok_or_else(|| Error::protocol("node entry must be an array of 2+ items"))?;

    let host = match &fields[0] {
        Reply::Bulk(b) | Reply::Status(b) => std::str::from_utf8(b)
            .map_err(|_| Error::protocol("node host is not valid UTF-8"))?,
        Reply::Nil => "",
        _ => return Err(Error::protocol("node host must be a string")),
    };
    let port = match &fields[1] {
        Reply::Integer(n) => u16::try_from(*n)
            .map_err(|_| Error::Protocol {
                message: format!("invalid node port {n}"),
            })?,
        _ => return Err(Error::protocol("node port must be an integer")),
    };
    let id = match fields.get(2) {
        Some(Reply::Bulk(b)) if !b.is_empty() => {
            let id = std::str::from_utf8(b).map_err(|_| Error::protocol("node id is not valid UTF-8"))?;
            Some(NodeId(alloc.string(id)?))
        }
        _ => None,
    };

    Ok(NodeInfo {
        id,
        addr: NodeAddr::try_new(alloc, resolve_host(host, origin), port)?,
        flags: NodeFlags::default(),
    })
}

/// One line of `CLUSTER NODES` output, borrowed from the reply.
struct NodesLine<'a> {
    id: &'a str,
    host: &'a str,
    port: u16,
    flags: NodeFlags,
    master_id: Option<&'a str>,
    slots: std::iter::Skip<std::str::SplitWhitespace<'a>>,
}

impl<'a> NodesLine<'a> {
    fn parse(line: &'a str) -> Result<Self> {
        let mut fields = line.split_whitespace();
        let malformed = || Error::Protocol {
            message: format!("malformed CLUSTER NODES line {line:?}"),
        };
        let id = fields.next().ok_or_else(malformed)?;
        let addr = fields.next().ok_or_else(malformed)?;
        let flags = NodeFlags::parse(fields.next().ok_or_else(malformed)?);
        let master = fields.next().ok_or_else(malformed)?;

        // ip:port@cport[,hostname]
        let addr = addr.split(',').next().unwrap_or(addr);
        let addr = addr.split('@').next().unwrap_or(addr);
        let (host, port) = split_host_port(addr).ok_or_else(malformed)?;

        Ok(Self {
            id,
            host,
            port,
            flags,
            master_id: (master != "-").then_some(master),
            slots: line.split_whitespace().skip(8),
        })
    }

    fn node_info(&self, origin: &NodeAddr, alloc: &AllocGuard) -> Result<NodeInfo> {
        Ok(NodeInfo {
            id: Some(NodeId(alloc.string(self.id)?)),
            addr: NodeAddr::try_new(alloc, resolve_host(self.host, origin), self.port)?,
            flags: self.flags.clone(),
        })
    }
}

/// Parses `0-5460` or `5461`; returns `None` for migration markers.
fn parse_slot_token(token: &str) -> Result<Option<(u16, u16)>> {
    if token.starts_with('[') {
        return Ok(None);
    }
    let invalid = || Error::Protocol {
        message: format!("invalid slot token {token:?}"),
    };
    let parse = |s: &str| {
        s.parse::<u16>()
            .ok()
            .filter(|n| *n < SLOT_COUNT)
            .ok_or_else(invalid)
    };
    let (start, end) = match token.split_once('-') {
        Some((a, b)) => (parse(a)?, parse(b)?),
        None => {
            let n = parse(token)?;
            (n, n)
        }
    };
    if start > end {
        return Err(invalid());
    }
    Ok(Some((start, end)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn bulk(s: &str) -> Reply {
        Reply::Bulk(Bytes::copy_from_slice(s.as_bytes()))
    }

    fn node(host: &str, port: i64, id: &str) -> Reply {
        Reply::Array(vec![bulk(host), Reply::Integer(port), bulk(id)])
    }

    fn origin() -> NodeAddr {
        NodeAddr::new("10.0.0.9", 7000)
    }

    #[test]
    fn test_node_flags_parse() {
        let flags = NodeFlags::parse("myself,master");
        assert!(flags.master && flags.myself);
        assert!(flags.is_serving_master());

        let flags = NodeFlags::parse("master,fail");
        assert!(!flags.is_serving_master());

        let flags = NodeFlags::parse("slave,fail?");
        assert!(flags.slave && flags.pfail);
    }

    #[test]
    fn test_slot_range_len() {
        let range = SlotRange {
            start: 0,
            end: 100,
            master: NodeInfo {
                id: None,
                addr: NodeAddr::new("127.0.0.1", 7000),
                flags: NodeFlags::default(),
            },
            replicas: Vec::new(),
        };
        assert_eq!(range.len(), 101);
        assert!(range.contains(100));
        assert!(!range.contains(101));
    }

    #[test]
    fn test_from_cluster_slots() {
        let reply = Reply::Array(vec![
            Reply::Array(vec![
                Reply::Integer(0),
                Reply::Integer(5460),
                node("127.0.0.1", 7000, "master1"),
                node("127.0.0.1", 7003, "replica1"),
            ]),
            Reply::Array(vec![
                Reply::Integer(5461),
                Reply::Integer(16383),
                node("127.0.0.1", 7001, "master2"),
            ]),
        ]);

        let topology =
            ClusterTopology::from_cluster_slots(&reply, &origin(), &AllocGuard::system()).unwrap();

        assert_eq!(topology.slot_ranges.len(), 2);
        assert_eq!(topology.covered_slots(), 16384);
        assert_eq!(
            topology.master_for_slot(100).unwrap().addr,
            NodeAddr::new("127.0.0.1", 7000)
        );
        assert_eq!(
            topology.slot_ranges[0].replicas[0].addr,
            NodeAddr::new("127.0.0.1", 7003)
        );
        assert_eq!(
            topology.slot_ranges[1].master.id,
            Some(NodeId::new("master2"))
        );
    }

    #[test]
    fn test_from_cluster_slots_unknown_host_uses_origin() {
        let reply = Reply::Array(vec![Reply::Array(vec![
            Reply::Integer(0),
            Reply::Integer(16383),
            node("", 7005, "m"),
        ])]);
        let topology =
            ClusterTopology::from_cluster_slots(&reply, &origin(), &AllocGuard::system()).unwrap();
        assert_eq!(
            topology.slot_ranges[0].master.addr,
            NodeAddr::new("10.0.0.9", 7005)
        );
    }

    #[test]
    fn test_from_cluster_slots_empty() {
        let topology = ClusterTopology::from_cluster_slots(
            &Reply::Array(Vec::new()),
            &origin(),
            &AllocGuard::system(),
        )
        .unwrap();
        assert!(topology.is_empty());
    }

    #[test]
    fn test_from_cluster_slots_rejects_garbage() {
        let alloc = AllocGuard::system();
        let status = Reply::Status(Bytes::from_static(b"OK"));
        assert!(ClusterTopology::from_cluster_slots(&status, &origin(), &alloc).is_err());

        let out_of_range = Reply::Array(vec![Reply::Array(vec![
            Reply::Integer(0),
            Reply::Integer(16384),
            node("127.0.0.1", 7000, "m"),
        ])]);
        assert!(ClusterTopology::from_cluster_slots(&out_of_range, &origin(), &alloc).is_err());
    }

    #[test]
    fn test_from_cluster_nodes() {
        let text = "\
07c37dfeb235213a872192d90877d0cd55635b91 127.0.0.1:30004@31004 slave e7d1eecce10fd6bb5eb35b9f99a514335d9ba9ca 0 1426238317239 4 connected
67ed2db8d677e59ec4a4cefb06858cf2a1a89fa1 127.0.0.1:30002@31002,host2 master - 0 1426238316232 2 connected 5461-10922
292f8b365bb7edb5e285caf0b7e6ddc7265d2f4f 127.0.0.1:30003@31003 master - 0 1426238318243 3 connected 10923-16383
e7d1eecce10fd6bb5eb35b9f99a514335d9ba9ca :30001@31001 myself,master - 0 0 1 connected 0-5459 5460 [5460->-67ed2db8d677e59ec4a4cefb06858cf2a1a89fa1]
";
        let reply = bulk(text);
        let topology =
            ClusterTopology::from_cluster_nodes(&reply, &origin(), &AllocGuard::system()).unwrap();

        assert_eq!(topology.covered_slots(), 16384);
        assert_eq!(topology.slot_ranges[0].start, 0);
        assert_eq!(
            topology.master_for_slot(0).unwrap().addr,
            NodeAddr::new("10.0.0.9", 30001)
        );
        assert_eq!(
            topology.master_for_slot(5460).unwrap().addr,
            NodeAddr::new("10.0.0.9", 30001)
        );
        assert_eq!(
            topology.master_for_slot(6000).unwrap().addr,
            NodeAddr::new("127.0.0.1", 30002)
        );
        assert_eq!(
            topology.slot_ranges[0].replicas[0].addr,
            NodeAddr::new("127.0.0.1", 30004)
        );
    }

    #[test]
    fn test_from_cluster_nodes_skips_failed_master() {
        let text = "\
aaaa 127.0.0.1:30001@31001 master,fail - 0 0 1 connected 0-16383
";
        let topology = ClusterTopology::from_cluster_nodes(
            &bulk(text),
            &origin(),
            &AllocGuard::system(),
        )
        .unwrap();
        assert!(topology.is_empty());
    }

    #[test]
    fn test_parse_slot_token() {
        assert_eq!(parse_slot_token("0-5460").unwrap(), Some((0, 5460)));
        assert_eq!(parse_slot_token("42").unwrap(), Some((42, 42)));
        assert_eq!(parse_slot_token("[42-<-abc]").unwrap(), None);
        assert!(parse_slot_token("10-5").is_err());
        assert!(parse_slot_token("16384").is_err());
    }
}
