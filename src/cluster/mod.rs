//! # Cluster routing
//!
//! Slot hashing, topology discovery, redirect handling and the blocking
//! [`ClusterContext`].
//!
//! ## Features
//!
//! - **Slot-based routing**: commands go to the master owning their keys
//! - **Topology discovery**: `CLUSTER SLOTS` or `CLUSTER NODES`
//! - **Redirect handling**: `MOVED` updates the slot map, `ASK` does not
//! - **Hash tags**: `{...}` pins related keys to one slot
//!
//! ## Example
//!
//! ```no_run
//! use shardis::cluster::ClusterContext;
//!
//! # fn main() -> shardis::Result<()> {
//! let mut cc = ClusterContext::new();
//! cc.add_nodes("127.0.0.1:7000,127.0.0.1:7001")?;
//! cc.connect()?;
//! cc.command(&["SET", "user:{42}:name", "ada"])?;
//! # Ok(())
//! # }
//! ```

pub mod addr;
pub(crate) mod context;
pub(crate) mod redirect;
pub(crate) mod registry;
pub(crate) mod request;
pub(crate) mod router;
pub(crate) mod slot;
pub(crate) mod topology;

pub use addr::NodeAddr;
pub use context::{ClusterContext, ClusterEvent};
pub use redirect::{classify, Signal};
pub use registry::{Node, NodeKey, Ranges, SlotMap};
pub use request::{RequestMachine, RequestState, Step, DEFAULT_MAX_REDIRECTS};
pub use router::{resolve_slot, route, Route};
pub use slot::{key_slot, SLOT_COUNT};
pub use topology::{ClusterTopology, NodeFlags, NodeId, NodeInfo, SlotRange, TopologySource};
