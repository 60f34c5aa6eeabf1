//! # Shardis
//!
//! Redis Cluster client that routes each command to the master owning its
//! keys, follows `MOVED` and `ASK` redirects and keeps its slot map current.
//!
//! Two front ends share the same routing core:
//!
//! - [`ClusterContext`] - blocking, with pipelining through
//!   `append_command` / `get_reply`
//! - [`AsyncClusterContext`] - callback driven, registered with an
//!   externally owned event loop (unix only)
//!
//! Every allocation goes through an [`alloc::AllocGuard`], so an allocation
//! refusal surfaces as [`Error::OutOfMemory`] and leaves the context usable.
//!
//! ## Features
//!
//! - `serde` - Serialize options and topology snapshots
//! - `test-utils` - In-process mock cluster under [`testing`]
//!
//! ## Example
//!
//! ```no_run
//! use shardis::ClusterContext;
//!
//! # fn main() -> shardis::Result<()> {
//! let mut cc = ClusterContext::new();
//! cc.add_nodes("127.0.0.1:7000,127.0.0.1:7001,127.0.0.1:7002")?;
//! cc.connect()?;
//! cc.command(&["SET", "key1", "Hello"])?;
//! let reply = cc.command(&["GET", "key1"])?;
//! assert_eq!(reply.as_str(), Some("Hello"));
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod alloc;
pub mod cluster;
pub(crate) mod core;
pub mod proto;

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        pub mod aio;
        pub use crate::aio::AsyncClusterContext;
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use crate::cluster::{key_slot, resolve_slot, ClusterContext, ClusterEvent, NodeAddr};
pub use crate::core::command as cmd;
pub use crate::core::{ClusterBuilder, ClusterOptions, Cmd, ConnectionState};
pub use crate::proto::{Error, ErrorKind, Reply, Result};
