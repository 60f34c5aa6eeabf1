//! Per-node plumbing shared by the blocking and event-driven contexts.
//!
//! ## Modules
//!
//! - [`connection`] - One blocking connection to one node
//! - [`command`] - Command builders
//! - [`builder`] - Cluster context builder
//! - [`options`] - Settings applied to every connection

/// Cluster context builder.
pub mod builder;
/// Command construction helpers.
pub mod command;
/// Blocking connection to a single node.
pub mod connection;
/// Connection and redirect settings.
pub mod options;

pub use builder::ClusterBuilder;
pub use command::Cmd;
pub use connection::ConnectionState;
pub use options::ClusterOptions;
