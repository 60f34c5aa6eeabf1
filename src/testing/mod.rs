//! Test support: an in-process fake Redis Cluster.
//!
//! Available to this crate's own tests and, with the `test-utils` feature,
//! to downstream integration tests.

mod mock;

pub use mock::{MockCluster, MockClusterBuilder};
