//! RESP2 protocol collaborator.
//!
//! Encodes commands, decodes replies incrementally and defines the error
//! type shared by the whole crate. Both codec halves allocate through an
//! [`AllocGuard`](crate::alloc::AllocGuard).
//!
//! ## Modules
//!
//! - [`codec`] - Encoder and decoder for the RESP protocol
//! - [`error`] - Error types
//! - [`reply`] - The decoded [`Reply`] value

pub mod codec;
/// Error types.
pub mod error;
pub mod reply;

pub use error::{Error, ErrorKind, LastError, Result};
pub use reply::Reply;
