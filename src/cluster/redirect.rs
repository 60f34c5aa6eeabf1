//! Classification of cluster error replies.
//!
//! Cluster nodes answer with special errors when a request has to go
//! elsewhere or be tried again:
//! - `MOVED <slot> <host>:<port>` - the slot lives on another node
//! - `ASK <slot> <host>:<port>` - ask another node once, during migration
//! - `TRYAGAIN` - multi-key request during resharding
//! - `CLUSTERDOWN` - the cluster cannot serve the slot right now
//!
//! Authentication errors are singled out too, because they are never
//! retried.

use crate::cluster::addr::{split_host_port, NodeAddr};
use crate::proto::reply::Reply;

/// What an error reply asks the client to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal<'a> {
    /// Slot permanently moved to another node.
    Moved {
        /// Slot number
        slot: u16,
        /// New owner; an empty host means "same host as the sender"
        host: &'a str,
        /// New owner's port
        port: u16,
    },
    /// Ask another node, once.
    Ask {
        /// Slot number
        slot: u16,
        /// Node to ask; an empty host means "same host as the sender"
        host: &'a str,
        /// Port of the node to ask
        port: u16,
    },
    /// Try the same request again.
    TryAgain,
    /// Cluster reported itself down.
    ClusterDown,
    /// Missing, wrong or insufficient credentials.
    Auth,
}

impl<'a> Signal<'a> {
    /// Resolves the target address of a redirect, substituting the
    /// sender's host when the reply leaves it out.
    pub(crate) fn target(&self, sender: &'a NodeAddr) -> Option<(&'a str, u16)> {
        match *self {
            Signal::Moved { host, port, .. } | Signal::Ask { host, port, .. } => {
                let host = if host.is_empty() { sender.host() } else { host };
                Some((host, port))
            }
            _ => None,
        }
    }
}

/// Classifies an error reply.
///
/// # Returns
///
/// `None` for replies that are not errors and for ordinary errors that are
/// handed to the caller as is.
///
/// # Examples
///
/// ```
/// use bytes::Bytes;
/// use shardis::cluster::{classify, Signal};
/// use shardis::Reply;
///
/// let reply = Reply::Error(Bytes::from_static(b"MOVED 3999 127.0.0.1:7001"));
/// assert_eq!(
///     classify(&reply),
///     Some(Signal::Moved { slot: 3999, host: "127.0.0.1", port: 7001 })
/// );
/// ```
pub fn classify(reply: &Reply) -> Option<Signal<'_>> {
    let msg = reply.error_message()?.trim();

    if let Some(args) = msg.strip_prefix("MOVED ") {
        let (slot, host, port) = parse_redirect(args)?;
        return Some(Signal::Moved { slot, host, port });
    }
    if let Some(args) = msg.strip_prefix("ASK ") {
        let (slot, host, port) = parse_redirect(args)?;
        return Some(Signal::Ask { slot, host, port });
    }

    let code = msg.split_whitespace().next().unwrap_or_default();
    match code {
        "TRYAGAIN" => Some(Signal::TryAgain),
        "CLUSTERDOWN" => Some(Signal::ClusterDown),
        "NOAUTH" | "WRONGPASS" | "NOPERM" => Some(Signal::Auth),
        _ => None,
    }
}

/// Parses redirect arguments: `<slot> <host>:<port>`.
fn parse_redirect(args: &str) -> Option<(u16, &str, u16)> {
    let mut parts = args.split_whitespace();
    let slot: u16 = parts.next()?.parse().ok()?;
    let (host, port) = split_host_port(parts.next()?)?;
    if parts.next().is_some() {
        return None;
    }
    Some((slot, host, port))
}
