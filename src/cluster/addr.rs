//! Node addresses and seed descriptor parsing.

use std::fmt;
use std::str::FromStr;

use url::Url;

use crate::alloc::AllocGuard;
use crate::proto::error::{Error, Result};

const DEFAULT_PORT: u16 = 6379;

/// Network address of a cluster node: the node's identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NodeAddr {
    host: String,
    port: u16,
}

impl NodeAddr {
    /// Creates an address from a host and port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Creates an address, copying the host through `alloc`.
    pub(crate) fn try_new(alloc: &AllocGuard, host: &str, port: u16) -> Result<Self> {
        Ok(Self {
            host: alloc.string(host)?,
            port,
        })
    }

    /// Host name or IP address, without brackets.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// TCP port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns true if this address names `host` and `port`.
    pub(crate) fn matches(&self, host: &str, port: u16) -> bool {
        self.port == port && self.host == host
    }

    /// Parses a single node descriptor, allocating through `alloc`.
    ///
    /// Accepted forms are `host:port`, `[ipv6]:port` and
    /// `redis://host[:port]`.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidArgument` for malformed descriptors and
    /// `Error::OutOfMemory` if the host cannot be copied.
    pub fn parse_in(alloc: &AllocGuard, descriptor: &str) -> Result<Self> {
        let descriptor = descriptor.trim();
        if descriptor.contains("://") {
            let (host, port) = parse_url(descriptor)?;
            return Self::try_new(alloc, &host, port);
        }
        match split_host_port(descriptor) {
            Some((host, port)) if !host.is_empty() => Self::try_new(alloc, host, port),
            _ => Err(Error::InvalidArgument {
                message: format!("invalid node address {descriptor:?}, expected host:port"),
            }),
        }
    }
}

impl FromStr for NodeAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse_in(&AllocGuard::system(), s)
    }
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Splits `host:port` or `[host]:port`. The host may be empty.
pub(crate) fn split_host_port(s: &str) -> Option<(&str, u16)> {
    let (host, port) = match s.strip_prefix('[') {
        Some(rest) => {
            let (host, rest) = rest.split_once(']')?;
            (host, rest.strip_prefix(':')?)
        }
        None => s.rsplit_once(':')?,
    };
    let port = port.parse::<u16>().ok()?;
    Some((host, port))
}

fn parse_url(descriptor: &str) -> Result<(String, u16)> {
    let url = Url::parse(descriptor).map_err(|e| Error::InvalidArgument {
        message: format!("invalid node URL {descriptor:?}: {e}"),
    })?;
    if url.scheme() != "redis" {
        return Err(Error::InvalidArgument {
            message: format!("unsupported URL scheme {:?}", url.scheme()),
        });
    }
    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| Error::invalid(format!("node URL {descriptor:?} has no host")))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    Ok((host.to_string(), url.port().unwrap_or(DEFAULT_PORT)))
}

/// Parses a comma separated descriptor list.
///
/// Either every entry parses or nothing is returned.
pub(crate) fn parse_descriptor_list(alloc: &AllocGuard, list: &str) -> Result<Vec<NodeAddr>> {
    let entries = || list.split(',').map(str::trim).filter(|s| !s.is_empty());
    let count = entries().count();
    if count == 0 {
        return Err(Error::invalid("no node addresses given"));
    }
    let mut out = alloc.vec(count)?;
    for entry in entries() {
        out.push(NodeAddr::parse_in(alloc, entry)?);
    }
    Ok(out)
}
