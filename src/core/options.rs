use std::fmt;
use std::time::Duration;

use crate::cluster::request::DEFAULT_MAX_REDIRECTS;
use crate::cluster::topology::TopologySource;

/// Settings shared by every connection of a cluster context.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use shardis::ClusterOptions;
///
/// let options = ClusterOptions {
///     password: Some("secretword".into()),
///     connect_timeout: Some(Duration::from_secs(1)),
///     ..ClusterOptions::default()
/// };
/// assert_eq!(options.max_redirects, 5);
/// ```
#[derive(Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ClusterOptions {
    /// ACL user sent with `AUTH`; requires a password
    pub username: Option<String>,
    /// Password sent with `AUTH` right after connecting
    pub password: Option<String>,
    /// Deadline for establishing a connection; `None` waits forever
    pub connect_timeout: Option<Duration>,
    /// Deadline for one command round trip; `None` waits forever
    pub command_timeout: Option<Duration>,
    /// Redirects and retries allowed per request
    pub max_redirects: u32,
    /// Query used to learn the slot layout
    pub topology_source: TopologySource,
}

impl ClusterOptions {
    /// Returns true when connections must authenticate.
    pub fn has_credentials(&self) -> bool {
        self.password.is_some()
    }
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            username: None,
            password: None,
            connect_timeout: None,
            command_timeout: None,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            topology_source: TopologySource::default(),
        }
    }
}

impl fmt::Debug for ClusterOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterOptions")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("connect_timeout", &self.connect_timeout)
            .field("command_timeout", &self.command_timeout)
            .field("max_redirects", &self.max_redirects)
            .field("topology_source", &self.topology_source)
            .finish()
    }
}
