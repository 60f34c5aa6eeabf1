use bytes::Bytes;

/// An owned command: name followed by arguments.
///
/// Contexts accept any `&[impl AsRef<[u8]>]`; `Cmd` is a convenience for
/// building argument lists incrementally.
///
/// # Example
///
/// ```
/// use shardis::Cmd;
/// use shardis::cmd::{get, set};
///
/// let cmd = Cmd::new("SET").arg("key").arg("value");
/// assert_eq!(cmd.args().len(), 3);
///
/// let get_cmd = get("key");
/// let set_cmd = set("key", "new_value");
/// assert_eq!(get_cmd.name(), b"GET");
/// assert_eq!(set_cmd.args()[2], "new_value");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cmd {
    args: Vec<Bytes>,
}

impl Cmd {
    /// Creates a new command with the given name.
    ///
    /// # Arguments
    ///
    /// * `name` - The command name (e.g., "GET", "SET", "DEL")
    #[inline]
    pub fn new(name: impl Into<Bytes>) -> Self {
        Self {
            args: vec![name.into()],
        }
    }

    /// Appends an argument to the command.
    #[inline]
    pub fn arg<T: Into<Bytes>>(mut self, arg: T) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Command name.
    #[inline]
    pub fn name(&self) -> &[u8] {
        &self.args[0]
    }

    /// Name and arguments, in wire order.
    #[inline]
    pub fn args(&self) -> &[Bytes] {
        &self.args
    }
}

impl AsRef<[Bytes]> for Cmd {
    fn as_ref(&self) -> &[Bytes] {
        &self.args
    }
}

/// Creates a PING command.
#[inline]
pub fn ping() -> Cmd {
    Cmd::new("PING")
}

/// Creates a GET command.
#[inline]
pub fn get(key: impl Into<Bytes>) -> Cmd {
    Cmd::new("GET").arg(key)
}

/// Creates a SET command.
#[inline]
pub fn set(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Cmd {
    Cmd::new("SET").arg(key).arg(value)
}

/// Creates a DEL command.
#[inline]
pub fn del<K: Into<Bytes>>(keys: impl IntoIterator<Item = K>) -> Cmd {
    keys.into_iter().fold(Cmd::new("DEL"), Cmd::arg)
}

/// Creates an INCR command.
#[inline]
pub fn incr(key: impl Into<Bytes>) -> Cmd {
    Cmd::new("INCR").arg(key)
}

/// Creates an MGET command.
#[inline]
pub fn mget<K: Into<Bytes>>(keys: impl IntoIterator<Item = K>) -> Cmd {
    keys.into_iter().fold(Cmd::new("MGET"), Cmd::arg)
}

/// Creates an MSET command.
pub fn mset<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Cmd
where
    K: Into<Bytes>,
    V: Into<Bytes>,
{
    pairs
        .into_iter()
        .fold(Cmd::new("MSET"), |cmd, (k, v)| cmd.arg(k).arg(v))
}

/// Creates an AUTH command with password only.
#[inline]
pub fn auth(password: impl Into<Bytes>) -> Cmd {
    Cmd::new("AUTH").arg(password)
}

/// Creates an AUTH command with username and password (ACL style).
#[inline]
pub fn auth_with_username(username: impl Into<Bytes>, password: impl Into<Bytes>) -> Cmd {
    Cmd::new("AUTH").arg(username).arg(password)
}

/// Creates a CLUSTER SLOTS command.
#[inline]
pub fn cluster_slots() -> Cmd {
    Cmd::new("CLUSTER").arg("SLOTS")
}

/// Creates a CLUSTER NODES command.
#[inline]
pub fn cluster_nodes() -> Cmd {
    Cmd::new("CLUSTER").arg("NODES")
}

/// The `ASKING` prefix sent before a request that follows an ASK redirect.
pub(crate) const ASKING: &[u8] = b"*1\r\n$6\r\nASKING\r\n";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::codec::Encoder;

    #[test]
    fn test_cmd_builder() {
        let cmd = Cmd::new("SET").arg("key").arg(Bytes::from_static(b"value"));
        assert_eq!(cmd.name(), b"SET");
        assert_eq!(cmd.args(), &[
            Bytes::from("SET"),
            Bytes::from("key"),
            Bytes::from("value")
        ]);
    }

    #[test]
    fn test_multi_key_helpers() {
        assert_eq!(mget(["a", "b"]).args().len(), 3);
        assert_eq!(del(["a"]).args().len(), 2);
        let cmd = mset([("key1", "v1"), ("key2", "v2")]);
        assert_eq!(cmd.args().len(), 5);
        assert_eq!(cmd.args()[3], "key2");
    }

    #[test]
    fn test_auth_variants() {
        assert_eq!(auth("secretword").args().len(), 2);
        assert_eq!(auth_with_username("default", "secretword").args().len(), 3);
    }

    #[test]
    fn test_asking_prefix_matches_encoder() {
        let mut encoder = Encoder::new();
        encoder.encode_command(&["ASKING"]).unwrap();
        assert_eq!(&encoder.take()[..], ASKING);
    }

    #[test]
    fn test_cluster_queries() {
        assert_eq!(cluster_slots().args()[1], "SLOTS");
        assert_eq!(cluster_nodes().args()[1], "NODES");
    }
}
