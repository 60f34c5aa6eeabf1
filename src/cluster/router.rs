//! Command routing.
//!
//! Finds the keys of a command, hashes them to slots and checks that they all
//! land in the same slot. Commands are looked up in a static table of key
//! positions; commands missing from the table are assumed to carry their key
//! as the first argument.

use crate::cluster::slot::key_slot;
use crate::proto::error::{Error, Result};

/// Where a command has to be sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    /// To the owner of this slot.
    Slot(u16),
    /// To any node; the command has no keys.
    Any,
}

impl Route {
    /// The slot, if the command has keys.
    pub fn slot(self) -> Option<u16> {
        match self {
            Route::Slot(slot) => Some(slot),
            Route::Any => None,
        }
    }
}

/// Positions of the keys in a command's argument list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeySpec {
    /// No keys.
    None,
    /// Keys from `first` to `last` every `step` arguments. A negative `last`
    /// counts from the end.
    Range { first: usize, last: isize, step: usize },
    /// Key count at `count_at`, keys right after it. `dest` adds a
    /// destination key at index 1.
    NumKeys { count_at: usize, dest: bool },
    /// First half of the arguments after the `STREAMS` keyword.
    Streams,
    /// Single key after a subcommand.
    Subcommand { at: usize },
}

impl KeySpec {
    const fn single() -> Self {
        KeySpec::Range {
            first: 1,
            last: 1,
            step: 1,
        }
    }
}

const UNKNOWN: KeySpec = KeySpec::single();
const MAX_NAME_LEN: usize = 24;

/// Sorted by name.
static COMMANDS: &[(&str, KeySpec)] = &[
    ("APPEND", KeySpec::single()),
    ("ASKING", KeySpec::None),
    ("AUTH", KeySpec::None),
    ("BGREWRITEAOF", KeySpec::None),
    ("BGSAVE", KeySpec::None),
    ("BITCOUNT", KeySpec::single()),
    ("BITFIELD", KeySpec::single()),
    ("BITFIELD_RO", KeySpec::single()),
    ("BITPOS", KeySpec::single()),
    ("BLMOVE", KeySpec::Range { first: 1, last: 2, step: 1 }),
    ("BLMPOP", KeySpec::NumKeys { count_at: 2, dest: false }),
    ("BLPOP", KeySpec::Range { first: 1, last: -2, step: 1 }),
    ("BRPOP", KeySpec::Range { first: 1, last: -2, step: 1 }),
    ("BRPOPLPUSH", KeySpec::Range { first: 1, last: 2, step: 1 }),
    ("BZMPOP", KeySpec::NumKeys { count_at: 2, dest: false }),
    ("BZPOPMAX", KeySpec::Range { first: 1, last: -2, step: 1 }),
    ("BZPOPMIN", KeySpec::Range { first: 1, last: -2, step: 1 }),
    ("CLIENT", KeySpec::None),
    ("CLUSTER", KeySpec::None),
    ("COMMAND", KeySpec::None),
    ("CONFIG", KeySpec::None),
    ("COPY", KeySpec::Range { first: 1, last: 2, step: 1 }),
    ("DBSIZE", KeySpec::None),
    ("DECR", KeySpec::single()),
    ("DECRBY", KeySpec::single()),
    ("DEL", KeySpec::Range { first: 1, last: -1, step: 1 }),
    ("DISCARD", KeySpec::None),
    ("DUMP", KeySpec::single()),
    ("ECHO", KeySpec::None),
    ("EVAL", KeySpec::NumKeys { count_at: 2, dest: false }),
    ("EVALSHA", KeySpec::NumKeys { count_at: 2, dest: false }),
    ("EVALSHA_RO", KeySpec::NumKeys { count_at: 2, dest: false }),
    ("EVAL_RO", KeySpec::NumKeys { count_at: 2, dest: false }),
    ("EXEC", KeySpec::None),
    ("EXISTS", KeySpec::Range { first: 1, last: -1, step: 1 }),
    ("EXPIRE", KeySpec::single()),
    ("EXPIREAT", KeySpec::single()),
    ("EXPIRETIME", KeySpec::single()),
    ("FCALL", KeySpec::NumKeys { count_at: 2, dest: false }),
    ("FCALL_RO", KeySpec::NumKeys { count_at: 2, dest: false }),
    ("FLUSHALL", KeySpec::None),
    ("FLUSHDB", KeySpec::None),
    ("FUNCTION", KeySpec::None),
    ("GEOADD", KeySpec::single()),
    ("GEODIST", KeySpec::single()),
    ("GEOHASH", KeySpec::single()),
    ("GEOPOS", KeySpec::single()),
    ("GEORADIUSBYMEMBER_RO", KeySpec::single()),
    ("GEORADIUS_RO", KeySpec::single()),
    ("GEOSEARCH", KeySpec::single()),
    ("GEOSEARCHSTORE", KeySpec::Range { first: 1, last: 2, step: 1 }),
    ("GET", KeySpec::single()),
    ("GETBIT", KeySpec::single()),
    ("GETDEL", KeySpec::single()),
    ("GETEX", KeySpec::single()),
    ("GETRANGE", KeySpec::single()),
    ("GETSET", KeySpec::single()),
    ("HDEL", KeySpec::single()),
    ("HELLO", KeySpec::None),
    ("HEXISTS", KeySpec::single()),
    ("HGET", KeySpec::single()),
    ("HGETALL", KeySpec::single()),
    ("HINCRBY", KeySpec::single()),
    ("HINCRBYFLOAT", KeySpec::single()),
    ("HKEYS", KeySpec::single()),
    ("HLEN", KeySpec::single()),
    ("HMGET", KeySpec::single()),
    ("HMSET", KeySpec::single()),
    ("HRANDFIELD", KeySpec::single()),
    ("HSCAN", KeySpec::single()),
    ("HSET", KeySpec::single()),
    ("HSETNX", KeySpec::single()),
    ("HSTRLEN", KeySpec::single()),
    ("HVALS", KeySpec::single()),
    ("INCR", KeySpec::single()),
    ("INCRBY", KeySpec::single()),
    ("INCRBYFLOAT", KeySpec::single()),
    ("INFO", KeySpec::None),
    ("KEYS", KeySpec::None),
    ("LASTSAVE", KeySpec::None),
    ("LATENCY", KeySpec::None),
    ("LCS", KeySpec::Range { first: 1, last: 2, step: 1 }),
    ("LINDEX", KeySpec::single()),
    ("LINSERT", KeySpec::single()),
    ("LLEN", KeySpec::single()),
    ("LMOVE", KeySpec::Range { first: 1, last: 2, step: 1 }),
    ("LMPOP", KeySpec::NumKeys { count_at: 1, dest: false }),
    ("LPOP", KeySpec::single()),
    ("LPOS", KeySpec::single()),
    ("LPUSH", KeySpec::single()),
    ("LPUSHX", KeySpec::single()),
    ("LRANGE", KeySpec::single()),
    ("LREM", KeySpec::single()),
    ("LSET", KeySpec::single()),
    ("LTRIM", KeySpec::single()),
    ("MEMORY", KeySpec::Subcommand { at: 2 }),
    ("MGET", KeySpec::Range { first: 1, last: -1, step: 1 }),
    ("MSET", KeySpec::Range { first: 1, last: -1, step: 2 }),
    ("MSETNX", KeySpec::Range { first: 1, last: -1, step: 2 }),
    ("MULTI", KeySpec::None),
    ("OBJECT", KeySpec::Subcommand { at: 2 }),
    ("PERSIST", KeySpec::single()),
    ("PEXPIRE", KeySpec::single()),
    ("PEXPIREAT", KeySpec::single()),
    ("PEXPIRETIME", KeySpec::single()),
    ("PFADD", KeySpec::single()),
    ("PFCOUNT", KeySpec::Range { first: 1, last: -1, step: 1 }),
    ("PFMERGE", KeySpec::Range { first: 1, last: -1, step: 1 }),
    ("PING", KeySpec::None),
    ("PSETEX", KeySpec::single()),
    ("PTTL", KeySpec::single()),
    ("PUBLISH", KeySpec::None),
    ("RANDOMKEY", KeySpec::None),
    ("READONLY", KeySpec::None),
    ("READWRITE", KeySpec::None),
    ("RENAME", KeySpec::Range { first: 1, last: 2, step: 1 }),
    ("RENAMENX", KeySpec::Range { first: 1, last: 2, step: 1 }),
    ("RESTORE", KeySpec::single()),
    ("ROLE", KeySpec::None),
    ("RPOP", KeySpec::single()),
    ("RPOPLPUSH", KeySpec::Range { first: 1, last: 2, step: 1 }),
    ("RPUSH", KeySpec::single()),
    ("RPUSHX", KeySpec::single()),
    ("SADD", KeySpec::single()),
    ("SAVE", KeySpec::None),
    ("SCAN", KeySpec::None),
    ("SCARD", KeySpec::single()),
    ("SCRIPT", KeySpec::None),
    ("SDIFF", KeySpec::Range { first: 1, last: -1, step: 1 }),
    ("SDIFFSTORE", KeySpec::Range { first: 1, last: -1, step: 1 }),
    ("SELECT", KeySpec::None),
    ("SET", KeySpec::single()),
    ("SETBIT", KeySpec::single()),
    ("SETEX", KeySpec::single()),
    ("SETNX", KeySpec::single()),
    ("SETRANGE", KeySpec::single()),
    ("SINTER", KeySpec::Range { first: 1, last: -1, step: 1 }),
    ("SINTERCARD", KeySpec::NumKeys { count_at: 1, dest: false }),
    ("SINTERSTORE", KeySpec::Range { first: 1, last: -1, step: 1 }),
    ("SISMEMBER", KeySpec::single()),
    ("SLOWLOG", KeySpec::None),
    ("SMEMBERS", KeySpec::single()),
    ("SMISMEMBER", KeySpec::single()),
    ("SMOVE", KeySpec::Range { first: 1, last: 2, step: 1 }),
    ("SORT", KeySpec::single()),
    ("SORT_RO", KeySpec::single()),
    ("SPOP", KeySpec::single()),
    ("SRANDMEMBER", KeySpec::single()),
    ("SREM", KeySpec::single()),
    ("SSCAN", KeySpec::single()),
    ("STRLEN", KeySpec::single()),
    ("SUBSTR", KeySpec::single()),
    ("SUNION", KeySpec::Range { first: 1, last: -1, step: 1 }),
    ("SUNIONSTORE", KeySpec::Range { first: 1, last: -1, step: 1 }),
    ("TIME", KeySpec::None),
    ("TOUCH", KeySpec::Range { first: 1, last: -1, step: 1 }),
    ("TTL", KeySpec::single()),
    ("TYPE", KeySpec::single()),
    ("UNLINK", KeySpec::Range { first: 1, last: -1, step: 1 }),
    ("UNWATCH", KeySpec::None),
    ("WAIT", KeySpec::None),
    ("WATCH", KeySpec::Range { first: 1, last: -1, step: 1 }),
    ("XACK", KeySpec::single()),
    ("XADD", KeySpec::single()),
    ("XAUTOCLAIM", KeySpec::single()),
    ("XCLAIM", KeySpec::single()),
    ("XDEL", KeySpec::single()),
    ("XGROUP", KeySpec::Subcommand { at: 2 }),
    ("XINFO", KeySpec::Subcommand { at: 2 }),
    ("XLEN", KeySpec::single()),
    ("XPENDING", KeySpec::single()),
    ("XRANGE", KeySpec::single()),
    ("XREAD", KeySpec::Streams),
    ("XREADGROUP", KeySpec::Streams),
    ("XREVRANGE", KeySpec::single()),
    ("XTRIM", KeySpec::single()),
    ("ZADD", KeySpec::single()),
    ("ZCARD", KeySpec::single()),
    ("ZCOUNT", KeySpec::single()),
    ("ZDIFF", KeySpec::NumKeys { count_at: 1, dest: false }),
    ("ZDIFFSTORE", KeySpec::NumKeys { count_at: 2, dest: true }),
    ("ZINCRBY", KeySpec::single()),
    ("ZINTER", KeySpec::NumKeys { count_at: 1, dest: false }),
    ("ZINTERCARD", KeySpec::NumKeys { count_at: 1, dest: false }),
    ("ZINTERSTORE", KeySpec::NumKeys { count_at: 2, dest: true }),
    ("ZLEXCOUNT", KeySpec::single()),
    ("ZMPOP", KeySpec::NumKeys { count_at: 1, dest: false }),
    ("ZMSCORE", KeySpec::single()),
    ("ZPOPMAX", KeySpec::single()),
    ("ZPOPMIN", KeySpec::single()),
    ("ZRANDMEMBER", KeySpec::single()),
    ("ZRANGE", KeySpec::single()),
    ("ZRANGEBYLEX", KeySpec::single()),
    ("ZRANGEBYSCORE", KeySpec::single()),
    ("ZRANGESTORE", KeySpec::Range { first: 1, last: 2, step: 1 }),
    ("ZRANK", KeySpec::single()),
    ("ZREM", KeySpec::single()),
    ("ZREMRANGEBYLEX", KeySpec::single()),
    ("ZREMRANGEBYRANK", KeySpec::single()),
    ("ZREMRANGEBYSCORE", KeySpec::single()),
    ("ZREVRANGE", KeySpec::single()),
    ("ZREVRANGEBYLEX", KeySpec::single()),
    ("ZREVRANGEBYSCORE", KeySpec::single()),
    ("ZREVRANK", KeySpec::single()),
    ("ZSCAN", KeySpec::single()),
    ("ZSCORE", KeySpec::single()),
    ("ZUNION", KeySpec::NumKeys { count_at: 1, dest: false }),
    ("ZUNIONSTORE", KeySpec::NumKeys { count_at: 2, dest: true }),
];

fn lookup(name: &[u8]) -> KeySpec {
    if name.len() > MAX_NAME_LEN {
        return UNKNOWN;
    }
    let mut upper = [0u8; MAX_NAME_LEN];
    for (dst, src) in upper.iter_mut().zip(name) {
        *dst = src.to_ascii_uppercase();
    }
    let name = &upper[..name.len()];
    COMMANDS
        .binary_search_by(|(n, _)| n.as_bytes().cmp(name))
        .map(|i| COMMANDS[i].1)
        .unwrap_or(UNKNOWN)
}

/// Calls `f` with every key of the command, in argument order.
fn for_each_key<A, F>(args: &[A], mut f: F) -> Result<()>
where
    A: AsRef<[u8]>,
    F: FnMut(&[u8]) -> Result<()>,
{
    let Some(name) = args.first() else {
        return Err(Error::invalid("empty command"));
    };
    let argc = args.len();
    match lookup(name.as_ref()) {
        KeySpec::None => Ok(()),
        KeySpec::Range { first, last, step } => {
            let last = if last < 0 {
                argc as isize + last
            } else {
                last.min(argc as isize - 1)
            };
            if last < first as isize {
                return Ok(());
            }
            for i in (first..=last as usize).step_by(step) {
                f(args[i].as_ref())?;
            }
            Ok(())
        }
        KeySpec::NumKeys { count_at, dest } => {
            let Some(raw) = args.get(count_at) else {
                return Ok(());
            };
            let count = std::str::from_utf8(raw.as_ref())
                .ok()
                .and_then(|s| s.parse::<usize>().ok())
                .ok_or_else(|| Error::invalid("number of keys is not a valid integer"))?;
            let first = count_at + 1;
            if count > argc - first {
                return Err(Error::invalid(
                    "number of keys is greater than number of arguments",
                ));
            }
            if dest {
                f(args[1].as_ref())?;
            }
            for arg in &args[first..first + count] {
                f(arg.as_ref())?;
            }
            Ok(())
        }
        KeySpec::Streams => {
            let Some(pos) = args
                .iter()
                .position(|a| a.as_ref().eq_ignore_ascii_case(b"STREAMS"))
            else {
                return Ok(());
            };
            let rest = argc - pos - 1;
            if rest % 2 != 0 {
                return Err(Error::invalid(
                    "unbalanced list of streams and IDs after STREAMS",
                ));
            }
            for arg in &args[pos + 1..pos + 1 + rest / 2] {
                f(arg.as_ref())?;
            }
            Ok(())
        }
        KeySpec::Subcommand { at } => match args.get(at) {
            Some(key) => f(key.as_ref()),
            None => Ok(()),
        },
    }
}

/// Resolves the slot a command must be sent to.
///
/// # Arguments
///
/// * `args` - Command name followed by its arguments
///
/// # Returns
///
/// `Some(slot)` for commands with keys, `None` for keyless commands.
///
/// # Errors
///
/// Returns `Error::CrossSlot` if the keys hash to different slots, and
/// `Error::InvalidArgument` for an empty command or malformed key count.
///
/// # Examples
///
/// ```
/// use shardis::{key_slot, resolve_slot, Error};
///
/// assert_eq!(resolve_slot(&["GET", "foo"]).unwrap(), Some(key_slot("foo")));
/// assert_eq!(resolve_slot(&["PING"]).unwrap(), None);
/// assert!(matches!(
///     resolve_slot(&["MGET", "foo", "bar"]),
///     Err(Error::CrossSlot)
/// ));
/// ```
pub fn resolve_slot<A: AsRef<[u8]>>(args: &[A]) -> Result<Option<u16>> {
    let mut slot = None;
    for_each_key(args, |key| {
        let s = key_slot(key);
        match slot {
            None => slot = Some(s),
            Some(prev) if prev != s => return Err(Error::CrossSlot),
            Some(_) => {}
        }
        Ok(())
    })?;
    Ok(slot)
}

/// Resolves where a command must be sent.
pub fn route<A: AsRef<[u8]>>(args: &[A]) -> Result<Route> {
    Ok(match resolve_slot(args)? {
        Some(slot) => Route::Slot(slot),
        None => Route::Any,
    })
}
