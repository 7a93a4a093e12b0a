//! The static command table and the thin typed command wrappers.
//!
//! Routing, pub/sub gating and client-side caching all key off the command
//! keyword.  The tables below are byte-literal matches over the uppercased
//! keyword (one or two words); every public command helper is a thin wrapper
//! that assembles a [`Cmd`] and hands it to the connection.

use futures_util::FutureExt;

use crate::cmd::{cmd, Cmd};
use crate::connection::RedisConnectionInfo;
use crate::types::{FromRedisValue, RedisFuture, ToRedisArgs};

/// Where a command's routing key lives in its argument list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KeyPosition {
    /// The command addresses no key; in cluster mode it is routed to a
    /// random node.
    None,
    /// The 0-based index of the first key argument.
    Index(usize),
    /// The key follows the literal `STREAMS` token (`XREAD`, `XREADGROUP`).
    Streams,
}

/// The multi-word commands whose keyword spans two arguments
/// (`CLIENT SETNAME`, `XINFO STREAM`, …).
fn is_command_container(first: &[u8]) -> bool {
    matches!(
        first,
        b"CLIENT" | b"CLUSTER" | b"CONFIG" | b"SCRIPT" | b"ACL" | b"MEMORY" | b"OBJECT"
            | b"SLOWLOG" | b"XINFO" | b"COMMAND" | b"LATENCY" | b"FUNCTION"
    )
}

/// Builds the canonical uppercase keyword for a command: the first argument,
/// joined with the second for container commands.
pub(crate) fn command_keyword(first: &[u8], second: Option<&[u8]>) -> Vec<u8> {
    let mut keyword = first.to_ascii_uppercase();
    if is_command_container(&keyword) {
        if let Some(second) = second {
            keyword.push(b' ');
            keyword.extend(second.to_ascii_uppercase());
        }
    }
    keyword
}

/// Returns where the routing key of `keyword` lives.
pub(crate) fn key_position(keyword: &[u8]) -> KeyPosition {
    match keyword {
        b"XREAD" | b"XREADGROUP" => KeyPosition::Streams,

        b"XGROUP" | b"XINFO STREAM" | b"XINFO GROUPS" | b"XINFO CONSUMERS" | b"OBJECT ENCODING"
        | b"OBJECT FREQ" | b"OBJECT IDLETIME" | b"OBJECT REFCOUNT" => KeyPosition::Index(2),

        // A single channel is enough for routing; co-subscribers go through
        // the same node by convention.
        b"PUBLISH" | b"SUBSCRIBE" | b"PSUBSCRIBE" | b"UNSUBSCRIBE" | b"PUNSUBSCRIBE" => {
            KeyPosition::Index(1)
        }

        b"PING" | b"ECHO" | b"AUTH" | b"SELECT" | b"HELLO" | b"QUIT" | b"RESET" | b"MULTI"
        | b"EXEC" | b"DISCARD" | b"WATCH" | b"UNWATCH" | b"DBSIZE" | b"FLUSHALL" | b"FLUSHDB"
        | b"INFO" | b"TIME" | b"LASTSAVE" | b"SAVE" | b"BGSAVE" | b"BGREWRITEAOF" | b"KEYS"
        | b"SCAN" | b"RANDOMKEY" | b"WAIT" | b"SHUTDOWN" | b"SWAPDB" | b"ASKING" => {
            KeyPosition::None
        }

        keyword if is_command_container(keyword.split(|&b| b == b' ').next().unwrap_or(&[])) => {
            KeyPosition::None
        }

        _ => KeyPosition::Index(1),
    }
}

/// The fewest arguments (keyword included) a command can legally carry.
/// Used as a sanity bound before key extraction.
pub(crate) fn minimum_arity(keyword: &[u8]) -> usize {
    match keyword {
        b"GET" | b"TYPE" | b"TTL" | b"PTTL" | b"LLEN" | b"STRLEN" | b"INCR" | b"DECR"
        | b"PERSIST" | b"DUMP" | b"EXISTS" | b"DEL" | b"UNLINK" | b"SCARD" | b"SMEMBERS"
        | b"HGETALL" | b"HKEYS" | b"HVALS" | b"HLEN" | b"ZCARD" | b"SUBSCRIBE"
        | b"PSUBSCRIBE" => 2,
        b"SET" | b"APPEND" | b"GETSET" | b"INCRBY" | b"DECRBY" | b"LPUSH" | b"RPUSH" | b"HGET"
        | b"SISMEMBER" | b"ZSCORE" | b"PUBLISH" | b"EXPIRE" | b"PEXPIRE" | b"SETNX"
        | b"GETRANGE" => 3,
        b"XREAD" | b"XREADGROUP" => 4,
        _ => 1,
    }
}

/// The commands that may be sent while the connection is in subscriber
/// mode under RESP2.
pub(crate) fn is_pubsub_allowed(keyword: &[u8]) -> bool {
    matches!(
        keyword,
        b"SUBSCRIBE" | b"PSUBSCRIBE" | b"UNSUBSCRIBE" | b"PUNSUBSCRIBE" | b"PING" | b"QUIT"
            | b"RESET"
    )
}

/// The conservative allowlist of read invocations whose replies may be
/// served from the client-side cache.  The cache fingerprint is the full
/// command invocation, so only argument shapes that pin the reply down are
/// admitted; unknown commands are never cached.
pub(crate) fn is_cacheable(cmd: &Cmd, keyword: &[u8]) -> bool {
    match keyword {
        b"GET" | b"STRLEN" | b"EXISTS" | b"TYPE" | b"TTL" | b"PTTL" | b"LLEN" | b"HGETALL"
        | b"HKEYS" | b"HVALS" | b"HLEN" | b"SCARD" | b"SMEMBERS" | b"ZCARD" => {
            cmd.arg_count() == 2
        }
        b"HGET" => cmd.arg_count() == 3,
        // Only the whole-list read is cached; arbitrary ranges are not.
        b"LRANGE" => {
            cmd.arg_count() == 4
                && cmd.arg_idx(2) == Some(&b"0"[..])
                && cmd.arg_idx(3) == Some(&b"-1"[..])
        }
        _ => false,
    }
}

/// Builds the `HELLO 3` handshake command for a connection.
pub(crate) fn resp3_hello(connection_info: &RedisConnectionInfo) -> Cmd {
    let mut hello_cmd = cmd("HELLO");
    hello_cmd.arg("3");
    if let Some(password) = &connection_info.password {
        let username: &str = match connection_info.username.as_ref() {
            None => "default",
            Some(username) => username,
        };
        hello_cmd.arg("AUTH").arg(username).arg(password.as_bytes());
    }
    hello_cmd
}

macro_rules! implement_command {
    (
        $(#[$attr:meta])*
        fn $name:ident<$($tyargs:ident : $ty:ident),*>($($argname:ident: $argty:ty),*) {
            $body:expr
        }
    ) => {
        $(#[$attr])*
        fn $name<'a, $($tyargs: $ty + Send + Sync + 'a,)* RV: FromRedisValue>(
            &'a mut self,
            $($argname: $argty,)*
        ) -> RedisFuture<'a, RV> {
            (async move { ($body).query_async(self).await }).boxed()
        }
    };
}

/// A high-level command interface implemented for every async connection.
///
/// Every method is a thin wrapper that packs the keyword and arguments into
/// a [`Cmd`] and dispatches it; the return value is converted through
/// [`FromRedisValue`].  Commands that are not wrapped here can always be
/// issued through [`cmd`] directly.
pub trait AsyncCommands: crate::aio::ConnectionLike + Send + Sized {
    implement_command! {
        /// Get the value of a key.
        fn get<K: ToRedisArgs>(key: K) {
            cmd("GET").arg(key)
        }
    }

    implement_command! {
        /// Set the string value of a key.
        fn set<K: ToRedisArgs, V: ToRedisArgs>(key: K, value: V) {
            cmd("SET").arg(key).arg(value)
        }
    }

    implement_command! {
        /// Delete one or more keys.
        fn del<K: ToRedisArgs>(key: K) {
            cmd("DEL").arg(key)
        }
    }

    implement_command! {
        /// Determine if one or more keys exist.
        fn exists<K: ToRedisArgs>(key: K) {
            cmd("EXISTS").arg(key)
        }
    }

    implement_command! {
        /// Increment the integer value of a key by one.
        fn incr<K: ToRedisArgs>(key: K) {
            cmd("INCR").arg(key)
        }
    }

    implement_command! {
        /// Prepend values to a list.
        fn lpush<K: ToRedisArgs, V: ToRedisArgs>(key: K, value: V) {
            cmd("LPUSH").arg(key).arg(value)
        }
    }

    implement_command! {
        /// Append values to a list.
        fn rpush<K: ToRedisArgs, V: ToRedisArgs>(key: K, value: V) {
            cmd("RPUSH").arg(key).arg(value)
        }
    }

    implement_command! {
        /// Remove and return the last element of a list.
        fn rpop<K: ToRedisArgs>(key: K) {
            cmd("RPOP").arg(key)
        }
    }

    implement_command! {
        /// Get the length of a list.
        fn llen<K: ToRedisArgs>(key: K) {
            cmd("LLEN").arg(key)
        }
    }

    implement_command! {
        /// Get a range of elements from a list.
        fn lrange<K: ToRedisArgs>(key: K, start: isize, stop: isize) {
            cmd("LRANGE").arg(key).arg(start).arg(stop)
        }
    }

    implement_command! {
        /// Get the value of a hash field.
        fn hget<K: ToRedisArgs, F: ToRedisArgs>(key: K, field: F) {
            cmd("HGET").arg(key).arg(field)
        }
    }

    implement_command! {
        /// Set the value of a hash field.
        fn hset<K: ToRedisArgs, F: ToRedisArgs, V: ToRedisArgs>(key: K, field: F, value: V) {
            cmd("HSET").arg(key).arg(field).arg(value)
        }
    }

    implement_command! {
        /// Get all fields and values of a hash.
        fn hgetall<K: ToRedisArgs>(key: K) {
            cmd("HGETALL").arg(key)
        }
    }

    implement_command! {
        /// Post a message to a channel.  Returns the receiver count.
        fn publish<C: ToRedisArgs, M: ToRedisArgs>(channel: C, message: M) {
            cmd("PUBLISH").arg(channel).arg(message)
        }
    }

    implement_command! {
        /// Assign a name to the current connection.
        fn client_setname<N: ToRedisArgs>(name: N) {
            cmd("CLIENT").arg("SETNAME").arg(name)
        }
    }

    /// Ping the server.
    fn ping<'a, RV: FromRedisValue>(&'a mut self) -> RedisFuture<'a, RV> {
        (async move { cmd("PING").query_async(self).await }).boxed()
    }
}

impl<T: crate::aio::ConnectionLike + Send + Sized> AsyncCommands for T {}
