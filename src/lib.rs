//! redmux is an async Rust client library for Redis, built around
//! multiplexed connections: one socket per server, many concurrent callers.
//!
//! The crate is called `redmux` and you can depend on it via cargo:
//!
//! ```ini
//! [dependencies]
//! redmux = "*"
//! ```
//!
//! # Basic Operation
//!
//! redmux exposes two API levels: a low- and a high-level part.
//! The high-level part does not expose all the functionality of redis and
//! might take some liberties in how it speaks the protocol.  The low-level
//! part of the API allows you to express any request on the redis level.
//! You can fluently switch between both API levels at any point.
//!
//! ## Connection Handling
//!
//! For connecting to redis you create a client, then ask it for a
//! connection.  The [`aio::MultiplexedConnection`] is cheap to clone and can
//! be used concurrently from many tasks, so a single connection is usually
//! all an application needs:
//!
//! ```rust,no_run
//! use redmux::AsyncCommands;
//!
//! async fn do_something() -> redmux::RedisResult<()> {
//!     let client = redmux::Client::open("redis://127.0.0.1/")?;
//!     let mut con = client.get_multiplexed_connection().await?;
//!
//!     con.set::<_, _, ()>("my_key", 42).await?;
//!     let val: i32 = con.get("my_key").await?;
//!     assert_eq!(val, 42);
//!     Ok(())
//! }
//! ```
//!
//! Commands are pipelined onto the socket up to a bounded window
//! (`pipeline_depth`, default 100); replies resolve strictly in send order.
//! There is no automatic reconnect: when the connection is lost every
//! pending request fails and the caller connects anew.
//!
//! ## Connection Parameters
//!
//! [`Client::open`] accepts anything implementing [`IntoConnectionInfo`]:
//!
//! * URLs in the `redis://[user][:password@]host[:port][/db]` format, with
//!   `?protocol=resp3` opting into RESP3,
//! * `(host, port)` tuples,
//! * [`ConnectionInfo`] objects.
//!
//! # RESP2 and RESP3
//!
//! RESP2 is spoken by default.  With `protocol=resp3` the connection opens
//! with a `HELLO 3` handshake and the typed RESP3 replies (maps, sets,
//! doubles, booleans, big numbers, verbatim strings) surface as their own
//! [`Value`] variants.  A server that rejects `HELLO` is transparently
//! spoken to in RESP2.  RESP3 also enables server push frames, which carry
//! pubsub messages and cache invalidations out of band.
//!
//! # Pub/Sub
//!
//! A dedicated subscriber connection is available through
//! [`Client::get_async_pubsub`].  Each subscription hands back its own
//! message stream:
//!
//! ```rust,no_run
//! # async fn do_something() -> redmux::RedisResult<()> {
//! let client = redmux::Client::open("redis://127.0.0.1/")?;
//! let mut pubsub = client.get_async_pubsub().await?;
//! let mut sub = pubsub.subscribe("updates").await?;
//! while let Some(msg) = sub.next_message().await {
//!     println!("{}: {:?}", msg.get_channel_name(), msg.get_payload_bytes());
//! }
//! # Ok(()) }
//! ```
//!
//! On a shared [`aio::MultiplexedConnection`] under RESP2, subscribing puts
//! the connection into subscriber mode: only the pubsub family of commands
//! (plus `PING`, `QUIT` and `RESET`) may be sent until everything is
//! unsubscribed, and anything else fails locally.  Under RESP3 the gate is
//! lifted, since push frames keep pubsub traffic distinguishable.
//!
//! # Transactions
//!
//! Transactions run through atomic pipelines: the commands are queued with
//! `MULTI`, committed with `EXEC`, and the reply array is split back into
//! per-command results.
//!
//! ```rust,no_run
//! # async fn do_something(con: &mut redmux::aio::MultiplexedConnection) -> redmux::RedisResult<()> {
//! let (one, two): (i64, i64) = redmux::pipe()
//!     .atomic()
//!     .cmd("INCR").arg("counter")
//!     .cmd("INCR").arg("counter")
//!     .query_async(con).await?;
//! # Ok(()) }
//! ```
//!
//! # Client-side caching
//!
//! On RESP3 connections an optional client-side cache
//! ([`caching::CacheConfig`]) serves a conservative allowlist of read
//! commands locally.  The server's `invalidate` push frames evict entries;
//! concurrent misses for one `(command, key)` fingerprint collapse into a
//! single request.
//!
//! # Cluster
//!
//! [`cluster_client::ClusterClient`] speaks to a redis cluster: keys are
//! routed by CRC16 hash slot to the owning node, `MOVED`/`ASK` redirects
//! are followed, and the slot table is refreshed from `CLUSTER SLOTS` when
//! stale.  Transactions are broadcast to every primary and their results
//! concatenated in node order — colocate keys with hashtags (see
//! [`cluster_routing::key_for_slot`]) when cross-key atomicity matters.

#![deny(non_camel_case_types)]
#![warn(missing_docs)]

mod macros;

pub mod aio;
/// Client-side caching support.
pub mod caching;
/// The cluster client and its builder.
pub mod cluster_client;
/// Key-to-slot routing primitives.
pub mod cluster_routing;

mod client;
mod cluster_async;
mod cluster_topology;
mod cmd;
mod commands;
mod connection;
mod parser;
mod pipeline;
mod types;

pub use crate::aio::AsyncConnectionConfig;
pub use crate::caching::CacheConfig;
pub use crate::client::Client;
pub use crate::cluster_async::{ClusterConnection, Connect, KeyspaceStream};
pub use crate::cluster_client::{ClusterClient, ClusterClientBuilder};
pub use crate::cluster_routing::{get_slot, key_for_slot, SLOT_COUNT};
pub use crate::cmd::{cmd, pack_command, Cmd};
pub use crate::commands::AsyncCommands;
pub use crate::connection::{
    parse_redis_url, ConnectionAddr, ConnectionInfo, IntoConnectionInfo, RedisConnectionInfo,
};
pub use crate::parser::{parse_redis_value, ValueCodec};
pub use crate::pipeline::{pipe, Pipeline};
pub use crate::types::{
    from_redis_value, ErrorKind, FromRedisValue, Msg, ProtocolVersion, PushInfo, PushKind,
    RedisError, RedisFuture, RedisResult, RedisWrite, ServerError, ToRedisArgs, Value,
    VerbatimFormat,
};
