//! Cluster routing tests over in-memory mock connections.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use once_cell::sync::Lazy;

use redmux::aio::ConnectionLike;
use redmux::{
    parse_redis_value, AsyncCommands, ClusterClient, Connect, ConnectionAddr, ErrorKind,
    IntoConnectionInfo, RedisFuture, RedisResult, Value,
};

type Handler = Arc<dyn Fn(&[u8], u16) -> RedisResult<Value> + Send + Sync>;

static HANDLERS: Lazy<RwLock<HashMap<String, Handler>>> = Lazy::new(Default::default);

// Registers a handler under a cluster name; dropping the guard removes it.
struct HandlerGuard(String);

impl Drop for HandlerGuard {
    fn drop(&mut self) {
        HANDLERS.write().unwrap().remove(&self.0);
    }
}

fn register_handler(
    name: &str,
    handler: impl Fn(&[u8], u16) -> RedisResult<Value> + Send + Sync + 'static,
) -> HandlerGuard {
    HANDLERS
        .write()
        .unwrap()
        .insert(name.to_string(), Arc::new(handler));
    HandlerGuard(name.to_string())
}

#[derive(Clone)]
struct MockConnection {
    handler: Handler,
    port: u16,
}

impl Connect for MockConnection {
    fn connect<'a, T>(
        info: T,
        _response_timeout: Option<Duration>,
        _pipeline_depth: usize,
    ) -> RedisFuture<'a, Self>
    where
        T: IntoConnectionInfo + Send + 'a,
    {
        Box::pin(async move {
            let info = info.into_connection_info()?;
            let ConnectionAddr::Tcp(name, port) = &info.addr;
            let handler = HANDLERS
                .read()
                .unwrap()
                .get(name)
                .unwrap_or_else(|| panic!("no handler registered for `{name}`"))
                .clone();
            Ok(MockConnection {
                handler,
                port: *port,
            })
        })
    }
}

impl ConnectionLike for MockConnection {
    fn req_packed_command<'a>(&'a mut self, cmd: &'a redmux::Cmd) -> RedisFuture<'a, Value> {
        Box::pin(async move { (self.handler)(&cmd.get_packed_command(), self.port) })
    }

    fn req_packed_commands<'a>(
        &'a mut self,
        pipeline: &'a redmux::Pipeline,
        offset: usize,
        count: usize,
    ) -> RedisFuture<'a, Vec<Value>> {
        Box::pin(async move {
            let reply = (self.handler)(&pipeline.get_packed_pipeline(), self.port)?;
            match reply {
                Value::Array(items) => {
                    Ok(items.into_iter().skip(offset).take(count).collect())
                }
                other => Ok(vec![other]),
            }
        })
    }

    fn get_db(&self) -> i64 {
        0
    }
}

fn contains_slice(haystack: &[u8], needle: &[u8]) -> bool {
    haystack
        .windows(needle.len())
        .any(|window| window == needle)
}

// A full-coverage CLUSTER SLOTS reply for a cluster named `name`.
fn slots_reply(name: &str, ranges: &[(u16, u16, u16)]) -> Value {
    Value::Array(
        ranges
            .iter()
            .map(|(start, end, port)| {
                Value::Array(vec![
                    Value::Int(*start as i64),
                    Value::Int(*end as i64),
                    Value::Array(vec![
                        Value::BulkString(name.as_bytes().to_vec()),
                        Value::Int(*port as i64),
                    ]),
                ])
            })
            .collect(),
    )
}

fn respond_startup(name: &str, cmd: &[u8], ranges: &[(u16, u16, u16)]) -> Option<Value> {
    if contains_slice(cmd, b"PING") || contains_slice(cmd, b"SETNAME") {
        Some(Value::SimpleString("OK".into()))
    } else if contains_slice(cmd, b"CLUSTER") && contains_slice(cmd, b"SLOTS") {
        Some(slots_reply(name, ranges))
    } else {
        None
    }
}

async fn cluster_connection(
    name: &str,
) -> redmux::ClusterConnection<MockConnection> {
    ClusterClient::builder(vec![format!("redis://{name}:6379")])
        .build()
        .unwrap()
        .get_async_generic_connection::<MockConnection>()
        .await
        .unwrap()
}

#[tokio::test]
async fn commands_route_to_the_slot_owner() {
    let name = "route-test";
    let ranges = [(0, 8191, 6379), (8192, 16383, 6380)];
    let _guard = register_handler(name, move |cmd, port| {
        if let Some(reply) = respond_startup(name, cmd, &ranges) {
            return Ok(reply);
        }
        // Every payload command echoes the port that served it.
        Ok(Value::Int(port as i64))
    });

    let mut connection = cluster_connection(name).await;

    // "foo" lives in slot 12182, owned by the second node.
    let served_by: i64 = connection.get("foo").await.unwrap();
    assert_eq!(served_by, 6380);

    // A key in the low range goes to the first node.
    let low_key = redmux::key_for_slot(100).to_vec();
    let served_by: i64 = connection.get(low_key).await.unwrap();
    assert_eq!(served_by, 6379);
}

#[tokio::test]
async fn moved_updates_the_slot_table() {
    let name = "moved-test";
    let ranges = [(0, 16383, 6379)];
    let old_node_hits = Arc::new(AtomicUsize::new(0));
    let hits = Arc::clone(&old_node_hits);
    let _guard = register_handler(name, move |cmd, port| {
        if let Some(reply) = respond_startup(name, cmd, &ranges) {
            return Ok(reply);
        }
        if port == 6379 {
            hits.fetch_add(1, Ordering::SeqCst);
            return parse_redis_value(format!("-MOVED 1234 {name}:6380\r\n").as_bytes());
        }
        Ok(Value::SimpleString("OK".into()))
    });

    let mut connection = cluster_connection(name).await;
    let key = redmux::key_for_slot(1234).to_vec();

    // First dispatch hits the stale owner, follows the redirect, succeeds.
    connection.set::<_, _, ()>(key.clone(), "v").await.unwrap();
    assert_eq!(old_node_hits.load(Ordering::SeqCst), 1);

    // The slot table learned the new owner: no second MOVED.
    connection.set::<_, _, ()>(key, "v2").await.unwrap();
    assert_eq!(old_node_hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn repeated_moved_is_a_hard_failure() {
    let name = "moved-loop-test";
    let ranges = [(0, 16383, 6379)];
    let _guard = register_handler(name, move |cmd, _port| {
        if let Some(reply) = respond_startup(name, cmd, &ranges) {
            return Ok(reply);
        }
        // Every node keeps redirecting; the router must give up after one
        // retry instead of bouncing forever.
        parse_redis_value(format!("-MOVED 1234 {name}:6380\r\n").as_bytes())
    });

    let mut connection = cluster_connection(name).await;
    let key = redmux::key_for_slot(1234).to_vec();
    let err = connection
        .set::<_, _, ()>(key, "v")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Moved);
}

#[tokio::test]
async fn ask_redirect_is_one_shot() {
    let name = "ask-test";
    let ranges = [(0, 16383, 6379)];
    let old_node_hits = Arc::new(AtomicUsize::new(0));
    let hits = Arc::clone(&old_node_hits);
    let _guard = register_handler(name, move |cmd, port| {
        if let Some(reply) = respond_startup(name, cmd, &ranges) {
            return Ok(reply);
        }
        if port == 6379 {
            hits.fetch_add(1, Ordering::SeqCst);
            return parse_redis_value(format!("-ASK 1234 {name}:6380\r\n").as_bytes());
        }
        // The target node sees ASKING followed by the command.
        assert!(contains_slice(cmd, b"ASKING"));
        Ok(Value::Array(vec![
            Value::Okay,
            Value::BulkString(b"askv".to_vec()),
        ]))
    });

    let mut connection = cluster_connection(name).await;
    let key = redmux::key_for_slot(1234).to_vec();

    let value: String = connection.get(key.clone()).await.unwrap();
    assert_eq!(value, "askv");

    // ASK does not touch the slot table: the next request for the slot
    // still goes to the original owner.
    let _ = connection.get::<_, String>(key).await;
    assert_eq!(old_node_hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn tryagain_is_retried_with_backoff() {
    let name = "tryagain-test";
    let ranges = [(0, 16383, 6379)];
    let attempts = Arc::new(AtomicUsize::new(0));
    let attempts_in_handler = Arc::clone(&attempts);
    let _guard = register_handler(name, move |cmd, _port| {
        if let Some(reply) = respond_startup(name, cmd, &ranges) {
            return Ok(reply);
        }
        if attempts_in_handler.fetch_add(1, Ordering::SeqCst) < 2 {
            return parse_redis_value(b"-TRYAGAIN Multiple keys request during rehashing\r\n");
        }
        Ok(Value::SimpleString("OK".into()))
    });

    let mut connection = cluster_connection(name).await;
    connection.set::<_, _, ()>("foo", "v").await.unwrap();
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn transactions_broadcast_to_every_primary() {
    let name = "tx-test";
    let ranges = [(0, 8191, 6379), (8192, 16383, 6380)];
    let _guard = register_handler(name, move |cmd, port| {
        if let Some(reply) = respond_startup(name, cmd, &ranges) {
            return Ok(reply);
        }
        assert!(contains_slice(cmd, b"MULTI") && contains_slice(cmd, b"EXEC"));
        Ok(Value::Array(vec![
            Value::Okay,
            Value::SimpleString("QUEUED".into()),
            Value::Array(vec![Value::Int(port as i64)]),
        ]))
    });

    let mut connection = cluster_connection(name).await;
    let results: Vec<i64> = redmux::pipe()
        .atomic()
        .cmd("INCR")
        .arg("k")
        .query_async(&mut connection)
        .await
        .unwrap();

    // One EXEC slot per primary, concatenated in node order.
    assert_eq!(results, vec![6379, 6380]);
}

#[tokio::test]
async fn aborted_transaction_fails_everywhere() {
    let name = "tx-abort-test";
    let ranges = [(0, 8191, 6379), (8192, 16383, 6380)];
    let _guard = register_handler(name, move |cmd, port| {
        if let Some(reply) = respond_startup(name, cmd, &ranges) {
            return Ok(reply);
        }
        if port == 6380 {
            // This node's EXEC was aborted by a WATCH.
            return Ok(Value::Array(vec![
                Value::Okay,
                Value::SimpleString("QUEUED".into()),
                Value::NilArray,
            ]));
        }
        Ok(Value::Array(vec![
            Value::Okay,
            Value::SimpleString("QUEUED".into()),
            Value::Array(vec![Value::Int(1)]),
        ]))
    });

    let mut connection = cluster_connection(name).await;
    let err = redmux::pipe()
        .atomic()
        .cmd("INCR")
        .arg("k")
        .query_async::<Vec<i64>>(&mut connection)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ExecAbortError);
}

#[tokio::test]
async fn bootstrap_rejects_partial_slot_coverage() {
    let name = "partial-test";
    let _guard = register_handler(name, move |cmd, _port| {
        if contains_slice(cmd, b"CLUSTER") && contains_slice(cmd, b"SLOTS") {
            return Ok(slots_reply(name, &[(0, 100, 6379)]));
        }
        Ok(Value::SimpleString("OK".into()))
    });

    let result = ClusterClient::builder(vec![format!("redis://{name}:6379")])
        .build()
        .unwrap()
        .get_async_generic_connection::<MockConnection>()
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn slot_representatives_can_pin_placement() {
    let name = "placement-test";
    let ranges = [(0, 8191, 6379), (8192, 16383, 6380)];
    let _guard = register_handler(name, move |cmd, port| {
        if let Some(reply) = respond_startup(name, cmd, &ranges) {
            return Ok(reply);
        }
        Ok(Value::Int(port as i64))
    });

    let mut connection = cluster_connection(name).await;
    let representative = connection.key_for_slot(42).to_vec();
    let mut pinned = b"{".to_vec();
    pinned.extend_from_slice(&representative);
    pinned.extend_from_slice(b"}user:123");

    let served_by: i64 = connection.set(pinned, "v").await.unwrap();
    assert_eq!(served_by, 6379);
}
