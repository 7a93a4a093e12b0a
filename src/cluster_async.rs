//! The async cluster connection: slot-table bootstrap, per-node connection
//! pool, and MOVED/ASK/TRYAGAIN recovery.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{self, Poll};
use std::time::{Duration, Instant};

use futures_util::future::{join_all, select_ok};
use futures_util::stream::{select_all, SelectAll, Stream};
use futures_util::FutureExt;
use rand::{thread_rng, Rng};
use tokio::net::TcpStream;

use crate::aio::{
    AsyncConnectionConfig, ConnectionLike, MultiplexedConnection, PubSub, Subscription,
};
use crate::cluster_client::ClusterParams;
use crate::cluster_routing::{key_for_slot, unroutable_error, RoutingInfo};
use crate::cluster_topology::{parse_slots, SlotMap};
use crate::cmd::{cmd, Cmd};
use crate::connection::{ConnectionAddr, ConnectionInfo, IntoConnectionInfo, RedisConnectionInfo};
use crate::pipeline::Pipeline;
use crate::types::{
    ErrorKind, Msg, RedisError, RedisFuture, RedisResult, ToRedisArgs, Value,
};

/// Base delay for `TRYAGAIN` retries; doubles per attempt.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(10);

/// Opens one node connection.  Abstracted so tests can substitute in-memory
/// connections for real sockets.
pub trait Connect: Sized {
    /// Connect to a node, ready to accept commands.
    fn connect<'a, T>(
        info: T,
        response_timeout: Option<Duration>,
        pipeline_depth: usize,
    ) -> RedisFuture<'a, Self>
    where
        T: IntoConnectionInfo + Send + 'a;
}

impl Connect for MultiplexedConnection {
    fn connect<'a, T>(
        info: T,
        response_timeout: Option<Duration>,
        pipeline_depth: usize,
    ) -> RedisFuture<'a, Self>
    where
        T: IntoConnectionInfo + Send + 'a,
    {
        (async move {
            let info = info.into_connection_info()?;
            let ConnectionAddr::Tcp(host, port) = &info.addr;
            let stream = TcpStream::connect((host.as_str(), *port)).await?;
            let mut config = AsyncConnectionConfig::new().set_pipeline_depth(pipeline_depth)?;
            if let Some(timeout) = response_timeout {
                config = config.set_response_timeout(timeout);
            }
            let (connection, driver) =
                MultiplexedConnection::new_with_config(&info, stream, config).await?;
            tokio::spawn(driver);
            Ok(connection)
        })
        .boxed()
    }
}

/// A connection to a redis cluster.
///
/// Commands are routed by their key's hash slot to the owning primary, with
/// per-node connections opened lazily and memoized.  `MOVED` redirects
/// update the slot table and are retried once; `ASK` redirects are followed
/// for a single request; `TRYAGAIN` is retried with backoff.  The slot
/// table is refreshed from `CLUSTER SLOTS` when it has gone stale.
///
/// Transactions are broadcast to every primary and their reply arrays are
/// concatenated in node order; see the crate documentation for the
/// consequences.
pub struct ClusterConnection<C = MultiplexedConnection> {
    connections: HashMap<Arc<str>, C>,
    slot_map: SlotMap,
    params: ClusterParams,
    last_slot_refresh: Option<Instant>,
}

impl<C> ClusterConnection<C>
where
    C: Connect + ConnectionLike + Clone + Send + Sync + 'static,
{
    pub(crate) async fn new(
        initial_nodes: &[ConnectionInfo],
        params: ClusterParams,
    ) -> RedisResult<Self> {
        let mut connection = ClusterConnection {
            connections: HashMap::new(),
            slot_map: SlotMap::default(),
            params,
            last_slot_refresh: None,
        };

        let mut last_error = None;
        for seed in initial_nodes {
            let info = connection.merge_params(seed.clone());
            let mut seed_connection = match C::connect(
                info,
                connection.params.response_timeout,
                connection.params.pipeline_depth,
            )
            .await
            {
                Ok(seed_connection) => seed_connection,
                Err(err) => {
                    last_error = Some(err);
                    continue;
                }
            };

            match Self::fetch_slot_map(&mut seed_connection).await {
                Ok(slot_map) => {
                    connection.slot_map = slot_map;
                    connection.last_slot_refresh = Some(Instant::now());
                    // The seed connection served its purpose; nodes are
                    // connected lazily from here on.
                    return Ok(connection);
                }
                Err(err) => last_error = Some(err),
            }
        }

        Err(last_error.unwrap_or_else(|| {
            RedisError::from((
                ErrorKind::InvalidClientConfig,
                "No initial node could be reached",
            ))
        }))
    }

    async fn fetch_slot_map(connection: &mut C) -> RedisResult<SlotMap> {
        let value: Value = cmd("CLUSTER")
            .arg("SLOTS")
            .query_async(connection)
            .await?;
        SlotMap::from_slots(parse_slots(&value)?)
    }

    // Seed connection infos may carry their own credentials; explicit
    // cluster parameters win over them.
    fn merge_params(&self, mut info: ConnectionInfo) -> ConnectionInfo {
        if self.params.username.is_some() {
            info.redis.username = self.params.username.clone();
        }
        if self.params.password.is_some() {
            info.redis.password = self.params.password.clone();
        }
        if self.params.client_name.is_some() {
            info.redis.client_name = self.params.client_name.clone();
        }
        info.redis.protocol = self.params.protocol;
        info.redis.db = 0;
        info
    }

    fn connection_info_for(&self, addr: &str) -> RedisResult<ConnectionInfo> {
        let Some((host, port)) = addr.rsplit_once(':') else {
            fail!((
                ErrorKind::ResponseError,
                "Invalid node address",
                addr.to_string()
            ));
        };
        let port = port.parse::<u16>().map_err(|_| -> RedisError {
            (
                ErrorKind::ResponseError,
                "Invalid node port",
                addr.to_string(),
            )
                .into()
        })?;
        Ok(ConnectionInfo {
            addr: ConnectionAddr::Tcp(host.to_string(), port),
            redis: RedisConnectionInfo {
                db: 0,
                username: self.params.username.clone(),
                password: self.params.password.clone(),
                protocol: self.params.protocol,
                client_name: self.params.client_name.clone(),
            },
        })
    }

    async fn get_or_connect(&mut self, addr: &Arc<str>) -> RedisResult<C> {
        if let Some(connection) = self.connections.get(addr) {
            return Ok(connection.clone());
        }
        let info = self.connection_info_for(addr)?;
        let connection = C::connect(
            info,
            self.params.response_timeout,
            self.params.pipeline_depth,
        )
        .await?;
        self.connections
            .insert(Arc::clone(addr), connection.clone());
        Ok(connection)
    }

    async fn maybe_refresh_slots(&mut self) {
        let stale = match self.last_slot_refresh {
            Some(at) => at.elapsed() >= self.params.refresh_interval,
            None => true,
        };
        if !stale {
            return;
        }
        if let Err(err) = self.refresh_slots().await {
            // Keep routing on the stale table rather than failing the
            // request that happened to trigger the refresh.
            log::warn!("cluster slot refresh failed: {err}");
        }
    }

    /// Queries `CLUSTER SLOTS` on every reachable node concurrently and
    /// adopts the first successful reply.
    async fn refresh_slots(&mut self) -> RedisResult<()> {
        let addrs = self.slot_map.all_addresses();
        let mut queries = Vec::new();
        for addr in &addrs {
            if let Ok(connection) = self.get_or_connect(addr).await {
                let mut connection = connection;
                queries.push(
                    (async move {
                        cmd("CLUSTER")
                            .arg("SLOTS")
                            .query_async::<Value>(&mut connection)
                            .await
                    })
                    .boxed(),
                );
            }
        }
        if queries.is_empty() {
            fail!((
                ErrorKind::ClusterConnectionNotFound,
                "No node reachable for a slot refresh"
            ));
        }

        let (value, _) = select_ok(queries).await?;
        self.slot_map = SlotMap::from_slots(parse_slots(&value)?)?;
        self.last_slot_refresh = Some(Instant::now());
        Ok(())
    }

    fn known_addr(&self, addr: &str) -> bool {
        self.slot_map
            .all_addresses()
            .iter()
            .any(|known| &**known == addr)
    }

    fn random_primary(&mut self) -> RedisResult<Arc<str>> {
        let primaries = self.slot_map.primary_addresses();
        if primaries.is_empty() {
            fail!((
                ErrorKind::ClusterConnectionNotFound,
                "No node is known for the requested route"
            ));
        }
        let idx = thread_rng().gen_range(0..primaries.len());
        Ok(Arc::clone(&primaries[idx]))
    }

    fn addr_for_slot(&mut self, slot: u16) -> RedisResult<Arc<str>> {
        self.slot_map.node_for_slot(slot).ok_or_else(|| {
            RedisError::from((
                ErrorKind::ClusterConnectionNotFound,
                "No node covers the requested hash slot",
            ))
        })
    }

    /// Routes a command by its key and dispatches it, following redirects.
    pub async fn send_packed_command(&mut self, command: &Cmd) -> RedisResult<Value> {
        self.maybe_refresh_slots().await;

        let routing = RoutingInfo::for_cmd(command).ok_or_else(unroutable_error)?;
        let addr = match routing.route() {
            Some(slot) => self.addr_for_slot(slot)?,
            // Keyless commands reaching this path go to one node; the
            // dedicated fan-out operations have their own entry points.
            None => self.random_primary()?,
        };

        let slot = match routing {
            RoutingInfo::MasterSlot(slot) => Some(slot),
            _ => None,
        };

        let mut connection = self.get_or_connect(&addr).await?;
        let mut moved_already = false;
        let mut tries = 0u32;

        loop {
            let result = connection.req_packed_command(command).await;
            let err = match &result {
                Ok(Value::ServerError(server_err)) => {
                    let err: RedisError = server_err.clone().into();
                    if err.is_cluster_error() {
                        err
                    } else {
                        return result;
                    }
                }
                Ok(_) => return result,
                Err(err) if err.is_unrecoverable_error() => {
                    // The node connection is unusable; forget it so the next
                    // dispatch reconnects.
                    self.connections.remove(&addr);
                    return result;
                }
                Err(_) => return result,
            };

            match err.kind() {
                ErrorKind::Moved => {
                    if moved_already {
                        // Two MOVED answers for one request mean the
                        // topology is in flux beyond a single-step fix.
                        return Err(err);
                    }
                    moved_already = true;

                    let Some((host, port)) = err.redirect_node() else {
                        return Err(err);
                    };
                    let target: Arc<str> = format!("{host}:{port}").into();
                    if !self.known_addr(&target) {
                        if let Err(refresh_err) = self.refresh_slots().await {
                            log::warn!(
                                "slot refresh after MOVED to unknown node failed: {refresh_err}"
                            );
                        }
                    }
                    if let Some(slot) = slot {
                        self.slot_map.set_slot(slot, Arc::clone(&target));
                    }
                    connection = self.get_or_connect(&target).await?;
                }
                ErrorKind::Ask => {
                    let Some((host, port)) = err.redirect_node() else {
                        return Err(err);
                    };
                    let target: Arc<str> = format!("{host}:{port}").into();
                    // One-shot: ASKING plus the command on the target, with
                    // the slot table left untouched.
                    let mut target_connection = self.get_or_connect(&target).await?;
                    let mut asking = Pipeline::new();
                    asking.cmd("ASKING");
                    asking.add_command(command.clone());
                    let mut values = target_connection
                        .req_packed_commands(&asking, 1, 1)
                        .await?;
                    return values.pop().ok_or_else(|| {
                        RedisError::from((
                            ErrorKind::ResponseError,
                            "Missing reply for an ASK redirect",
                        ))
                    });
                }
                ErrorKind::TryAgain => {
                    tries += 1;
                    if tries > self.params.retries {
                        return Err(err);
                    }
                    tokio::time::sleep(RETRY_BASE_DELAY * 2u32.saturating_pow(tries - 1)).await;
                }
                _ => return Err(err),
            }
        }
    }

    /// Dispatches a pipeline.  Transactions are broadcast to every primary
    /// in parallel and their reply arrays concatenated in node order;
    /// regular pipelines are routed by their first routable command.
    pub async fn send_packed_pipeline(
        &mut self,
        pipeline: &Pipeline,
        offset: usize,
        count: usize,
    ) -> RedisResult<Vec<Value>> {
        self.maybe_refresh_slots().await;

        if pipeline.is_transaction() {
            return self.broadcast_transaction(pipeline, offset, count).await;
        }

        let slot = pipeline.cmd_iter().find_map(|command| {
            match RoutingInfo::for_cmd(command) {
                Some(RoutingInfo::MasterSlot(slot)) => Some(slot),
                _ => None,
            }
        });
        let addr = match slot {
            Some(slot) => self.addr_for_slot(slot)?,
            None => self.random_primary()?,
        };
        let mut connection = self.get_or_connect(&addr).await?;
        connection.req_packed_commands(pipeline, offset, count).await
    }

    async fn broadcast_transaction(
        &mut self,
        pipeline: &Pipeline,
        offset: usize,
        count: usize,
    ) -> RedisResult<Vec<Value>> {
        let addrs = self.slot_map.primary_addresses();
        if addrs.is_empty() {
            fail!((
                ErrorKind::ClusterConnectionNotFound,
                "No primary is known for the transaction"
            ));
        }

        let mut connections = Vec::with_capacity(addrs.len());
        for addr in &addrs {
            connections.push(self.get_or_connect(addr).await?);
        }

        let results = join_all(connections.into_iter().map(|mut connection| async move {
            connection.req_packed_commands(pipeline, offset, count).await
        }))
        .await;

        // Success requires every node's EXEC to succeed; on any failure the
        // collected successes are discarded so callers never observe a
        // partial commit.
        let mut combined = Vec::new();
        for result in results {
            let mut values = result?;
            let Some(value) = values.pop() else {
                fail!((
                    ErrorKind::ResponseError,
                    "Missing transaction reply from a node"
                ));
            };
            match value {
                Value::Nil | Value::NilArray => return Ok(vec![Value::NilArray]),
                Value::Array(items) => combined.extend(items),
                Value::ServerError(err) => return Err(err.into()),
                other => combined.push(other),
            }
        }
        Ok(vec![Value::Array(combined)])
    }

    /// Announces a client name on every primary, best effort: nodes that
    /// reject the command are left as they are.
    pub async fn client_setname(&mut self, name: impl ToRedisArgs) -> RedisResult<()> {
        let name_args = name.to_redis_args();
        let addrs = self.slot_map.primary_addresses();
        let mut connections = Vec::with_capacity(addrs.len());
        for addr in &addrs {
            connections.push(self.get_or_connect(addr).await?);
        }
        join_all(connections.into_iter().map(|mut connection| {
            let name_args = name_args.clone();
            async move {
                let mut command = cmd("CLIENT");
                command.arg("SETNAME");
                for arg in &name_args {
                    command.arg(arg.as_slice());
                }
                let _ = command.query_async::<Value>(&mut connection).await;
            }
        }))
        .await;
        Ok(())
    }

    /// Returns a key that is guaranteed to hash into `slot`, for forcing
    /// key placement via hashtags.
    pub fn key_for_slot(&self, slot: u16) -> &'static [u8] {
        key_for_slot(slot)
    }
}

impl ClusterConnection<MultiplexedConnection> {
    /// Subscribes to `pattern` on every primary and merges the message
    /// streams into one.
    ///
    /// The merged stream ends when every per-node subscription has ended.
    pub async fn watch_keyspace(
        &mut self,
        pattern: impl ToRedisArgs,
    ) -> RedisResult<KeyspaceStream> {
        self.maybe_refresh_slots().await;

        let mut pattern_args = pattern.to_redis_args();
        if pattern_args.len() != 1 {
            fail!((ErrorKind::ClientError, "Expected exactly one pattern"));
        }
        let pattern = pattern_args.pop().unwrap();

        let addrs = self.slot_map.primary_addresses();
        let mut connections = Vec::with_capacity(addrs.len());
        let mut streams = Vec::with_capacity(addrs.len());
        for addr in &addrs {
            let info = self.connection_info_for(addr)?;
            let ConnectionAddr::Tcp(host, port) = &info.addr;
            let socket = TcpStream::connect((host.as_str(), *port)).await?;
            let (mut pubsub, driver) = PubSub::new(&info, socket).await?;
            tokio::spawn(driver);
            streams.push(pubsub.psubscribe(pattern.as_slice()).await?);
            connections.push(pubsub);
        }

        Ok(KeyspaceStream {
            _connections: connections,
            merged: select_all(streams),
        })
    }
}

/// The merged stream of pattern-subscription messages from every primary.
///
/// Holds the underlying pubsub connections; dropping the stream drops the
/// subscriptions with it.
pub struct KeyspaceStream {
    _connections: Vec<PubSub>,
    merged: SelectAll<Subscription>,
}

impl Stream for KeyspaceStream {
    type Item = Msg;

    fn poll_next(self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<Option<Msg>> {
        Pin::new(&mut self.get_mut().merged).poll_next(cx)
    }
}

impl<C> ConnectionLike for ClusterConnection<C>
where
    C: Connect + ConnectionLike + Clone + Send + Sync + 'static,
{
    fn req_packed_command<'a>(&'a mut self, cmd: &'a Cmd) -> RedisFuture<'a, Value> {
        (async move { self.send_packed_command(cmd).await }).boxed()
    }

    fn req_packed_commands<'a>(
        &'a mut self,
        pipeline: &'a Pipeline,
        offset: usize,
        count: usize,
    ) -> RedisFuture<'a, Vec<Value>> {
        (async move { self.send_packed_pipeline(pipeline, offset, count).await }).boxed()
    }

    fn get_db(&self) -> i64 {
        0
    }
}
