use std::time::Duration;

use crate::aio::DEFAULT_PIPELINE_DEPTH;
use crate::cluster_async::{ClusterConnection, Connect};
use crate::connection::{ConnectionInfo, IntoConnectionInfo};
use crate::types::{ErrorKind, ProtocolVersion, RedisResult};

/// Parameters shared by every node connection of a cluster client.
#[derive(Clone, Debug)]
pub(crate) struct ClusterParams {
    pub(crate) username: Option<String>,
    pub(crate) password: Option<String>,
    pub(crate) protocol: ProtocolVersion,
    pub(crate) client_name: Option<String>,
    pub(crate) pipeline_depth: usize,
    pub(crate) response_timeout: Option<Duration>,
    /// How long a slot table stays fresh before a dispatch triggers a
    /// `CLUSTER SLOTS` refresh.
    pub(crate) refresh_interval: Duration,
    /// Bound on `TRYAGAIN` retries per request.
    pub(crate) retries: u32,
}

impl Default for ClusterParams {
    fn default() -> Self {
        ClusterParams {
            username: None,
            password: None,
            protocol: ProtocolVersion::default(),
            client_name: None,
            pipeline_depth: DEFAULT_PIPELINE_DEPTH,
            response_timeout: None,
            refresh_interval: Duration::from_secs(60),
            retries: 3,
        }
    }
}

/// Used to configure and build a [`ClusterClient`].
pub struct ClusterClientBuilder {
    initial_nodes: RedisResult<Vec<ConnectionInfo>>,
    params: ClusterParams,
}

impl ClusterClientBuilder {
    /// Creates a new `ClusterClientBuilder` with the provided initial_nodes.
    ///
    /// This is the same as `ClusterClient::builder(initial_nodes)`.
    pub fn new<T: IntoConnectionInfo>(initial_nodes: impl IntoIterator<Item = T>) -> Self {
        ClusterClientBuilder {
            initial_nodes: initial_nodes
                .into_iter()
                .map(IntoConnectionInfo::into_connection_info)
                .collect(),
            params: ClusterParams::default(),
        }
    }

    /// Sets the password for the new ClusterClient.
    pub fn password(mut self, password: String) -> Self {
        self.params.password = Some(password);
        self
    }

    /// Sets the username for the new ClusterClient.
    pub fn username(mut self, username: String) -> Self {
        self.params.username = Some(username);
        self
    }

    /// Sets the protocol version to negotiate with every node.
    pub fn protocol(mut self, protocol: ProtocolVersion) -> Self {
        self.params.protocol = protocol;
        self
    }

    /// Sets the client name announced to every node.
    pub fn client_name(mut self, client_name: String) -> Self {
        self.params.client_name = Some(client_name);
        self
    }

    /// Sets the per-connection bound on in-flight commands.
    pub fn pipeline_depth(mut self, depth: usize) -> Self {
        self.params.pipeline_depth = depth;
        self
    }

    /// Sets the response timeout applied to every node connection.
    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.params.response_timeout = Some(timeout);
        self
    }

    /// Sets how long the slot table stays fresh between `CLUSTER SLOTS`
    /// refreshes.
    pub fn slot_refresh_interval(mut self, interval: Duration) -> Self {
        self.params.refresh_interval = interval;
        self
    }

    /// Sets the bound on `TRYAGAIN` retries.
    pub fn retries(mut self, retries: u32) -> Self {
        self.params.retries = retries;
        self
    }

    /// Builds a [`ClusterClient`].  Fails if the initial nodes did not
    /// parse, or no node was provided.
    pub fn build(self) -> RedisResult<ClusterClient> {
        let initial_nodes = self.initial_nodes?;
        if initial_nodes.is_empty() {
            fail!((
                ErrorKind::InvalidClientConfig,
                "Initial nodes can't be empty"
            ));
        }
        if self.params.pipeline_depth == 0 {
            fail!((
                ErrorKind::InvalidClientConfig,
                "pipeline depth must be positive"
            ));
        }
        Ok(ClusterClient {
            initial_nodes,
            params: self.params,
        })
    }
}

/// A cluster client: the seed endpoints plus the per-node connection
/// parameters.  Connections are produced with
/// [`ClusterClient::get_async_connection`].
#[derive(Clone)]
pub struct ClusterClient {
    initial_nodes: Vec<ConnectionInfo>,
    params: ClusterParams,
}

impl ClusterClient {
    /// Creates a `ClusterClient` with the default parameters.
    pub fn new<T: IntoConnectionInfo>(
        initial_nodes: impl IntoIterator<Item = T>,
    ) -> RedisResult<ClusterClient> {
        ClusterClientBuilder::new(initial_nodes).build()
    }

    /// Creates a [`ClusterClientBuilder`] with the provided initial_nodes.
    pub fn builder<T: IntoConnectionInfo>(
        initial_nodes: impl IntoIterator<Item = T>,
    ) -> ClusterClientBuilder {
        ClusterClientBuilder::new(initial_nodes)
    }

    /// Bootstraps a cluster connection: queries `CLUSTER SLOTS` through the
    /// first reachable seed and builds the slot table from the reply.
    pub async fn get_async_connection(&self) -> RedisResult<ClusterConnection> {
        ClusterConnection::new(&self.initial_nodes, self.params.clone()).await
    }

    /// Like [`ClusterClient::get_async_connection`], but over a custom
    /// connection type.  Used by tests to substitute in-memory connections.
    pub async fn get_async_generic_connection<C>(&self) -> RedisResult<ClusterConnection<C>>
    where
        C: Connect + crate::aio::ConnectionLike + Clone + Send + Sync + 'static,
    {
        ClusterConnection::new(&self.initial_nodes, self.params.clone()).await
    }
}
