use std::time::Duration;

use tokio::net::TcpStream;

use crate::aio::{AsyncConnectionConfig, MultiplexedConnection, PubSub};
use crate::connection::{ConnectionAddr, ConnectionInfo, IntoConnectionInfo};
use crate::types::{RedisError, RedisResult};

/// The client type.  Holds connection information and hands out
/// connections; it performs no I/O by itself.
///
/// ```rust,no_run
/// # async fn do_something() -> redmux::RedisResult<()> {
/// let client = redmux::Client::open("redis://127.0.0.1/")?;
/// let mut con = client.get_multiplexed_connection().await?;
/// # Ok(()) }
/// ```
#[derive(Debug, Clone)]
pub struct Client {
    connection_info: ConnectionInfo,
}

impl Client {
    /// Connects to a redis server and returns a client.  This does not
    /// actually open a connection yet but it does perform some basic
    /// checks on the URL that might make the operation fail.
    pub fn open<T: IntoConnectionInfo>(params: T) -> RedisResult<Client> {
        Ok(Client {
            connection_info: params.into_connection_info()?,
        })
    }

    /// Returns a reference of client connection info object.
    pub fn get_connection_info(&self) -> &ConnectionInfo {
        &self.connection_info
    }

    async fn connect_tcp(&self, timeout: Option<Duration>) -> RedisResult<TcpStream> {
        let ConnectionAddr::Tcp(host, port) = &self.connection_info.addr;
        let connect = TcpStream::connect((host.as_str(), *port));
        let stream = match timeout {
            Some(timeout) => tokio::time::timeout(timeout, connect).await.map_err(|_| {
                RedisError::from(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "Connection timed out",
                ))
            })??,
            None => connect.await?,
        };
        Ok(stream)
    }

    /// Opens a new multiplexed connection and spawns its driver task on
    /// the current tokio runtime.
    pub async fn get_multiplexed_connection(&self) -> RedisResult<MultiplexedConnection> {
        self.get_multiplexed_connection_with_config(AsyncConnectionConfig::new())
            .await
    }

    /// Like [`Client::get_multiplexed_connection`], with explicit
    /// configuration.
    pub async fn get_multiplexed_connection_with_config(
        &self,
        config: AsyncConnectionConfig,
    ) -> RedisResult<MultiplexedConnection> {
        let stream = self.connect_tcp(None).await?;
        let (connection, driver) =
            MultiplexedConnection::new_with_config(&self.connection_info, stream, config).await?;
        tokio::spawn(driver);
        Ok(connection)
    }

    /// Like [`Client::get_multiplexed_connection`], bounding the TCP
    /// connect by `connect_timeout`.
    pub async fn get_multiplexed_connection_with_timeout(
        &self,
        connect_timeout: Duration,
    ) -> RedisResult<MultiplexedConnection> {
        let stream = self.connect_tcp(Some(connect_timeout)).await?;
        let (connection, driver) =
            MultiplexedConnection::new(&self.connection_info, stream).await?;
        tokio::spawn(driver);
        Ok(connection)
    }

    /// Opens a new connection dedicated to pubsub messages and spawns its
    /// driver task on the current tokio runtime.
    pub async fn get_async_pubsub(&self) -> RedisResult<PubSub> {
        let stream = self.connect_tcp(None).await?;
        let (pubsub, driver) = PubSub::new(&self.connection_info, stream).await?;
        tokio::spawn(driver);
        Ok(pubsub)
    }
}
