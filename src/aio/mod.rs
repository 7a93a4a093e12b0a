//! Async connection support.
//!
//! The [`MultiplexedConnection`] is the workhorse: a cloneable handle in
//! front of a driver task that owns the socket, pipelines requests and
//! demultiplexes push frames.  [`PubSub`] is a dedicated subscriber
//! connection with per-channel message streams.

use crate::caching::CacheConfig;
use crate::cmd::Cmd;
use crate::connection::{
    check_connection_setup, connection_setup_pipeline, RedisConnectionInfo, SetupOutcome,
};
use crate::types::{ErrorKind, ProtocolVersion, PushInfo, RedisFuture, RedisResult, Value};

mod multiplexed_connection;
pub use multiplexed_connection::MultiplexedConnection;
mod pubsub;
pub use pubsub::{PubSub, PubSubSink, Subscription};

/// The default bound on dispatched-but-unresolved commands per connection.
pub const DEFAULT_PIPELINE_DEPTH: usize = 100;

/// The channel half used to deliver push events (messages, invalidation
/// notices, disconnects) to the application.
pub type PushSender = tokio::sync::mpsc::UnboundedSender<PushInfo>;

/// Optional behavior knobs for a [`MultiplexedConnection`].
pub struct AsyncConnectionConfig {
    /// Bound on the number of in-flight commands; further sends wait for
    /// room.  Defaults to [`DEFAULT_PIPELINE_DEPTH`].
    pub(crate) pipeline_depth: usize,
    /// Time to wait for a response before failing the request.  The core
    /// imposes none by default.
    pub(crate) response_timeout: Option<std::time::Duration>,
    /// Where to deliver out-of-band push events.
    pub(crate) push_sender: Option<PushSender>,
    /// Enables the client-side cache.  Requires RESP3.
    pub(crate) cache: Option<CacheConfig>,
}

impl Default for AsyncConnectionConfig {
    fn default() -> Self {
        Self {
            pipeline_depth: DEFAULT_PIPELINE_DEPTH,
            response_timeout: None,
            push_sender: None,
            cache: None,
        }
    }
}

impl AsyncConnectionConfig {
    /// Creates a config with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the bound on in-flight commands.
    pub fn set_pipeline_depth(mut self, depth: usize) -> RedisResult<Self> {
        if depth == 0 {
            fail!((
                ErrorKind::InvalidClientConfig,
                "pipeline depth must be positive"
            ));
        }
        self.pipeline_depth = depth;
        Ok(self)
    }

    /// Sets the response timeout.
    pub fn set_response_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.response_timeout = Some(timeout);
        self
    }

    /// Sets the sink for push events; this is also where disconnect events
    /// are announced.
    pub fn set_push_sender(mut self, sender: PushSender) -> Self {
        self.push_sender = Some(sender);
        self
    }

    /// Enables client-side caching.  Only valid together with RESP3.
    pub fn set_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = Some(cache);
        self
    }
}

/// An async abstraction over connections.
pub trait ConnectionLike {
    /// Sends an already encoded (packed) command into the TCP socket and
    /// reads the single response from it.
    fn req_packed_command<'a>(&'a mut self, cmd: &'a Cmd) -> RedisFuture<'a, Value>;

    /// Sends multiple already encoded (packed) commands into the TCP socket
    /// and reads the responses, skipping the first `offset` of them.  This
    /// is used to implement pipelining and transactions.
    #[doc(hidden)]
    fn req_packed_commands<'a>(
        &'a mut self,
        pipeline: &'a crate::Pipeline,
        offset: usize,
        count: usize,
    ) -> RedisFuture<'a, Vec<Value>>;

    /// Returns the database this connection is bound to.  Note that this
    /// information might be unreliable because it's initially cached and
    /// also might be incorrect if the connection like object is not
    /// actually connected.
    fn get_db(&self) -> i64;
}

/// Runs the handshake against a fresh connection and reports the protocol
/// version the server actually accepted.
///
/// A server that rejects `HELLO` gets the RESP2 form of the handshake
/// (`AUTH`/`SELECT`/`CLIENT SETNAME` as separate commands); a server that
/// rejects `AUTH user pass` is retried with the bare password.
pub(crate) async fn setup_connection(
    connection_info: &RedisConnectionInfo,
    con: &mut impl ConnectionLike,
    enable_tracking: bool,
) -> RedisResult<ProtocolVersion> {
    let mut request_resp3 = connection_info.protocol == ProtocolVersion::RESP3;
    let mut check_username = true;

    loop {
        let (pipeline, components) =
            connection_setup_pipeline(connection_info, check_username, request_resp3, enable_tracking);
        if pipeline.is_empty() {
            break;
        }
        let results = con
            .req_packed_commands(&pipeline, 0, pipeline.len())
            .await?;
        match check_connection_setup(&results, components)? {
            SetupOutcome::Succeeded => break,
            SetupOutcome::FallBackToResp2 => {
                if enable_tracking {
                    fail!((
                        ErrorKind::InvalidClientConfig,
                        "Client-side caching requires a server that speaks RESP3"
                    ));
                }
                request_resp3 = false;
            }
            SetupOutcome::ShouldRetryWithoutUsername => check_username = false,
        }
    }

    Ok(if request_resp3 {
        ProtocolVersion::RESP3
    } else {
        ProtocolVersion::RESP2
    })
}

macro_rules! check_resp3 {
    ($protocol: expr, $message: expr) => {
        if $protocol == $crate::types::ProtocolVersion::RESP2 {
            fail!((
                $crate::types::ErrorKind::InvalidClientConfig,
                $message
            ));
        }
    };
}

pub(crate) use check_resp3;
